//! Surfaced error types for the streaming engine.
//!
//! Pipeline-level failures are absorbed inside the engine: stale
//! requests and lost CAS races are discarded silently, loader misses
//! leave the placeholder at its current detail level. Those show up as
//! statistics counters and log lines, never as errors. Only lifecycle
//! misuse and thread-spawn failures surface to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("streaming engine is already running")]
    AlreadyRunning,

    #[error("failed to spawn worker thread `{name}`: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StreamResult<T> = Result<T, StreamError>;
