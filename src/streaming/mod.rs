// Asynchronous level-of-detail streaming.
// Load -> compile -> merge -> evict, without blocking the update thread.

pub mod context;
pub mod engine;
pub mod error;
pub mod item;
pub mod queue;
pub mod residency;
pub mod state;

pub use context::ContextRotation;
pub use engine::{QueueDepths, StreamConfig, StreamingEngine, StreamingStats};
pub use error::{StreamError, StreamResult};
pub use item::{StreamItem, INVALID_SLOT};
pub use queue::WorkQueue;
pub use residency::ResidencySet;
pub use state::{AtomicState, StreamState};

use std::time::Duration;

/// Default reader pool size (capped by available cores).
pub const DEFAULT_READER_THREADS: usize = 4;

/// Default compiler pool size.
pub const DEFAULT_COMPILER_THREADS: usize = 1;

/// Default soft cap on detail subgraphs tracked by the eviction
/// container.
pub const DEFAULT_TARGET_CAPACITY: usize = 256;

/// Bounded wait used by blocking queue takes; shutdown latency is at
/// most one interval.
pub const QUEUE_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// An item is stale once more than this many frames have passed since it
/// was last used.
pub const STALE_FRAME_LIMIT: u64 = 1;
