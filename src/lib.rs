pub mod scene;
pub mod streaming;

pub use scene::{
    CompletionToken, ContextHandle, DetailLoader, DetailSubgraph, NodeId, SceneSink, UploadBackend,
};
pub use streaming::{
    StreamConfig, StreamError, StreamItem, StreamResult, StreamState, StreamingEngine,
    StreamingStats,
};
