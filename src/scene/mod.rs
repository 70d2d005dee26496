// Scene-facing data model and collaborator traits.
//
// The streaming engine never walks or owns the scene graph; it talks to
// the renderer, the asset loader, and the GPU upload path exclusively
// through the types in this module.

/// Stable handle to a placeholder node in the scene graph.
///
/// The engine holds these as weak identities only; node lifetime belongs
/// to the scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// In-memory detail subgraph produced by a [`DetailLoader`].
///
/// Contents are opaque to the engine; only size bookkeeping is inspected
/// for logging and statistics.
#[derive(Debug, Clone)]
pub struct DetailSubgraph {
    /// Number of scene nodes in the subgraph.
    pub node_count: u32,
    /// Serialized node and geometry payload handed to the upload backend.
    pub payload: Vec<u8>,
}

impl DetailSubgraph {
    pub fn new(node_count: u32, payload: Vec<u8>) -> Self {
        Self {
            node_count,
            payload,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// Opaque handle to a compile/upload context owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHandle(pub u32);

/// Token produced by a compile batch.
///
/// The renderer waits on this before reusing GPU resources that the
/// batch may still depend on; the backend reports through
/// [`UploadBackend::context_reusable`] when it has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletionToken(pub u64);

/// Turns a locator into an in-memory detail subgraph.
///
/// Called from reader threads; blocking I/O inside `load` is expected.
/// Returning `None` signals a load failure and the placeholder simply
/// keeps its current detail level.
pub trait DetailLoader: Send + Sync {
    fn load(&self, locator: &str) -> Option<DetailSubgraph>;
}

/// GPU compile/upload collaborator.
///
/// `compile_batch` prepares every subgraph in the batch for rendering
/// inside the given context and returns one token covering the whole
/// batch. `context_reusable` must never block.
pub trait UploadBackend: Send + Sync {
    fn create_context(&self) -> ContextHandle;
    fn compile_batch(&self, context: ContextHandle, batch: &[&DetailSubgraph]) -> CompletionToken;
    fn context_reusable(&self, token: CompletionToken) -> bool;
}

/// Mutation surface of the live scene, driven only by the update thread.
pub trait SceneSink {
    /// Attach a merged detail subgraph under its placeholder node.
    fn attach_detail(&mut self, node: NodeId, detail: DetailSubgraph);
    /// Remove a previously attached detail subgraph, reverting the
    /// placeholder to its coarse representation.
    fn detach_detail(&mut self, node: NodeId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subgraph_size_tracks_payload() {
        let detail = DetailSubgraph::new(3, vec![0u8; 128]);
        assert_eq!(detail.node_count, 3);
        assert_eq!(detail.size_bytes(), 128);
    }
}
