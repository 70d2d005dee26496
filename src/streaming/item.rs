//! Per-placeholder streaming record.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::state::{AtomicState, StreamState};
use super::STALE_FRAME_LIMIT;
use crate::scene::{CompletionToken, DetailSubgraph, NodeId};

/// Sentinel residency index for items not tracked by the container.
pub const INVALID_SLOT: u32 = u32::MAX;

/// Streaming record for one placeholder node.
///
/// Shared across the reader pool, the compiler pool, and the update
/// thread as `Arc<StreamItem>`. The state field is the only arbiter of
/// which stage currently owns the item; the pending-subgraph slot is the
/// only payload written from more than one stage and is mutex-guarded.
pub struct StreamItem {
    /// Back reference to the placeholder node. The engine never owns
    /// scene-graph lifetime.
    node: NodeId,
    /// Opaque description of where to load the detail subgraph from.
    locator: String,
    /// Scheduling hint, rewritten by the culling pass every frame.
    priority: AtomicI32,
    /// Frame stamp of the last time the detail subgraph was in use.
    last_used_frame: AtomicU64,
    /// Pipeline state, mutated only via CAS.
    pub(crate) state: AtomicState,
    /// Reader-produced subgraph travelling towards the merge step, or a
    /// cached subgraph left over from a stale-but-successful read.
    pending: Mutex<Option<DetailSubgraph>>,
    /// Token of the compile batch that produced the current resources.
    completion: Mutex<Option<CompletionToken>>,
    /// Whether a merged subgraph is currently attached in the scene.
    attached: AtomicBool,
    /// Index into the eviction container; update thread only.
    residency_slot: AtomicU32,
}

impl StreamItem {
    pub fn new(node: NodeId, locator: impl Into<String>) -> Self {
        Self {
            node,
            locator: locator.into(),
            priority: AtomicI32::new(0),
            last_used_frame: AtomicU64::new(0),
            state: AtomicState::new(StreamState::NoRequest),
            pending: Mutex::new(None),
            completion: Mutex::new(None),
            attached: AtomicBool::new(false),
            residency_slot: AtomicU32::new(INVALID_SLOT),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Stamp the item as in use at `frame`. Called by the culling pass
    /// whenever the detail subgraph is wanted or visible.
    pub fn touch(&self, frame: u64) {
        self.last_used_frame.store(frame, Ordering::Relaxed);
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> StreamState {
        self.state.load()
    }

    /// Stale when more than [`STALE_FRAME_LIMIT`] frames passed since the
    /// item was last used. Checked at stage boundaries only; in-flight
    /// work is never preempted.
    pub fn is_stale(&self, current_frame: u64) -> bool {
        current_frame.saturating_sub(self.last_used_frame()) > STALE_FRAME_LIMIT
    }

    /// Token the renderer waits on before reusing GPU resources related
    /// to this item's most recent compile batch.
    pub fn completion_token(&self) -> Option<CompletionToken> {
        *self.completion.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub(crate) fn store_pending(&self, subgraph: DetailSubgraph) {
        *self.pending.lock() = Some(subgraph);
    }

    pub(crate) fn take_pending(&self) -> Option<DetailSubgraph> {
        self.pending.lock().take()
    }

    pub(crate) fn set_completion(&self, token: CompletionToken) {
        *self.completion.lock() = Some(token);
    }

    pub(crate) fn clear_completion(&self) {
        *self.completion.lock() = None;
    }

    pub(crate) fn residency_slot(&self) -> u32 {
        self.residency_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_residency_slot(&self, slot: u32) {
        self.residency_slot.store(slot, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for StreamItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamItem")
            .field("node", &self.node)
            .field("locator", &self.locator)
            .field("priority", &self.priority())
            .field("last_used_frame", &self.last_used_frame())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_boundary() {
        let item = StreamItem::new(NodeId(1), "tile/0/0");
        item.touch(10);
        // One frame of lag is still fresh, two is stale.
        assert!(!item.is_stale(10));
        assert!(!item.is_stale(11));
        assert!(item.is_stale(12));
    }

    #[test]
    fn pending_slot_moves_ownership() {
        let item = StreamItem::new(NodeId(2), "tile/0/1");
        assert!(!item.has_pending());
        item.store_pending(DetailSubgraph::new(1, vec![7; 16]));
        assert!(item.has_pending());
        let taken = item.take_pending().expect("pending subgraph");
        assert_eq!(taken.size_bytes(), 16);
        assert!(!item.has_pending());
    }

    #[test]
    fn completion_token_round_trip() {
        let item = StreamItem::new(NodeId(3), "tile/1/0");
        assert!(item.completion_token().is_none());
        item.set_completion(CompletionToken(42));
        assert_eq!(item.completion_token(), Some(CompletionToken(42)));
        item.clear_completion();
        assert!(item.completion_token().is_none());
    }
}
