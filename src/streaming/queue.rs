//! Bounded-wait work queue shared between pipeline stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::item::StreamItem;

/// Thread-safe collection of streamed items.
///
/// Consumers block with a bounded wait and re-check the shared liveness
/// flag on every wake, so shutdown latency is at most one wait interval
/// regardless of queue depth.
pub struct WorkQueue {
    entries: Mutex<Vec<Arc<StreamItem>>>,
    ready: Condvar,
    live: Arc<AtomicBool>,
    wait_interval: Duration,
}

impl WorkQueue {
    pub fn new(live: Arc<AtomicBool>, wait_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            ready: Condvar::new(),
            live,
            wait_interval,
        }
    }

    pub fn push(&self, item: Arc<StreamItem>) {
        self.entries.lock().push(item);
        self.ready.notify_one();
    }

    pub fn push_batch(&self, items: Vec<Arc<StreamItem>>) {
        if items.is_empty() {
            return;
        }
        self.entries.lock().extend(items);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wake every blocked consumer; used together with clearing the
    /// liveness flag during shutdown.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }

    /// Remove and return the highest-priority entry, blocking until one
    /// is available or the liveness flag clears.
    ///
    /// Priority is re-read at scan time: the culling pass rewrites it
    /// every frame, so a maintained heap would be stale as often as
    /// useful. The numerically greatest priority wins and the first
    /// maximum is kept on ties, so identical queue contents always yield
    /// the same pick.
    pub fn take_highest_priority(&self) -> Option<Arc<StreamItem>> {
        let mut entries = self.entries.lock();
        loop {
            if !self.live.load(Ordering::Acquire) {
                return None;
            }
            if !entries.is_empty() {
                break;
            }
            self.ready.wait_for(&mut entries, self.wait_interval);
        }

        let mut best = 0;
        for index in 1..entries.len() {
            if entries[index].priority() > entries[best].priority() {
                best = index;
            }
        }
        Some(entries.remove(best))
    }

    /// Drain and return everything currently queued, blocking until at
    /// least one entry is available or the liveness flag clears. Used by
    /// the compiler stage to batch work per dispatch.
    pub fn take_all(&self) -> Vec<Arc<StreamItem>> {
        let mut entries = self.entries.lock();
        loop {
            if !self.live.load(Ordering::Acquire) {
                return Vec::new();
            }
            if !entries.is_empty() {
                break;
            }
            self.ready.wait_for(&mut entries, self.wait_interval);
        }
        std::mem::take(&mut *entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::NodeId;
    use std::time::Instant;

    fn live_flag(value: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(value))
    }

    fn item(id: u64, priority: i32) -> Arc<StreamItem> {
        let item = StreamItem::new(NodeId(id), format!("tile/{}", id));
        item.set_priority(priority);
        Arc::new(item)
    }

    #[test]
    fn highest_priority_wins() {
        let queue = WorkQueue::new(live_flag(true), Duration::from_millis(10));
        queue.push(item(1, 5));
        queue.push(item(2, 1));
        queue.push(item(3, 9));

        let first = queue.take_highest_priority().expect("queued item");
        assert_eq!(first.node(), NodeId(3));
        let second = queue.take_highest_priority().expect("queued item");
        assert_eq!(second.node(), NodeId(1));
        let third = queue.take_highest_priority().expect("queued item");
        assert_eq!(third.node(), NodeId(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn ties_resolve_to_first_queued() {
        let queue = WorkQueue::new(live_flag(true), Duration::from_millis(10));
        queue.push(item(10, 4));
        queue.push(item(11, 4));
        let first = queue.take_highest_priority().expect("queued item");
        assert_eq!(first.node(), NodeId(10));
    }

    #[test]
    fn take_all_drains_everything() {
        let queue = WorkQueue::new(live_flag(true), Duration::from_millis(10));
        queue.push_batch(vec![item(1, 0), item(2, 0), item(3, 0)]);
        let batch = queue.take_all();
        assert_eq!(batch.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn cleared_liveness_returns_promptly() {
        let queue = Arc::new(WorkQueue::new(live_flag(false), Duration::from_millis(50)));
        let start = Instant::now();
        assert!(queue.take_highest_priority().is_none());
        assert!(queue.take_all().is_empty());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn blocked_consumer_wakes_on_shutdown() {
        let live = live_flag(true);
        let queue = Arc::new(WorkQueue::new(Arc::clone(&live), Duration::from_millis(100)));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.take_highest_priority())
        };

        std::thread::sleep(Duration::from_millis(20));
        live.store(false, Ordering::Release);
        queue.wake_all();

        let start = Instant::now();
        let taken = consumer.join().expect("consumer thread");
        assert!(taken.is_none());
        assert!(start.elapsed() < Duration::from_millis(150));
    }
}
