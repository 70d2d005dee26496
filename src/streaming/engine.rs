//! The streaming engine: request routing, worker pools, merge step, and
//! eviction housekeeping.
//!
//! One engine owns the request and compile queues, the merge channel,
//! the reader and compiler pools, and the residency container. The
//! update/render thread is the only caller of `update`, `request`, and
//! `release`; it never blocks inside the engine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::context::ContextRotation;
use super::error::{StreamError, StreamResult};
use super::item::StreamItem;
use super::queue::WorkQueue;
use super::residency::ResidencySet;
use super::state::StreamState;
use super::{
    DEFAULT_COMPILER_THREADS, DEFAULT_READER_THREADS, DEFAULT_TARGET_CAPACITY, QUEUE_WAIT_INTERVAL,
};
use crate::scene::{DetailLoader, DetailSubgraph, SceneSink, UploadBackend};

/// Configuration for the streaming engine.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Reader threads turning locators into in-memory subgraphs.
    pub reader_threads: usize,
    /// Compiler threads batching subgraphs through the upload backend.
    pub compiler_threads: usize,
    /// Soft cap on items tracked by the eviction container.
    pub target_capacity: usize,
    /// Bounded wait used by blocking queue takes; shutdown latency is at
    /// most one interval.
    pub queue_wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            reader_threads: DEFAULT_READER_THREADS.min(cores),
            compiler_threads: DEFAULT_COMPILER_THREADS,
            target_capacity: DEFAULT_TARGET_CAPACITY,
            queue_wait: QUEUE_WAIT_INTERVAL,
        }
    }
}

/// Lock-free statistics counters shared across stages.
#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
    pub requests_accepted: AtomicU64,
    pub requests_ignored: AtomicU64,
    pub loads_completed: AtomicU64,
    pub load_failures: AtomicU64,
    pub stale_discards: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub subgraphs_compiled: AtomicU64,
    pub merges_completed: AtomicU64,
    pub evictions: AtomicU64,
    pub deletes_processed: AtomicU64,
    pub contexts_allocated: AtomicU64,
    pub contexts_reused: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingStats {
    pub requests_accepted: u64,
    pub requests_ignored: u64,
    pub loads_completed: u64,
    pub load_failures: u64,
    pub stale_discards: u64,
    pub batches_dispatched: u64,
    pub subgraphs_compiled: u64,
    pub merges_completed: u64,
    pub evictions: u64,
    pub deletes_processed: u64,
    pub contexts_allocated: u64,
    pub contexts_reused: u64,
}

/// Current depth of each pipeline queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueDepths {
    pub request: usize,
    pub compile: usize,
    pub merge: usize,
}

/// Asynchronous level-of-detail streaming engine.
///
/// Loads, compiles, merges, and evicts detail subgraphs for a paged
/// scene. `request`, `update`, and `release` must only ever be called
/// from the single update/render thread; worker pools run everything
/// else.
pub struct StreamingEngine {
    config: StreamConfig,
    loader: Arc<dyn DetailLoader>,
    backend: Arc<dyn UploadBackend>,
    live: Arc<AtomicBool>,
    /// Frame stamp published by `update` and read by the workers'
    /// staleness checks.
    frame: Arc<AtomicU64>,
    /// Accepted requests that have not yet reached a terminal
    /// checkpoint (merge, stale discard, load failure, or disposal).
    in_flight: Arc<AtomicUsize>,
    request_queue: Arc<WorkQueue>,
    compile_queue: Arc<WorkQueue>,
    merge_tx: Sender<Arc<StreamItem>>,
    merge_rx: Receiver<Arc<StreamItem>>,
    residency: ResidencySet,
    counters: Arc<StreamCounters>,
    workers: Vec<JoinHandle<()>>,
}

impl StreamingEngine {
    pub fn new(
        config: StreamConfig,
        loader: Arc<dyn DetailLoader>,
        backend: Arc<dyn UploadBackend>,
    ) -> Self {
        let live = Arc::new(AtomicBool::new(false));
        let (merge_tx, merge_rx) = unbounded();
        Self {
            request_queue: Arc::new(WorkQueue::new(Arc::clone(&live), config.queue_wait)),
            compile_queue: Arc::new(WorkQueue::new(Arc::clone(&live), config.queue_wait)),
            merge_tx,
            merge_rx,
            loader,
            backend,
            live,
            frame: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            residency: ResidencySet::new(),
            counters: Arc::new(StreamCounters::default()),
            workers: Vec::new(),
            config,
        }
    }

    /// Ask the engine to stream the detail subgraph for `item`.
    ///
    /// An item with a cached subgraph from an earlier stale read skips
    /// the read stage. A duplicate request for an item already in flight
    /// loses the state CAS and is a silent no-op.
    pub fn request(&mut self, item: &Arc<StreamItem>) {
        let shortcut = item.has_pending();
        let accepted = if shortcut {
            item.state
                .transition(StreamState::NoRequest, StreamState::CompilePending)
        } else {
            item.state
                .transition(StreamState::NoRequest, StreamState::ReadPending)
        };
        if !accepted {
            self.counters.requests_ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.counters.requests_accepted.fetch_add(1, Ordering::Relaxed);
        self.residency.mark_active(item);
        if shortcut {
            log::debug!(
                "[StreamingEngine] request {:?} reuses cached subgraph, skipping read",
                item.node()
            );
            self.compile_queue.push(Arc::clone(item));
        } else {
            self.request_queue.push(Arc::clone(item));
        }
    }

    /// Spawn the reader and compiler pools.
    pub fn start(&mut self) -> StreamResult<()> {
        if !self.workers.is_empty() {
            return Err(StreamError::AlreadyRunning);
        }
        self.live.store(true, Ordering::Release);

        for index in 0..self.config.reader_threads {
            let worker = ReaderWorker {
                index,
                request_queue: Arc::clone(&self.request_queue),
                compile_queue: Arc::clone(&self.compile_queue),
                loader: Arc::clone(&self.loader),
                live: Arc::clone(&self.live),
                frame: Arc::clone(&self.frame),
                in_flight: Arc::clone(&self.in_flight),
                counters: Arc::clone(&self.counters),
            };
            self.spawn_worker(format!("stream-read-{}", index), move || worker.run())?;
        }

        for index in 0..self.config.compiler_threads {
            let worker = CompilerWorker {
                index,
                compile_queue: Arc::clone(&self.compile_queue),
                merge_tx: self.merge_tx.clone(),
                backend: Arc::clone(&self.backend),
                live: Arc::clone(&self.live),
                frame: Arc::clone(&self.frame),
                in_flight: Arc::clone(&self.in_flight),
                counters: Arc::clone(&self.counters),
            };
            self.spawn_worker(format!("stream-compile-{}", index), move || worker.run())?;
        }

        log::info!(
            "[StreamingEngine] started {} reader and {} compiler threads (target capacity {})",
            self.config.reader_threads,
            self.config.compiler_threads,
            self.config.target_capacity
        );
        Ok(())
    }

    fn spawn_worker<F>(&mut self, name: String, body: F) -> StreamResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match std::thread::Builder::new().name(name.clone()).spawn(body) {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(source) => {
                // Tear down anything spawned so far; a half-started pool
                // must not linger.
                self.stop();
                Err(StreamError::WorkerSpawn { name, source })
            }
        }
    }

    /// Merge completed subgraphs into the scene, then run the eviction
    /// pass. Called once per frame by the update/render thread; drains
    /// only what has finished so far and never waits.
    pub fn update(&mut self, frame: u64, scene: &mut dyn SceneSink) {
        self.frame.store(frame, Ordering::Release);

        while let Ok(item) = self.merge_rx.try_recv() {
            if !item
                .state
                .transition(StreamState::MergePending, StreamState::Merging)
            {
                // Eviction re-routed the item to disposal between
                // compile and merge; drop the stale channel entry.
                continue;
            }
            match item.take_pending() {
                Some(subgraph) => {
                    scene.attach_detail(item.node(), subgraph);
                    item.set_attached(true);
                }
                None => {
                    log::warn!(
                        "[StreamingEngine] {:?} reached the merge step without a subgraph",
                        item.node()
                    );
                }
            }
            item.state
                .transition(StreamState::Merging, StreamState::NoRequest);
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.counters.merges_completed.fetch_add(1, Ordering::Relaxed);
            self.residency.mark_active(&item);
        }

        self.residency.sweep(frame);
        self.run_eviction(scene);
    }

    fn run_eviction(&mut self, scene: &mut dyn SceneSink) {
        let tracked = self.residency.tracked_len();
        if tracked <= self.config.target_capacity {
            return;
        }
        let excess = tracked - self.config.target_capacity;
        let select = excess.min(self.residency.inactive_len());

        let mut skipped = Vec::new();
        for _ in 0..select {
            let Some(item) = self.residency.pop_inactive_tail() else {
                break;
            };
            if !self.dispose_or_forward(&item, scene) {
                skipped.push(item);
            }
        }
        // Items mid-read cannot take a delete request; put them back and
        // let their staleness checkpoints retire them.
        for item in skipped {
            self.residency.mark_inactive(&item);
        }
    }

    /// Dispose of `item` or route it to a compiler thread for disposal.
    /// Returns `false` for items in read-stage states, which cannot be
    /// claimed here.
    fn dispose_or_forward(&mut self, item: &Arc<StreamItem>, scene: &mut dyn SceneSink) -> bool {
        if item.state() == StreamState::NoRequest {
            // Idle or resident; nothing in flight, dispose inline.
            if item.is_attached() {
                scene.detach_detail(item.node());
                item.set_attached(false);
            }
            drop(item.take_pending());
            item.clear_completion();
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("[StreamingEngine] evicted {:?}", item.node());
            return true;
        }

        // Still in the compile queue; flip the existing entry into a
        // delete request in place.
        if item
            .state
            .transition(StreamState::CompilePending, StreamState::DeletePending)
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        // Out of the compile queue by now; route a delete request back
        // through it.
        if item
            .state
            .transition(StreamState::MergePending, StreamState::DeletePending)
            || item
                .state
                .transition(StreamState::Compiling, StreamState::DeletePending)
        {
            self.compile_queue.push(Arc::clone(item));
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Detach and dispose `item` ahead of its placeholder node being
    /// destroyed by the scene graph.
    pub fn release(&mut self, item: &Arc<StreamItem>, scene: &mut dyn SceneSink) {
        self.residency.remove(item);
        if !self.dispose_or_forward(item, scene) {
            log::debug!(
                "[StreamingEngine] release deferred for {:?}, read in flight",
                item.node()
            );
        }
    }

    /// Stop the worker pools and join every thread. Returns within one
    /// queue wait interval regardless of queue depth.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.live.store(false, Ordering::Release);
        self.request_queue.wake_all();
        self.compile_queue.wake_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("[StreamingEngine] worker thread panicked during shutdown");
            }
        }
        log::info!("[StreamingEngine] stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Accepted requests still travelling through the pipeline.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Items tracked by the eviction container as `(active, inactive)`.
    pub fn residency_counts(&self) -> (usize, usize) {
        (self.residency.active_len(), self.residency.inactive_len())
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            request: self.request_queue.len(),
            compile: self.compile_queue.len(),
            merge: self.merge_rx.len(),
        }
    }

    pub fn stats(&self) -> StreamingStats {
        let counters = &self.counters;
        StreamingStats {
            requests_accepted: counters.requests_accepted.load(Ordering::Relaxed),
            requests_ignored: counters.requests_ignored.load(Ordering::Relaxed),
            loads_completed: counters.loads_completed.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            stale_discards: counters.stale_discards.load(Ordering::Relaxed),
            batches_dispatched: counters.batches_dispatched.load(Ordering::Relaxed),
            subgraphs_compiled: counters.subgraphs_compiled.load(Ordering::Relaxed),
            merges_completed: counters.merges_completed.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            deletes_processed: counters.deletes_processed.load(Ordering::Relaxed),
            contexts_allocated: counters.contexts_allocated.load(Ordering::Relaxed),
            contexts_reused: counters.contexts_reused.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker state for one reader thread.
struct ReaderWorker {
    index: usize,
    request_queue: Arc<WorkQueue>,
    compile_queue: Arc<WorkQueue>,
    loader: Arc<dyn DetailLoader>,
    live: Arc<AtomicBool>,
    frame: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    counters: Arc<StreamCounters>,
}

impl ReaderWorker {
    fn run(self) {
        log::debug!("[ReaderWorker {}] started", self.index);
        while self.live.load(Ordering::Acquire) {
            let Some(item) = self.request_queue.take_highest_priority() else {
                continue;
            };
            self.service(item);
        }
        log::debug!("[ReaderWorker {}] stopped", self.index);
    }

    fn service(&self, item: Arc<StreamItem>) {
        if !item
            .state
            .transition(StreamState::ReadPending, StreamState::Reading)
        {
            // Another stage moved the item first; stale queue entry.
            return;
        }

        let frame = self.frame.load(Ordering::Acquire);
        if item.is_stale(frame) {
            // Too many frames passed since the culling pass wanted this
            // item; skip the load entirely.
            item.state
                .transition(StreamState::Reading, StreamState::NoRequest);
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.counters.stale_discards.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[ReaderWorker {}] stale request for {:?} discarded before load",
                self.index,
                item.node()
            );
            return;
        }

        match self.loader.load(item.locator()) {
            Some(subgraph) => {
                item.store_pending(subgraph);
                self.counters.loads_completed.fetch_add(1, Ordering::Relaxed);

                let frame = self.frame.load(Ordering::Acquire);
                if item.is_stale(frame) {
                    // The subgraph stays cached so a later request can
                    // skip straight to the compile stage.
                    item.state
                        .transition(StreamState::Reading, StreamState::NoRequest);
                    self.in_flight.fetch_sub(1, Ordering::Relaxed);
                    self.counters.stale_discards.fetch_add(1, Ordering::Relaxed);
                } else if item
                    .state
                    .transition(StreamState::Reading, StreamState::CompilePending)
                {
                    self.compile_queue.push(item);
                }
            }
            None => {
                item.state
                    .transition(StreamState::Reading, StreamState::NoRequest);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[ReaderWorker {}] loader returned nothing for `{}`; {:?} keeps its current detail",
                    self.index,
                    item.locator(),
                    item.node()
                );
            }
        }
    }
}

/// Worker state for one compiler thread.
struct CompilerWorker {
    index: usize,
    compile_queue: Arc<WorkQueue>,
    merge_tx: Sender<Arc<StreamItem>>,
    backend: Arc<dyn UploadBackend>,
    live: Arc<AtomicBool>,
    frame: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    counters: Arc<StreamCounters>,
}

impl CompilerWorker {
    fn run(self) {
        log::debug!("[CompilerWorker {}] started", self.index);
        let mut rotation = ContextRotation::new(Arc::clone(&self.backend));
        while self.live.load(Ordering::Acquire) {
            let batch = self.compile_queue.take_all();
            if batch.is_empty() {
                continue;
            }
            self.service(&mut rotation, batch);
        }
        log::debug!("[CompilerWorker {}] stopped", self.index);
    }

    fn service(&self, rotation: &mut ContextRotation, batch: Vec<Arc<StreamItem>>) {
        let frame = self.frame.load(Ordering::Acquire);

        // Partition the batch: disposal requests first, then claim the
        // compile requests that are still wanted.
        let mut compiles: Vec<(Arc<StreamItem>, DetailSubgraph)> = Vec::new();
        for item in batch {
            if item
                .state
                .transition(StreamState::DeletePending, StreamState::Deleting)
            {
                self.dispose(&item);
                continue;
            }
            if !item
                .state
                .transition(StreamState::CompilePending, StreamState::Compiling)
            {
                // Stale queue entry; another stage or an eviction got
                // there first.
                continue;
            }
            if item.is_stale(frame) {
                // Keep the subgraph cached for a later request.
                item.state
                    .transition(StreamState::Compiling, StreamState::NoRequest);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                self.counters.stale_discards.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match item.take_pending() {
                Some(subgraph) => compiles.push((item, subgraph)),
                None => {
                    log::warn!(
                        "[CompilerWorker {}] {:?} reached the compile stage without a subgraph",
                        self.index,
                        item.node()
                    );
                    item.state
                        .transition(StreamState::Compiling, StreamState::NoRequest);
                    self.in_flight.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        if compiles.is_empty() {
            return;
        }

        let context = match rotation.try_reuse() {
            Some(context) => {
                self.counters.contexts_reused.fetch_add(1, Ordering::Relaxed);
                context
            }
            None => {
                self.counters
                    .contexts_allocated
                    .fetch_add(1, Ordering::Relaxed);
                rotation.allocate()
            }
        };

        let subgraphs: Vec<&DetailSubgraph> = compiles.iter().map(|(_, s)| s).collect();
        let token = self.backend.compile_batch(context, &subgraphs);
        rotation.retire(context, token);

        self.counters.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .subgraphs_compiled
            .fetch_add(compiles.len() as u64, Ordering::Relaxed);
        log::debug!(
            "[CompilerWorker {}] dispatched batch of {} with {:?}",
            self.index,
            compiles.len(),
            token
        );

        for (item, subgraph) in compiles {
            item.store_pending(subgraph);
            item.set_completion(token);
            if item
                .state
                .transition(StreamState::Compiling, StreamState::MergePending)
            {
                let _ = self.merge_tx.send(item);
            }
            // A failed transition means an eviction re-routed the item
            // to DeletePending mid-batch; the payload stays in `pending`
            // for that disposal.
        }
    }

    fn dispose(&self, item: &Arc<StreamItem>) {
        let dropped = item.take_pending();
        item.clear_completion();
        item.state
            .transition(StreamState::Deleting, StreamState::NoRequest);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.counters.deletes_processed.fetch_add(1, Ordering::Relaxed);
        if let Some(subgraph) = dropped {
            log::debug!(
                "[CompilerWorker {}] disposed {} byte subgraph for {:?}",
                self.index,
                subgraph.size_bytes(),
                item.node()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{CompletionToken, ContextHandle, NodeId};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    struct TestLoader {
        calls: AtomicU64,
        fail: bool,
    }

    impl TestLoader {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl DetailLoader for TestLoader {
        fn load(&self, locator: &str) -> Option<DetailSubgraph> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return None;
            }
            Some(DetailSubgraph::new(1, locator.as_bytes().to_vec()))
        }
    }

    struct TestBackend {
        next_context: AtomicU32,
        next_token: AtomicU64,
    }

    impl TestBackend {
        fn new() -> Self {
            Self {
                next_context: AtomicU32::new(0),
                next_token: AtomicU64::new(1),
            }
        }
    }

    impl UploadBackend for TestBackend {
        fn create_context(&self) -> ContextHandle {
            ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed))
        }

        fn compile_batch(
            &self,
            _context: ContextHandle,
            _batch: &[&DetailSubgraph],
        ) -> CompletionToken {
            CompletionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
        }

        fn context_reusable(&self, _token: CompletionToken) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct TestScene {
        attached: HashMap<NodeId, DetailSubgraph>,
        detached: Vec<NodeId>,
    }

    impl SceneSink for TestScene {
        fn attach_detail(&mut self, node: NodeId, detail: DetailSubgraph) {
            self.attached.insert(node, detail);
        }

        fn detach_detail(&mut self, node: NodeId) {
            self.attached.remove(&node);
            self.detached.push(node);
        }
    }

    fn engine_with(
        loader: Arc<TestLoader>,
        config: StreamConfig,
    ) -> StreamingEngine {
        StreamingEngine::new(config, loader, Arc::new(TestBackend::new()))
    }

    fn quick_config() -> StreamConfig {
        StreamConfig {
            reader_threads: 2,
            compiler_threads: 1,
            target_capacity: 64,
            queue_wait: Duration::from_millis(10),
        }
    }

    fn new_item(id: u64, frame: u64) -> Arc<StreamItem> {
        let item = StreamItem::new(NodeId(id), format!("tile/{}", id));
        item.touch(frame);
        Arc::new(item)
    }

    #[test]
    fn duplicate_request_is_a_noop() {
        let mut engine = engine_with(Arc::new(TestLoader::new()), quick_config());
        let item = new_item(1, 0);

        engine.request(&item);
        engine.request(&item);

        assert_eq!(engine.in_flight(), 1);
        assert_eq!(engine.queue_depths().request, 1);
        let stats = engine.stats();
        assert_eq!(stats.requests_accepted, 1);
        assert_eq!(stats.requests_ignored, 1);
        assert_eq!(item.state(), StreamState::ReadPending);
    }

    #[test]
    fn cached_subgraph_skips_read_stage() {
        let mut engine = engine_with(Arc::new(TestLoader::new()), quick_config());
        let item = new_item(2, 0);
        item.store_pending(DetailSubgraph::new(1, vec![1, 2, 3]));

        engine.request(&item);

        assert_eq!(item.state(), StreamState::CompilePending);
        assert_eq!(engine.queue_depths().request, 0);
        assert_eq!(engine.queue_depths().compile, 1);
    }

    #[test]
    fn round_trip_attaches_detail() {
        let loader = Arc::new(TestLoader::new());
        let mut engine = engine_with(Arc::clone(&loader), quick_config());
        let mut scene = TestScene::default();
        engine.start().expect("engine start");

        let item = new_item(3, 1);
        engine.request(&item);

        let mut attached = false;
        for frame in 1..=100u64 {
            item.touch(frame);
            engine.update(frame, &mut scene);
            if item.is_attached() {
                attached = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        assert!(attached, "detail subgraph never merged");
        assert!(scene.attached.contains_key(&NodeId(3)));
        assert!(item.completion_token().is_some());
        assert_eq!(item.state(), StreamState::NoRequest);
        assert_eq!(engine.in_flight(), 0);
        let stats = engine.stats();
        assert_eq!(stats.loads_completed, 1);
        assert_eq!(stats.merges_completed, 1);
        assert_eq!(stats.batches_dispatched, 1);
    }

    #[test]
    fn stale_claim_never_invokes_loader() {
        let loader = Arc::new(TestLoader::new());
        let mut engine = engine_with(Arc::clone(&loader), quick_config());
        let mut scene = TestScene::default();

        let item = new_item(4, 10);
        // Publish frame 12 before any reader can claim the item.
        engine.update(12, &mut scene);
        engine.request(&item);
        engine.start().expect("engine start");

        let deadline = Instant::now() + Duration::from_secs(2);
        while item.state() != StreamState::NoRequest && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        assert_eq!(item.state(), StreamState::NoRequest);
        assert_eq!(loader.calls(), 0, "loader ran for a stale request");
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().stale_discards, 1);
    }

    #[test]
    fn load_failure_resets_item() {
        let loader = Arc::new(TestLoader::failing());
        let mut engine = engine_with(Arc::clone(&loader), quick_config());
        engine.start().expect("engine start");

        let item = new_item(5, 1);
        engine.request(&item);

        let deadline = Instant::now() + Duration::from_secs(2);
        while (item.state() != StreamState::NoRequest || loader.calls() == 0)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        assert_eq!(item.state(), StreamState::NoRequest);
        assert!(!item.has_pending());
        assert!(!item.is_attached());
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().load_failures, 1);
    }

    #[test]
    fn eviction_never_exceeds_inactive_population() {
        let mut config = quick_config();
        config.target_capacity = 4;
        let mut engine = engine_with(Arc::new(TestLoader::new()), config);
        let mut scene = TestScene::default();

        // Ten resident items, all last used at frame 1.
        let items: Vec<_> = (0..10)
            .map(|id| {
                let item = new_item(id, 1);
                item.set_attached(true);
                scene
                    .attached
                    .insert(item.node(), DetailSubgraph::new(1, vec![0]));
                engine.residency.mark_active(&item);
                item
            })
            .collect();

        // Frame 2: everything is demoted and the excess is evicted.
        engine.update(2, &mut scene);

        let (active, inactive) = engine.residency_counts();
        assert_eq!(active, 0);
        assert!(active + inactive <= 4);
        assert_eq!(engine.stats().evictions, 6);
        assert_eq!(scene.detached.len(), 6);
        let still_attached = items.iter().filter(|item| item.is_attached()).count();
        assert_eq!(still_attached, 4);
    }

    #[test]
    fn release_detaches_resident_item() {
        let mut engine = engine_with(Arc::new(TestLoader::new()), quick_config());
        let mut scene = TestScene::default();

        let item = new_item(7, 1);
        item.set_attached(true);
        scene
            .attached
            .insert(item.node(), DetailSubgraph::new(1, vec![0]));
        engine.residency.mark_active(&item);

        engine.release(&item, &mut scene);

        assert!(!item.is_attached());
        assert!(scene.detached.contains(&NodeId(7)));
        assert_eq!(engine.residency_counts(), (0, 0));
    }

    #[test]
    fn stop_joins_within_wait_interval() {
        let mut engine = engine_with(Arc::new(TestLoader::new()), quick_config());
        engine.start().expect("engine start");
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        engine.stop();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(!engine.is_running());
    }
}
