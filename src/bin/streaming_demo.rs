use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use lodstream::{
    CompletionToken, ContextHandle, DetailLoader, DetailSubgraph, NodeId, SceneSink, StreamConfig,
    StreamItem, StreamingEngine, UploadBackend,
};

const GRID: i64 = 32;
const VIEW_RADIUS: i64 = 4;
const FRAMES: u64 = 300;

/// Synthetic loader: fabricates a tile subgraph after a short, jittered
/// delay standing in for disk and decode time.
struct TileLoader;

impl DetailLoader for TileLoader {
    fn load(&self, locator: &str) -> Option<DetailSubgraph> {
        let delay = rand::thread_rng().gen_range(1..4);
        std::thread::sleep(Duration::from_millis(delay));
        // Column 17 never loads, keeping the degradation path visible
        // in the stats.
        if locator.ends_with("/17") {
            return None;
        }
        let payload = vec![0u8; 4096];
        Some(DetailSubgraph::new(9, payload))
    }
}

/// Synthetic upload backend: batches "complete" a few milliseconds after
/// dispatch, so context reuse kicks in whenever the compiler keeps up.
struct FenceBackend {
    next_context: AtomicU32,
    next_token: AtomicU64,
    dispatched: Mutex<Vec<(CompletionToken, Instant)>>,
}

impl FenceBackend {
    fn new() -> Self {
        Self {
            next_context: AtomicU32::new(0),
            next_token: AtomicU64::new(1),
            dispatched: Mutex::new(Vec::new()),
        }
    }
}

impl UploadBackend for FenceBackend {
    fn create_context(&self) -> ContextHandle {
        ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    fn compile_batch(&self, _context: ContextHandle, batch: &[&DetailSubgraph]) -> CompletionToken {
        let bytes: usize = batch.iter().map(|s| s.size_bytes()).sum();
        std::thread::sleep(Duration::from_micros((bytes / 64) as u64));
        let token = CompletionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.dispatched.lock().push((token, Instant::now()));
        token
    }

    fn context_reusable(&self, token: CompletionToken) -> bool {
        let mut dispatched = self.dispatched.lock();
        let settled = dispatched
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, at)| at.elapsed() > Duration::from_millis(5))
            .unwrap_or(true);
        if settled {
            dispatched.retain(|(t, _)| *t != token);
        }
        settled
    }
}

#[derive(Default)]
struct DemoScene {
    attached: u64,
    detached: u64,
    resident_nodes: u64,
}

impl SceneSink for DemoScene {
    fn attach_detail(&mut self, _node: NodeId, detail: DetailSubgraph) {
        self.attached += 1;
        self.resident_nodes += detail.node_count as u64;
    }

    fn detach_detail(&mut self, _node: NodeId) {
        self.detached += 1;
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("lodstream - Asynchronous LOD Streaming Demo");
    println!("===========================================");

    let config = StreamConfig {
        target_capacity: 96,
        ..StreamConfig::default()
    };
    println!(
        "Readers: {}, compilers: {}, target capacity: {}",
        config.reader_threads, config.compiler_threads, config.target_capacity
    );

    let mut engine = StreamingEngine::new(
        config,
        Arc::new(TileLoader),
        Arc::new(FenceBackend::new()),
    );
    let mut scene = DemoScene::default();

    // One streamable item per tile of a paged terrain grid.
    let items: Vec<Arc<StreamItem>> = (0..GRID * GRID)
        .map(|index| {
            let node = NodeId(index as u64);
            Arc::new(StreamItem::new(node, format!("tile/{}/{}", index / GRID, index % GRID)))
        })
        .collect();

    engine.start()?;

    println!("\nSweeping camera across {}x{} tiles for {} frames", GRID, GRID, FRAMES);
    println!("---------------------------------------------------");

    let start = Instant::now();
    for frame in 1..=FRAMES {
        // Stand-in for the renderer's culling pass: the camera drifts
        // across the grid, and every tile inside the view radius is
        // touched, prioritized by closeness, and requested.
        let cam_x = (frame as i64 * GRID) / FRAMES as i64;
        let cam_y = GRID / 2;
        for dy in -VIEW_RADIUS..=VIEW_RADIUS {
            for dx in -VIEW_RADIUS..=VIEW_RADIUS {
                let (x, y) = (cam_x + dx, cam_y + dy);
                if x < 0 || y < 0 || x >= GRID || y >= GRID {
                    continue;
                }
                let distance_sq = dx * dx + dy * dy;
                if distance_sq > VIEW_RADIUS * VIEW_RADIUS {
                    continue;
                }
                let item = &items[(y * GRID + x) as usize];
                item.touch(frame);
                item.set_priority((VIEW_RADIUS * VIEW_RADIUS - distance_sq) as i32 * 10);
                engine.request(item);
            }
        }

        engine.update(frame, &mut scene);

        if frame % 60 == 0 {
            let depths = engine.queue_depths();
            let (active, inactive) = engine.residency_counts();
            println!(
                "frame {:>3}: in-flight {:>3}, queues r/c/m {}/{}/{}, residency {}+{}",
                frame,
                engine.in_flight(),
                depths.request,
                depths.compile,
                depths.merge,
                active,
                inactive
            );
        }

        std::thread::sleep(Duration::from_millis(3));
    }

    // Drain whatever the pools finish in the next few frames.
    for frame in FRAMES + 1..=FRAMES + 20 {
        engine.update(frame, &mut scene);
        std::thread::sleep(Duration::from_millis(5));
    }
    engine.stop();

    let stats = engine.stats();
    println!("\nRun finished in {:.2?}", start.elapsed());
    println!("--------------------------------");
    println!("Requests accepted:  {}", stats.requests_accepted);
    println!("Requests ignored:   {}", stats.requests_ignored);
    println!("Loads completed:    {}", stats.loads_completed);
    println!("Load failures:      {}", stats.load_failures);
    println!("Stale discards:     {}", stats.stale_discards);
    println!("Batches dispatched: {}", stats.batches_dispatched);
    println!("Subgraphs compiled: {}", stats.subgraphs_compiled);
    println!("Merges completed:   {}", stats.merges_completed);
    println!("Evictions:          {}", stats.evictions);
    println!("Deletes processed:  {}", stats.deletes_processed);
    println!(
        "Contexts:           {} allocated, {} reused",
        stats.contexts_allocated, stats.contexts_reused
    );
    println!(
        "Scene:              {} attached, {} detached, {} resident nodes",
        scene.attached, scene.detached, scene.resident_nodes
    );

    Ok(())
}
