//! Out-of-order parallel rendering must come back strictly ordered.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use grabme_common::config::PipelineConfig;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_decode::{DecodedFrame, FrameAccounting, RgbaImage};
use grabme_project_model::composite::{CompositeParams, CompositeSource, StaticComposite};
use grabme_render_engine::{
    renderer_factory, FrameReassembler, FrameRenderer, FrameSource, PoolSettings, RenderCoordinator,
    RenderMode, RenderTask, RendererFactory, SourceCapabilities, SourceMode, SourceStats, WorkerPool,
};

/// Later frames render faster, so completions arrive out of order.
struct SkewedRenderer {
    frames: u64,
}

impl FrameRenderer for SkewedRenderer {
    fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
        let delay = self.frames.saturating_sub(task.frame_index) * 3;
        std::thread::sleep(Duration::from_millis(delay));
        RgbaImage::filled(2, 2, [task.frame_index as u8, 0, 0, 255])
    }
}

/// In-memory source: frame `i` is a 2x2 image of shade `i`.
struct CountingSource {
    accounting: FrameAccounting,
}

#[async_trait::async_trait]
impl FrameSource for CountingSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Fast
    }

    async fn initialize(&mut self) -> PipelineResult<SourceCapabilities> {
        Ok(SourceCapabilities {
            mode: SourceMode::Fast,
            width: 2,
            height: 2,
            fps: 25.0,
            duration_ms: 1_000.0,
            frame_count: 25,
            codec: "test".to_string(),
        })
    }

    async fn get_frame(&self, index: u64, effective_time_ms: f64) -> PipelineResult<DecodedFrame> {
        let image = RgbaImage::filled(2, 2, [index as u8, 0, 0, 255])?;
        Ok(self
            .accounting
            .frame((effective_time_ms * 1_000.0) as i64, 40_000, image))
    }

    fn destroy(&self) {}

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

/// Copies the source frame through unchanged.
struct PassThrough;

impl FrameRenderer for PassThrough {
    fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
        Ok(task.frame.image().clone())
    }
}

/// Renderer that panics whenever it runs on a pool worker thread.
struct PanicsOnWorkers;

impl FrameRenderer for PanicsOnWorkers {
    fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
        if on_pool_worker() {
            panic!("renderer blew up on frame {}", task.frame_index);
        }
        Ok(task.frame.image().clone())
    }
}

fn on_pool_worker() -> bool {
    std::thread::current()
        .name()
        .map_or(false, |name| name.starts_with("render-worker-"))
}

async fn coordinator(
    factory: Arc<dyn RendererFactory>,
    accounting: &FrameAccounting,
) -> RenderCoordinator {
    let source: Arc<dyn FrameSource> = Arc::new(CountingSource {
        accounting: accounting.clone(),
    });
    let composite: Arc<dyn CompositeSource> =
        Arc::new(StaticComposite(CompositeParams::default()));
    let config = PipelineConfig {
        worker_count: 2,
        worker_max_retries: 1,
        ..PipelineConfig::default()
    };
    RenderCoordinator::new(source, composite, factory, &config, &CancellationToken::new()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_start_failure_renders_directly() {
    let factory = renderer_factory(|| {
        if on_pool_worker() {
            return Err(PipelineError::config("no renderer on worker threads"));
        }
        Ok(Box::new(PassThrough) as Box<dyn FrameRenderer>)
    });
    let accounting = FrameAccounting::new();
    let coordinator = coordinator(factory, &accounting).await;
    assert_eq!(coordinator.mode(), RenderMode::Direct);

    for index in 0..10u64 {
        let result = coordinator.render_frame(index, index as f64 * 40.0).await.unwrap();
        assert_eq!(result.frame_index, index);
        assert_eq!(result.image.pixel(0, 0)[0], index as u8);
    }
    let stats = coordinator.stats();
    assert_eq!(stats.mode, RenderMode::Direct);
    assert!(stats.pool.is_none());
    assert_eq!(stats.frames_rendered, 10);
    assert_eq!(stats.direct_renders, 10);
    assert_eq!(stats.pool_fallbacks, 0);
    coordinator.destroy().await;
    assert_eq!(accounting.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_crash_exhaustion_switches_to_direct() {
    let factory = renderer_factory(|| Ok(Box::new(PanicsOnWorkers) as Box<dyn FrameRenderer>));
    let accounting = FrameAccounting::new();
    let coordinator = coordinator(factory, &accounting).await;
    assert_eq!(coordinator.mode(), RenderMode::Parallel);

    for index in 0..10u64 {
        let result = coordinator.render_frame(index, index as f64 * 40.0).await.unwrap();
        assert_eq!(result.frame_index, index);
        assert_eq!(result.image.pixel(0, 0)[0], index as u8);
    }
    let stats = coordinator.stats();
    assert_eq!(stats.mode, RenderMode::Direct);
    // Only the first frame went to the pool; it came back and rendered here.
    assert_eq!(stats.pool_fallbacks, 1);
    assert_eq!(stats.direct_renders, 10);
    assert_eq!(stats.frames_rendered, 10);
    assert!(stats.pool.map_or(false, |pool| pool.crashes >= 2));
    coordinator.destroy().await;
    assert_eq!(accounting.outstanding(), 0);
}

fn task(accounting: &FrameAccounting, index: u64) -> RenderTask {
    let image = RgbaImage::filled(2, 2, [0, 0, 0, 255]).unwrap();
    RenderTask {
        frame_index: index,
        source_time_ms: index as f64 * 40.0,
        effective_time_ms: index as f64 * 40.0,
        frame: accounting.frame(index as i64 * 40_000, 40_000, image),
        params: CompositeParams::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_tasks_on_four_workers_arrive_in_order() {
    const TASKS: u64 = 10;
    let factory = renderer_factory(|| {
        Ok(Box::new(SkewedRenderer { frames: TASKS }) as Box<dyn FrameRenderer>)
    });
    let settings = PoolSettings {
        size: 4,
        task_timeout: Duration::from_secs(10),
        max_retries: 1,
        shutdown_timeout: Duration::from_secs(5),
    };
    let pool = Arc::new(WorkerPool::start(factory, settings).await.unwrap());
    let (reassembler, mut output) = FrameReassembler::new(TASKS as usize);
    let reassembler = Arc::new(reassembler);
    let accounting = FrameAccounting::new();
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for index in 0..TASKS {
        let pool = Arc::clone(&pool);
        let reassembler = Arc::clone(&reassembler);
        let cancel = cancel.clone();
        let task = task(&accounting, index);
        handles.push(tokio::spawn(async move {
            let result = pool.submit(task, &cancel).await.map_err(|r| r.error)?;
            reassembler.submit(index, result, &cancel).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(reassembler.finish().unwrap(), 0);

    let mut released = Vec::new();
    while let Some((index, result)) = output.recv().await {
        assert_eq!(result.frame_index, index);
        assert_eq!(result.image.pixel(0, 0)[0], index as u8);
        released.push(index);
    }
    assert_eq!(released, (0..TASKS).collect::<Vec<_>>());

    let stats = pool.stats();
    assert!(stats.peak_busy <= 4, "peak busy {}", stats.peak_busy);
    assert_eq!(stats.tasks_completed, TASKS);
    assert_eq!(accounting.outstanding(), 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_small_buffer_parks_until_order_catches_up() {
    let (reassembler, mut output) = FrameReassembler::new(2);
    let reassembler = Arc::new(reassembler);
    let cancel = CancellationToken::new();

    // Everything but frame 0 first; at most two fit in the buffer.
    let mut handles = Vec::new();
    for index in (1..6u64).rev() {
        let reassembler = Arc::clone(&reassembler);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            reassembler.submit(index, index * 10, &cancel).await
        }));
    }
    while reassembler.buffered() + reassembler.waiting() < 5 {
        tokio::task::yield_now().await;
    }
    assert!(reassembler.buffered() <= 2);

    reassembler.submit(0, 0, &cancel).await.unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    reassembler.finish().unwrap();

    let mut released = Vec::new();
    while let Some((index, value)) = output.recv().await {
        assert_eq!(value, index * 10);
        released.push(index);
    }
    assert_eq!(released, vec![0, 1, 2, 3, 4, 5]);
    assert!(reassembler.stats().peak_buffered <= 2);
}

#[tokio::test]
async fn test_submit_after_destroy_is_rejected() {
    let (reassembler, _output) = FrameReassembler::<u64>::new(4);
    reassembler.destroy();
    let cancel = CancellationToken::new();
    assert!(matches!(
        reassembler.submit(0, 0, &cancel).await,
        Err(PipelineError::Closed { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_arrival_order_releases_ascending(
        order in Just((0u64..24).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let released = runtime.block_on(async {
            let (reassembler, mut output) = FrameReassembler::new(order.len());
            let cancel = CancellationToken::new();
            for &index in &order {
                reassembler.submit(index, index, &cancel).await.unwrap();
            }
            reassembler.finish().unwrap();
            let mut released = Vec::new();
            while let Some((index, value)) = output.recv().await {
                assert_eq!(index, value);
                released.push(index);
            }
            released
        });
        prop_assert_eq!(released, (0u64..24).collect::<Vec<_>>());
    }
}
