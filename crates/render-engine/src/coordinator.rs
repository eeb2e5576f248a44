//! Render coordination: frame source -> renderer -> reassembler.
//!
//! Frames are fetched from the source one request at a time, rendered
//! either on the worker pool or directly on a blocking thread, and pushed
//! into the reassembler whose output is strictly ordered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grabme_common::config::PipelineConfig;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_project_model::composite::CompositeSource;

use crate::reassembler::{FrameReassembler, ReassemblerStats};
use crate::source::{FrameSource, SourceStats};
use crate::worker_pool::{
    FrameRenderer, PoolRejection, PoolSettings, PoolStats, RenderResult, RenderTask,
    RendererFactory, WorkerPool,
};

const COMPONENT: &str = "render coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    Parallel,
    Direct,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub mode: RenderMode,
    pub frames_rendered: u64,
    pub direct_renders: u64,
    /// Tasks that fell back to direct rendering after a pool failure.
    pub pool_fallbacks: u64,
    pub source: SourceStats,
    pub pool: Option<PoolStats>,
    pub reassembler: ReassemblerStats,
}

type OrderedOutput = mpsc::UnboundedReceiver<(u64, RenderResult)>;

pub struct RenderCoordinator {
    source: Arc<dyn FrameSource>,
    composite: Arc<dyn CompositeSource>,
    factory: Arc<dyn RendererFactory>,
    pool: Option<WorkerPool>,
    /// Set once the pool gave up on a task; later frames render directly.
    pool_exhausted: AtomicBool,
    direct: Arc<Mutex<Option<Box<dyn FrameRenderer>>>>,
    reassembler: FrameReassembler<RenderResult>,
    output: Mutex<Option<OrderedOutput>>,
    cancel: CancellationToken,
    frames_rendered: AtomicU64,
    direct_renders: AtomicU64,
    pool_fallbacks: AtomicU64,
    destroyed: AtomicBool,
}

impl RenderCoordinator {
    /// Build a coordinator over an initialized `source`.
    ///
    /// With `parallel_render` enabled the worker pool is started; if that
    /// fails, rendering runs directly and a warning is logged.
    pub async fn new(
        source: Arc<dyn FrameSource>,
        composite: Arc<dyn CompositeSource>,
        factory: Arc<dyn RendererFactory>,
        config: &PipelineConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let pool = if config.parallel_render {
            match WorkerPool::start(Arc::clone(&factory), PoolSettings::from(config)).await {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!(error = %err, "Worker pool unavailable, rendering directly");
                    None
                }
            }
        } else {
            None
        };

        let (reassembler, output) = FrameReassembler::new(config.reassembly_capacity);
        let coordinator = Self {
            source,
            composite,
            factory,
            pool,
            pool_exhausted: AtomicBool::new(false),
            direct: Arc::new(Mutex::new(None)),
            reassembler,
            output: Mutex::new(Some(output)),
            cancel: cancel.child_token(),
            frames_rendered: AtomicU64::new(0),
            direct_renders: AtomicU64::new(0),
            pool_fallbacks: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        };
        info!(
            mode = ?coordinator.mode(),
            source = %coordinator.source.mode(),
            "Render coordinator ready"
        );
        coordinator
    }

    pub fn mode(&self) -> RenderMode {
        if self.pool.is_some() && !self.pool_exhausted.load(Ordering::Acquire) {
            RenderMode::Parallel
        } else {
            RenderMode::Direct
        }
    }

    /// The ordered output stream. Can be taken once.
    pub fn take_output(&self) -> Option<OrderedOutput> {
        self.output.lock().take()
    }

    fn check_open(&self) -> PipelineResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed {
                component: COMPONENT,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Fetch the frame for `index` and attach its composite parameters.
    ///
    /// Calls should be made in ascending index order; the source serves
    /// one request at a time.
    pub async fn prepare_task(&self, index: u64, effective_time_ms: f64) -> PipelineResult<RenderTask> {
        self.check_open()?;
        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            frame = self.source.get_frame(index, effective_time_ms) => frame?,
        };
        Ok(RenderTask {
            frame_index: index,
            source_time_ms: frame.timestamp_ms(),
            effective_time_ms,
            params: self.composite.params_at(effective_time_ms),
            frame,
        })
    }

    /// Render a prepared task on the pool, or directly.
    pub async fn render_task(&self, task: RenderTask) -> PipelineResult<RenderResult> {
        self.check_open()?;
        let index = task.frame_index;
        let effective_time_ms = task.effective_time_ms;

        let result = match &self.pool {
            Some(pool) if !self.pool_exhausted.load(Ordering::Acquire) => {
                match pool.submit(task, &self.cancel).await {
                    Ok(result) => result,
                    Err(PoolRejection {
                        error: error @ PipelineError::WorkerCrash { .. },
                        task,
                    }) => {
                        if !self.pool_exhausted.swap(true, Ordering::AcqRel) {
                            warn!(
                                frame_index = index,
                                error = %error,
                                "Worker pool exhausted, rendering remaining frames directly"
                            );
                        }
                        self.pool_fallbacks.fetch_add(1, Ordering::Relaxed);
                        let task = match task {
                            Some(task) => task,
                            // Lost with the timed-out worker: fetch it again.
                            None => self.prepare_task(index, effective_time_ms).await?,
                        };
                        self.render_direct(task).await?
                    }
                    Err(rejection) => return Err(rejection.error),
                }
            }
            _ => self.render_direct(task).await?,
        };

        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Render `task` on a blocking thread with the coordinator's own
    /// renderer, created on first use.
    async fn render_direct(&self, task: RenderTask) -> PipelineResult<RenderResult> {
        let renderer = Arc::clone(&self.direct);
        let factory = Arc::clone(&self.factory);
        let index = task.frame_index;
        let handle = tokio::task::spawn_blocking(move || -> PipelineResult<RenderResult> {
            let mut slot = renderer.lock();
            if slot.is_none() {
                *slot = Some(factory.create()?);
            }
            let Some(renderer) = slot.as_mut() else {
                return Err(PipelineError::Closed {
                    component: "direct renderer",
                });
            };
            let started = Instant::now();
            let image = renderer.render(&task)?;
            Ok(RenderResult {
                frame_index: task.frame_index,
                image,
                render_latency: started.elapsed(),
            })
        });

        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            joined = handle => joined,
        };
        self.direct_renders.fetch_add(1, Ordering::Relaxed);
        match joined {
            Ok(result) => result,
            Err(err) => {
                // Never reuse a renderer that panicked mid-frame.
                self.direct.lock().take();
                Err(anyhow::anyhow!("direct render of frame {index} failed: {err}").into())
            }
        }
    }

    /// Render a prepared task and hand the result to the reassembler.
    pub async fn submit_task(&self, task: RenderTask) -> PipelineResult<()> {
        let index = task.frame_index;
        let result = self.render_task(task).await?;
        self.reassembler.submit(index, result, &self.cancel).await
    }

    /// Fetch and render one frame without reassembly.
    pub async fn render_frame(&self, index: u64, effective_time_ms: f64) -> PipelineResult<RenderResult> {
        let task = self.prepare_task(index, effective_time_ms).await?;
        self.render_task(task).await
    }

    /// Fetch, render, and reassemble one frame.
    pub async fn submit_frame(&self, index: u64, effective_time_ms: f64) -> PipelineResult<()> {
        let task = self.prepare_task(index, effective_time_ms).await?;
        self.submit_task(task).await
    }

    /// Flush the reassembler and close the ordered output.
    pub fn finish(&self) -> PipelineResult<usize> {
        let released = self.reassembler.finish()?;
        debug!(released, "Render coordinator finished");
        Ok(released)
    }

    /// Cancel every in-flight wait. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.reassembler.destroy();
    }

    /// Cancel, then release the pool, the source, and the direct renderer.
    /// Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel();
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        self.source.destroy();
        self.direct.lock().take();
        info!("Render coordinator destroyed");
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            mode: self.mode(),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            direct_renders: self.direct_renders.load(Ordering::Relaxed),
            pool_fallbacks: self.pool_fallbacks.load(Ordering::Relaxed),
            source: self.source.stats(),
            pool: self.pool.as_ref().map(WorkerPool::stats),
            reassembler: self.reassembler.stats(),
        }
    }
}

impl Drop for RenderCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.source.destroy();
    }
}
