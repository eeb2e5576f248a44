//! Fixed-size pool of render workers.
//!
//! Every worker is an OS thread that owns its renderer. Tasks go in over a
//! crossbeam channel and come back over a oneshot, always by move, so a
//! worker never touches shared frame memory. A panicking renderer hands its
//! task back, the worker is replaced, and the task is retried on the fresh
//! one.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grabme_common::config::PipelineConfig;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_common::stats::LatencyStats;
use grabme_decode::{DecodedFrame, RgbaImage};
use grabme_project_model::composite::CompositeParams;

const COMPONENT: &str = "worker pool";

/// One output frame to render.
#[derive(Debug)]
pub struct RenderTask {
    pub frame_index: u64,
    pub source_time_ms: f64,
    pub effective_time_ms: f64,
    pub frame: DecodedFrame,
    pub params: CompositeParams,
}

/// A rendered output frame.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub frame_index: u64,
    pub image: RgbaImage,
    pub render_latency: Duration,
}

/// Turns a decoded frame plus composite parameters into an output image.
///
/// A renderer lives on exactly one worker thread and may keep scratch
/// buffers between calls.
pub trait FrameRenderer: Send {
    fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage>;
}

/// Builds one renderer per worker.
pub trait RendererFactory: Send + Sync {
    fn create(&self) -> PipelineResult<Box<dyn FrameRenderer>>;
}

impl<F> RendererFactory for F
where
    F: Fn() -> PipelineResult<Box<dyn FrameRenderer>> + Send + Sync,
{
    fn create(&self) -> PipelineResult<Box<dyn FrameRenderer>> {
        self()
    }
}

/// Wrap a closure as a shared [`RendererFactory`].
pub fn renderer_factory<F>(create: F) -> Arc<dyn RendererFactory>
where
    F: Fn() -> PipelineResult<Box<dyn FrameRenderer>> + Send + Sync + 'static,
{
    Arc::new(create)
}

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub task_timeout: Duration,
    pub max_retries: u32,
    pub shutdown_timeout: Duration,
}

impl From<&PipelineConfig> for PoolSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            size: config.effective_workers(),
            task_timeout: config.worker_task_timeout(),
            max_retries: config.worker_max_retries,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Error,
    Terminated,
}

/// Pool counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub live: usize,
    pub busy: usize,
    pub peak_busy: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub crashes: u64,
    pub respawns: u64,
    pub render_latency: LatencyStats,
    pub workers: Vec<WorkerState>,
}

/// A task the pool could not complete.
///
/// `task` is handed back whenever the pool still had it (crash retries
/// exhausted, renderer error, pool closed); a timed-out task is lost.
#[derive(Debug)]
pub struct PoolRejection {
    pub error: PipelineError,
    pub task: Option<RenderTask>,
}

struct Job {
    task: RenderTask,
    reply: oneshot::Sender<Reply>,
}

enum Reply {
    Rendered {
        task: RenderTask,
        result: PipelineResult<RgbaImage>,
        latency: Duration,
    },
    Panicked {
        task: RenderTask,
        message: String,
    },
}

struct Worker {
    slot: usize,
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

enum Attempt {
    Done(RenderResult),
    Failed {
        error: PipelineError,
        task: RenderTask,
    },
    Crashed {
        slot: usize,
        message: String,
        task: Option<RenderTask>,
    },
}

struct PoolState {
    /// Ready workers. Non-empty only while nobody waits.
    idle: VecDeque<Worker>,
    waiters: VecDeque<oneshot::Sender<Worker>>,
    workers: Vec<WorkerState>,
    live: usize,
    busy: usize,
    accepting: bool,
    shut_down: bool,
    failure: Option<PipelineError>,
    stats: PoolStats,
}

struct Shared {
    factory: Arc<dyn RendererFactory>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    drained: Notify,
}

/// Fixed-size render worker pool.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "renderer panicked".to_string()
    }
}

fn worker_loop(mut renderer: Box<dyn FrameRenderer>, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| renderer.render(&job.task)));
        match outcome {
            Ok(result) => {
                let _ = job.reply.send(Reply::Rendered {
                    task: job.task,
                    result,
                    latency: started.elapsed(),
                });
            }
            Err(payload) => {
                let _ = job.reply.send(Reply::Panicked {
                    task: job.task,
                    message: panic_message(payload),
                });
                // The renderer may be half-updated; the pool replaces us.
                return;
            }
        }
    }
}

async fn spawn_worker(slot: usize, factory: Arc<dyn RendererFactory>) -> PipelineResult<Worker> {
    let (jobs_tx, jobs_rx) = crossbeam_channel::bounded::<Job>(1);
    let (ready_tx, ready_rx) = oneshot::channel::<PipelineResult<()>>();

    let thread = std::thread::Builder::new()
        .name(format!("render-worker-{slot}"))
        .spawn(move || {
            let renderer = match catch_unwind(AssertUnwindSafe(|| factory.create())) {
                Ok(Ok(renderer)) => renderer,
                Ok(Err(err)) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
                Err(payload) => {
                    let _ = ready_tx.send(Err(PipelineError::worker_crash(
                        slot,
                        panic_message(payload),
                    )));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            worker_loop(renderer, jobs_rx);
        })?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(Worker {
            slot,
            jobs: jobs_tx,
            thread,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(PipelineError::worker_crash(
            slot,
            "worker exited during startup",
        )),
    }
}

impl Shared {
    fn acquire_now(&self, state: &mut PoolState) -> Option<Worker> {
        let worker = state.idle.pop_front()?;
        state.workers[worker.slot] = WorkerState::Busy;
        state.busy += 1;
        state.stats.peak_busy = state.stats.peak_busy.max(state.busy);
        Some(worker)
    }

    /// Wait for a Ready worker, first come first served.
    async fn acquire(&self, cancel: &CancellationToken) -> PipelineResult<Worker> {
        let mut rx = {
            let mut state = self.state.lock();
            if let Some(err) = &state.failure {
                return Err(err.clone());
            }
            if !state.accepting {
                return Err(PipelineError::Closed {
                    component: COMPONENT,
                });
            }
            if let Some(worker) = self.acquire_now(&mut state) {
                return Ok(worker);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                rx.close();
                // A worker handed over just before cancellation goes back.
                if let Ok(worker) = rx.try_recv() {
                    self.release(worker);
                }
                Err(PipelineError::Cancelled)
            }
            received = &mut rx => match received {
                Ok(worker) => Ok(worker),
                Err(_) => Err(self.state.lock().failure.clone().unwrap_or(
                    PipelineError::Closed { component: COMPONENT },
                )),
            },
        }
    }

    /// Return a healthy worker: to the oldest waiter, else to the idle list.
    fn release(&self, worker: Worker) {
        let mut state = self.state.lock();
        if !state.accepting {
            state.busy = state.busy.saturating_sub(1);
            state.workers[worker.slot] = WorkerState::Terminated;
            state.live = state.live.saturating_sub(1);
            drop(state);
            drop(worker);
            self.drained.notify_waiters();
            return;
        }

        let mut worker = worker;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(worker) {
                // The waiter now owns the worker; it stays Busy.
                Ok(()) => return,
                Err(returned) => worker = returned,
            }
        }
        state.busy = state.busy.saturating_sub(1);
        state.workers[worker.slot] = WorkerState::Ready;
        state.idle.push_back(worker);
        drop(state);
        self.drained.notify_waiters();
    }

    /// Discard a failed worker and spawn a fresh one in its slot.
    async fn replace(&self, worker: Worker) {
        let slot = worker.slot;
        {
            let mut state = self.state.lock();
            state.busy = state.busy.saturating_sub(1);
            state.stats.crashes += 1;
            if !state.accepting {
                state.workers[slot] = WorkerState::Terminated;
                state.live = state.live.saturating_sub(1);
                drop(state);
                self.drained.notify_waiters();
                return;
            }
            state.workers[slot] = WorkerState::Error;
        }
        // Dropping the sender ends the old thread once it is done.
        drop(worker);
        self.state.lock().workers[slot] = WorkerState::Spawning;

        match spawn_worker(slot, Arc::clone(&self.factory)).await {
            Ok(fresh) => {
                {
                    let mut state = self.state.lock();
                    state.stats.respawns += 1;
                    state.busy += 1;
                    state.workers[slot] = WorkerState::Busy;
                }
                debug!(slot, "Render worker respawned");
                self.release(fresh);
            }
            Err(err) => {
                warn!(slot, error = %err, "Failed to respawn render worker");
                let mut state = self.state.lock();
                // The slot stays dead until shutdown.
                state.workers[slot] = WorkerState::Error;
                state.live = state.live.saturating_sub(1);
                if state.live == 0 {
                    state.failure = Some(err);
                    state.waiters.clear();
                }
                drop(state);
                self.drained.notify_waiters();
            }
        }
    }

    async fn run_on(self: Arc<Self>, worker: Worker, task: RenderTask) -> Attempt {
        let slot = worker.slot;
        let (reply, rx) = oneshot::channel();
        if let Err(err) = worker.jobs.try_send(Job { task, reply }) {
            let job = match err {
                TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
            };
            self.replace(worker).await;
            return Attempt::Crashed {
                slot,
                message: "worker thread is gone".to_string(),
                task: Some(job.task),
            };
        }

        let timeout = self.settings.task_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Reply::Rendered {
                task,
                result,
                latency,
            })) => {
                {
                    let mut state = self.state.lock();
                    if result.is_ok() {
                        state.stats.tasks_completed += 1;
                        state.stats.render_latency.record(latency);
                    } else {
                        state.stats.tasks_failed += 1;
                    }
                }
                self.release(worker);
                match result {
                    Ok(image) => Attempt::Done(RenderResult {
                        frame_index: task.frame_index,
                        image,
                        render_latency: latency,
                    }),
                    Err(error) => Attempt::Failed { error, task },
                }
            }
            Ok(Ok(Reply::Panicked { task, message })) => {
                self.replace(worker).await;
                Attempt::Crashed {
                    slot,
                    message,
                    task: Some(task),
                }
            }
            Ok(Err(_)) => {
                self.replace(worker).await;
                Attempt::Crashed {
                    slot,
                    message: "worker exited without replying".to_string(),
                    task: None,
                }
            }
            Err(_) => {
                warn!(slot, ?timeout, "Render task timed out, replacing worker");
                self.replace(worker).await;
                Attempt::Crashed {
                    slot,
                    message: format!("render timed out after {timeout:?}"),
                    task: None,
                }
            }
        }
    }
}

impl WorkerPool {
    /// Spawn `settings.size` workers and wait until each has its renderer.
    pub async fn start(
        factory: Arc<dyn RendererFactory>,
        settings: PoolSettings,
    ) -> PipelineResult<Self> {
        if settings.size == 0 {
            return Err(PipelineError::config("worker pool needs at least one worker"));
        }

        let mut idle = VecDeque::with_capacity(settings.size);
        for slot in 0..settings.size {
            // On error the already-spawned workers are dropped and exit.
            idle.push_back(spawn_worker(slot, Arc::clone(&factory)).await?);
        }

        info!(workers = settings.size, "Render worker pool started");
        let size = settings.size;
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                settings,
                state: Mutex::new(PoolState {
                    idle,
                    waiters: VecDeque::new(),
                    workers: vec![WorkerState::Ready; size],
                    live: size,
                    busy: 0,
                    accepting: true,
                    shut_down: false,
                    failure: None,
                    stats: PoolStats {
                        size,
                        ..PoolStats::default()
                    },
                }),
                drained: Notify::new(),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.settings.size
    }

    /// Render `task` on the next free worker.
    ///
    /// Crashed attempts are retried on a fresh worker up to `max_retries`
    /// times before the task is handed back with `WorkerCrash`.
    pub async fn submit(
        &self,
        task: RenderTask,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, PoolRejection> {
        let mut task = task;
        let mut crashes = 0u32;
        loop {
            let worker = match self.shared.acquire(cancel).await {
                Ok(worker) => worker,
                Err(error) => {
                    return Err(PoolRejection {
                        error,
                        task: Some(task),
                    })
                }
            };

            // The attempt owns the worker, so a cancelled caller never
            // strands it mid-render.
            let frame_index = task.frame_index;
            let attempt = tokio::spawn(Arc::clone(&self.shared).run_on(worker, task));
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PoolRejection { error: PipelineError::Cancelled, task: None });
                }
                joined = attempt => match joined {
                    Ok(attempt) => attempt,
                    Err(err) => {
                        return Err(PoolRejection {
                            error: anyhow::anyhow!("render attempt for frame {frame_index} aborted: {err}").into(),
                            task: None,
                        });
                    }
                },
            };

            match attempt {
                Attempt::Done(result) => return Ok(result),
                Attempt::Failed { error, task } => {
                    return Err(PoolRejection {
                        error,
                        task: Some(task),
                    })
                }
                Attempt::Crashed {
                    slot,
                    message,
                    task: Some(returned),
                } => {
                    crashes += 1;
                    warn!(slot, frame_index, crashes, %message, "Render worker crashed");
                    if crashes > self.shared.settings.max_retries {
                        return Err(PoolRejection {
                            error: PipelineError::worker_crash(slot, message),
                            task: Some(returned),
                        });
                    }
                    task = returned;
                }
                Attempt::Crashed {
                    slot,
                    message,
                    task: None,
                } => {
                    return Err(PoolRejection {
                        error: PipelineError::worker_crash(slot, message),
                        task: None,
                    })
                }
            }
        }
    }

    /// Stop accepting work, let in-flight tasks finish (bounded by the
    /// shutdown timeout), then terminate every worker. Idempotent.
    pub async fn shutdown(&self) {
        let idle: Vec<Worker> = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.accepting = false;
            state.waiters.clear();
            let idle: Vec<Worker> = state.idle.drain(..).collect();
            for worker in &idle {
                state.workers[worker.slot] = WorkerState::Terminated;
            }
            for slot in state.workers.iter_mut() {
                if *slot == WorkerState::Error {
                    *slot = WorkerState::Terminated;
                }
            }
            state.live = state.live.saturating_sub(idle.len());
            idle
        };

        let timeout = self.shared.settings.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.shared.drained.notified();
            let busy = self.shared.state.lock().busy;
            if busy == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(busy, ?timeout, "Render workers still busy at shutdown");
                break;
            }
        }

        let threads: Vec<JoinHandle<()>> = idle
            .into_iter()
            .map(|worker| {
                let Worker { jobs, thread, .. } = worker;
                drop(jobs);
                thread
            })
            .collect();
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        });
        if tokio::time::timeout(timeout, joined).await.is_err() {
            warn!("Timed out joining render worker threads");
        }
        info!("Render worker pool shut down");
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().accepting
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            live: state.live,
            busy: state.busy,
            workers: state.workers.clone(),
            ..state.stats.clone()
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.accepting = false;
        state.waiters.clear();
        // Closing the job channels lets idle threads exit on their own.
        state.idle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use grabme_decode::FrameAccounting;

    struct SolidRenderer {
        color: [u8; 4],
    }

    impl FrameRenderer for SolidRenderer {
        fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
            RgbaImage::filled(task.frame.width(), task.frame.height(), self.color)
        }
    }

    struct PanicRenderer;

    impl FrameRenderer for PanicRenderer {
        fn render(&mut self, _task: &RenderTask) -> PipelineResult<RgbaImage> {
            panic!("compositor blew up");
        }
    }

    fn settings(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            task_timeout: Duration::from_secs(5),
            max_retries: 2,
            shutdown_timeout: Duration::from_secs(2),
        }
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

    #[tokio::test]
    async fn test_submit_renders_and_releases_input() {
        let factory = renderer_factory(|| {
            Ok(Box::new(SolidRenderer {
                color: [9, 8, 7, 255],
            }) as Box<dyn FrameRenderer>)
        });
        let pool = WorkerPool::start(factory, settings(2)).await.unwrap();
        let accounting = FrameAccounting::new();
        let cancel = CancellationToken::new();

        let result = pool.submit(task(&accounting, 3), &cancel).await.unwrap();
        assert_eq!(result.frame_index, 3);
        assert_eq!(result.image.pixel(1, 1), [9, 8, 7, 255]);
        assert_eq!(accounting.outstanding(), 0);

        let stats = pool.stats();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.busy, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_retries_then_hands_task_back() {
        let factory =
            renderer_factory(|| Ok(Box::new(PanicRenderer) as Box<dyn FrameRenderer>));
        let pool = WorkerPool::start(factory, settings(1)).await.unwrap();
        let accounting = FrameAccounting::new();
        let cancel = CancellationToken::new();

        let rejection = pool.submit(task(&accounting, 5), &cancel).await.unwrap_err();
        assert!(matches!(rejection.error, PipelineError::WorkerCrash { .. }));
        let returned = rejection.task.expect("task handed back");
        assert_eq!(returned.frame_index, 5);

        let stats = pool.stats();
        // First attempt plus two retries.
        assert_eq!(stats.crashes, 3);
        assert_eq!(stats.respawns, 3);
        assert_eq!(stats.live, 1);
        drop(returned);
        assert_eq!(accounting.outstanding(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_respawn_leaves_slot_in_error() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = renderer_factory(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::new(PanicRenderer) as Box<dyn FrameRenderer>)
            } else {
                Err(PipelineError::config("renderer resources gone"))
            }
        });
        let pool = WorkerPool::start(factory, settings(1)).await.unwrap();
        let accounting = FrameAccounting::new();

        let rejection = pool
            .submit(task(&accounting, 0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(rejection.task.is_some());
        let stats = pool.stats();
        assert_eq!(stats.workers, vec![WorkerState::Error]);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.crashes, 1);

        pool.shutdown().await;
        assert_eq!(pool.stats().workers, vec![WorkerState::Terminated]);
    }

    #[tokio::test]
    async fn test_crash_recovers_on_fresh_worker() {
        // Every renderer panics on its first task only.
        let created = Arc::new(AtomicUsize::new(0));
        struct FlakyRenderer {
            first: bool,
        }
        impl FrameRenderer for FlakyRenderer {
            fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
                if self.first {
                    panic!("first render fails");
                }
                RgbaImage::filled(task.frame.width(), task.frame.height(), [1, 1, 1, 255])
            }
        }
        let counter = created.clone();
        let factory = renderer_factory(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyRenderer { first: n == 0 }) as Box<dyn FrameRenderer>)
        });
        let pool = WorkerPool::start(factory, settings(1)).await.unwrap();
        let accounting = FrameAccounting::new();

        let result = pool
            .submit(task(&accounting, 0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.frame_index, 0);
        assert_eq!(pool.stats().crashes, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiters_get_workers_in_fifo_order() {
        let factory = renderer_factory(|| {
            struct Slow;
            impl FrameRenderer for Slow {
                fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
                    std::thread::sleep(Duration::from_millis(20));
                    RgbaImage::filled(task.frame.width(), task.frame.height(), [0; 4])
                }
            }
            Ok(Box::new(Slow) as Box<dyn FrameRenderer>)
        });
        let pool = Arc::new(WorkerPool::start(factory, settings(1)).await.unwrap());
        let accounting = FrameAccounting::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..4u64 {
            let submitter = pool.clone();
            let order = order.clone();
            let task = task(&accounting, index);
            handles.push(tokio::spawn(async move {
                let result = submitter.submit(task, &CancellationToken::new()).await.unwrap();
                order.lock().push(result.frame_index);
            }));
            // Serialize registration so FIFO order is observable.
            while {
                let state = pool.shared.state.lock();
                state.busy + state.waiters.len() < index as usize + 1
            } {
                tokio::task::yield_now().await;
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_factory_failure_fails_start() {
        let factory =
            renderer_factory(|| Err(PipelineError::config("no renderer for you")));
        let err = WorkerPool::start(factory, settings(2)).await.err().unwrap();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_new_work() {
        let factory = renderer_factory(|| {
            Ok(Box::new(SolidRenderer { color: [0; 4] }) as Box<dyn FrameRenderer>)
        });
        let pool = WorkerPool::start(factory, settings(2)).await.unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(!pool.is_accepting());
        assert!(pool
            .stats()
            .workers
            .iter()
            .all(|state| *state == WorkerState::Terminated));

        let accounting = FrameAccounting::new();
        let rejection = pool
            .submit(task(&accounting, 0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(rejection.error, PipelineError::Closed { .. }));
        assert!(rejection.task.is_some());
    }
}
