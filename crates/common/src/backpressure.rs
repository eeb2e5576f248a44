//! FIFO wait primitives for the bounded queues in the pipeline.
//!
//! Every bounded structure (decoder queue, frame buffer, reassembler,
//! encode queue) keeps its own state behind a lock and parks callers in a
//! [`WaiterQueue`] stored inside that same lock, so the "is there space?"
//! check and the registration happen atomically and no wakeup is lost.
//! [`CapacityGate`] packages this for plain in-flight counters.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};

/// FIFO list of parked callers.
///
/// Not synchronized on its own; embed it in the owning component's locked
/// state.
#[derive(Debug, Default)]
pub struct WaiterQueue {
    waiters: VecDeque<oneshot::Sender<PipelineResult<()>>>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a new caller at the back of the queue.
    pub fn register(&mut self) -> oneshot::Receiver<PipelineResult<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        rx
    }

    /// Wake up to `n` callers in registration order.
    ///
    /// Callers that already gave up (dropped receiver) are skipped and do not
    /// count towards `n`. Returns the number actually woken.
    pub fn wake(&mut self, n: usize) -> usize {
        let mut woken = 0;
        while woken < n {
            match self.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(Ok(())).is_ok() {
                        woken += 1;
                    }
                }
                None => break,
            }
        }
        woken
    }

    /// Wake every parked caller successfully.
    pub fn wake_all(&mut self) -> usize {
        self.wake(usize::MAX)
    }

    /// Fail every parked caller with `err`.
    pub fn fail_all(&mut self, err: &PipelineError) -> usize {
        let mut failed = 0;
        for tx in self.waiters.drain(..) {
            if tx.send(Err(err.clone())).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Await a registration from a [`WaiterQueue`], observing cancellation.
///
/// A dropped sender means the owner went away without resolving us, which
/// is reported as `Closed { component }`.
pub async fn await_waiter(
    rx: oneshot::Receiver<PipelineResult<()>>,
    cancel: &CancellationToken,
    component: &'static str,
) -> PipelineResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = rx => match res {
            Ok(inner) => inner,
            Err(_) => Err(PipelineError::Closed { component }),
        },
    }
}

#[derive(Debug)]
struct GateState {
    in_flight: usize,
    peak: usize,
    waiters: WaiterQueue,
    failure: Option<PipelineError>,
}

/// Bounded in-flight counter with FIFO space waiters.
///
/// `try_acquire` never exceeds `max`; `release` frees one slot and wakes
/// the longest-waiting caller. A recorded failure is sticky: every later
/// wait or acquire observes it until [`CapacityGate::reset`].
#[derive(Debug)]
pub struct CapacityGate {
    name: &'static str,
    max: usize,
    state: Mutex<GateState>,
}

impl CapacityGate {
    /// Create a gate named `name` holding at most `max` slots.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero.
    pub fn new(name: &'static str, max: usize) -> Self {
        assert!(max > 0, "capacity gate {name} needs max > 0");
        Self {
            name,
            max,
            state: Mutex::new(GateState {
                in_flight: 0,
                peak: 0,
                waiters: WaiterQueue::new(),
                failure: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether a slot is free and no failure is recorded.
    pub fn has_space(&self) -> bool {
        let state = self.state.lock();
        state.failure.is_none() && state.in_flight < self.max
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        if state.in_flight >= self.max {
            return Err(PipelineError::QueueFull { queue: self.name });
        }
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        Ok(())
    }

    /// Free one slot and wake the next waiter.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.in_flight == 0 {
            tracing::warn!(gate = self.name, "release without matching acquire");
            return;
        }
        state.in_flight -= 1;
        state.waiters.wake(1);
    }

    /// Suspend until a slot is free, in FIFO order relative to other callers.
    ///
    /// Resolving does not reserve the slot; callers follow up with
    /// [`CapacityGate::try_acquire`].
    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(err) = &state.failure {
                return Err(err.clone());
            }
            if state.in_flight < self.max && state.waiters.is_empty() {
                return Ok(());
            }
            state.waiters.register()
        };
        await_waiter(rx, cancel, self.name).await
    }

    /// Record a sticky failure and fail all waiters with it.
    pub fn fail(&self, err: PipelineError) {
        let mut state = self.state.lock();
        state.waiters.fail_all(&err);
        if state.failure.is_none() {
            state.failure = Some(err);
        }
    }

    /// The recorded failure, if any.
    pub fn failure(&self) -> Option<PipelineError> {
        self.state.lock().failure.clone()
    }

    /// Drop all in-flight slots, clear any failure, and fail current waiters
    /// with `err` so no caller stays parked across the reset.
    pub fn reset(&self, err: PipelineError) {
        let mut state = self.state.lock();
        state.waiters.fail_all(&err);
        state.in_flight = 0;
        state.failure = None;
    }
}
