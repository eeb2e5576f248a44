//! Restores frame order after parallel rendering.
//!
//! Results arrive in any order; the reassembler emits them strictly by
//! index on an mpsc channel. Out-of-order results are buffered up to a
//! fixed capacity. A non-next submission against a full buffer parks the
//! submitter until released frames free a slot. The next expected index is
//! always accepted, so the stream can never wedge on a full buffer.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use grabme_common::backpressure::{await_waiter, WaiterQueue};
use grabme_common::error::{PipelineError, PipelineResult};

const COMPONENT: &str = "reassembler";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblerStats {
    pub next_expected: u64,
    pub released: u64,
    /// Release calls that emitted more than one item.
    pub batches: u64,
    pub buffered: usize,
    pub peak_buffered: usize,
    /// Indices skipped by `flush`.
    pub gaps: u64,
    pub rejected: u64,
}

struct State<T> {
    next_expected: u64,
    pending: BTreeMap<u64, T>,
    waiters: WaiterQueue,
    output: Option<mpsc::UnboundedSender<(u64, T)>>,
    closed: bool,
    stats: ReassemblerStats,
}

impl<T> State<T> {
    fn emit(&mut self, index: u64, item: T) -> PipelineResult<()> {
        let output = self.output.as_ref().ok_or(PipelineError::Closed {
            component: COMPONENT,
        })?;
        output.send((index, item)).map_err(|_| PipelineError::Closed {
            component: "reassembler output",
        })?;
        self.stats.released += 1;
        Ok(())
    }

    /// Emit `first` and every buffered successor. Returns how many
    /// buffered entries were freed.
    fn release_run(&mut self, index: u64, first: T) -> PipelineResult<usize> {
        self.emit(index, first)?;
        self.next_expected = index + 1;
        let mut freed = 0;
        while let Some(item) = self.pending.remove(&self.next_expected) {
            let index = self.next_expected;
            self.emit(index, item)?;
            self.next_expected += 1;
            freed += 1;
        }
        if freed > 0 {
            self.stats.batches += 1;
        }
        Ok(freed)
    }
}

/// Bounded ordering buffer.
pub struct FrameReassembler<T> {
    capacity: usize,
    state: Mutex<State<T>>,
}

impl<T: Send> FrameReassembler<T> {
    /// Create a reassembler plus the receiving end of its ordered output.
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<(u64, T)>) {
        Self::starting_at(capacity, 0)
    }

    /// Like [`FrameReassembler::new`] with a first index other than zero.
    pub fn starting_at(capacity: usize, first: u64) -> (Self, mpsc::UnboundedReceiver<(u64, T)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reassembler = Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                next_expected: first,
                pending: BTreeMap::new(),
                waiters: WaiterQueue::new(),
                output: Some(tx),
                closed: false,
                stats: ReassemblerStats {
                    next_expected: first,
                    ..ReassemblerStats::default()
                },
            }),
        };
        (reassembler, rx)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn next_expected(&self) -> u64 {
        self.state.lock().next_expected
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Hand over the result for `index`.
    ///
    /// Duplicate or already released indices are rejected. Waits while the
    /// buffer is full unless `index` is the next one expected.
    pub async fn submit(&self, index: u64, item: T, cancel: &CancellationToken) -> PipelineResult<()> {
        let mut item = Some(item);
        let mut woken = false;
        loop {
            let rx = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PipelineError::Closed {
                        component: COMPONENT,
                    });
                }
                if index < state.next_expected || state.pending.contains_key(&index) {
                    state.stats.rejected += 1;
                    return Err(PipelineError::config(format!(
                        "frame {index} was already submitted to the reassembler"
                    )));
                }
                let Some(value) = item.take() else {
                    return Err(PipelineError::Closed {
                        component: COMPONENT,
                    });
                };

                if index == state.next_expected {
                    state.release_run(index, value)?;
                    // The new next index may be among the parked.
                    state.waiters.wake_all();
                    return Ok(());
                }

                // A woken waiter goes ahead of anyone who queued after it.
                let fifo_clear = woken || state.waiters.is_empty();
                if state.pending.len() < self.capacity && fifo_clear {
                    state.pending.insert(index, value);
                    let buffered = state.pending.len();
                    state.stats.peak_buffered = state.stats.peak_buffered.max(buffered);
                    return Ok(());
                }

                item = Some(value);
                state.waiters.register()
            };
            await_waiter(rx, cancel, COMPONENT).await?;
            woken = true;
        }
    }

    /// Release everything still buffered, in ascending order.
    ///
    /// Missing indices in front of or between buffered entries are reported
    /// as gaps and skipped. Returns the number of items released.
    pub fn flush(&self) -> PipelineResult<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PipelineError::Closed {
                component: COMPONENT,
            });
        }
        let pending = std::mem::take(&mut state.pending);
        let mut released = 0;
        for (index, item) in pending {
            if index > state.next_expected {
                let missing = index - state.next_expected;
                warn!(
                    expected = state.next_expected,
                    found = index,
                    missing,
                    "Gap in reassembled frame stream"
                );
                state.stats.gaps += missing;
            }
            state.emit(index, item)?;
            state.next_expected = index + 1;
            released += 1;
        }
        state.waiters.wake_all();
        Ok(released)
    }

    /// Flush and end the output stream. Idempotent.
    pub fn finish(&self) -> PipelineResult<usize> {
        if self.state.lock().closed {
            return Ok(0);
        }
        let released = self.flush()?;
        let mut state = self.state.lock();
        state.closed = true;
        state.output = None;
        state.waiters.fail_all(&PipelineError::Closed {
            component: COMPONENT,
        });
        debug!(next_expected = state.next_expected, "Reassembler finished");
        Ok(released)
    }

    /// Drop everything buffered, fail parked submitters, and end the
    /// output stream. Idempotent.
    pub fn destroy(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed && state.output.is_none() && state.pending.is_empty() {
                return;
            }
            state.closed = true;
            state.output = None;
            state.waiters.fail_all(&PipelineError::Closed {
                component: COMPONENT,
            });
            std::mem::take(&mut state.pending)
        };
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "Reassembler destroyed with buffered results");
        }
    }

    pub fn stats(&self) -> ReassemblerStats {
        let state = self.state.lock();
        ReassemblerStats {
            next_expected: state.next_expected,
            buffered: state.pending.len(),
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<(u64, T)>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok((index, _)) = rx.try_recv() {
            out.push(index);
        }
        out
    }

    #[tokio::test]
    async fn test_out_of_order_pair_releases_together() {
        let (reassembler, mut rx) = FrameReassembler::new(32);
        let cancel = CancellationToken::new();

        reassembler.submit(1, "b", &cancel).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(reassembler.buffered(), 1);

        reassembler.submit(0, "a", &cancel).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), (0, "a"));
        assert_eq!(rx.try_recv().unwrap(), (1, "b"));
        assert_eq!(reassembler.next_expected(), 2);
        assert_eq!(reassembler.stats().batches, 1);
    }

    #[tokio::test]
    async fn test_duplicates_and_released_indices_are_rejected() {
        let (reassembler, _rx) = FrameReassembler::new(4);
        let cancel = CancellationToken::new();
        reassembler.submit(0, (), &cancel).await.unwrap();
        reassembler.submit(2, (), &cancel).await.unwrap();

        assert!(reassembler.submit(0, (), &cancel).await.is_err());
        assert!(reassembler.submit(2, (), &cancel).await.is_err());
        assert_eq!(reassembler.stats().rejected, 2);
    }

    #[tokio::test]
    async fn test_full_buffer_parks_submitter_until_drained() {
        let (reassembler, mut rx) = FrameReassembler::new(2);
        let reassembler = Arc::new(reassembler);
        let cancel = CancellationToken::new();
        reassembler.submit(1, (), &cancel).await.unwrap();
        reassembler.submit(2, (), &cancel).await.unwrap();

        let parked = {
            let reassembler = reassembler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { reassembler.submit(3, (), &cancel).await })
        };
        while reassembler.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!parked.is_finished());

        // The next index is never blocked by a full buffer.
        reassembler.submit(0, (), &cancel).await.unwrap();
        parked.await.unwrap().unwrap();
        assert_eq!(drain(&mut rx), vec![0, 1, 2, 3]);
        assert_eq!(reassembler.stats().peak_buffered, 2);
    }

    #[tokio::test]
    async fn test_parked_submitters_resolve_in_order() {
        let (reassembler, mut rx) = FrameReassembler::new(1);
        let reassembler = Arc::new(reassembler);
        let cancel = CancellationToken::new();
        reassembler.submit(1, (), &cancel).await.unwrap();

        let mut handles = Vec::new();
        for (position, index) in [3u64, 2].into_iter().enumerate() {
            let reassembler_task = reassembler.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                reassembler_task.submit(index, (), &cancel).await
            }));
            while reassembler.waiting() < position + 1 {
                tokio::task::yield_now().await;
            }
        }

        reassembler.submit(0, (), &cancel).await.unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(drain(&mut rx), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_flush_reports_gap() {
        let (reassembler, mut rx) = FrameReassembler::new(8);
        let cancel = CancellationToken::new();
        reassembler.submit(2, (), &cancel).await.unwrap();
        reassembler.submit(5, (), &cancel).await.unwrap();

        assert_eq!(reassembler.flush().unwrap(), 2);
        assert_eq!(drain(&mut rx), vec![2, 5]);
        let stats = reassembler.stats();
        assert_eq!(stats.gaps, 4);
        assert_eq!(stats.next_expected, 6);
    }

    #[tokio::test]
    async fn test_finish_and_destroy_are_idempotent() {
        let (reassembler, mut rx) = FrameReassembler::new(4);
        let cancel = CancellationToken::new();
        reassembler.submit(0, 10, &cancel).await.unwrap();
        reassembler.submit(2, 12, &cancel).await.unwrap();

        assert_eq!(reassembler.finish().unwrap(), 1);
        assert_eq!(reassembler.finish().unwrap(), 0);
        reassembler.destroy();
        reassembler.destroy();

        assert_eq!(rx.recv().await, Some((0, 10)));
        assert_eq!(rx.recv().await, Some((2, 12)));
        assert_eq!(rx.recv().await, None);
        assert!(matches!(
            reassembler.submit(3, 13, &cancel).await,
            Err(PipelineError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_parked_submitter() {
        let (reassembler, _rx) = FrameReassembler::new(1);
        let cancel = CancellationToken::new();
        reassembler.submit(1, (), &cancel).await.unwrap();
        cancel.cancel();
        assert!(matches!(
            reassembler.submit(2, (), &cancel).await,
            Err(PipelineError::Cancelled)
        ));
    }
}
