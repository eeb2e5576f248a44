//! In-flight limit between the ordered render output and the encoder.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use grabme_common::backpressure::CapacityGate;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_common::stats::LatencyStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EncodeQueueStats {
    pub capacity: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub depth: usize,
    pub peak_depth: usize,
    pub encode_latency: LatencyStats,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    completed: u64,
    latency: LatencyStats,
}

/// Counts frames handed to the encoder and not yet written.
///
/// Slots are taken with [`EncodeQueue::enqueue`] and returned with
/// [`EncodeQueue::complete`]; callers park in FIFO order on
/// [`EncodeQueue::wait_for_space`].
#[derive(Debug)]
pub struct EncodeQueue {
    gate: CapacityGate,
    counters: Mutex<Counters>,
}

impl EncodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            gate: CapacityGate::new("encoder", capacity.max(1)),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.gate.max()
    }

    pub fn depth(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn can_accept(&self) -> bool {
        self.gate.has_space()
    }

    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        self.gate.wait_for_space(cancel).await
    }

    /// Take a slot; `QueueFull` when none is free.
    pub fn enqueue(&self) -> PipelineResult<()> {
        self.gate.try_acquire()?;
        self.counters.lock().enqueued += 1;
        Ok(())
    }

    /// Return a slot after the encoder accepted a frame.
    pub fn complete(&self, latency: Duration) {
        {
            let mut counters = self.counters.lock();
            counters.completed += 1;
            counters.latency.record(latency);
        }
        self.gate.release();
    }

    /// Fail current and future waiters with `err`.
    pub fn close(&self, err: PipelineError) {
        self.gate.fail(err);
    }

    pub fn failure(&self) -> Option<PipelineError> {
        self.gate.failure()
    }

    pub fn stats(&self) -> EncodeQueueStats {
        let counters = self.counters.lock();
        EncodeQueueStats {
            capacity: self.gate.max(),
            enqueued: counters.enqueued,
            completed: counters.completed,
            depth: self.gate.in_flight(),
            peak_depth: self.gate.peak(),
            encode_latency: counters.latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_enqueue_rejects_when_full() {
        let queue = EncodeQueue::new(2);
        queue.enqueue().unwrap();
        queue.enqueue().unwrap();
        assert!(!queue.can_accept());
        assert!(matches!(
            queue.enqueue(),
            Err(PipelineError::QueueFull { queue: "encoder" })
        ));

        queue.complete(Duration::from_millis(4));
        assert!(queue.can_accept());
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.peak_depth, 2);
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_call_order() {
        let queue = Arc::new(EncodeQueue::new(1));
        queue.enqueue().unwrap();
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..2 {
            let queue_task = queue.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue_task.wait_for_space(&cancel).await.unwrap();
                queue_task.enqueue().unwrap();
                order.lock().push(id);
            }));
            while queue.gate.waiting() < id + 1 {
                tokio::task::yield_now().await;
            }
        }

        // Two dequeue events, two wakeups, in registration order.
        queue.complete(Duration::ZERO);
        while order.lock().len() < 1 {
            tokio::task::yield_now().await;
        }
        queue.complete(Duration::ZERO);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let queue = Arc::new(EncodeQueue::new(1));
        queue.enqueue().unwrap();
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.wait_for_space(&cancel).await })
        };
        while queue.gate.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        queue.close(PipelineError::encode("ffmpeg exited"));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PipelineError::Encode { .. })
        ));
        assert!(queue.enqueue().is_err());
    }
}
