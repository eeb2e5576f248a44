//! Bounded buffer of decoded frames keyed by presentation timestamp.
//!
//! Inserting at capacity evicts and releases the oldest insertion first, so
//! `len() <= capacity()` always holds. Lookups resolve a frame index to a
//! timestamp through the frame-duration stride and accept the nearest
//! frame within half a frame; equidistant candidates resolve to the earlier
//! timestamp.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use grabme_common::backpressure::{await_waiter, WaiterQueue};
use grabme_common::clock::FrameTimebase;
use grabme_common::error::{PipelineError, PipelineResult};

use crate::frame::DecodedFrame;

/// Read-only description of a buffered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub width: u32,
    pub height: u32,
}

impl FrameInfo {
    fn of(frame: &DecodedFrame) -> Self {
        Self {
            timestamp_us: frame.timestamp_us(),
            duration_us: frame.duration_us(),
            width: frame.width(),
            height: frame.height(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameBufferStats {
    pub size: usize,
    pub capacity: usize,
    pub peak_size: usize,
    pub added: u64,
    pub consumed: u64,
    /// Frames evicted to make room at capacity.
    pub evicted: u64,
    /// Frames released by `evict_before`, duplicates, `reset` and `destroy`.
    pub discarded: u64,
    pub hits: u64,
    pub misses: u64,
}

struct Slot {
    seq: u64,
    frame: DecodedFrame,
}

struct State {
    frames: HashMap<i64, Slot>,
    /// Insertion order as (timestamp, seq). Entries whose seq no longer
    /// matches the map are stale and skipped.
    order: VecDeque<(i64, u64)>,
    next_seq: u64,
    waiters: WaiterQueue,
    destroyed: bool,
    stats: FrameBufferStats,
}

impl State {
    fn wake_free_slots(&mut self, capacity: usize) {
        let free = capacity.saturating_sub(self.frames.len());
        if free > 0 {
            self.waiters.wake(free);
        }
    }

    fn evict_oldest(&mut self) -> Option<DecodedFrame> {
        while let Some((ts, seq)) = self.order.pop_front() {
            if self.frames.get(&ts).map(|s| s.seq) == Some(seq) {
                return self.frames.remove(&ts).map(|s| s.frame);
            }
        }
        None
    }

    fn compact_order(&mut self) {
        if self.order.len() > self.frames.len() * 2 + 16 {
            let frames = &self.frames;
            self.order
                .retain(|(ts, seq)| frames.get(ts).map(|s| s.seq) == Some(*seq));
        }
    }

    /// Hand out the frame at `ts`, counting it as a consumed hit.
    fn take(&mut self, ts: i64, capacity: usize) -> Option<DecodedFrame> {
        let frame = self.frames.remove(&ts)?.frame;
        self.stats.hits += 1;
        self.stats.consumed += 1;
        self.compact_order();
        self.wake_free_slots(capacity);
        Some(frame)
    }

    fn take_all(&mut self) -> Vec<DecodedFrame> {
        self.order.clear();
        let mut frames: Vec<DecodedFrame> = self.frames.drain().map(|(_, s)| s.frame).collect();
        frames.sort_by_key(|f| f.timestamp_us());
        frames
    }

    /// Timestamp of the closest frame to `target_us` within `tolerance_us`.
    fn resolve(&self, target_us: i64, tolerance_us: i64) -> Option<i64> {
        if self.frames.contains_key(&target_us) {
            return Some(target_us);
        }
        self.frames
            .keys()
            .copied()
            .filter(|ts| (ts - target_us).abs() <= tolerance_us)
            .min_by_key(|ts| ((ts - target_us).abs(), *ts))
    }
}

/// Capacity-bounded map from timestamp to [`DecodedFrame`].
pub struct FrameBuffer {
    capacity: usize,
    timebase: FrameTimebase,
    state: Mutex<State>,
}

impl FrameBuffer {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, timebase: FrameTimebase) -> Self {
        assert!(capacity > 0, "frame buffer needs capacity > 0");
        Self {
            capacity,
            timebase,
            state: Mutex::new(State {
                frames: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                next_seq: 0,
                waiters: WaiterQueue::new(),
                destroyed: false,
                stats: FrameBufferStats {
                    capacity,
                    ..FrameBufferStats::default()
                },
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timebase(&self) -> FrameTimebase {
        self.timebase
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn tolerance_us(&self) -> i64 {
        self.timebase.frame_duration_us() / 2
    }

    /// Insert a frame, evicting the oldest one first if full. A frame with an
    /// already-buffered timestamp replaces (and releases) the old one.
    pub fn add_frame(&self, frame: DecodedFrame) -> PipelineResult<()> {
        let ts = frame.timestamp_us();
        // Released outside the lock.
        let mut released: Vec<DecodedFrame> = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if state.destroyed {
                released.push(frame);
                Err(PipelineError::Closed {
                    component: "frame buffer",
                })
            } else {
                if let Some(old) = state.frames.remove(&ts) {
                    state.stats.discarded += 1;
                    released.push(old.frame);
                } else if state.frames.len() >= self.capacity {
                    if let Some(oldest) = state.evict_oldest() {
                        trace!(evicted_us = oldest.timestamp_us(), "frame buffer evicting oldest");
                        state.stats.evicted += 1;
                        released.push(oldest);
                    }
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                state.order.push_back((ts, seq));
                state.frames.insert(ts, Slot { seq, frame });
                state.compact_order();
                state.stats.added += 1;
                state.stats.peak_size = state.stats.peak_size.max(state.frames.len());
                Ok(())
            }
        };
        drop(released);
        result
    }

    /// Timestamp that `index` resolves to, if a frame is buffered for it.
    pub fn resolve_index(&self, index: u64) -> Option<i64> {
        self.resolve_time(self.timebase.index_to_us(index))
    }

    /// Timestamp of the buffered frame nearest `target_us` within half a
    /// frame duration.
    pub fn resolve_time(&self, target_us: i64) -> Option<i64> {
        self.state.lock().resolve(target_us, self.tolerance_us())
    }

    pub fn has_frame(&self, index: u64) -> bool {
        self.resolve_index(index).is_some()
    }

    /// Describe the frame for `index` without taking it.
    pub fn get_frame(&self, index: u64) -> Option<FrameInfo> {
        self.get_frame_at(self.timebase.index_to_us(index))
    }

    pub fn get_frame_at(&self, target_us: i64) -> Option<FrameInfo> {
        let mut state = self.state.lock();
        let found = state
            .resolve(target_us, self.tolerance_us())
            .and_then(|ts| state.frames.get(&ts))
            .map(|slot| FrameInfo::of(&slot.frame));
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        found
    }

    /// Take ownership of the frame for `index`.
    pub fn consume_frame(&self, index: u64) -> Option<DecodedFrame> {
        self.consume_at(self.timebase.index_to_us(index))
    }

    pub fn consume_at(&self, target_us: i64) -> Option<DecodedFrame> {
        let mut state = self.state.lock();
        let taken = state
            .resolve(target_us, self.tolerance_us())
            .and_then(|ts| state.take(ts, self.capacity));
        if taken.is_none() {
            state.stats.misses += 1;
        }
        taken
    }

    /// Take the buffered frame with the latest timestamp not after `target_us`.
    pub fn consume_at_or_before(&self, target_us: i64) -> Option<DecodedFrame> {
        let mut state = self.state.lock();
        let ts = state.frames.keys().copied().filter(|ts| *ts <= target_us).max()?;
        state.take(ts, self.capacity)
    }

    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.state.lock().frames.keys().copied().min()
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.state.lock().frames.keys().copied().max()
    }

    /// Release every frame presented before `timestamp_us`.
    pub fn evict_before(&self, timestamp_us: i64) -> usize {
        let released: Vec<DecodedFrame> = {
            let mut state = self.state.lock();
            let stale: Vec<i64> = state
                .frames
                .keys()
                .copied()
                .filter(|ts| *ts < timestamp_us)
                .collect();
            let frames: Vec<DecodedFrame> = stale
                .iter()
                .filter_map(|ts| state.frames.remove(ts))
                .map(|slot| slot.frame)
                .collect();
            if !frames.is_empty() {
                state.stats.discarded += frames.len() as u64;
                state.compact_order();
                state.wake_free_slots(self.capacity);
            }
            frames
        };
        let count = released.len();
        if count > 0 {
            debug!(count, before_us = timestamp_us, "frame buffer evicted stale frames");
        }
        count
    }

    /// Suspend until the buffer has room. Waiters are released in FIFO order
    /// as slots free up.
    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        let rx = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(PipelineError::Closed {
                    component: "frame buffer",
                });
            }
            if state.frames.len() < self.capacity && state.waiters.is_empty() {
                return Ok(());
            }
            state.waiters.register()
        };
        await_waiter(rx, cancel, "frame buffer").await
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Remove and return every frame in timestamp order. Nothing is released.
    pub fn flush(&self) -> Vec<DecodedFrame> {
        let mut state = self.state.lock();
        let frames = state.take_all();
        state.waiters.wake_all();
        frames
    }

    /// Release every frame and wake all waiters. The buffer stays usable.
    pub fn reset(&self) {
        let released = {
            let mut state = self.state.lock();
            let frames = state.take_all();
            state.stats.discarded += frames.len() as u64;
            state.waiters.wake_all();
            frames
        };
        drop(released);
    }

    /// Release every frame and fail all waiters. Later inserts are rejected.
    pub fn destroy(&self) {
        let released = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let frames = state.take_all();
            state.stats.discarded += frames.len() as u64;
            state.waiters.fail_all(&PipelineError::Closed {
                component: "frame buffer",
            });
            frames
        };
        debug!(released = released.len(), "frame buffer destroyed");
    }

    pub fn stats(&self) -> FrameBufferStats {
        let state = self.state.lock();
        FrameBufferStats {
            size: state.frames.len(),
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameAccounting, RgbaImage};
    use std::sync::Arc;
    use std::time::Duration;

    const STRIDE: i64 = 100_000; // 10 fps

    fn frame(accounting: &FrameAccounting, ts: i64) -> DecodedFrame {
        accounting.frame(ts, STRIDE, RgbaImage::filled(1, 1, [0, 0, 0, 255]).unwrap())
    }

    fn buffer(capacity: usize) -> FrameBuffer {
        FrameBuffer::new(capacity, FrameTimebase::new(10.0))
    }

    #[test]
    fn test_capacity_two_evicts_first_insert() {
        let accounting = FrameAccounting::new();
        let buf = buffer(2);
        for i in 0..3 {
            buf.add_frame(frame(&accounting, i * STRIDE)).unwrap();
        }
        assert_eq!(buf.len(), 2);
        assert!(!buf.has_frame(0));
        assert!(buf.has_frame(1));
        assert!(buf.has_frame(2));
        assert_eq!(accounting.released(), 1);
        assert_eq!(buf.stats().evicted, 1);
    }

    #[test]
    fn test_tolerance_prefers_nearest_then_earlier() {
        let accounting = FrameAccounting::new();
        let buf = buffer(4);
        buf.add_frame(frame(&accounting, 80_000)).unwrap();
        buf.add_frame(frame(&accounting, 130_000)).unwrap();
        // Index 1 (100 ms): 80 ms is 20 ms away, 130 ms is 30 ms away.
        assert_eq!(buf.resolve_index(1), Some(80_000));

        let tie = buffer(4);
        tie.add_frame(frame(&accounting, 70_000)).unwrap();
        tie.add_frame(frame(&accounting, 130_000)).unwrap();
        assert_eq!(tie.resolve_index(1), Some(70_000));

        // Beyond half a frame: no match.
        let far = buffer(4);
        far.add_frame(frame(&accounting, 160_000)).unwrap();
        assert_eq!(far.resolve_index(1), None);
    }

    #[test]
    fn test_get_does_not_transfer_consume_does() {
        let accounting = FrameAccounting::new();
        let buf = buffer(4);
        buf.add_frame(frame(&accounting, 0)).unwrap();
        let info = buf.get_frame(0).unwrap();
        assert_eq!(info.timestamp_us, 0);
        assert_eq!(buf.len(), 1);

        let owned = buf.consume_frame(0).unwrap();
        assert_eq!(buf.len(), 0);
        assert_eq!(accounting.outstanding(), 1);
        owned.release();
        assert_eq!(accounting.outstanding(), 0);
        assert!(buf.consume_frame(0).is_none());
    }

    #[test]
    fn test_duplicate_timestamp_replaces() {
        let accounting = FrameAccounting::new();
        let buf = buffer(4);
        buf.add_frame(frame(&accounting, 0)).unwrap();
        buf.add_frame(frame(&accounting, 0)).unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(accounting.released(), 1);
        // The stale order entry must not evict the live frame.
        for i in 1..4 {
            buf.add_frame(frame(&accounting, i * STRIDE)).unwrap();
        }
        assert!(buf.has_frame(0));
    }

    #[test]
    fn test_flush_hands_frames_out_unreleased() {
        let accounting = FrameAccounting::new();
        let buf = buffer(4);
        buf.add_frame(frame(&accounting, 2 * STRIDE)).unwrap();
        buf.add_frame(frame(&accounting, 0)).unwrap();
        let frames = buf.flush();
        assert_eq!(
            frames.iter().map(|f| f.timestamp_us()).collect::<Vec<_>>(),
            vec![0, 2 * STRIDE]
        );
        assert_eq!(accounting.released(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset_and_destroy_are_idempotent() {
        let accounting = FrameAccounting::new();
        let buf = buffer(4);
        buf.add_frame(frame(&accounting, 0)).unwrap();
        buf.reset();
        buf.reset();
        assert_eq!(accounting.outstanding(), 0);
        buf.add_frame(frame(&accounting, 0)).unwrap();
        buf.destroy();
        buf.destroy();
        assert_eq!(accounting.outstanding(), 0);
        assert!(buf.add_frame(frame(&accounting, 0)).is_err());
        assert_eq!(accounting.outstanding(), 0);
    }

    #[test]
    fn test_evict_before() {
        let accounting = FrameAccounting::new();
        let buf = buffer(8);
        for i in 0..5 {
            buf.add_frame(frame(&accounting, i * STRIDE)).unwrap();
        }
        assert_eq!(buf.evict_before(3 * STRIDE), 3);
        assert_eq!(buf.oldest_timestamp(), Some(3 * STRIDE));
        assert_eq!(buf.newest_timestamp(), Some(4 * STRIDE));
        assert_eq!(accounting.released(), 3);
    }

    #[test]
    fn test_consume_at_or_before_keeps_bookkeeping_bounded() {
        let accounting = FrameAccounting::new();
        let buf = buffer(2);
        for i in 0..200 {
            buf.add_frame(frame(&accounting, i * STRIDE)).unwrap();
            let taken = buf.consume_at_or_before(i * STRIDE + STRIDE / 4).unwrap();
            assert_eq!(taken.timestamp_us(), i * STRIDE);
        }
        assert!(buf.state.lock().order.len() <= 2 * 2 + 16);
        let stats = buf.stats();
        assert_eq!(stats.hits, 200);
        assert_eq!(stats.consumed, 200);
        assert!(buf.consume_at_or_before(-1).is_none());
        assert_eq!(accounting.released(), 200);
    }

    #[tokio::test]
    async fn test_space_waiters_release_in_fifo_order() {
        let accounting = FrameAccounting::new();
        let buf = Arc::new(buffer(1));
        buf.add_frame(frame(&accounting, 0)).unwrap();
        let cancel = CancellationToken::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..2 {
            let waiter = Arc::clone(&buf);
            let cancel = cancel.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                waiter.wait_for_space(&cancel).await.unwrap();
                order.lock().push(id);
            }));
            // Make registration order deterministic.
            while buf.waiting() < id + 1 {
                tokio::task::yield_now().await;
            }
        }

        buf.consume_frame(0).unwrap().release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*order.lock(), vec![0]);

        buf.add_frame(frame(&accounting, STRIDE)).unwrap();
        buf.consume_frame(1).unwrap().release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_destroy_fails_waiters() {
        let accounting = FrameAccounting::new();
        let buf = Arc::new(buffer(1));
        buf.add_frame(frame(&accounting, 0)).unwrap();
        let cancel = CancellationToken::new();
        let waiter = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.wait_for_space(&cancel).await })
        };
        while buf.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        buf.destroy();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "closed");
    }
}
