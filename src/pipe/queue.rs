//! Bounded frame queue between stages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::{Receiver, SendTimeoutError, Sender, TrySendError};

use crate::cancel::{CancelToken, Wait};
use crate::frame::Frame;

/// How long a blocked push sleeps between cancel checks
const PUSH_SLICE: Duration = Duration::from_millis(5);

/// MPMC frame queue. Holds frame handles, never frame data.
pub struct FrameQueue {
    name: String,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: Option<usize>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    blocked: AtomicUsize,
    rejected: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    /// Pushes that had to wait for space
    pub blocked: usize,
    /// Pushes abandoned on cancel
    pub rejected: usize,
}

impl FrameQueue {
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self::with_channel(name.into(), tx, rx, Some(capacity))
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self::with_channel(name.into(), tx, rx, None)
    }

    fn with_channel(
        name: String,
        tx: Sender<Frame>,
        rx: Receiver<Frame>,
        capacity: Option<usize>,
    ) -> Self {
        Self {
            name,
            tx,
            rx,
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Push, blocking while the queue is full.
    ///
    /// Gives the frame back if `cancel` fires first.
    pub fn push(&self, frame: Frame, cancel: &CancelToken) -> Result<(), Frame> {
        let mut frame = match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => frame,
        };

        self.stats.blocked.fetch_add(1, Ordering::Relaxed);
        loop {
            if cancel.is_cancelled() {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(frame);
            }
            match self.tx.send_timeout(frame, PUSH_SLICE) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(back)) => frame = back,
                Err(SendTimeoutError::Disconnected(back)) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(back);
                }
            }
        }
    }

    /// Non-blocking push
    pub fn try_push(&self, frame: Frame) -> Result<(), Frame> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => Err(frame),
        }
    }

    /// Pop the oldest frame, waiting up to `timeout` or until cancelled
    pub fn pop(&self, timeout: Duration, cancel: &CancelToken) -> Wait<Frame> {
        self.pop_deadline(Instant::now() + timeout, cancel)
    }

    pub fn pop_deadline(&self, deadline: Instant, cancel: &CancelToken) -> Wait<Frame> {
        let outcome = cancel.recv_deadline(&self.rx, deadline);
        if matches!(outcome, Wait::Ready(_)) {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Empty the queue, oldest first
    pub fn drain(&self) -> Vec<Frame> {
        let frames: Vec<Frame> = self.rx.drain().collect();
        self.stats.popped.fetch_add(frames.len(), Ordering::Relaxed);
        frames
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            blocked: self.stats.blocked.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Entity, EntityType, FrameKind, SourceBinding, StageId};
    use std::sync::Arc;
    use std::thread;

    fn frame(count: u32) -> Frame {
        Frame::new(
            count,
            FrameKind::Preview,
            vec![Entity::new(StageId::SENSOR, EntityType::OutputOnly, SourceBinding::None)],
        )
    }

    #[test]
    fn fifo_order() {
        let queue = FrameQueue::bounded("q", 4);
        let cancel = CancelToken::new();
        for count in 1..=3 {
            queue.push(frame(count), &cancel).unwrap();
        }
        let popped: Vec<u32> = (0..3)
            .map(|_| match queue.pop(Duration::from_millis(10), &cancel) {
                Wait::Ready(frame) => frame.frame_count(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(popped, vec![1, 2, 3]);
        assert_eq!(queue.stats().popped, 3);
    }

    #[test]
    fn full_push_blocks_until_cancelled() {
        let queue = Arc::new(FrameQueue::bounded("q", 1));
        let cancel = CancelToken::new();
        queue.push(frame(1), &cancel).unwrap();

        let pusher = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            thread::spawn(move || queue.push(frame(2), &cancel))
        };
        thread::sleep(Duration::from_millis(30));
        cancel.cancel();

        let rejected = pusher.join().unwrap().unwrap_err();
        assert_eq!(rejected.frame_count(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn full_push_completes_when_space_frees() {
        let queue = Arc::new(FrameQueue::bounded("q", 1));
        let cancel = CancelToken::new();
        queue.push(frame(1), &cancel).unwrap();

        let pusher = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            thread::spawn(move || queue.push(frame(2), &cancel).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.try_pop().map(|f| f.frame_count()), Some(1));
        assert!(pusher.join().unwrap());
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = FrameQueue::unbounded("q");
        let cancel = CancelToken::new();
        assert!(matches!(
            queue.pop(Duration::from_millis(5), &cancel),
            Wait::TimedOut
        ));
    }
}
