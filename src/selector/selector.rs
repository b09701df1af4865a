//! Capture selector: a bounded hold list of recent frames for still capture
//!
//! Frames reaching the watched buffer are held with their buffer so a later
//! take-picture request can pick one retroactively. Eviction is FIFO; what a
//! request gets depends on its policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use crate::buffer::{Buffer, BufferManager};
use crate::cancel::{CancelToken, Wait};
use crate::error::{PipelineError, Result};
use crate::frame::{BufferTap, EntityBufferState, Frame, FrameList, SelectorState, StageId};
use crate::selector::policy::{pick, Candidate, HoldFilter, SelectRequest};
use crate::utils::lock;
use crate::SelectorConfig;

struct HoldEntry {
    frame: Frame,
    manager: Arc<BufferManager>,
    index: usize,
    tap: BufferTap,
}

#[derive(Default)]
struct Counters {
    held: AtomicU64,
    evicted: AtomicU64,
    selected: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectorStats {
    pub held: u64,
    pub evicted: u64,
    pub selected: u64,
    pub timeouts: u64,
    pub cancelled: u64,
}

pub struct CaptureSelector {
    id: u32,
    frames: Arc<FrameList>,
    hold: Mutex<VecDeque<HoldEntry>>,
    hold_count: AtomicUsize,
    filter: Mutex<HoldFilter>,
    wait_time_ms: AtomicU64,
    /// One wake-up channel per waiting selection
    waiters: Mutex<Vec<Sender<()>>>,
    cancel: Mutex<CancelToken>,
    counters: CachePadded<Counters>,
}

impl CaptureSelector {
    /// `frames` is the tracking list of the graph feeding this selector
    pub fn new(frames: Arc<FrameList>, config: &SelectorConfig) -> Self {
        Self {
            id: config.id,
            frames,
            hold: Mutex::new(VecDeque::new()),
            hold_count: AtomicUsize::new(config.hold_count),
            filter: Mutex::new(HoldFilter::All),
            wait_time_ms: AtomicU64::new(config.wait_time_ms),
            waiters: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancelToken::new()),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn hold_count(&self) -> usize {
        self.hold_count.load(Ordering::Acquire)
    }

    /// Change capacity, evicting the oldest entries if it shrank
    pub fn set_hold_count(&self, count: usize) {
        self.hold_count.store(count, Ordering::Release);
        let evicted = {
            let mut hold = lock(&self.hold);
            Self::evict_over(&mut hold, count)
        };
        self.discard_all(evicted);
        debug!("Selector {} hold count {}", self.id, count);
    }

    pub fn set_filter(&self, filter: HoldFilter) {
        *lock(&self.filter) = filter;
    }

    pub fn filter(&self) -> HoldFilter {
        *lock(&self.filter)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms.load(Ordering::Relaxed))
    }

    pub fn set_wait_time(&self, wait_time: Duration) {
        self.wait_time_ms
            .store(wait_time.as_millis() as u64, Ordering::Relaxed);
    }

    /// Hold the buffer behind `tap`, taking its ownership from the frame.
    ///
    /// The frame is pinned in the tracking list while held. Returns false if
    /// the frame was not held (filtered out, or its buffer is not valid).
    pub fn manage_frame_hold_list(&self, frame: &Frame, tap: BufferTap) -> Result<bool> {
        if !self.filter().accepts(frame.sync_count()) {
            return Ok(false);
        }
        if frame.tap_state(tap) != Some(EntityBufferState::Valid) {
            return Ok(false);
        }
        let Some((manager, index)) = frame.take_buffer(tap) else {
            return Err(PipelineError::InvalidState(format!(
                "F{} owns no buffer at {}",
                frame.frame_count(),
                tap
            )));
        };

        frame.lock();
        frame.set_selector_state(SelectorState::Held);
        let entry = HoldEntry {
            frame: frame.clone(),
            manager,
            index,
            tap,
        };

        let evicted = {
            let mut hold = lock(&self.hold);
            hold.push_back(entry);
            Self::evict_over(&mut hold, self.hold_count())
        };
        self.counters.held.fetch_add(1, Ordering::Relaxed);
        self.discard_all(evicted);

        self.notify_waiters();
        Ok(true)
    }

    /// Wake every waiting selection. A full channel already has a wake-up
    /// pending; a disconnected one belongs to a waiter that left.
    fn notify_waiters(&self) {
        lock(&self.waiters).retain(|waiter| match waiter.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => {
                trace!("Selector {} dropped a departed waiter", self.id);
                false
            }
        });
    }

    fn evict_over(hold: &mut VecDeque<HoldEntry>, count: usize) -> Vec<HoldEntry> {
        let excess = hold.len().saturating_sub(count);
        hold.drain(..excess).collect()
    }

    fn discard_all(&self, entries: Vec<HoldEntry>) {
        for entry in entries {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("campipe_selector_evictions_total").increment(1);
            self.discard(entry);
        }
    }

    /// Return the held buffer and let the frame leave the tracking list
    fn discard(&self, entry: HoldEntry) {
        let HoldEntry {
            frame,
            manager,
            index,
            ..
        } = entry;
        if let Err(e) = manager.put_buffer(index) {
            warn!("Selector {} F{}: {}", self.id, frame.frame_count(), e);
        }
        release_frame(&self.frames, &frame);
    }

    /// Block until a frame qualifies, then hand it out.
    ///
    /// Errors with `SelectionTimeout` at the deadline, or `Cancelled` as soon
    /// as `cancel_picture(true)` runs.
    pub fn select_frames(&self, req: &SelectRequest) -> Result<SelectedFrame> {
        let cancel = lock(&self.cancel).clone();
        let timeout = req.timeout.unwrap_or_else(|| self.wait_time());
        let deadline = Instant::now() + timeout;

        let (wake_tx, wake_rx) = flume::bounded(1);
        lock(&self.waiters).push(wake_tx.clone());
        let outcome = self.wait_for_selection(req, deadline, &cancel, &wake_rx);
        lock(&self.waiters).retain(|waiter| !waiter.same_channel(&wake_tx));

        match &outcome {
            Ok(selected) => {
                self.counters.selected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("campipe_selector_selections_total").increment(1);
                info!(
                    "Selector {} picked F{} ({:?})",
                    self.id,
                    selected.frame_count(),
                    req.policy
                );
            }
            Err(PipelineError::SelectionTimeout { .. }) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("campipe_selector_timeouts_total").increment(1);
                warn!("Selector {} found nothing within {:?}", self.id, timeout);
            }
            Err(e) => debug!("Selector {} selection ended: {}", self.id, e),
        }
        outcome
    }

    fn wait_for_selection(
        &self,
        req: &SelectRequest,
        deadline: Instant,
        cancel: &CancelToken,
        wake: &Receiver<()>,
    ) -> Result<SelectedFrame> {
        loop {
            if let Some(selected) = self.try_pick(req, false, cancel)? {
                return Ok(selected);
            }
            match cancel.recv_deadline(wake, deadline) {
                Wait::Ready(()) => continue,
                Wait::TimedOut => {
                    return match self.try_pick(req, true, cancel)? {
                        Some(selected) => Ok(selected),
                        None => Err(PipelineError::SelectionTimeout {
                            timeout: req.timeout.unwrap_or_else(|| self.wait_time()),
                        }),
                    };
                }
                Wait::Cancelled | Wait::Closed => return Err(PipelineError::Cancelled),
            }
        }
    }

    fn try_pick(
        &self,
        req: &SelectRequest,
        at_deadline: bool,
        cancel: &CancelToken,
    ) -> Result<Option<SelectedFrame>> {
        let mut hold = lock(&self.hold);
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let candidates: Vec<Candidate> = hold
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.tap == req.tap)
            .map(|(pos, entry)| Candidate {
                pos,
                sync_count: entry.frame.sync_count(),
                focus_score: entry.frame.focus_score(),
            })
            .collect();

        let Some(pos) = pick(&candidates, req, at_deadline) else {
            return Ok(None);
        };
        Ok(hold.remove(pos).map(|entry| SelectedFrame {
            frame: entry.frame,
            buffer: Some((entry.manager, entry.index)),
            tap: entry.tap,
            frames: self.frames.clone(),
        }))
    }

    /// Flush entries for `tap` (all entries for `None`).
    ///
    /// Refused while a selection is waiting; cancel it first.
    pub fn clear_list(&self, tap: Option<BufferTap>) -> Result<usize> {
        if !lock(&self.waiters).is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "selector {} has a selection in progress",
                self.id
            )));
        }
        Ok(self.flush(tap))
    }

    /// Flush everything unconditionally and reset the hold filter
    pub fn release(&self) -> usize {
        let flushed = self.flush(None);
        self.set_filter(HoldFilter::All);
        if flushed > 0 {
            info!("Selector {} released {} held frames", self.id, flushed);
        }
        flushed
    }

    fn flush(&self, tap: Option<BufferTap>) -> usize {
        let flushed: Vec<HoldEntry> = {
            let mut hold = lock(&self.hold);
            let (flushed, kept): (VecDeque<HoldEntry>, VecDeque<HoldEntry>) = hold
                .drain(..)
                .partition(|entry| tap.map_or(true, |tap| entry.tap == tap));
            *hold = kept;
            flushed.into_iter().collect()
        };
        let count = flushed.len();
        for entry in flushed {
            self.discard(entry);
        }
        count
    }

    /// Two-phase cancel of a take-picture request.
    ///
    /// `true` wakes any waiting selection with `Cancelled`. `false` then
    /// flushes the hold list and re-arms the selector. Returns the number of
    /// entries flushed.
    pub fn cancel_picture(&self, signal: bool) -> usize {
        if signal {
            lock(&self.cancel).cancel();
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            info!("Selector {} picture cancelled", self.id);
            return 0;
        }

        let flushed = self.flush(None);
        let mut cancel = lock(&self.cancel);
        if cancel.is_cancelled() {
            *cancel = CancelToken::new();
        }
        flushed
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.cancel).is_cancelled()
    }

    /// Nudge waiting selections to re-check without cancelling them
    pub fn wakeup(&self) {
        self.notify_waiters();
    }

    pub fn held_len(&self) -> usize {
        lock(&self.hold).len()
    }

    /// Frame counts held, oldest first
    pub fn held_frame_counts(&self) -> Vec<u32> {
        lock(&self.hold)
            .iter()
            .map(|entry| entry.frame.frame_count())
            .collect()
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            held: self.counters.held.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            selected: self.counters.selected.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CaptureSelector {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CaptureSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSelector")
            .field("id", &self.id)
            .field("hold_count", &self.hold_count())
            .field("held", &self.held_frame_counts())
            .finish()
    }
}

fn release_frame(frames: &FrameList, frame: &Frame) {
    frame.unlock();
    frame.set_selector_state(SelectorState::Removed);
    frames.remove_completed(frame.frame_count());
}

/// A frame handed out by `select_frames`, owning its held buffer.
///
/// Dropping it returns the buffer and lets the frame leave the tracking list.
pub struct SelectedFrame {
    frame: Frame,
    buffer: Option<(Arc<BufferManager>, usize)>,
    tap: BufferTap,
    frames: Arc<FrameList>,
}

impl SelectedFrame {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_count(&self) -> u32 {
        self.frame.frame_count()
    }

    pub fn tap(&self) -> BufferTap {
        self.tap
    }

    /// View of the held buffer
    pub fn buffer(&self) -> Option<Buffer> {
        let (manager, index) = self.buffer.as_ref()?;
        manager.buffer(*index).ok()
    }

    /// Move the held buffer into `target` as the source of `stage`
    /// (reprocessing). The target frame releases it from then on.
    pub fn attach_as_source(mut self, target: &Frame, stage: StageId) -> Result<()> {
        let Some((manager, index)) = self.buffer.take() else {
            return Err(PipelineError::InvalidState("selected buffer already moved".into()));
        };
        if let Err(e) = target.attach_src(stage, index, manager.clone()) {
            self.buffer = Some((manager, index));
            return Err(e);
        }
        debug!(
            "F{} buffer {} attached to F{} {}",
            self.frame.frame_count(),
            index,
            target.frame_count(),
            stage
        );
        Ok(())
    }
}

impl Drop for SelectedFrame {
    fn drop(&mut self) {
        if let Some((manager, index)) = self.buffer.take() {
            if let Err(e) = manager.put_buffer(index) {
                warn!("F{}: {}", self.frame.frame_count(), e);
            }
        }
        release_frame(&self.frames, &self.frame);
    }
}

impl std::fmt::Debug for SelectedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedFrame")
            .field("frame", &self.frame)
            .field("tap", &self.tap)
            .field("buffer", &self.buffer.as_ref().map(|(_, index)| *index))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AllocationMode;
    use crate::frame::{Entity, EntityType, FrameKind, SourceBinding};
    use crate::selector::SelectionPolicy;
    use std::thread;

    struct Rig {
        manager: Arc<BufferManager>,
        frames: Arc<FrameList>,
        selector: Arc<CaptureSelector>,
    }

    fn tap() -> BufferTap {
        BufferTap::dst(StageId::BAYER, 0)
    }

    fn rig(hold_count: usize) -> Rig {
        let manager = BufferManager::new("bayer", AllocationMode::AtOnce, Arc::default());
        manager.allocate(1, &[16], 8, 8).unwrap();
        let frames = Arc::new(FrameList::new());
        let config = SelectorConfig {
            hold_count,
            wait_time_ms: 200,
            ..SelectorConfig::default()
        };
        Rig {
            manager: Arc::new(manager),
            selector: Arc::new(CaptureSelector::new(frames.clone(), &config)),
            frames,
        }
    }

    impl Rig {
        /// A completed frame with a valid Bayer output, registered and held
        fn complete(&self, count: u32) -> Frame {
            let frame = Frame::new(
                count,
                FrameKind::Preview,
                vec![Entity::new(StageId::BAYER, EntityType::OutputOnly, SourceBinding::None)],
            );
            let buffer = self.manager.get_buffer().unwrap();
            frame
                .attach_dst(StageId::BAYER, 0, buffer.index(), self.manager.clone())
                .unwrap();
            frame.setup_stage(StageId::BAYER).unwrap();
            frame.begin_stage(StageId::BAYER).unwrap();
            frame.complete_stage(StageId::BAYER, &[true]).unwrap();
            self.frames.register(frame.clone()).unwrap();
            frame
        }

        fn hold(&self, count: u32) -> Frame {
            let frame = self.complete(count);
            assert!(self.selector.manage_frame_hold_list(&frame, tap()).unwrap());
            frame
        }
    }

    #[test]
    fn eviction_releases_oldest() {
        let rig = rig(3);
        for count in 1..=3 {
            rig.hold(count);
        }
        assert_eq!(rig.manager.available(), 5);
        rig.hold(4);
        assert_eq!(rig.selector.held_frame_counts(), vec![2, 3, 4]);
        assert_eq!(rig.manager.available(), 5);
        assert!(!rig.frames.contains(1));
        assert_eq!(rig.frames.frame_counts(), vec![2, 3, 4]);
        assert_eq!(rig.selector.stats().evicted, 1);
    }

    #[test]
    fn shrinking_hold_count_evicts() {
        let rig = rig(4);
        for count in 1..=4 {
            rig.hold(count);
        }
        rig.selector.set_hold_count(1);
        assert_eq!(rig.selector.held_frame_counts(), vec![4]);
        assert_eq!(rig.manager.available(), 7);
    }

    #[test]
    fn selected_frame_returns_buffer_on_drop() {
        let rig = rig(3);
        rig.hold(1);
        rig.hold(2);
        let selected = rig
            .selector
            .select_frames(&SelectRequest::new(tap()))
            .unwrap();
        assert_eq!(selected.frame_count(), 1);
        assert!(selected.buffer().is_some());
        assert_eq!(rig.manager.available(), 6);
        drop(selected);
        assert_eq!(rig.manager.available(), 7);
        assert!(!rig.frames.contains(1));
        assert_eq!(rig.selector.held_frame_counts(), vec![2]);
    }

    #[test]
    fn empty_list_times_out() {
        let rig = rig(3);
        let started = Instant::now();
        let result = rig
            .selector
            .select_frames(&SelectRequest::new(tap()).timeout(Duration::from_millis(30)));
        assert!(matches!(result, Err(PipelineError::SelectionTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(rig.selector.stats().timeouts, 1);
    }

    #[test]
    fn waiter_wakes_on_arrival() {
        let rig = rig(3);
        let waiter = {
            let selector = rig.selector.clone();
            thread::spawn(move || {
                selector
                    .select_frames(
                        &SelectRequest::new(tap())
                            .policy(SelectionPolicy::MatchCount { target: 6 })
                            .timeout(Duration::from_secs(5)),
                    )
                    .map(|selected| selected.frame_count())
            })
        };
        rig.hold(5);
        thread::sleep(Duration::from_millis(10));
        rig.hold(6);
        assert_eq!(waiter.join().unwrap().unwrap(), 6);
    }

    #[test]
    fn two_phase_cancel() {
        let rig = rig(3);
        rig.hold(1);
        let waiter = {
            let selector = rig.selector.clone();
            thread::spawn(move || {
                selector
                    .select_frames(
                        &SelectRequest::new(tap())
                            .policy(SelectionPolicy::MatchCount { target: 50 })
                            .timeout(Duration::from_secs(10)),
                    )
                    .map(|selected| selected.frame_count())
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(rig.selector.clear_list(None).is_err());

        let started = Instant::now();
        assert_eq!(rig.selector.cancel_picture(true), 0);
        assert!(matches!(waiter.join().unwrap(), Err(PipelineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rig.selector.is_cancelled());

        assert_eq!(rig.selector.cancel_picture(false), 1);
        assert!(!rig.selector.is_cancelled());
        assert_eq!(rig.manager.available(), 8);
        assert!(rig.frames.is_empty());
    }

    #[test]
    fn attach_as_source_moves_ownership() {
        let rig = rig(3);
        rig.hold(1);
        let selected = rig
            .selector
            .select_frames(&SelectRequest::new(tap()))
            .unwrap();

        let reprocess = Frame::new(
            100,
            FrameKind::Reprocessing,
            vec![Entity::new(StageId::ISP, EntityType::InputOutput, SourceBinding::External)],
        );
        selected.attach_as_source(&reprocess, StageId::ISP).unwrap();
        assert_eq!(rig.manager.available(), 7);
        assert!(!rig.frames.contains(1));
        assert!(reprocess.src_buffer(StageId::ISP).is_some());

        assert_eq!(reprocess.release_buffers(), 1);
        assert_eq!(rig.manager.available(), 8);
    }

    #[test]
    fn filtered_frames_are_not_held() {
        let rig = rig(3);
        rig.selector.set_filter(HoldFilter::SyncWindow { base: 10, len: 2 });
        let outside = rig.complete(5);
        assert!(!rig.selector.manage_frame_hold_list(&outside, tap()).unwrap());
        assert_eq!(outside.owned_buffer_count(), 1);
        let inside = rig.complete(11);
        assert!(rig.selector.manage_frame_hold_list(&inside, tap()).unwrap());
        assert_eq!(rig.selector.release(), 1);
        assert_eq!(rig.selector.filter(), HoldFilter::All);
    }
}
