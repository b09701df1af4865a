//! Shared in-flight frame tracking list

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::frame::frame::Frame;
use crate::utils::lock;

/// Frames currently owned by a pipeline, keyed by frame count.
///
/// The lock is held only for the map operation itself; callers never touch a
/// buffer manager while holding it.
#[derive(Default)]
pub struct FrameList {
    frames: Mutex<BTreeMap<u32, Frame>>,
    removed: AtomicU64,
}

impl FrameList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing frame for `frame_count`, or a new one from `create`.
    /// Returns whether the frame was inserted by this call.
    pub fn get_or_insert_with(
        &self,
        frame_count: u32,
        create: impl FnOnce() -> Frame,
    ) -> (Frame, bool) {
        let mut frames = lock(&self.frames);
        if let Some(frame) = frames.get(&frame_count) {
            return (frame.clone(), false);
        }
        let frame = create();
        frames.insert(frame_count, frame.clone());
        (frame, true)
    }

    pub fn register(&self, frame: Frame) -> Result<()> {
        let mut frames = lock(&self.frames);
        let count = frame.frame_count();
        if frames.contains_key(&count) {
            return Err(PipelineError::InvalidState(format!(
                "frame {} is already tracked",
                count
            )));
        }
        frames.insert(count, frame);
        Ok(())
    }

    pub fn get(&self, frame_count: u32) -> Option<Frame> {
        lock(&self.frames).get(&frame_count).cloned()
    }

    pub fn contains(&self, frame_count: u32) -> bool {
        lock(&self.frames).contains_key(&frame_count)
    }

    /// Unconditional removal
    pub fn remove(&self, frame_count: u32) -> Option<Frame> {
        let frame = lock(&self.frames).remove(&frame_count);
        if frame.is_some() {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Remove the frame only if it is complete and not pinned by a selector.
    /// True on the single call that actually removed it.
    pub fn remove_completed(&self, frame_count: u32) -> bool {
        let mut frames = lock(&self.frames);
        let removable = frames
            .get(&frame_count)
            .is_some_and(|frame| frame.is_complete() && !frame.is_locked());
        if removable {
            frames.remove(&frame_count);
            self.removed.fetch_add(1, Ordering::Relaxed);
            trace!("F{} removed from tracking list", frame_count);
        }
        removable
    }

    /// Remove and return every frame not pinned by a selector
    pub fn drain_unlocked(&self) -> Vec<Frame> {
        let mut frames = lock(&self.frames);
        let counts: Vec<u32> = frames
            .iter()
            .filter(|(_, frame)| !frame.is_locked())
            .map(|(count, _)| *count)
            .collect();
        let drained: Vec<Frame> = counts
            .iter()
            .filter_map(|count| frames.remove(count))
            .collect();
        self.removed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.frames).is_empty()
    }

    pub fn snapshot(&self) -> Vec<Frame> {
        lock(&self.frames).values().cloned().collect()
    }

    pub fn frame_counts(&self) -> Vec<u32> {
        lock(&self.frames).keys().copied().collect()
    }

    /// Total removals since creation
    pub fn removed_total(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FrameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameList")
            .field("frames", &self.frame_counts())
            .finish()
    }
}
