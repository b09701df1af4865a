//! Frame: one logical capture traveling the stage graph

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::buffer::{Buffer, BufferManager};
use crate::error::{PipelineError, Result};
use crate::frame::entity::{
    BufferSlot, BufferTap, Entity, EntityBufferState, EntityState, Released, SourceBinding,
    StageId,
};
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Continuous preview/streaming frame
    #[default]
    Preview,
    /// Still capture fed back through the graph from a held buffer
    Reprocessing,
    Vision,
    /// Bookkeeping frame that carries no application output
    Internal,
}

/// Aggregate progress across all entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Ready,
    Running,
    Complete,
}

/// Where a frame is relative to a capture selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectorState {
    #[default]
    Base,
    Held,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Auxiliary sensor reading captured alongside the frame (gyro, accel, ...)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuxSample {
    pub sensor: String,
    pub timestamp: Duration,
    pub values: [f32; 3],
}

/// Free-form data stages write as the frame progresses
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameMetadata {
    pub sensor_timestamp: Option<Duration>,
    pub exposure_us: u32,
    /// Exposure-sync count reported by the sensor; falls back to the frame
    /// count when absent
    pub sync_count: Option<u32>,
    pub crop: Option<CropRegion>,
    /// Higher is sharper
    pub focus_score: Option<f32>,
    pub aux: Vec<AuxSample>,
    pub tags: BTreeMap<String, i64>,
}

struct FrameInner {
    frame_count: u32,
    kind: FrameKind,
    stages: Vec<StageId>,
    created_at: Instant,
    entities: Mutex<Vec<Entity>>,
    meta: Mutex<FrameMetadata>,
    locked: AtomicBool,
    selector_state: Mutex<SelectorState>,
}

/// Shared handle to a frame. Clones refer to the same frame.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    /// Build a frame from entities already ordered by traversal
    pub fn new(frame_count: u32, kind: FrameKind, entities: Vec<Entity>) -> Self {
        let stages = entities.iter().map(Entity::stage).collect();
        Self {
            inner: Arc::new(FrameInner {
                frame_count,
                kind,
                stages,
                created_at: Instant::now(),
                entities: Mutex::new(entities),
                meta: Mutex::new(FrameMetadata::default()),
                locked: AtomicBool::new(false),
                selector_state: Mutex::new(SelectorState::Base),
            }),
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.inner.frame_count
    }

    pub fn kind(&self) -> FrameKind {
        self.inner.kind
    }

    pub fn stages(&self) -> &[StageId] {
        &self.inner.stages
    }

    pub fn has_stage(&self, stage: StageId) -> bool {
        self.inner.stages.contains(&stage)
    }

    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` against the entity for `stage` under the frame lock
    pub fn with_entity<R>(&self, stage: StageId, f: impl FnOnce(&mut Entity) -> R) -> Result<R> {
        let mut entities = lock(&self.inner.entities);
        entities
            .iter_mut()
            .find(|entity| entity.stage() == stage)
            .map(f)
            .ok_or(PipelineError::UnknownStage(stage))
    }

    /// Snapshot of one entity
    pub fn entity(&self, stage: StageId) -> Result<Entity> {
        self.with_entity(stage, |entity| entity.clone())
    }

    pub fn entity_state(&self, stage: StageId) -> Result<EntityState> {
        self.with_entity(stage, |entity| entity.state())
    }

    pub fn setup_stage(&self, stage: StageId) -> Result<()> {
        self.with_entity(stage, Entity::setup)?
    }

    pub fn begin_stage(&self, stage: StageId) -> Result<()> {
        self.with_entity(stage, Entity::begin)?
    }

    pub fn complete_stage(&self, stage: StageId, valid: &[bool]) -> Result<EntityState> {
        self.with_entity(stage, |entity| entity.complete(valid))?
    }

    pub fn fail_stage(&self, stage: StageId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.with_entity(stage, |entity| entity.fail(reason))?
    }

    pub fn abort_stage(&self, stage: StageId, reason: &str) -> Result<bool> {
        self.with_entity(stage, |entity| entity.abort(reason))
    }

    /// Abort every entity that has not reached a terminal state
    pub fn abort_remaining(&self, reason: &str) -> usize {
        let mut entities = lock(&self.inner.entities);
        entities
            .iter_mut()
            .filter_map(|entity| entity.abort(reason).then_some(()))
            .count()
    }

    /// Complete iff every entity is terminal
    pub fn is_complete(&self) -> bool {
        lock(&self.inner.entities)
            .iter()
            .all(|entity| entity.state().is_terminal())
    }

    pub fn has_error(&self) -> bool {
        lock(&self.inner.entities)
            .iter()
            .any(|entity| entity.state() == EntityState::Error)
    }

    pub fn state(&self) -> FrameState {
        let entities = lock(&self.inner.entities);
        if entities.iter().all(|entity| entity.state().is_terminal()) {
            FrameState::Complete
        } else if entities.iter().any(|entity| {
            entity.state() == EntityState::Processing || entity.state().is_terminal()
        }) {
            FrameState::Running
        } else {
            FrameState::Ready
        }
    }

    /// First stage in traversal order that is not terminal
    pub fn next_pending_stage(&self) -> Option<StageId> {
        lock(&self.inner.entities)
            .iter()
            .find(|entity| !entity.state().is_terminal())
            .map(Entity::stage)
    }

    pub fn attach_dst(
        &self,
        stage: StageId,
        pos: usize,
        index: usize,
        manager: Arc<BufferManager>,
    ) -> Result<()> {
        self.with_entity(stage, |entity| entity.attach_dst(pos, index, manager))?
    }

    pub fn attach_src(
        &self,
        stage: StageId,
        index: usize,
        manager: Arc<BufferManager>,
    ) -> Result<()> {
        self.with_entity(stage, |entity| entity.attach_src(index, manager))?
    }

    pub(crate) fn drop_dst(&self, stage: StageId, pos: usize) -> Result<()> {
        self.with_entity(stage, |entity| entity.drop_dst(pos))
    }

    pub fn dst_state(&self, stage: StageId, pos: usize) -> Option<EntityBufferState> {
        self.with_entity(stage, |entity| entity.dst_state(pos))
            .ok()
            .flatten()
    }

    /// Resolve a tap to the slot that actually owns the buffer.
    ///
    /// An upstream-bound source tap resolves to the producing stage's output.
    fn resolve<R>(
        entities: &mut [Entity],
        tap: BufferTap,
        f: impl FnOnce(&mut BufferSlot) -> R,
    ) -> Option<R> {
        let (stage, is_source, pos) = {
            let entity = entities.iter().find(|e| e.stage() == tap.stage)?;
            match (tap.is_source, entity.source()) {
                (false, _) => (tap.stage, false, tap.pos),
                (true, SourceBinding::External) => (tap.stage, true, 0),
                (true, SourceBinding::Upstream { stage, pos }) => (stage, false, pos),
                (true, SourceBinding::None) => return None,
            }
        };
        let entity = entities.iter_mut().find(|e| e.stage() == stage)?;
        if is_source {
            Some(f(entity.src_slot_mut()))
        } else {
            entity.dst_slot_mut(pos).map(f)
        }
    }

    fn owned_at(&self, tap: BufferTap) -> Option<(Arc<BufferManager>, usize)> {
        let mut entities = lock(&self.inner.entities);
        Self::resolve(&mut entities, tap, |slot| slot.owned()).flatten()
    }

    /// Buffer state behind `tap`
    pub fn tap_state(&self, tap: BufferTap) -> Option<EntityBufferState> {
        let mut entities = lock(&self.inner.entities);
        Self::resolve(&mut entities, tap, |slot| slot.state)
    }

    /// View of the buffer behind `tap`, if one is owned there.
    ///
    /// The manager is consulted after the frame lock is dropped.
    pub fn buffer_at(&self, tap: BufferTap) -> Option<Buffer> {
        let (manager, index) = self.owned_at(tap)?;
        manager.buffer(index).ok()
    }

    pub fn src_buffer(&self, stage: StageId) -> Option<Buffer> {
        self.buffer_at(BufferTap::src(stage))
    }

    pub fn dst_buffer(&self, stage: StageId, pos: usize) -> Option<Buffer> {
        self.buffer_at(BufferTap::dst(stage, pos))
    }

    /// Move ownership of the buffer behind `tap` out of the frame. The frame
    /// will not release it again.
    pub fn take_buffer(&self, tap: BufferTap) -> Option<(Arc<BufferManager>, usize)> {
        let mut entities = lock(&self.inner.entities);
        Self::resolve(&mut entities, tap, BufferSlot::take).flatten()
    }

    /// Return every buffer the frame still owns to its manager.
    ///
    /// Handles are taken under the frame lock and released after it is
    /// dropped, so each buffer goes back exactly once. Outputs that never
    /// became valid are cancelled rather than put.
    pub fn release_buffers(&self) -> usize {
        let mut released = Vec::new();
        {
            let mut entities = lock(&self.inner.entities);
            for entity in entities.iter_mut() {
                entity.drain_buffers(&mut released);
            }
        }

        let mut count = 0;
        for Released {
            manager,
            index,
            state,
        } in released
        {
            let result = if state == EntityBufferState::Valid {
                manager.put_buffer(index)
            } else {
                manager.cancel_buffer(index)
            };
            match result {
                Ok(()) => count += 1,
                Err(e) => warn!("F{} failed to release buffer: {}", self.frame_count(), e),
            }
        }
        if count > 0 {
            trace!("F{} released {} buffers", self.frame_count(), count);
        }
        count
    }

    /// Number of buffers the frame currently owns
    pub fn owned_buffer_count(&self) -> usize {
        lock(&self.inner.entities)
            .iter()
            .map(|entity| {
                let src = usize::from(entity.src_slot().handle.is_owned());
                let dst = (0..entity.dst_count())
                    .filter(|pos| {
                        entity
                            .dst_slot(*pos)
                            .is_some_and(|slot| slot.handle.is_owned())
                    })
                    .count();
                src + dst
            })
            .sum()
    }

    /// Pin the frame in the tracking list while a selector references it
    pub fn lock(&self) {
        self.inner.locked.store(true, Ordering::Release);
    }

    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::Acquire)
    }

    pub fn selector_state(&self) -> SelectorState {
        *lock(&self.inner.selector_state)
    }

    pub fn set_selector_state(&self, state: SelectorState) {
        *lock(&self.inner.selector_state) = state;
    }

    pub fn meta(&self) -> FrameMetadata {
        lock(&self.inner.meta).clone()
    }

    pub fn update_meta<R>(&self, f: impl FnOnce(&mut FrameMetadata) -> R) -> R {
        f(&mut lock(&self.inner.meta))
    }

    /// Sync count used for numeric capture matching
    pub fn sync_count(&self) -> u32 {
        lock(&self.inner.meta)
            .sync_count
            .unwrap_or(self.inner.frame_count)
    }

    pub fn focus_score(&self) -> Option<f32> {
        lock(&self.inner.meta).focus_score
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_count", &self.inner.frame_count)
            .field("kind", &self.inner.kind)
            .field("stages", &self.inner.stages)
            .field("locked", &self.is_locked())
            .finish()
    }
}
