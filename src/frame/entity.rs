//! Per-stage work record attached to a frame

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferHandle, BufferManager};
use crate::error::{PipelineError, Result};

/// Identifier of one pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub u32);

impl StageId {
    /// Raw capture from the sensor interface
    pub const SENSOR: StageId = StageId(0);
    /// Bayer front-end (3AA)
    pub const BAYER: StageId = StageId(1);
    pub const ISP: StageId = StageId(2);
    /// Scaler / format conversion (MCSC)
    pub const SCALER: StageId = StageId(3);
    /// Down-scaled secondary output
    pub const THUMBNAIL: StageId = StageId(4);
    pub const VISION: StageId = StageId(5);

    fn known_name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("sensor"),
            1 => Some("bayer"),
            2 => Some("isp"),
            3 => Some("scaler"),
            4 => Some("thumbnail"),
            5 => Some("vision"),
            _ => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known_name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "stage{}", self.0),
        }
    }
}

/// Stage state machine: `Unprepared -> Requested -> Processing -> {Complete, Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    Unprepared,
    Requested,
    Processing,
    Complete,
    Error,
}

impl EntityState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EntityState::Complete | EntityState::Error)
    }

    fn can_transition_to(self, next: EntityState) -> bool {
        use EntityState::*;
        matches!(
            (self, next),
            (Unprepared, Requested)
                | (Requested, Processing)
                | (Processing, Complete)
                | (Processing, Error)
        )
    }
}

/// Which buffers a stage needs before it can be dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Consumes a buffer, produces nothing the pipeline tracks
    InputOnly,
    /// Produces buffers from nothing (sensor capture)
    OutputOnly,
    #[default]
    InputOutput,
}

impl EntityType {
    pub fn needs_input(self) -> bool {
        matches!(self, EntityType::InputOnly | EntityType::InputOutput)
    }

    pub fn needs_output(self) -> bool {
        matches!(self, EntityType::OutputOnly | EntityType::InputOutput)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityBufferState {
    #[default]
    NoRequest,
    Requested,
    Processing,
    Valid,
    Error,
}

/// Where a stage reads its input from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceBinding {
    #[default]
    None,
    /// Destination `pos` of an earlier stage of the same frame
    Upstream { stage: StageId, pos: usize },
    /// Buffer attached by the caller, e.g. a held capture handed over for
    /// reprocessing
    External,
}

/// Addresses one buffer of a frame: a stage's source or one of its outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferTap {
    pub stage: StageId,
    #[serde(default)]
    pub is_source: bool,
    #[serde(default)]
    pub pos: usize,
}

impl BufferTap {
    pub fn dst(stage: StageId, pos: usize) -> Self {
        Self {
            stage,
            is_source: false,
            pos,
        }
    }

    pub fn src(stage: StageId) -> Self {
        Self {
            stage,
            is_source: true,
            pos: 0,
        }
    }
}

impl fmt::Display for BufferTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_source {
            write!(f, "{}.src", self.stage)
        } else {
            write!(f, "{}.dst{}", self.stage, self.pos)
        }
    }
}

/// One buffer reference held by an entity
#[derive(Clone, Default)]
pub(crate) struct BufferSlot {
    pub(crate) handle: BufferHandle,
    pub(crate) manager: Option<Arc<BufferManager>>,
    pub(crate) state: EntityBufferState,
}

impl BufferSlot {
    /// Move ownership out, leaving the slot state untouched
    pub(crate) fn take(&mut self) -> Option<(Arc<BufferManager>, usize)> {
        let index = self.handle.take()?;
        self.manager.take().map(|manager| (manager, index))
    }

    pub(crate) fn owned(&self) -> Option<(Arc<BufferManager>, usize)> {
        let index = self.handle.index()?;
        self.manager.clone().map(|manager| (manager, index))
    }

    fn attach(&mut self, index: usize, manager: Arc<BufferManager>) -> Result<()> {
        if self.handle.is_owned() {
            return Err(PipelineError::InvalidState(format!(
                "slot already owns buffer {:?} of {}",
                self.handle,
                manager.name()
            )));
        }
        self.handle = BufferHandle::Owned(index);
        self.manager = Some(manager);
        self.state = EntityBufferState::Requested;
        Ok(())
    }
}

impl fmt::Debug for BufferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSlot")
            .field("handle", &self.handle)
            .field("manager", &self.manager.as_ref().map(|m| m.name()))
            .field("state", &self.state)
            .finish()
    }
}

/// Buffer that left an entity, with the state it was in
pub(crate) struct Released {
    pub(crate) manager: Arc<BufferManager>,
    pub(crate) index: usize,
    pub(crate) state: EntityBufferState,
}

#[derive(Debug, Clone)]
pub struct Entity {
    stage: StageId,
    kind: EntityType,
    source: SourceBinding,
    state: EntityState,
    src: BufferSlot,
    dst: Vec<BufferSlot>,
    requested_at: Option<Instant>,
    processing_at: Option<Instant>,
    done_at: Option<Instant>,
    error: Option<String>,
}

impl Entity {
    pub fn new(stage: StageId, kind: EntityType, source: SourceBinding) -> Self {
        Self {
            stage,
            kind,
            source,
            state: EntityState::Unprepared,
            src: BufferSlot::default(),
            dst: Vec::new(),
            requested_at: None,
            processing_at: None,
            done_at: None,
            error: None,
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn kind(&self) -> EntityType {
        self.kind
    }

    pub fn source(&self) -> SourceBinding {
        self.source
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn requested_at(&self) -> Option<Instant> {
        self.requested_at
    }

    pub fn processing_at(&self) -> Option<Instant> {
        self.processing_at
    }

    pub fn done_at(&self) -> Option<Instant> {
        self.done_at
    }

    pub fn dst_count(&self) -> usize {
        self.dst.len()
    }

    pub fn src_state(&self) -> EntityBufferState {
        self.src.state
    }

    pub fn dst_state(&self, pos: usize) -> Option<EntityBufferState> {
        self.dst.get(pos).map(|slot| slot.state)
    }

    pub fn dst_handle(&self, pos: usize) -> BufferHandle {
        self.dst.get(pos).map(|slot| slot.handle).unwrap_or_default()
    }

    pub fn src_handle(&self) -> BufferHandle {
        self.src.handle
    }

    /// True when at least one output slot still expects a buffer
    pub fn has_requested_output(&self) -> bool {
        self.dst
            .iter()
            .any(|slot| slot.handle.is_owned() && slot.state != EntityBufferState::Error)
    }

    fn transition(&mut self, next: EntityState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                stage: self.stage,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// `Unprepared -> Requested` once buffers are attached
    pub fn setup(&mut self) -> Result<()> {
        self.transition(EntityState::Requested)?;
        self.requested_at = Some(Instant::now());
        Ok(())
    }

    /// `Requested -> Processing` when the stage takes the job
    pub fn begin(&mut self) -> Result<()> {
        self.transition(EntityState::Processing)?;
        self.processing_at = Some(Instant::now());
        for slot in self.dst.iter_mut().chain(std::iter::once(&mut self.src)) {
            if slot.state == EntityBufferState::Requested {
                slot.state = EntityBufferState::Processing;
            }
        }
        Ok(())
    }

    /// Finish processing with one validity flag per output.
    ///
    /// Ends `Complete` if any requested output came back valid, or if the
    /// entity has no outputs at all; otherwise `Error`.
    pub fn complete(&mut self, valid: &[bool]) -> Result<EntityState> {
        if self.state != EntityState::Processing {
            let to = EntityState::Complete;
            return Err(PipelineError::InvalidTransition {
                stage: self.stage,
                from: self.state,
                to,
            });
        }

        let mut requested = 0;
        let mut produced = 0;
        for (pos, slot) in self.dst.iter_mut().enumerate() {
            if slot.state != EntityBufferState::Processing {
                continue;
            }
            requested += 1;
            if valid.get(pos).copied().unwrap_or(false) {
                slot.state = EntityBufferState::Valid;
                produced += 1;
            } else {
                slot.state = EntityBufferState::Error;
            }
        }
        if self.src.state == EntityBufferState::Processing {
            self.src.state = EntityBufferState::Valid;
        }

        let outcome = if produced > 0 || (requested == 0 && !self.kind.needs_output()) {
            EntityState::Complete
        } else {
            self.error = Some("no valid output".to_string());
            EntityState::Error
        };
        self.transition(outcome)?;
        self.done_at = Some(Instant::now());
        Ok(outcome)
    }

    /// `Processing -> Error`, marking every pending output unusable
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(EntityState::Error)?;
        self.mark_pending_error();
        self.error = Some(reason.into());
        self.done_at = Some(Instant::now());
        Ok(())
    }

    /// Drive a non-terminal entity to `Error` through every legal step.
    /// Returns false when it was already terminal.
    pub fn abort(&mut self, reason: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        while !self.state.is_terminal() {
            let next = match self.state {
                EntityState::Unprepared => EntityState::Requested,
                EntityState::Requested => EntityState::Processing,
                _ => EntityState::Error,
            };
            self.state = next;
        }
        self.mark_pending_error();
        self.error = Some(reason.to_string());
        self.done_at = Some(Instant::now());
        true
    }

    fn mark_pending_error(&mut self) {
        for slot in self.dst.iter_mut() {
            if matches!(
                slot.state,
                EntityBufferState::Requested | EntityBufferState::Processing
            ) {
                slot.state = EntityBufferState::Error;
            }
        }
    }

    pub(crate) fn attach_dst(
        &mut self,
        pos: usize,
        index: usize,
        manager: Arc<BufferManager>,
    ) -> Result<()> {
        if self.state.is_terminal() {
            return Err(PipelineError::InvalidState(format!(
                "{} is {:?}, cannot attach output",
                self.stage, self.state
            )));
        }
        if self.dst.len() <= pos {
            self.dst.resize_with(pos + 1, BufferSlot::default);
        }
        self.dst[pos].attach(index, manager)
    }

    pub(crate) fn attach_src(&mut self, index: usize, manager: Arc<BufferManager>) -> Result<()> {
        if self.source != SourceBinding::External {
            return Err(PipelineError::InvalidState(format!(
                "{} reads from {:?}, not an attached buffer",
                self.stage, self.source
            )));
        }
        self.src.attach(index, manager)
    }

    /// Record an output that could not be given a buffer
    pub(crate) fn drop_dst(&mut self, pos: usize) {
        if self.dst.len() <= pos {
            self.dst.resize_with(pos + 1, BufferSlot::default);
        }
        self.dst[pos].state = EntityBufferState::Error;
    }

    pub(crate) fn src_slot_mut(&mut self) -> &mut BufferSlot {
        &mut self.src
    }

    pub(crate) fn src_slot(&self) -> &BufferSlot {
        &self.src
    }

    pub(crate) fn dst_slot(&self, pos: usize) -> Option<&BufferSlot> {
        self.dst.get(pos)
    }

    pub(crate) fn dst_slot_mut(&mut self, pos: usize) -> Option<&mut BufferSlot> {
        self.dst.get_mut(pos)
    }

    /// Take every owned buffer out of the entity
    pub(crate) fn drain_buffers(&mut self, out: &mut Vec<Released>) {
        for slot in std::iter::once(&mut self.src).chain(self.dst.iter_mut()) {
            let state = slot.state;
            if let Some((manager, index)) = slot.take() {
                out.push(Released {
                    manager,
                    index,
                    state,
                });
            }
        }
    }
}
