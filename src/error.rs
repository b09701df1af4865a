//! Error types shared by every pipeline component

use std::time::Duration;

use thiserror::Error;

use crate::frame::{EntityState, StageId};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Pool cannot be sized or mapped. Fatal to start-up.
    #[error("buffer allocation failed for {manager}: {reason}")]
    Allocation { manager: String, reason: String },

    /// Pool exhausted. Transient: back off and retry, or fail the single frame.
    #[error("no buffer available in {manager}")]
    NoBufferAvailable { manager: String },

    /// Buffer returned twice. A programming error.
    #[error("double release of buffer {index} in {manager}")]
    DoubleRelease { manager: String, index: usize },

    #[error("buffer index {index} is out of range for {manager}")]
    InvalidBufferIndex { manager: String, index: usize },

    #[error("{manager} is not allocated")]
    NotAllocated { manager: String },

    #[error("{manager} still has {count} buffers in flight")]
    BuffersInFlight { manager: String, count: usize },

    #[error("stage {stage} did not complete frame {frame_count} within {timeout:?}")]
    StageTimeout {
        stage: StageId,
        frame_count: u32,
        timeout: Duration,
    },

    #[error("no frame could be selected within {timeout:?}")]
    SelectionTimeout { timeout: Duration },

    #[error("invalid entity transition on stage {stage}: {from:?} -> {to:?}")]
    InvalidTransition {
        stage: StageId,
        from: EntityState,
        to: EntityState,
    },

    #[error("unknown stage {0}")]
    UnknownStage(StageId),

    #[error("unknown buffer manager {0}")]
    UnknownManager(String),

    #[error("pipe for stage {0} is not running")]
    PipeStopped(StageId),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is already configured")]
    AlreadyConfigured(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("device error on stage {stage}: {reason}")]
    Device { stage: StageId, reason: String },

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl PipelineError {
    pub fn allocation(manager: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Allocation {
            manager: manager.into(),
            reason: reason.into(),
        }
    }

    pub fn device(stage: StageId, reason: impl Into<String>) -> Self {
        Self::Device {
            stage,
            reason: reason.into(),
        }
    }

    /// Errors the caller may recover from locally (retry, drop one output,
    /// fail one frame) while the pipeline keeps running.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoBufferAvailable { .. }
                | Self::StageTimeout { .. }
                | Self::Device { .. }
                | Self::Cancelled
        )
    }

    /// Errors that must be surfaced to the orchestrator and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. }
                | Self::InvalidTransition { .. }
                | Self::DoubleRelease { .. }
                | Self::Topology(_)
        )
    }
}
