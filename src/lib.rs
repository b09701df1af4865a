pub mod buffer;
pub mod cancel;
pub mod error;
pub mod frame;
pub mod graph;
pub mod pipe;
pub mod selector;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use buffer::{Buffer, BufferHandle, BufferManager, MemoryBudget};
pub use cancel::CancelToken;
pub use error::{PipelineError, Result};
pub use frame::{Frame, FrameList, StageId};
pub use graph::{CompletionRouter, OperatingMode, PipelineGraph, Topology};
pub use pipe::{Pipe, StageDevice};
pub use selector::{CaptureSelector, SelectRequest, SelectionPolicy};

/// Environment variables override file values, e.g.
/// `CAMPIPE_PIPELINE__STAGE_TIMEOUT_MS=500`
pub const ENV_PREFIX: &str = "CAMPIPE";

/// System configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub selector: SelectorConfig,
    pub mode: OperatingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded depth of every pipe input queue
    pub queue_depth: usize,
    /// How long a pipe waits for a device to complete one job
    pub stage_timeout_ms: u64,
    /// Worker idle wake-up interval
    pub pop_timeout_ms: u64,
    /// `get_buffer` attempts before an output is dropped
    pub buffer_retry_attempts: u32,
    /// Reserved memory shared by all pools; unlimited when unset
    pub memory_budget_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub id: u32,
    pub hold_count: usize,
    /// Default `select_frames` timeout
    pub wait_time_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 8,
            stage_timeout_ms: 500,
            pop_timeout_ms: 100,
            buffer_retry_attempts: 8,
            memory_budget_bytes: None,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        match self.memory_budget_bytes {
            Some(limit) => MemoryBudget::new(limit),
            None => MemoryBudget::unlimited(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            id: 0,
            hold_count: 3,
            wait_time_ms: 2000,
        }
    }
}

impl SelectorConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `CAMPIPE_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            mode = "reprocessing"

            [selector]
            hold_count = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, OperatingMode::Reprocessing);
        assert_eq!(config.selector.hold_count, 5);
        assert_eq!(config.selector.wait_time(), Duration::from_secs(2));
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn bad_value_is_config_error() {
        let result = Config::from_toml_str("[pipeline]\nqueue_depth = \"deep\"");
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
