//! Declarative stage graph, one per operating mode

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferManagerConfig, PixelFormat};
use crate::error::{PipelineError, Result};
use crate::frame::{BufferTap, EntityType, FrameKind, SourceBinding, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Live preview with a held capture stream
    #[default]
    Preview,
    /// Still capture fed from held buffers
    Reprocessing,
    /// Reduced graph for vision/analysis clients
    Vision,
}

impl OperatingMode {
    pub fn frame_kind(self) -> FrameKind {
        match self {
            OperatingMode::Preview => FrameKind::Preview,
            OperatingMode::Reprocessing => FrameKind::Reprocessing,
            OperatingMode::Vision => FrameKind::Vision,
        }
    }

    pub fn topology(self) -> Topology {
        match self {
            OperatingMode::Preview => Topology::preview(),
            OperatingMode::Reprocessing => Topology::reprocessing(),
            OperatingMode::Vision => Topology::vision(),
        }
    }
}

/// How a stage is chained to the stage before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    /// Hardware-chained: runs in the predecessor's dispatch context
    OnTheFly,
    /// Queued through memory: gets its own pipe
    #[default]
    MemoryToMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub manager: String,
    #[serde(default)]
    pub optional: bool,
}

impl OutputDescriptor {
    pub fn required(manager: &str) -> Self {
        Self {
            manager: manager.to_string(),
            optional: false,
        }
    }

    pub fn optional(manager: &str) -> Self {
        Self {
            manager: manager.to_string(),
            optional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: String,
    #[serde(default)]
    pub kind: EntityType,
    #[serde(default)]
    pub link: Link,
    #[serde(default)]
    pub source: SourceBinding,
    #[serde(default)]
    pub outputs: Vec<OutputDescriptor>,
    /// Can be switched off with `set_request`
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_requested")]
    pub requested_by_default: bool,
}

fn default_requested() -> bool {
    true
}

impl StageDescriptor {
    pub fn new(id: StageId, kind: EntityType) -> Self {
        Self {
            id,
            name: id.to_string(),
            kind,
            link: Link::MemoryToMemory,
            source: SourceBinding::None,
            outputs: Vec::new(),
            optional: false,
            requested_by_default: true,
        }
    }

    pub fn on_the_fly(mut self) -> Self {
        self.link = Link::OnTheFly;
        self
    }

    pub fn reads(mut self, source: SourceBinding) -> Self {
        self.source = source;
        self
    }

    pub fn reads_from(self, stage: StageId, pos: usize) -> Self {
        self.reads(SourceBinding::Upstream { stage, pos })
    }

    pub fn output(mut self, output: OutputDescriptor) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn optional(mut self, requested_by_default: bool) -> Self {
        self.optional = true;
        self.requested_by_default = requested_by_default;
        self
    }
}

/// Stages in traversal order plus the pools they draw from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub mode: OperatingMode,
    pub stages: Vec<StageDescriptor>,
    pub managers: Vec<BufferManagerConfig>,
    /// Output the capture selector holds, if any
    #[serde(default)]
    pub selector_tap: Option<BufferTap>,
}

const PREVIEW_WIDTH: u32 = 640;
const PREVIEW_HEIGHT: u32 = 480;

impl Topology {
    /// Sensor -> Bayer -> ISP (on the fly) -> scaler, with an optional
    /// thumbnail branch. Bayer output is held for still capture.
    pub fn preview() -> Self {
        let (w, h) = (PREVIEW_WIDTH, PREVIEW_HEIGHT);
        Self {
            mode: OperatingMode::Preview,
            stages: vec![
                StageDescriptor::new(StageId::BAYER, EntityType::OutputOnly)
                    .output(OutputDescriptor::required("bayer")),
                StageDescriptor::new(StageId::ISP, EntityType::InputOutput)
                    .on_the_fly()
                    .reads_from(StageId::BAYER, 0)
                    .output(OutputDescriptor::required("isp")),
                StageDescriptor::new(StageId::SCALER, EntityType::InputOutput)
                    .reads_from(StageId::ISP, 0)
                    .output(OutputDescriptor::required("preview")),
                StageDescriptor::new(StageId::THUMBNAIL, EntityType::InputOutput)
                    .on_the_fly()
                    .reads_from(StageId::ISP, 0)
                    .output(OutputDescriptor::optional("thumbnail"))
                    .optional(false),
            ],
            managers: vec![
                BufferManagerConfig::new("bayer", PixelFormat::Raw16, w, h, 8),
                BufferManagerConfig::new("isp", PixelFormat::Nv21, w, h, 4),
                BufferManagerConfig::new("preview", PixelFormat::Nv21, w, h, 6),
                BufferManagerConfig::new("thumbnail", PixelFormat::Nv21, w / 4, h / 4, 2)
                    .on_demand(0),
            ],
            selector_tap: Some(BufferTap::dst(StageId::BAYER, 0)),
        }
    }

    /// Held Bayer buffer in, full-size YUV capture out
    pub fn reprocessing() -> Self {
        let (w, h) = (PREVIEW_WIDTH, PREVIEW_HEIGHT);
        Self {
            mode: OperatingMode::Reprocessing,
            stages: vec![
                StageDescriptor::new(StageId::ISP, EntityType::InputOutput)
                    .reads(SourceBinding::External)
                    .output(OutputDescriptor::required("reprocessing_isp")),
                StageDescriptor::new(StageId::SCALER, EntityType::InputOutput)
                    .on_the_fly()
                    .reads_from(StageId::ISP, 0)
                    .output(OutputDescriptor::required("capture"))
                    .output(OutputDescriptor::optional("capture_thumbnail")),
            ],
            managers: vec![
                BufferManagerConfig::new("reprocessing_isp", PixelFormat::Nv21, w, h, 2),
                BufferManagerConfig::new("capture", PixelFormat::Nv21, w, h, 2),
                BufferManagerConfig::new("capture_thumbnail", PixelFormat::Nv21, w / 4, h / 4, 2),
            ],
            selector_tap: None,
        }
    }

    /// Sensor straight into a vision consumer
    pub fn vision() -> Self {
        Self {
            mode: OperatingMode::Vision,
            stages: vec![
                StageDescriptor::new(StageId::SENSOR, EntityType::OutputOnly)
                    .output(OutputDescriptor::required("vision_raw")),
                StageDescriptor::new(StageId::VISION, EntityType::InputOnly)
                    .reads_from(StageId::SENSOR, 0),
            ],
            managers: vec![BufferManagerConfig::new(
                "vision_raw",
                PixelFormat::Yuyv,
                PREVIEW_WIDTH / 2,
                PREVIEW_HEIGHT / 2,
                4,
            )],
            selector_tap: None,
        }
    }

    pub fn stage(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    fn position(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|stage| stage.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::Topology(msg));

        if self.stages.is_empty() {
            return fail("at least one stage is required".into());
        }

        let mut managers = BTreeSet::new();
        for manager in &self.managers {
            if !managers.insert(manager.name.as_str()) {
                return fail(format!("duplicate buffer manager {}", manager.name));
            }
        }

        let mut ids = BTreeSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if !ids.insert(stage.id) {
                return fail(format!("duplicate stage id {}", stage.id.0));
            }
            if index == 0 && stage.link == Link::OnTheFly {
                return fail(format!("first stage {} cannot be chained on the fly", stage.name));
            }

            for output in &stage.outputs {
                if !managers.contains(output.manager.as_str()) {
                    return fail(format!(
                        "stage {} writes to unknown manager {}",
                        stage.name, output.manager
                    ));
                }
            }

            match stage.kind {
                EntityType::OutputOnly if stage.source != SourceBinding::None => {
                    return fail(format!("output-only stage {} has a source", stage.name));
                }
                EntityType::InputOnly if !stage.outputs.is_empty() => {
                    return fail(format!("input-only stage {} declares outputs", stage.name));
                }
                kind if kind.needs_input() && stage.source == SourceBinding::None => {
                    return fail(format!("stage {} needs a source", stage.name));
                }
                kind if kind.needs_output() && stage.outputs.is_empty() => {
                    return fail(format!("stage {} needs at least one output", stage.name));
                }
                _ => {}
            }

            if let SourceBinding::Upstream { stage: upstream, pos } = stage.source {
                let Some(upstream_index) = self.position(upstream) else {
                    return fail(format!("stage {} reads unknown stage {}", stage.name, upstream));
                };
                if upstream_index >= index {
                    return fail(format!(
                        "stage {} reads {} which does not run before it",
                        stage.name, upstream
                    ));
                }
                let producer = &self.stages[upstream_index];
                if pos >= producer.outputs.len() {
                    return fail(format!(
                        "stage {} reads output {} of {} which has {}",
                        stage.name,
                        pos,
                        upstream,
                        producer.outputs.len()
                    ));
                }
                if producer.optional && !stage.optional {
                    return fail(format!(
                        "stage {} depends on optional stage {}",
                        stage.name, upstream
                    ));
                }
            }
        }

        if let Some(tap) = self.selector_tap {
            let Some(stage) = self.stage(tap.stage) else {
                return fail(format!("selector taps unknown stage {}", tap.stage));
            };
            let ok = if tap.is_source {
                stage.source != SourceBinding::None
            } else {
                tap.pos < stage.outputs.len()
            };
            if !ok {
                return fail(format!("selector tap {} does not name a buffer", tap));
            }
        }
        Ok(())
    }

    /// Stages grouped by dispatch context, in traversal order.
    ///
    /// An on-the-fly stage joins the group of the stage before it.
    pub fn dispatch_contexts(&self) -> Vec<Vec<&StageDescriptor>> {
        let mut groups: Vec<Vec<&StageDescriptor>> = Vec::new();
        for stage in &self.stages {
            match (stage.link, groups.last_mut()) {
                (Link::OnTheFly, Some(group)) => group.push(stage),
                _ => groups.push(vec![stage]),
            }
        }
        groups
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let topology: Topology = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        topology.validate()?;
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for mode in [
            OperatingMode::Preview,
            OperatingMode::Reprocessing,
            OperatingMode::Vision,
        ] {
            let topology = mode.topology();
            topology.validate().unwrap();
            assert_eq!(topology.mode, mode);
        }
    }

    #[test]
    fn on_the_fly_stages_share_a_context() {
        let topology = Topology::preview();
        let groups: Vec<Vec<StageId>> = topology
            .dispatch_contexts()
            .iter()
            .map(|group| group.iter().map(|stage| stage.id).collect())
            .collect();
        assert_eq!(
            groups,
            vec![
                vec![StageId::BAYER, StageId::ISP],
                vec![StageId::SCALER, StageId::THUMBNAIL],
            ]
        );
    }

    #[test]
    fn rejects_forward_reference_and_unknown_manager() {
        let mut topology = Topology::preview();
        topology.stages[0].source = SourceBinding::Upstream {
            stage: StageId::SCALER,
            pos: 0,
        };
        assert!(matches!(topology.validate(), Err(PipelineError::Topology(_))));

        let mut topology = Topology::vision();
        topology.stages[0].outputs[0].manager = "missing".into();
        assert!(topology.validate().is_err());

        let mut topology = Topology::preview();
        topology.selector_tap = Some(BufferTap::dst(StageId::BAYER, 3));
        assert!(topology.validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let toml = r#"
            mode = "vision"

            [[stages]]
            id = 0
            name = "sensor"
            kind = "output_only"
            outputs = [{ manager = "raw" }]

            [[stages]]
            id = 5
            name = "vision"
            kind = "input_only"
            source = { upstream = { stage = 0, pos = 0 } }

            [[managers]]
            name = "raw"
            format = "yuyv"
            width = 64
            height = 48
            max_count = 2
        "#;
        let topology = Topology::from_toml_str(toml).unwrap();
        assert_eq!(topology.stages.len(), 2);
        assert_eq!(topology.stages[1].link, Link::MemoryToMemory);
        assert_eq!(topology.managers[0].min_count, 0);
        assert_eq!(topology.dispatch_contexts().len(), 2);
    }
}
