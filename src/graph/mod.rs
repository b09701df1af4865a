pub mod graph;
pub mod router;
pub mod topology;

pub use graph::{DeviceSet, GraphState, PipelineGraph, StopReport};
pub use router::{CompletionRouter, FrameSink, RouterStats};
pub use topology::{Link, OperatingMode, OutputDescriptor, StageDescriptor, Topology};
