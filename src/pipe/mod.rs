pub mod device;
pub mod pipe;
pub mod queue;
pub mod sim;

pub use device::{Completion, CompletionSender, StageDevice, StageJob, StageOutput};
pub use pipe::{OutputBinding, Pipe, PipeMember, PipeStats};
pub use queue::{FrameQueue, QueueStats};
pub use sim::{Behavior, SimulatedHardware, SoftwareStage};
