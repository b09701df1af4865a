pub mod budget;
pub mod buffer;
pub mod manager;

pub use budget::MemoryBudget;
pub use buffer::{Buffer, BufferHandle, PixelFormat, Plane, MAX_BUFFERS};
pub use manager::{AllocationMode, BufferManager, BufferManagerConfig, BufferManagerStats};
