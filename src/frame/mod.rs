pub mod entity;
pub mod frame;
pub mod list;

pub use entity::{
    BufferTap, Entity, EntityBufferState, EntityState, EntityType, SourceBinding, StageId,
};
pub use frame::{
    AuxSample, CropRegion, Frame, FrameKind, FrameMetadata, FrameState, SelectorState,
};
pub use list::FrameList;
