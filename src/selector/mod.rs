pub mod policy;
pub mod selector;

pub use policy::{HoldFilter, SelectRequest, SelectionPolicy};
pub use selector::{CaptureSelector, SelectedFrame, SelectorStats};
