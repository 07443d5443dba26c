//! Model handles, device placement and loaders.

pub mod device;
pub mod handle;
pub mod reference;

pub use device::{DeviceKind, DevicePlacement, MemoryBudget};
pub use handle::{CancelFlag, ModelHandle, ModelId, ModelLoader, ResidentModel};
pub use reference::{ReferenceModel, ReferenceModelLoader};
