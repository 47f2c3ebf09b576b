pub mod error;
pub mod expr;
pub mod hal;
pub mod loom;

pub use error::{ConfigError, Error, Result, ShapeError};
pub use expr::{SVar, TExpr, TVar};
pub use loom::{
    device::{Allocator, Arch, Device, DeviceConfig, DeviceMemory, DeviceRegistry, init_devices},
    num::{DataType, Scalar},
    storage::Storage,
    tensor::Tensor,
};
