//! Runtime kernel compilation for accelerators.
//!
//! Kernel templates are specialized with a [`config::KernelConfig`], compiled by a
//! [`compiler::KernelCompiler`] and cached by content in a [`cache::KernelDiskCache`].
//! A [`device::WgpuDevice`] loads the cached binaries and launches them on accelerator memory.

pub mod cache;
pub mod compiler;
pub mod config;
pub mod device;
pub mod kernels;
pub mod template;

pub use cache::KernelDiskCache;
pub use compiler::{CompileBackend, KernelCompiler, NagaBackend};
pub use config::KernelConfig;
pub use device::{KernelLauncher, Launch, WgpuDevice};
pub use template::KernelTemplate;
