//! The `loom` module provides the memory model every tensor computation is built on.
//! It separates host and accelerator memory behind one allocator interface and describes tensors as
//! strided views over reference-counted storage.
//!
//! ## Key Components
//! 1. **Layouts**:
//!    - Sizes, strides and a storage offset (`Layout`).
//!    - Copy-free views: narrowing, selection, transposition, permutation, reshaping and broadcasting.
//!
//! 2. **Storage and Tensors**:
//!    - `Storage` owns a device buffer and returns it to its allocator exactly once.
//!    - `Tensor` is a typed view over a storage; references are added only through `copy_ref`.
//!
//! 3. **Devices**:
//!    - `DeviceRegistry` builds one allocator per device from a `DeviceConfig`.
//!    - Accelerator allocators share a device context holding memory budgets, math handles and the kernel compiler.
//!    - Accelerator buffers live in `wgpu` device memory, or in host memory under the same budget with `DeviceMemory::Host`.
//!
//! 4. **Numerical System**:
//!    - Element types (`DataType`) and the `Scalar` conversions between them.
//!
//! 5. **Pooling**:
//!    - `ObjectPool` hands out exclusive per-device resources and takes them back on drop.

pub mod device;
pub mod layout;
pub mod num;
pub mod pool;
pub mod storage;
pub mod tensor;
