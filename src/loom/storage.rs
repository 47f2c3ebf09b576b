use std::sync::{Arc, PoisonError, RwLock};

use derive_more::{Deref, Display};

use super::{
    device::{Allocator, Device},
    num::{DataType, Scalar},
};
use crate::{
    error::{Error, Result},
    hal::gpu::WgpuDevice,
};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct StorageId(uid::Id<StorageId>);

#[derive(Debug)]
enum Memory {
    /// Backed by 8-byte words so that any element type can be viewed in place.
    Host(Box<[u64]>),
    Device {
        buffer: wgpu::Buffer,
        device: Arc<WgpuDevice>,
    },
}

/// Raw memory handed out by an [`Allocator`], on the host or in accelerator memory.
#[derive(Debug)]
pub struct Buffer {
    memory: Memory,
    size: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::zeroed(0)
    }
}

impl Buffer {
    /// Zeroed host memory of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        let words = vec![0u64; size.div_ceil(size_of::<u64>())].into_boxed_slice();
        let memory = Memory::Host(words);
        Self { memory, size }
    }

    /// Zeroed memory of `size` bytes on `device`.
    pub fn on_device(device: &Arc<WgpuDevice>, size: usize) -> Self {
        let buffer = device.create_buffer(size);
        let device = device.clone();
        let memory = Memory::Device { buffer, device };
        Self { memory, size }
    }

    /// Size in bytes requested at allocation.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn device_buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.memory {
            Memory::Host(_) => None,
            Memory::Device { buffer, .. } => Some(buffer),
        }
    }

    fn read<T: Scalar, R>(&self, len: usize, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        match &self.memory {
            Memory::Host(words) => Ok(f(&bytemuck::cast_slice(&words[..])[..len])),
            Memory::Device { buffer, device } => {
                let words = device.download(buffer)?;
                Ok(f(&bytemuck::cast_slice(&words[..])[..len]))
            }
        }
    }

    fn write<T: Scalar, R>(&mut self, len: usize, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        match &mut self.memory {
            Memory::Host(words) => Ok(f(&mut bytemuck::cast_slice_mut(&mut words[..])[..len])),
            Memory::Device { buffer, device } => {
                let mut words = device.download(buffer)?;
                let output = f(&mut bytemuck::cast_slice_mut(&mut words[..])[..len]);
                device.upload(buffer, &words);
                Ok(output)
            }
        }
    }
}

#[derive(Debug)]
struct StorageInner {
    id: StorageId,
    r#type: DataType,
    len: usize,
    allocator: Arc<dyn Allocator>,
    buffer: RwLock<Buffer>,
}

impl Drop for StorageInner {
    fn drop(&mut self) {
        let lock = self.buffer.get_mut().unwrap_or_else(PoisonError::into_inner);
        let buffer = std::mem::take(lock);
        self.allocator.release(buffer);
    }
}

/// A buffer of `len` elements of one [`DataType`], owned by the allocator that created it.
///
/// Each handle holds one reference. References are only added through [`Storage::copy_ref`];
/// dropping the last handle returns the buffer to its allocator.
#[derive(Debug)]
pub struct Storage(Arc<StorageInner>);

impl Storage {
    pub fn new(allocator: &Arc<dyn Allocator>, r#type: DataType, len: usize) -> Result<Self> {
        let buffer = allocator.allocate(r#type, len)?;
        let inner = StorageInner {
            id: StorageId(uid::Id::new()),
            r#type,
            len,
            allocator: allocator.clone(),
            buffer: RwLock::new(buffer),
        };
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn id(&self) -> StorageId {
        self.0.id
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.0.r#type
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.0.allocator.device()
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.0.allocator
    }

    /// Adds a reference to the same buffer.
    #[inline]
    pub fn copy_ref(&self) -> Self {
        Self(self.0.clone())
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn check_type<T: Scalar>(&self) -> Result<()> {
        match T::DATA_TYPE == self.0.r#type {
            true => Ok(()),
            false => Err(Error::Type {
                expected: self.0.r#type,
                found: T::DATA_TYPE,
            }),
        }
    }

    /// The accelerator buffer holding the elements, if they live in accelerator memory.
    pub fn device_buffer(&self) -> Option<wgpu::Buffer> {
        let buffer = self.0.buffer.read().expect("failed to lock");
        buffer.device_buffer().cloned()
    }

    /// Runs `f` over the elements while holding a shared lock.
    /// Accelerator memory is copied to the host first.
    pub fn read<T: Scalar, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        self.check_type::<T>()?;
        let buffer = self.0.buffer.read().expect("failed to lock");
        buffer.read(self.0.len, f)
    }

    /// Runs `f` over the elements while holding an exclusive lock.
    /// Accelerator memory is copied to the host and back.
    pub fn write<T: Scalar, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        self.check_type::<T>()?;
        let mut buffer = self.0.buffer.write().expect("failed to lock");
        buffer.write(self.0.len, f)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use crate::loom::{
        device::DeviceRegistry,
        num::DataType,
    };

    use super::Storage;

    #[test]
    fn test_release_once() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let storage = Storage::new(&allocator, DataType::F32, 6)?;
        let alias = storage.copy_ref();
        assert_eq!(storage.ref_count(), 2);
        assert!(storage.ptr_eq(&alias));

        storage.write(|data: &mut [f32]| data.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))?;
        assert_eq!(alias.read(|data: &[f32]| data[4])?, 5.0);
        assert!(alias.read(|data: &[u32]| data[0]).is_err());

        drop(storage);
        assert_eq!(allocator.stats().releases, 0);
        drop(alias);

        let stats = allocator.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.live_bytes, 0);
        Ok(())
    }
}
