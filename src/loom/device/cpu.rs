use std::sync::Arc;

use super::{AllocCounters, AllocStats, Allocator, Device};
use crate::{
    error::Result,
    hal::blas::{Blas, BlasHandle, BlasLease},
    loom::{num::DataType, pool::ObjectPool, storage::Buffer},
};

/// The host allocator. Buffers come straight from the global heap.
#[derive(Debug)]
pub struct CpuAllocator {
    blas: Arc<dyn Blas>,
    handles: ObjectPool<BlasHandle>,
    counters: AllocCounters,
}

impl CpuAllocator {
    pub fn new(blas: Arc<dyn Blas>, handles: usize) -> Result<Self> {
        let handles = {
            let create = blas.clone();
            let destroy = blas.clone();
            ObjectPool::new(
                handles,
                move || create.create_handle(Device::Cpu),
                move |handle| destroy.destroy_handle(handle),
            )?
        };
        let counters = Default::default();
        Ok(Self {
            blas,
            handles,
            counters,
        })
    }
}

impl Allocator for CpuAllocator {
    #[inline]
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn allocate(&self, r#type: DataType, len: usize) -> Result<Buffer> {
        let buffer = Buffer::zeroed(len * r#type.size());
        self.counters.allocate(buffer.size());
        Ok(buffer)
    }

    fn release(&self, buffer: Buffer) {
        self.counters.release(buffer.size());
    }

    fn blas(&self) -> Result<BlasLease<'_>> {
        let backend = self.blas.as_ref();
        let handle = self.handles.get()?;
        Ok(BlasLease { backend, handle })
    }

    #[inline]
    fn stats(&self) -> AllocStats {
        self.counters.snapshot()
    }
}
