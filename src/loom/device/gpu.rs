use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use super::{AllocCounters, AllocStats, Allocator, Device, DeviceConfig, DeviceMemory};
use crate::{
    error::{ConfigError, Error, Result},
    hal::{
        blas::{Blas, BlasHandle, BlasLease},
        gpu::{
            cache::KernelDiskCache,
            compiler::{CompileBackend, KernelCompiler},
            device::{KernelLauncher, WgpuDevice},
            kernels::{self, Kernels},
        },
    },
    loom::{num::DataType, pool::ObjectPool, storage::Buffer},
};

/// Allocation granularity on accelerators, in bytes.
pub const ALIGNMENT: usize = 256;

/// Memory reserved on one device, handed out in [`ALIGNMENT`]-sized units.
#[derive(Debug)]
pub struct MemoryBudget {
    device: Device,
    budget: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(device: Device, budget: usize) -> Self {
        Self {
            device,
            budget,
            used: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn padded(size: usize) -> usize {
        size.next_multiple_of(ALIGNMENT)
    }

    /// Reserves `size` bytes, padded to the alignment.
    pub fn reserve(&self, size: usize) -> Result<usize> {
        let padded = Self::padded(size);
        let result = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let total = used.checked_add(padded)?;
                (total <= self.budget).then_some(total)
            });
        match result {
            Ok(_) => Ok(padded),
            Err(used) => Err(Error::OutOfMemory {
                device: self.device,
                requested: size,
                used,
                budget: self.budget,
                ratio: self.ratio_of(used),
            }),
        }
    }

    pub fn free(&self, size: usize) {
        self.used.fetch_sub(Self::padded(size), Ordering::AcqRel);
    }

    #[inline]
    pub fn budget(&self) -> usize {
        self.budget
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn ratio_of(&self, used: usize) -> f64 {
        match self.budget {
            0 => 100.0,
            budget => used as f64 / budget as f64 * 100.0,
        }
    }

    /// Percentage of the budget in use.
    pub fn allocated_ratio(&self) -> f64 {
        self.ratio_of(self.used())
    }
}

/// Resources owned per accelerator.
#[derive(Debug)]
pub struct GpuState {
    id: usize,
    /// Present when buffers live in [`DeviceMemory::Wgpu`].
    wgpu: Option<Arc<WgpuDevice>>,
    budget: MemoryBudget,
    handles: ObjectPool<BlasHandle>,
    counters: AllocCounters,
}

impl GpuState {
    fn new(id: usize, config: &DeviceConfig, blas: &Arc<dyn Blas>) -> Result<Self> {
        let device = Device::Gpu(id);
        let budget = (config.device_memory as f64 * config.memory_fraction as f64) as usize;
        log::info!("reserve {budget} bytes of {} memory on {device}", config.memory);

        let wgpu = match config.memory {
            DeviceMemory::Wgpu => {
                let wgpu = WgpuDevice::request(device, config.force_fallback_adapter)?;
                Some(Arc::new(wgpu))
            }
            DeviceMemory::Host => None,
        };

        let handles = {
            let create = blas.clone();
            let destroy = blas.clone();
            ObjectPool::new(
                config.blas_handles,
                move || create.create_handle(device),
                move |handle| destroy.destroy_handle(handle),
            )?
        };
        Ok(Self {
            id,
            wgpu,
            budget: MemoryBudget::new(device, budget),
            handles,
            counters: Default::default(),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn wgpu(&self) -> Option<&Arc<WgpuDevice>> {
        self.wgpu.as_ref()
    }

    #[inline]
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    #[inline]
    pub fn handles(&self) -> &ObjectPool<BlasHandle> {
        &self.handles
    }
}

/// State shared by all accelerators of a registry: per-device resources and the kernel compiler.
#[derive(Debug)]
pub struct GpuContext {
    states: Vec<GpuState>,
    blas: Arc<dyn Blas>,
    compiler: Arc<KernelCompiler>,
    kernels: Kernels,
}

impl GpuContext {
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn new(
        config: &DeviceConfig,
        blas: Arc<dyn Blas>,
        backend: Arc<dyn CompileBackend>,
        precompile: bool,
    ) -> Result<Self> {
        let states = config
            .devices
            .iter()
            .map(|&id| GpuState::new(id, config, &blas))
            .collect::<Result<Vec<_>>>()?;

        let cache = KernelDiskCache::new(&config.cache_dir)?;
        let compiler = Arc::new(KernelCompiler::new(
            cache,
            backend,
            config.compiler_flags.clone(),
        ));
        kernels::register_headers(&compiler);

        let kernels = Kernels::new();
        if precompile {
            let count = kernels.precompile(&compiler)?;
            let removed = compiler.cache().clean_unused()?;
            log::info!("precompiled {count} kernels, removed {removed} unused cache files");
        }

        Ok(Self {
            states,
            blas,
            compiler,
            kernels,
        })
    }

    fn position(&self, id: usize) -> Result<usize> {
        self.states
            .iter()
            .position(|state| state.id == id)
            .ok_or_else(|| {
                let valid = self.states.iter().map(|state| state.id).collect();
                ConfigError::UnknownDevice { id, valid }.into()
            })
    }

    pub fn state(&self, id: usize) -> Result<&GpuState> {
        Ok(&self.states[self.position(id)?])
    }

    #[inline]
    pub fn compiler(&self) -> &Arc<KernelCompiler> {
        &self.compiler
    }

    #[inline]
    pub fn kernels(&self) -> &Kernels {
        &self.kernels
    }
}

/// Allocator of one accelerator, drawing from its [`MemoryBudget`].
#[derive(Debug)]
pub struct GpuAllocator {
    id: usize,
    index: usize,
    context: Arc<GpuContext>,
}

impl GpuAllocator {
    pub fn new(context: Arc<GpuContext>, id: usize) -> Result<Self> {
        let index = context.position(id)?;
        Ok(Self { id, index, context })
    }

    #[inline]
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    #[inline]
    fn state(&self) -> &GpuState {
        &self.context.states[self.index]
    }

    pub fn allocated_ratio(&self) -> f64 {
        self.state().budget.allocated_ratio()
    }
}

impl Allocator for GpuAllocator {
    #[inline]
    fn device(&self) -> Device {
        Device::Gpu(self.id)
    }

    fn allocate(&self, r#type: DataType, len: usize) -> Result<Buffer> {
        let state = self.state();
        let size = len * r#type.size();
        state.budget.reserve(size)?;
        state.counters.allocate(size);
        match &state.wgpu {
            Some(device) => Ok(Buffer::on_device(device, size)),
            None => Ok(Buffer::zeroed(size)),
        }
    }

    fn release(&self, buffer: Buffer) {
        let state = self.state();
        state.budget.free(buffer.size());
        state.counters.release(buffer.size());
    }

    fn blas(&self) -> Result<BlasLease<'_>> {
        let backend = self.context.blas.as_ref();
        let handle = self.state().handles.get()?;
        Ok(BlasLease { backend, handle })
    }

    #[inline]
    fn stats(&self) -> AllocStats {
        self.state().counters.snapshot()
    }

    fn launcher(&self) -> Option<KernelLauncher<'_>> {
        let device = self.state().wgpu.as_deref()?;
        let compiler = self.context.compiler.as_ref();
        let kernels = &self.context.kernels;
        Some(KernelLauncher {
            device,
            compiler,
            kernels,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{ALIGNMENT, MemoryBudget};
    use crate::{
        error,
        loom::{
            device::{Device, tests::gpu_registry},
            num::DataType,
            tensor::Tensor,
        },
    };

    #[test]
    fn test_budget() {
        let budget = MemoryBudget::new(Device::Gpu(0), 4 * ALIGNMENT);
        assert_eq!(budget.reserve(1).unwrap(), ALIGNMENT);
        assert_eq!(budget.reserve(2 * ALIGNMENT).unwrap(), 2 * ALIGNMENT);
        assert_eq!(budget.allocated_ratio(), 75.0);

        match budget.reserve(ALIGNMENT + 1) {
            Err(error::Error::OutOfMemory { used, ratio, .. }) => {
                assert_eq!(used, 3 * ALIGNMENT);
                assert_eq!(ratio, 75.0);
            }
            result => panic!("unexpected result {result:?}"),
        }

        budget.free(1);
        assert_eq!(budget.used(), 2 * ALIGNMENT);
        assert!(budget.reserve(ALIGNMENT + 1).is_ok());
    }

    #[test]
    fn test_out_of_memory() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (registry, _) = gpu_registry(&dir);
        let allocator = registry.allocator(0)?;

        // half of 1 MiB is reserved
        let x = Tensor::new(&allocator, DataType::F32, &[96, 1024])?;
        assert!(matches!(
            Tensor::new(&allocator, DataType::F32, &[96, 1024]),
            Err(error::Error::OutOfMemory { .. })
        ));
        assert_eq!(allocator.stats().live_bytes, 96 * 1024 * 4);

        drop(x);
        let y = Tensor::new(&allocator, DataType::F32, &[96, 1024])?;
        assert_eq!(y.device()?, Device::Gpu(0));
        assert_eq!(registry.allocator(1)?.stats().allocations, 0);
        Ok(())
    }
}
