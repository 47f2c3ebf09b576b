use std::{
    fmt::Debug,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use cpu::CpuAllocator;
pub use gpu::{GpuAllocator, GpuContext, MemoryBudget};

use super::{num::DataType, storage::Buffer};
use crate::{
    error::{ConfigError, Result},
    hal::{
        blas::{Blas, BlasLease},
        cpu::HostBlas,
        gpu::{
            KernelLauncher,
            compiler::{CompileBackend, NagaBackend},
        },
    },
};

pub mod cpu;
pub mod gpu;

/// Environment variable overriding the default kernel cache directory.
pub const CACHE_DIR_ENV: &str = "WEFT_KERNEL_CACHE_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Device {
    #[display("cpu")]
    Cpu,
    #[display("gpu:{_0}")]
    Gpu(usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Arch {
    #[default]
    #[display("cpu")]
    Cpu,
    #[display("gpu")]
    Gpu,
}

/// Where accelerator buffers live.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceMemory {
    /// Device memory of a `wgpu` adapter. Built-in kernels run on it.
    #[default]
    #[display("wgpu")]
    Wgpu,
    /// Host memory accounted against the device budget, for machines without an adapter.
    /// Every operation runs on the host.
    #[display("host")]
    Host,
}

/// Snapshot of an allocator's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: usize,
    pub releases: usize,
    pub live_bytes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct AllocCounters {
    allocations: AtomicUsize,
    releases: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl AllocCounters {
    pub fn allocate(&self, size: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn release(&self, size: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AllocStats {
        AllocStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Creates and releases the buffers of one device.
pub trait Allocator: Send + Sync + Debug {
    fn device(&self) -> Device;

    /// Allocates a zeroed buffer of `len` elements.
    fn allocate(&self, r#type: DataType, len: usize) -> Result<Buffer>;

    /// Takes back a buffer created by [`Allocator::allocate`].
    fn release(&self, buffer: Buffer);

    /// Leases the device's matrix backend together with a handle.
    fn blas(&self) -> Result<BlasLease<'_>>;

    fn stats(&self) -> AllocStats;

    /// Launches built-in kernels on this allocator's memory, if it lives on an accelerator.
    fn launcher(&self) -> Option<KernelLauncher<'_>> {
        None
    }
}

pub fn default_cache_dir() -> PathBuf {
    match std::env::var_os(CACHE_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from("kernel_cache").join("general"),
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceConfig {
    pub arch: Arch,
    /// Accelerator ids. Ignored for [`Arch::Cpu`].
    pub devices: Vec<usize>,
    /// Share of each accelerator's memory reserved for tensors.
    pub memory_fraction: f32,
    /// Memory of each accelerator in bytes.
    pub device_memory: usize,
    pub compiler_flags: Vec<String>,
    pub cache_dir: PathBuf,
    /// Matrix backend handles created per device up front.
    pub blas_handles: usize,
    pub memory: DeviceMemory,
    /// Requests a software adapter for [`DeviceMemory::Wgpu`].
    pub force_fallback_adapter: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Cpu,
            devices: vec![0],
            memory_fraction: 0.9,
            device_memory: 4 << 30,
            compiler_flags: vec![],
            cache_dir: default_cache_dir(),
            blas_handles: 1,
            memory: DeviceMemory::Wgpu,
            force_fallback_adapter: false,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.memory_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::MemoryFraction(fraction));
        }
        if self.arch == Arch::Gpu {
            if self.devices.is_empty() {
                return Err(ConfigError::NoDevice);
            }
            if let Some(&id) = self.devices.iter().duplicates().next() {
                return Err(ConfigError::DuplicateDevice(id));
            }
        }
        Ok(())
    }
}

/// Hands out one memoized allocator per device.
///
/// For [`Arch::Cpu`] every id maps to the single host allocator. For [`Arch::Gpu`] allocators are
/// constructed on first request; the first one initializes the shared [`GpuContext`].
#[derive(Debug)]
pub struct DeviceRegistry {
    config: DeviceConfig,
    blas: Arc<dyn Blas>,
    backend: Arc<dyn CompileBackend>,
    precompile: bool,
    context: Mutex<Option<Arc<GpuContext>>>,
    allocators: Mutex<HashMap<usize, Arc<dyn Allocator>>>,
}

impl DeviceRegistry {
    pub fn builder() -> DeviceRegistryBuilder {
        DeviceRegistryBuilder::new()
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Initializes the accelerator context once. Later calls return the same context.
    pub fn context(&self) -> Result<Arc<GpuContext>> {
        if self.config.arch != Arch::Gpu {
            return Err(ConfigError::Arch(Arch::Gpu).into());
        }
        let mut context = self.context.lock().expect("failed to lock");
        match context.as_ref() {
            Some(context) => Ok(context.clone()),
            None => {
                let blas = self.blas.clone();
                let backend = self.backend.clone();
                let created = Arc::new(GpuContext::new(&self.config, blas, backend, self.precompile)?);
                *context = Some(created.clone());
                Ok(created)
            }
        }
    }

    /// Returns the allocator of device `id`, constructing it on first request.
    pub fn allocator(&self, id: usize) -> Result<Arc<dyn Allocator>> {
        let key = match self.config.arch {
            Arch::Cpu => 0,
            Arch::Gpu if self.config.devices.contains(&id) => id,
            Arch::Gpu => {
                let valid = self.config.devices.clone();
                return Err(ConfigError::UnknownDevice { id, valid }.into());
            }
        };

        if let Some(allocator) = self.allocators.lock().expect("failed to lock").get(&key) {
            return Ok(allocator.clone());
        }

        let allocator: Arc<dyn Allocator> = match self.config.arch {
            Arch::Cpu => Arc::new(CpuAllocator::new(self.blas.clone(), self.config.blas_handles)?),
            Arch::Gpu => Arc::new(GpuAllocator::new(self.context()?, id)?),
        };
        let allocator = self
            .allocators
            .lock()
            .expect("failed to lock")
            .entry(key)
            .or_insert(allocator)
            .clone();
        Ok(allocator)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRegistryBuilder {
    pub config: DeviceConfig,
    pub blas: Arc<dyn Blas>,
    pub backend: Arc<dyn CompileBackend>,
    pub precompile: bool,
}

impl Default for DeviceRegistryBuilder {
    fn default() -> Self {
        Self {
            config: Default::default(),
            blas: Arc::new(HostBlas),
            backend: Arc::new(NagaBackend),
            precompile: true,
        }
    }
}

impl DeviceRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn arch(mut self, arch: Arch) -> Self {
        self.config.arch = arch;
        self
    }

    pub fn devices(mut self, devices: impl IntoIterator<Item = usize>) -> Self {
        self.config.devices = devices.into_iter().collect();
        self
    }

    pub fn memory_fraction(mut self, fraction: f32) -> Self {
        self.config.memory_fraction = fraction;
        self
    }

    pub fn device_memory(mut self, size: usize) -> Self {
        self.config.device_memory = size;
        self
    }

    pub fn compiler_flags(mut self, flags: impl IntoIterator<Item: Into<String>>) -> Self {
        self.config.compiler_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn blas_handles(mut self, count: usize) -> Self {
        self.config.blas_handles = count;
        self
    }

    pub fn memory(mut self, memory: DeviceMemory) -> Self {
        self.config.memory = memory;
        self
    }

    pub fn force_fallback_adapter(mut self, force: bool) -> Self {
        self.config.force_fallback_adapter = force;
        self
    }

    pub fn blas(mut self, blas: Arc<dyn Blas>) -> Self {
        self.blas = blas;
        self
    }

    pub fn compile_backend(mut self, backend: Arc<dyn CompileBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Whether to compile the built-in kernels and prune the cache when the context starts.
    pub fn precompile(mut self, precompile: bool) -> Self {
        self.precompile = precompile;
        self
    }

    pub fn build(self) -> Result<DeviceRegistry> {
        self.config.validate()?;
        log::info!(
            "device registry: {} [{}], {} memory",
            self.config.arch,
            self.config.devices.iter().join(", "),
            self.config.memory
        );
        Ok(DeviceRegistry {
            config: self.config,
            blas: self.blas,
            backend: self.backend,
            precompile: self.precompile,
            context: Mutex::new(None),
            allocators: Default::default(),
        })
    }
}

/// Builds a registry for `arch` over `devices`, with default backends.
pub fn init_devices(
    arch: Arch,
    devices: impl IntoIterator<Item = usize>,
    memory_fraction: f32,
    compiler_flags: impl IntoIterator<Item: Into<String>>,
) -> Result<DeviceRegistry> {
    DeviceRegistry::builder()
        .arch(arch)
        .devices(devices)
        .memory_fraction(memory_fraction)
        .compiler_flags(compiler_flags)
        .build()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{error::Error, sync::Arc, thread};

    use super::{Arch, Device, DeviceMemory, DeviceRegistry, init_devices};
    use crate::{
        error::{self, ConfigError},
        hal::gpu::compiler::tests::CountingBackend,
        loom::{num::DataType, tensor::Tensor},
    };

    /// A registry over gpu devices `0` and `1` in host memory whose kernels compile to their own source.
    pub fn gpu_registry(dir: &tempfile::TempDir) -> (DeviceRegistry, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend::default());
        let registry = DeviceRegistry::builder()
            .arch(Arch::Gpu)
            .memory(DeviceMemory::Host)
            .devices([0, 1])
            .device_memory(1 << 20)
            .memory_fraction(0.5)
            .cache_dir(dir.path())
            .compile_backend(backend.clone())
            .build()
            .expect("valid config");
        (registry, backend)
    }

    #[test]
    fn test_cpu_allocator() -> Result<(), Box<dyn Error>> {
        let registry = init_devices(Arch::Cpu, [], 0.9, Vec::<String>::new())?;
        let x = registry.allocator(0)?;
        let y = registry.allocator(7)?;
        assert!(Arc::ptr_eq(&x, &y));
        assert_eq!(x.device(), Device::Cpu);
        assert!(registry.context().is_err());
        Ok(())
    }

    #[test]
    fn test_gpu_allocator() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (registry, backend) = gpu_registry(&dir);

        let x = registry.allocator(1)?;
        let y = registry.allocator(1)?;
        assert!(Arc::ptr_eq(&x, &y));
        assert_eq!(x.device(), Device::Gpu(1));

        // context initialization compiled the built-in kernels exactly once
        let count = backend.count();
        assert!(count > 0);
        let z = registry.allocator(0)?;
        assert_eq!(z.device(), Device::Gpu(0));
        assert_eq!(backend.count(), count);
        assert!(Arc::ptr_eq(&registry.context()?, &registry.context()?));

        match registry.allocator(3) {
            Err(error::Error::Config(ConfigError::UnknownDevice { id, valid })) => {
                assert_eq!(id, 3);
                assert_eq!(valid, vec![0, 1]);
            }
            result => panic!("unexpected result {result:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        let result = init_devices(Arch::Gpu, [], 0.9, Vec::<String>::new());
        assert!(matches!(result, Err(error::Error::Config(ConfigError::NoDevice))));
        let result = init_devices(Arch::Gpu, [0, 0], 0.9, Vec::<String>::new());
        assert!(matches!(result, Err(error::Error::Config(ConfigError::DuplicateDevice(0)))));
        let result = init_devices(Arch::Cpu, [0], 1.5, Vec::<String>::new());
        assert!(matches!(result, Err(error::Error::Config(ConfigError::MemoryFraction(_)))));
    }

    #[test]
    fn test_per_device_threads() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (registry, _) = gpu_registry(&dir);

        thread::scope(|scope| -> Result<(), Box<dyn Error>> {
            let handles = [0, 1].map(|id| {
                let registry = &registry;
                scope.spawn(move || -> Result<f64, error::Error> {
                    let allocator = registry.allocator(id)?;
                    let x = Tensor::new(&allocator, DataType::F32, &[4])?;
                    x.set(&[2], id as f64 + 1.0)?;
                    x.get(&[2])
                })
            });
            for (id, handle) in handles.into_iter().enumerate() {
                let value = handle.join().map_err(|_| "worker panicked")??;
                assert_eq!(value, id as f64 + 1.0);
            }
            Ok(())
        })?;
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_serde() -> Result<(), Box<dyn Error>> {
        use super::DeviceConfig;

        let config = DeviceConfig {
            arch: Arch::Gpu,
            devices: vec![0, 2],
            compiler_flags: vec!["--debug".into()],
            memory: DeviceMemory::Host,
            ..Default::default()
        };
        let json = serde_json::to_string(&config)?;
        assert!(json.contains(r#""arch":"Gpu""#));
        assert!(json.contains(r#""memory":"Host""#));
        let parsed: DeviceConfig = serde_json::from_str(&json)?;
        assert_eq!(parsed, config);
        Ok(())
    }
}
