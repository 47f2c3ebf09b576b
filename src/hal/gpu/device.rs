//! Accelerator memory and kernel launches through `wgpu`.
//!
//! Every accelerator id opens its own logical [`wgpu::Device`]. Tensor storage lives in
//! [`wgpu::Buffer`]s created with [`WgpuDevice::create_buffer`]; element access goes through
//! [`WgpuDevice::download`] and [`WgpuDevice::upload`], while dense `f32` operations run the
//! compiled built-in kernels with a [`Launch`].

use std::{
    num::NonZeroU64,
    sync::{Arc, Mutex},
};

use futures::executor::block_on;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use wgpu::util::DeviceExt;

use super::{
    compiler::KernelCompiler,
    kernels::{BINARY_ENTRY, BLOCK_SIZE, FILL_ENTRY, Kernels, UNARY_ENTRY},
};
use crate::{
    error::{Error, Result},
    hal::ops::{BinaryOp, UnaryOp},
    loom::{
        device::{Allocator, Device, MemoryBudget, gpu::ALIGNMENT},
        num::DataType,
        tensor::Tensor,
    },
};

const SPIRV_MAGIC: [u8; 4] = 0x0723_0203u32.to_le_bytes();

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

type PipelineKey = (Arc<[u8]>, &'static str);

/// A logical `wgpu` device backing one accelerator id.
#[derive(Debug)]
pub struct WgpuDevice {
    id: Device,
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_groups: usize,
    pipelines: Mutex<HashMap<PipelineKey, wgpu::ComputePipeline>>,
}

impl WgpuDevice {
    /// Requests an adapter and opens a device with the adapter's full limits.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn request(id: Device, force_fallback_adapter: bool) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let options = wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter,
            compatible_surface: None,
        };
        let adapter = block_on(instance.request_adapter(&options))?;
        let info = adapter.get_info();
        log::info!("{id}: adapter {} ({:?})", info.name, info.backend);

        let descriptor = wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        };
        let (device, queue) = block_on(adapter.request_device(&descriptor))?;
        let max_groups = device.limits().max_compute_workgroups_per_dimension as usize;
        Ok(Self {
            id,
            device,
            queue,
            max_groups,
            pipelines: Default::default(),
        })
    }

    #[inline]
    pub fn id(&self) -> Device {
        self.id
    }

    /// Number of kernels loaded as pipelines.
    pub fn loaded(&self) -> usize {
        self.pipelines.lock().expect("failed to lock").len()
    }

    /// Whether a kernel over `len` elements fits in one dispatch.
    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        len > 0 && len.div_ceil(BLOCK_SIZE) <= self.max_groups
    }

    /// Creates a zeroed storage buffer of at least `size` bytes.
    pub fn create_buffer(&self, size: usize) -> wgpu::Buffer {
        let size = MemoryBudget::padded(size).max(ALIGNMENT) as u64;
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: STORAGE_USAGE,
            mapped_at_creation: false,
        })
    }

    /// Copies the whole of `buffer` back to the host, waiting for queued work on it.
    pub fn download(&self, buffer: &wgpu::Buffer) -> Result<Vec<u64>> {
        let size = buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            _ = sender.send(result);
        });
        _ = self.device.poll(wgpu::PollType::Wait);
        receiver
            .recv()
            .map_err(|_| Error::Resource("buffer mapping was abandoned"))??;

        let view = slice.get_mapped_range();
        let words: Vec<u64> = bytemuck::pod_collect_to_vec(&view[..]);
        drop(view);
        staging.unmap();
        Ok(words)
    }

    /// Overwrites the start of `buffer` with `words`. Ordered before any later submission.
    pub fn upload(&self, buffer: &wgpu::Buffer, words: &[u64]) {
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(words));
    }

    fn pipeline(&self, binary: &Arc<[u8]>, entry: &'static str) -> Result<wgpu::ComputePipeline> {
        if !binary.starts_with(&SPIRV_MAGIC) {
            let log = format!("kernel '{entry}' is not a spir-v binary");
            return Err(Error::Compile { log });
        }

        let mut pipelines = self.pipelines.lock().expect("failed to lock");
        let key = (binary.clone(), entry);
        if let Some(pipeline) = pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        log::debug!("{}: load kernel '{entry}'", self.id);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(entry),
            source: wgpu::util::make_spirv(binary),
        });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: None,
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            });
        pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Runs `entry` of `binary` with `bindings` in order at group 0, one invocation per element.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn launch(
        &self,
        binary: &Arc<[u8]>,
        entry: &'static str,
        bindings: &[wgpu::BufferBinding<'_>],
        len: usize,
    ) -> Result<()> {
        let pipeline = self.pipeline(binary, entry)?;
        let layout = pipeline.get_bind_group_layout(0);
        let entries = bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| wgpu::BindGroupEntry {
                binding: index as u32,
                resource: wgpu::BindingResource::Buffer(binding.clone()),
            })
            .collect_vec();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(entry),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(len.div_ceil(BLOCK_SIZE) as u32, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

/// The built-in kernels of a device context, bound to one accelerator.
#[derive(Debug, Clone, Copy)]
pub struct KernelLauncher<'a> {
    pub device: &'a WgpuDevice,
    pub compiler: &'a KernelCompiler,
    pub kernels: &'a Kernels,
}

/// A kernel launch over dense `f32` tensors in accelerator memory.
#[derive(Debug)]
pub struct Launch<'a> {
    launcher: KernelLauncher<'a>,
    output: wgpu::Buffer,
    inputs: Vec<wgpu::Buffer>,
    len: usize,
}

impl<'a> Launch<'a> {
    /// Prepares a launch writing `output` from `inputs`.
    ///
    /// Returns `None` unless the allocator runs kernels, every tensor is a dense `f32` tensor at
    /// offset zero in its memory and the output shares no buffer with an input.
    pub fn new(allocator: &'a dyn Allocator, output: &Tensor, inputs: &[&Tensor]) -> Option<Self> {
        let launcher = allocator.launcher()?;
        let len = output.len();
        if !launcher.device.fits(len) {
            return None;
        }

        let storage = output.storage().ok()?;
        let aliased = inputs
            .iter()
            .any(|input| input.storage().is_ok_and(|x| x.ptr_eq(storage)));
        if aliased {
            return None;
        }

        let buffer = |tensor: &Tensor| {
            let layout = tensor.layout();
            let dense = tensor.data_type() == DataType::F32
                && tensor.device().ok()? == launcher.device.id()
                && layout.offset() == 0
                && layout.is_contiguous();
            match dense {
                true => tensor.storage().ok()?.device_buffer(),
                false => None,
            }
        };
        let output = buffer(output)?;
        let inputs = inputs.iter().map(|&input| buffer(input)).collect::<Option<Vec<_>>>()?;
        Some(Self {
            launcher,
            output,
            inputs,
            len,
        })
    }

    fn binding<'b>(&self, buffer: &'b wgpu::Buffer) -> wgpu::BufferBinding<'b> {
        let size = NonZeroU64::new((self.len * DataType::F32.size()) as u64);
        wgpu::BufferBinding {
            buffer,
            offset: 0,
            size,
        }
    }

    pub fn fill(&self, value: f32) -> Result<()> {
        let KernelLauncher {
            device,
            compiler,
            kernels,
        } = self.launcher;
        let binary = kernels.fill(compiler, DataType::F32)?;
        let params = device
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("fill params"),
                contents: bytemuck::bytes_of(&value),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let bindings = [params.as_entire_buffer_binding(), self.binding(&self.output)];
        device.launch(&binary, FILL_ENTRY, &bindings, self.len)
    }

    pub fn binary(&self, op: BinaryOp) -> Result<()> {
        let KernelLauncher {
            device,
            compiler,
            kernels,
        } = self.launcher;
        let binary = kernels.binary(compiler, op, DataType::F32)?;
        let bindings = [
            self.binding(&self.inputs[0]),
            self.binding(&self.inputs[1]),
            self.binding(&self.output),
        ];
        device.launch(&binary, BINARY_ENTRY, &bindings, self.len)
    }

    pub fn unary(&self, op: UnaryOp) -> Result<()> {
        let KernelLauncher {
            device,
            compiler,
            kernels,
        } = self.launcher;
        let binary = kernels.unary(compiler, op)?;
        let bindings = [self.binding(&self.inputs[0]), self.binding(&self.output)];
        device.launch(&binary, UNARY_ENTRY, &bindings, self.len)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use crate::{
        error,
        hal::ops::{self, BinaryOp, UnaryOp},
        loom::{
            device::{Arch, DeviceRegistry},
            num::DataType,
            tensor::Tensor,
        },
    };

    macro_rules! assert_approx_eq {
        ($i:expr, $a:expr, $b:expr, $eps:expr) => {
            assert!(
                ($a - $b).abs() <= $eps * $b.abs().max(1.0),
                "assertion failed at {}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
                $i,
                $a,
                $b
            );
        };
    }

    /// A registry over one `wgpu` device, or `None` on machines without an adapter.
    fn wgpu_registry(dir: &tempfile::TempDir) -> Result<Option<DeviceRegistry>, Box<dyn Error>> {
        let registry = DeviceRegistry::builder()
            .arch(Arch::Gpu)
            .devices([0])
            .device_memory(64 << 20)
            .cache_dir(dir.path())
            .build()?;
        match registry.allocator(0) {
            Ok(_) => Ok(Some(registry)),
            Err(error::Error::RequestAdapter(err)) => {
                log::warn!("no wgpu adapter: {err}");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    #[test]
    fn test_device_memory() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let Some(registry) = wgpu_registry(&dir)? else {
            return Ok(());
        };
        let allocator = registry.allocator(0)?;

        let x = Tensor::from_slice(&allocator, &[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        assert!(x.storage()?.device_buffer().is_some());
        assert_eq!(x.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(x.transpose()?.to_vec::<f32>()?, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        x.set(&[1, 2], 9.0)?;
        assert_eq!(x.get(&[1, 2])?, 9.0);
        assert_eq!(x.get(&[0, 0])?, 1.0);

        let y = Tensor::from_slice(&allocator, &[3], &[1i32, -2, 3])?;
        assert_eq!(y.to_vec::<i32>()?, vec![1, -2, 3]);
        let z = Tensor::new(&allocator, DataType::F64, &[5])?;
        assert_eq!(z.to_vec::<f64>()?, vec![0.0; 5]);

        drop((x, y, z));
        assert_eq!(allocator.stats().live_bytes, 0);
        Ok(())
    }

    #[test]
    fn test_kernel_launch() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let Some(registry) = wgpu_registry(&dir)? else {
            return Ok(());
        };
        let allocator = registry.allocator(0)?;
        let context = registry.context()?;
        let device = context.state(0)?.wgpu().ok_or("no wgpu device")?.clone();

        const N: usize = 1000;
        let a = (0..N).map(|x| x as f32 / 100.0 - 5.0).collect_vec();
        let b = (0..N).map(|x| 1.0 + x as f32).collect_vec();
        let x = Tensor::from_slice(&allocator, &[N], &a)?;
        let y = Tensor::from_slice(&allocator, &[N], &b)?;

        let z = ops::binary(None, BinaryOp::Mul, &x, &y)?;
        for (index, (&z, (&a, &b))) in z.to_vec::<f32>()?.iter().zip_eq(a.iter().zip_eq(&b)).enumerate() {
            assert_approx_eq!(index, z, a * b, 1e-6);
        }
        let w = ops::unary(None, UnaryOp::Sigmoid, &x)?;
        for (index, (&w, &a)) in w.to_vec::<f32>()?.iter().zip_eq(&a).enumerate() {
            assert_approx_eq!(index, w, 1.0 / (1.0 + (-a).exp()), 1e-4);
        }
        ops::fill(&z, 2.5)?;
        assert_eq!(z.to_vec::<f32>()?, vec![2.5; N]);
        assert_eq!(device.loaded(), 3);

        // aliased and strided operands run on the host
        ops::binary(Some(&x), BinaryOp::Add, &x, &y)?;
        assert_approx_eq!("in place", x.get(&[10])? as f32, a[10] + b[10], 1e-6);
        let t = Tensor::from_slice(&allocator, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let u = ops::unary(None, UnaryOp::Neg, &t.transpose()?)?;
        assert_eq!(u.to_vec::<f32>()?, vec![-1.0, -3.0, -2.0, -4.0]);
        assert_eq!(device.loaded(), 3);
        Ok(())
    }
}
