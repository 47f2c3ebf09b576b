use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;

use crate::loom::{
    device::{Arch, Device},
    num::DataType,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("type error: expected {expected}, found {found}")]
    Type { expected: DataType, found: DataType },
    #[error("type error: {0} is not supported by {1}")]
    Unsupported(DataType, &'static str),
    #[error("device error: tensors on {expected} and {found} must be co-located")]
    Device { expected: Device, found: Device },
    #[error("device error: out of memory on {device}, requested {requested} bytes while {used} of {budget} are in use ({ratio:.1}%)")]
    OutOfMemory {
        device: Device,
        requested: usize,
        used: usize,
        budget: usize,
        ratio: f64,
    },
    #[error("device error: failed to request adapter: {0}")]
    RequestAdapter(#[from] wgpu::RequestAdapterError),
    #[error("device error: failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("device error: failed to map buffer: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),
    #[error("kernel compilation error:\n{log}")]
    Compile { log: String },
    #[error("resource error: {0}")]
    Resource(&'static str),
    #[error("index error: index {index} is out of range for dimension {dim} of size {size}")]
    Index { index: usize, dim: usize, size: usize },
    #[error("index error: {value} is not a valid index for dimension {dim}")]
    InvalidIndex { value: f64, dim: usize },
    #[error("assignment error: {0} cannot be evaluated into a write target")]
    Lvalue(&'static str),
    #[error("io error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        Self::Io { path, source }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to get device {id}, valid devices: [{}]", valid.iter().join(", "))]
    UnknownDevice { id: usize, valid: Vec<usize> },
    #[error("duplicate device {0}")]
    DuplicateDevice(usize),
    #[error("operation requires the {0} architecture")]
    Arch(Arch),
    #[error("no device given for the gpu architecture")]
    NoDevice,
    #[error("memory fraction {0} must lie in (0, 1]")]
    MemoryFraction(f32),
    #[error("all kernel config arguments must be provided, missing [{}], required [{}]", missing.iter().join(", "), required.iter().join(", "))]
    MissingArgs {
        missing: Vec<String>,
        required: Vec<String>,
    },
    #[error("kernel config provides unnecessary arguments [{}], required [{}]", extra.iter().join(", "), required.iter().join(", "))]
    ExtraArgs {
        extra: Vec<String>,
        required: Vec<String>,
    },
    #[error("unknown kernel header '{0}'")]
    UnknownHeader(String),
}

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("matrix multiply of {a:?} and {b:?} cannot produce {c:?}")]
    Matmul {
        a: Vec<usize>,
        b: Vec<usize>,
        c: Vec<usize>,
    },
    #[error("expected a {expected}-d tensor, found {found:?}")]
    Rank { expected: usize, found: Vec<usize> },
    #[error("operand sizes {0:?} and {1:?} do not match")]
    Operand(Vec<usize>, Vec<usize>),
    #[error("write target of sizes {target:?} does not match the result {result:?}")]
    Target {
        target: Vec<usize>,
        result: Vec<usize>,
    },
    #[error("element count {0} does not match {1}")]
    Count(usize, usize),
    #[error("dimension {dim} is out of range for a {rank}-d tensor")]
    Dim { dim: usize, rank: usize },
    #[error("narrow of [{start}, {end}) exceeds size {size} of dimension {dim}")]
    Narrow {
        dim: usize,
        start: usize,
        end: usize,
        size: usize,
    },
    #[error("permutation {0:?} is invalid for a {1}-d tensor")]
    Permute(Vec<usize>, usize),
    #[error("cannot view {from:?} as {to:?}")]
    View { from: Vec<usize>, to: Vec<usize> },
    #[error("cannot expand {from:?} to {to:?}")]
    Expand { from: Vec<usize>, to: Vec<usize> },
    #[error("nothing to concatenate")]
    ConcatEmpty,
    #[error("inconsistent tensor sizes for concatenation along dimension {dim}: {}", shapes.iter().map(|s| format!("{s:?}")).join(", "))]
    Concat { dim: usize, shapes: Vec<Vec<usize>> },
}
