use std::fmt::Debug;

use derive_more::{Deref, Display};

use crate::{
    error::{Result, ShapeError},
    loom::{device::Device, pool::Pooled, storage::Storage},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Transpose {
    #[default]
    #[display("N")]
    No,
    #[display("T")]
    Yes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MathMode {
    #[default]
    Default,
    /// Allows reduced-precision accumulation units where the backend has them.
    TensorOp,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct BlasHandleId(uid::Id<BlasHandleId>);

/// Per-device context of a matrix backend. Leased exclusively for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlasHandle {
    id: BlasHandleId,
    device: Device,
    math_mode: MathMode,
}

impl BlasHandle {
    pub fn new(device: Device) -> Self {
        Self {
            id: BlasHandleId(uid::Id::new()),
            device,
            math_mode: MathMode::Default,
        }
    }

    #[inline]
    pub fn id(&self) -> BlasHandleId {
        self.id
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn math_mode(&self) -> MathMode {
        self.math_mode
    }

    #[inline]
    pub fn set_math_mode(&mut self, mode: MathMode) {
        self.math_mode = mode;
    }
}

/// A column-major matrix operand: `storage[offset + row + col * ld + batch * stride]`.
#[derive(Debug, Clone, Copy)]
pub struct Matrix<'a> {
    pub storage: &'a Storage,
    pub offset: usize,
    /// Leading dimension, the distance between columns.
    pub ld: usize,
    /// Distance between consecutive matrices of a batch.
    pub stride: usize,
}

impl Matrix<'_> {
    /// Checks that a `rows` by `cols` matrix repeated `batches` times lies within the storage.
    pub fn check(&self, rows: usize, cols: usize, batches: usize) -> Result<()> {
        if rows == 0 || cols == 0 || batches == 0 {
            return Ok(());
        }
        let extent = self.offset + (batches - 1) * self.stride + (rows - 1) + (cols - 1) * self.ld + 1;
        match extent <= self.storage.len() {
            true => Ok(()),
            false => Err(ShapeError::Count(extent, self.storage.len()).into()),
        }
    }
}

/// Arguments of `c := alpha * op(a) * op(b) + beta * c` over `batches` matrices,
/// where `op(a)` is `m` by `k`, `op(b)` is `k` by `n` and `c` is `m` by `n`.
#[derive(Debug, Clone, Copy)]
pub struct Gemm<'a> {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f64,
    pub a: Matrix<'a>,
    pub b: Matrix<'a>,
    pub beta: f64,
    pub c: Matrix<'a>,
    pub batches: usize,
}

impl Gemm<'_> {
    pub fn check(&self) -> Result<()> {
        let (rows_a, cols_a) = match self.trans_a {
            Transpose::No => (self.m, self.k),
            Transpose::Yes => (self.k, self.m),
        };
        let (rows_b, cols_b) = match self.trans_b {
            Transpose::No => (self.k, self.n),
            Transpose::Yes => (self.n, self.k),
        };
        self.a.check(rows_a, cols_a, self.batches)?;
        self.b.check(rows_b, cols_b, self.batches)?;
        self.c.check(self.m, self.n, self.batches)
    }
}

/// A column-major matrix backend.
pub trait Blas: Send + Sync + Debug {
    fn create_handle(&self, device: Device) -> Result<BlasHandle> {
        Ok(BlasHandle::new(device))
    }

    fn destroy_handle(&self, handle: BlasHandle) {
        log::trace!("destroy blas handle {}", handle.id());
    }

    /// Single matrix multiply. `gemm.batches` is 1.
    fn gemm(&self, handle: &mut BlasHandle, gemm: &Gemm) -> Result<()>;

    /// Batched matrix multiply with constant strides between matrices.
    fn gemm_strided_batched(&self, handle: &mut BlasHandle, gemm: &Gemm) -> Result<()>;
}

/// A backend and a handle leased from a device's handle pool.
#[derive(Debug)]
pub struct BlasLease<'a> {
    pub backend: &'a dyn Blas,
    pub handle: Pooled<'a, BlasHandle>,
}
