//! Tensor operations executed on the storage of their operands.
//!
//! Every operation producing a tensor takes an optional write target. With `None` a fresh contiguous
//! tensor is allocated from the first operand's allocator; with `Some(target)` the result is written
//! into `target` after checking its sizes and element type, and a new reference to it is returned.
//!
//! Fill and the element-wise operations run as kernels when all operands are dense `f32` tensors
//! in `wgpu` memory; everything else runs on the host.

use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;

use crate::{
    error::{Error, Result, ShapeError},
    hal::gpu::Launch,
    loom::{
        device::Allocator,
        num::{DataType, dispatch},
        tensor::Tensor,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
}

impl BinaryOp {
    pub const ALL: [Self; 7] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Pow,
        Self::Max,
        Self::Min,
    ];

    #[inline]
    pub fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            Self::Add => x + y,
            Self::Sub => x - y,
            Self::Mul => x * y,
            Self::Div => x / y,
            Self::Pow => x.powf(y),
            Self::Max => x.max(y),
            Self::Min => x.min(y),
        }
    }

    /// The operation in kernel source, over operands `x` and `y`.
    pub fn kernel_expr(self) -> &'static str {
        match self {
            Self::Add => "x + y",
            Self::Sub => "x - y",
            Self::Mul => "x * y",
            Self::Div => "x / y",
            Self::Pow => "pow(x, y)",
            Self::Max => "max(x, y)",
            Self::Min => "min(x, y)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sign,
    Sqrt,
    Exp,
    Log,
    Tanh,
    Sigmoid,
    Relu,
}

impl UnaryOp {
    pub const ALL: [Self; 9] = [
        Self::Neg,
        Self::Abs,
        Self::Sign,
        Self::Sqrt,
        Self::Exp,
        Self::Log,
        Self::Tanh,
        Self::Sigmoid,
        Self::Relu,
    ];

    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Abs => x.abs(),
            Self::Sign if x == 0.0 || x.is_nan() => x,
            Self::Sign => x.signum(),
            Self::Sqrt => x.sqrt(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Relu => x.max(0.0),
        }
    }

    /// The operation in kernel source, over operand `x`.
    pub fn kernel_expr(self) -> &'static str {
        match self {
            Self::Neg => "-x",
            Self::Abs => "abs(x)",
            Self::Sign => "sign(x)",
            Self::Sqrt => "sqrt(x)",
            Self::Exp => "exp(x)",
            Self::Log => "log(x)",
            Self::Tanh => "tanh(x)",
            Self::Sigmoid => "sigmoid(x)",
            Self::Relu => "relu(x)",
        }
    }
}

pub(crate) fn check_type(expected: DataType, tensor: &Tensor) -> Result<()> {
    match tensor.data_type() == expected {
        true => Ok(()),
        false => Err(Error::Type {
            expected,
            found: tensor.data_type(),
        }),
    }
}

pub(crate) fn check_device(x: &Tensor, y: &Tensor) -> Result<()> {
    let (expected, found) = (x.device()?, y.device()?);
    match expected == found {
        true => Ok(()),
        false => Err(Error::Device { expected, found }),
    }
}

fn check_sizes(x: &Tensor, y: &Tensor) -> Result<()> {
    match x.sizes() == y.sizes() {
        true => Ok(()),
        false => Err(ShapeError::Operand(x.sizes().to_vec(), y.sizes().to_vec()).into()),
    }
}

/// Returns a reference to `result` if given, checking it against `r#type` and `sizes`;
/// otherwise allocates a contiguous tensor from `allocator`.
pub fn write_target(
    result: Option<&Tensor>,
    allocator: &Arc<dyn Allocator>,
    r#type: DataType,
    sizes: &[usize],
) -> Result<Tensor> {
    match result {
        Some(target) => {
            if target.sizes() != sizes {
                let target = target.sizes().to_vec();
                let result = sizes.to_vec();
                return Err(ShapeError::Target { target, result }.into());
            }
            check_type(r#type, target)?;
            target.copy_ref()
        }
        None => Tensor::new(allocator, r#type, sizes),
    }
}

/// Copies the elements of `src` into `dst` in logical order, converting the element type if needed.
/// Both must hold the same number of elements; they may live on different devices.
pub fn copy(dst: &Tensor, src: &Tensor) -> Result<()> {
    if dst.len() != src.len() {
        return Err(ShapeError::Count(src.len(), dst.len()).into());
    }
    match dst.data_type() == src.data_type() {
        true => dispatch!(src.data_type(), T => dst.write_slice(&src.to_vec::<T>()?)),
        false => dst.write_f64(&src.to_f64_vec()?),
    }
}

/// Sets every element of `dst` to `value`.
pub fn fill(dst: &Tensor, value: f64) -> Result<()> {
    let allocator = dst.allocator()?;
    if let Some(launch) = Launch::new(allocator.as_ref(), dst, &[]) {
        return launch.fill(value as f32);
    }
    dst.write_f64(&vec![value; dst.len()])
}

/// # Element-wise Binary Operation
/// Applies `op` to each pair of elements of `lhs` and `rhs`.
///
/// ## Errors
/// - [`ShapeError::Operand`] if the sizes differ;
/// - [`Error::Type`] if the element types differ;
/// - [`Error::Device`] if the operands are on different devices.
pub fn binary(result: Option<&Tensor>, op: BinaryOp, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    check_sizes(lhs, rhs)?;
    check_type(lhs.data_type(), rhs)?;
    check_device(lhs, rhs)?;

    let allocator = lhs.allocator()?;
    let output = write_target(result, &allocator, lhs.data_type(), lhs.sizes())?;
    check_device(lhs, &output)?;

    // pow of a negative base is undefined in kernels
    if op != BinaryOp::Pow {
        if let Some(launch) = Launch::new(allocator.as_ref(), &output, &[lhs, rhs]) {
            launch.binary(op)?;
            return Ok(output);
        }
    }

    let x = lhs.to_f64_vec()?;
    let y = rhs.to_f64_vec()?;
    let z = x.into_iter().zip_eq(y).map(|(x, y)| op.apply(x, y)).collect_vec();
    output.write_f64(&z)?;
    Ok(output)
}

/// Applies `op` to each element of `src`.
pub fn unary(result: Option<&Tensor>, op: UnaryOp, src: &Tensor) -> Result<Tensor> {
    let allocator = src.allocator()?;
    let output = write_target(result, &allocator, src.data_type(), src.sizes())?;
    check_device(src, &output)?;

    if let Some(launch) = Launch::new(allocator.as_ref(), &output, &[src]) {
        launch.unary(op)?;
        return Ok(output);
    }

    let x = src.to_f64_vec()?;
    let z = x.into_iter().map(|x| op.apply(x)).collect_vec();
    output.write_f64(&z)?;
    Ok(output)
}

/// Computes `op(lhs, x)` for each element `x` of `rhs`.
pub fn scalar_tensor(result: Option<&Tensor>, op: BinaryOp, lhs: f64, rhs: &Tensor) -> Result<Tensor> {
    let y = rhs.to_f64_vec()?;
    let z = y.into_iter().map(|y| op.apply(lhs, y)).collect_vec();

    let output = write_target(result, &rhs.allocator()?, rhs.data_type(), rhs.sizes())?;
    check_device(rhs, &output)?;
    output.write_f64(&z)?;
    Ok(output)
}

/// Computes `op(x, rhs)` for each element `x` of `lhs`.
pub fn tensor_scalar(result: Option<&Tensor>, op: BinaryOp, lhs: &Tensor, rhs: f64) -> Result<Tensor> {
    let x = lhs.to_f64_vec()?;
    let z = x.into_iter().map(|x| op.apply(x, rhs)).collect_vec();

    let output = write_target(result, &lhs.allocator()?, lhs.data_type(), lhs.sizes())?;
    check_device(lhs, &output)?;
    output.write_f64(&z)?;
    Ok(output)
}

/// Converts `src` to another element type on the same device.
pub fn cast(result: Option<&Tensor>, src: &Tensor, r#type: DataType) -> Result<Tensor> {
    let output = write_target(result, &src.allocator()?, r#type, src.sizes())?;
    copy(&output, src)?;
    Ok(output)
}

/// Copies `src` to the device of `allocator`.
pub fn to_device(result: Option<&Tensor>, src: &Tensor, allocator: &Arc<dyn Allocator>) -> Result<Tensor> {
    let output = write_target(result, allocator, src.data_type(), src.sizes())?;
    copy(&output, src)?;
    Ok(output)
}

/// Writes `value` into `dst` at every position along `dim` named by `indices`.
///
/// `indices` has the rank of `dst` and matches its sizes in every dimension except `dim`;
/// for each index position `p`, `dst[p with p[dim] = indices[p]]` is set.
pub fn scatter_fill(dst: &Tensor, value: f64, dim: usize, indices: &Tensor) -> Result<()> {
    let rank = dst.rank();
    if dim >= rank {
        return Err(ShapeError::Dim { dim, rank }.into());
    }
    let consistent = indices.rank() == rank
        && (0..rank)
            .filter(|&d| d != dim)
            .all(|d| indices.sizes()[d] == dst.sizes()[d]);
    if !consistent {
        return Err(ShapeError::Operand(dst.sizes().to_vec(), indices.sizes().to_vec()).into());
    }
    check_device(dst, indices)?;

    let values = indices.to_f64_vec()?;
    let size = dst.sizes()[dim];
    let positions = indices
        .sizes()
        .iter()
        .map(|&size| 0..size)
        .multi_cartesian_product()
        .zip_eq(values)
        .map(|(mut position, index)| {
            if !(index >= 0.0) || index.fract() != 0.0 {
                return Err(Error::InvalidIndex { value: index, dim });
            }
            let index = index as usize;
            if index >= size {
                return Err(Error::Index { index, dim, size });
            }
            position[dim] = index;
            Ok(position)
        })
        .collect::<Result<Vec<_>>>()?;
    for position in positions {
        dst.set(&position, value)?;
    }
    Ok(())
}

/// Concatenates `inputs` along `dim`.
///
/// The result has rank `max(dim + 1, max input rank)`; missing dimensions of an input count as
/// size 1. Sizes along `dim` add up, all other dimensions must agree.
pub fn concat(result: Option<&Tensor>, dim: usize, inputs: &[&Tensor]) -> Result<Tensor> {
    let Some(first) = inputs.first() else {
        return Err(ShapeError::ConcatEmpty.into());
    };
    let rank = inputs
        .iter()
        .map(|input| input.rank())
        .max()
        .unwrap_or_default()
        .max(dim + 1);
    fn size_of(input: &Tensor, d: usize) -> usize {
        input.sizes().get(d).copied().unwrap_or(1)
    }

    let mut sizes = vec![0; rank];
    for d in 0..rank {
        sizes[d] = match d == dim {
            true => inputs.iter().map(|input| size_of(input, d)).sum(),
            false => size_of(first, d),
        };
        let consistent = d == dim || inputs.iter().all(|input| size_of(input, d) == sizes[d]);
        if !consistent {
            let shapes = inputs.iter().map(|input| input.sizes().to_vec()).collect();
            return Err(ShapeError::Concat { dim, shapes }.into());
        }
    }

    for input in inputs {
        check_type(first.data_type(), input)?;
        check_device(first, input)?;
    }

    let output = write_target(result, &first.allocator()?, first.data_type(), &sizes)?;
    let mut start = 0;
    for input in inputs {
        let len = size_of(input, dim);
        let slice = output.narrow(dim, start, len)?;
        copy(&slice, input)?;
        start += len;
    }
    Ok(output)
}
