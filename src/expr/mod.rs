//! Deferred tensor expressions.
//!
//! A [`TExpr`] tree describes a computation without running it. [`TExpr::evaluate`] runs it bottom-up:
//! children are evaluated into fresh intermediates that are dropped as soon as their parent has
//! consumed them, and the root writes into the caller's target when one is given.
//!
//! [`TVar`] is the user-facing handle. It builds trees with operator overloads and view methods, and
//! [`TVar::assign`] evaluates an expression directly into the storage of a value or view.
//!
//! ```
//! # fn main() -> weft::Result<()> {
//! use weft::{DeviceRegistry, TVar, Tensor};
//!
//! let registry = DeviceRegistry::builder().build()?;
//! let allocator = registry.allocator(0)?;
//! let x = TVar::from(Tensor::from_slice(&allocator, &[2], &[1.0f32, 2.0])?);
//! let y = (&x + &x) * 3.0;
//! assert_eq!(y.evaluate()?.to_vec::<f32>()?, vec![6.0, 12.0]);
//! # Ok(())
//! # }
//! ```

use std::{
    ops::{Add, Div, Mul, Neg, Sub},
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    hal::{
        matmul,
        ops::{self, BinaryOp, UnaryOp},
    },
    loom::{device::Allocator, num::DataType, tensor::Tensor},
};

pub mod scalar;

pub use scalar::{SExpr, SVar};

/// A view taken of an evaluated tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewOp {
    Narrow { dim: usize, start: usize, len: usize },
    Select { dim: usize, index: usize },
    Transpose,
    TransposeDims(usize, usize),
    Permute(Vec<usize>),
    View(Vec<usize>),
    Expand(Vec<usize>),
}

impl ViewOp {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            ViewOp::Narrow { dim, start, len } => x.narrow(*dim, *start, *len),
            ViewOp::Select { dim, index } => x.select(*dim, *index),
            ViewOp::Transpose => x.transpose(),
            ViewOp::TransposeDims(dim0, dim1) => x.transpose_dims(*dim0, *dim1),
            ViewOp::Permute(dims) => x.permute(dims),
            ViewOp::View(sizes) => x.view(sizes),
            ViewOp::Expand(sizes) => x.expand(sizes),
        }
    }
}

#[derive(Debug)]
pub enum TExpr {
    /// An existing tensor.
    Value(Tensor),
    /// Host data in row-major order.
    Data {
        allocator: Arc<dyn Allocator>,
        r#type: DataType,
        sizes: Vec<usize>,
        values: Arc<[f64]>,
    },
    View {
        src: Arc<TExpr>,
        op: ViewOp,
    },
    AsType {
        src: Arc<TExpr>,
        r#type: DataType,
    },
    ToDevice {
        src: Arc<TExpr>,
        allocator: Arc<dyn Allocator>,
    },
    ScatterFill {
        src: Arc<TExpr>,
        value: SVar,
        dim: usize,
        indices: Arc<TExpr>,
    },
    Fill {
        allocator: Arc<dyn Allocator>,
        r#type: DataType,
        sizes: Vec<usize>,
        value: SVar,
    },
    Addmm {
        beta: SVar,
        src: Arc<TExpr>,
        alpha: SVar,
        m1: Arc<TExpr>,
        m2: Arc<TExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Arc<TExpr>,
        rhs: Arc<TExpr>,
    },
    Unary {
        op: UnaryOp,
        src: Arc<TExpr>,
    },
    ScalarTensor {
        op: BinaryOp,
        lhs: SVar,
        rhs: Arc<TExpr>,
    },
    TensorScalar {
        op: BinaryOp,
        lhs: Arc<TExpr>,
        rhs: SVar,
    },
    Concat {
        dim: usize,
        inputs: Vec<Arc<TExpr>>,
    },
}

impl TExpr {
    /// Whether the expression names existing storage that can be assigned to.
    pub fn is_valid_lvalue(&self) -> bool {
        match self {
            TExpr::Value(_) => true,
            TExpr::View { src, .. } => src.is_valid_lvalue(),
            _ => false,
        }
    }

    /// Evaluates the expression into `result`, or into a freshly allocated tensor if `None`.
    ///
    /// Evaluating a value without a target returns a new reference to it rather than a copy.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn evaluate(&self, result: Option<&Tensor>) -> Result<Tensor> {
        match self {
            TExpr::Value(value) => match result {
                Some(target) if target.same_view(value) => target.copy_ref(),
                Some(target) => {
                    let allocator = value.allocator()?;
                    let output =
                        ops::write_target(Some(target), &allocator, value.data_type(), value.sizes())?;
                    ops::copy(&output, value)?;
                    Ok(output)
                }
                None => value.copy_ref(),
            },
            TExpr::Data {
                allocator,
                r#type,
                sizes,
                values,
            } => {
                let output = ops::write_target(result, allocator, *r#type, sizes)?;
                output.write_f64(values)?;
                Ok(output)
            }
            TExpr::View { src, op } => {
                if result.is_some() {
                    return Err(Error::Lvalue("cannot evaluate a view into another tensor"));
                }
                let src = src.evaluate(None)?;
                op.apply(&src)
            }
            TExpr::AsType { src, r#type } => {
                let src = src.evaluate(None)?;
                ops::cast(result, &src, *r#type)
            }
            TExpr::ToDevice { src, allocator } => {
                let src = src.evaluate(None)?;
                ops::to_device(result, &src, allocator)
            }
            TExpr::ScatterFill {
                src,
                value,
                dim,
                indices,
            } => {
                let indices = indices.evaluate(None)?;
                let output = match (result, src.is_valid_lvalue()) {
                    (Some(target), _) => {
                        let src = src.evaluate(None)?;
                        if target.same_view(&src) {
                            src
                        } else {
                            let output = ops::write_target(
                                Some(target),
                                &src.allocator()?,
                                src.data_type(),
                                src.sizes(),
                            )?;
                            ops::copy(&output, &src)?;
                            output
                        }
                    }
                    // a value would be written through, so it is copied first
                    (None, true) => {
                        let src = src.evaluate(None)?;
                        let output = Tensor::new(&src.allocator()?, src.data_type(), src.sizes())?;
                        ops::copy(&output, &src)?;
                        output
                    }
                    (None, false) => src.evaluate(None)?,
                };
                ops::scatter_fill(&output, value.evaluate(), *dim, &indices)?;
                Ok(output)
            }
            TExpr::Fill {
                allocator,
                r#type,
                sizes,
                value,
            } => {
                let output = ops::write_target(result, allocator, *r#type, sizes)?;
                ops::fill(&output, value.evaluate())?;
                Ok(output)
            }
            TExpr::Addmm {
                beta,
                src,
                alpha,
                m1,
                m2,
            } => {
                let src = src.evaluate(None)?;
                let m1 = m1.evaluate(None)?;
                let m2 = m2.evaluate(None)?;
                matmul::addmm(result, beta.evaluate(), &src, alpha.evaluate(), &m1, &m2)
            }
            TExpr::Binary { op, lhs, rhs } => {
                let lhs = lhs.evaluate(None)?;
                let rhs = rhs.evaluate(None)?;
                ops::binary(result, *op, &lhs, &rhs)
            }
            TExpr::Unary { op, src } => {
                let src = src.evaluate(None)?;
                ops::unary(result, *op, &src)
            }
            TExpr::ScalarTensor { op, lhs, rhs } => {
                let rhs = rhs.evaluate(None)?;
                ops::scalar_tensor(result, *op, lhs.evaluate(), &rhs)
            }
            TExpr::TensorScalar { op, lhs, rhs } => {
                let lhs = lhs.evaluate(None)?;
                ops::tensor_scalar(result, *op, &lhs, rhs.evaluate())
            }
            TExpr::Concat { dim, inputs } => {
                let inputs = inputs
                    .iter()
                    .map(|input| input.evaluate(None))
                    .collect::<Result<Vec<_>>>()?;
                let inputs: Vec<&Tensor> = inputs.iter().collect();
                ops::concat(result, *dim, &inputs)
            }
        }
    }
}

/// A shared handle to a tensor expression.
#[derive(Debug, Clone)]
pub struct TVar(Arc<TExpr>);

impl From<Tensor> for TVar {
    fn from(value: Tensor) -> Self {
        Self::new(TExpr::Value(value))
    }
}

impl From<TExpr> for TVar {
    fn from(value: TExpr) -> Self {
        Self::new(value)
    }
}

impl TVar {
    pub fn new(expr: TExpr) -> Self {
        Self(Arc::new(expr))
    }

    #[inline]
    pub fn expr(&self) -> &TExpr {
        &self.0
    }

    #[inline]
    pub fn is_valid_lvalue(&self) -> bool {
        self.0.is_valid_lvalue()
    }

    /// Evaluates into a fresh tensor.
    pub fn evaluate(&self) -> Result<Tensor> {
        self.0.evaluate(None)
    }

    /// Evaluates into `target`.
    pub fn evaluate_into(&self, target: &Tensor) -> Result<Tensor> {
        self.0.evaluate(Some(target))
    }

    /// Evaluates `rhs` into the storage named by this expression.
    pub fn assign(&self, rhs: &TVar) -> Result<()> {
        if !self.is_valid_lvalue() {
            return Err(Error::Lvalue("only values and views of values can be assigned to"));
        }
        let target = self.evaluate()?;
        rhs.evaluate_into(&target)?;
        Ok(())
    }

    pub fn data(
        allocator: &Arc<dyn Allocator>,
        r#type: DataType,
        sizes: &[usize],
        values: impl Into<Arc<[f64]>>,
    ) -> Self {
        Self::new(TExpr::Data {
            allocator: allocator.clone(),
            r#type,
            sizes: sizes.to_vec(),
            values: values.into(),
        })
    }

    pub fn fill(
        allocator: &Arc<dyn Allocator>,
        r#type: DataType,
        sizes: &[usize],
        value: impl Into<SVar>,
    ) -> Self {
        Self::new(TExpr::Fill {
            allocator: allocator.clone(),
            r#type,
            sizes: sizes.to_vec(),
            value: value.into(),
        })
    }

    fn view_op(&self, op: ViewOp) -> Self {
        Self::new(TExpr::View {
            src: self.0.clone(),
            op,
        })
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Self {
        self.view_op(ViewOp::Narrow { dim, start, len })
    }

    pub fn select(&self, dim: usize, index: usize) -> Self {
        self.view_op(ViewOp::Select { dim, index })
    }

    pub fn transpose(&self) -> Self {
        self.view_op(ViewOp::Transpose)
    }

    pub fn transpose_dims(&self, dim0: usize, dim1: usize) -> Self {
        self.view_op(ViewOp::TransposeDims(dim0, dim1))
    }

    pub fn permute(&self, dims: &[usize]) -> Self {
        self.view_op(ViewOp::Permute(dims.to_vec()))
    }

    pub fn view(&self, sizes: &[usize]) -> Self {
        self.view_op(ViewOp::View(sizes.to_vec()))
    }

    pub fn expand(&self, sizes: &[usize]) -> Self {
        self.view_op(ViewOp::Expand(sizes.to_vec()))
    }

    pub fn as_type(&self, r#type: DataType) -> Self {
        Self::new(TExpr::AsType {
            src: self.0.clone(),
            r#type,
        })
    }

    pub fn to_device(&self, allocator: &Arc<dyn Allocator>) -> Self {
        Self::new(TExpr::ToDevice {
            src: self.0.clone(),
            allocator: allocator.clone(),
        })
    }

    pub fn scatter_fill(&self, value: impl Into<SVar>, dim: usize, indices: &TVar) -> Self {
        Self::new(TExpr::ScatterFill {
            src: self.0.clone(),
            value: value.into(),
            dim,
            indices: indices.0.clone(),
        })
    }

    /// `beta * self + alpha * m1 * m2`.
    pub fn addmm(&self, beta: impl Into<SVar>, alpha: impl Into<SVar>, m1: &TVar, m2: &TVar) -> Self {
        Self::new(TExpr::Addmm {
            beta: beta.into(),
            src: self.0.clone(),
            alpha: alpha.into(),
            m1: m1.0.clone(),
            m2: m2.0.clone(),
        })
    }

    pub fn concat(dim: usize, inputs: &[TVar]) -> Self {
        Self::new(TExpr::Concat {
            dim,
            inputs: inputs.iter().map(|input| input.0.clone()).collect(),
        })
    }

    pub fn binary(&self, op: BinaryOp, rhs: &TVar) -> Self {
        Self::new(TExpr::Binary {
            op,
            lhs: self.0.clone(),
            rhs: rhs.0.clone(),
        })
    }

    pub fn unary(&self, op: UnaryOp) -> Self {
        Self::new(TExpr::Unary {
            op,
            src: self.0.clone(),
        })
    }

    pub fn tensor_scalar(&self, op: BinaryOp, rhs: impl Into<SVar>) -> Self {
        Self::new(TExpr::TensorScalar {
            op,
            lhs: self.0.clone(),
            rhs: rhs.into(),
        })
    }

    pub fn scalar_tensor(op: BinaryOp, lhs: impl Into<SVar>, rhs: &TVar) -> Self {
        Self::new(TExpr::ScalarTensor {
            op,
            lhs: lhs.into(),
            rhs: rhs.0.clone(),
        })
    }

    pub fn pow(&self, exponent: impl Into<SVar>) -> Self {
        self.tensor_scalar(BinaryOp::Pow, exponent)
    }

    pub fn max(&self, rhs: &TVar) -> Self {
        self.binary(BinaryOp::Max, rhs)
    }

    pub fn min(&self, rhs: &TVar) -> Self {
        self.binary(BinaryOp::Min, rhs)
    }

    pub fn abs(&self) -> Self {
        self.unary(UnaryOp::Abs)
    }

    pub fn sign(&self) -> Self {
        self.unary(UnaryOp::Sign)
    }

    pub fn sqrt(&self) -> Self {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn exp(&self) -> Self {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Self {
        self.unary(UnaryOp::Log)
    }

    pub fn tanh(&self) -> Self {
        self.unary(UnaryOp::Tanh)
    }

    pub fn sigmoid(&self) -> Self {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn relu(&self) -> Self {
        self.unary(UnaryOp::Relu)
    }
}

impl Neg for TVar {
    type Output = TVar;

    fn neg(self) -> Self::Output {
        self.unary(UnaryOp::Neg)
    }
}

impl Neg for &TVar {
    type Output = TVar;

    fn neg(self) -> Self::Output {
        self.unary(UnaryOp::Neg)
    }
}

macro_rules! impl_tensor_op {
    ($trait:ident, $fn:ident, $op:expr) => {
        impl $trait<&TVar> for &TVar {
            type Output = TVar;

            fn $fn(self, rhs: &TVar) -> Self::Output {
                self.binary($op, rhs)
            }
        }

        impl $trait<TVar> for TVar {
            type Output = TVar;

            fn $fn(self, rhs: TVar) -> Self::Output {
                self.binary($op, &rhs)
            }
        }

        impl $trait<&TVar> for TVar {
            type Output = TVar;

            fn $fn(self, rhs: &TVar) -> Self::Output {
                self.binary($op, rhs)
            }
        }

        impl $trait<SVar> for &TVar {
            type Output = TVar;

            fn $fn(self, rhs: SVar) -> Self::Output {
                self.tensor_scalar($op, rhs)
            }
        }

        impl $trait<SVar> for TVar {
            type Output = TVar;

            fn $fn(self, rhs: SVar) -> Self::Output {
                self.tensor_scalar($op, rhs)
            }
        }

        impl $trait<f64> for &TVar {
            type Output = TVar;

            fn $fn(self, rhs: f64) -> Self::Output {
                self.tensor_scalar($op, rhs)
            }
        }

        impl $trait<f64> for TVar {
            type Output = TVar;

            fn $fn(self, rhs: f64) -> Self::Output {
                self.tensor_scalar($op, rhs)
            }
        }

        impl $trait<&TVar> for f64 {
            type Output = TVar;

            fn $fn(self, rhs: &TVar) -> Self::Output {
                TVar::scalar_tensor($op, self, rhs)
            }
        }

        impl $trait<TVar> for f64 {
            type Output = TVar;

            fn $fn(self, rhs: TVar) -> Self::Output {
                TVar::scalar_tensor($op, self, &rhs)
            }
        }
    };
}

impl_tensor_op!(Add, add, BinaryOp::Add);
impl_tensor_op!(Sub, sub, BinaryOp::Sub);
impl_tensor_op!(Mul, mul, BinaryOp::Mul);
impl_tensor_op!(Div, div, BinaryOp::Div);

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{SVar, TVar};
    use crate::{
        error,
        hal::ops::BinaryOp,
        loom::{
            device::{DeviceRegistry, tests::gpu_registry},
            num::DataType,
            tensor::Tensor,
        },
    };

    #[test]
    fn test_arithmetic() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let x = TVar::from(Tensor::from_slice(&allocator, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?);
        let y = TVar::data(&allocator, DataType::F32, &[2, 2], vec![10.0, 20.0, 30.0, 40.0]);

        let z = (&x + &y) * 2.0 - 1.0;
        assert_eq!(z.evaluate()?.to_vec::<f32>()?, vec![21.0, 43.0, 65.0, 87.0]);

        let z = 1.0 / &x;
        assert_eq!(z.evaluate()?.to_vec::<f32>()?, vec![1.0, 0.5, 1.0 / 3.0, 0.25]);

        let scale = SVar::from(4.0).sqrt();
        let z = (-&x) * scale;
        assert_eq!(z.evaluate()?.to_vec::<f32>()?, vec![-2.0, -4.0, -6.0, -8.0]);

        let z = x.transpose() - &y;
        assert_eq!(z.evaluate()?.to_vec::<f32>()?, vec![-9.0, -17.0, -28.0, -36.0]);

        let z = TVar::scalar_tensor(BinaryOp::Max, 2.5, &x).pow(2.0);
        assert_eq!(z.evaluate()?.to_vec::<f32>()?, vec![6.25, 6.25, 9.0, 16.0]);
        Ok(())
    }

    #[test]
    fn test_value_is_not_copied() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let tensor = Tensor::from_slice(&allocator, &[3], &[1.0f64, 2.0, 3.0])?;
        let x = TVar::from(tensor.copy_ref()?);
        let allocations = allocator.stats().allocations;

        let y = x.evaluate()?;
        assert!(y.same_view(&tensor));
        let y = x.narrow(0, 1, 2).evaluate()?;
        assert_eq!(y.to_vec::<f64>()?, vec![2.0, 3.0]);
        assert_eq!(allocator.stats().allocations, allocations);

        // a value evaluated into itself is left alone
        let y = x.expr().evaluate(Some(&tensor))?;
        assert!(y.same_view(&tensor));
        Ok(())
    }

    #[test]
    fn test_write_target() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let x = TVar::from(Tensor::from_slice(&allocator, &[2], &[1.0f32, 2.0])?);
        let target = Tensor::new(&allocator, DataType::F32, &[2])?;
        let before = allocator.stats().allocations;

        let z = (&x * &x).abs().sqrt().evaluate_into(&target)?;
        assert!(z.same_view(&target));
        assert_eq!(target.to_vec::<f32>()?, vec![1.0, 2.0]);
        // only the intermediates of the children are allocated
        assert_eq!(allocator.stats().allocations, before + 2);
        assert_eq!(allocator.stats().live_bytes, 4 * 2 * 2);

        let wrong = Tensor::new(&allocator, DataType::F32, &[3])?;
        assert!((&x + 1.0).evaluate_into(&wrong).is_err());

        // views refuse a write target
        assert!(matches!(
            x.transpose_dims(0, 0).evaluate_into(&target),
            Err(error::Error::Lvalue(_))
        ));
        Ok(())
    }

    #[test]
    fn test_assign() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let tensor = Tensor::new(&allocator, DataType::F32, &[2, 3])?;
        let x = TVar::from(tensor.copy_ref()?);

        let row = x.select(0, 1);
        assert!(row.is_valid_lvalue());
        row.assign(&TVar::fill(&allocator, DataType::F32, &[3], 5.0))?;
        assert_eq!(tensor.to_vec::<f32>()?, vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0]);

        x.narrow(1, 0, 1).assign(&TVar::data(&allocator, DataType::F32, &[2, 1], vec![7.0, 8.0]))?;
        assert_eq!(tensor.to_vec::<f32>()?, vec![7.0, 0.0, 0.0, 8.0, 5.0, 5.0]);

        x.assign(&(&x + &x))?;
        assert_eq!(tensor.to_vec::<f32>()?, vec![14.0, 0.0, 0.0, 16.0, 10.0, 10.0]);

        let sum = &x + 1.0;
        assert!(!sum.is_valid_lvalue());
        assert!(matches!(sum.assign(&x), Err(error::Error::Lvalue(_))));
        Ok(())
    }

    #[test]
    fn test_composite() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let a = TVar::from(Tensor::from_slice(&allocator, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?);
        let b = TVar::from(Tensor::from_slice(&allocator, &[2, 2], &[5.0f32, 6.0, 7.0, 8.0])?);
        let c = TVar::fill(&allocator, DataType::F32, &[2, 2], 1.0);
        let d = c.addmm(0.5, SVar::from(1.0) + 1.0, &a, &b);
        assert_eq!(d.evaluate()?.to_vec::<f32>()?, vec![38.5, 44.5, 86.5, 100.5]);

        let e = TVar::concat(1, &[a.clone(), b.relu(), a.sigmoid().as_type(DataType::F64).as_type(DataType::F32)]);
        let e = e.evaluate()?;
        assert_eq!(e.sizes(), &[2, 6]);
        assert_eq!(e.get(&[1, 3])?, 8.0);

        let indices = TVar::data(&allocator, DataType::I32, &[2, 1], vec![1.0, 0.0]);
        let f = a.scatter_fill(-1.0, 1, &indices).evaluate()?;
        assert_eq!(f.to_vec::<f32>()?, vec![1.0, -1.0, -1.0, 4.0]);
        // the source value is untouched
        assert_eq!(a.evaluate()?.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_scatter_fill_into_target() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let x = Tensor::from_slice(&allocator, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let a = TVar::from(x.copy_ref()?);
        let indices = TVar::data(&allocator, DataType::I32, &[2, 1], vec![1.0, 0.0]);

        let target = Tensor::new(&allocator, DataType::F32, &[2, 2])?;
        let output = a.transpose().scatter_fill(-1.0, 1, &indices).evaluate_into(&target)?;
        assert!(output.same_view(&target));
        assert_eq!(target.to_vec::<f32>()?, vec![1.0, -1.0, -1.0, 4.0]);
        assert_eq!(x.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);

        // filling into the source itself writes in place
        a.scatter_fill(0.0, 1, &indices).evaluate_into(&x)?;
        assert_eq!(x.to_vec::<f32>()?, vec![1.0, 0.0, 0.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_to_device() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (registry, _) = gpu_registry(&dir);
        let gpu0 = registry.allocator(0)?;
        let gpu1 = registry.allocator(1)?;

        let x = TVar::data(&gpu0, DataType::F32, &[3], vec![1.0, 2.0, 3.0]);
        let y = x.to_device(&gpu1).evaluate()?;
        assert_eq!(y.device()?, gpu1.device());
        assert_eq!(y.to_vec::<f32>()?, vec![1.0, 2.0, 3.0]);

        let z = &x + &TVar::from(y);
        assert!(matches!(z.evaluate(), Err(error::Error::Device { .. })));
        // intermediates are released on the error path
        assert_eq!(gpu0.stats().live_bytes, 0);
        Ok(())
    }
}
