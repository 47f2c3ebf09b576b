//! Matrix multiply over strided tensors.
//!
//! The matrix backend reads and writes column-major matrices only. Each operand is classified by
//! its strides and then reused as is, reused as a transposed view with the backend's transpose flag,
//! or copied once into a column-major temporary. A row-major result is handled by computing the
//! transposed product `c^T = b^T * a^T`, which is column-major in the same memory.

use std::sync::Arc;

use super::{
    blas::{BlasLease, Gemm, MathMode, Matrix, Transpose},
    ops::{self, check_device, check_type},
};
use crate::{
    error::{Error, Result, ShapeError},
    loom::{device::Allocator, num::DataType, tensor::Tensor},
};

/// Memory order of a matrix, from the strides of its row and column dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contiguity {
    /// Unit stride along rows: `strides == [1, ld]`.
    ColumnMajor,
    /// Unit stride along columns: `strides == [ld, 1]`.
    RowMajor,
    /// Anything else, including broadcast and vector-like strides.
    Strided,
}

impl Contiguity {
    pub fn classify([row, col]: [usize; 2]) -> Self {
        match (row, col) {
            (1, col) if col > 1 => Self::ColumnMajor,
            (row, 1) if row > 1 => Self::RowMajor,
            _ => Self::Strided,
        }
    }
}

/// How an operand reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plan {
    /// Passed as is.
    Reuse,
    /// Passed as its transposed view. For an input this sets the transpose flag;
    /// for the result it swaps and transposes all three operands.
    Transpose,
    /// Copied into a column-major temporary; a result is copied back afterwards.
    Copy,
}

impl Plan {
    /// Plan for an input `a` or `b`.
    pub fn for_operand(contiguity: Contiguity) -> Self {
        match contiguity {
            Contiguity::ColumnMajor => Self::Reuse,
            Contiguity::RowMajor => Self::Transpose,
            Contiguity::Strided => Self::Copy,
        }
    }

    /// Plan for the result `c`.
    pub fn for_result(contiguity: Contiguity) -> Self {
        match contiguity {
            Contiguity::ColumnMajor => Self::Reuse,
            Contiguity::RowMajor => Self::Transpose,
            Contiguity::Strided => Self::Copy,
        }
    }
}

/// Indices of the row and column dimensions.
#[derive(Debug, Clone, Copy)]
struct Dims {
    batched: bool,
}

impl Dims {
    #[inline]
    fn rank(self) -> usize {
        if self.batched { 3 } else { 2 }
    }

    #[inline]
    fn row(self) -> usize {
        self.rank() - 2
    }

    #[inline]
    fn col(self) -> usize {
        self.rank() - 1
    }

    fn contiguity(self, x: &Tensor) -> Contiguity {
        let strides = x.strides();
        Contiguity::classify([strides[self.row()], strides[self.col()]])
    }

    fn transpose(self, x: &Tensor) -> Result<Tensor> {
        x.transpose_dims(self.row(), self.col())
    }

    /// Allocates a column-major tensor of the sizes of `x` and copies `x` into it.
    fn column_major(self, x: &Tensor, allocator: &Arc<dyn Allocator>) -> Result<Tensor> {
        let mut sizes = x.sizes().to_vec();
        sizes.swap(self.row(), self.col());
        let temp = Tensor::new(allocator, x.data_type(), &sizes)?;
        let temp = self.transpose(&temp)?;
        ops::copy(&temp, x)?;
        Ok(temp)
    }

    /// Prepares an input operand: returns the stored matrix and the transpose flag.
    fn prepare(self, x: &Tensor, allocator: &Arc<dyn Allocator>) -> Result<(Tensor, Transpose)> {
        match Plan::for_operand(self.contiguity(x)) {
            Plan::Reuse => Ok((x.copy_ref()?, Transpose::No)),
            Plan::Transpose => Ok((self.transpose(x)?, Transpose::Yes)),
            Plan::Copy => Ok((self.column_major(x, allocator)?, Transpose::No)),
        }
    }

    fn matrix(self, x: &Tensor) -> Result<Matrix<'_>> {
        let stride = match self.batched {
            true => x.strides()[0],
            false => 0,
        };
        Ok(Matrix {
            storage: x.storage()?,
            offset: x.layout().offset(),
            ld: x.strides()[self.col()],
            stride,
        })
    }

    fn check(self, a: &Tensor, b: &Tensor, c: &Tensor) -> Result<()> {
        let rank = self.rank();
        for x in [a, b, c] {
            if x.rank() != rank {
                let found = x.sizes().to_vec();
                return Err(ShapeError::Rank {
                    expected: rank,
                    found,
                }
                .into());
            }
        }

        let (row, col) = (self.row(), self.col());
        let (a_sizes, b_sizes, c_sizes) = (a.sizes(), b.sizes(), c.sizes());
        let batches = !self.batched || (a_sizes[0] == c_sizes[0] && b_sizes[0] == c_sizes[0]);
        let valid = batches
            && a_sizes[row] == c_sizes[row]
            && b_sizes[col] == c_sizes[col]
            && a_sizes[col] == b_sizes[row];
        if !valid {
            return Err(ShapeError::Matmul {
                a: a_sizes.to_vec(),
                b: b_sizes.to_vec(),
                c: c_sizes.to_vec(),
            }
            .into());
        }

        let r#type = c.data_type();
        check_type(r#type, a)?;
        check_type(r#type, b)?;
        if !matches!(r#type, DataType::F32 | DataType::F64) {
            return Err(Error::Unsupported(r#type, "matrix multiply"));
        }
        check_device(c, a)?;
        check_device(c, b)?;
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn execute(self, alpha: f64, a: &Tensor, b: &Tensor, beta: f64, c: &Tensor) -> Result<()> {
        self.check(a, b, c)?;
        let allocator = c.allocator()?;

        // choose the column-major result and the operand order
        let (c_work, a_work, b_work, copy_back) = match Plan::for_result(self.contiguity(c)) {
            Plan::Reuse => (c.copy_ref()?, a.copy_ref()?, b.copy_ref()?, false),
            Plan::Transpose => (
                self.transpose(c)?,
                self.transpose(b)?,
                self.transpose(a)?,
                false,
            ),
            Plan::Copy => (
                self.column_major(c, &allocator)?,
                a.copy_ref()?,
                b.copy_ref()?,
                true,
            ),
        };

        let (a_store, trans_a) = self.prepare(&a_work, &allocator)?;
        let (b_store, trans_b) = self.prepare(&b_work, &allocator)?;

        let m = c_work.sizes()[self.row()];
        let n = c_work.sizes()[self.col()];
        let k = a_work.sizes()[self.col()];
        let batches = match self.batched {
            true => c_work.sizes()[0],
            false => 1,
        };
        let gemm = Gemm {
            trans_a,
            trans_b,
            m,
            n,
            k,
            alpha,
            a: self.matrix(&a_store)?,
            b: self.matrix(&b_store)?,
            beta,
            c: self.matrix(&c_work)?,
            batches,
        };

        let BlasLease {
            backend,
            mut handle,
        } = allocator.blas()?;
        handle.set_math_mode(MathMode::TensorOp);
        match self.batched {
            true => backend.gemm_strided_batched(&mut handle, &gemm)?,
            false => backend.gemm(&mut handle, &gemm)?,
        }

        if copy_back {
            ops::copy(c, &c_work)?;
        }
        Ok(())
    }
}

/// Computes `c := alpha * a * b + beta * c` for 2-d tensors of any strides.
///
/// ## Errors
/// - [`ShapeError::Rank`] unless all operands are 2-d;
/// - [`ShapeError::Matmul`] if `a.rows != c.rows`, `b.cols != c.cols` or `a.cols != b.rows`;
/// - [`Error::Type`] if element types differ, [`Error::Unsupported`] unless they are `f32` or `f64`;
/// - [`Error::Device`] if the operands are on different devices.
pub fn gemm(alpha: f64, a: &Tensor, b: &Tensor, beta: f64, c: &Tensor) -> Result<()> {
    Dims { batched: false }.execute(alpha, a, b, beta, c)
}

/// Batched [`gemm`] over 3-d tensors whose leading dimension is the batch.
pub fn gemm_batch(alpha: f64, a: &Tensor, b: &Tensor, beta: f64, c: &Tensor) -> Result<()> {
    Dims { batched: true }.execute(alpha, a, b, beta, c)
}

/// Computes `beta * src + alpha * m1 * m2` into the write target.
/// Operands are 2-d, or 3-d for a batched multiply.
pub fn addmm(
    result: Option<&Tensor>,
    beta: f64,
    src: &Tensor,
    alpha: f64,
    m1: &Tensor,
    m2: &Tensor,
) -> Result<Tensor> {
    let output = ops::write_target(result, &src.allocator()?, src.data_type(), src.sizes())?;
    if !output.same_view(src) {
        ops::copy(&output, src)?;
    }
    match m1.rank() {
        3 => gemm_batch(alpha, m1, m2, beta, &output)?,
        _ => gemm(alpha, m1, m2, beta, &output)?,
    }
    Ok(output)
}

/// Computes `lhs * rhs` into the write target. Operands are 2-d, or 3-d for a batched multiply.
pub fn matmul(result: Option<&Tensor>, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let sizes = match (lhs.sizes(), rhs.sizes()) {
        (&[m, _], &[_, n]) => vec![m, n],
        (&[batches, m, _], &[_, _, n]) => vec![batches, m, n],
        (a, b) => {
            let (a, b) = (a.to_vec(), b.to_vec());
            return Err(ShapeError::Matmul { a, b, c: vec![] }.into());
        }
    };
    let output = ops::write_target(result, &lhs.allocator()?, lhs.data_type(), &sizes)?;
    match sizes.len() {
        3 => gemm_batch(1.0, lhs, rhs, 0.0, &output)?,
        _ => gemm(1.0, lhs, rhs, 0.0, &output)?,
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use itertools::Itertools;

    use super::{Contiguity, Plan, addmm, gemm, gemm_batch, matmul};
    use crate::{
        error::{self, ShapeError},
        loom::{
            device::{Allocator, DeviceRegistry, tests::gpu_registry},
            layout::Layout,
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

    /// Row-major `rows` by `cols` data.
    fn random(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols).map(|_| fastrand::f32() * 2.0 - 1.0).collect()
    }

    fn reference(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        itertools::iproduct!(0..m, 0..n)
            .map(|(i, j)| {
                (0..k)
                    .map(|l| a[i * k + l] as f64 * b[l * n + j] as f64)
                    .sum::<f64>() as f32
            })
            .collect()
    }

    #[derive(Debug, Clone, Copy)]
    enum Form {
        RowMajor,
        ColumnMajor,
        Strided,
    }

    /// A `rows` by `cols` tensor with logical contents `data`, laid out in the given form.
    fn make(
        allocator: &Arc<dyn Allocator>,
        form: Form,
        rows: usize,
        cols: usize,
        data: &[f32],
    ) -> Result<Tensor, error::Error> {
        let x = match form {
            Form::RowMajor => Tensor::new(allocator, DataType::F32, &[rows, cols])?,
            Form::ColumnMajor => Tensor::new(allocator, DataType::F32, &[cols, rows])?.transpose()?,
            Form::Strided => {
                // every other column of a padded buffer, strides `[2 * cols + 1, 2]`
                let base = Tensor::new(allocator, DataType::F32, &[rows, 2 * cols + 1])?;
                let layout = Layout::from_parts(vec![rows, cols], vec![2 * cols + 1, 2], 1);
                Tensor::from_storage(base.storage()?, layout)?
            }
        };
        x.write_slice(data)?;
        Ok(x)
    }

    #[test]
    fn test_decision_table() {
        let cases = [
            ([1, 4], Contiguity::ColumnMajor, Plan::Reuse),
            ([1, 2], Contiguity::ColumnMajor, Plan::Reuse),
            ([4, 1], Contiguity::RowMajor, Plan::Transpose),
            ([2, 1], Contiguity::RowMajor, Plan::Transpose),
            ([1, 1], Contiguity::Strided, Plan::Copy),
            ([1, 0], Contiguity::Strided, Plan::Copy),
            ([0, 1], Contiguity::Strided, Plan::Copy),
            ([0, 0], Contiguity::Strided, Plan::Copy),
            ([2, 2], Contiguity::Strided, Plan::Copy),
            ([4, 2], Contiguity::Strided, Plan::Copy),
            ([0, 3], Contiguity::Strided, Plan::Copy),
        ];
        for (strides, contiguity, plan) in cases {
            assert_eq!(Contiguity::classify(strides), contiguity, "{strides:?}");
            assert_eq!(Plan::for_operand(contiguity), plan, "{strides:?}");
            assert_eq!(Plan::for_result(contiguity), plan, "{strides:?}");
        }

        for (row, col) in itertools::iproduct!(0..6, 0..6) {
            let expected = match (row, col) {
                (1, 2..) => Contiguity::ColumnMajor,
                (2.., 1) => Contiguity::RowMajor,
                _ => Contiguity::Strided,
            };
            assert_eq!(Contiguity::classify([row, col]), expected);
        }
    }

    #[test]
    fn test_gemm_example() -> Result<(), Box<dyn Error>> {
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        let a = Tensor::from_slice(&allocator, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let b = Tensor::from_slice(&allocator, &[2, 2], &[5.0f32, 6.0, 7.0, 8.0])?;
        let c = matmul(None, &a, &b)?;
        assert_eq!(c.to_vec::<f32>()?, vec![19.0, 22.0, 43.0, 50.0]);

        let d = Tensor::from_slice(&allocator, &[2, 2], &[1.0f32, 1.0, 1.0, 1.0])?;
        let e = addmm(None, 0.5, &d, 2.0, &a, &b)?;
        assert_eq!(e.to_vec::<f32>()?, vec![38.5, 44.5, 86.5, 100.5]);
        assert_eq!(d.to_vec::<f32>()?, vec![1.0; 4]);

        addmm(Some(&d), 1.0, &d, 1.0, &a, &b)?;
        assert_eq!(d.to_vec::<f32>()?, vec![20.0, 23.0, 44.0, 51.0]);
        Ok(())
    }

    #[test]
    fn test_layout_equivalence() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        const M: usize = 7;
        const N: usize = 5;
        const K: usize = 9;
        let a = random(M, K);
        let b = random(K, N);
        let r#ref = reference(&a, &b, M, N, K);

        let forms = [Form::RowMajor, Form::ColumnMajor, Form::Strided];
        let live = allocator.stats().live_bytes;
        for (fa, fb, fc) in itertools::iproduct!(forms, forms, forms) {
            let ta = make(&allocator, fa, M, K, &a)?;
            let tb = make(&allocator, fb, K, N, &b)?;
            let tc = make(&allocator, fc, M, N, &vec![f32::NAN; M * N])?;
            let before = allocator.stats().live_bytes;

            gemm(1.0, &ta, &tb, 0.0, &tc)?;
            // temporaries are gone once the call returns
            assert_eq!(allocator.stats().live_bytes, before);

            for (index, (&computed, &expected)) in tc.to_vec::<f32>()?.iter().zip_eq(&r#ref).enumerate() {
                let index = format!("{fa:?}/{fb:?}/{fc:?}[{index}]");
                assert_approx_eq!(index, computed, expected, 1e-4);
            }
        }
        assert_eq!(allocator.stats().live_bytes, live);
        Ok(())
    }

    #[test]
    fn test_layout_accumulate() -> Result<(), Box<dyn Error>> {
        fastrand::seed(7);
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        const M: usize = 6;
        const N: usize = 4;
        const K: usize = 3;
        const ALPHA: f64 = 1.5;
        const BETA: f64 = 0.5;
        let a = random(M, K);
        let b = random(K, N);
        let c = random(M, N);
        let r#ref = reference(&a, &b, M, N, K)
            .into_iter()
            .zip_eq(&c)
            .map(|(ab, &c)| (ALPHA * ab as f64 + BETA * c as f64) as f32)
            .collect_vec();

        let forms = [Form::RowMajor, Form::ColumnMajor, Form::Strided];
        for (fa, fb, fc) in itertools::iproduct!(forms, forms, forms) {
            let ta = make(&allocator, fa, M, K, &a)?;
            let tb = make(&allocator, fb, K, N, &b)?;
            let tc = make(&allocator, fc, M, N, &c)?;

            gemm(ALPHA, &ta, &tb, BETA, &tc)?;

            for (index, (&computed, &expected)) in tc.to_vec::<f32>()?.iter().zip_eq(&r#ref).enumerate() {
                let index = format!("{fa:?}/{fb:?}/{fc:?}[{index}]");
                assert_approx_eq!(index, computed, expected, 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn test_batched() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let registry = DeviceRegistry::builder().build()?;
        let allocator = registry.allocator(0)?;

        const B: usize = 3;
        const M: usize = 4;
        const N: usize = 6;
        const K: usize = 5;
        let a = random(B * M, K);
        let b = random(B * K, N);
        let ta = Tensor::from_slice(&allocator, &[B, M, K], &a)?;
        let tb = Tensor::from_slice(&allocator, &[B, N, K], &random(B * N, K))?;
        let tb = {
            // same logical contents as `b`, stored transposed
            let x = tb.transpose_dims(1, 2)?;
            x.write_slice(&b)?;
            x
        };

        let batched = Tensor::new(&allocator, DataType::F32, &[B, M, N])?;
        gemm_batch(1.0, &ta, &tb, 0.0, &batched)?;

        for batch in 0..B {
            let c = Tensor::new(&allocator, DataType::F32, &[M, N])?;
            gemm(1.0, &ta.select(0, batch)?, &tb.select(0, batch)?, 0.0, &c)?;
            let expected = c.to_vec::<f32>()?;
            let computed = batched.select(0, batch)?.to_vec::<f32>()?;
            for (index, (x, y)) in computed.into_iter().zip_eq(expected).enumerate() {
                assert_approx_eq!(index, x, y, 1e-5);
            }

            let r#ref = reference(&a[batch * M * K..], &b[batch * K * N..], M, N, K);
            assert_approx_eq!(batch, batched.get(&[batch, 1, 2])? as f32, r#ref[N + 2], 1e-4);
        }

        let output = matmul(None, &ta, &tb)?;
        assert_eq!(output.sizes(), &[B, M, N]);
        assert_eq!(output.to_vec::<f32>()?, batched.to_vec::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let (registry, _) = gpu_registry(&dir);
        let gpu0 = registry.allocator(0)?;
        let gpu1 = registry.allocator(1)?;

        let a = Tensor::new(&gpu0, DataType::F32, &[2, 3])?;
        let b = Tensor::new(&gpu0, DataType::F32, &[4, 5])?;
        let c = Tensor::new(&gpu0, DataType::F32, &[2, 5])?;
        match gemm(1.0, &a, &b, 0.0, &c) {
            Err(error::Error::Shape(ShapeError::Matmul { a, b, c })) => {
                assert_eq!((a, b, c), (vec![2, 3], vec![4, 5], vec![2, 5]));
            }
            result => panic!("unexpected result {result:?}"),
        }

        let b = Tensor::new(&gpu0, DataType::F64, &[3, 5])?;
        assert!(matches!(gemm(1.0, &a, &b, 0.0, &c), Err(error::Error::Type { .. })));

        let b = Tensor::new(&gpu1, DataType::F32, &[3, 5])?;
        assert!(matches!(gemm(1.0, &a, &b, 0.0, &c), Err(error::Error::Device { .. })));

        let a = Tensor::new(&gpu0, DataType::I32, &[2, 3])?;
        let b = Tensor::new(&gpu0, DataType::I32, &[3, 5])?;
        let c = Tensor::new(&gpu0, DataType::I32, &[2, 5])?;
        assert!(matches!(gemm(1.0, &a, &b, 0.0, &c), Err(error::Error::Unsupported(..))));

        let a = Tensor::new(&gpu0, DataType::F32, &[2, 2, 3])?;
        assert!(matches!(
            gemm(1.0, &a, &b, 0.0, &c),
            Err(error::Error::Shape(ShapeError::Rank { .. }))
        ));
        Ok(())
    }
}
