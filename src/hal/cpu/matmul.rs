use itertools::Itertools;

use crate::{
    error::{Error, Result},
    hal::blas::{Blas, BlasHandle, Gemm, Matrix, Transpose},
    loom::num::{DataType, Float},
};

/// Reference matrix backend running on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBlas;

impl HostBlas {
    fn execute(&self, handle: &BlasHandle, gemm: &Gemm) -> Result<()> {
        gemm.check()?;
        let r#type = gemm.c.storage.data_type();
        for matrix in [gemm.a, gemm.b] {
            let found = matrix.storage.data_type();
            if found != r#type {
                return Err(Error::Type {
                    expected: r#type,
                    found,
                });
            }
        }
        log::trace!(
            "gemm {}{} m={} n={} k={} batches={} on {}",
            gemm.trans_a,
            gemm.trans_b,
            gemm.m,
            gemm.n,
            gemm.k,
            gemm.batches,
            handle.device()
        );
        match r#type {
            DataType::F32 => execute::<f32>(gemm),
            DataType::F64 => execute::<f64>(gemm),
            r#type => Err(Error::Unsupported(r#type, "gemm")),
        }
    }
}

impl Blas for HostBlas {
    fn gemm(&self, handle: &mut BlasHandle, gemm: &Gemm) -> Result<()> {
        self.execute(handle, &Gemm { batches: 1, ..*gemm })
    }

    fn gemm_strided_batched(&self, handle: &mut BlasHandle, gemm: &Gemm) -> Result<()> {
        self.execute(handle, gemm)
    }
}

/// Copies `op(x)` of every batch into a dense column-major `rows` by `cols` block.
fn gather<T: Float>(
    matrix: Matrix,
    trans: Transpose,
    rows: usize,
    cols: usize,
    batches: usize,
) -> Result<Vec<T>> {
    matrix.storage.read(|data: &[T]| {
        itertools::iproduct!(0..batches, 0..cols, 0..rows)
            .map(|(batch, col, row)| {
                let base = matrix.offset + batch * matrix.stride;
                match trans {
                    Transpose::No => data[base + row + col * matrix.ld],
                    Transpose::Yes => data[base + col + row * matrix.ld],
                }
            })
            .collect()
    })
}

fn execute<T: Float>(gemm: &Gemm) -> Result<()> {
    let Gemm { m, n, k, batches, .. } = *gemm;
    let alpha = T::from_f64(gemm.alpha);
    let beta = T::from_f64(gemm.beta);

    // operands are gathered before `c` is locked, so they may alias it
    let a: Vec<T> = gather(gemm.a, gemm.trans_a, m, k, batches)?;
    let b: Vec<T> = gather(gemm.b, gemm.trans_b, k, n, batches)?;

    let column = |(batch, j): (usize, usize)| -> Vec<T> {
        let a = &a[batch * m * k..];
        let b = &b[batch * k * n + j * k..];
        (0..m)
            .map(|i| (0..k).fold(T::ZERO, |acc, l| acc + a[i + l * m] * b[l]))
            .collect()
    };

    #[cfg(not(feature = "rayon"))]
    let columns: Vec<Vec<T>> = itertools::iproduct!(0..batches, 0..n)
        .map(column)
        .collect();
    #[cfg(feature = "rayon")]
    let columns: Vec<Vec<T>> = {
        use rayon::prelude::*;
        itertools::iproduct!(0..batches, 0..n)
            .collect_vec()
            .into_par_iter()
            .map(column)
            .collect()
    };

    let c = gemm.c;
    c.storage.write(|data: &mut [T]| {
        for ((batch, j), column) in itertools::iproduct!(0..batches, 0..n).zip_eq(columns) {
            let base = c.offset + batch * c.stride + j * c.ld;
            for (i, value) in column.into_iter().enumerate() {
                let x = &mut data[base + i];
                // with a zero beta the previous contents are never read
                *x = match gemm.beta == 0.0 {
                    true => alpha * value,
                    false => alpha * value + beta * *x,
                };
            }
        }
    })
}
