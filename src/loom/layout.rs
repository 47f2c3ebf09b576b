use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, ShapeError};

/// Sizes, strides and storage offset of a strided view, all in elements.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{sizes:?}:{strides:?}+{offset}")]
pub struct Layout {
    sizes: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout of the given sizes starting at offset 0.
    pub fn contiguous(sizes: &[usize]) -> Self {
        let mut strides = vec![0; sizes.len()];
        let mut stride = 1;
        for (dim, &size) in sizes.iter().enumerate().rev() {
            strides[dim] = stride;
            stride *= size;
        }
        let sizes = sizes.to_vec();
        Self {
            sizes,
            strides,
            offset: 0,
        }
    }

    /// Builds a layout from raw parts.
    ///
    /// # Panics
    /// If `sizes` and `strides` differ in length.
    pub fn from_parts(sizes: Vec<usize>, strides: Vec<usize>, offset: usize) -> Self {
        assert_eq!(sizes.len(), strides.len(), "sizes and strides must share a rank");
        Self {
            sizes,
            strides,
            offset,
        }
    }

    #[inline]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Number of logical elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the largest storage element the view touches.
    pub fn extent(&self) -> usize {
        match self.is_empty() {
            true => self.offset,
            false => {
                let last: usize = self
                    .sizes
                    .iter()
                    .zip_eq(&self.strides)
                    .map(|(&size, &stride)| (size - 1) * stride)
                    .sum();
                self.offset + last + 1
            }
        }
    }

    /// Whether logical row-major order walks the storage densely. Dimensions of size 1 are ignored.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&size, &stride) in self.sizes.iter().zip(&self.strides).rev() {
            if size == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    fn check_dim(&self, dim: usize) -> Result<(), ShapeError> {
        match dim < self.rank() {
            true => Ok(()),
            false => Err(ShapeError::Dim {
                dim,
                rank: self.rank(),
            }),
        }
    }

    /// Storage offset of a logical index.
    pub fn index(&self, index: &[usize]) -> Result<usize, Error> {
        if index.len() != self.rank() {
            let expected = self.rank();
            let found = index.to_vec();
            return Err(ShapeError::Rank { expected, found }.into());
        }
        let mut offset = self.offset;
        for (dim, (&index, (&size, &stride))) in index
            .iter()
            .zip(self.sizes.iter().zip(&self.strides))
            .enumerate()
        {
            if index >= size {
                return Err(Error::Index { index, dim, size });
            }
            offset += index * stride;
        }
        Ok(offset)
    }

    /// Swaps the two dimensions of a 2-d layout.
    pub fn transpose(&self) -> Result<Self, ShapeError> {
        if self.rank() != 2 {
            let found = self.sizes.clone();
            return Err(ShapeError::Rank { expected: 2, found });
        }
        self.transpose_dims(0, 1)
    }

    pub fn transpose_dims(&self, dim0: usize, dim1: usize) -> Result<Self, ShapeError> {
        self.check_dim(dim0)?;
        self.check_dim(dim1)?;
        let mut layout = self.clone();
        layout.sizes.swap(dim0, dim1);
        layout.strides.swap(dim0, dim1);
        Ok(layout)
    }

    /// Restricts `dim` to `[start, start + len)`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self, ShapeError> {
        self.check_dim(dim)?;
        let size = self.sizes[dim];
        let end = start + len;
        if end > size {
            return Err(ShapeError::Narrow {
                dim,
                start,
                end,
                size,
            });
        }
        let mut layout = self.clone();
        layout.sizes[dim] = len;
        layout.offset += start * self.strides[dim];
        Ok(layout)
    }

    /// Fixes `dim` at `index` and removes it.
    pub fn select(&self, dim: usize, index: usize) -> Result<Self, Error> {
        self.check_dim(dim)?;
        let size = self.sizes[dim];
        if index >= size {
            return Err(Error::Index { index, dim, size });
        }
        let mut layout = self.clone();
        layout.offset += index * self.strides[dim];
        layout.sizes.remove(dim);
        layout.strides.remove(dim);
        Ok(layout)
    }

    pub fn permute(&self, dims: &[usize]) -> Result<Self, ShapeError> {
        let rank = self.rank();
        let valid = dims.len() == rank && dims.iter().all_unique() && dims.iter().all(|&d| d < rank);
        if !valid {
            return Err(ShapeError::Permute(dims.to_vec(), rank));
        }
        let sizes = dims.iter().map(|&d| self.sizes[d]).collect();
        let strides = dims.iter().map(|&d| self.strides[d]).collect();
        let offset = self.offset;
        Ok(Self {
            sizes,
            strides,
            offset,
        })
    }

    /// Reinterprets a contiguous layout with new sizes of the same element count.
    pub fn view(&self, sizes: &[usize]) -> Result<Self, ShapeError> {
        let count: usize = sizes.iter().product();
        if !self.is_contiguous() || count != self.len() {
            let from = self.sizes.clone();
            let to = sizes.to_vec();
            return Err(ShapeError::View { from, to });
        }
        let mut layout = Self::contiguous(sizes);
        layout.offset = self.offset;
        Ok(layout)
    }

    /// Broadcasts dimensions of size 1 (and new leading dimensions) with stride 0.
    pub fn expand(&self, sizes: &[usize]) -> Result<Self, ShapeError> {
        let error = || ShapeError::Expand {
            from: self.sizes.clone(),
            to: sizes.to_vec(),
        };
        if sizes.len() < self.rank() {
            return Err(error());
        }
        let lead = sizes.len() - self.rank();
        let mut strides = vec![0; sizes.len()];
        for (dim, &size) in sizes.iter().enumerate().skip(lead) {
            let (from, stride) = (self.sizes[dim - lead], self.strides[dim - lead]);
            strides[dim] = match (from, size) {
                (from, size) if from == size => stride,
                (1, _) => 0,
                _ => return Err(error()),
            };
        }
        let sizes = sizes.to_vec();
        let offset = self.offset;
        Ok(Self {
            sizes,
            strides,
            offset,
        })
    }

    /// Storage offsets of all elements in logical row-major order.
    #[inline]
    pub fn offsets(&self) -> Offsets<'_> {
        Offsets {
            layout: self,
            index: vec![0; self.rank()],
            current: self.offset,
            remaining: self.len(),
        }
    }
}

pub struct Offsets<'a> {
    layout: &'a Layout,
    index: Vec<usize>,
    current: usize,
    remaining: usize,
}

impl Iterator for Offsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let offset = self.current;
        self.remaining -= 1;

        // carry the rightmost index, rewinding the offset of wrapped dimensions
        for dim in (0..self.index.len()).rev() {
            let stride = self.layout.strides[dim];
            self.index[dim] += 1;
            self.current += stride;
            if self.index[dim] < self.layout.sizes[dim] {
                break;
            }
            self.current -= self.index[dim] * stride;
            self.index[dim] = 0;
        }
        Some(offset)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Offsets<'_> {}
