use std::sync::Arc;

use super::{
    device::{Allocator, Device},
    layout::Layout,
    num::{DataType, Scalar, dispatch},
    storage::Storage,
};
use crate::error::{Error, Result, ShapeError};

/// A strided view over a [`Storage`].
///
/// Tensors are not `Clone`: another reference to the same storage is taken with [`Tensor::copy_ref`],
/// and views ([`Tensor::narrow`], [`Tensor::transpose`], ...) share storage without copying.
/// The reference is dropped by [`Tensor::dispose`] or when the tensor goes out of scope.
#[derive(Debug)]
pub struct Tensor {
    layout: Layout,
    r#type: DataType,
    storage: Option<Storage>,
}

impl Tensor {
    /// Allocates a contiguous, zero-filled tensor.
    pub fn new(allocator: &Arc<dyn Allocator>, r#type: DataType, sizes: &[usize]) -> Result<Self> {
        let layout = Layout::contiguous(sizes);
        let storage = Storage::new(allocator, r#type, layout.len())?;
        Ok(Self {
            layout,
            r#type,
            storage: Some(storage),
        })
    }

    /// Allocates a contiguous tensor and fills it with `data` in row-major order.
    pub fn from_slice<T: Scalar>(
        allocator: &Arc<dyn Allocator>,
        sizes: &[usize],
        data: &[T],
    ) -> Result<Self> {
        let tensor = Self::new(allocator, T::DATA_TYPE, sizes)?;
        if data.len() != tensor.len() {
            return Err(ShapeError::Count(data.len(), tensor.len()).into());
        }
        tensor.storage()?.write(|x: &mut [T]| x.copy_from_slice(data))?;
        Ok(tensor)
    }

    /// Wraps a new reference to `storage` with the given layout.
    pub fn from_storage(storage: &Storage, layout: Layout) -> Result<Self> {
        if layout.extent() > storage.len() {
            return Err(ShapeError::Count(layout.extent(), storage.len()).into());
        }
        Ok(Self {
            layout,
            r#type: storage.data_type(),
            storage: Some(storage.copy_ref()),
        })
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn sizes(&self) -> &[usize] {
        self.layout.sizes()
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    /// Number of logical elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.storage.is_none()
    }

    pub fn storage(&self) -> Result<&Storage> {
        self.storage
            .as_ref()
            .ok_or(Error::Resource("tensor has been disposed"))
    }

    #[inline]
    pub fn allocator(&self) -> Result<Arc<dyn Allocator>> {
        Ok(self.storage()?.allocator().clone())
    }

    #[inline]
    pub fn device(&self) -> Result<Device> {
        Ok(self.storage()?.device())
    }

    /// Another tensor with the same layout over the same storage.
    pub fn copy_ref(&self) -> Result<Self> {
        self.with_layout(self.layout.clone())
    }

    /// Drops this tensor's storage reference. Disposing twice is an error.
    pub fn dispose(&mut self) -> Result<()> {
        match self.storage.take() {
            Some(storage) => {
                drop(storage);
                Ok(())
            }
            None => Err(Error::Resource("tensor is already disposed")),
        }
    }

    /// Whether both tensors view exactly the same elements of the same storage.
    pub fn same_view(&self, other: &Tensor) -> bool {
        match (&self.storage, &other.storage) {
            (Some(x), Some(y)) => x.ptr_eq(y) && self.layout == other.layout,
            _ => false,
        }
    }

    fn with_layout(&self, layout: Layout) -> Result<Self> {
        let storage = self.storage()?.copy_ref();
        Ok(Self {
            layout,
            r#type: self.r#type,
            storage: Some(storage),
        })
    }

    /// Swaps the two dimensions of a 2-d tensor.
    pub fn transpose(&self) -> Result<Self> {
        self.with_layout(self.layout.transpose()?)
    }

    pub fn transpose_dims(&self, dim0: usize, dim1: usize) -> Result<Self> {
        self.with_layout(self.layout.transpose_dims(dim0, dim1)?)
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        self.with_layout(self.layout.narrow(dim, start, len)?)
    }

    pub fn select(&self, dim: usize, index: usize) -> Result<Self> {
        self.with_layout(self.layout.select(dim, index)?)
    }

    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        self.with_layout(self.layout.permute(dims)?)
    }

    pub fn view(&self, sizes: &[usize]) -> Result<Self> {
        self.with_layout(self.layout.view(sizes)?)
    }

    pub fn expand(&self, sizes: &[usize]) -> Result<Self> {
        self.with_layout(self.layout.expand(sizes)?)
    }

    /// Gathers the elements in logical row-major order.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        let layout = &self.layout;
        self.storage()?
            .read(|data: &[T]| layout.offsets().map(|index| data[index]).collect())
    }

    /// Scatters `values` (in logical row-major order) into the viewed elements.
    pub fn write_slice<T: Scalar>(&self, values: &[T]) -> Result<()> {
        if values.len() != self.len() {
            return Err(ShapeError::Count(values.len(), self.len()).into());
        }
        let layout = &self.layout;
        self.storage()?.write(|data: &mut [T]| {
            for (index, &value) in layout.offsets().zip(values) {
                data[index] = value;
            }
        })
    }

    /// Gathers the elements converted to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        dispatch!(self.r#type, T => Ok(self.to_vec::<T>()?.into_iter().map(T::to_f64).collect()))
    }

    /// Scatters `f64` values converted to this tensor's element type.
    pub fn write_f64(&self, values: &[f64]) -> Result<()> {
        dispatch!(self.r#type, T => {
            let values: Vec<T> = values.iter().map(|&x| T::from_f64(x)).collect();
            self.write_slice(&values)
        })
    }

    pub fn get(&self, index: &[usize]) -> Result<f64> {
        let offset = self.layout.index(index)?;
        let storage = self.storage()?;
        dispatch!(self.r#type, T => storage.read(|data: &[T]| data[offset].to_f64()))
    }

    pub fn set(&self, index: &[usize], value: f64) -> Result<()> {
        let offset = self.layout.index(index)?;
        let storage = self.storage()?;
        dispatch!(self.r#type, T => storage.write(|data: &mut [T]| data[offset] = T::from_f64(value)))
    }
}
