use std::ops::{Add, Mul};

use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F16,
    F32,
    F64,
    I32,
    U8,
    U32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 => 4,
            DataType::F64 => 8,
            DataType::I32 => 4,
            DataType::U8 => 1,
            DataType::U32 => 4,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::F32 | DataType::F64)
    }

    /// Name of the type in kernel sources, if the kernels support it.
    pub const fn kernel_name(self) -> Option<&'static str> {
        match self {
            DataType::F32 => Some("f32"),
            DataType::I32 => Some("i32"),
            DataType::U32 => Some("u32"),
            _ => None,
        }
    }
}

/// Element types a [`Storage`](super::storage::Storage) can hold.
/// Every element converts losslessly to and from `f64` except for the saturating integer casts.
pub trait Scalar: Sized + Pod + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

/// Element types the matrix routines accept.
pub trait Float: Scalar + Add<Output = Self> + Mul<Output = Self> {
    const ZERO: Self;
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:expr) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = $data_type;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $ty
            }
        }
    };
}

impl_scalar!(f32, DataType::F32);
impl_scalar!(f64, DataType::F64);
impl_scalar!(i32, DataType::I32);
impl_scalar!(u8, DataType::U8);
impl_scalar!(u32, DataType::U32);

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Float for f32 {
    const ZERO: Self = 0.0;
}

impl Float for f64 {
    const ZERO: Self = 0.0;
}

/// Expands `$body` once per [`DataType`], with `$t` aliased to the matching element type.
macro_rules! dispatch {
    ($data_type:expr, $t:ident => $body:expr) => {
        match $data_type {
            $crate::loom::num::DataType::F16 => {
                type $t = ::half::f16;
                $body
            }
            $crate::loom::num::DataType::F32 => {
                type $t = f32;
                $body
            }
            $crate::loom::num::DataType::F64 => {
                type $t = f64;
                $body
            }
            $crate::loom::num::DataType::I32 => {
                type $t = i32;
                $body
            }
            $crate::loom::num::DataType::U8 => {
                type $t = u8;
                $body
            }
            $crate::loom::num::DataType::U32 => {
                type $t = u32;
                $body
            }
        }
    };
}

pub(crate) use dispatch;
