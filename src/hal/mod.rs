pub mod blas;
pub mod cpu;
pub mod gpu;
pub mod matmul;
pub mod ops;
