mod matmul;

pub use matmul::HostBlas;
