use std::sync::Arc;

use super::{compiler::KernelCompiler, config::KernelConfig, template::KernelTemplate};
use crate::{
    error::{Error, Result},
    hal::ops::{BinaryOp, UnaryOp},
    loom::num::DataType,
};

pub const MATH_HEADER: &str = "math";
pub const BLOCK_SIZE: usize = 256;

pub const FILL_ENTRY: &str = "fill_kernel";
pub const BINARY_ENTRY: &str = "binary_kernel";
pub const UNARY_ENTRY: &str = "unary_kernel";

const MATH: &str = r#"
fn sigmoid(x: f32) -> f32 {
    return 1.0 / (1.0 + exp(-x));
}

fn relu(x: f32) -> f32 {
    return max(x, 0.0);
}
"#;

const FILL: &str = r#"
struct FillParams {
    value: f32,
}

@group(0) @binding(0) var<storage, read> params: FillParams;
@group(0) @binding(1) var<storage, read_write> out_buf: array<ELEMENT_TYPE>;

@compute @workgroup_size(BLOCK_SIZE)
fn fill_kernel(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&out_buf)) {
        out_buf[id.x] = ELEMENT_TYPE(params.value);
    }
}
"#;

const BINARY: &str = r#"
@group(0) @binding(0) var<storage, read> x_buf: array<ELEMENT_TYPE>;
@group(0) @binding(1) var<storage, read> y_buf: array<ELEMENT_TYPE>;
@group(0) @binding(2) var<storage, read_write> out_buf: array<ELEMENT_TYPE>;

@compute @workgroup_size(BLOCK_SIZE)
fn binary_kernel(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&out_buf)) {
        let x = x_buf[id.x];
        let y = y_buf[id.x];
        out_buf[id.x] = APPLY_OP;
    }
}
"#;

const UNARY: &str = r#"
@group(0) @binding(0) var<storage, read> x_buf: array<ELEMENT_TYPE>;
@group(0) @binding(1) var<storage, read_write> out_buf: array<ELEMENT_TYPE>;

@compute @workgroup_size(BLOCK_SIZE)
fn unary_kernel(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&out_buf)) {
        let x = x_buf[id.x];
        out_buf[id.x] = APPLY_OP;
    }
}
"#;

pub fn register_headers(compiler: &KernelCompiler) {
    compiler.register_header(MATH_HEADER, MATH);
}

fn element_type(r#type: DataType) -> Result<&'static str> {
    r#type
        .kernel_name()
        .ok_or(Error::Unsupported(r#type, "kernels"))
}

/// Built-in kernel templates of a device context.
#[derive(Debug)]
pub struct Kernels {
    pub fill: KernelTemplate,
    pub binary: KernelTemplate,
    pub unary: KernelTemplate,
}

impl Default for Kernels {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernels {
    pub fn new() -> Self {
        let fill = KernelTemplate::new("fill", FILL, ["ELEMENT_TYPE", "BLOCK_SIZE"], None::<String>);
        let binary = KernelTemplate::new(
            "binary",
            BINARY,
            ["ELEMENT_TYPE", "BLOCK_SIZE", "APPLY_OP"],
            None::<String>,
        );
        let unary = KernelTemplate::new(
            "unary",
            UNARY,
            ["ELEMENT_TYPE", "BLOCK_SIZE", "APPLY_OP"],
            [MATH_HEADER],
        );
        Self {
            fill,
            binary,
            unary,
        }
    }

    pub fn fill(&self, compiler: &KernelCompiler, r#type: DataType) -> Result<Arc<[u8]>> {
        let config = KernelConfig::new()
            .with("ELEMENT_TYPE", element_type(r#type)?)
            .with("BLOCK_SIZE", BLOCK_SIZE);
        self.fill.binary_for_config(compiler, &config)
    }

    pub fn binary(&self, compiler: &KernelCompiler, op: BinaryOp, r#type: DataType) -> Result<Arc<[u8]>> {
        if r#type != DataType::F32 && matches!(op, BinaryOp::Pow) {
            return Err(Error::Unsupported(r#type, "pow kernel"));
        }
        let config = KernelConfig::new()
            .with("ELEMENT_TYPE", element_type(r#type)?)
            .with("BLOCK_SIZE", BLOCK_SIZE)
            .with("APPLY_OP", op.kernel_expr());
        self.binary.binary_for_config(compiler, &config)
    }

    pub fn unary(&self, compiler: &KernelCompiler, op: UnaryOp) -> Result<Arc<[u8]>> {
        let config = KernelConfig::new()
            .with("ELEMENT_TYPE", "f32")
            .with("BLOCK_SIZE", BLOCK_SIZE)
            .with("APPLY_OP", op.kernel_expr());
        self.unary.binary_for_config(compiler, &config)
    }

    /// Compiles the standard configurations. Returns the number of kernels.
    pub fn precompile(&self, compiler: &KernelCompiler) -> Result<usize> {
        let mut count = 0;
        for r#type in [DataType::F32, DataType::I32, DataType::U32] {
            self.fill(compiler, r#type)?;
            count += 1;
        }
        for op in BinaryOp::ALL {
            self.binary(compiler, op, DataType::F32)?;
            count += 1;
        }
        for op in UnaryOp::ALL {
            self.unary(compiler, op)?;
            count += 1;
        }
        log::debug!("precompiled {count} built-in kernels");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::{Kernels, register_headers};
    use crate::{
        hal::{
            gpu::{
                cache::KernelDiskCache,
                compiler::{KernelCompiler, NagaBackend},
            },
            ops::BinaryOp,
        },
        loom::num::DataType,
    };

    #[test]
    fn test_precompile_naga() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let cache = KernelDiskCache::new(dir.path())?;
        let compiler = KernelCompiler::new(cache, Arc::new(NagaBackend), vec![]);
        register_headers(&compiler);

        let kernels = Kernels::new();
        let count = kernels.precompile(&compiler)?;
        assert_eq!(count, 3 + 7 + 9);
        assert_eq!(compiler.cache().len(), count);

        let x = kernels.binary(&compiler, BinaryOp::Max, DataType::F32)?;
        let y = kernels.binary(&compiler, BinaryOp::Max, DataType::F32)?;
        assert!(Arc::ptr_eq(&x, &y));

        let z = kernels.binary(&compiler, BinaryOp::Add, DataType::I32)?;
        assert_eq!(&z[..4], &[0x03, 0x02, 0x23, 0x07]);
        assert!(kernels.fill(&compiler, DataType::F16).is_err());
        Ok(())
    }
}
