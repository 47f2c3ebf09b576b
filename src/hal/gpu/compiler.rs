use std::{
    fmt::Debug,
    sync::{Arc, RwLock},
};

use itertools::Itertools;
use naga::{
    back::spv,
    valid::{Capabilities, ValidationFlags, Validator},
};
use rustc_hash::FxHashMap as HashMap;

use super::cache::KernelDiskCache;
use crate::error::{ConfigError, Error, Result};

/// Turns assembled kernel source into a binary.
pub trait CompileBackend: Send + Sync + Debug {
    fn compile(&self, source: &str, flags: &[String]) -> Result<Vec<u8>>;
}

/// Compiles WGSL into SPIR-V.
///
/// The source is first run through a preprocessor that expands `#define` lines.
/// Recognized flags:
/// - `-D NAME[=VALUE]` or `-DNAME[=VALUE]`: adds a definition before the source;
/// - `--debug`: emits debug information;
/// - `--spirv-version=MAJOR.MINOR`: selects the SPIR-V version.
#[derive(Debug, Default, Clone, Copy)]
pub struct NagaBackend;

impl NagaBackend {
    fn options(flags: &[String]) -> Result<(spv::Options<'static>, Vec<String>)> {
        let mut options = spv::Options::default();
        let mut defines = vec![];

        let mut iter = flags.iter();
        while let Some(flag) = iter.next() {
            let define = match flag.as_str() {
                "-D" => iter.next().map(String::as_str),
                flag => flag.strip_prefix("-D"),
            };
            if let Some(define) = define {
                let (name, value) = define.split_once('=').unwrap_or((define, "1"));
                defines.push(format!("#define {name} {value}"));
                continue;
            }

            if flag == "--debug" {
                options.flags |= spv::WriterFlags::DEBUG;
                continue;
            }

            if let Some(version) = flag.strip_prefix("--spirv-version=") {
                let version = version
                    .split_once('.')
                    .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)));
                match version {
                    Some(version) => options.lang_version = version,
                    None => {
                        let log = format!("invalid spir-v version in option '{flag}'");
                        return Err(Error::Compile { log });
                    }
                }
                continue;
            }

            let log = format!("unrecognized compiler option '{flag}'");
            return Err(Error::Compile { log });
        }
        Ok((options, defines))
    }
}

impl CompileBackend for NagaBackend {
    fn compile(&self, source: &str, flags: &[String]) -> Result<Vec<u8>> {
        let (options, defines) = Self::options(flags)?;

        let mut context = gpp::Context::new();
        let source = defines.into_iter().chain([source.to_owned()]).join("\n");
        let source = gpp::process_str(&source, &mut context).map_err(|err| Error::Compile {
            log: format!("preprocessor: {err}"),
        })?;

        let module = naga::front::wgsl::parse_str(&source).map_err(|err| Error::Compile {
            log: err.emit_to_string(&source),
        })?;
        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|err| Error::Compile {
                log: err.emit_to_string(&source),
            })?;
        let words = spv::write_vec(&module, &info, &options, None).map_err(|err| Error::Compile {
            log: err.to_string(),
        })?;
        Ok(bytemuck::cast_slice(&words).to_vec())
    }
}

/// Compiles kernel sources through a [`KernelDiskCache`].
///
/// Headers registered by name can be included into a source; their text is prepended
/// and therefore part of the cache key. Compiler flags are not.
#[derive(Debug)]
pub struct KernelCompiler {
    cache: KernelDiskCache,
    backend: Arc<dyn CompileBackend>,
    flags: Vec<String>,
    headers: RwLock<HashMap<String, String>>,
}

impl KernelCompiler {
    pub fn new(cache: KernelDiskCache, backend: Arc<dyn CompileBackend>, flags: Vec<String>) -> Self {
        Self {
            cache,
            backend,
            flags,
            headers: Default::default(),
        }
    }

    #[inline]
    pub fn cache(&self) -> &KernelDiskCache {
        &self.cache
    }

    #[inline]
    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn register_header(&self, name: impl Into<String>, text: impl Into<String>) {
        let name = name.into();
        log::debug!("register kernel header '{name}'");
        self.headers
            .write()
            .expect("failed to lock")
            .insert(name, text.into());
    }

    /// Prepends the named headers to `source`, each followed by a newline.
    pub fn assemble<S: AsRef<str>>(&self, source: &str, includes: &[S]) -> Result<String> {
        let headers = self.headers.read().expect("failed to lock");
        let mut code = String::new();
        for name in includes {
            let name = name.as_ref();
            let text = headers
                .get(name)
                .ok_or_else(|| ConfigError::UnknownHeader(name.to_owned()))?;
            code.push_str(text);
            code.push('\n');
        }
        code.push_str(source);
        Ok(code)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn compile<S: AsRef<str>>(&self, source: &str, includes: &[S]) -> Result<Arc<[u8]>> {
        let code = self.assemble(source, includes)?;
        self.cache.get(&code, |code| {
            log::info!("compile kernel with options [{}]", self.flags.iter().join(" "));
            self.backend.compile(code, &self.flags)
        })
    }
}
