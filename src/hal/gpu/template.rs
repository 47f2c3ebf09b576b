use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{compiler::KernelCompiler, config::KernelConfig};
use crate::error::{ConfigError, Result};

/// Kernel source parameterized by macros that a [`KernelConfig`] must define exactly.
#[derive(Debug)]
pub struct KernelTemplate {
    name: String,
    source: String,
    required: BTreeSet<String>,
    includes: Vec<String>,
    binaries: Mutex<HashMap<KernelConfig, Arc<[u8]>>>,
}

impl KernelTemplate {
    pub fn new<R, I>(name: impl Into<String>, source: impl Into<String>, required: R, includes: I) -> Self
    where
        R: IntoIterator<Item: Into<String>>,
        I: IntoIterator<Item: Into<String>>,
    {
        Self {
            name: name.into(),
            source: source.into(),
            required: required.into_iter().map(Into::into).collect(),
            includes: includes.into_iter().map(Into::into).collect(),
            binaries: Default::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    fn check(&self, config: &KernelConfig) -> Result<(), ConfigError> {
        let required = || self.required.iter().cloned().collect_vec();
        let missing = self
            .required
            .iter()
            .filter(|name| !config.contains_key(name))
            .cloned()
            .collect_vec();
        if !missing.is_empty() {
            let required = required();
            return Err(ConfigError::MissingArgs { missing, required });
        }
        let extra = config
            .keys()
            .filter(|name| !self.required.contains(*name))
            .map(str::to_owned)
            .collect_vec();
        if !extra.is_empty() {
            let required = required();
            return Err(ConfigError::ExtraArgs { extra, required });
        }
        Ok(())
    }

    /// Compiles the template specialized by `config`. Binaries are memoized per config.
    pub fn binary_for_config(&self, compiler: &KernelCompiler, config: &KernelConfig) -> Result<Arc<[u8]>> {
        self.check(config)?;
        if let Some(binary) = self.binaries.lock().expect("failed to lock").get(config) {
            return Ok(binary.clone());
        }

        log::debug!("specialize kernel {} with {:?}", self.name, config);
        let source = config.apply_to_template(&self.source);
        let binary = compiler.compile(&source, &self.includes)?;
        self.binaries
            .lock()
            .expect("failed to lock")
            .insert(config.clone(), binary.clone());
        Ok(binary)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::KernelTemplate;
    use crate::{
        error::{self, ConfigError},
        hal::gpu::{
            cache::KernelDiskCache, compiler::KernelCompiler, compiler::tests::CountingBackend,
            config::KernelConfig,
        },
    };

    #[test]
    fn test_binary_for_config() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(CountingBackend::default());
        let compiler = KernelCompiler::new(KernelDiskCache::new(dir.path())?, backend.clone(), vec![]);
        compiler.register_header("lib", "// lib");

        let template = KernelTemplate::new("scale", "// scale by FACTOR", ["FACTOR", "TYPE"], ["lib"]);

        let config = KernelConfig::new().with("TYPE", "f32").with("FACTOR", 2);
        let binary = template.binary_for_config(&compiler, &config)?;
        assert_eq!(
            std::str::from_utf8(&binary)?,
            "// lib\n#define FACTOR 2\n#define TYPE f32\n// scale by FACTOR\n"
        );

        let config: KernelConfig = [("FACTOR", "2"), ("TYPE", "f32")].into_iter().collect();
        template.binary_for_config(&compiler, &config)?;
        assert_eq!(backend.count(), 1);

        let config = KernelConfig::new().with("TYPE", "f32");
        let result = template.binary_for_config(&compiler, &config);
        assert!(matches!(
            result,
            Err(error::Error::Config(ConfigError::MissingArgs { missing, .. })) if missing == ["FACTOR"]
        ));

        let config = KernelConfig::new()
            .with("TYPE", "f32")
            .with("FACTOR", 2)
            .with("OFFSET", 1);
        let result = template.binary_for_config(&compiler, &config);
        assert!(matches!(
            result,
            Err(error::Error::Config(ConfigError::ExtraArgs { extra, .. })) if extra == ["OFFSET"]
        ));
        assert_eq!(backend.count(), 1);
        Ok(())
    }
}
