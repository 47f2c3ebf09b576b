use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use rustc_hash::FxHashMap as HashMap;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

pub const BINARY_EXTENSION: &str = "spv";
pub const SOURCE_EXTENSION: &str = "wgsl";

/// Derives the cache key of a kernel source.
///
/// The key is the SHA-1 digest of the UTF-8 encoding of the decimal UTF-16 length immediately
/// followed by the source, as 40 uppercase hex digits. There is no separator between length and text, so two distinct
/// sources could in principle share a key; the digest makes that practically unreachable.
pub fn key_from_source(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.encode_utf16().count().to_string().as_bytes());
    hasher.update(source.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect()
}

/// Compiled kernels keyed by source content, looked up in memory, then on disk, then compiled.
///
/// Each entry lives on disk as `<KEY>.spv` next to the source it was compiled from, `<KEY>.wgsl`.
#[derive(Debug)]
pub struct KernelDiskCache {
    dir: PathBuf,
    memory: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl KernelDiskCache {
    /// Opens the cache directory, creating it if necessary.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        let memory = Default::default();
        Ok(Self { dir, memory })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{key}.{extension}"))
    }

    /// Number of kernels held in memory.
    pub fn len(&self) -> usize {
        self.memory.read().expect("failed to lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.memory.read().expect("failed to lock").contains_key(key)
    }

    fn insert(&self, key: String, binary: Arc<[u8]>) {
        self.memory
            .write()
            .expect("failed to lock")
            .insert(key, binary);
    }

    /// Returns the binary for `source`, invoking `compile` only if neither memory nor disk has it.
    pub fn get<F>(&self, source: &str, compile: F) -> Result<Arc<[u8]>>
    where
        F: FnOnce(&str) -> Result<Vec<u8>>,
    {
        let key = key_from_source(source);
        if let Some(binary) = self.memory.read().expect("failed to lock").get(&key) {
            return Ok(binary.clone());
        }

        let path = self.path(&key, BINARY_EXTENSION);
        if path.is_file() {
            log::debug!("load kernel {key} from {}", path.display());
            let binary: Arc<[u8]> = fs::read(&path).map_err(|err| Error::io(&path, err))?.into();
            self.insert(key, binary.clone());
            return Ok(binary);
        }

        let source_path = self.path(&key, SOURCE_EXTENSION);
        fs::write(&source_path, source).map_err(|err| Error::io(&source_path, err))?;

        let binary: Arc<[u8]> = compile(source)?.into();
        log::debug!("write kernel {key} to {}", path.display());
        fs::write(&path, &binary).map_err(|err| Error::io(&path, err))?;
        self.insert(key, binary.clone());
        Ok(binary)
    }

    /// Deletes cached files whose key was not used since the cache was opened.
    /// Returns the number of files removed.
    pub fn clean_unused(&self) -> Result<usize> {
        let memory = self.memory.read().expect("failed to lock");
        let entries = fs::read_dir(&self.dir).map_err(|err| Error::io(&self.dir, err))?;

        let mut count = 0;
        for entry in entries {
            let path = entry.map_err(|err| Error::io(&self.dir, err))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let key = name.split('.').next().unwrap_or(name);
            if !memory.contains_key(key) {
                log::info!("remove unused kernel file {}", path.display());
                fs::remove_file(&path).map_err(|err| Error::io(&path, err))?;
                count += 1;
            }
        }
        Ok(count)
    }
}
