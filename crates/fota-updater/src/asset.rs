//! Trust material (public key, root CA) as opaque byte buffers.
//!
//! An asset is either resident in memory or read lazily from a file. File
//! contents are cached after the first successful, non-empty read; failed or
//! empty reads are not cached so the next access retries.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Key material held in memory for the lifetime of the asset.
#[derive(Debug, Clone)]
pub struct MemoryAsset {
    name: String,
    bytes: Vec<u8>,
}

impl MemoryAsset {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Key material read from `root/path` on first use.
#[derive(Debug)]
pub struct FileAsset {
    root: PathBuf,
    path: PathBuf,
    cache: OnceLock<Vec<u8>>,
}

impl FileAsset {
    /// `root` is the mount point of the filesystem holding the asset; `path`
    /// is relative to it.
    pub fn new(root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
            cache: OnceLock::new(),
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.path)
    }

    pub fn is_cached(&self) -> bool {
        self.cache.get().is_some()
    }

    fn load(&self) -> Option<&[u8]> {
        if let Some(bytes) = self.cache.get() {
            return Some(bytes);
        }

        if !self.root.is_dir() {
            warn!(root = %self.root.display(), "No filesystem mounted for crypto asset");
            return None;
        }

        let path = self.full_path();
        match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => {
                debug!(path = %path.display(), size = bytes.len(), "Crypto asset loaded");
                Some(self.cache.get_or_init(|| bytes).as_slice())
            }
            Ok(_) => {
                warn!(path = %path.display(), "Crypto asset file is empty");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read crypto asset");
                None
            }
        }
    }
}

/// A piece of trust material.
#[derive(Debug)]
pub enum CryptoAsset {
    Memory(MemoryAsset),
    File(FileAsset),
}

impl CryptoAsset {
    pub fn from_memory(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::Memory(MemoryAsset::new(name, bytes))
    }

    pub fn from_file(root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self::File(FileAsset::new(root, path))
    }

    /// Size in bytes, `0` when the asset cannot be read.
    pub fn size(&self) -> usize {
        self.get().len()
    }

    /// Asset contents. Empty when the asset is unavailable.
    pub fn get(&self) -> &[u8] {
        match self {
            Self::Memory(asset) => &asset.bytes,
            Self::File(asset) => asset.load().unwrap_or_default(),
        }
    }

    /// Whether the asset holds enough bytes to be worth parsing.
    pub fn is_usable(&self) -> bool {
        self.size() >= 2
    }

    /// Whether the asset lives on a filesystem partition.
    pub fn is_file_backed(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Human-readable identifier for logs.
    pub fn name(&self) -> String {
        match self {
            Self::Memory(asset) => asset.name.clone(),
            Self::File(asset) => asset.full_path().display().to_string(),
        }
    }

    /// Filesystem root for file-backed assets.
    pub fn root(&self) -> Option<&Path> {
        match self {
            Self::Memory(_) => None,
            Self::File(asset) => Some(&asset.root),
        }
    }
}
