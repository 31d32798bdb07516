//! Content hashing strategies keyed by resource kind.
//!
//! A [`ResourceHasher`] turns one [`Resource`] into a SHA-256 content hash.
//! The [`DigestRegistry`] picks the hasher by `resource.kind`, so new resource
//! kinds are added by registering a hasher, without touching the scheduler.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::DriverError;
use crate::resource::Resource;

/// Hashes the content behind one kind of resource.
pub trait ResourceHasher: Send + Sync {
    /// Raw SHA-256 over the resource content.
    fn hash(&self, resource: &Resource) -> Result<Vec<u8>, DriverError>;
}

/// Hasher registry used by [`Transformation::version_digest`](crate::Transformation::version_digest).
#[derive(Clone)]
pub struct DigestRegistry {
    hashers: HashMap<String, Arc<dyn ResourceHasher>>,
}

impl DigestRegistry {
    /// An empty registry: every resource kind is unavailable.
    pub fn empty() -> Self {
        Self {
            hashers: HashMap::new(),
        }
    }

    /// Register (or replace) the hasher for a resource kind.
    pub fn register(&mut self, kind: impl Into<String>, hasher: impl ResourceHasher + 'static) {
        self.hashers.insert(kind.into(), Arc::new(hasher));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.hashers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Hash one resource with the strategy registered for its kind.
    pub fn hash(&self, resource: &Resource) -> Result<Vec<u8>, DriverError> {
        let hasher = self.hashers.get(&resource.kind).ok_or_else(|| {
            DriverError::ResourceUnavailable {
                resource: resource.to_string(),
                message: format!("no hasher registered for resource kind '{}'", resource.kind),
                source: None,
            }
        })?;
        hasher.hash(resource)
    }
}

impl Default for DigestRegistry {
    /// Local files and inline literals.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Resource::LOCAL, LocalFileHasher::default());
        registry.register(Resource::INLINE, InlineHasher);
        registry
    }
}

impl std::fmt::Debug for DigestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ── Inline literals ─────────────────────────────────────────────────

/// Hashes the literal text stored in `location`.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineHasher;

impl ResourceHasher for InlineHasher {
    fn hash(&self, resource: &Resource) -> Result<Vec<u8>, DriverError> {
        Ok(Sha256::digest(resource.location.as_bytes()).to_vec())
    }
}

// ── Local files ─────────────────────────────────────────────────────

/// Hashes a local file, or every file below a directory.
///
/// Directories are walked in file-name order; each entry contributes its
/// relative path and its content, so renames change the hash too.
/// Relative locations are resolved against `base_dir` when set.
#[derive(Debug, Default, Clone)]
pub struct LocalFileHasher {
    base_dir: Option<PathBuf>,
}

impl LocalFileHasher {
    pub fn with_base(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ResourceHasher for LocalFileHasher {
    fn hash(&self, resource: &Resource) -> Result<Vec<u8>, DriverError> {
        let path = self.resolve(&resource.location);
        hash_path(&path).map_err(|e| DriverError::resource_unavailable(resource.to_string(), e))
    }
}

fn hash_path(path: &Path) -> io::Result<Vec<u8>> {
    let meta = std::fs::metadata(path)?;
    let mut hasher = Sha256::new();

    if meta.is_file() {
        let mut file = File::open(path)?;
        io::copy(&mut file, &mut hasher)?;
        return Ok(hasher.finalize().to_vec());
    }

    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut hasher)?;
        hasher.update([0u8]);
    }
    Ok(hasher.finalize().to_vec())
}

// ── Distributed filesystem paths ────────────────────────────────────

/// Hashes distributed-filesystem paths through local mount points.
///
/// `hdfs://namenode/libs/udf.jar` with mount `("hdfs://namenode/", "/mnt/hdfs")`
/// is read from `/mnt/hdfs/libs/udf.jar`. A URI matching no mount is unavailable.
#[derive(Debug, Default, Clone)]
pub struct MountedPathHasher {
    mounts: Vec<(String, PathBuf)>,
}

impl MountedPathHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(mut self, prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.mounts.push((prefix.into(), root.into()));
        // Longest prefix first so nested mounts win.
        self.mounts.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    fn resolve(&self, uri: &str) -> Option<PathBuf> {
        self.mounts.iter().find_map(|(prefix, root)| {
            uri.strip_prefix(prefix.as_str())
                .map(|rest| root.join(rest.trim_start_matches('/')))
        })
    }
}

impl ResourceHasher for MountedPathHasher {
    fn hash(&self, resource: &Resource) -> Result<Vec<u8>, DriverError> {
        let path = self
            .resolve(&resource.location)
            .ok_or_else(|| DriverError::ResourceUnavailable {
                resource: resource.to_string(),
                message: "no mount configured for this location".into(),
                source: None,
            })?;
        hash_path(&path).map_err(|e| DriverError::resource_unavailable(resource.to_string(), e))
    }
}
