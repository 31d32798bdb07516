//! Filesystem-only materialization: stage a copy, then swap it into place.
//!
//! Configuration:
//! - `target` (required): path of the materialized output.
//! - `source`: file or directory copied into the output, or
//! - `content`: literal text written as the output file.
//!
//! Execution writes to `<target>.staging-<run_id>`; `post_commit` renames the
//! staging path over `target`. A killed or failed run never touches `target`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;
use walkdir::WalkDir;

use super::task_driver::{Executor, RunMetadata, TaskDriver};
use crate::error::{BoxError, DriverError};
use crate::transformation::Transformation;

#[derive(Debug, Default, Clone)]
pub struct FilesystemExecutor {
    base_dir: Option<PathBuf>,
}

enum Payload {
    Copy(PathBuf),
    Write(String),
}

impl FilesystemExecutor {
    /// Resolve relative `source`/`target` paths against `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        match &self.base_dir {
            Some(base) if p.is_relative() => base.join(p),
            _ => p.to_path_buf(),
        }
    }

    fn target(&self, t: &Transformation) -> Result<PathBuf, DriverError> {
        t.config_str("target")
            .map(|p| self.resolve(p))
            .ok_or_else(|| DriverError::InvalidConfiguration("filesystem: 'target' is required".into()))
    }

    fn payload(&self, t: &Transformation) -> Result<Payload, DriverError> {
        match (t.config_str("source"), t.config_str("content")) {
            (Some(source), None) => Ok(Payload::Copy(self.resolve(source))),
            (None, Some(content)) => Ok(Payload::Write(content.to_string())),
            (Some(_), Some(_)) => Err(DriverError::InvalidConfiguration(
                "filesystem: 'source' and 'content' are mutually exclusive".into(),
            )),
            (None, None) => Err(DriverError::InvalidConfiguration(
                "filesystem: one of 'source' or 'content' is required".into(),
            )),
        }
    }
}

fn staging_path(target: &Path, run_id: Uuid) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".staging-{run_id}"));
    target.with_file_name(name)
}

fn remove_any(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file or a directory tree; returns the number of bytes copied.
fn copy_tree(source: &Path, dest: &Path) -> io::Result<u64> {
    if source.is_file() {
        return fs::copy(source, dest);
    }
    let mut bytes = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let out = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            bytes += fs::copy(entry.path(), &out)?;
        }
    }
    Ok(bytes)
}

fn stage(payload: Payload, staging: &Path) -> io::Result<u64> {
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent)?;
    }
    match payload {
        Payload::Copy(source) => copy_tree(&source, staging),
        Payload::Write(content) => {
            fs::write(staging, content.as_bytes())?;
            Ok(content.len() as u64)
        }
    }
}

/// Swap `staging` into `target`, keeping the old output until the rename
/// succeeded.
fn swap_into_place(staging: &Path, target: &Path, run_id: Uuid) -> io::Result<()> {
    if !target.exists() {
        return fs::rename(staging, target);
    }
    let mut previous = target.as_os_str().to_os_string();
    previous.push(format!(".previous-{run_id}"));
    let previous = PathBuf::from(previous);

    fs::rename(target, &previous)?;
    if let Err(e) = fs::rename(staging, target) {
        fs::rename(&previous, target)?;
        return Err(e);
    }
    remove_any(&previous)
}

#[async_trait]
impl Executor for FilesystemExecutor {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn kinds(&self) -> Vec<String> {
        vec!["filesystem".into()]
    }

    fn validate(&self, t: &Transformation) -> Result<(), DriverError> {
        self.target(t)?;
        self.payload(t)?;
        Ok(())
    }

    async fn execute(&self, run_id: Uuid, t: Arc<Transformation>) -> Result<RunMetadata, BoxError> {
        let target = self.target(&t)?;
        let payload = self.payload(&t)?;
        let staging = staging_path(&target, run_id);

        let staged = staging.clone();
        let bytes = tokio::task::spawn_blocking(move || stage(payload, &staged)).await??;

        let mut metadata = RunMetadata::new();
        metadata.insert("staging".into(), json!(staging.display().to_string()));
        metadata.insert("bytes".into(), json!(bytes));
        Ok(metadata)
    }

    async fn commit(
        &self,
        run_id: Uuid,
        t: &Transformation,
        _metadata: &RunMetadata,
    ) -> Result<(), BoxError> {
        let target = self.target(t)?;
        let staging = staging_path(&target, run_id);
        tokio::task::spawn_blocking(move || swap_into_place(&staging, &target, run_id)).await??;
        Ok(())
    }

    async fn discard(&self, run_id: Uuid, t: &Transformation) {
        let Ok(target) = self.target(t) else {
            return;
        };
        let staging = staging_path(&target, run_id);
        if staging.exists() {
            if let Err(e) = remove_any(&staging) {
                tracing::warn!(path = %staging.display(), error = %e, "failed to remove staging output");
            }
        }
    }
}

pub type FilesystemDriver = TaskDriver<FilesystemExecutor>;

impl TaskDriver<FilesystemExecutor> {
    pub fn new() -> Self {
        Self::with_executor(FilesystemExecutor::default())
    }
}

impl Default for TaskDriver<FilesystemExecutor> {
    fn default() -> Self {
        Self::new()
    }
}
