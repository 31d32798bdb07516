//! Shell command execution.
//!
//! Runs the `command` configuration value via `sh -c`, with optional
//! `working_dir` and `timeout_secs`. A non-zero exit is unrecoverable; a
//! timeout is retryable. Killing the run kills the child process.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::task_driver::{Executor, RunMetadata, TaskDriver};
use crate::error::{BoxError, DriverError};
use crate::transformation::Transformation;

/// Trailing bytes of stdout/stderr kept in metadata and failure causes.
const OUTPUT_TAIL: usize = 2048;

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    working_dir: PathBuf,
    default_timeout: Duration,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            default_timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ShellExecutor {
    const DEFAULT_TIMEOUT_SECS: u64 = 3600;

    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn working_dir(&self, t: &Transformation) -> PathBuf {
        match t.config_str("working_dir") {
            Some(dir) if PathBuf::from(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        }
    }

    fn timeout(&self, t: &Transformation) -> Duration {
        t.config_value("timeout_secs")
            .and_then(|v| v.as_i64())
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end();
    let start = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| trimmed.len() - i <= OUTPUT_TAIL)
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn kinds(&self) -> Vec<String> {
        vec!["shell".into()]
    }

    fn validate(&self, t: &Transformation) -> Result<(), DriverError> {
        match t.config_str("command") {
            Some(cmd) if !cmd.trim().is_empty() => Ok(()),
            _ => Err(DriverError::InvalidConfiguration(
                "shell: 'command' is required".into(),
            )),
        }
    }

    async fn execute(&self, run_id: Uuid, t: Arc<Transformation>) -> Result<RunMetadata, BoxError> {
        self.validate(&t)?;
        let command = t.config_str("command").unwrap_or_default();
        let working_dir = self.working_dir(&t);
        let timeout = self.timeout(&t);

        debug!(
            run_id = %run_id,
            command = command,
            working_dir = %working_dir.display(),
            timeout_secs = timeout.as_secs(),
            "executing shell command"
        );

        // Dropping the child (task abort on kill_run) kills the process.
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(run_id = %run_id, timeout_secs = timeout.as_secs(), "command timed out");
                return Err(Box::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("command timed out after {}s", timeout.as_secs()),
                )));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            let stderr = tail(&output.stderr);
            return Err(Box::new(DriverError::Unrecoverable {
                message: format!("command exited with code {exit_code}"),
                source: (!stderr.is_empty()).then(|| BoxError::from(stderr)),
            }));
        }

        let mut metadata = RunMetadata::new();
        metadata.insert("exit_code".into(), json!(exit_code));
        metadata.insert("stdout".into(), json!(tail(&output.stdout)));
        Ok(metadata)
    }
}

pub type ShellDriver = TaskDriver<ShellExecutor>;

impl TaskDriver<ShellExecutor> {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self::with_executor(ShellExecutor::new(working_dir))
    }
}
