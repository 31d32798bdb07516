use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transformation::Transformation;

/// Identifies one execution of one transformation by one driver.
#[derive(Debug, Clone)]
pub struct DriverRunHandle {
    pub run_id: Uuid,
    pub driver: String,
    pub transformation: Arc<Transformation>,
    pub started_at: DateTime<Utc>,
}

impl DriverRunHandle {
    pub fn new(driver: impl Into<String>, transformation: Arc<Transformation>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            driver: driver.into(),
            transformation,
            started_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}

/// Backend-independent run state.
///
/// Moves monotonically `Ongoing` → `Succeeded` | `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriverRunState {
    Ongoing {
        driver: String,
        elapsed_ms: u64,
    },
    Succeeded {
        driver: String,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    Failed {
        driver: String,
        reason: String,
        #[serde(default)]
        cause: Option<String>,
    },
}

impl DriverRunState {
    pub const CANCELLED: &'static str = "cancelled";

    pub fn ongoing(driver: impl Into<String>, elapsed: Duration) -> Self {
        Self::Ongoing {
            driver: driver.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn succeeded(driver: impl Into<String>) -> Self {
        Self::Succeeded {
            driver: driver.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn succeeded_with(
        driver: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self::Succeeded {
            driver: driver.into(),
            metadata,
        }
    }

    pub fn failed(driver: impl Into<String>, reason: impl Into<String>, cause: Option<String>) -> Self {
        Self::Failed {
            driver: driver.into(),
            reason: reason.into(),
            cause,
        }
    }

    /// Terminal state of a run stopped through `kill_run`.
    pub fn cancelled(driver: impl Into<String>) -> Self {
        Self::failed(driver, format!("{}: run killed on request", Self::CANCELLED), None)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ongoing { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Failed { reason, .. } if reason.starts_with(Self::CANCELLED))
    }

    pub fn driver(&self) -> &str {
        match self {
            Self::Ongoing { driver, .. }
            | Self::Succeeded { driver, .. }
            | Self::Failed { driver, .. } => driver,
        }
    }

    /// `reason: cause` for failures.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Failed { reason, cause: Some(cause), .. } => Some(format!("{reason}: {cause}")),
            Self::Failed { reason, cause: None, .. } => Some(reason.clone()),
            _ => None,
        }
    }
}
