//! Persistence of per-view terminal state and last successful digest.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vista_core::{ViewId, ViewState};

use crate::error::StoreError;

/// What the scheduler remembers about a view between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedView {
    pub state: ViewState,
    /// Digest of the last successful materialization.
    pub digest: Option<String>,
    /// A dependency was rematerialized after this result was produced.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inputs_changed: bool,
    pub updated_at: DateTime<Utc>,
}

impl PersistedView {
    pub fn materialized(digest: impl Into<String>) -> Self {
        Self {
            state: ViewState::Materialized,
            digest: Some(digest.into()),
            inputs_changed: false,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(previous_digest: Option<String>) -> Self {
        Self {
            state: ViewState::Failed,
            digest: previous_digest,
            inputs_changed: false,
            updated_at: Utc::now(),
        }
    }

    /// Whether a matching digest means the prior result is still valid.
    pub fn is_valid_for(&self, digest: &str) -> bool {
        self.state == ViewState::Materialized
            && !self.inputs_changed
            && self.digest.as_deref() == Some(digest)
    }

    /// The same result, marked as built from input that has since changed.
    pub fn with_inputs_changed(&self) -> Self {
        Self {
            inputs_changed: true,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}


/// Key-value association from view identity to persisted state.
///
/// Any error is treated as loss of the store and aborts the running cycle.
pub trait StateStore: Send + Sync {
    fn load(&self, id: &ViewId) -> Result<Option<PersistedView>, StoreError>;

    fn save(&self, id: &ViewId, view: &PersistedView) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<(ViewId, PersistedView)>, StoreError>;
}
