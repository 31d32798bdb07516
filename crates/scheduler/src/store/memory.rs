use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use vista_core::ViewId;

use super::{PersistedView, StateStore};
use crate::error::StoreError;

/// Process-local store, used by tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    views: RwLock<HashMap<ViewId, PersistedView>>,
    unavailable: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, simulating loss of the store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self, id: &ViewId) -> Result<Option<PersistedView>, StoreError> {
        self.check()?;
        let views = self
            .views
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(views.get(id).cloned())
    }

    fn save(&self, id: &ViewId, view: &PersistedView) -> Result<(), StoreError> {
        self.check()?;
        let mut views = self
            .views
            .write()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        views.insert(id.clone(), view.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<(ViewId, PersistedView)>, StoreError> {
        self.check()?;
        let views = self
            .views
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut all: Vec<_> = views.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}
