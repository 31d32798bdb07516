use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use vista_core::ViewId;

use super::{PersistedView, StateStore};
use crate::error::StoreError;

/// One JSON document per view under a base directory.
///
/// ```text
/// state/
///   shop__orders__2024-03-01-3f1c9a0b2d4e6f81.json
///   shop__customers-9b0e4c7d1a2f3e56.json
/// ```
///
/// The readable prefix is lossy; the suffix hashes the full identity, so
/// distinct views never share a file.
pub struct FileStateStore {
    base_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct Record {
    view: ViewId,
    #[serde(flatten)]
    persisted: PersistedView,
}

impl FileStateStore {
    /// Create the store, ensuring the base directory exists.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, id: &ViewId) -> Result<PathBuf, StoreError> {
        Ok(self.base_dir.join(view_filename(id)?))
    }
}

/// Url paths contain `/`, so flatten them to `__` and replace anything
/// outside a portable filename alphabet, then append a hash of the exact
/// identity.
fn view_filename(id: &ViewId) -> Result<String, StoreError> {
    let flat: String = id
        .url_path()
        .replace('/', "__")
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' | '=' => c,
            _ => '~',
        })
        .collect();
    let identity = serde_json::to_vec(id)?;
    let hash = Sha256::digest(&identity);
    let suffix: String = hash[..8].iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("{flat}-{suffix}.json"))
}

impl StateStore for FileStateStore {
    fn load(&self, id: &ViewId) -> Result<Option<PersistedView>, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        let record: Record = serde_json::from_str(&json)?;
        if record.view != *id {
            warn!(view = %id, stored = %record.view, path = %path.display(), "state file belongs to another view");
            return Ok(None);
        }
        Ok(Some(record.persisted))
    }

    fn save(&self, id: &ViewId, view: &PersistedView) -> Result<(), StoreError> {
        let record = Record {
            view: id.clone(),
            persisted: view.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        let path = self.path_for(id)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(view = %id, state = %view.state, path = %path.display(), "view state saved");
        Ok(())
    }

    fn list(&self) -> Result<Vec<(ViewId, PersistedView)>, StoreError> {
        let mut all = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: Record = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            all.push((record.view, record.persisted));
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_core::ViewState;

    #[test]
    fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id = ViewId::new("shop", "orders").with_parameter("day", "2024-03-01");
        {
            let store = FileStateStore::new(dir.path()).unwrap();
            store.save(&id, &PersistedView::materialized("d1")).unwrap();
        }
        let store = FileStateStore::new(dir.path()).unwrap();
        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded.state, ViewState::Materialized);
        assert_eq!(loaded.digest.as_deref(), Some("d1"));
        assert!(dir.path().join(view_filename(&id).unwrap()).exists());
    }

    #[test]
    fn list_returns_identities() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        let a = ViewId::new("shop", "a");
        let b = ViewId::new("shop", "b");
        store.save(&b, &PersistedView::failed(None)).unwrap();
        store.save(&a, &PersistedView::materialized("x")).unwrap();
        let listed: Vec<ViewId> = store.list().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(listed, vec![a, b]);
    }

    #[test]
    fn missing_view_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        assert!(store.load(&ViewId::new("x", "y")).unwrap().is_none());
    }

    #[test]
    fn filenames_are_portable() {
        let id = ViewId::new("shop", "events").with_parameter("src", "s3:bucket");
        let name = view_filename(&id).unwrap();
        assert!(name.starts_with("shop__events__s3~bucket-"), "{name}");
        assert!(name.ends_with(".json"));
        assert_eq!(name, view_filename(&id).unwrap());
    }

    #[test]
    fn views_with_the_same_portable_name_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        let colon = ViewId::new("events", "raw").with_parameter("src", "eu:west");
        let space = ViewId::new("events", "raw").with_parameter("src", "eu west");
        let nested = ViewId::new("a__b", "c");
        let flat = ViewId::new("a", "b__c");

        store.save(&colon, &PersistedView::materialized("d")).unwrap();
        store.save(&nested, &PersistedView::materialized("e")).unwrap();

        assert!(store.load(&space).unwrap().is_none());
        assert!(store.load(&flat).unwrap().is_none());
        assert_eq!(store.load(&colon).unwrap().unwrap().digest.as_deref(), Some("d"));
        assert_ne!(view_filename(&colon).unwrap(), view_filename(&space).unwrap());
        assert_ne!(view_filename(&nested).unwrap(), view_filename(&flat).unwrap());
    }

    #[test]
    fn record_of_another_view_is_not_returned() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        let mine = ViewId::new("shop", "orders");
        let other = ViewId::new("shop", "refunds");
        store.save(&other, &PersistedView::materialized("x")).unwrap();
        std::fs::rename(
            dir.path().join(view_filename(&other).unwrap()),
            dir.path().join(view_filename(&mine).unwrap()),
        )
        .unwrap();

        assert!(store.load(&mine).unwrap().is_none());
    }
}
