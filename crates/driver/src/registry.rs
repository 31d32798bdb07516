use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::DriverError;
use crate::transformation::Transformation;

/// Routes transformations to drivers by kind.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    by_kind: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` for every kind it declares.
    ///
    /// Fails with `DuplicateKind` if any of its kinds is already taken; in that
    /// case nothing is registered.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Result<(), DriverError> {
        let kinds = driver.transformation_kinds();
        if let Some(taken) = kinds.iter().find(|k| self.by_kind.contains_key(*k)) {
            return Err(DriverError::DuplicateKind(taken.clone()));
        }
        for kind in kinds {
            tracing::debug!(driver = driver.name(), kind = %kind, "driver registered");
            self.by_kind.insert(kind, Arc::clone(&driver));
        }
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, driver: impl Driver + 'static) -> Result<Self, DriverError> {
        self.register(Arc::new(driver))?;
        Ok(self)
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn Driver>> {
        self.by_kind.get(kind)
    }

    pub fn driver_for(&self, transformation: &Transformation) -> Option<&Arc<dyn Driver>> {
        self.get(transformation.kind())
    }

    pub fn contains_kind(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.by_kind.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Distinct drivers, one entry per name.
    pub fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        let mut seen: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        for driver in self.by_kind.values() {
            seen.entry(driver.name().to_string())
                .or_insert_with(|| Arc::clone(driver));
        }
        let mut drivers: Vec<_> = seen.into_values().collect();
        drivers.sort_by(|a, b| a.name().cmp(b.name()));
        drivers
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{FilesystemDriver, NoOpDriver};

    #[test]
    fn routes_by_kind() {
        let registry = DriverRegistry::new()
            .with(NoOpDriver::new())
            .unwrap()
            .with(FilesystemDriver::new())
            .unwrap();
        assert_eq!(registry.kinds(), vec!["filesystem", "noop"]);
        let t = Transformation::new("filesystem");
        assert_eq!(registry.driver_for(&t).map(|d| d.name()), Some("filesystem"));
        assert!(registry.get("spark").is_none());
        assert_eq!(registry.drivers().len(), 2);
    }

    #[test]
    fn duplicate_kind_rejected() {
        let registry = DriverRegistry::new().with(NoOpDriver::new()).unwrap();
        let err = registry.with(NoOpDriver::new()).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateKind(kind) if kind == "noop"));
    }
}
