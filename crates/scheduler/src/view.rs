use std::sync::Arc;

use vista_core::{ConfigValue, Field, ViewId, ViewState};
use vista_driver::Transformation;

use crate::store::PersistedView;

/// A node of the dependency graph: one partition of a view plus the
/// transformation that materializes it.
///
/// State and persisted digest are only changed by the scheduler.
#[derive(Debug, Clone)]
pub struct View {
    pub id: ViewId,
    pub fields: Vec<Field>,
    pub dependencies: Vec<ViewId>,
    /// Pre-existing source data; never materialized.
    pub external: bool,
    /// Never rematerialized once materialized, even if the digest changes.
    pub materialize_once: bool,
    transformation: Option<Arc<Transformation>>,
    pub(crate) state: ViewState,
    pub(crate) persisted: Option<PersistedView>,
}

impl View {
    pub fn new(id: ViewId) -> Self {
        Self {
            id,
            fields: Vec::new(),
            dependencies: Vec::new(),
            external: false,
            materialize_once: false,
            transformation: None,
            state: ViewState::Absent,
            persisted: None,
        }
    }

    /// A source view that exists outside the scheduler.
    pub fn external(id: ViewId) -> Self {
        Self {
            external: true,
            ..Self::new(id)
        }
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = Some(Arc::new(transformation));
        self
    }

    pub fn depends_on(mut self, dependency: ViewId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn materialize_once(mut self) -> Self {
        self.materialize_once = true;
        self
    }

    pub fn transformation(&self) -> Option<&Arc<Transformation>> {
        self.transformation.as_ref()
    }

    /// Merge configuration into the view's transformation.
    ///
    /// Copy-on-write: a copy already handed to a driver keeps the
    /// configuration it was dispatched with. No-op for external views.
    pub fn configure_with<I, K, V>(&mut self, options: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        if let Some(t) = self.transformation.as_mut() {
            Arc::make_mut(t).configure_with(options);
        }
        self
    }

    /// Drop the cached digest so the next cycle re-reads every resource.
    pub(crate) fn invalidate_digest(&mut self) {
        if let Some(t) = self.transformation.as_mut() {
            Arc::make_mut(t).invalidate_digest();
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Digest of the last successful materialization, if any.
    pub fn last_digest(&self) -> Option<&str> {
        self.persisted.as_ref().and_then(|p| p.digest.as_deref())
    }

    pub fn persisted(&self) -> Option<&PersistedView> {
        self.persisted.as_ref()
    }

    /// Names of fields flagged as privacy-sensitive.
    pub fn sensitive_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.sensitive)
            .map(|f| f.name.clone())
            .collect()
    }
}
