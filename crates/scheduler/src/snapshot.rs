use std::collections::BTreeMap;

use serde::Serialize;
use vista_core::{ConfigValue, Field, ViewId, ViewState};

use crate::view::View;

/// Read-only picture of one view, as consumed by catalog sync.
#[derive(Debug, Clone, Serialize)]
pub struct ViewStatus {
    pub id: ViewId,
    pub url_path: String,
    pub table_fqdn: String,
    pub parameter_string: Option<String>,
    pub state: ViewState,
    pub dependencies: Vec<ViewId>,
    pub fields: Vec<Field>,
    pub transformation_kind: Option<String>,
    pub configuration: BTreeMap<String, ConfigValue>,
    pub external: bool,
    pub materialize_once: bool,
    pub last_digest: Option<String>,
}

impl From<&View> for ViewStatus {
    fn from(view: &View) -> Self {
        let transformation = view.transformation();
        Self {
            id: view.id.clone(),
            url_path: view.id.url_path(),
            table_fqdn: view.id.table_fqdn(),
            parameter_string: view.id.parameter_string(),
            state: view.state(),
            dependencies: view.dependencies.clone(),
            fields: view.fields.clone(),
            transformation_kind: transformation.map(|t| t.kind().to_string()),
            configuration: transformation
                .map(|t| t.configuration().clone())
                .unwrap_or_default(),
            external: view.external,
            materialize_once: view.materialize_once,
            last_digest: view.last_digest().map(str::to_string),
        }
    }
}
