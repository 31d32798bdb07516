//! TOML view definitions.
//!
//! ```toml
//! [[views]]
//! namespace = "shop"
//! name = "orders"
//! parameters = [{ name = "day", value = "${run_date}" }]
//! depends_on = ["shop/raw_orders/${run_date}"]
//! fields = [{ name = "email", sensitive = true }]
//!
//! [views.transformation]
//! kind = "shell"
//! resources = [{ kind = "file", location = "sql/orders.sql" }]
//! configuration = { command = "bin/build-orders ${run_date}" }
//! anonymize = true
//! ```
//!
//! Parameter values, dependency paths, resource locations and text
//! configuration values may all contain `${...}` placeholders, resolved
//! against the run date at [`ViewDefinitions::bind`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use vista_core::{ConfigValue, Field, Parameter, ParameterBinder, ViewId};
use vista_driver::{Resource, Transformation};

use crate::error::DefinitionError;
use crate::view::View;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewDefinitions {
    #[serde(default)]
    pub views: Vec<ViewDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewDefinition {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Url paths of dependencies, possibly templated.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub materialize_once: bool,
    #[serde(default)]
    pub transformation: Option<TransformationDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformationDefinition {
    pub kind: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub configuration: BTreeMap<String, ConfigValue>,
    /// Pass the names of sensitive fields as `anonymized_fields`.
    #[serde(default)]
    pub anonymize: bool,
}

impl ViewDefinitions {
    pub fn from_toml(toml_str: &str) -> Result<Self, DefinitionError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Resolve every template against `run_date` and build the views.
    ///
    /// Dependencies are matched by bound url path; a path that names no
    /// defined view is an error.
    pub fn bind(&self, run_date: NaiveDate) -> Result<Vec<View>, DefinitionError> {
        let binder = ParameterBinder::new(run_date);

        let ids = self
            .views
            .iter()
            .map(|def| {
                let id = ViewId {
                    namespace: def.namespace.clone(),
                    name: def.name.clone(),
                    parameters: def.parameters.clone(),
                };
                binder.bind_id(&id)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let by_path: HashMap<String, &ViewId> = ids.iter().map(|id| (id.url_path(), id)).collect();

        self.views
            .iter()
            .zip(&ids)
            .map(|(def, id)| {
                let mut view = View::new(id.clone());
                view.external = def.external;
                view.materialize_once = def.materialize_once;
                view.fields = def.fields.clone();

                for template in &def.depends_on {
                    let path = binder.resolve(template)?;
                    let dep = by_path.get(&path).ok_or_else(|| DefinitionError::UnknownDependency {
                        view: id.url_path(),
                        path: path.clone(),
                    })?;
                    view.dependencies.push((*dep).clone());
                }

                match (&def.transformation, def.external) {
                    (Some(_), true) => {
                        return Err(DefinitionError::Invalid(
                            id.url_path(),
                            "external views cannot declare a transformation".into(),
                        ))
                    }
                    (None, false) => {
                        return Err(DefinitionError::Invalid(
                            id.url_path(),
                            "missing transformation".into(),
                        ))
                    }
                    (Some(t), false) => {
                        let transformation = t.build(&binder, &view.sensitive_fields())?;
                        view = view.with_transformation(transformation);
                    }
                    (None, true) => {}
                }
                Ok(view)
            })
            .collect()
    }
}

impl TransformationDefinition {
    fn build(
        &self,
        binder: &ParameterBinder,
        sensitive_fields: &[String],
    ) -> Result<Transformation, DefinitionError> {
        let resources = self
            .resources
            .iter()
            .map(|r| Ok(Resource::new(r.kind.clone(), binder.resolve(&r.location)?)))
            .collect::<Result<Vec<_>, DefinitionError>>()?;

        let mut configuration = Vec::with_capacity(self.configuration.len() + 1);
        for (key, value) in &self.configuration {
            let value = match value {
                ConfigValue::Text(s) => ConfigValue::Text(binder.resolve(s)?),
                other => other.clone(),
            };
            configuration.push((key.clone(), value));
        }
        if self.anonymize {
            configuration.push((
                "anonymized_fields".to_string(),
                ConfigValue::from(sensitive_fields.to_vec()),
            ));
        }

        let mut transformation = Transformation::new(self.kind.clone()).with_resources(resources);
        transformation.configure_with(configuration);
        Ok(transformation)
    }
}
