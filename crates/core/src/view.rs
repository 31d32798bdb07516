use std::fmt;

use serde::{Deserialize, Serialize};

/// An ordered partition parameter. `value == None` means "not yet bound".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Option<String>,
}

impl Parameter {
    pub fn bound(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn unbound(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

/// Fully-qualified identity of one partition of a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl ViewId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a bound partition parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::bound(name, value));
        self
    }

    /// `namespace.name`, the table-level identity shared by all partitions.
    pub fn table_fqdn(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// `namespace/name/v1/v2`, unbound values rendered as `*`.
    pub fn url_path(&self) -> String {
        let mut path = format!("{}/{}", self.namespace, self.name);
        for p in &self.parameters {
            path.push('/');
            path.push_str(p.value.as_deref().unwrap_or("*"));
        }
        path
    }

    /// `/p1=v1/p2=v2`, or `None` for unpartitioned views.
    pub fn parameter_string(&self) -> Option<String> {
        if self.parameters.is_empty() {
            return None;
        }
        let mut s = String::new();
        for p in &self.parameters {
            s.push('/');
            s.push_str(&p.name);
            s.push('=');
            s.push_str(p.value.as_deref().unwrap_or("*"));
        }
        Some(s)
    }

    pub fn is_fully_bound(&self) -> bool {
        self.parameters.iter().all(|p| p.value.is_some())
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url_path())
    }
}

/// A column of a view. `sensitive` marks privacy-relevant fields that
/// export-style transformations anonymize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

fn default_field_type() -> String {
    "string".into()
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            description: None,
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// View lifecycle state within one scheduling cycle.
///
/// ```text
/// Absent ──► Waiting ──► Eligible ──► Transforming ──► Materialized
///    │                      │  ▲            │
///    └──────────────────────┘  │            ├──► Retrying ──► Transforming
///                              │            │
///                   (cache hit)└──► Materialized      └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    /// Not evaluated yet in this cycle.
    Absent,
    /// At least one dependency is not materialized.
    Waiting,
    /// All dependencies satisfied; digest comparison / dispatch pending.
    Eligible,
    /// Dispatched to a driver, handle outstanding.
    Transforming,
    /// Transient failure, re-dispatch scheduled.
    Retrying,
    /// Up to date for this cycle.
    Materialized,
    /// Permanently failed for this cycle.
    Failed,
}

impl ViewState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Materialized | Self::Failed)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Absent => matches!(
                target,
                Self::Waiting | Self::Eligible | Self::Materialized
            ),
            Self::Waiting => matches!(target, Self::Eligible | Self::Materialized),
            Self::Eligible => matches!(
                target,
                Self::Transforming | Self::Materialized | Self::Retrying | Self::Failed
            ),
            Self::Transforming => matches!(
                target,
                Self::Materialized | Self::Retrying | Self::Failed
            ),
            Self::Retrying => matches!(target, Self::Transforming | Self::Eligible | Self::Failed),
            Self::Materialized | Self::Failed => false,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Waiting => "waiting",
            Self::Eligible => "eligible",
            Self::Transforming => "transforming",
            Self::Retrying => "retrying",
            Self::Materialized => "materialized",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reason attached to every view state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    DependenciesPending,
    DependenciesSatisfied,
    /// External source view, nothing to materialize.
    ExemptFromMaterialization,
    /// Digest matches the persisted one; no dispatch needed.
    UpToDate,
    Dispatched,
    Succeeded,
    RetryScheduled,
    RetryDue,
    RetryBudgetExhausted,
    DriverFailed,
    DigestUnavailable,
    Cancelled,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DependenciesPending => "dependencies_pending",
            Self::DependenciesSatisfied => "dependencies_satisfied",
            Self::ExemptFromMaterialization => "exempt_from_materialization",
            Self::UpToDate => "up_to_date",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::RetryScheduled => "retry_scheduled",
            Self::RetryDue => "retry_due",
            Self::RetryBudgetExhausted => "retry_budget_exhausted",
            Self::DriverFailed => "driver_failed",
            Self::DigestUnavailable => "digest_unavailable",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
