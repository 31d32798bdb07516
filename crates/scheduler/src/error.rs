use thiserror::Error;
use vista_core::{ViewId, ViewState, VistaError};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate view: {0}")]
    DuplicateView(ViewId),

    #[error("view '{view}' depends on unknown view '{dependency}'")]
    UnknownDependency { view: ViewId, dependency: ViewId },

    #[error("dependency cycle through view '{0}'")]
    Cycle(ViewId),

    #[error("view '{0}' is neither external nor has a transformation")]
    MissingTransformation(ViewId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Parameter(#[from] VistaError),

    #[error("view '{view}' depends on '{path}', which matches no defined view")]
    UnknownDependency { view: String, path: String },

    #[error("view '{0}': {1}")]
    Invalid(String, String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("view '{view}' has transformation kind '{kind}' with no registered driver")]
    UnknownDriverKind { view: ViewId, kind: String },

    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    #[error("invalid transition for view '{view}': {from} -> {to}")]
    InvalidTransition {
        view: ViewId,
        from: ViewState,
        to: ViewState,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    #[error("dispatch channel closed unexpectedly")]
    ChannelClosed,
}
