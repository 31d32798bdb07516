use thiserror::Error;
use uuid::Uuid;

/// Boxed backend error as produced by executors and commit hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors crossing the driver boundary.
///
/// Every backend fault is mapped to exactly one of these before it reaches
/// the scheduler. `Retryable` and `ResourceUnavailable` drive the retry
/// policy; everything else is permanent.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver '{driver}' does not execute transformations of kind '{kind}'")]
    UnsupportedTransformation { driver: String, kind: String },

    #[error("resource unavailable: {resource}: {message}")]
    ResourceUnavailable {
        resource: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("retryable driver failure: {0}")]
    Retryable(#[source] BoxError),

    #[error("unrecoverable driver failure: {message}")]
    Unrecoverable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("unknown run: {0}")]
    UnknownRun(Uuid),

    #[error("transformation kind '{0}' is already registered")]
    DuplicateKind(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl DriverError {
    pub fn retryable(cause: impl Into<BoxError>) -> Self {
        DriverError::Retryable(cause.into())
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        DriverError::Unrecoverable {
            message: message.into(),
            source: None,
        }
    }

    pub fn resource_unavailable(
        resource: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DriverError::ResourceUnavailable {
            resource: resource.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether re-dispatching the identical transformation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Retryable(_) | DriverError::ResourceUnavailable { .. }
        )
    }
}

/// Render an error and its source chain as `outer: inner: root`.
pub fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut current = error.source();
    while let Some(e) = current {
        let msg = e.to_string();
        // thiserror wrappers often repeat the source message in their own.
        if !parts.last().is_some_and(|p| p.ends_with(&msg)) {
            parts.push(msg);
        }
        current = e.source();
    }
    parts.join(": ")
}
