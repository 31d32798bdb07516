//! Retryable vs. unrecoverable classification of backend faults.
//!
//! Every fault raised inside a driver is routed through a
//! [`FailureClassifier`] at the driver boundary:
//! - retryable faults leave the driver as `Err(DriverError::Retryable)`, so the
//!   scheduler's retry policy decides what happens next;
//! - unrecoverable faults become a `Failed` run state carrying the cause.

use std::error::Error;
use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{render_chain, BoxError, DriverError};
use crate::run::DriverRunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Unrecoverable,
}

pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &(dyn Error + 'static)) -> FailureClass;
}

/// Walks the source chain and stops at the first error it recognizes.
///
/// `DriverError` decides by its own variant; `io::Error` is retryable for
/// transient kinds (timeouts, interrupted or reset connections). Anything
/// unrecognized is unrecoverable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &(dyn Error + 'static)) -> FailureClass {
        let mut current = Some(error);
        while let Some(e) = current {
            if let Some(driver_err) = e.downcast_ref::<DriverError>() {
                return if driver_err.is_retryable() {
                    FailureClass::Retryable
                } else {
                    FailureClass::Unrecoverable
                };
            }
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return if is_transient_io(io_err.kind()) {
                    FailureClass::Retryable
                } else {
                    FailureClass::Unrecoverable
                };
            }
            current = e.source();
        }
        FailureClass::Unrecoverable
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
    )
}

/// Map a backend fault raised during execution to the driver boundary.
///
/// Retryable faults propagate as `Err`; unrecoverable ones become `Failed`.
pub fn classify_error(
    driver: &str,
    reason: &str,
    error: BoxError,
    classifier: &dyn FailureClassifier,
) -> Result<DriverRunState, DriverError> {
    match classifier.classify(error.as_ref()) {
        FailureClass::Retryable => Err(DriverError::Retryable(error)),
        FailureClass::Unrecoverable => Ok(DriverRunState::failed(
            driver,
            reason,
            Some(render_chain(error.as_ref())),
        )),
    }
}

/// Combine a terminal run state with the outcome of its commit step.
///
/// - non-success states pass through untouched (nothing was committed);
/// - a successful commit keeps the state unchanged;
/// - a retryable commit fault re-raises as `Err(DriverError::Retryable)`;
/// - an unrecoverable commit fault downgrades the state to `Failed`.
pub fn finalize(
    state: DriverRunState,
    commit: Result<(), BoxError>,
    classifier: &dyn FailureClassifier,
) -> Result<DriverRunState, DriverError> {
    if !state.is_success() {
        return Ok(state);
    }
    match commit {
        Ok(()) => Ok(state),
        Err(e) => classify_error(state.driver(), "post-commit failed", e, classifier),
    }
}
