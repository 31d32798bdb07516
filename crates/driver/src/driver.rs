use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::run::{DriverRunHandle, DriverRunState};
use crate::transformation::Transformation;

/// Executes transformations for one backend.
///
/// `run` only hands work off; progress is read through
/// [`get_driver_run_state`](Driver::get_driver_run_state). That split lets the
/// scheduler multiplex many runs per driver without a thread per run, while
/// [`run_and_wait`](Driver::run_and_wait) stays available for one-shot use.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable lowercase identifier, used for routing and config namespacing.
    fn name(&self) -> &str;

    /// Transformation kinds this driver executes.
    fn transformation_kinds(&self) -> Vec<String>;

    fn supports(&self, transformation: &Transformation) -> bool {
        self.transformation_kinds()
            .iter()
            .any(|k| k == transformation.kind())
    }

    /// How often `run_and_wait` polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    /// Start executing `transformation`. Must return once the work is handed off.
    ///
    /// Fails with `UnsupportedTransformation` (and no handle) for kinds the
    /// driver does not execute.
    async fn run(&self, transformation: Arc<Transformation>) -> Result<DriverRunHandle, DriverError>;

    /// Current state of a run. Never waits for completion.
    ///
    /// Retryable backend faults surface here as `Err(DriverError::Retryable)`.
    async fn get_driver_run_state(&self, handle: &DriverRunHandle) -> Result<DriverRunState, DriverError>;

    /// Best-effort cancellation. A killed run ends `Failed` with a
    /// cancellation reason, never `Succeeded`.
    async fn kill_run(&self, handle: &DriverRunHandle) -> Result<(), DriverError>;

    /// Finalize a terminal run, e.g. commit a staged write.
    ///
    /// Returns the state unchanged on success, a `Failed` state for an
    /// unrecoverable commit fault, and `Err(DriverError::Retryable)` when the
    /// commit may succeed on re-dispatch.
    async fn post_commit(
        &self,
        _handle: &DriverRunHandle,
        state: DriverRunState,
    ) -> Result<DriverRunState, DriverError> {
        Ok(state)
    }

    /// Drop any bookkeeping kept for a finished run.
    async fn release(&self, _handle: &DriverRunHandle) {}

    /// `run`, poll until terminal, then `post_commit`.
    async fn run_and_wait(&self, transformation: Arc<Transformation>) -> Result<DriverRunState, DriverError> {
        let handle = self.run(transformation).await?;
        let state = loop {
            let state = match self.get_driver_run_state(&handle).await {
                Ok(state) => state,
                Err(e) => {
                    self.release(&handle).await;
                    return Err(e);
                }
            };
            if state.is_terminal() {
                break state;
            }
            tokio::time::sleep(self.poll_interval()).await;
        };
        let result = self.post_commit(&handle, state).await;
        self.release(&handle).await;
        result
    }
}

/// Blanket implementation so `Arc<dyn Driver>` can be used directly.
#[async_trait]
impl<T: Driver + ?Sized> Driver for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn transformation_kinds(&self) -> Vec<String> {
        (**self).transformation_kinds()
    }

    fn poll_interval(&self) -> Duration {
        (**self).poll_interval()
    }

    async fn run(&self, transformation: Arc<Transformation>) -> Result<DriverRunHandle, DriverError> {
        (**self).run(transformation).await
    }

    async fn get_driver_run_state(&self, handle: &DriverRunHandle) -> Result<DriverRunState, DriverError> {
        (**self).get_driver_run_state(handle).await
    }

    async fn kill_run(&self, handle: &DriverRunHandle) -> Result<(), DriverError> {
        (**self).kill_run(handle).await
    }

    async fn post_commit(
        &self,
        handle: &DriverRunHandle,
        state: DriverRunState,
    ) -> Result<DriverRunState, DriverError> {
        (**self).post_commit(handle, state).await
    }

    async fn release(&self, handle: &DriverRunHandle) {
        (**self).release(handle).await
    }
}
