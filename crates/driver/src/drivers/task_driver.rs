use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classify::{classify_error, finalize, DefaultClassifier, FailureClassifier};
use crate::driver::Driver;
use crate::error::{render_chain, BoxError, DriverError};
use crate::run::{DriverRunHandle, DriverRunState};
use crate::transformation::Transformation;

/// Result metadata reported by a successful execution.
pub type RunMetadata = serde_json::Map<String, serde_json::Value>;

/// Backend-specific work behind a [`TaskDriver`].
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kinds(&self) -> Vec<String>;

    /// Reject configuration the executor cannot run with.
    fn validate(&self, _transformation: &Transformation) -> Result<(), DriverError> {
        Ok(())
    }

    async fn execute(
        &self,
        run_id: Uuid,
        transformation: Arc<Transformation>,
    ) -> Result<RunMetadata, BoxError>;

    /// Finalize a successful execution.
    async fn commit(
        &self,
        _run_id: Uuid,
        _transformation: &Transformation,
        _metadata: &RunMetadata,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Remove leftovers of a run. Must be idempotent and leave committed
    /// output alone.
    async fn discard(&self, _run_id: Uuid, _transformation: &Transformation) {}
}

enum RunSlot {
    Running(JoinHandle<Result<RunMetadata, BoxError>>),
    Done(DriverRunState),
    /// Execution raised a retryable fault; kept so repeated polls agree.
    RetryableFault(String),
    Cancelled,
}

/// Runs each dispatch of an [`Executor`] as its own tokio task.
pub struct TaskDriver<E: Executor> {
    executor: Arc<E>,
    classifier: Arc<dyn FailureClassifier>,
    runs: Mutex<HashMap<Uuid, RunSlot>>,
    poll_interval: Duration,
}

impl<E: Executor> TaskDriver<E> {
    pub fn with_executor(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
            classifier: Arc::new(DefaultClassifier),
            runs: Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs with a slot still held (not yet released).
    pub async fn tracked_runs(&self) -> usize {
        self.runs.lock().await.len()
    }

    async fn settle(
        &self,
        task: JoinHandle<Result<RunMetadata, BoxError>>,
    ) -> RunSlot {
        let name = self.executor.name();
        match task.await {
            Ok(Ok(metadata)) => RunSlot::Done(DriverRunState::succeeded_with(name, metadata)),
            Ok(Err(fault)) => {
                let message = render_chain(fault.as_ref());
                match classify_error(name, "execution failed", fault, self.classifier.as_ref()) {
                    Ok(state) => RunSlot::Done(state),
                    Err(_) => RunSlot::RetryableFault(message),
                }
            }
            Err(join) if join.is_cancelled() => RunSlot::Cancelled,
            Err(join) => RunSlot::Done(DriverRunState::failed(
                name,
                "executor panicked",
                Some(join.to_string()),
            )),
        }
    }
}

#[async_trait]
impl<E: Executor> Driver for TaskDriver<E> {
    fn name(&self) -> &str {
        self.executor.name()
    }

    fn transformation_kinds(&self) -> Vec<String> {
        self.executor.kinds()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn run(&self, transformation: Arc<Transformation>) -> Result<DriverRunHandle, DriverError> {
        if !self.supports(&transformation) {
            return Err(DriverError::UnsupportedTransformation {
                driver: self.name().to_string(),
                kind: transformation.kind().to_string(),
            });
        }
        self.executor.validate(&transformation)?;

        let handle = DriverRunHandle::new(self.name(), Arc::clone(&transformation));
        let executor = Arc::clone(&self.executor);
        let run_id = handle.run_id;
        let task = tokio::spawn(async move { executor.execute(run_id, transformation).await });

        self.runs.lock().await.insert(run_id, RunSlot::Running(task));
        debug!(driver = self.name(), run_id = %run_id, "run started");
        Ok(handle)
    }

    async fn get_driver_run_state(&self, handle: &DriverRunHandle) -> Result<DriverRunState, DriverError> {
        let mut runs = self.runs.lock().await;
        let slot = runs
            .remove(&handle.run_id)
            .ok_or(DriverError::UnknownRun(handle.run_id))?;

        let slot = match slot {
            RunSlot::Running(task) if !task.is_finished() => {
                runs.insert(handle.run_id, RunSlot::Running(task));
                return Ok(DriverRunState::ongoing(self.name(), handle.elapsed()));
            }
            RunSlot::Running(task) => self.settle(task).await,
            other => other,
        };

        let result = match &slot {
            RunSlot::Done(state) => Ok(state.clone()),
            RunSlot::RetryableFault(message) => Err(DriverError::retryable(message.clone())),
            RunSlot::Cancelled => Ok(DriverRunState::cancelled(self.name())),
            RunSlot::Running(_) => Ok(DriverRunState::ongoing(self.name(), handle.elapsed())),
        };
        runs.insert(handle.run_id, slot);
        result
    }

    async fn kill_run(&self, handle: &DriverRunHandle) -> Result<(), DriverError> {
        {
            let mut runs = self.runs.lock().await;
            let slot = runs
                .get_mut(&handle.run_id)
                .ok_or(DriverError::UnknownRun(handle.run_id))?;
            match slot {
                RunSlot::Running(task) => {
                    task.abort();
                    *slot = RunSlot::Cancelled;
                }
                // Already terminal; nothing left to stop.
                _ => return Ok(()),
            }
        }
        warn!(driver = self.name(), run_id = %handle.run_id, "run killed");
        self.executor
            .discard(handle.run_id, &handle.transformation)
            .await;
        Ok(())
    }

    async fn post_commit(
        &self,
        handle: &DriverRunHandle,
        state: DriverRunState,
    ) -> Result<DriverRunState, DriverError> {
        let commit = match &state {
            DriverRunState::Succeeded { metadata, .. } => {
                self.executor
                    .commit(handle.run_id, &handle.transformation, metadata)
                    .await
            }
            _ => Ok(()),
        };
        finalize(state, commit, self.classifier.as_ref())
    }

    /// Forget the run and clean up anything it left behind. Committed output
    /// is never touched.
    async fn release(&self, handle: &DriverRunHandle) {
        let slot = self.runs.lock().await.remove(&handle.run_id);
        if let Some(RunSlot::Running(task)) = slot {
            task.abort();
        }
        self.executor
            .discard(handle.run_id, &handle.transformation)
            .await;
    }
}
