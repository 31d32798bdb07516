use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::task_driver::{Executor, RunMetadata, TaskDriver};
use crate::error::BoxError;
use crate::transformation::Transformation;

/// Succeeds immediately without doing anything. Used for views whose data is
/// produced elsewhere and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpExecutor;

#[async_trait]
impl Executor for NoOpExecutor {
    fn name(&self) -> &str {
        "noop"
    }

    fn kinds(&self) -> Vec<String> {
        vec!["noop".into()]
    }

    async fn execute(&self, _run_id: Uuid, _: Arc<Transformation>) -> Result<RunMetadata, BoxError> {
        Ok(RunMetadata::new())
    }
}

pub type NoOpDriver = TaskDriver<NoOpExecutor>;

impl TaskDriver<NoOpExecutor> {
    pub fn new() -> Self {
        Self::with_executor(NoOpExecutor)
    }
}

impl Default for TaskDriver<NoOpExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;

    #[tokio::test]
    async fn noop_succeeds() {
        let driver = NoOpDriver::new();
        assert_eq!(driver.name(), "noop");
        let state = driver
            .run_and_wait(Arc::new(Transformation::new("noop")))
            .await
            .unwrap();
        assert!(state.is_success());
    }
}
