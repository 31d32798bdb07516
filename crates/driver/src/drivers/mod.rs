//! Built-in drivers.
//!
//! Each one is a [`TaskDriver`] around an [`Executor`]: the executor knows how
//! to perform (and commit) one unit of work, the task driver owns run slots,
//! polling, cancellation and failure classification.

mod filesystem;
mod noop;
mod shell;
mod task_driver;

pub use filesystem::{FilesystemDriver, FilesystemExecutor};
pub use noop::{NoOpDriver, NoOpExecutor};
pub use shell::{ShellDriver, ShellExecutor};
pub use task_driver::{Executor, RunMetadata, TaskDriver};
