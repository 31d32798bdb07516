//! Transformation / Driver execution contract.
//!
//! A [`Transformation`] describes one unit of recomputation logic and is
//! versioned by a digest over its declared [`Resource`]s. A [`Driver`]
//! executes transformations of the kinds it supports and reports progress
//! through the shared [`DriverRunState`] vocabulary. Backend faults are
//! classified at the driver boundary into retryable and unrecoverable
//! outcomes (see [`classify`]).

pub mod classify;
pub mod digest;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod registry;
pub mod resource;
pub mod run;
pub mod transformation;

pub use classify::{DefaultClassifier, FailureClass, FailureClassifier};
pub use digest::{DigestRegistry, InlineHasher, LocalFileHasher, MountedPathHasher, ResourceHasher};
pub use driver::Driver;
pub use drivers::{
    Executor, FilesystemDriver, FilesystemExecutor, NoOpDriver, NoOpExecutor, RunMetadata,
    ShellDriver, ShellExecutor, TaskDriver,
};
pub use error::{BoxError, DriverError};
pub use registry::DriverRegistry;
pub use resource::Resource;
pub use run::{DriverRunHandle, DriverRunState};
pub use transformation::{CompletionCallback, Transformation};
