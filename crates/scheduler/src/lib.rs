//! View materialization scheduler.
//!
//! Walks a [`ViewGraph`], decides which views are eligible, skips the ones
//! whose version digest matches the last successful run, and dispatches the
//! rest to the [`Driver`](vista_driver::Driver) registered for their
//! transformation kind, within per-driver concurrency budgets.
//!
//! See [`runner::Scheduler`] for the coordinator loop.

pub mod definition;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod view;

pub use definition::ViewDefinitions;
pub use error::{DefinitionError, GraphError, SchedulerError, StoreError};
pub use graph::ViewGraph;
pub use metrics::SchedulerMetrics;
pub use runner::{CancelHandle, Scheduler};
pub use snapshot::ViewStatus;
pub use store::{FileStateStore, InMemoryStateStore, PersistedView, StateStore};
pub use types::{CycleOptions, CycleReport, SchedulerConfig, TransitionRecord, ViewOutcome};
pub use view::View;
