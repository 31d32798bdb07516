use std::sync::{Arc, RwLock};

use tracing::info;
use vista_core::{ConfigValue, ViewId};
use vista_driver::{DigestRegistry, DriverRegistry};

use crate::error::SchedulerError;
use crate::graph::ViewGraph;
use crate::metrics::SchedulerMetrics;
use crate::snapshot::ViewStatus;
use crate::store::StateStore;
use crate::types::SchedulerConfig;

use super::CancelHandle;

/// The view scheduler. Owns the view graph and drives it to
/// materialization through the registered drivers.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) graph: ViewGraph,
    pub(super) drivers: DriverRegistry,
    /// Resource hashing strategies used for version digests.
    pub(super) digests: Arc<DigestRegistry>,
    /// Persisted per-view state and last successful digest.
    pub(super) store: Arc<dyn StateStore>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) cancel: CancelHandle,
}

impl Scheduler {
    /// Create a scheduler over a validated graph.
    ///
    /// Fails if the configuration is invalid or any view's transformation
    /// kind has no registered driver, so nothing is dispatched for a graph
    /// that cannot be completed.
    pub fn new(
        config: SchedulerConfig,
        graph: ViewGraph,
        drivers: DriverRegistry,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        check_driver_kinds(&graph, &drivers)?;

        info!(
            views = graph.len(),
            kinds = ?drivers.kinds(),
            max_retries = config.max_retries,
            "scheduler ready"
        );

        Ok(Self {
            config,
            graph,
            drivers,
            digests: Arc::new(DigestRegistry::default()),
            store,
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            cancel: CancelHandle::new(),
        })
    }

    /// Replace the default resource hashing strategies.
    pub fn with_digest_registry(mut self, registry: DigestRegistry) -> Self {
        self.digests = Arc::new(registry);
        self
    }

    /// Handle for cancelling views from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn graph(&self) -> &ViewGraph {
        &self.graph
    }

    /// Swap in a new view graph between cycles, such as the definitions
    /// rebound for a new run date. Configuration merged through
    /// [`configure_view`](Self::configure_view) is not carried over.
    pub fn replace_graph(&mut self, graph: ViewGraph) -> Result<(), SchedulerError> {
        check_driver_kinds(&graph, &self.drivers)?;
        info!(previous = self.graph.len(), views = graph.len(), "view graph replaced");
        self.graph = graph;
        Ok(())
    }

    /// Merge configuration into a view's transformation between cycles.
    ///
    /// Returns `false` for unknown views. Runs already dispatched keep the
    /// configuration they were started with.
    pub fn configure_view<I, K, V>(&mut self, id: &ViewId, options: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        match self.graph.index_of(id) {
            Some(i) => {
                self.graph.view_mut(i).configure_with(options);
                true
            }
            None => false,
        }
    }

    /// Read-only status of every view, in declaration order.
    pub fn snapshot(&self) -> Vec<ViewStatus> {
        self.graph.views().iter().map(ViewStatus::from).collect()
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }
}

fn check_driver_kinds(graph: &ViewGraph, drivers: &DriverRegistry) -> Result<(), SchedulerError> {
    for view in graph.views() {
        if let Some(t) = view.transformation() {
            if drivers.driver_for(t).is_none() {
                return Err(SchedulerError::UnknownDriverKind {
                    view: view.id.clone(),
                    kind: t.kind().to_string(),
                });
            }
        }
    }
    Ok(())
}
