use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vista_core::{TransitionReason, ViewState};
use vista_driver::{DriverError, DriverRunState};

use crate::error::SchedulerError;
use crate::store::PersistedView;
use crate::types::{CycleOptions, TransitionRecord};

use super::Scheduler;

/// Messages from digest and dispatch tasks back to the coordinator.
pub(super) enum Event {
    Digest {
        view: usize,
        result: Result<String, DriverError>,
    },
    Finished {
        view: usize,
        driver: String,
        result: Result<DriverRunState, DriverError>,
        elapsed: Duration,
    },
}

pub(super) type EventSender = mpsc::UnboundedSender<Event>;

/// Per-view bookkeeping for one cycle.
#[derive(Debug, Default)]
pub(super) struct ViewRuntime {
    /// Digest computed this cycle; `Some` means ready for dispatch.
    pub digest: Option<String>,
    pub digest_pending: bool,
    pub retries: u32,
    pub dispatches: u32,
    pub retry_at: Option<Instant>,
    pub cache_hit: bool,
    /// Materialized by a dispatch in this cycle.
    pub rematerialized: bool,
    pub failure: Option<String>,
    pub cancelled: bool,
    /// Stop signal of the in-flight run, if any.
    pub stop: Option<watch::Sender<bool>>,
}

/// Coordinator-owned state of one scheduling cycle.
#[derive(Debug)]
pub(super) struct Cycle {
    pub options: CycleOptions,
    pub runtime: Vec<ViewRuntime>,
    /// In-flight runs by driver name.
    pub in_flight: HashMap<String, usize>,
    pub running: usize,
    pub pending_digests: usize,
    pub transitions: Vec<TransitionRecord>,
    pub dispatches: usize,
    pub cache_hits: usize,
    pub cancel_all: bool,
    pub cancel_requested: bool,
}

impl Cycle {
    pub fn new(views: usize, options: CycleOptions) -> Self {
        Self {
            options,
            runtime: (0..views).map(|_| ViewRuntime::default()).collect(),
            in_flight: HashMap::new(),
            running: 0,
            pending_digests: 0,
            transitions: Vec::new(),
            dispatches: 0,
            cache_hits: 0,
            cancel_all: false,
            cancel_requested: false,
        }
    }

    /// Earliest retry deadline still ahead of `now`. Retries already due
    /// wait for a free driver slot, which a `Finished` event signals.
    pub fn next_retry_at(&self, now: Instant) -> Option<Instant> {
        self.runtime
            .iter()
            .filter_map(|rt| rt.retry_at)
            .filter(|&at| at > now)
            .min()
    }
}

impl Scheduler {
    /// Reset every view for a new cycle and reload its persisted state.
    pub(super) fn prepare_views(&mut self) -> Result<(), SchedulerError> {
        for view in self.graph.views_mut() {
            view.state = ViewState::Absent;
            view.persisted = if view.external {
                None
            } else {
                self.store.load(&view.id).map_err(|e| {
                    error!(view = %view.id, error = %e, "state store read failed");
                    e
                })?
            };
            view.invalidate_digest();
        }
        Ok(())
    }

    /// Evaluate every view once, dependencies first.
    pub(super) fn evaluate_all(&mut self, cycle: &mut Cycle, tx: &EventSender) -> Result<(), SchedulerError> {
        let order = self.graph.topological_order().to_vec();
        for i in order {
            self.evaluate(cycle, i, tx)?;
        }
        Ok(())
    }

    /// Move an unevaluated or waiting view forward as far as its
    /// dependencies allow.
    fn evaluate(&mut self, cycle: &mut Cycle, i: usize, tx: &EventSender) -> Result<(), SchedulerError> {
        let view = self.graph.view(i);
        let state = view.state;
        if !matches!(state, ViewState::Absent | ViewState::Waiting) {
            return Ok(());
        }

        if view.external {
            self.transition(cycle, i, ViewState::Materialized, TransitionReason::ExemptFromMaterialization)?;
            return self.on_materialized(cycle, i, tx);
        }

        let ready = self
            .graph
            .dependencies(i)
            .iter()
            .all(|&d| self.graph.view(d).state == ViewState::Materialized);
        if !ready {
            if state == ViewState::Absent {
                self.transition(cycle, i, ViewState::Waiting, TransitionReason::DependenciesPending)?;
            }
            return Ok(());
        }

        self.transition(cycle, i, ViewState::Eligible, TransitionReason::DependenciesSatisfied)?;

        // materialize_once views only yield to an explicit per-view force
        let view = self.graph.view(i);
        let prior = view
            .persisted()
            .filter(|p| p.state == ViewState::Materialized)
            .filter(|_| view.materialize_once && !cycle.options.force_views.contains(&view.id))
            .cloned();
        if let Some(prior) = prior {
            debug!(view = %view.id, "materialized once, skipping");
            let persisted = PersistedView {
                updated_at: Utc::now(),
                ..prior
            };
            return self.cache_hit(cycle, i, persisted, tx);
        }

        self.start_digest(cycle, i, tx);
        Ok(())
    }

    /// Re-evaluate the direct dependents of a view that just materialized.
    pub(super) fn on_materialized(&mut self, cycle: &mut Cycle, i: usize, tx: &EventSender) -> Result<(), SchedulerError> {
        for d in self.graph.dependents(i) {
            self.evaluate(cycle, d, tx)?;
        }
        Ok(())
    }

    /// Compute the version digest off the coordinator.
    pub(super) fn start_digest(&mut self, cycle: &mut Cycle, i: usize, tx: &EventSender) {
        let Some(transformation) = self.graph.view(i).transformation().cloned() else {
            return;
        };
        let registry = Arc::clone(&self.digests);
        let tx = tx.clone();

        cycle.pending_digests += 1;
        cycle.runtime[i].digest_pending = true;

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || transformation.version_digest(&registry))
                .await
                .unwrap_or_else(|e| Err(DriverError::unrecoverable(format!("digest task failed: {e}"))));
            let _ = tx.send(Event::Digest { view: i, result });
        });
    }

    pub(super) fn on_digest(
        &mut self,
        cycle: &mut Cycle,
        i: usize,
        result: Result<String, DriverError>,
        tx: &EventSender,
    ) -> Result<(), SchedulerError> {
        cycle.pending_digests -= 1;
        cycle.runtime[i].digest_pending = false;

        let view = self.graph.view(i);
        if view.state != ViewState::Eligible {
            return Ok(());
        }

        let digest = match result {
            Ok(digest) => digest,
            Err(e) if e.is_retryable() => {
                return self.schedule_retry(cycle, i, TransitionReason::DigestUnavailable, e.to_string());
            }
            Err(e) => return self.fail(cycle, i, TransitionReason::DigestUnavailable, e.to_string()),
        };

        let forced = cycle.options.is_forced(&view.id);
        let upstream_changed = self
            .graph
            .dependencies(i)
            .iter()
            .any(|&d| cycle.runtime[d].rematerialized);
        let up_to_date = view.persisted().is_some_and(|p| p.is_valid_for(&digest));

        if up_to_date && !forced && !upstream_changed {
            debug!(view = %view.id, digest = %digest, "digest unchanged");
            cycle.runtime[i].digest = Some(digest.clone());
            return self.cache_hit(cycle, i, PersistedView::materialized(digest), tx);
        }

        debug!(
            view = %view.id,
            digest = %digest,
            previous = view.last_digest().unwrap_or("none"),
            forced,
            upstream_changed,
            "eligible for dispatch"
        );
        cycle.runtime[i].digest = Some(digest);
        Ok(())
    }

    fn cache_hit(
        &mut self,
        cycle: &mut Cycle,
        i: usize,
        persisted: PersistedView,
        tx: &EventSender,
    ) -> Result<(), SchedulerError> {
        self.transition(cycle, i, ViewState::Materialized, TransitionReason::UpToDate)?;
        self.persist(i, persisted)?;
        cycle.runtime[i].cache_hit = true;
        cycle.cache_hits += 1;
        self.with_metrics(|m| m.cache_hits += 1);
        self.on_materialized(cycle, i, tx)
    }

    /// Schedule another attempt, or fail once the retry budget is spent.
    pub(super) fn schedule_retry(
        &mut self,
        cycle: &mut Cycle,
        i: usize,
        reason: TransitionReason,
        message: String,
    ) -> Result<(), SchedulerError> {
        let retries = cycle.runtime[i].retries;
        if retries >= self.config.max_retries {
            return self.fail(
                cycle,
                i,
                TransitionReason::RetryBudgetExhausted,
                format!("retry budget exhausted after {retries} retries: {message}"),
            );
        }

        let attempt = retries + 1;
        let delay = self.config.backoff_for(attempt);
        let rt = &mut cycle.runtime[i];
        rt.retries = attempt;
        rt.retry_at = Some(Instant::now() + delay);
        rt.failure = Some(message.clone());

        warn!(
            view = %self.graph.view(i).id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retry scheduled"
        );
        self.with_metrics(|m| m.retries += 1);
        self.transition(cycle, i, ViewState::Retrying, reason)
    }

    /// Mark the persisted results of `i`'s direct dependents as built from
    /// stale input. Runs before `i`'s own result is saved, so a cycle that
    /// stops in between still leaves the dependents due for rematerialization.
    pub(super) fn invalidate_dependents(&mut self, i: usize) -> Result<(), SchedulerError> {
        for d in self.graph.dependents(i) {
            let view = self.graph.view(d);
            if view.external || view.materialize_once {
                continue;
            }
            let Some(stale) = view
                .persisted()
                .filter(|p| p.state == ViewState::Materialized && !p.inputs_changed)
                .map(PersistedView::with_inputs_changed)
            else {
                continue;
            };
            debug!(view = %view.id, upstream = %self.graph.view(i).id, "invalidating persisted result");
            self.persist(d, stale)?;
        }
        Ok(())
    }

    /// Fail a view for this cycle and persist the failure.
    pub(super) fn fail(
        &mut self,
        cycle: &mut Cycle,
        i: usize,
        reason: TransitionReason,
        message: String,
    ) -> Result<(), SchedulerError> {
        self.transition(cycle, i, ViewState::Failed, reason)?;
        let rt = &mut cycle.runtime[i];
        rt.retry_at = None;
        rt.failure = Some(message.clone());

        let view = self.graph.view(i);
        if reason == TransitionReason::Cancelled {
            warn!(view = %view.id, "view cancelled");
        } else {
            info!(view = %view.id, %reason, error = %message, "view failed");
        }
        let previous = view.last_digest().map(str::to_string);
        self.with_metrics(|m| m.failures += 1);
        self.persist(i, PersistedView::failed(previous))
    }

    /// Fold pending cancellation requests into the cycle and fail every
    /// affected view that has not settled yet.
    pub(super) fn apply_cancellation(&mut self, cycle: &mut Cycle) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() && !cycle.cancel_all {
            cycle.cancel_all = true;
            cycle.cancel_requested = true;
            for rt in &mut cycle.runtime {
                rt.cancelled = true;
            }
        }
        for id in self.cancel.take_subtrees() {
            cycle.cancel_requested = true;
            match self.graph.index_of(&id) {
                Some(root) => {
                    for j in self.graph.subtree(root) {
                        cycle.runtime[j].cancelled = true;
                    }
                }
                None => warn!(view = %id, "cancellation requested for unknown view"),
            }
        }

        for i in 0..cycle.runtime.len() {
            let state = self.graph.view(i).state;
            if !cycle.runtime[i].cancelled
                || !matches!(state, ViewState::Eligible | ViewState::Retrying | ViewState::Transforming)
            {
                continue;
            }
            if let Some(stop) = cycle.runtime[i].stop.take() {
                let _ = stop.send(true);
            }
            self.fail(cycle, i, TransitionReason::Cancelled, DriverRunState::CANCELLED.to_string())?;
        }
        Ok(())
    }

    /// Retrying views without a digest re-enter eligibility once due.
    pub(super) fn promote_due_retries(&mut self, cycle: &mut Cycle, tx: &EventSender) -> Result<(), SchedulerError> {
        let now = Instant::now();
        for i in 0..cycle.runtime.len() {
            let rt = &cycle.runtime[i];
            let due = rt.retry_at.is_some_and(|at| at <= now);
            if !due || rt.digest.is_some() || self.graph.view(i).state != ViewState::Retrying {
                continue;
            }
            cycle.runtime[i].retry_at = None;
            self.transition(cycle, i, ViewState::Eligible, TransitionReason::RetryDue)?;
            self.start_digest(cycle, i, tx);
        }
        Ok(())
    }

    /// Views ready to hand to a driver, highest fan-out first.
    pub(super) fn select_ready(&self, cycle: &Cycle) -> Vec<usize> {
        let now = Instant::now();
        let mut ready: Vec<usize> = (0..cycle.runtime.len())
            .filter(|&i| {
                let rt = &cycle.runtime[i];
                if rt.digest.is_none() || rt.stop.is_some() {
                    return false;
                }
                match self.graph.view(i).state {
                    ViewState::Eligible => true,
                    ViewState::Retrying => rt.retry_at.is_some_and(|at| at <= now),
                    _ => false,
                }
            })
            .collect();
        ready.sort_by_key(|&i| (Reverse(self.graph.fan_out(i)), i));
        ready
    }

    /// No work left: nothing pending, nothing in flight, every view that
    /// became eligible has settled.
    pub(super) fn is_settled(&self, cycle: &Cycle) -> bool {
        cycle.pending_digests == 0
            && cycle.running == 0
            && self.graph.views().iter().all(|v| {
                !matches!(
                    v.state,
                    ViewState::Eligible | ViewState::Retrying | ViewState::Transforming
                )
            })
    }

    pub(super) fn transition(
        &mut self,
        cycle: &mut Cycle,
        i: usize,
        to: ViewState,
        reason: TransitionReason,
    ) -> Result<(), SchedulerError> {
        let view = self.graph.view_mut(i);
        let from = view.state;
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                view: view.id.clone(),
                from,
                to,
            });
        }
        view.state = to;
        debug!(view = %view.id, %from, %to, %reason, "transition");
        cycle.transitions.push(TransitionRecord {
            view: view.id.clone(),
            from,
            to,
            reason,
            at: Utc::now(),
        });
        Ok(())
    }

    pub(super) fn persist(&mut self, i: usize, persisted: PersistedView) -> Result<(), SchedulerError> {
        let view = self.graph.view_mut(i);
        if let Err(e) = self.store.save(&view.id, &persisted) {
            error!(view = %view.id, error = %e, "state store write failed");
            return Err(e.into());
        }
        view.persisted = Some(persisted);
        Ok(())
    }
}
