use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vista_core::{TransitionReason, ViewState};
use vista_driver::error::render_chain;
use vista_driver::{Driver, DriverError, DriverRunHandle, DriverRunState, Transformation};

use crate::error::SchedulerError;
use crate::store::PersistedView;
use crate::types::{CycleOptions, CycleReport, ViewOutcome};

use super::scheduling::{Cycle, Event, EventSender};
use super::Scheduler;

enum Wake {
    Event(Option<Event>),
    Cancel,
    Timer,
}

impl Scheduler {
    /// Run one full scheduling cycle.
    ///
    /// Returns once every view that became eligible has settled in
    /// `Materialized` or `Failed`; views with unfinished dependencies are
    /// reported as `Waiting`. A state store failure aborts the cycle after
    /// killing every in-flight run.
    pub async fn run_cycle(&mut self, options: CycleOptions) -> Result<CycleReport, SchedulerError> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            cycle = %cycle_id,
            views = self.graph.len(),
            force = options.force,
            forced_views = options.force_views.len(),
            "cycle started"
        );

        let stale = self.cancel.take_subtrees();
        if !stale.is_empty() {
            debug!(requests = stale.len(), "discarding subtree cancellations from a previous cycle");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cycle = Cycle::new(self.graph.len(), options);

        self.prepare_views()?;
        let result = match self.evaluate_all(&mut cycle, &tx) {
            Ok(()) => self.drive(&mut cycle, &tx, &mut rx).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(cycle = %cycle_id, error = %e, in_flight = cycle.running, "cycle aborted");
            self.abort(&mut cycle, &mut rx).await;
            return Err(e);
        }

        let duration = clock.elapsed();
        self.with_metrics(|m| m.record_cycle(duration));

        let outcomes = self
            .graph
            .views()
            .iter()
            .zip(&cycle.runtime)
            .map(|(view, rt)| ViewOutcome {
                view: view.id.clone(),
                state: view.state(),
                dispatches: rt.dispatches,
                retries: rt.retries,
                cache_hit: rt.cache_hit,
                digest: rt
                    .digest
                    .clone()
                    .or_else(|| view.last_digest().map(str::to_string)),
                failure: if view.state() == ViewState::Failed {
                    rt.failure.clone()
                } else {
                    None
                },
            })
            .collect();

        Ok(CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            dispatches: cycle.dispatches,
            cache_hits: cycle.cache_hits,
            cancelled: cycle.cancel_requested,
            transitions: cycle.transitions,
        })
    }

    /// Run cycles back to back, `interval` apart, until `cancel_all`.
    pub async fn run(&mut self, interval: Duration) -> Result<(), SchedulerError> {
        self.run_with(interval, |_| Ok(())).await
    }

    /// Like [`run`](Self::run), calling `before_cycle` ahead of every
    /// cycle. An error from the hook stops the loop.
    pub async fn run_with<F>(&mut self, interval: Duration, mut before_cycle: F) -> Result<(), SchedulerError>
    where
        F: FnMut(&mut Scheduler) -> Result<(), SchedulerError>,
    {
        info!(interval_secs = interval.as_secs(), views = self.graph.len(), "scheduler loop started");
        let cancel = self.cancel.clone();

        while !cancel.is_cancelled() {
            before_cycle(self)?;
            if cancel.is_cancelled() {
                break;
            }
            let report = self.run_cycle(CycleOptions::default()).await?;
            report.log_summary();

            let deadline = Instant::now() + interval;
            while !cancel.is_cancelled() {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = cancel.notified() => {}
                }
            }
        }

        info!("scheduler loop stopped");
        Ok(())
    }

    /// Coordinator loop: apply cancellation, dispatch, then wait for the
    /// next event, cancellation request, or retry deadline.
    async fn drive(
        &mut self,
        cycle: &mut Cycle,
        tx: &EventSender,
        rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(), SchedulerError> {
        let cancel = self.cancel.clone();
        loop {
            self.apply_cancellation(cycle)?;
            self.promote_due_retries(cycle, tx)?;
            self.dispatch_ready(cycle, tx)?;

            if self.is_settled(cycle) {
                return Ok(());
            }

            let next_retry = cycle.next_retry_at(Instant::now());
            let wake = tokio::select! {
                event = rx.recv() => Wake::Event(event),
                _ = cancel.notified() => Wake::Cancel,
                _ = sleep_until(next_retry) => Wake::Timer,
            };
            self.with_metrics(|m| m.coordinator_wakeups += 1);

            match wake {
                Wake::Event(Some(Event::Digest { view, result })) => {
                    self.on_digest(cycle, view, result, tx)?;
                }
                Wake::Event(Some(Event::Finished {
                    view,
                    driver,
                    result,
                    elapsed,
                })) => {
                    self.on_finished(cycle, view, &driver, result, elapsed, tx)?;
                }
                Wake::Event(None) => return Err(SchedulerError::ChannelClosed),
                Wake::Cancel | Wake::Timer => {}
            }
        }
    }

    fn dispatch_ready(&mut self, cycle: &mut Cycle, tx: &EventSender) -> Result<(), SchedulerError> {
        for i in self.select_ready(cycle) {
            let view = self.graph.view(i);
            let Some(transformation) = view.transformation().cloned() else {
                continue;
            };
            let driver = match self.drivers.driver_for(&transformation) {
                Some(driver) => Arc::clone(driver),
                None => {
                    return Err(SchedulerError::UnknownDriverKind {
                        view: view.id.clone(),
                        kind: transformation.kind().to_string(),
                    })
                }
            };

            let name = driver.name().to_string();
            let limit = self.config.concurrency_for(&name);
            let in_flight = cycle.in_flight.get(&name).copied().unwrap_or(0);
            if in_flight >= limit {
                continue;
            }

            let reason = if view.state() == ViewState::Retrying {
                TransitionReason::RetryDue
            } else {
                TransitionReason::Dispatched
            };
            self.transition(cycle, i, ViewState::Transforming, reason)?;

            let (stop_tx, stop_rx) = watch::channel(false);
            let rt = &mut cycle.runtime[i];
            rt.dispatches += 1;
            rt.retry_at = None;
            rt.stop = Some(stop_tx);
            *cycle.in_flight.entry(name.clone()).or_default() += 1;
            cycle.running += 1;
            cycle.dispatches += 1;

            info!(
                view = %self.graph.view(i).id,
                driver = %name,
                attempt = cycle.runtime[i].retries + 1,
                digest = cycle.runtime[i].digest.as_deref().unwrap_or(""),
                "dispatched"
            );

            let monitor = RunMonitor {
                view: i,
                driver,
                transformation,
                poll_interval: self.config.poll_interval(),
                stop: stop_rx,
                events: tx.clone(),
            };
            tokio::spawn(monitor.watch());
        }
        Ok(())
    }

    fn on_finished(
        &mut self,
        cycle: &mut Cycle,
        i: usize,
        driver: &str,
        result: Result<DriverRunState, DriverError>,
        elapsed: Duration,
        tx: &EventSender,
    ) -> Result<(), SchedulerError> {
        cycle.running -= 1;
        if let Some(n) = cycle.in_flight.get_mut(driver) {
            *n = n.saturating_sub(1);
        }
        cycle.runtime[i].stop = None;
        self.with_metrics(|m| m.record_dispatch(driver, elapsed));

        let view = self.graph.view(i);
        if let (Ok(state), Some(t)) = (&result, view.transformation()) {
            t.notify_completion(state);
        }
        if view.state() != ViewState::Transforming {
            debug!(view = %view.id, "discarding result of a cancelled run");
            return Ok(());
        }

        match result {
            Ok(state) if state.is_success() => {
                self.transition(cycle, i, ViewState::Materialized, TransitionReason::Succeeded)?;
                let rt = &mut cycle.runtime[i];
                rt.rematerialized = true;
                rt.failure = None;
                let persisted = PersistedView {
                    state: ViewState::Materialized,
                    digest: rt.digest.clone(),
                    inputs_changed: false,
                    updated_at: Utc::now(),
                };
                info!(
                    view = %self.graph.view(i).id,
                    driver,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "materialized"
                );
                self.invalidate_dependents(i)?;
                self.persist(i, persisted)?;
                self.with_metrics(|m| m.materializations += 1);
                self.on_materialized(cycle, i, tx)
            }
            Ok(state) => {
                let message = state
                    .failure_message()
                    .unwrap_or_else(|| "run ended without success".to_string());
                self.fail(cycle, i, TransitionReason::DriverFailed, message)
            }
            Err(e) if e.is_retryable() => {
                self.schedule_retry(cycle, i, TransitionReason::RetryScheduled, render_chain(&e))
            }
            Err(e) => self.fail(cycle, i, TransitionReason::DriverFailed, render_chain(&e)),
        }
    }

    /// Stop every in-flight run and wait for its monitor to finish.
    async fn abort(&mut self, cycle: &mut Cycle, rx: &mut mpsc::UnboundedReceiver<Event>) {
        for rt in &mut cycle.runtime {
            if let Some(stop) = rt.stop.take() {
                let _ = stop.send(true);
            }
        }
        while cycle.running > 0 {
            match rx.recv().await {
                Some(Event::Finished { view, driver, .. }) => {
                    cycle.running -= 1;
                    warn!(view = %self.graph.view(view).id, driver = %driver, "run stopped by abort");
                }
                Some(Event::Digest { .. }) => {}
                None => break,
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns one dispatched run: starts it, polls it to a terminal state,
/// finalizes it, and reports back. A stop request kills the run instead.
struct RunMonitor {
    view: usize,
    driver: Arc<dyn Driver>,
    transformation: Arc<Transformation>,
    poll_interval: Duration,
    stop: watch::Receiver<bool>,
    events: EventSender,
}

impl RunMonitor {
    async fn watch(mut self) {
        let started = Instant::now();
        let result = self.drive().await;
        let _ = self.events.send(Event::Finished {
            view: self.view,
            driver: self.driver.name().to_string(),
            result,
            elapsed: started.elapsed(),
        });
    }

    async fn drive(&mut self) -> Result<DriverRunState, DriverError> {
        let handle = self.driver.run(Arc::clone(&self.transformation)).await?;
        debug!(run_id = %handle.run_id, driver = %handle.driver, "run started");
        let result = self.poll(&handle).await;
        self.driver.release(&handle).await;
        result
    }

    async fn poll(&mut self, handle: &DriverRunHandle) -> Result<DriverRunState, DriverError> {
        loop {
            if self.stopped() {
                return Ok(self.kill(handle).await);
            }
            let state = self.driver.get_driver_run_state(handle).await?;
            if state.is_terminal() {
                if self.stopped() {
                    return Ok(self.kill(handle).await);
                }
                return self.driver.post_commit(handle, state).await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                Ok(()) = self.stop.changed() => {}
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    async fn kill(&self, handle: &DriverRunHandle) -> DriverRunState {
        if let Err(e) = self.driver.kill_run(handle).await {
            warn!(run_id = %handle.run_id, error = %e, "kill_run failed");
        }
        DriverRunState::cancelled(self.driver.name())
    }
}
