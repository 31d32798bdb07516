use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;
use vista_core::{TransitionReason, ViewId, ViewState};
use vista_driver::{
    Driver, DriverError, DriverRegistry, DriverRunHandle, DriverRunState, Resource, Transformation,
};

use crate::error::SchedulerError;
use crate::graph::ViewGraph;
use crate::runner::scheduling::Cycle;
use crate::runner::Scheduler;
use crate::store::{InMemoryStateStore, StateStore};
use crate::types::{CycleOptions, CycleReport, SchedulerConfig};
use crate::view::View;

// ── Scripted driver ─────────────────────────────────────────────────

/// Behaviour is read from the transformation configuration:
/// - `view`: name used for bookkeeping
/// - `duration_ms`: time until the run is terminal (default 5)
/// - `fail`: end `Failed`
/// - `reject`: refuse the run at hand-off
/// - `commit_faults`: number of leading attempts whose commit is retryable
struct Run {
    view: String,
    started: Instant,
    duration: Duration,
    fail: bool,
    commit_fault: bool,
    killed: bool,
}

#[derive(Default)]
struct Ledger {
    attempts: HashMap<String, u32>,
    started: Vec<String>,
    running: usize,
    max_running: usize,
    kills: HashMap<Uuid, u32>,
}

struct ScriptedDriver {
    runs: Mutex<HashMap<Uuid, Run>>,
    ledger: Mutex<Ledger>,
}

impl ScriptedDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(HashMap::new()),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    fn attempts(&self, view: &str) -> u32 {
        self.ledger.lock().unwrap().attempts.get(view).copied().unwrap_or(0)
    }

    fn started(&self) -> Vec<String> {
        self.ledger.lock().unwrap().started.clone()
    }

    fn running(&self) -> usize {
        self.ledger.lock().unwrap().running
    }

    fn max_running(&self) -> usize {
        self.ledger.lock().unwrap().max_running
    }

    fn kills(&self) -> HashMap<Uuid, u32> {
        self.ledger.lock().unwrap().kills.clone()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn transformation_kinds(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }

    async fn run(&self, transformation: Arc<Transformation>) -> Result<DriverRunHandle, DriverError> {
        if transformation.config_value("reject").is_some() {
            return Err(DriverError::InvalidConfiguration("rejected by script".into()));
        }
        let view = transformation.config_str("view").unwrap_or_default().to_string();
        let config_int = |key: &str| {
            transformation
                .config_value(key)
                .and_then(|v| v.as_i64())
        };

        let attempt = {
            let mut ledger = self.ledger.lock().unwrap();
            let attempt = ledger.attempts.entry(view.clone()).or_default();
            *attempt += 1;
            let attempt = *attempt;
            ledger.started.push(view.clone());
            ledger.running += 1;
            ledger.max_running = ledger.max_running.max(ledger.running);
            attempt
        };

        let handle = DriverRunHandle::new(self.name(), Arc::clone(&transformation));
        let run = Run {
            view,
            started: Instant::now(),
            duration: Duration::from_millis(config_int("duration_ms").unwrap_or(5) as u64),
            fail: transformation.config_value("fail").is_some(),
            commit_fault: i64::from(attempt) <= config_int("commit_faults").unwrap_or(0),
            killed: false,
        };
        self.runs.lock().unwrap().insert(handle.run_id, run);
        Ok(handle)
    }

    async fn get_driver_run_state(&self, handle: &DriverRunHandle) -> Result<DriverRunState, DriverError> {
        let runs = self.runs.lock().unwrap();
        let run = runs.get(&handle.run_id).ok_or(DriverError::UnknownRun(handle.run_id))?;
        Ok(if run.killed {
            DriverRunState::cancelled(self.name())
        } else if run.started.elapsed() < run.duration {
            DriverRunState::ongoing(self.name(), run.started.elapsed())
        } else if run.fail {
            DriverRunState::failed(self.name(), format!("{} broke", run.view), None)
        } else {
            DriverRunState::succeeded(self.name())
        })
    }

    async fn kill_run(&self, handle: &DriverRunHandle) -> Result<(), DriverError> {
        *self
            .ledger
            .lock()
            .unwrap()
            .kills
            .entry(handle.run_id)
            .or_default() += 1;
        if let Some(run) = self.runs.lock().unwrap().get_mut(&handle.run_id) {
            run.killed = true;
        }
        Ok(())
    }

    async fn post_commit(
        &self,
        handle: &DriverRunHandle,
        state: DriverRunState,
    ) -> Result<DriverRunState, DriverError> {
        let fault = self
            .runs
            .lock()
            .unwrap()
            .get(&handle.run_id)
            .is_some_and(|r| r.commit_fault);
        if fault && state.is_success() {
            return Err(DriverError::retryable(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "metastore connection reset",
            )));
        }
        Ok(state)
    }

    async fn release(&self, handle: &DriverRunHandle) {
        if self.runs.lock().unwrap().remove(&handle.run_id).is_some() {
            self.ledger.lock().unwrap().running -= 1;
        }
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn id(name: &str) -> ViewId {
    ViewId::new("test", name)
}

fn mock(name: &str) -> Transformation {
    let mut t = Transformation::new("mock").with_resource(Resource::inline(format!("select * from {name}")));
    t.configure_with([("view", name)]);
    t
}

fn view(name: &str, deps: &[&str]) -> View {
    view_with(name, deps, mock(name))
}

fn view_with(name: &str, deps: &[&str], transformation: Transformation) -> View {
    deps.iter().fold(
        View::new(id(name)).with_transformation(transformation),
        |v, d| v.depends_on(id(d)),
    )
}

fn configured(name: &str, key: &str, value: i64) -> Transformation {
    let mut t = mock(name);
    t.configure_with([(key, value)]);
    t
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 2,
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        ..SchedulerConfig::default()
    }
}

fn scheduler_with(
    views: Vec<View>,
    config: SchedulerConfig,
) -> (Scheduler, Arc<ScriptedDriver>, Arc<InMemoryStateStore>) {
    let driver = ScriptedDriver::new();
    let store = Arc::new(InMemoryStateStore::new());
    let mut drivers = DriverRegistry::new();
    drivers.register(driver.clone()).unwrap();
    let scheduler = Scheduler::new(
        config,
        ViewGraph::build(views).unwrap(),
        drivers,
        store.clone(),
    )
    .unwrap();
    (scheduler, driver, store)
}

fn scheduler(views: Vec<View>) -> (Scheduler, Arc<ScriptedDriver>, Arc<InMemoryStateStore>) {
    scheduler_with(views, fast_config())
}

async fn cycle(scheduler: &mut Scheduler, options: CycleOptions) -> CycleReport {
    tokio::time::timeout(Duration::from_secs(10), scheduler.run_cycle(options))
        .await
        .expect("cycle timed out")
        .expect("cycle failed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn reasons(report: &CycleReport, name: &str) -> Vec<TransitionReason> {
    report.transitions_for(&id(name)).map(|t| t.reason).collect()
}

// ── Construction ────────────────────────────────────────────────────

#[test]
fn unknown_driver_kind_rejected_before_dispatch() {
    let graph = ViewGraph::build(vec![
        view("a", &[]),
        view_with("b", &[], Transformation::new("spark")),
    ])
    .unwrap();
    let mut drivers = DriverRegistry::new();
    drivers.register(ScriptedDriver::new()).unwrap();

    let err = Scheduler::new(
        SchedulerConfig::default(),
        graph,
        drivers,
        Arc::new(InMemoryStateStore::new()),
    )
    .err()
    .unwrap();
    assert!(matches!(err, SchedulerError::UnknownDriverKind { ref kind, .. } if kind == "spark"));
}

#[test]
fn invalid_config_rejected() {
    let config = SchedulerConfig {
        default_concurrency: 0,
        ..SchedulerConfig::default()
    };
    let graph = ViewGraph::build(vec![view("a", &[])]).unwrap();
    let mut drivers = DriverRegistry::new();
    drivers.register(ScriptedDriver::new()).unwrap();
    let result = Scheduler::new(config, graph, drivers, Arc::new(InMemoryStateStore::new()));
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}

// ── Materialization and cache hits ──────────────────────────────────

#[tokio::test]
async fn chain_materializes_in_dependency_order() {
    let (mut s, driver, store) = scheduler(vec![view("c", &["b"]), view("b", &["a"]), view("a", &[])]);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.count_in(ViewState::Materialized), 3);
    assert_eq!(report.dispatches, 3);
    assert_eq!(driver.started(), vec!["a", "b", "c"]);
    assert_eq!(
        reasons(&report, "c"),
        vec![
            TransitionReason::DependenciesPending,
            TransitionReason::DependenciesSatisfied,
            TransitionReason::Dispatched,
            TransitionReason::Succeeded,
        ]
    );

    let persisted = store.load(&id("a")).unwrap().unwrap();
    assert_eq!(persisted.state, ViewState::Materialized);
    assert_eq!(persisted.digest, report.outcome(&id("a")).unwrap().digest);
}

#[tokio::test]
async fn unchanged_views_are_not_dispatched_again() {
    let (mut s, driver, _) = scheduler(vec![view("a", &[]), view("b", &["a"])]);

    let first = cycle(&mut s, CycleOptions::default()).await;
    assert_eq!(first.dispatches, 2);

    let second = cycle(&mut s, CycleOptions::default()).await;
    assert_eq!(second.dispatches, 0);
    assert_eq!(second.cache_hits, 2);
    assert_eq!(second.count_in(ViewState::Materialized), 2);
    assert!(second.outcome(&id("b")).unwrap().cache_hit);
    assert_eq!(reasons(&second, "a").last(), Some(&TransitionReason::UpToDate));
    assert_eq!(driver.attempts("a"), 1);
    assert_eq!(s.metrics().cache_hits, 2);
}

#[tokio::test]
async fn changed_resource_content_is_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let query = dir.path().join("orders.sql");
    std::fs::write(&query, "select 1").unwrap();

    let t = mock("orders").with_resource(Resource::local(&query));
    let (mut s, driver, _) = scheduler(vec![view_with("orders", &[], t)]);

    let first = cycle(&mut s, CycleOptions::default()).await;
    std::fs::write(&query, "select 2").unwrap();
    let second = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(second.dispatches, 1);
    assert_ne!(
        first.outcome(&id("orders")).unwrap().digest,
        second.outcome(&id("orders")).unwrap().digest
    );
    assert_eq!(driver.attempts("orders"), 2);
}

#[tokio::test]
async fn forced_view_rematerializes_its_dependents() {
    let (mut s, driver, _) = scheduler(vec![view("a", &[]), view("b", &["a"]), view("c", &[])]);
    cycle(&mut s, CycleOptions::default()).await;

    let report = cycle(&mut s, CycleOptions::default().force_view(id("a"))).await;

    // b's digest is unchanged but its input was rebuilt
    assert_eq!(report.dispatches, 2);
    assert_eq!(driver.attempts("b"), 2);
    assert_eq!(driver.attempts("c"), 1);
    assert!(report.outcome(&id("c")).unwrap().cache_hit);
}

#[tokio::test]
async fn external_views_are_exempt_and_not_persisted() {
    let (mut s, _, store) = scheduler(vec![View::external(id("raw")), view("orders", &["raw"])]);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.state_of(&id("raw")), Some(ViewState::Materialized));
    assert_eq!(
        reasons(&report, "raw"),
        vec![TransitionReason::ExemptFromMaterialization]
    );
    assert_eq!(report.state_of(&id("orders")), Some(ViewState::Materialized));
    assert!(store.load(&id("raw")).unwrap().is_none());
    assert_eq!(store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn materialize_once_ignores_global_force() {
    let (mut s, driver, _) = scheduler(vec![view("dim", &[]).materialize_once()]);

    cycle(&mut s, CycleOptions::default()).await;
    let forced = cycle(&mut s, CycleOptions::forced()).await;
    assert_eq!(forced.dispatches, 0);
    assert_eq!(forced.state_of(&id("dim")), Some(ViewState::Materialized));

    let explicit = cycle(&mut s, CycleOptions::default().force_view(id("dim"))).await;
    assert_eq!(explicit.dispatches, 1);
    assert_eq!(driver.attempts("dim"), 2);
}

#[tokio::test]
async fn global_force_redispatches_everything() {
    let (mut s, _, _) = scheduler(vec![view("a", &[]), view("b", &["a"])]);
    cycle(&mut s, CycleOptions::default()).await;

    let report = cycle(&mut s, CycleOptions::forced()).await;
    assert_eq!(report.dispatches, 2);
    assert_eq!(report.cache_hits, 0);
}

#[tokio::test]
async fn completion_callback_sees_terminal_state() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let t = mock("a").with_completion(move |state| {
        assert!(state.is_success());
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let (mut s, _, _) = scheduler(vec![view_with("a", &[], t)]);

    cycle(&mut s, CycleOptions::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── Failures and retries ────────────────────────────────────────────

#[tokio::test]
async fn failed_view_keeps_dependents_waiting() {
    let (mut s, driver, store) = scheduler(vec![
        view_with("a", &[], configured("a", "fail", 1)),
        view("b", &["a"]),
        view("c", &["b"]),
        view("d", &[]),
    ]);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.state_of(&id("a")), Some(ViewState::Failed));
    assert_eq!(report.state_of(&id("b")), Some(ViewState::Waiting));
    assert_eq!(report.state_of(&id("c")), Some(ViewState::Waiting));
    assert_eq!(report.state_of(&id("d")), Some(ViewState::Materialized));
    assert_eq!(driver.attempts("b"), 0);
    assert!(report
        .outcome(&id("a"))
        .unwrap()
        .failure
        .as_deref()
        .unwrap()
        .contains("a broke"));
    assert_eq!(store.load(&id("a")).unwrap().unwrap().state, ViewState::Failed);
    assert_eq!(s.metrics().failures, 1);
}

#[tokio::test]
async fn retryable_commit_faults_are_retried_within_budget() {
    let config = SchedulerConfig {
        max_retries: 3,
        ..fast_config()
    };
    let (mut s, driver, _) = scheduler_with(
        vec![view_with("a", &[], configured("a", "commit_faults", 2))],
        config,
    );

    let report = cycle(&mut s, CycleOptions::default()).await;

    let outcome = report.outcome(&id("a")).unwrap();
    assert_eq!(outcome.state, ViewState::Materialized);
    assert_eq!(outcome.dispatches, 3);
    assert_eq!(outcome.retries, 2);
    assert_eq!(driver.attempts("a"), 3);
    assert_eq!(
        reasons(&report, "a"),
        vec![
            TransitionReason::DependenciesSatisfied,
            TransitionReason::Dispatched,
            TransitionReason::RetryScheduled,
            TransitionReason::RetryDue,
            TransitionReason::RetryScheduled,
            TransitionReason::RetryDue,
            TransitionReason::Succeeded,
        ]
    );
    assert_eq!(s.metrics().retries, 2);
}

#[tokio::test]
async fn exhausted_retry_budget_fails_view() {
    let config = SchedulerConfig {
        max_retries: 1,
        ..fast_config()
    };
    let (mut s, driver, _) = scheduler_with(
        vec![view_with("a", &[], configured("a", "commit_faults", 5))],
        config,
    );

    let report = cycle(&mut s, CycleOptions::default()).await;

    let outcome = report.outcome(&id("a")).unwrap();
    assert_eq!(outcome.state, ViewState::Failed);
    assert_eq!(driver.attempts("a"), 2);
    assert!(outcome.failure.as_deref().unwrap().contains("retry budget exhausted"));
    assert_eq!(
        reasons(&report, "a").last(),
        Some(&TransitionReason::RetryBudgetExhausted)
    );
}

#[tokio::test]
async fn rejected_run_fails_without_retry() {
    let (mut s, driver, _) = scheduler(vec![view_with("a", &[], configured("a", "reject", 1))]);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.state_of(&id("a")), Some(ViewState::Failed));
    assert_eq!(report.outcome(&id("a")).unwrap().retries, 0);
    assert_eq!(reasons(&report, "a").last(), Some(&TransitionReason::DriverFailed));
    assert_eq!(driver.attempts("a"), 0);
}

#[tokio::test]
async fn unavailable_resource_retries_digest_then_fails() {
    let t = mock("a").with_resource(Resource::local("/nonexistent/vista/query.sql"));
    let config = SchedulerConfig {
        max_retries: 2,
        ..fast_config()
    };
    let (mut s, driver, _) = scheduler_with(vec![view_with("a", &[], t), view("b", &["a"])], config);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.state_of(&id("a")), Some(ViewState::Failed));
    assert_eq!(report.state_of(&id("b")), Some(ViewState::Waiting));
    assert_eq!(report.dispatches, 0);
    assert_eq!(driver.attempts("a"), 0);
    let reasons = reasons(&report, "a");
    assert_eq!(
        reasons.iter().filter(|r| **r == TransitionReason::DigestUnavailable).count(),
        2
    );
    assert_eq!(reasons.last(), Some(&TransitionReason::RetryBudgetExhausted));
}

#[tokio::test]
async fn resource_appearing_during_backoff_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.sql");
    let t = mock("a").with_resource(Resource::local(&path));
    let config = SchedulerConfig {
        max_retries: 5,
        backoff_base_ms: 20,
        backoff_max_ms: 50,
        ..fast_config()
    };
    let (mut s, _, _) = scheduler_with(vec![view_with("a", &[], t)], config);

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        std::fs::write(&path, "select 1").unwrap();
    });
    let report = cycle(&mut s, CycleOptions::default()).await;
    writer.await.unwrap();

    let outcome = report.outcome(&id("a")).unwrap();
    assert_eq!(outcome.state, ViewState::Materialized);
    assert!(outcome.retries >= 1);
}

// ── Concurrency and ordering ────────────────────────────────────────

#[tokio::test]
async fn driver_concurrency_budget_is_never_exceeded() {
    let mut config = fast_config();
    config.driver_concurrency.insert("scripted".into(), 2);
    let views = (0..5)
        .map(|n| {
            let name = format!("v{n}");
            view_with(&name, &[], configured(&name, "duration_ms", 20))
        })
        .collect();
    let (mut s, driver, _) = scheduler_with(views, config);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.count_in(ViewState::Materialized), 5);
    assert_eq!(driver.max_running(), 2);
    assert_eq!(driver.running(), 0);
}

#[tokio::test]
async fn due_retry_waits_for_slot_without_spinning() {
    let mut config = fast_config();
    config.driver_concurrency.insert("scripted".into(), 1);
    let slow_flaky = |name: &str| {
        let mut t = configured(name, "duration_ms", 150);
        t.configure_with([("commit_faults", 1i64)]);
        view_with(name, &[], t)
    };
    let (mut s, driver, _) = scheduler_with(vec![slow_flaky("a"), slow_flaky("b")], config);

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert_eq!(report.count_in(ViewState::Materialized), 2);
    assert_eq!(driver.attempts("a"), 2);
    assert_eq!(driver.attempts("b"), 2);
    assert_eq!(driver.max_running(), 1);
    // a's retry falls due while b holds the only slot
    let wakeups = s.metrics().coordinator_wakeups;
    assert!(wakeups < 100, "coordinator woke {wakeups} times");
}

#[test]
fn next_retry_deadline_skips_retries_already_due() {
    let now = Instant::now();
    let mut cycle = Cycle::new(3, CycleOptions::default());
    cycle.runtime[0].retry_at = Some(now - Duration::from_millis(10));
    cycle.runtime[1].retry_at = Some(now + Duration::from_millis(50));
    cycle.runtime[2].retry_at = Some(now + Duration::from_millis(20));

    assert_eq!(cycle.next_retry_at(now), Some(now + Duration::from_millis(20)));

    cycle.runtime[1].retry_at = None;
    cycle.runtime[2].retry_at = None;
    assert_eq!(cycle.next_retry_at(now), None);
}

#[tokio::test]
async fn ready_views_ordered_by_fan_out_then_declaration() {
    let (mut s, _, _) = scheduler(vec![
        view("leaf", &[]),
        view("other", &[]),
        view("root", &[]),
        view("mid", &["root"]),
        view("top", &["mid"]),
    ]);

    let mut cycle = Cycle::new(s.graph.len(), CycleOptions::default());
    for name in ["leaf", "other", "root"] {
        let i = s.graph.index_of(&id(name)).unwrap();
        s.graph.view_mut(i).state = ViewState::Eligible;
        cycle.runtime[i].digest = Some("d".into());
    }

    let order: Vec<String> = s
        .select_ready(&cycle)
        .into_iter()
        .map(|i| s.graph.view(i).id.name.clone())
        .collect();
    assert_eq!(order, vec!["root", "leaf", "other"]);
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_all_kills_each_run_once() {
    let views = ["a", "b", "c"]
        .iter()
        .map(|n| view_with(n, &[], configured(n, "duration_ms", 60_000)))
        .chain(std::iter::once(view("d", &["a"])))
        .collect();
    let (mut s, driver, store) = scheduler(views);

    let cancel = s.cancel_handle();
    let watcher = Arc::clone(&driver);
    tokio::spawn(async move {
        wait_until(|| watcher.running() == 3).await;
        cancel.cancel_all();
    });

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert!(report.cancelled);
    for name in ["a", "b", "c"] {
        let outcome = report.outcome(&id(name)).unwrap();
        assert_eq!(outcome.state, ViewState::Failed);
        assert!(outcome.failure.as_deref().unwrap().starts_with("cancelled"));
        assert_eq!(reasons(&report, name).last(), Some(&TransitionReason::Cancelled));
        assert_eq!(store.load(&id(name)).unwrap().unwrap().state, ViewState::Failed);
    }
    assert_eq!(report.state_of(&id("d")), Some(ViewState::Waiting));

    let kills = driver.kills();
    assert_eq!(kills.len(), 3);
    assert!(kills.values().all(|&n| n == 1));
    assert_eq!(driver.running(), 0);
}

#[tokio::test]
async fn cancel_subtree_leaves_other_views_running() {
    let (mut s, driver, _) = scheduler(vec![
        view_with("slow", &[], configured("slow", "duration_ms", 60_000)),
        view("after_slow", &["slow"]),
        view_with("other", &[], configured("other", "duration_ms", 30)),
    ]);

    let cancel = s.cancel_handle();
    let watcher = Arc::clone(&driver);
    tokio::spawn(async move {
        wait_until(|| watcher.attempts("slow") == 1).await;
        cancel.cancel_subtree(&id("slow"));
    });

    let report = cycle(&mut s, CycleOptions::default()).await;

    assert!(report.cancelled);
    assert_eq!(report.state_of(&id("slow")), Some(ViewState::Failed));
    assert_eq!(report.state_of(&id("after_slow")), Some(ViewState::Waiting));
    assert_eq!(report.state_of(&id("other")), Some(ViewState::Materialized));
    assert_eq!(driver.kills().len(), 1);
    assert!(!s.cancel_handle().is_cancelled());
}

// ── State store ─────────────────────────────────────────────────────

#[tokio::test]
async fn store_failure_aborts_cycle_and_kills_runs() {
    let (mut s, driver, store) = scheduler(vec![
        view_with("quick", &[], configured("quick", "duration_ms", 40)),
        view_with("slow", &[], configured("slow", "duration_ms", 60_000)),
    ]);

    let watcher = Arc::clone(&driver);
    let failing = Arc::clone(&store);
    tokio::spawn(async move {
        wait_until(|| watcher.running() == 2).await;
        failing.set_unavailable(true);
    });

    let result = tokio::time::timeout(Duration::from_secs(10), s.run_cycle(CycleOptions::default()))
        .await
        .expect("cycle timed out");

    assert!(matches!(result, Err(SchedulerError::Store(_))));
    assert_eq!(driver.kills().len(), 1);
    assert_eq!(driver.running(), 0);
}

#[tokio::test]
async fn dependent_of_rebuilt_view_is_rebuilt_after_aborted_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.sql");
    std::fs::write(&source, "v1").unwrap();

    let (mut s, driver, store) = scheduler(vec![
        view_with("a", &[], mock("a").with_resource(Resource::local(&source))),
        view("b", &["a"]),
        view_with("quick", &[], configured("quick", "duration_ms", 200)),
    ]);
    cycle(&mut s, CycleOptions::default()).await;

    // a is rebuilt against v2, then the store goes away while b runs
    std::fs::write(&source, "v2").unwrap();
    s.configure_view(&id("b"), [("duration_ms", 60_000i64)]);
    let watcher = Arc::clone(&driver);
    let failing = Arc::clone(&store);
    tokio::spawn(async move {
        wait_until(|| watcher.attempts("b") == 2).await;
        failing.set_unavailable(true);
    });
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        s.run_cycle(CycleOptions::default().force_view(id("quick"))),
    )
    .await
    .expect("cycle timed out");
    assert!(matches!(result, Err(SchedulerError::Store(_))));

    store.set_unavailable(false);
    assert!(store.load(&id("b")).unwrap().unwrap().inputs_changed);
    s.configure_view(&id("b"), [("duration_ms", 5i64)]);
    let report = cycle(&mut s, CycleOptions::default()).await;

    let b = report.outcome(&id("b")).unwrap();
    assert_eq!(b.state, ViewState::Materialized);
    assert!(!b.cache_hit);
    assert_eq!(b.dispatches, 1);
    assert!(report.outcome(&id("a")).unwrap().cache_hit);
    assert_eq!(driver.attempts("b"), 3);
    assert!(!store.load(&id("b")).unwrap().unwrap().inputs_changed);
}

#[tokio::test]
async fn unreadable_store_fails_before_dispatch() {
    let (mut s, driver, store) = scheduler(vec![view("a", &[])]);
    store.set_unavailable(true);

    let result = s.run_cycle(CycleOptions::default()).await;

    assert!(matches!(result, Err(SchedulerError::Store(_))));
    assert_eq!(driver.attempts("a"), 0);
}

// ── Long-running loop and snapshot ──────────────────────────────────

#[tokio::test]
async fn run_loop_stops_on_cancel_all() {
    let (mut s, driver, _) = scheduler(vec![view("a", &[])]);
    let cancel = s.cancel_handle();
    let metrics = s.metrics_handle();

    let task = tokio::spawn(async move {
        let result = s.run(Duration::from_millis(5)).await;
        result.map(|()| s)
    });
    wait_until(|| metrics.read().unwrap().cycles_run >= 3).await;
    cancel.cancel_all();

    let s = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("loop did not stop")
        .unwrap()
        .unwrap();
    // one dispatch, every later cycle is a cache hit
    assert_eq!(driver.attempts("a"), 1);
    assert!(s.metrics().cache_hits >= 2);
}

#[tokio::test]
async fn run_loop_picks_up_replaced_graph() {
    let (mut s, driver, _) = scheduler(vec![view("a", &[])]);
    let cancel = s.cancel_handle();
    let mut calls = 0;

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        s.run_with(Duration::from_millis(1), |s| {
            calls += 1;
            match calls {
                1 => Ok(()),
                2 => s.replace_graph(ViewGraph::build(vec![view("a", &[]), view("b", &["a"])])?),
                _ => {
                    cancel.cancel_all();
                    Ok(())
                }
            }
        }),
    )
    .await
    .expect("loop did not stop");

    assert!(result.is_ok());
    assert_eq!(calls, 3);
    assert_eq!(s.graph().len(), 2);
    assert_eq!(driver.attempts("a"), 1);
    assert_eq!(driver.attempts("b"), 1);
    assert_eq!(s.metrics().cycles_run, 2);
}

#[tokio::test]
async fn replace_graph_rejects_unknown_driver_kind() {
    let (mut s, _, _) = scheduler(vec![view("a", &[])]);

    let graph = ViewGraph::build(vec![view_with("b", &[], Transformation::new("spark"))]).unwrap();
    let err = s.replace_graph(graph).unwrap_err();

    assert!(matches!(err, SchedulerError::UnknownDriverKind { ref kind, .. } if kind == "spark"));
    assert_eq!(s.graph().len(), 1);
}

#[tokio::test]
async fn snapshot_reflects_last_cycle() {
    let (mut s, _, _) = scheduler(vec![view("a", &[]), view_with("b", &["a"], configured("b", "fail", 1))]);
    let report = cycle(&mut s, CycleOptions::default()).await;

    let snapshot = s.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].state, ViewState::Materialized);
    assert_eq!(snapshot[0].last_digest, report.outcome(&id("a")).unwrap().digest);
    assert_eq!(snapshot[1].state, ViewState::Failed);
    assert_eq!(snapshot[1].dependencies, vec![id("a")]);
    assert_eq!(snapshot[1].transformation_kind.as_deref(), Some("mock"));
}

#[tokio::test]
async fn configure_view_applies_to_next_cycle() {
    let (mut s, driver, _) = scheduler(vec![view("a", &[])]);
    cycle(&mut s, CycleOptions::default()).await;

    assert!(s.configure_view(&id("a"), [("fail", 1i64)]));
    assert!(!s.configure_view(&id("missing"), [("fail", 1i64)]));

    // configuration is not part of the digest
    let report = cycle(&mut s, CycleOptions::default()).await;
    assert_eq!(report.dispatches, 0);

    let report = cycle(&mut s, CycleOptions::forced()).await;
    assert_eq!(report.state_of(&id("a")), Some(ViewState::Failed));
    assert_eq!(driver.attempts("a"), 2);
}
