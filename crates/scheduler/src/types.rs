use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vista_core::{TransitionReason, ViewId, ViewState};

use crate::error::SchedulerError;

// ── Scheduler config ────────────────────────────────────────────────

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Re-dispatches allowed per view and cycle after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// How often in-flight runs are polled.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Pause between cycles of a long-running scheduler.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Concurrent runs per driver unless overridden below.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Per-driver concurrency, keyed by driver name.
    #[serde(default)]
    pub driver_concurrency: HashMap<String, usize>,
    /// Distributed-filesystem URI prefix → local mount point, for digesting.
    #[serde(default)]
    pub hdfs_mounts: BTreeMap<String, PathBuf>,
}

fn default_max_retries() -> u32 { 3 }
fn default_backoff_base() -> u64 { 500 }
fn default_backoff_max() -> u64 { 60_000 }
fn default_poll_interval() -> u64 { 250 }
fn default_cycle_interval() -> u64 { 300 }
fn default_concurrency() -> usize { 4 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            poll_interval_ms: default_poll_interval(),
            cycle_interval_secs: default_cycle_interval(),
            default_concurrency: default_concurrency(),
            driver_concurrency: HashMap::new(),
            hdfs_mounts: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self =
            toml::from_str(toml_str).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SchedulerError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// - `VISTA_MAX_RETRIES` → `max_retries`
    /// - `VISTA_DEFAULT_CONCURRENCY` → `default_concurrency`
    /// - `VISTA_POLL_INTERVAL_MS` → `poll_interval_ms`
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("VISTA_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = env_parse("VISTA_DEFAULT_CONCURRENCY") {
            self.default_concurrency = v;
        }
        if let Some(v) = env_parse("VISTA_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.default_concurrency == 0 {
            return Err(SchedulerError::Config("default_concurrency must be at least 1".into()));
        }
        if let Some((driver, _)) = self.driver_concurrency.iter().find(|(_, &n)| n == 0) {
            return Err(SchedulerError::Config(format!(
                "driver_concurrency for '{driver}' must be at least 1"
            )));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(SchedulerError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SchedulerError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based): base · 2^(retry-1), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn concurrency_for(&self, driver: &str) -> usize {
        self.driver_concurrency
            .get(driver)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

// ── Cycle options ───────────────────────────────────────────────────

/// Per-cycle rematerialization requests.
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Ignore every persisted digest.
    pub force: bool,
    /// Ignore the persisted digest of these views only.
    pub force_views: HashSet<ViewId>,
}

impl CycleOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn force_view(mut self, id: ViewId) -> Self {
        self.force_views.insert(id);
        self
    }

    pub fn is_forced(&self, id: &ViewId) -> bool {
        self.force || self.force_views.contains(id)
    }
}

// ── Cycle report ────────────────────────────────────────────────────

/// One state change of one view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub view: ViewId,
    pub from: ViewState,
    pub to: ViewState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Where one view ended up after a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewOutcome {
    pub view: ViewId,
    pub state: ViewState,
    /// Runs handed to a driver in this cycle.
    pub dispatches: u32,
    pub retries: u32,
    pub cache_hit: bool,
    pub digest: Option<String>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per view, in declaration order.
    pub outcomes: Vec<ViewOutcome>,
    pub dispatches: usize,
    pub cache_hits: usize,
    pub cancelled: bool,
    pub transitions: Vec<TransitionRecord>,
}

impl CycleReport {
    pub fn outcome(&self, id: &ViewId) -> Option<&ViewOutcome> {
        self.outcomes.iter().find(|o| &o.view == id)
    }

    pub fn state_of(&self, id: &ViewId) -> Option<ViewState> {
        self.outcome(id).map(|o| o.state)
    }

    pub fn count_in(&self, state: ViewState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ViewOutcome> {
        self.outcomes.iter().filter(|o| o.state == ViewState::Failed)
    }

    pub fn transitions_for<'a>(&'a self, id: &'a ViewId) -> impl Iterator<Item = &'a TransitionRecord> {
        self.transitions.iter().filter(move |t| &t.view == id)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// Log a one-line summary plus one line per failed view.
    pub fn log_summary(&self) {
        tracing::info!(
            cycle = %self.cycle_id,
            views = self.outcomes.len(),
            materialized = self.count_in(ViewState::Materialized),
            failed = self.count_in(ViewState::Failed),
            waiting = self.count_in(ViewState::Waiting),
            dispatches = self.dispatches,
            cache_hits = self.cache_hits,
            duration_ms = self.duration().as_millis() as u64,
            "cycle finished"
        );
        for outcome in self.failed() {
            tracing::warn!(
                view = %outcome.view,
                reason = outcome.failure.as_deref().unwrap_or("unknown"),
                "view failed"
            );
        }
    }
}
