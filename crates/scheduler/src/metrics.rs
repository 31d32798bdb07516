use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational counters, accumulated across cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Dispatches by driver name.
    pub dispatches: HashMap<String, u64>,
    /// Average run duration by driver name, dispatch to terminal state.
    pub avg_dispatch_duration: HashMap<String, Duration>,
    pub cache_hits: u64,
    pub retries: u64,
    pub failures: u64,
    pub materializations: u64,
    pub cycles_run: u64,
    /// Times the coordinator woke up to handle an event, cancellation or
    /// retry deadline.
    pub coordinator_wakeups: u64,
    pub last_cycle_duration: Option<Duration>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    /// Record one finished dispatch.
    pub fn record_dispatch(&mut self, driver: &str, duration: Duration) {
        *self.dispatches.entry(driver.to_string()).or_default() += 1;

        let count = self.dispatches[driver];
        let prev_avg = self
            .avg_dispatch_duration
            .get(driver)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_dispatch_duration.insert(driver.to_string(), new_avg);
    }

    pub fn record_cycle(&mut self, duration: Duration) {
        self.cycles_run += 1;
        self.last_cycle_duration = Some(duration);
        self.last_cycle_at = Some(Utc::now());
    }

    pub fn total_dispatches(&self) -> u64 {
        self.dispatches.values().sum()
    }
}
