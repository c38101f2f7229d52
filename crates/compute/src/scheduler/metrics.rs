use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use stepd_core::StatusCode;

/// Scheduler operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Steps executed by kernel name.
    pub steps_executed: HashMap<String, u64>,
    /// Average step duration by kernel name.
    pub avg_step_duration: HashMap<String, Duration>,
    /// Last execution time by kernel name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    pub pends: u64,
    pub wakes: u64,
    pub discard_batches: u64,
    pub completed_streams: u64,
    pub aborted_streams: u64,
    pub failed_streams: u64,
    /// Failure count by status code.
    pub failures: HashMap<StatusCode, u64>,
}

impl SchedulerMetrics {
    /// Record one step execution.
    pub fn record_step(&mut self, kernel: &str, duration: Duration) {
        *self.steps_executed.entry(kernel.to_string()).or_default() += 1;
        self.last_run.insert(kernel.to_string(), Utc::now());

        let count = self.steps_executed[kernel];
        let prev_avg = self
            .avg_step_duration
            .get(kernel)
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

        self.avg_step_duration.insert(kernel.to_string(), new_avg);
    }

    pub fn record_failure(&mut self, code: StatusCode) {
        self.failed_streams += 1;
        *self.failures.entry(code).or_default() += 1;
    }

    pub fn total_steps(&self) -> u64 {
        self.steps_executed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_step() {
        let mut m = SchedulerMetrics::default();
        m.record_step("gather_dequeue", Duration::from_micros(100));

        assert_eq!(m.steps_executed["gather_dequeue"], 1);
        assert!(m.last_run.contains_key("gather_dequeue"));
        assert_eq!(m.avg_step_duration["gather_dequeue"], Duration::from_micros(100));
    }

    #[test]
    fn record_multiple_steps_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_step("enqueue", Duration::from_millis(100));
        m.record_step("enqueue", Duration::from_millis(200));

        assert_eq!(m.steps_executed["enqueue"], 2);
        let avg = m.avg_step_duration["enqueue"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
        assert_eq!(m.total_steps(), 2);
    }

    #[test]
    fn failures_are_counted_by_code() {
        let mut m = SchedulerMetrics::default();
        m.record_failure(StatusCode::FromDriver);
        m.record_failure(StatusCode::FromDriver);
        assert_eq!(m.failed_streams, 2);
        assert_eq!(m.failures[&StatusCode::FromDriver], 2);
    }

    #[test]
    fn metrics_serialize_to_json() {
        let mut m = SchedulerMetrics::default();
        m.record_failure(StatusCode::ParameterInvalid);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["failed_streams"], 1);
        assert_eq!(json["failures"]["parameter_invalid"], 1);
    }
}
