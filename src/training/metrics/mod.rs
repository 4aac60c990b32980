//! Metrics tracking for preference training
//!
//! Per-micro-batch metrics are summed into a logging window and averaged
//! when a log record is emitted. Records keep the flat names used by the
//! loss (`rewards/margin`, `eval_loss`, ...), so exporters need no schema.

pub mod exporters;

pub use exporters::{JsonlExporter, MetricsExporter, TracingExporter};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One emitted log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Optimizer step
    pub step: usize,
    /// Fractional epoch
    pub epoch: f64,
    /// Metric name to value
    pub metrics: BTreeMap<String, f64>,
    /// Emission time
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Window {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

/// Windowed metric averaging plus history, shareable across tasks
#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    window: Arc<RwLock<Window>>,
    history: Arc<RwLock<Vec<LogRecord>>>,
}

impl MetricsTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation per metric to the current window
    pub fn record(&self, metrics: &BTreeMap<String, f64>) {
        let mut window = self.window.write();
        for (name, value) in metrics {
            *window.sums.entry(name.clone()).or_insert(0.0) += value;
            *window.counts.entry(name.clone()).or_insert(0) += 1;
        }
    }

    /// Observations in the current window for `name`
    pub fn window_count(&self, name: &str) -> usize {
        self.window.read().counts.get(name).copied().unwrap_or(0)
    }

    /// Averages of the current window, without clearing it
    pub fn window_means(&self) -> BTreeMap<String, f64> {
        let window = self.window.read();
        window
            .sums
            .iter()
            .filter_map(|(name, sum)| {
                let count = *window.counts.get(name)?;
                (count > 0).then(|| (name.clone(), sum / count as f64))
            })
            .collect()
    }

    /// Close the window: average it, merge `extra` (learning rate, grad
    /// norm, ...), append to history and return the record
    pub fn flush(&self, step: usize, epoch: f64, extra: BTreeMap<String, f64>) -> LogRecord {
        let mut metrics = self.window_means();
        metrics.extend(extra);
        *self.window.write() = Window::default();

        let record = LogRecord {
            step,
            epoch,
            metrics,
            timestamp: Utc::now(),
        };
        self.history.write().push(record.clone());
        record
    }

    /// Append a record that bypasses the window, e.g. evaluation results
    pub fn push(&self, step: usize, epoch: f64, metrics: BTreeMap<String, f64>) -> LogRecord {
        let record = LogRecord {
            step,
            epoch,
            metrics,
            timestamp: Utc::now(),
        };
        self.history.write().push(record.clone());
        record
    }

    /// All emitted records
    pub fn history(&self) -> Vec<LogRecord> {
        self.history.read().clone()
    }

    /// Most recent value of `name` across the history
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.history
            .read()
            .iter()
            .rev()
            .find_map(|record| record.metrics.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_window_means_and_flush() {
        let tracker = MetricsTracker::new();
        tracker.record(&metrics(&[("loss", 1.0), ("rewards/accuracy", 0.0)]));
        tracker.record(&metrics(&[("loss", 3.0), ("rewards/accuracy", 1.0)]));
        assert_eq!(tracker.window_count("loss"), 2);

        let record = tracker.flush(5, 0.25, metrics(&[("learning_rate", 1e-6)]));
        assert_relative_eq!(record.metrics["loss"], 2.0);
        assert_relative_eq!(record.metrics["rewards/accuracy"], 0.5);
        assert_relative_eq!(record.metrics["learning_rate"], 1e-6);
        assert_eq!(tracker.window_count("loss"), 0);
        assert_eq!(tracker.history().len(), 1);
    }

    #[test]
    fn test_latest_skips_records_without_the_metric() {
        let tracker = MetricsTracker::new();
        tracker.flush(1, 0.0, metrics(&[("loss", 0.7)]));
        tracker.push(2, 0.0, metrics(&[("eval_loss", 0.6)]));
        assert_eq!(tracker.latest("loss"), Some(0.7));
        assert_eq!(tracker.latest("eval_loss"), Some(0.6));
        assert_eq!(tracker.latest("sft_loss"), None);
    }
}
