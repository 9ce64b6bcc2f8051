//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op for metrics that were never initialized, so the
//! library can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, COST_DOLLARS, REFINEMENT_ITERATIONS, REFINEMENT_RUNS, RUNS_TOTAL,
    STAGE_DURATION, STAGE_EXECUTIONS, STAGE_RETRIES,
};

/// Metrics collector for recording reelforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use reelforge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage("generate", "success", 12.5);
/// collector.record_run_status("completed");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one stage execution attempt.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage name (e.g., "plan", "generate")
    /// * `outcome` - "success", "transient", "fatal", "skipped"
    /// * `duration_secs` - Wall-clock time spent in the executor
    pub fn record_stage(&self, stage: &str, outcome: &str, duration_secs: f64) {
        if let Some(executions) = STAGE_EXECUTIONS.get() {
            executions.with_label_values(&[stage, outcome]).inc();
        }

        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }

        tracing::trace!(
            stage = stage,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Record a retry of a transient stage failure.
    pub fn record_retry(&self, stage: &str) {
        if let Some(retries) = STAGE_RETRIES.get() {
            retries.with_label_values(&[stage]).inc();
        }
    }

    /// Record a run entering a terminal or paused status.
    pub fn record_run_status(&self, status: &str) {
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded run status metric");
    }

    /// Record one completed refinement iteration.
    ///
    /// `improved` is whether the re-critique scored higher than the baseline.
    pub fn record_refinement_iteration(&self, improved: bool) {
        let outcome = if improved { "improved" } else { "flat" };
        if let Some(iterations) = REFINEMENT_ITERATIONS.get() {
            iterations.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a refinement loop reaching a terminal status.
    pub fn record_refinement_result(&self, status: &str) {
        if let Some(runs) = REFINEMENT_RUNS.get() {
            runs.with_label_values(&[status]).inc();
        }
    }

    /// Record a ledger posting in dollars.
    pub fn record_cost(&self, category: &str, dollars: f64) {
        if let Some(cost) = COST_DOLLARS.get() {
            cost.with_label_values(&[category]).inc_by(dollars);
        }
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_without_init_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_stage("plan", "success", 0.1);
        collector.record_retry("generate");
        collector.record_run_status("completed");
        collector.record_refinement_iteration(true);
        collector.record_refinement_result("converged");
        collector.record_cost("fix", 0.2);
        collector.update_workers(2);
    }

    #[test]
    fn test_recorded_cost_is_exported() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.record_cost("critique", 0.05);

        let text = export_metrics();
        if !text.starts_with("# Metrics not initialized") {
            assert!(text.contains("reelforge_cost_dollars_total"));
        }
    }
}
