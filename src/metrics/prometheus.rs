//! Prometheus metrics registration and export.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all reelforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Runs reaching a terminal or paused status, labeled by status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage executions, labeled by stage and outcome.
pub static STAGE_EXECUTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Transient-failure retries, labeled by stage.
pub static STAGE_RETRIES: OnceLock<CounterVec> = OnceLock::new();

/// Completed refinement iterations.
pub static REFINEMENT_ITERATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Refinement loops reaching a terminal status, labeled by status.
pub static REFINEMENT_RUNS: OnceLock<CounterVec> = OnceLock::new();

/// Ledger spend in dollars, labeled by category.
pub static COST_DOLLARS: OnceLock<CounterVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Subsequent calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("reelforge_runs_total", "Runs reaching a terminal or paused status"),
        &["status"],
    )?;

    let stage_executions = CounterVec::new(
        Opts::new("reelforge_stage_executions_total", "Stage executions"),
        &["stage", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "reelforge_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["stage"],
    )?;

    let stage_retries = CounterVec::new(
        Opts::new("reelforge_stage_retries_total", "Transient stage failures retried"),
        &["stage"],
    )?;

    let refinement_iterations = CounterVec::new(
        Opts::new(
            "reelforge_refinement_iterations_total",
            "Completed critique-fix-critique iterations",
        ),
        &["outcome"],
    )?;

    let refinement_runs = CounterVec::new(
        Opts::new("reelforge_refinement_runs_total", "Refinement loops by terminal status"),
        &["status"],
    )?;

    let cost_dollars = CounterVec::new(
        Opts::new("reelforge_cost_dollars_total", "Ledger spend in dollars"),
        &["category"],
    )?;

    let active_workers = Gauge::new("reelforge_active_workers", "Number of active workers")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(stage_executions.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(stage_retries.clone()))?;
    registry.register(Box::new(refinement_iterations.clone()))?;
    registry.register(Box::new(refinement_runs.clone()))?;
    registry.register(Box::new(cost_dollars.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set statics mean a previous init won; keep it.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = STAGE_EXECUTIONS.set(stage_executions);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = STAGE_RETRIES.set(stage_retries);
    let _ = REFINEMENT_ITERATIONS.set(refinement_iterations);
    let _ = REFINEMENT_RUNS.set(refinement_runs);
    let _ = COST_DOLLARS.set(cost_dollars);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line when the registry was never
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
