//! Metrics module for Prometheus-based monitoring.
//!
//! Counters and gauges for runs, stage executions, retries, refinement
//! outcomes, ledger spend and workers. Recording is a no-op until
//! `init_metrics()` has been called.
//!
//! # Example
//!
//! ```ignore
//! use reelforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_stage("plan", "success", 0.42);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, COST_DOLLARS, REFINEMENT_ITERATIONS, REFINEMENT_RUNS, REGISTRY, RUNS_TOTAL,
    STAGE_DURATION, STAGE_EXECUTIONS, STAGE_RETRIES,
};
