//! reelforge: pipeline orchestration and quality refinement for turning
//! parsed stories into finished short-form video.
//!
//! The crate sequences story runs through fixed stages, validates narrative
//! continuity, plans timed shots, and refines assembled artifacts through
//! bounded critique and fix rounds under a dollar budget.

pub mod cli;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod narrative;
pub mod pipeline;
pub mod planning;
pub mod quality;
pub mod scheduler;
pub mod storage;

pub use error::{
    ConfigError, CriticError, FixError, LedgerError, NarrativeError, PipelineError,
    PipelineResult, PlanningError, RefinementError, StageError, StoreError,
};
