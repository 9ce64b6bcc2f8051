//! Run orchestration.
//!
//! A story moves through a fixed sequence of stages:
//!
//! ```text
//! ingest -> parse -> graph -> continuity -> plan -> generate -> assemble
//!        -> critique -> refine -> review -> finalize
//! ```
//!
//! The [`Orchestrator`] executes one stage at a time against a persisted
//! [`Run`], checking the run's cost ledger before each stage and saving the
//! run after each one. A crashed or restarted worker resumes at the first
//! stage without recorded output.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reelforge::pipeline::{Orchestrator, ReelforgeConfig, StageKind, StageRegistry};
//! use reelforge::storage::MemoryRunStore;
//!
//! let registry = StageRegistry::new()
//!     .register(StageKind::Ingest, Arc::new(IngestStage))
//!     .register(StageKind::Parse, Arc::new(ParseStage));
//! let orchestrator = Orchestrator::new(
//!     ReelforgeConfig::from_env()?,
//!     Arc::new(MemoryRunStore::new()),
//!     registry,
//!     Arc::new(MyCritic),
//! )?;
//!
//! let run = orchestrator.create_run("story-42", source).await?;
//! let run = orchestrator.drive(run.id).await?;
//! println!("{}", run.summary());
//! ```

pub mod config;
pub mod orchestrator;
pub mod review;
pub mod run;
pub mod stages;

pub use config::{OrchestratorConfig, ReelforgeConfig, RetryPolicy};
pub use orchestrator::{Orchestrator, ReviewRecord};
pub use review::{LogReviewChannel, ReviewChannel, ReviewDecision};
pub use run::{Run, RunError, RunErrorKind, RunStatus, RunSummary};
pub use stages::{
    CritiqueStage, StageExecutor, StageInput, StageKind, StageOutput, StageRegistry,
};
