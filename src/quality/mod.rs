//! Quality critique and iterative refinement.
//!
//! A [`QualityCritic`] scores an artifact and reports typed issues;
//! [`prioritize`] orders those issues by severity and dimension weight; the
//! [`RefinementLoop`] runs bounded critique/fix rounds under a dollar cap.

pub mod config;
pub mod critic;
pub mod prioritizer;
pub mod refinement;
pub mod types;

pub use config::RefinementConfig;
pub use critic::{FixFunction, IterationSink, QualityCritic};
pub use prioritizer::{prioritize, PrioritizedIssue};
pub use refinement::{
    fingerprint, RefinementFailure, RefinementIteration, RefinementLoop, RefinementOutcome,
    RefinementResult, RefinementStatus,
};
pub use types::{
    Dimension, DimensionScores, FixCategory, Issue, IssueSeverity, QualityReport, Recommendation,
};
