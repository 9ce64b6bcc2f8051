//! External boundaries of the refinement loop.

use async_trait::async_trait;

use super::prioritizer::PrioritizedIssue;
use super::refinement::RefinementIteration;
use super::types::QualityReport;
use crate::error::{CriticError, FixError, RefinementError};
use crate::ledger::CostLedger;

/// Scores an artifact and reports typed issues.
#[async_trait]
pub trait QualityCritic<A>: Send + Sync {
    /// Critique the given artifact.
    async fn critique(&self, artifact: &A) -> Result<QualityReport, CriticError>;
}

/// Produces a revised artifact addressing the given issues.
///
/// Implementations must not mutate the input.
#[async_trait]
pub trait FixFunction<A>: Send + Sync {
    async fn apply_fixes(&self, artifact: &A, issues: &[PrioritizedIssue]) -> Result<A, FixError>;
}

/// Receives each completed iteration before the next one starts.
#[async_trait]
pub trait IterationSink<A>: Send + Sync {
    async fn record(
        &self,
        iteration: &RefinementIteration,
        artifact: &A,
        ledger: &CostLedger,
    ) -> Result<(), RefinementError>;
}
