//! Human review channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::run::Run;
use crate::error::StageError;

/// Reviewer verdict on a run awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    /// Send the run back through refinement.
    RequestChanges { notes: String },
    /// Cancel the run.
    Reject { reason: String },
}

/// Delivers review requests to humans.
///
/// Decisions come back asynchronously through
/// [`Orchestrator::resolve_review`](super::Orchestrator::resolve_review).
#[async_trait]
pub trait ReviewChannel: Send + Sync {
    async fn request_review(&self, run: &Run) -> Result<(), StageError>;
}

/// Review channel that only logs the request.
#[derive(Debug, Clone, Default)]
pub struct LogReviewChannel;

#[async_trait]
impl ReviewChannel for LogReviewChannel {
    async fn request_review(&self, run: &Run) -> Result<(), StageError> {
        tracing::info!(
            run_id = %run.id,
            story_id = %run.story_id,
            spent = run.ledger.spent(),
            "Review requested"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_format() {
        let decision: ReviewDecision =
            serde_json::from_str(r#"{"decision": "request_changes", "notes": "tighten hook"}"#)
                .unwrap();
        assert_eq!(
            decision,
            ReviewDecision::RequestChanges {
                notes: "tighten hook".to_string()
            }
        );
        assert_eq!(
            serde_json::to_string(&ReviewDecision::Approve).unwrap(),
            r#"{"decision":"approve"}"#
        );
    }
}
