//! The persisted run value.
//!
//! A [`Run`] carries everything needed to resume a story's pipeline: which
//! stages have produced output, the cost ledger, recorded errors and any
//! refinement iterations. It is passed into and returned from every
//! orchestrator step and round-trips through the store unchanged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::stages::StageKind;
use crate::ledger::{CostBreakdown, CostLedger};
use crate::quality::{RefinementIteration, RefinementResult};

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingReview,
    /// Stopped on budget; resumes only after the cap is raised.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingReview => "awaiting_review",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the orchestrator may execute stages in this status.
    pub fn is_runnable(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error taxonomy recorded on runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    Transient,
    Validation,
    BudgetExceeded,
    UnsatisfiableConstraints,
    NoProgress,
    MissingInput,
    Fatal,
    Cancelled,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunErrorKind::Transient => "transient",
            RunErrorKind::Validation => "validation",
            RunErrorKind::BudgetExceeded => "budget_exceeded",
            RunErrorKind::UnsatisfiableConstraints => "unsatisfiable_constraints",
            RunErrorKind::NoProgress => "no_progress",
            RunErrorKind::MissingInput => "missing_input",
            RunErrorKind::Fatal => "fatal",
            RunErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A typed failure recorded on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub stage: Option<StageKind>,
    pub kind: RunErrorKind,
    pub message: String,
    /// Recoverable errors are surfaced without stopping the run.
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "[{}] {}: {}", stage, self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// One pipeline execution for one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub story_id: String,
    pub status: RunStatus,
    /// Next stage to execute, or the stage the run stopped in.
    pub current_stage: Option<StageKind>,
    /// The document handed to the first stage.
    pub source: Value,
    pub stage_outputs: BTreeMap<StageKind, Value>,
    pub ledger: CostLedger,
    pub errors: Vec<RunError>,
    /// Every refinement iteration across all refine passes, oldest first.
    pub iterations: Vec<RefinementIteration>,
    /// Index into `iterations` where the current refine pass starts.
    #[serde(default)]
    pub refine_pass_start: usize,
    /// Latest refined artifact, for resuming mid-refinement.
    pub refinement_checkpoint: Option<Value>,
    /// Results of finished refine passes, oldest first.
    pub refinements: Vec<RefinementResult>,
    pub review_notes: Vec<String>,
    pub pause_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(story_id: impl Into<String>, source: Value, budget_cap: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            story_id: story_id.into(),
            status: RunStatus::Pending,
            current_stage: Some(StageKind::Ingest),
            source,
            stage_outputs: BTreeMap::new(),
            ledger: CostLedger::new(budget_cap),
            errors: Vec::new(),
            iterations: Vec::new(),
            refine_pass_start: 0,
            refinement_checkpoint: None,
            refinements: Vec::new(),
            review_notes: Vec::new(),
            pause_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Iterations recorded by the current refine pass.
    pub fn pass_iterations(&self) -> &[RefinementIteration] {
        &self.iterations[self.refine_pass_start.min(self.iterations.len())..]
    }

    /// Start a new refine pass after the iterations recorded so far.
    pub fn begin_refine_pass(&mut self) {
        self.refine_pass_start = self.iterations.len();
    }

    /// First stage in order that has no recorded output.
    pub fn next_stage(&self) -> Option<StageKind> {
        StageKind::ALL
            .iter()
            .copied()
            .find(|stage| !self.stage_outputs.contains_key(stage))
    }

    pub fn output(&self, stage: StageKind) -> Option<&Value> {
        self.stage_outputs.get(&stage)
    }

    pub fn has_output(&self, stage: StageKind) -> bool {
        self.stage_outputs.contains_key(&stage)
    }

    /// Share of stages with recorded output, 0-100.
    pub fn progress_percent(&self) -> f64 {
        let done = StageKind::ALL
            .iter()
            .filter(|stage| self.stage_outputs.contains_key(stage))
            .count();
        done as f64 / StageKind::ALL.len() as f64 * 100.0
    }

    pub fn record_error(
        &mut self,
        stage: Option<StageKind>,
        kind: RunErrorKind,
        message: impl Into<String>,
        recoverable: bool,
    ) {
        self.errors.push(RunError {
            stage,
            kind,
            message: message.into(),
            recoverable,
            timestamp: Utc::now(),
        });
        self.touch();
    }

    /// Most recent non-recoverable error.
    pub fn last_fatal_error(&self) -> Option<&RunError> {
        self.errors.iter().rev().find(|e| !e.recoverable)
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            story_id: self.story_id.clone(),
            status: self.status,
            current_stage: self.current_stage,
            completed_stages: self.stage_outputs.len(),
            progress_percent: self.progress_percent(),
            cost: self.ledger.breakdown(),
            error_count: self.errors.len(),
            last_error: self.last_fatal_error().map(|e| e.to_string()),
            iterations: self.iterations.len(),
            pause_reason: self.pause_reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Compact view of a run for logs and status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub story_id: String,
    pub status: RunStatus,
    pub current_stage: Option<StageKind>,
    pub completed_stages: usize,
    pub progress_percent: f64,
    pub cost: CostBreakdown,
    pub error_count: usize,
    pub last_error: Option<String>,
    pub iterations: usize,
    pub pause_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} ({}) {} at {} [{:.0}%], spent ${:.2} of ${:.2}",
            self.id,
            self.story_id,
            self.status,
            self.current_stage.map(|s| s.as_str()).unwrap_or("end"),
            self.progress_percent,
            self.cost.total,
            self.cost.cap
        )?;
        if let Some(reason) = &self.pause_reason {
            write!(f, ", paused: {}", reason)?;
        }
        if let Some(error) = &self.last_error {
            write!(f, ", last error: {}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CostCategory;
    use serde_json::json;

    #[test]
    fn test_new_run() {
        let run = Run::new("story-1", json!({"text": "Once"}), 25.0);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.next_stage(), Some(StageKind::Ingest));
        assert_eq!(run.progress_percent(), 0.0);
        assert_eq!(run.ledger.cap(), 25.0);
    }

    #[test]
    fn test_next_stage_skips_completed() {
        let mut run = Run::new("story-1", Value::Null, 10.0);
        run.stage_outputs.insert(StageKind::Ingest, json!({}));
        run.stage_outputs.insert(StageKind::Parse, json!({}));
        assert_eq!(run.next_stage(), Some(StageKind::Graph));

        for stage in StageKind::ALL {
            run.stage_outputs.insert(stage, json!(null));
        }
        assert_eq!(run.next_stage(), None);
        assert_eq!(run.progress_percent(), 100.0);
    }

    #[test]
    fn test_terminal_status_sets_completion() {
        let mut run = Run::new("story-1", Value::Null, 10.0);
        run.set_status(RunStatus::Running);
        assert!(run.completed_at.is_none());
        run.set_status(RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn test_summary_reports_last_fatal_error() {
        let mut run = Run::new("story-1", Value::Null, 10.0);
        run.record_error(
            Some(StageKind::Continuity),
            RunErrorKind::Validation,
            "unit 2 references mara",
            true,
        );
        run.record_error(Some(StageKind::Generate), RunErrorKind::Fatal, "bad prompt", false);

        let summary = run.summary();
        assert_eq!(summary.error_count, 2);
        assert_eq!(
            summary.last_error.as_deref(),
            Some("[generate] fatal: bad prompt")
        );
        assert!(summary.to_string().contains("story-1"));
    }

    #[test]
    fn test_run_round_trips_through_json() {
        let mut run = Run::new("story-1", json!({"text": "Once"}), 10.0);
        run.stage_outputs.insert(StageKind::Ingest, json!({"bytes": 4}));
        run.ledger.charge(CostCategory::Llm, 0.25, "parse").unwrap();
        run.record_error(None, RunErrorKind::Transient, "timeout", true);
        run.pause_reason = Some("budget".to_string());

        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
