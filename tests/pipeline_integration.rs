//! End-to-end orchestration tests.
//!
//! Every external boundary (stage executors, critic, fixer, review channel)
//! is a scripted mock; runs live in the in-memory or file store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use reelforge::error::{CriticError, FixError, StageError};
use reelforge::pipeline::{
    Orchestrator, ReelforgeConfig, RetryPolicy, ReviewChannel, ReviewDecision, Run, RunErrorKind,
    RunStatus, StageExecutor, StageInput, StageKind, StageOutput, StageRegistry,
};
use reelforge::planning::ShotPlan;
use reelforge::quality::{
    Dimension, DimensionScores, FixFunction, Issue, IssueSeverity, PrioritizedIssue,
    QualityCritic, QualityReport, Recommendation, RefinementStatus,
};
use reelforge::storage::{FileRunStore, MemoryRunStore, RunStore};

/// Host stage that passes an upstream output (or the run source) through.
struct PassThrough {
    from: Option<StageKind>,
    cost: f64,
    calls: AtomicUsize,
}

impl PassThrough {
    fn source() -> Arc<Self> {
        Self::from(None, 0.0)
    }

    fn from(from: Option<StageKind>, cost: f64) -> Arc<Self> {
        Arc::new(Self {
            from,
            cost,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for PassThrough {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = match self.from {
            Some(stage) => input.upstream(stage).cloned().unwrap_or(Value::Null),
            None => input.source.clone(),
        };
        Ok(StageOutput::new(value).with_cost(self.cost))
    }
}

/// Host stage producing a fixed value after a number of failures.
struct Scripted {
    output: Value,
    cost: f64,
    failures: usize,
    fatal: bool,
    calls: AtomicUsize,
}

impl Scripted {
    fn ok(output: Value, cost: f64) -> Arc<Self> {
        Self::failing(output, cost, 0)
    }

    fn failing(output: Value, cost: f64, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            output,
            cost,
            failures,
            fatal: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn fatal() -> Arc<Self> {
        Arc::new(Self {
            output: Value::Null,
            cost: 0.0,
            failures: usize::MAX,
            fatal: true,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for Scripted {
    async fn execute(&self, _input: StageInput) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(StageError::Fatal("render farm rejected the job".to_string()));
        }
        if call < self.failures {
            return Err(StageError::Transient("connection reset".to_string()));
        }
        Ok(StageOutput::new(self.output.clone()).with_cost(self.cost))
    }
}

/// Critic returning scripted scores in order, repeating the last one.
struct ScriptedCritic {
    scores: Vec<f64>,
    calls: AtomicUsize,
}

impl ScriptedCritic {
    fn new(scores: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            scores: scores.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl QualityCritic<Value> for ScriptedCritic {
    async fn critique(&self, _artifact: &Value) -> Result<QualityReport, CriticError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let score = self.scores[call.min(self.scores.len() - 1)];
        Ok(QualityReport::new(
            score,
            DimensionScores::default(),
            vec![Issue::new(Dimension::HookStrength, IssueSeverity::Major, "slow open")
                .with_id("hook-1")],
            Recommendation::MajorRevision,
        ))
    }
}

/// Critic whose scripted calls either score or report the backend down.
///
/// `None` entries fail with `CriticError::Unavailable`; the last entry repeats.
struct FlakyCritic {
    script: Vec<Option<f64>>,
    calls: AtomicUsize,
}

impl FlakyCritic {
    fn new(script: &[Option<f64>]) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityCritic<Value> for FlakyCritic {
    async fn critique(&self, _artifact: &Value) -> Result<QualityReport, CriticError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script[call.min(self.script.len() - 1)] {
            Some(score) => Ok(QualityReport::new(
                score,
                DimensionScores::default(),
                vec![Issue::new(Dimension::Pacing, IssueSeverity::Major, "drags").with_id("pacing-1")],
                Recommendation::MajorRevision,
            )),
            None => Err(CriticError::Unavailable("connection reset".to_string())),
        }
    }
}

/// Bumps the artifact's `revision` field.
#[derive(Default)]
struct RevisionFixer {
    calls: AtomicUsize,
}

#[async_trait]
impl FixFunction<Value> for RevisionFixer {
    async fn apply_fixes(
        &self,
        artifact: &Value,
        _issues: &[PrioritizedIssue],
    ) -> Result<Value, FixError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let revision = artifact.get("revision").and_then(Value::as_u64).unwrap_or(0);
        Ok(json!({ "revision": revision + 1 }))
    }
}

#[derive(Default)]
struct RecordingReview {
    requested: Mutex<Vec<uuid::Uuid>>,
    /// Number of leading requests that fail transiently.
    failures: usize,
    calls: AtomicUsize,
}

impl RecordingReview {
    fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ReviewChannel for RecordingReview {
    async fn request_review(&self, run: &Run) -> Result<(), StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StageError::Transient("review queue unavailable".to_string()));
        }
        self.requested.lock().unwrap().push(run.id);
        Ok(())
    }
}

struct Host {
    ingest: Arc<PassThrough>,
    parse: Arc<PassThrough>,
    graph: Arc<Scripted>,
    generate: Arc<Scripted>,
    assemble: Arc<Scripted>,
    finalize: Arc<PassThrough>,
}

impl Host {
    fn new() -> Self {
        Self::with_generate(Scripted::ok(json!({"clips": 2}), 1.0))
    }

    fn with_generate(generate: Arc<Scripted>) -> Self {
        Self {
            ingest: PassThrough::source(),
            parse: PassThrough::from(Some(StageKind::Ingest), 0.0),
            graph: Scripted::ok(json!({"nodes": 2}), 0.0),
            generate,
            assemble: Scripted::ok(json!({"revision": 0}), 0.0),
            finalize: PassThrough::from(Some(StageKind::Refine), 0.0),
        }
    }

    fn registry(&self) -> StageRegistry {
        StageRegistry::new()
            .register(StageKind::Ingest, self.ingest.clone())
            .register(StageKind::Parse, self.parse.clone())
            .register(StageKind::Graph, self.graph.clone())
            .register(StageKind::Generate, self.generate.clone())
            .register(StageKind::Assemble, self.assemble.clone())
            .register(StageKind::Finalize, self.finalize.clone())
    }
}

fn story() -> Value {
    json!({
        "story_id": "lighthouse",
        "units": [
            {"id": "u1", "sequence": 1, "characters": ["ava"], "introduces": ["ava"]},
            {"id": "u2", "sequence": 2, "characters": ["ava"]}
        ]
    })
}

fn config(review: bool) -> ReelforgeConfig {
    let mut config = ReelforgeConfig::default();
    config.orchestrator = config
        .orchestrator
        .with_human_review(review)
        .with_auto_approve_threshold(9.5)
        .with_retry(RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 5,
        });
    config
}

fn orchestrator(
    config: ReelforgeConfig,
    store: Arc<dyn RunStore>,
    host: &Host,
    critic: Arc<ScriptedCritic>,
) -> Orchestrator {
    Orchestrator::new(config, store, host.registry(), critic)
        .unwrap()
        .with_fixer(Arc::new(RevisionFixer::default()))
}

#[tokio::test]
async fn test_full_pipeline_completes_without_review() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let orch = orchestrator(config(false), store.clone(), &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stage_outputs.len(), StageKind::ALL.len());
    assert!(run.current_stage.is_none());
    assert!(run.completed_at.is_some());
    assert_eq!(run.progress_percent(), 100.0);

    // generate 1.00 + critique stage 0.05 + refinement baseline 0.05
    assert!((run.ledger.spent() - 1.10).abs() < 1e-9);

    let plans: Vec<ShotPlan> =
        serde_json::from_value(run.output(StageKind::Plan).unwrap().clone()).unwrap();
    assert_eq!(plans.len(), 2);
    assert!(plans.iter().all(|p| p.within_tolerance() && !p.continuity_flagged));

    assert_eq!(run.refinements.len(), 1);
    assert_eq!(run.refinements[0].status, RefinementStatus::Converged);
    assert_eq!(run.output(StageKind::Review).unwrap()["decision"], "skipped");
    assert_eq!(run.output(StageKind::Finalize).unwrap()["artifact"]["revision"], 0);

    let stored = store.load(run.id).await.unwrap();
    assert_eq!(stored, run);
    assert!(!store.is_locked(run.id).await);
}

#[tokio::test]
async fn test_completed_stages_are_not_rerun_after_restart() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let first = orchestrator(config(false), store.clone(), &host, ScriptedCritic::new(&[8.0]));

    let run = first.create_run("lighthouse", story()).await.unwrap();
    for _ in 0..4 {
        first.advance(run.id).await.unwrap();
    }
    let partial = store.load(run.id).await.unwrap();
    assert_eq!(partial.current_stage, Some(StageKind::Plan));
    drop(first);

    let restarted = orchestrator(config(false), store.clone(), &host, ScriptedCritic::new(&[8.0]));
    let run = restarted.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(host.ingest.calls(), 1);
    assert_eq!(host.parse.calls(), 1);
    assert_eq!(host.graph.calls(), 1);
    assert_eq!(host.generate.calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::with_generate(Scripted::failing(json!({"clips": 2}), 1.0, 2));
    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(host.generate.calls(), 3);
    assert!(run.errors.iter().all(|e| e.kind != RunErrorKind::Transient));
}

#[tokio::test]
async fn test_exhausted_retries_fail_run() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::with_generate(Scripted::failing(Value::Null, 1.0, 10));
    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(host.generate.calls(), 4);
    let err = run.last_fatal_error().unwrap();
    assert_eq!(err.stage, Some(StageKind::Generate));
    assert_eq!(err.kind, RunErrorKind::Transient);
    assert!(!run.has_output(StageKind::Generate));
    assert_eq!(run.ledger.spent(), 0.0);
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::with_generate(Scripted::fatal());
    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_fatal_error().unwrap().kind, RunErrorKind::Fatal);

    let again = orch.drive(run.id).await.unwrap();
    assert_eq!(again.status, RunStatus::Failed);
    assert_eq!(host.generate.calls(), 1);
}

#[tokio::test]
async fn test_budget_pause_then_resume() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let mut cfg = config(false);
    cfg.orchestrator = cfg.orchestrator.with_budget_cap(1.0);
    let orch = orchestrator(cfg, store, &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    // Generation is projected at $4.00 against a $1.00 cap.
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.current_stage, Some(StageKind::Generate));
    assert_eq!(host.generate.calls(), 0);
    assert!(run.pause_reason.is_some());
    assert_eq!(run.errors.last().unwrap().kind, RunErrorKind::BudgetExceeded);

    // Paused runs stay put until the cap is raised.
    let still = orch.drive(run.id).await.unwrap();
    assert_eq!(still.status, RunStatus::Paused);

    let resumed = orch.resume_budget(run.id, 10.0).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(host.generate.calls(), 1);
    assert!(run.ledger.spent() <= run.ledger.cap());
}

#[tokio::test]
async fn test_continuity_violation_flags_plan_and_continues() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));

    let source = json!({
        "story_id": "lighthouse",
        "units": [
            {"id": "u1", "sequence": 1, "characters": ["ava"], "introduces": ["ava"]},
            {"id": "u2", "sequence": 2, "characters": ["ava", "ben"]},
            {"id": "u3", "sequence": 3, "characters": ["ava", "ben"], "introduces": ["ben"]}
        ]
    });
    let run = orch.create_run("lighthouse", source).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let violations: Vec<_> = run
        .errors
        .iter()
        .filter(|e| e.kind == RunErrorKind::Validation)
        .collect();
    assert_eq!(violations.len(), 1);
    assert!(violations[0].recoverable);
    assert_eq!(violations[0].stage, Some(StageKind::Continuity));
    assert!(violations[0].message.contains("critical"));

    let plans: Vec<ShotPlan> =
        serde_json::from_value(run.output(StageKind::Plan).unwrap().clone()).unwrap();
    let flagged: Vec<&str> = plans
        .iter()
        .filter(|p| p.continuity_flagged)
        .map(|p| p.unit_id.as_str())
        .collect();
    assert_eq!(flagged, vec!["u2"]);
}

#[tokio::test]
async fn test_malformed_parse_output_fails_continuity() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));

    let run = orch
        .create_run("lighthouse", json!({"units": "not a list"}))
        .await
        .unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let err = run.last_fatal_error().unwrap();
    assert_eq!(err.stage, Some(StageKind::Continuity));
    assert_eq!(err.kind, RunErrorKind::Validation);
    assert_eq!(host.generate.calls(), 0);
}

#[tokio::test]
async fn test_review_request_changes_reenters_refinement() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let review = Arc::new(RecordingReview::default());
    // critique stage, refine baseline, re-critique, then the second pass's
    // baseline and re-critique
    let critic = ScriptedCritic::new(&[6.0, 6.0, 7.2, 6.8, 7.6]);
    let orch = orchestrator(config(true), store.clone(), &host, critic)
        .with_review_channel(review.clone());

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::AwaitingReview);
    assert_eq!(run.current_stage, Some(StageKind::Review));
    assert_eq!(run.iterations.len(), 1);
    assert_eq!(run.refinements[0].status, RefinementStatus::Converged);
    assert_eq!(review.requested.lock().unwrap().len(), 1);

    // Awaiting review is not runnable.
    let idle = orch.drive(run.id).await.unwrap();
    assert_eq!(idle.status, RunStatus::AwaitingReview);

    let run = orch
        .resolve_review(
            run.id,
            ReviewDecision::RequestChanges {
                notes: "tighten the hook".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(!run.has_output(StageKind::Refine));
    assert_eq!(run.iterations.len(), 1);
    assert!(run.pass_iterations().is_empty());

    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::AwaitingReview);
    assert_eq!(run.refinements.len(), 2);
    assert_eq!(review.requested.lock().unwrap().len(), 2);

    // History is append-only; the second pass numbers on from the first.
    let numbers: Vec<u32> = run.iterations.iter().map(|i| i.number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(run.pass_iterations().len(), 1);
    assert_eq!(run.refinements[1].iterations_completed, 1);
    assert_eq!(run.refinements[1].iterations[0].number, 2);

    let run = orch
        .resolve_review(run.id, ReviewDecision::Approve)
        .await
        .unwrap();
    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.review_notes, vec!["tighten the hook".to_string()]);
    assert_eq!(run.output(StageKind::Review).unwrap()["decision"], "approved");
    assert_eq!(run.output(StageKind::Finalize).unwrap()["artifact"]["revision"], 2);

    let again = orch.resolve_review(run.id, ReviewDecision::Approve).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_review_reject_cancels_run() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let orch = orchestrator(config(true), store, &host, ScriptedCritic::new(&[6.0, 6.0, 7.2]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::AwaitingReview);

    let run = orch
        .resolve_review(
            run.id,
            ReviewDecision::Reject {
                reason: "off brand".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.errors.last().unwrap().message.contains("off brand"));

    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(host.finalize.calls(), 0);
}

#[tokio::test]
async fn test_high_score_auto_approves_review() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let orch = orchestrator(config(true), store, &host, ScriptedCritic::new(&[9.7]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let review = run.output(StageKind::Review).unwrap();
    assert_eq!(review["decision"], "auto_approved");
    assert_eq!(review["score"], 9.7);
}

#[tokio::test]
async fn test_refinement_without_progress_fails_run() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    // No fixer: the artifact can never change.
    let orch = Orchestrator::new(
        config(false),
        store.clone(),
        host.registry(),
        ScriptedCritic::new(&[5.0]),
    )
    .unwrap();

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let err = run.last_fatal_error().unwrap();
    assert_eq!(err.stage, Some(StageKind::Refine));
    assert_eq!(err.kind, RunErrorKind::NoProgress);
    assert_eq!(run.iterations.len(), 1);
    assert_eq!(run.refinements[0].status, RefinementStatus::Failed);
    assert_eq!(store.load(run.id).await.unwrap().iterations.len(), 1);
}

#[tokio::test]
async fn test_cancel_between_stages() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    orch.advance(run.id).await.unwrap();
    orch.advance(run.id).await.unwrap();

    let cancelled = orch.cancel(run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.errors.last().unwrap().kind, RunErrorKind::Cancelled);

    let run = orch.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(host.ingest.calls(), 1);
    assert_eq!(host.graph.calls(), 0);
}

#[tokio::test]
async fn test_file_store_resumes_across_orchestrators() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = Host::new();

    let run_id = {
        let store = Arc::new(FileRunStore::open(dir.path()).await.unwrap());
        let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));
        let run = orch.create_run("lighthouse", story()).await.unwrap();
        for _ in 0..6 {
            orch.advance(run.id).await.unwrap();
        }
        run.id
    };

    let store = Arc::new(FileRunStore::open(dir.path()).await.unwrap());
    let partial = store.load(run_id).await.unwrap();
    assert_eq!(partial.current_stage, Some(StageKind::Assemble));

    let orch = orchestrator(config(false), store, &host, ScriptedCritic::new(&[8.0]));
    let run = orch.drive(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(host.generate.calls(), 1);
    assert_eq!(orch.status(run_id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_critic_outage_during_refinement_is_retried() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let fixer = Arc::new(RevisionFixer::default());
    // critique stage, iteration 1 baseline and re-critique, an outage on the
    // iteration 2 baseline, then its retry and re-critique
    let critic = FlakyCritic::new(&[Some(6.0), Some(5.0), Some(6.0), None, Some(6.0), Some(7.5)]);
    let orch = Orchestrator::new(config(false), store.clone(), host.registry(), critic.clone())
        .unwrap()
        .with_fixer(fixer.clone());

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(critic.calls(), 6);
    assert!(run.errors.iter().all(|e| e.kind != RunErrorKind::Transient));
    assert!(run.errors.iter().all(|e| e.kind != RunErrorKind::Fatal));

    // The retry resumed from the checkpoint instead of repeating iteration 1.
    assert_eq!(fixer.calls.load(Ordering::SeqCst), 2);
    let numbers: Vec<u32> = run.iterations.iter().map(|i| i.number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(run.refinements.len(), 1);
    assert_eq!(run.refinements[0].status, RefinementStatus::Converged);
    assert_eq!(run.output(StageKind::Finalize).unwrap()["artifact"]["revision"], 2);
    assert!(!store.is_locked(run.id).await);
}

#[tokio::test]
async fn test_persistent_critic_outage_gives_up_as_transient() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let critic = FlakyCritic::new(&[Some(6.0), None]);
    let orch = Orchestrator::new(config(false), store, host.registry(), critic.clone())
        .unwrap()
        .with_fixer(Arc::new(RevisionFixer::default()));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    // critique stage plus four refine attempts
    assert_eq!(critic.calls(), 5);
    let err = run.last_fatal_error().unwrap();
    assert_eq!(err.stage, Some(StageKind::Refine));
    assert_eq!(err.kind, RunErrorKind::Transient);
    assert!(err.message.contains("gave up after 3 retries"));
}

#[tokio::test]
async fn test_review_request_outage_is_retried() {
    let store = Arc::new(MemoryRunStore::new());
    let host = Host::new();
    let review = Arc::new(RecordingReview::failing(2));
    let orch = orchestrator(config(true), store, &host, ScriptedCritic::new(&[6.0, 6.0, 7.2]))
        .with_review_channel(review.clone());

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    let run = orch.drive(run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::AwaitingReview);
    assert_eq!(review.calls.load(Ordering::SeqCst), 3);
    assert_eq!(review.requested.lock().unwrap().len(), 1);
    assert!(run.errors.iter().all(|e| e.kind != RunErrorKind::Transient));
}

#[tokio::test]
async fn test_abandoned_file_lock_expires_and_run_resumes() {
    let dir = tempfile::TempDir::new().unwrap();
    let host = Host::new();
    let store = Arc::new(
        FileRunStore::open(dir.path())
            .await
            .unwrap()
            .with_lock_ttl(Duration::from_millis(50)),
    );
    let orch = orchestrator(config(false), store.clone(), &host, ScriptedCritic::new(&[8.0]));

    let run = orch.create_run("lighthouse", story()).await.unwrap();
    orch.advance(run.id).await.unwrap();

    // A worker checks the run out and dies without releasing it.
    let crashed = store.acquire_lock(run.id).await.unwrap();
    drop(crashed);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let restarted = orchestrator(config(false), store.clone(), &host, ScriptedCritic::new(&[8.0]));
    let run = restarted.drive(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(host.ingest.calls(), 1);
    assert!(!dir.path().join(format!("{}.lock", run.id)).exists());
}
