//! Stage orchestrator.
//!
//! Advances runs one stage at a time under the store's per-run lock:
//! - Stages run in fixed order; a stage with recorded output is never re-run
//! - Projected stage cost is checked against the run ledger before execution
//! - Transient failures are retried with backoff, releasing the lock between
//!   attempts so cancellation can land. This covers host stages, the critic
//!   and fix calls inside refinement, and review requests
//! - Every outcome is persisted before the next stage starts, through
//!   lock-fenced writes that fail once the lease has passed to another worker
//!
//! Continuity, plan, refine and review are built in; the critique stage
//! falls back to the orchestrator's critic when no executor is registered.
//! All other stages come from the [`StageRegistry`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{OrchestratorConfig, ReelforgeConfig};
use super::review::{LogReviewChannel, ReviewChannel, ReviewDecision};
use super::run::{Run, RunErrorKind, RunStatus, RunSummary};
use super::stages::{CritiqueStage, StageExecutor, StageInput, StageKind, StageOutput, StageRegistry};
use crate::error::{
    ConfigError, LedgerError, PipelineError, PipelineResult, PlanningError, RefinementError,
    StageError, StoreError,
};
use crate::ledger::CostLedger;
use crate::metrics::MetricsCollector;
use crate::narrative::{validate_sequence, Canon, NarrativeUnit, ParsedNarrative, SequenceValidation};
use crate::planning::{plan_sequence, PlannerConfig};
use crate::quality::{
    FixFunction, IterationSink, QualityCritic, RefinementConfig, RefinementFailure,
    RefinementIteration, RefinementLoop, RefinementOutcome, RefinementResult, RefinementStatus,
};
use crate::storage::{LockToken, RunStore};

/// Result of executing one stage.
enum StepOutcome {
    /// The stage produced output to record.
    Output(StageOutput),
    /// The stage changed the run's status itself and produced nothing.
    Halted,
}

/// Output recorded for the review stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// `skipped`, `auto_approved` or `approved`.
    pub decision: String,
    pub score: Option<f64>,
    pub notes: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Drives runs through the pipeline.
pub struct Orchestrator {
    config: OrchestratorConfig,
    planner: PlannerConfig,
    refinement: RefinementConfig,
    store: Arc<dyn RunStore>,
    registry: StageRegistry,
    critic: Arc<dyn QualityCritic<Value>>,
    fixer: Option<Arc<dyn FixFunction<Value>>>,
    review: Arc<dyn ReviewChannel>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Creates an orchestrator after validating `config`.
    pub fn new(
        config: ReelforgeConfig,
        store: Arc<dyn RunStore>,
        registry: StageRegistry,
        critic: Arc<dyn QualityCritic<Value>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: config.orchestrator,
            planner: config.planner,
            refinement: config.refinement,
            store,
            registry,
            critic,
            fixer: None,
            review: Arc::new(LogReviewChannel),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn with_fixer(mut self, fixer: Arc<dyn FixFunction<Value>>) -> Self {
        self.fixer = Some(fixer);
        self
    }

    pub fn with_review_channel(mut self, channel: Arc<dyn ReviewChannel>) -> Self {
        self.review = channel;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Create and persist a new pending run.
    pub async fn create_run(
        &self,
        story_id: impl Into<String>,
        source: Value,
    ) -> PipelineResult<Run> {
        let run = Run::new(story_id, source, self.config.budget_cap_dollars);
        self.store.save(&run).await?;
        info!(
            run_id = %run.id,
            story_id = %run.story_id,
            budget = self.config.budget_cap_dollars,
            "Run created"
        );
        Ok(run)
    }

    pub async fn status(&self, run_id: Uuid) -> PipelineResult<RunSummary> {
        Ok(self.store.load(run_id).await?.summary())
    }

    /// Execute the next stage of a run under its lock.
    ///
    /// Runs that are paused, awaiting review or terminal are returned
    /// unchanged.
    pub async fn advance(&self, run_id: Uuid) -> PipelineResult<Run> {
        let mut token = Some(self.lock(run_id).await?);
        let result = self.advance_locked(run_id, &mut token).await;
        self.unlock(token, result).await
    }

    /// Advance until the run stops being runnable.
    ///
    /// The lock is released between stages.
    pub async fn drive(&self, run_id: Uuid) -> PipelineResult<Run> {
        loop {
            let run = self.advance(run_id).await?;
            if !run.status.is_runnable() {
                info!(summary = %run.summary(), "Run stopped");
                return Ok(run);
            }
        }
    }

    /// Apply a reviewer's decision to a run awaiting review.
    pub async fn resolve_review(
        &self,
        run_id: Uuid,
        decision: ReviewDecision,
    ) -> PipelineResult<Run> {
        let token = self.lock(run_id).await?;
        let result = self.resolve_review_locked(run_id, decision, &token).await;
        self.unlock(Some(token), result).await
    }

    /// Cancel a run.
    ///
    /// If another worker holds the run, a cancellation request is persisted
    /// and honored at that worker's next stage or iteration boundary.
    pub async fn cancel(&self, run_id: Uuid) -> PipelineResult<Run> {
        match self.store.acquire_lock(run_id).await {
            Ok(token) => {
                let result = self.cancel_locked(run_id, &token).await;
                self.unlock(Some(token), result).await
            }
            Err(StoreError::Locked(_)) => {
                self.store.request_cancel(run_id).await?;
                info!(run_id = %run_id, "Run busy, cancellation requested");
                Ok(self.store.load(run_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Raise a run's budget cap; a budget-paused run becomes runnable again.
    pub async fn resume_budget(&self, run_id: Uuid, new_cap: f64) -> PipelineResult<Run> {
        let token = self.lock(run_id).await?;
        let result = self.resume_budget_locked(run_id, new_cap, &token).await;
        self.unlock(Some(token), result).await
    }

    async fn lock(&self, run_id: Uuid) -> PipelineResult<LockToken> {
        let deadline = Instant::now() + self.config.lock_wait();
        loop {
            match self.store.acquire_lock(run_id).await {
                Ok(token) => return Ok(token),
                Err(StoreError::Locked(_)) if Instant::now() < deadline => {
                    sleep(self.config.lock_poll_interval()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn unlock<T>(
        &self,
        token: Option<LockToken>,
        result: PipelineResult<T>,
    ) -> PipelineResult<T> {
        let released = match token {
            Some(token) => self.store.release_lock(token).await,
            None => Ok(()),
        };
        let value = result?;
        released?;
        Ok(value)
    }

    /// Write a run, fenced by `token` when the lock is held.
    async fn persist(&self, run: &Run, token: Option<&LockToken>) -> PipelineResult<()> {
        match token {
            Some(token) => self.store.save_locked(run, token).await?,
            None => self.store.save(run).await?,
        }
        Ok(())
    }

    /// Record a transient failure, then persist the run and release its lock
    /// for the backoff delay before re-taking it and reloading.
    ///
    /// Returns false when the run no longer needs `stage` once reloaded.
    async fn back_off(
        &self,
        run: &mut Run,
        stage: StageKind,
        retry: u32,
        error: &str,
        elapsed: f64,
        token: &mut Option<LockToken>,
    ) -> PipelineResult<bool> {
        let delay = self.config.retry.backoff_duration(retry);
        self.metrics.record_stage(stage.as_str(), "transient", elapsed);
        self.metrics.record_retry(stage.as_str());
        warn!(
            run_id = %run.id,
            stage = %stage,
            retry = retry,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient stage failure, retrying"
        );

        self.persist(run, token.as_ref()).await?;
        if let Some(held) = token.take() {
            self.store.release_lock(held).await?;
        }
        sleep(delay).await;
        *token = Some(self.lock(run.id).await?);
        *run = self.store.load(run.id).await?;

        if self.honor_cancel(run, token.as_ref()).await? || !run.status.is_runnable() {
            return Ok(false);
        }
        Ok(run.next_stage() == Some(stage))
    }

    async fn advance_locked(
        &self,
        run_id: Uuid,
        token: &mut Option<LockToken>,
    ) -> PipelineResult<Run> {
        let mut run = self.store.load(run_id).await?;
        if self.honor_cancel(&mut run, token.as_ref()).await? {
            return Ok(run);
        }
        if !run.status.is_runnable() {
            debug!(run_id = %run.id, status = %run.status, "Run not runnable, nothing to do");
            return Ok(run);
        }
        if run.status == RunStatus::Pending {
            run.set_status(RunStatus::Running);
        }

        let Some(stage) = run.next_stage() else {
            self.complete(&mut run);
            self.persist(&run, token.as_ref()).await?;
            return Ok(run);
        };
        run.current_stage = Some(stage);

        if let Some(missing) = stage.dependencies().iter().find(|dep| !run.has_output(**dep)) {
            let err = PipelineError::MissingInput {
                stage: stage.to_string(),
                required: missing.to_string(),
            };
            self.fail(&mut run, stage, RunErrorKind::MissingInput, err.to_string());
            self.persist(&run, token.as_ref()).await?;
            return Ok(run);
        }

        let estimate = self.config.estimate_for(stage);
        if !run.ledger.can_afford(estimate) {
            let reason = format!(
                "stage '{}' needs ${:.2}, ${:.2} of ${:.2} remaining",
                stage,
                estimate,
                run.ledger.remaining(),
                run.ledger.cap()
            );
            self.pause_for_budget(&mut run, stage, reason);
            self.persist(&run, token.as_ref()).await?;
            return Ok(run);
        }

        debug!(run_id = %run.id, stage = %stage, "Executing stage");
        let started = Instant::now();
        let outcome = match stage {
            StageKind::Continuity => self.run_continuity(&mut run),
            StageKind::Plan => self.run_plan(&mut run),
            StageKind::Refine => self.run_refine(&mut run, token).await?,
            StageKind::Review => self.run_review(&mut run, token).await?,
            _ => self.run_executor(&mut run, stage, token).await?,
        };
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            StepOutcome::Output(output) => {
                if self.store.cancel_requested(run.id).await? && !run.status.is_terminal() {
                    self.mark_cancelled(&mut run, "cancelled during stage; output discarded");
                } else {
                    self.record_output(&mut run, stage, output, elapsed);
                }
            }
            StepOutcome::Halted => {
                self.metrics.record_stage(stage.as_str(), run.status.as_str(), elapsed);
            }
        }

        self.persist(&run, token.as_ref()).await?;
        Ok(run)
    }

    fn record_output(&self, run: &mut Run, stage: StageKind, output: StageOutput, elapsed: f64) {
        if let Err(e) = run
            .ledger
            .charge(stage.cost_category(), output.cost, format!("stage {}", stage))
        {
            match e {
                LedgerError::BudgetExceeded { .. } => self.pause_for_budget(run, stage, e.to_string()),
                LedgerError::InvalidAmount(_) => {
                    self.fail(run, stage, RunErrorKind::Fatal, e.to_string())
                }
            }
            return;
        }

        run.stage_outputs.insert(stage, output.value);
        run.current_stage = run.next_stage();
        run.touch();
        self.metrics.record_stage(stage.as_str(), "success", elapsed);
        info!(
            run_id = %run.id,
            stage = %stage,
            cost = output.cost,
            spent = run.ledger.spent(),
            elapsed_secs = elapsed,
            "Stage completed"
        );

        if run.current_stage.is_none() {
            self.complete(run);
        }
    }

    fn executor_for(&self, stage: StageKind) -> Option<Arc<dyn StageExecutor>> {
        match self.registry.get(stage) {
            Some(executor) => Some(executor),
            None if stage == StageKind::Critique => Some(Arc::new(CritiqueStage::new(
                Arc::clone(&self.critic),
                self.refinement.cost_per_critique,
            ))),
            None => None,
        }
    }

    fn stage_input(&self, run: &Run, stage: StageKind, attempt: u32) -> StageInput {
        StageInput {
            run_id: run.id,
            story_id: run.story_id.clone(),
            stage,
            attempt,
            source: run.source.clone(),
            upstream: stage
                .dependencies()
                .iter()
                .filter_map(|dep| run.output(*dep).map(|v| (*dep, v.clone())))
                .collect(),
        }
    }

    async fn run_executor(
        &self,
        run: &mut Run,
        stage: StageKind,
        token: &mut Option<LockToken>,
    ) -> PipelineResult<StepOutcome> {
        let Some(executor) = self.executor_for(stage) else {
            self.fail(
                run,
                stage,
                RunErrorKind::Fatal,
                format!("no executor registered for stage '{}'", stage),
            );
            return Ok(StepOutcome::Halted);
        };

        let timeout = self.config.stage_timeout();
        let policy = &self.config.retry;
        let mut retries = 0u32;

        loop {
            let input = self.stage_input(run, stage, retries + 1);
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, executor.execute(input)).await {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout(timeout)),
            };
            let elapsed = started.elapsed().as_secs_f64();

            let err = match result {
                Ok(output) => return Ok(StepOutcome::Output(output)),
                Err(err) => err,
            };

            if err.is_transient() && policy.should_retry(retries) {
                retries += 1;
                if !self
                    .back_off(run, stage, retries, &err.to_string(), elapsed, token)
                    .await?
                {
                    return Ok(StepOutcome::Halted);
                }
                continue;
            }

            let (kind, message) = if err.is_transient() {
                (
                    RunErrorKind::Transient,
                    format!("{} (gave up after {} retries)", err, retries),
                )
            } else {
                (RunErrorKind::Fatal, err.to_string())
            };
            self.fail(run, stage, kind, message);
            return Ok(StepOutcome::Halted);
        }
    }

    fn run_continuity(&self, run: &mut Run) -> StepOutcome {
        let stage = StageKind::Continuity;
        let parsed: ParsedNarrative = match self.upstream_as(run, StageKind::Parse) {
            Ok(parsed) => parsed,
            Err(message) => {
                self.fail(run, stage, RunErrorKind::Validation, message);
                return StepOutcome::Halted;
            }
        };

        let validation = match validate_sequence(&parsed.units, Canon::new()) {
            Ok(validation) => validation,
            Err(e) => {
                self.fail(run, stage, RunErrorKind::Validation, e.to_string());
                return StepOutcome::Halted;
            }
        };

        let violations: Vec<String> = validation
            .violations()
            .map(|v| format!("[{}] unit '{}': {}", v.severity, v.unit_id, v.message))
            .collect();
        if !violations.is_empty() {
            warn!(
                run_id = %run.id,
                violations = violations.len(),
                flagged = ?validation.flagged_units(),
                mean_score = validation.mean_score(),
                "Continuity violations found"
            );
        }
        for message in violations {
            run.record_error(Some(stage), RunErrorKind::Validation, message, true);
        }

        self.output_of(run, stage, &validation)
    }

    fn run_plan(&self, run: &mut Run) -> StepOutcome {
        let stage = StageKind::Plan;
        let validation: SequenceValidation = match self.upstream_as(run, StageKind::Continuity) {
            Ok(validation) => validation,
            Err(message) => {
                self.fail(run, stage, RunErrorKind::Validation, message);
                return StepOutcome::Halted;
            }
        };

        let units: Vec<NarrativeUnit> = validation.units.iter().map(|v| v.unit.clone()).collect();
        let mut plans = match plan_sequence(&units, &self.planner) {
            Ok(plans) => plans,
            Err(e) => {
                let kind = match e {
                    PlanningError::UnsatisfiableConstraints { .. } => {
                        RunErrorKind::UnsatisfiableConstraints
                    }
                    PlanningError::InvalidConstraint { .. } | PlanningError::OutOfOrder(_) => {
                        RunErrorKind::Validation
                    }
                    _ => RunErrorKind::Fatal,
                };
                self.fail(run, stage, kind, e.to_string());
                return StepOutcome::Halted;
            }
        };

        for (plan, validated) in plans.iter_mut().zip(&validation.units) {
            plan.continuity_flagged = validated.overlay.flagged_for_correction;
        }
        self.output_of(run, stage, &plans)
    }

    async fn run_refine(
        &self,
        run: &mut Run,
        token: &mut Option<LockToken>,
    ) -> PipelineResult<StepOutcome> {
        let stage = StageKind::Refine;
        let policy = &self.config.retry;
        let mut retries = 0u32;

        loop {
            let Some(artifact) = run
                .refinement_checkpoint
                .clone()
                .or_else(|| run.output(StageKind::Assemble).cloned())
            else {
                self.fail(run, stage, RunErrorKind::MissingInput, "no artifact to refine");
                return Ok(StepOutcome::Halted);
            };

            let started = Instant::now();
            let outcome = self.refine_pass(run, artifact, token.as_ref()).await;

            if self.store.cancel_requested(run.id).await? {
                self.mark_cancelled(run, "cancelled during refinement");
                return Ok(StepOutcome::Halted);
            }

            let result = &outcome.result;
            if result.status == RefinementStatus::Failed
                && result.transient
                && policy.should_retry(retries)
            {
                retries += 1;
                let error = result.errors.last().cloned().unwrap_or_default();
                let elapsed = started.elapsed().as_secs_f64();
                if !self.back_off(run, stage, retries, &error, elapsed, token).await? {
                    return Ok(StepOutcome::Halted);
                }
                continue;
            }

            return self.finish_refine(run, outcome, retries);
        }
    }

    /// Run or resume the current refine pass, checkpointing each iteration.
    async fn refine_pass(
        &self,
        run: &mut Run,
        artifact: Value,
        token: Option<&LockToken>,
    ) -> RefinementOutcome<Value> {
        let prior = run.pass_iterations().to_vec();
        let first_number = run.iterations.last().map(|i| i.number + 1).unwrap_or(1);
        let sink = RunCheckpoint {
            store: Arc::clone(&self.store),
            token: token.cloned(),
            run: Mutex::new(run.clone()),
        };
        let mut ledger = run.ledger.clone();

        let mut refinement = RefinementLoop::new(self.refinement.clone(), &*self.critic)
            .with_sink(&sink)
            .numbered_from(first_number);
        if let Some(fixer) = &self.fixer {
            refinement = refinement.with_fixer(&**fixer);
        }
        let outcome = if prior.is_empty() {
            refinement.run(artifact, &mut ledger).await
        } else {
            info!(run_id = %run.id, resumed = prior.len(), "Resuming refinement");
            refinement.run_resuming(artifact, prior, &mut ledger).await
        };

        *run = sink.run.into_inner();
        run.ledger = ledger;
        outcome
    }

    fn finish_refine(
        &self,
        run: &mut Run,
        outcome: RefinementOutcome<Value>,
        retries: u32,
    ) -> PipelineResult<StepOutcome> {
        let stage = StageKind::Refine;
        let result: RefinementResult = outcome.result;
        match result.status {
            RefinementStatus::Failed => {
                let kind = match result.failure {
                    Some(RefinementFailure::NoProgress) => RunErrorKind::NoProgress,
                    Some(RefinementFailure::Budget) => RunErrorKind::BudgetExceeded,
                    _ if result.transient => RunErrorKind::Transient,
                    _ => RunErrorKind::Fatal,
                };
                let mut message = result
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "refinement failed".to_string());
                if kind == RunErrorKind::Transient {
                    message = format!("{} (gave up after {} retries)", message, retries);
                }
                run.refinements.push(result);
                self.fail(run, stage, kind, message);
                Ok(StepOutcome::Halted)
            }
            RefinementStatus::BudgetExceeded
                if !run.ledger.can_afford(self.refinement.round_cost()) =>
            {
                let reason = result
                    .stop_reason
                    .clone()
                    .unwrap_or_else(|| "run budget exhausted during refinement".to_string());
                self.pause_for_budget(run, stage, reason);
                Ok(StepOutcome::Halted)
            }
            _ => {
                let mut output = serde_json::Map::new();
                output.insert("artifact".to_string(), outcome.artifact.clone());
                output.insert("result".to_string(), serde_json::to_value(&result)?);
                run.refinement_checkpoint = Some(outcome.artifact);
                run.refinements.push(result);
                Ok(StepOutcome::Output(StageOutput::new(Value::Object(output))))
            }
        }
    }

    async fn run_review(
        &self,
        run: &mut Run,
        token: &mut Option<LockToken>,
    ) -> PipelineResult<StepOutcome> {
        let stage = StageKind::Review;
        let score = latest_score(run);

        if !self.config.require_human_review {
            let record = review_record("skipped", score, run);
            return Ok(self.output_of(run, stage, &record));
        }

        if let Some(score) = score {
            if score >= self.config.auto_approve_threshold {
                info!(run_id = %run.id, score = score, "Review auto-approved");
                let record = review_record("auto_approved", Some(score), run);
                return Ok(self.output_of(run, stage, &record));
            }
        }

        let timeout = self.config.stage_timeout();
        let policy = &self.config.retry;
        let mut retries = 0u32;

        loop {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, self.review.request_review(run)).await
            {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout(timeout)),
            };

            let err = match result {
                Ok(()) => {
                    run.set_status(RunStatus::AwaitingReview);
                    self.metrics.record_run_status(RunStatus::AwaitingReview.as_str());
                    info!(run_id = %run.id, score = ?score, "Run awaiting review");
                    return Ok(StepOutcome::Halted);
                }
                Err(err) => err,
            };

            if err.is_transient() && policy.should_retry(retries) {
                retries += 1;
                let elapsed = started.elapsed().as_secs_f64();
                if !self
                    .back_off(run, stage, retries, &err.to_string(), elapsed, token)
                    .await?
                {
                    return Ok(StepOutcome::Halted);
                }
                continue;
            }

            let (kind, message) = if err.is_transient() {
                (
                    RunErrorKind::Transient,
                    format!("review request failed: {} (gave up after {} retries)", err, retries),
                )
            } else {
                (RunErrorKind::Fatal, format!("review request failed: {}", err))
            };
            self.fail(run, stage, kind, message);
            return Ok(StepOutcome::Halted);
        }
    }

    async fn resolve_review_locked(
        &self,
        run_id: Uuid,
        decision: ReviewDecision,
        token: &LockToken,
    ) -> PipelineResult<Run> {
        let mut run = self.store.load(run_id).await?;
        if run.status != RunStatus::AwaitingReview {
            return Err(PipelineError::ReviewNotPending(run_id));
        }

        match decision {
            ReviewDecision::Approve => {
                let record = review_record("approved", latest_score(&run), &run);
                run.stage_outputs
                    .insert(StageKind::Review, serde_json::to_value(&record)?);
                run.current_stage = run.next_stage();
                run.set_status(RunStatus::Running);
                info!(run_id = %run.id, "Review approved");
            }
            ReviewDecision::RequestChanges { notes } => {
                info!(run_id = %run.id, notes = %notes, "Review requested changes");
                run.review_notes.push(notes);
                run.stage_outputs.remove(&StageKind::Refine);
                run.begin_refine_pass();
                run.current_stage = Some(StageKind::Refine);
                run.set_status(RunStatus::Running);
            }
            ReviewDecision::Reject { reason } => {
                self.mark_cancelled(&mut run, format!("rejected in review: {}", reason));
            }
        }

        self.persist(&run, Some(token)).await?;
        Ok(run)
    }

    async fn cancel_locked(&self, run_id: Uuid, token: &LockToken) -> PipelineResult<Run> {
        let mut run = self.store.load(run_id).await?;
        if run.status.is_terminal() {
            return Err(PipelineError::InvalidState(format!(
                "run {} is already {}",
                run_id, run.status
            )));
        }
        self.mark_cancelled(&mut run, "cancelled by request");
        self.persist(&run, Some(token)).await?;
        Ok(run)
    }

    async fn resume_budget_locked(
        &self,
        run_id: Uuid,
        new_cap: f64,
        token: &LockToken,
    ) -> PipelineResult<Run> {
        let mut run = self.store.load(run_id).await?;
        run.ledger.raise_cap(new_cap)?;
        if run.status == RunStatus::Paused {
            run.pause_reason = None;
            run.set_status(RunStatus::Running);
            info!(run_id = %run.id, cap = new_cap, "Budget raised, run resumed");
        } else {
            run.touch();
            info!(run_id = %run.id, cap = new_cap, status = %run.status, "Budget raised");
        }
        self.persist(&run, Some(token)).await?;
        Ok(run)
    }

    /// Cancel the run if a cancellation request is pending. Returns whether
    /// the run is now cancelled.
    async fn honor_cancel(&self, run: &mut Run, token: Option<&LockToken>) -> PipelineResult<bool> {
        if run.status == RunStatus::Cancelled {
            return Ok(true);
        }
        if run.status.is_terminal() || !self.store.cancel_requested(run.id).await? {
            return Ok(false);
        }
        self.mark_cancelled(run, "cancellation requested");
        self.persist(run, token).await?;
        Ok(true)
    }

    fn upstream_as<T: serde::de::DeserializeOwned>(
        &self,
        run: &Run,
        stage: StageKind,
    ) -> Result<T, String> {
        let value = run
            .output(stage)
            .ok_or_else(|| format!("output of '{}' is missing", stage))?;
        serde_json::from_value(value.clone())
            .map_err(|e| format!("output of '{}' is malformed: {}", stage, e))
    }

    fn output_of<T: Serialize>(&self, run: &mut Run, stage: StageKind, value: &T) -> StepOutcome {
        match serde_json::to_value(value) {
            Ok(value) => StepOutcome::Output(StageOutput::new(value)),
            Err(e) => {
                self.fail(run, stage, RunErrorKind::Fatal, e.to_string());
                StepOutcome::Halted
            }
        }
    }

    fn fail(&self, run: &mut Run, stage: StageKind, kind: RunErrorKind, message: impl Into<String>) {
        let message = message.into();
        error!(run_id = %run.id, stage = %stage, kind = %kind, error = %message, "Run failed");
        run.record_error(Some(stage), kind, message, false);
        run.set_status(RunStatus::Failed);
        self.metrics.record_run_status(RunStatus::Failed.as_str());
    }

    fn pause_for_budget(&self, run: &mut Run, stage: StageKind, reason: String) {
        warn!(run_id = %run.id, stage = %stage, reason = %reason, "Run paused on budget");
        run.record_error(Some(stage), RunErrorKind::BudgetExceeded, reason.clone(), true);
        run.pause_reason = Some(reason);
        run.set_status(RunStatus::Paused);
        self.metrics.record_run_status(RunStatus::Paused.as_str());
    }

    fn mark_cancelled(&self, run: &mut Run, reason: impl Into<String>) {
        let reason = reason.into();
        info!(run_id = %run.id, reason = %reason, "Run cancelled");
        run.record_error(run.current_stage, RunErrorKind::Cancelled, reason, false);
        run.set_status(RunStatus::Cancelled);
        self.metrics.record_run_status(RunStatus::Cancelled.as_str());
    }

    fn complete(&self, run: &mut Run) {
        run.current_stage = None;
        run.set_status(RunStatus::Completed);
        self.metrics.record_run_status(RunStatus::Completed.as_str());
        info!(summary = %run.summary(), "Run completed");
    }
}

/// Most recent quality score: the last refinement's, else the critique's.
fn latest_score(run: &Run) -> Option<f64> {
    run.refinements
        .last()
        .and_then(|r| r.final_score)
        .or_else(|| {
            run.output(StageKind::Critique)
                .and_then(|critique| critique.get("overall_score"))
                .and_then(Value::as_f64)
        })
}

fn review_record(decision: &str, score: Option<f64>, run: &Run) -> ReviewRecord {
    ReviewRecord {
        decision: decision.to_string(),
        score,
        notes: run.review_notes.clone(),
        reviewed_at: Utc::now(),
    }
}

/// Persists each refinement iteration onto the run before the next starts.
///
/// Writes are fenced by the lock token and renew its lease.
struct RunCheckpoint {
    store: Arc<dyn RunStore>,
    token: Option<LockToken>,
    run: Mutex<Run>,
}

#[async_trait]
impl IterationSink<Value> for RunCheckpoint {
    async fn record(
        &self,
        iteration: &RefinementIteration,
        artifact: &Value,
        ledger: &CostLedger,
    ) -> Result<(), RefinementError> {
        let mut run = self.run.lock().await;
        if self.store.cancel_requested(run.id).await? {
            return Err(RefinementError::Checkpoint {
                message: "run cancelled".to_string(),
                transient: false,
            });
        }

        run.iterations.push(iteration.clone());
        run.refinement_checkpoint = Some(artifact.clone());
        run.ledger = ledger.clone();
        run.touch();
        match &self.token {
            Some(token) => self.store.save_locked(&run, token).await?,
            None => self.store.save(&run).await?,
        }
        Ok(())
    }
}
