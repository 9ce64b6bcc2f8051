//! Bounded critique, fix, re-critique loop.
//!
//! Each iteration critiques the current artifact, hands the top-ranked issues
//! to the fix function and re-critiques the candidate. The loop stops on a
//! passing score or critic approval, on exhausting its iteration or dollar
//! budget, on diminishing returns, or when a fix leaves the artifact
//! unchanged. Iterations never overlap: each one starts from the previous
//! one's output.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::config::RefinementConfig;
use super::critic::{FixFunction, IterationSink, QualityCritic};
use super::prioritizer::{prioritize, PrioritizedIssue};
use super::types::{QualityReport, Recommendation};
use crate::error::{CriticError, FixError, LedgerError, RefinementError};
use crate::ledger::{dollars_to_micros, micros_to_dollars, CostCategory, CostLedger};
use crate::metrics::MetricsCollector;

/// Lifecycle of a refinement loop. Every status after `InProgress` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStatus {
    NotStarted,
    InProgress,
    Converged,
    MaxIterations,
    BudgetExceeded,
    Failed,
}

impl RefinementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinementStatus::NotStarted => "not_started",
            RefinementStatus::InProgress => "in_progress",
            RefinementStatus::Converged => "converged",
            RefinementStatus::MaxIterations => "max_iterations",
            RefinementStatus::BudgetExceeded => "budget_exceeded",
            RefinementStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RefinementStatus::NotStarted | RefinementStatus::InProgress)
    }
}

impl fmt::Display for RefinementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a loop ended `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementFailure {
    NoProgress,
    Critic,
    Fix,
    Checkpoint,
    Fingerprint,
    Budget,
}

impl From<&RefinementError> for RefinementFailure {
    fn from(error: &RefinementError) -> Self {
        match error {
            RefinementError::NoProgress { .. } => RefinementFailure::NoProgress,
            RefinementError::Critic(_) => RefinementFailure::Critic,
            RefinementError::Fix(_) => RefinementFailure::Fix,
            RefinementError::Budget(_) => RefinementFailure::Budget,
            RefinementError::Fingerprint(_) => RefinementFailure::Fingerprint,
            RefinementError::Checkpoint { .. } => RefinementFailure::Checkpoint,
        }
    }
}

/// Record of one completed critique, fix, re-critique cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementIteration {
    /// 1-based iteration number, continuous across resumes.
    pub number: u32,
    pub score_before: f64,
    pub score_after: f64,
    pub issues_identified: usize,
    /// Ids of the issues handed to the fix function.
    pub issues_addressed: Vec<String>,
    pub recommendation: Recommendation,
    pub critique_cost: f64,
    pub fix_cost: f64,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the artifact this iteration produced.
    pub fingerprint: String,
}

impl RefinementIteration {
    pub fn improvement(&self) -> f64 {
        self.score_after - self.score_before
    }

    pub fn cost(&self) -> f64 {
        self.critique_cost + self.fix_cost
    }
}

/// Summary of a finished refinement loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementResult {
    pub id: Uuid,
    pub status: RefinementStatus,
    pub stop_reason: Option<String>,
    pub iterations: Vec<RefinementIteration>,
    pub iterations_completed: u32,
    pub initial_score: Option<f64>,
    pub final_score: Option<f64>,
    pub score_improvement: f64,
    pub target_met: bool,
    pub total_cost: f64,
    pub critique_costs: f64,
    pub fix_costs: f64,
    pub final_report: Option<QualityReport>,
    pub errors: Vec<String>,
    /// Set when `status` is `Failed`.
    pub failure: Option<RefinementFailure>,
    /// Whether the failure may clear up on a resumed attempt.
    #[serde(default)]
    pub transient: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RefinementResult {
    fn resumed_from(prior: Vec<RefinementIteration>) -> Self {
        let mut result = Self {
            id: Uuid::new_v4(),
            status: RefinementStatus::NotStarted,
            stop_reason: None,
            iterations: Vec::new(),
            iterations_completed: 0,
            initial_score: None,
            final_score: None,
            score_improvement: 0.0,
            target_met: false,
            total_cost: 0.0,
            critique_costs: 0.0,
            fix_costs: 0.0,
            final_report: None,
            errors: Vec::new(),
            failure: None,
            transient: false,
            started_at: Utc::now(),
            completed_at: None,
        };
        for iteration in prior {
            result.push(iteration);
        }
        result
    }

    fn push(&mut self, iteration: RefinementIteration) {
        if self.initial_score.is_none() {
            self.initial_score = Some(iteration.score_before);
        }
        self.final_score = Some(iteration.score_after);
        self.critique_costs += iteration.critique_cost;
        self.fix_costs += iteration.fix_cost;
        self.iterations_completed += 1;
        self.iterations.push(iteration);
    }

    fn absorb(&mut self, pending: Pending) {
        self.critique_costs += pending.critique;
        self.fix_costs += pending.fix;
    }

    fn observe(&mut self, report: &QualityReport) {
        if self.initial_score.is_none() {
            self.initial_score = Some(report.overall_score());
        }
        self.final_score = Some(report.overall_score());
        self.final_report = Some(report.clone());
    }

    fn finish(&mut self, status: RefinementStatus, reason: impl Into<String>, target: f64) {
        self.status = status;
        self.stop_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
        self.total_cost = self.critique_costs + self.fix_costs;
        if let (Some(initial), Some(last)) = (self.initial_score, self.final_score) {
            self.score_improvement = last - initial;
            self.target_met = last >= target;
        }
    }
}

/// The refined artifact together with the loop summary.
#[derive(Debug, Clone)]
pub struct RefinementOutcome<A> {
    pub artifact: A,
    pub result: RefinementResult,
}

/// Hex SHA-256 of an artifact's JSON form.
pub fn fingerprint<A: Serialize>(artifact: &A) -> Result<String, RefinementError> {
    let bytes =
        serde_json::to_vec(artifact).map_err(|e| RefinementError::Fingerprint(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, Default)]
struct Pending {
    critique: f64,
    fix: f64,
}

/// Loop spend tracked against `max_cost_dollars`, separate from the run ledger.
struct LoopBudget {
    cap_micros: u64,
    spent_micros: u64,
}

impl LoopBudget {
    fn fits(&self, amount: f64) -> bool {
        self.spent_micros + dollars_to_micros(amount) <= self.cap_micros
    }

    /// Post to both the loop budget and the run ledger, or to neither.
    fn charge(
        &mut self,
        ledger: &mut CostLedger,
        category: CostCategory,
        amount: f64,
        note: String,
    ) -> Result<(), LedgerError> {
        if !self.fits(amount) {
            return Err(LedgerError::BudgetExceeded {
                category: category.to_string(),
                requested: amount,
                spent: micros_to_dollars(self.spent_micros),
                cap: micros_to_dollars(self.cap_micros),
            });
        }
        ledger.charge(category, amount, note)?;
        self.spent_micros += dollars_to_micros(amount);
        Ok(())
    }
}

/// Iterative refinement driver over any serializable artifact.
pub struct RefinementLoop<'a, A> {
    config: RefinementConfig,
    critic: &'a dyn QualityCritic<A>,
    fixer: Option<&'a dyn FixFunction<A>>,
    sink: Option<&'a dyn IterationSink<A>>,
    first_number: u32,
}

impl<'a, A> RefinementLoop<'a, A>
where
    A: Serialize + Clone + Send + Sync,
{
    pub fn new(config: RefinementConfig, critic: &'a dyn QualityCritic<A>) -> Self {
        Self {
            config,
            critic,
            fixer: None,
            sink: None,
            first_number: 1,
        }
    }

    pub fn with_fixer(mut self, fixer: &'a dyn FixFunction<A>) -> Self {
        self.fixer = Some(fixer);
        self
    }

    /// Persist each iteration through `sink` before the next one starts.
    pub fn with_sink(mut self, sink: &'a dyn IterationSink<A>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Number the first iteration of a fresh loop `first` instead of 1.
    pub fn numbered_from(mut self, first: u32) -> Self {
        self.first_number = first.max(1);
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Run from scratch. Costs are posted to `ledger` as they are incurred.
    pub async fn run(&self, artifact: A, ledger: &mut CostLedger) -> RefinementOutcome<A> {
        self.run_resuming(artifact, Vec::new(), ledger).await
    }

    /// Continue a loop whose first iterations were already recorded.
    ///
    /// `artifact` must be the output of the last prior iteration; their costs
    /// count toward `max_cost_dollars` but are not posted again.
    pub async fn run_resuming(
        &self,
        artifact: A,
        prior: Vec<RefinementIteration>,
        ledger: &mut CostLedger,
    ) -> RefinementOutcome<A> {
        let mut result = RefinementResult::resumed_from(prior);
        let mut budget = LoopBudget {
            cap_micros: dollars_to_micros(self.config.max_cost_dollars),
            spent_micros: dollars_to_micros(result.critique_costs + result.fix_costs),
        };
        result.status = RefinementStatus::InProgress;

        tracing::info!(
            refinement_id = %result.id,
            resumed_iterations = result.iterations_completed,
            max_iterations = self.config.max_iterations,
            max_cost = self.config.max_cost_dollars,
            "Refinement started"
        );

        let artifact = self.iterate(artifact, &mut result, &mut budget, ledger).await;

        let collector = MetricsCollector::new();
        collector.record_refinement_result(result.status.as_str());
        tracing::info!(
            refinement_id = %result.id,
            status = %result.status,
            iterations = result.iterations_completed,
            initial_score = ?result.initial_score,
            final_score = ?result.final_score,
            cost = result.total_cost,
            reason = result.stop_reason.as_deref().unwrap_or(""),
            "Refinement completed"
        );

        RefinementOutcome { artifact, result }
    }

    async fn iterate(
        &self,
        mut current: A,
        result: &mut RefinementResult,
        budget: &mut LoopBudget,
        ledger: &mut CostLedger,
    ) -> A {
        let config = &self.config;
        let target = config.target_overall_score;
        let collector = MetricsCollector::new();

        loop {
            if result.iterations_completed >= config.max_iterations {
                let reason = format!("max_iterations_reached: {}", config.max_iterations);
                result.finish(RefinementStatus::MaxIterations, reason, target);
                return current;
            }

            let number = result
                .iterations
                .last()
                .map(|i| i.number + 1)
                .unwrap_or(self.first_number);
            let round_cost = config.round_cost();
            if !budget.fits(round_cost) || !ledger.can_afford(round_cost) {
                let reason = format!(
                    "budget_exceeded: ${:.2} spent, ${:.2} needed, cap ${:.2}",
                    micros_to_dollars(budget.spent_micros),
                    round_cost,
                    config.max_cost_dollars
                );
                tracing::warn!(iteration = number, reason = %reason, "Refinement budget exhausted");
                result.finish(RefinementStatus::BudgetExceeded, reason, target);
                return current;
            }

            // Costs posted during this iteration, not yet on a record.
            let mut pending = Pending::default();

            let report = match self.critique(&current).await {
                Ok(report) => report,
                Err(e) => return self.fail(result, pending, RefinementError::from(e), current),
            };
            if let Err(e) = budget.charge(
                ledger,
                CostCategory::Critique,
                config.cost_per_critique,
                format!("refinement {} critique", number),
            ) {
                return self.stop_on_budget(result, pending, e, current);
            }
            pending.critique += config.cost_per_critique;
            result.observe(&report);

            let score_before = report.overall_score();
            if let Some(reason) = self.accepts(&report) {
                tracing::info!(iteration = number, score = score_before, "Refinement converged");
                result.absorb(pending);
                result.finish(RefinementStatus::Converged, reason, target);
                return current;
            }

            let ranked = prioritize(report.issues(), &config.dimension_weights);
            let top = &ranked[..ranked.len().min(config.max_fixes_per_iteration)];
            let issues_addressed: Vec<String> = top.iter().map(|p| p.issue.id.clone()).collect();

            let before = match fingerprint(&current) {
                Ok(fp) => fp,
                Err(e) => return self.fail(result, pending, e, current),
            };

            let candidate = match self.fixer {
                Some(fixer) => {
                    let candidate = match self.apply_fixes(fixer, &current, top).await {
                        Ok(candidate) => candidate,
                        Err(e) => {
                            return self.fail(result, pending, RefinementError::from(e), current)
                        }
                    };
                    if let Err(e) = budget.charge(
                        ledger,
                        CostCategory::Fix,
                        config.cost_per_fix,
                        format!("refinement {} fix", number),
                    ) {
                        return self.stop_on_budget(result, pending, e, current);
                    }
                    pending.fix += config.cost_per_fix;
                    candidate
                }
                None => current.clone(),
            };

            let after = match fingerprint(&candidate) {
                Ok(fp) => fp,
                Err(e) => return self.fail(result, pending, e, current),
            };

            if before == after {
                let iteration = RefinementIteration {
                    number,
                    score_before,
                    score_after: score_before,
                    issues_identified: report.issues().len(),
                    issues_addressed,
                    recommendation: report.recommendation(),
                    critique_cost: pending.critique,
                    fix_cost: pending.fix,
                    timestamp: Utc::now(),
                    fingerprint: after,
                };
                result.push(iteration.clone());
                let error = match self.persist(&iteration, &current, ledger).await {
                    Ok(()) => RefinementError::NoProgress { iteration: number },
                    Err(e) => e,
                };
                return self.fail(result, Pending::default(), error, current);
            }

            let after_report = match self.critique(&candidate).await {
                Ok(report) => report,
                Err(e) => return self.fail(result, pending, RefinementError::from(e), current),
            };
            if let Err(e) = budget.charge(
                ledger,
                CostCategory::Critique,
                config.cost_per_critique,
                format!("refinement {} re-critique", number),
            ) {
                return self.stop_on_budget(result, pending, e, current);
            }
            pending.critique += config.cost_per_critique;

            current = candidate;
            let iteration = RefinementIteration {
                number,
                score_before,
                score_after: after_report.overall_score(),
                issues_identified: report.issues().len(),
                issues_addressed,
                recommendation: after_report.recommendation(),
                critique_cost: pending.critique,
                fix_cost: pending.fix,
                timestamp: Utc::now(),
                fingerprint: after,
            };
            collector.record_refinement_iteration(iteration.improvement() > 0.0);
            tracing::info!(
                iteration = number,
                score_before = iteration.score_before,
                score_after = iteration.score_after,
                addressed = iteration.issues_addressed.len(),
                "Refinement iteration completed"
            );

            result.push(iteration.clone());
            result.final_report = Some(after_report);
            if let Err(e) = self.persist(&iteration, &current, ledger).await {
                return self.fail(result, Pending::default(), e, current);
            }

            if let Some((status, reason)) = self.stop_condition(result) {
                result.finish(status, reason, target);
                return current;
            }
        }
    }

    /// Why the critic's verdict ends the loop without a fix, if it does.
    fn accepts(&self, report: &QualityReport) -> Option<String> {
        let target = self.config.target_overall_score;
        let score = report.overall_score();
        let recommendation = report.recommendation();

        if score >= target {
            return Some(format!("target_score_reached: {:.1} >= {}", score, target));
        }
        if self.config.stop_on_approve && recommendation.is_approval() {
            return Some(format!("critic_recommendation: {}", recommendation));
        }
        if self.config.stop_on_minor_fixes && recommendation == Recommendation::MinorFixes {
            return Some("critic_recommendation: minor_fixes (acceptable)".to_string());
        }
        None
    }

    /// Stop checks after a recorded iteration, in priority order.
    fn stop_condition(&self, result: &RefinementResult) -> Option<(RefinementStatus, String)> {
        let config = &self.config;
        let last = result.iterations.last()?;

        if last.score_after >= config.target_overall_score {
            return Some((
                RefinementStatus::Converged,
                format!(
                    "target_score_reached: {:.1} >= {}",
                    last.score_after, config.target_overall_score
                ),
            ));
        }

        if result.iterations_completed >= config.max_iterations {
            return Some((
                RefinementStatus::MaxIterations,
                format!("max_iterations_reached: {}", config.max_iterations),
            ));
        }

        // Two consecutive sub-threshold gains, both past the minimum.
        let done = result.iterations.len();
        let stalled = done >= 2
            && done - 1 > config.min_iterations as usize
            && result.iterations[done - 2..]
                .iter()
                .all(|i| i.improvement() < config.improvement_threshold);
        if stalled {
            return Some((
                RefinementStatus::Converged,
                format!(
                    "no_improvement: {:.2} < epsilon {}",
                    last.improvement(),
                    config.improvement_threshold
                ),
            ));
        }

        None
    }

    async fn critique(&self, artifact: &A) -> Result<QualityReport, CriticError> {
        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, self.critic.critique(artifact)).await {
            Ok(result) => result,
            Err(_) => Err(CriticError::Timeout(timeout)),
        }
    }

    async fn apply_fixes(
        &self,
        fixer: &dyn FixFunction<A>,
        artifact: &A,
        issues: &[PrioritizedIssue],
    ) -> Result<A, FixError> {
        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, fixer.apply_fixes(artifact, issues)).await {
            Ok(result) => result,
            Err(_) => Err(FixError::Timeout(timeout)),
        }
    }

    async fn persist(
        &self,
        iteration: &RefinementIteration,
        artifact: &A,
        ledger: &CostLedger,
    ) -> Result<(), RefinementError> {
        match self.sink {
            Some(sink) => sink.record(iteration, artifact, ledger).await,
            None => Ok(()),
        }
    }

    fn stop_on_budget(
        &self,
        result: &mut RefinementResult,
        pending: Pending,
        error: LedgerError,
        current: A,
    ) -> A {
        tracing::warn!(error = %error, "Refinement charge refused");
        result.absorb(pending);
        result.errors.push(error.to_string());
        result.finish(
            RefinementStatus::BudgetExceeded,
            format!("budget_exceeded: {}", error),
            self.config.target_overall_score,
        );
        current
    }

    fn fail(
        &self,
        result: &mut RefinementResult,
        pending: Pending,
        error: RefinementError,
        current: A,
    ) -> A {
        tracing::error!(error = %error, "Refinement failed");
        result.absorb(pending);
        result.failure = Some(RefinementFailure::from(&error));
        result.transient = error.is_transient();
        result.errors.push(error.to_string());
        result.finish(
            RefinementStatus::Failed,
            format!("failed: {}", error),
            self.config.target_overall_score,
        );
        current
    }
}
