//! Orchestrator configuration.
//!
//! Every config struct has defaults, builder setters, `validate()` and
//! `from_env()`. [`ReelforgeConfig`] bundles them and can be loaded from a
//! YAML file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::stages::StageKind;
use crate::error::ConfigError;
use crate::planning::PlannerConfig;
use crate::quality::RefinementConfig;
use crate::scheduler::WorkerPoolConfig;

/// Exponential backoff for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based). Zero for `retry == 0`.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }

    /// Whether another retry is allowed after `retries` retries.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Configuration for the stage orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,

    /// Budget cap in dollars for new runs.
    pub budget_cap_dollars: f64,
    /// Projected cost per chargeable stage, checked before the stage runs.
    pub stage_cost_estimates: BTreeMap<StageKind, f64>,

    /// Per-attempt timeout for host stage executors.
    pub stage_timeout_ms: u64,

    pub require_human_review: bool,
    /// Critique score (0-10) at which review is approved automatically.
    pub auto_approve_threshold: f64,

    /// How long lock acquisition waits for another holder, and how often it polls.
    pub lock_wait_ms: u64,
    pub lock_poll_interval_ms: u64,
    /// Lease after which an unrenewed run lock counts as abandoned.
    pub lock_ttl_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            budget_cap_dollars: 50.0,
            stage_cost_estimates: default_cost_estimates(),
            stage_timeout_ms: 300_000,
            require_human_review: true,
            auto_approve_threshold: 8.5,
            lock_wait_ms: 5_000,
            lock_poll_interval_ms: 50,
            lock_ttl_ms: 600_000,
        }
    }
}

fn default_cost_estimates() -> BTreeMap<StageKind, f64> {
    [
        (StageKind::Parse, 0.10),
        (StageKind::Graph, 0.05),
        (StageKind::Generate, 4.00),
        (StageKind::Assemble, 0.50),
        (StageKind::Critique, 0.05),
        (StageKind::Refine, 0.25),
    ]
    .into_iter()
    .collect()
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REELFORGE_BUDGET_CAP` (default: 50.0)
    /// - `REELFORGE_MAX_RETRIES` (default: 3)
    /// - `REELFORGE_INITIAL_BACKOFF_MS` (default: 500)
    /// - `REELFORGE_STAGE_TIMEOUT_MS` (default: 300000)
    /// - `REELFORGE_REQUIRE_HUMAN_REVIEW` (default: true)
    /// - `REELFORGE_AUTO_APPROVE_THRESHOLD` (default: 8.5)
    /// - `REELFORGE_LOCK_TTL_MS` (default: 600000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REELFORGE_BUDGET_CAP") {
            config.budget_cap_dollars = parse_env_value(&val, "REELFORGE_BUDGET_CAP")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_MAX_RETRIES") {
            config.retry.max_retries = parse_env_value(&val, "REELFORGE_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_INITIAL_BACKOFF_MS") {
            config.retry.initial_backoff_ms = parse_env_value(&val, "REELFORGE_INITIAL_BACKOFF_MS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_STAGE_TIMEOUT_MS") {
            config.stage_timeout_ms = parse_env_value(&val, "REELFORGE_STAGE_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REQUIRE_HUMAN_REVIEW") {
            config.require_human_review = parse_env_bool(&val, "REELFORGE_REQUIRE_HUMAN_REVIEW")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_AUTO_APPROVE_THRESHOLD") {
            config.auto_approve_threshold =
                parse_env_value(&val, "REELFORGE_AUTO_APPROVE_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_LOCK_TTL_MS") {
            config.lock_ttl_ms = parse_env_value(&val, "REELFORGE_LOCK_TTL_MS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.budget_cap_dollars.is_finite() || self.budget_cap_dollars < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "budget_cap_dollars cannot be negative".to_string(),
            ));
        }

        if let Some((stage, _)) = self
            .stage_cost_estimates
            .iter()
            .find(|(_, cost)| !cost.is_finite() || **cost < 0.0)
        {
            return Err(ConfigError::ValidationFailed(format!(
                "cost estimate for stage '{}' cannot be negative",
                stage
            )));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.stage_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=10.0).contains(&self.auto_approve_threshold) {
            return Err(ConfigError::ValidationFailed(
                "auto_approve_threshold must be between 0 and 10".to_string(),
            ));
        }

        if self.lock_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "lock_poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        // A stage attempt holds the lock without renewing it.
        if self.lock_ttl_ms <= self.stage_timeout_ms {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl_ms must exceed stage_timeout_ms".to_string(),
            ));
        }

        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// Projected cost of a stage, zero when none is configured.
    pub fn estimate_for(&self, stage: StageKind) -> f64 {
        self.stage_cost_estimates.get(&stage).copied().unwrap_or(0.0)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budget_cap(mut self, dollars: f64) -> Self {
        self.budget_cap_dollars = dollars;
        self
    }

    pub fn with_cost_estimate(mut self, stage: StageKind, dollars: f64) -> Self {
        self.stage_cost_estimates.insert(stage, dollars);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_human_review(mut self, required: bool) -> Self {
        self.require_human_review = required;
        self
    }

    pub fn with_auto_approve_threshold(mut self, score: f64) -> Self {
        self.auto_approve_threshold = score;
        self
    }
}

/// Top-level configuration bundling every subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReelforgeConfig {
    pub orchestrator: OrchestratorConfig,
    pub planner: PlannerConfig,
    pub refinement: RefinementConfig,
    pub workers: WorkerPoolConfig,
}

impl ReelforgeConfig {
    /// Load from the environment, falling back to defaults per field.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            orchestrator: OrchestratorConfig::from_env()?,
            planner: PlannerConfig::from_env()?,
            refinement: RefinementConfig::from_env()?,
            workers: WorkerPoolConfig::from_env()?,
        })
    }

    /// Load a YAML file. Omitted sections and fields keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.planner.validate()?;
        self.refinement.validate()?;
        self.workers.validate()?;

        // Checkpoints renew the lease once per iteration: a critique, a fix
        // and a re-critique.
        if self.refinement.call_timeout_ms.saturating_mul(3) >= self.orchestrator.lock_ttl_ms {
            return Err(ConfigError::ValidationFailed(
                "three refinement call timeouts must fit inside lock_ttl_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: std::str::FromStr>(
    value: &str,
    key: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
