//! Refinement loop configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::Dimension;
use crate::error::ConfigError;
use crate::pipeline::config::{parse_env_bool, parse_env_value};

/// Configuration for the critique/fix refinement loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub max_iterations: u32,
    /// Iterations that always run before diminishing returns can stop the loop.
    pub min_iterations: u32,

    /// Loop-local spend cap in dollars.
    pub max_cost_dollars: f64,
    pub cost_per_critique: f64,
    pub cost_per_fix: f64,

    /// Overall score (0-10) at which the artifact is accepted.
    pub target_overall_score: f64,
    /// Minimum per-iteration score gain that counts as progress.
    pub improvement_threshold: f64,

    /// Priority weight per dimension; missing dimensions weigh 1.0.
    pub dimension_weights: BTreeMap<Dimension, f64>,

    pub stop_on_approve: bool,
    /// Also accept a `minor_fixes` recommendation as convergence.
    pub stop_on_minor_fixes: bool,
    /// Number of top-ranked issues handed to the fix function.
    pub max_fixes_per_iteration: usize,

    /// Per-call timeout for the critic and the fix function.
    pub call_timeout_ms: u64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            min_iterations: 1,
            max_cost_dollars: 2.0,
            cost_per_critique: 0.05,
            cost_per_fix: 0.20,
            target_overall_score: 7.0,
            improvement_threshold: 0.2,
            dimension_weights: default_dimension_weights(),
            stop_on_approve: true,
            stop_on_minor_fixes: false,
            max_fixes_per_iteration: 5,
            call_timeout_ms: 120_000,
        }
    }
}

fn default_dimension_weights() -> BTreeMap<Dimension, f64> {
    [
        (Dimension::NarrativeClarity, 1.2),
        (Dimension::HookStrength, 1.5),
        (Dimension::Pacing, 1.0),
        (Dimension::ShotComposition, 1.0),
        (Dimension::Continuity, 0.8),
        (Dimension::AudioMix, 0.7),
    ]
    .into_iter()
    .collect()
}

impl RefinementConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REELFORGE_REFINE_MAX_ITERATIONS` (default: 2)
    /// - `REELFORGE_REFINE_MIN_ITERATIONS` (default: 1)
    /// - `REELFORGE_REFINE_MAX_COST` (default: 2.0)
    /// - `REELFORGE_REFINE_TARGET_SCORE` (default: 7.0)
    /// - `REELFORGE_REFINE_IMPROVEMENT_THRESHOLD` (default: 0.2)
    /// - `REELFORGE_REFINE_STOP_ON_MINOR_FIXES` (default: false)
    /// - `REELFORGE_REFINE_CALL_TIMEOUT_MS` (default: 120000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REELFORGE_REFINE_MAX_ITERATIONS") {
            config.max_iterations = parse_env_value(&val, "REELFORGE_REFINE_MAX_ITERATIONS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REFINE_MIN_ITERATIONS") {
            config.min_iterations = parse_env_value(&val, "REELFORGE_REFINE_MIN_ITERATIONS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REFINE_MAX_COST") {
            config.max_cost_dollars = parse_env_value(&val, "REELFORGE_REFINE_MAX_COST")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REFINE_TARGET_SCORE") {
            config.target_overall_score = parse_env_value(&val, "REELFORGE_REFINE_TARGET_SCORE")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REFINE_IMPROVEMENT_THRESHOLD") {
            config.improvement_threshold =
                parse_env_value(&val, "REELFORGE_REFINE_IMPROVEMENT_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REFINE_STOP_ON_MINOR_FIXES") {
            config.stop_on_minor_fixes =
                parse_env_bool(&val, "REELFORGE_REFINE_STOP_ON_MINOR_FIXES")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_REFINE_CALL_TIMEOUT_MS") {
            config.call_timeout_ms = parse_env_value(&val, "REELFORGE_REFINE_CALL_TIMEOUT_MS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        if self.min_iterations > self.max_iterations {
            return Err(ConfigError::ValidationFailed(
                "min_iterations cannot exceed max_iterations".to_string(),
            ));
        }

        for (name, value) in [
            ("max_cost_dollars", self.max_cost_dollars),
            ("cost_per_critique", self.cost_per_critique),
            ("cost_per_fix", self.cost_per_fix),
            ("improvement_threshold", self.improvement_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be a non-negative number",
                    name
                )));
            }
        }

        if !(0.0..=10.0).contains(&self.target_overall_score) {
            return Err(ConfigError::ValidationFailed(
                "target_overall_score must be between 0 and 10".to_string(),
            ));
        }

        if self.dimension_weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::ValidationFailed(
                "dimension weights must be non-negative".to_string(),
            ));
        }

        if self.max_fixes_per_iteration == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_fixes_per_iteration must be at least 1".to_string(),
            ));
        }

        if self.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "call_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_min_iterations(mut self, min: u32) -> Self {
        self.min_iterations = min;
        self
    }

    pub fn with_max_cost(mut self, dollars: f64) -> Self {
        self.max_cost_dollars = dollars;
        self
    }

    pub fn with_costs(mut self, per_critique: f64, per_fix: f64) -> Self {
        self.cost_per_critique = per_critique;
        self.cost_per_fix = per_fix;
        self
    }

    pub fn with_target_score(mut self, score: f64) -> Self {
        self.target_overall_score = score;
        self
    }

    pub fn with_improvement_threshold(mut self, threshold: f64) -> Self {
        self.improvement_threshold = threshold;
        self
    }

    pub fn with_dimension_weight(mut self, dimension: Dimension, weight: f64) -> Self {
        self.dimension_weights.insert(dimension, weight);
        self
    }

    pub fn with_stop_on_minor_fixes(mut self, enabled: bool) -> Self {
        self.stop_on_minor_fixes = enabled;
        self
    }

    pub fn with_max_fixes(mut self, max: usize) -> Self {
        self.max_fixes_per_iteration = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Cost of one full critique, fix, re-critique round.
    pub fn round_cost(&self) -> f64 {
        self.cost_per_critique + self.cost_per_fix
    }
}
