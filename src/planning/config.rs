//! Shot planner configuration.

use serde::{Deserialize, Serialize};

use super::types::{HookStrategy, Pacing};
use crate::error::ConfigError;
use crate::pipeline::config::parse_env_value;

/// Configuration for the shot budget planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Target unit duration in seconds.
    pub target_duration_secs: f64,
    /// Duration reserved for the opening hook shot.
    pub hook_duration_secs: f64,
    pub min_shot_duration_secs: f64,
    pub max_shot_duration_secs: f64,

    /// Shot count before complexity and pacing adjustments.
    pub base_shot_count: usize,
    pub min_shots: usize,
    pub max_shots: usize,

    /// Pacing for emotions outside the pacing table.
    pub default_pacing: Pacing,
    /// Hook strategy when no rule selects one.
    pub default_hook_strategy: HookStrategy,

    /// Use a unit's own duration estimate (clamped to 0.5-1.5x target).
    pub use_unit_estimate: bool,
    pub include_transitions: bool,

    /// Word count at which the text-length complexity term saturates.
    pub complexity_word_scale: usize,
    /// Entity count at which the entity complexity term saturates.
    pub complexity_entity_scale: usize,

    /// Fixed shot count, bypassing the complexity formula.
    pub shot_count_override: Option<usize>,
    /// Fixed pacing, bypassing the emotion table.
    pub pacing_override: Option<Pacing>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            target_duration_secs: 60.0,
            hook_duration_secs: 3.0,
            min_shot_duration_secs: 2.0,
            max_shot_duration_secs: 8.0,
            base_shot_count: 4,
            min_shots: 3,
            max_shots: 10,
            default_pacing: Pacing::Moderate,
            default_hook_strategy: HookStrategy::VisualImpact,
            use_unit_estimate: true,
            include_transitions: true,
            complexity_word_scale: 250,
            complexity_entity_scale: 10,
            shot_count_override: None,
            pacing_override: None,
        }
    }
}

impl PlannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REELFORGE_TARGET_DURATION_SECS` (default: 60)
    /// - `REELFORGE_HOOK_DURATION_SECS` (default: 3)
    /// - `REELFORGE_MIN_SHOT_SECS` (default: 2)
    /// - `REELFORGE_MAX_SHOT_SECS` (default: 8)
    /// - `REELFORGE_MIN_SHOTS` (default: 3)
    /// - `REELFORGE_MAX_SHOTS` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REELFORGE_TARGET_DURATION_SECS") {
            config.target_duration_secs = parse_env_value(&val, "REELFORGE_TARGET_DURATION_SECS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_HOOK_DURATION_SECS") {
            config.hook_duration_secs = parse_env_value(&val, "REELFORGE_HOOK_DURATION_SECS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_MIN_SHOT_SECS") {
            config.min_shot_duration_secs = parse_env_value(&val, "REELFORGE_MIN_SHOT_SECS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_MAX_SHOT_SECS") {
            config.max_shot_duration_secs = parse_env_value(&val, "REELFORGE_MAX_SHOT_SECS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_MIN_SHOTS") {
            config.min_shots = parse_env_value(&val, "REELFORGE_MIN_SHOTS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_MAX_SHOTS") {
            config.max_shots = parse_env_value(&val, "REELFORGE_MAX_SHOTS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_duration_secs.is_finite() || self.target_duration_secs <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "target_duration_secs must be greater than 0".to_string(),
            ));
        }

        if self.hook_duration_secs <= 0.0 || self.hook_duration_secs >= self.target_duration_secs {
            return Err(ConfigError::ValidationFailed(
                "hook_duration_secs must be positive and shorter than the target".to_string(),
            ));
        }

        if self.min_shot_duration_secs <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "min_shot_duration_secs must be greater than 0".to_string(),
            ));
        }

        if self.min_shot_duration_secs > self.max_shot_duration_secs {
            return Err(ConfigError::ValidationFailed(
                "min_shot_duration_secs cannot exceed max_shot_duration_secs".to_string(),
            ));
        }

        if self.min_shots == 0 || self.min_shots > self.max_shots {
            return Err(ConfigError::ValidationFailed(
                "shot count bounds must satisfy 0 < min_shots <= max_shots".to_string(),
            ));
        }

        if self.shot_count_override == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "shot_count_override must be greater than 0".to_string(),
            ));
        }

        if self.complexity_word_scale == 0 || self.complexity_entity_scale == 0 {
            return Err(ConfigError::ValidationFailed(
                "complexity scales must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_target_duration(mut self, secs: f64) -> Self {
        self.target_duration_secs = secs;
        self
    }

    pub fn with_hook_duration(mut self, secs: f64) -> Self {
        self.hook_duration_secs = secs;
        self
    }

    pub fn with_shot_duration_bounds(mut self, min_secs: f64, max_secs: f64) -> Self {
        self.min_shot_duration_secs = min_secs;
        self.max_shot_duration_secs = max_secs;
        self
    }

    pub fn with_shot_count_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_shots = min;
        self.max_shots = max;
        self
    }

    pub fn with_shot_count(mut self, count: usize) -> Self {
        self.shot_count_override = Some(count);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing_override = Some(pacing);
        self
    }

    pub fn with_default_hook_strategy(mut self, strategy: HookStrategy) -> Self {
        self.default_hook_strategy = strategy;
        self
    }

    pub fn with_unit_estimate(mut self, enabled: bool) -> Self {
        self.use_unit_estimate = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PlannerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target_duration_secs, 60.0);
        assert_eq!(config.hook_duration_secs, 3.0);
        assert_eq!(config.base_shot_count, 4);
    }

    #[test]
    fn test_hook_longer_than_target_rejected() {
        let config = PlannerConfig::default().with_target_duration(2.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hook_duration_secs"));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        assert!(PlannerConfig::default()
            .with_shot_duration_bounds(9.0, 3.0)
            .validate()
            .is_err());
        assert!(PlannerConfig::default()
            .with_shot_count_bounds(6, 4)
            .validate()
            .is_err());
        assert!(PlannerConfig::default().with_shot_count(0).validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_yaml() {
        let yaml = "target_duration_secs: 45.0\npacing_override: intense\n";
        let config: PlannerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.target_duration_secs, 45.0);
        assert_eq!(config.pacing_override, Some(Pacing::Intense));
        assert_eq!(config.max_shots, 10);
    }
}
