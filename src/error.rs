//! Error types for reelforge operations.
//!
//! Defines error types for every subsystem:
//! - Cost ledger postings
//! - Shot planning and playbook constraints
//! - Critique, fix and refinement rounds
//! - Stage execution and orchestration
//! - Run persistence and locking
//! - Configuration loading

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the cost ledger.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("Budget exceeded for {category}: requested ${requested:.2}, spent ${spent:.2} of ${cap:.2}")]
    BudgetExceeded {
        category: String,
        requested: f64,
        spent: f64,
        cap: f64,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Errors raised while validating a narrative sequence.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NarrativeError {
    #[error("Units out of sequence order: unit '{unit_id}' has sequence {sequence} after {previous}")]
    OutOfOrder {
        unit_id: String,
        sequence: u32,
        previous: u32,
    },

    #[error("Unknown canon entity '{0}'")]
    UnknownEntity(String),
}

/// Errors raised by the shot planner.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error("Unsatisfiable constraints for unit '{unit_id}': {reason}")]
    UnsatisfiableConstraints { unit_id: String, reason: String },

    #[error("Invalid planner configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid constraint token '{token}': {reason}")]
    InvalidConstraint { token: String, reason: String },

    #[error("Invalid shot replacement at index {index}: {reason}")]
    InvalidReplacement { index: usize, reason: String },

    #[error("Units out of sequence order: {0}")]
    OutOfOrder(String),
}

/// Error returned by a quality critic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CriticError {
    #[error("Critic unavailable: {0}")]
    Unavailable(String),

    #[error("Critic timed out after {0:?}")]
    Timeout(Duration),

    #[error("Critic returned an unusable report: {0}")]
    InvalidReport(String),
}

impl CriticError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CriticError::Unavailable(_) | CriticError::Timeout(_))
    }
}

/// Error returned by a fix function.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FixError {
    #[error("Fix backend unavailable: {0}")]
    Unavailable(String),

    #[error("Fix timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fix failed: {0}")]
    Failed(String),
}

impl FixError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FixError::Unavailable(_) | FixError::Timeout(_))
    }
}

/// Errors that terminate a refinement loop as `FAILED`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefinementError {
    #[error("No progress: artifact unchanged after iteration {iteration}")]
    NoProgress { iteration: u32 },

    #[error("Critique failed: {0}")]
    Critic(#[from] CriticError),

    #[error("Fix failed: {0}")]
    Fix(#[from] FixError),

    #[error("Budget error: {0}")]
    Budget(#[from] LedgerError),

    #[error("Artifact fingerprint failed: {0}")]
    Fingerprint(String),

    /// Persisting an iteration failed; `transient` carries the store's class.
    #[error("Checkpoint failed: {message}")]
    Checkpoint { message: String, transient: bool },
}

impl RefinementError {
    /// Whether the loop may be resumed from its last checkpoint and succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RefinementError::Critic(e) => e.is_transient(),
            RefinementError::Fix(e) => e.is_transient(),
            RefinementError::Checkpoint { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<StoreError> for RefinementError {
    fn from(error: StoreError) -> Self {
        RefinementError::Checkpoint {
            transient: error.is_transient(),
            message: error.to_string(),
        }
    }
}

/// Error returned by a stage executor.
///
/// Timeouts are transient for retry purposes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl StageError {
    /// Whether the failure should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_) | StageError::Timeout(_))
    }
}

/// Errors raised by run stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {0} not found")]
    NotFound(Uuid),

    #[error("Run {0} is locked by another worker")]
    Locked(Uuid),

    #[error("Lock token mismatch for run {0}")]
    LockMismatch(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// IO and connection failures may clear up; lock and data errors do not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Redis(_))
    }
}

/// Errors raised by configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised by the stage orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage '{stage}' requires output of '{required}' which is missing")]
    MissingInput { stage: String, required: String },

    #[error("Invalid run state: {0}")]
    InvalidState(String),

    #[error("Run {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Run {0} is not awaiting review")]
    ReviewNotPending(Uuid),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Narrative error: {0}")]
    Narrative(#[from] NarrativeError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Refinement error: {0}")]
    Refinement(#[from] RefinementError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for orchestrator operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
