//! Pipeline stages and their executors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CriticError, StageError};
use crate::ledger::CostCategory;
use crate::quality::QualityCritic;

/// One ordered step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ingest,
    Parse,
    Graph,
    Continuity,
    Plan,
    Generate,
    Assemble,
    Critique,
    Refine,
    Review,
    Finalize,
}

impl StageKind {
    /// All stages in execution order.
    pub const ALL: [StageKind; 11] = [
        StageKind::Ingest,
        StageKind::Parse,
        StageKind::Graph,
        StageKind::Continuity,
        StageKind::Plan,
        StageKind::Generate,
        StageKind::Assemble,
        StageKind::Critique,
        StageKind::Refine,
        StageKind::Review,
        StageKind::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Ingest => "ingest",
            StageKind::Parse => "parse",
            StageKind::Graph => "graph",
            StageKind::Continuity => "continuity",
            StageKind::Plan => "plan",
            StageKind::Generate => "generate",
            StageKind::Assemble => "assemble",
            StageKind::Critique => "critique",
            StageKind::Refine => "refine",
            StageKind::Review => "review",
            StageKind::Finalize => "finalize",
        }
    }

    /// Position in `ALL`.
    pub fn index(&self) -> usize {
        StageKind::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or(StageKind::ALL.len())
    }

    pub fn next(&self) -> Option<StageKind> {
        StageKind::ALL.get(self.index() + 1).copied()
    }

    /// Upstream stages whose outputs must exist before this stage runs.
    pub fn dependencies(&self) -> &'static [StageKind] {
        match self {
            StageKind::Ingest => &[],
            StageKind::Parse => &[StageKind::Ingest],
            StageKind::Graph => &[StageKind::Parse],
            StageKind::Continuity => &[StageKind::Parse],
            StageKind::Plan => &[StageKind::Continuity],
            StageKind::Generate => &[StageKind::Plan],
            StageKind::Assemble => &[StageKind::Generate],
            StageKind::Critique => &[StageKind::Assemble],
            StageKind::Refine => &[StageKind::Assemble, StageKind::Critique],
            StageKind::Review => &[StageKind::Refine],
            StageKind::Finalize => &[StageKind::Refine, StageKind::Review],
        }
    }

    /// Ledger category for the actual cost a stage reports.
    pub fn cost_category(&self) -> CostCategory {
        match self {
            StageKind::Parse | StageKind::Graph => CostCategory::Llm,
            StageKind::Generate => CostCategory::ImageGeneration,
            StageKind::Critique => CostCategory::Critique,
            StageKind::Refine => CostCategory::Fix,
            StageKind::Finalize => CostCategory::Storage,
            _ => CostCategory::Compute,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// What a stage executor receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub run_id: Uuid,
    pub story_id: String,
    pub stage: StageKind,
    /// 1-based attempt number; greater than 1 on retries.
    pub attempt: u32,
    /// The run's original input document.
    pub source: Value,
    /// Outputs of this stage's dependencies.
    pub upstream: BTreeMap<StageKind, Value>,
}

impl StageInput {
    pub fn upstream(&self, stage: StageKind) -> Option<&Value> {
        self.upstream.get(&stage)
    }
}

/// What a stage executor returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub value: Value,
    /// Actual cost in dollars, posted to the run ledger.
    #[serde(default)]
    pub cost: f64,
}

impl StageOutput {
    pub fn new(value: Value) -> Self {
        Self { value, cost: 0.0 }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// A host-supplied stage implementation.
///
/// Executors must be stateless with respect to the run: everything they need
/// arrives in the input and everything they produce is in the output.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError>;
}

/// Executors registered per stage at startup.
#[derive(Clone, Default)]
pub struct StageRegistry {
    executors: BTreeMap<StageKind, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, stage: StageKind, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(stage, executor);
        self
    }

    pub fn get(&self, stage: StageKind) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    pub fn contains(&self, stage: StageKind) -> bool {
        self.executors.contains_key(&stage)
    }

    pub fn stages(&self) -> Vec<StageKind> {
        self.executors.keys().copied().collect()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stages())
            .finish()
    }
}

/// Critique stage backed by a quality critic over the assembled artifact.
///
/// An unavailable critic is a transient failure; an unusable report is fatal.
pub struct CritiqueStage {
    critic: Arc<dyn QualityCritic<Value>>,
    cost_per_critique: f64,
}

impl CritiqueStage {
    pub fn new(critic: Arc<dyn QualityCritic<Value>>, cost_per_critique: f64) -> Self {
        Self {
            critic,
            cost_per_critique,
        }
    }
}

#[async_trait]
impl StageExecutor for CritiqueStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let artifact = input
            .upstream(StageKind::Assemble)
            .ok_or_else(|| StageError::Fatal("assembled artifact missing".to_string()))?;

        let report = self.critic.critique(artifact).await.map_err(|e| match e {
            CriticError::Unavailable(msg) => StageError::Transient(msg),
            CriticError::Timeout(after) => StageError::Timeout(after),
            CriticError::InvalidReport(msg) => StageError::Fatal(msg),
        })?;

        let value = serde_json::to_value(&report).map_err(|e| StageError::Fatal(e.to_string()))?;
        Ok(StageOutput::new(value).with_cost(self.cost_per_critique))
    }
}
