//! CLI command definitions for reelforge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::CriticError;
use crate::metrics::{export_metrics, init_metrics};
use crate::narrative::{validate_sequence, Canon, NarrativeUnit, ParsedNarrative};
use crate::pipeline::{Orchestrator, ReelforgeConfig, ReviewDecision, StageRegistry};
use crate::planning::plan_sequence;
use crate::quality::{QualityCritic, QualityReport};
use crate::storage::{FileRunStore, RunStore};

/// Default directory for persisted runs.
const DEFAULT_STORE_DIR: &str = "./reelforge-runs";

/// Story pipeline orchestration and refinement engine.
#[derive(Parser)]
#[command(name = "reelforge")]
#[command(about = "Plan, validate and operate story-to-video pipeline runs")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables are used when absent.
    #[arg(short, long, global = true, env = "REELFORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Plan shots for every unit of a parsed narrative.
    Plan(InputArgs),

    /// Check a parsed narrative for continuity violations.
    Validate(InputArgs),

    /// Show one run, or every run in the store.
    Status(StatusArgs),

    /// Record a review decision for a run awaiting review.
    Review(ReviewArgs),

    /// Cancel a run.
    Cancel(RunArgs),

    /// Raise a run's budget cap, resuming it if paused on budget.
    Budget(BudgetArgs),

    /// Print the Prometheus metrics exposition.
    Metrics,
}

/// Arguments for commands reading a narrative file.
#[derive(Parser, Debug)]
pub struct InputArgs {
    /// JSON file holding a parsed narrative or a bare array of units.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output JSON instead of a human-readable summary.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `reelforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Run to show; every run when omitted.
    pub run_id: Option<Uuid>,

    /// Directory of persisted runs.
    #[arg(short, long, default_value = DEFAULT_STORE_DIR)]
    pub store: PathBuf,

    /// Output JSON instead of a human-readable summary.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for commands addressing one run.
#[derive(Parser, Debug)]
pub struct RunArgs {
    pub run_id: Uuid,

    /// Directory of persisted runs.
    #[arg(short, long, default_value = DEFAULT_STORE_DIR)]
    pub store: PathBuf,
}

/// Arguments for `reelforge review`.
#[derive(Parser, Debug)]
pub struct ReviewArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Approve the refined artifact.
    #[arg(long, conflicts_with_all = ["request_changes", "reject"])]
    pub approve: bool,

    /// Send the artifact back to refinement with these notes.
    #[arg(long, conflicts_with = "reject")]
    pub request_changes: Option<String>,

    /// Reject the run with this reason.
    #[arg(long)]
    pub reject: Option<String>,
}

impl ReviewArgs {
    fn decision(&self) -> anyhow::Result<ReviewDecision> {
        if self.approve {
            return Ok(ReviewDecision::Approve);
        }
        if let Some(notes) = &self.request_changes {
            return Ok(ReviewDecision::RequestChanges {
                notes: notes.clone(),
            });
        }
        if let Some(reason) = &self.reject {
            return Ok(ReviewDecision::Reject {
                reason: reason.clone(),
            });
        }
        anyhow::bail!("one of --approve, --request-changes or --reject is required")
    }
}

/// Arguments for `reelforge budget`.
#[derive(Parser, Debug)]
pub struct BudgetArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// New budget cap in dollars.
    #[arg(long)]
    pub cap: f64,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI args and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ReelforgeConfig::from_yaml_file(path)?,
        None => ReelforgeConfig::from_env()?,
    };

    match cli.command {
        Commands::Plan(args) => run_plan_command(args, &config),
        Commands::Validate(args) => run_validate_command(args),
        Commands::Status(args) => run_status_command(args).await,
        Commands::Review(args) => {
            let decision = args.decision()?;
            let orchestrator = open_orchestrator(&args.run.store, config).await?;
            let run = orchestrator.resolve_review(args.run.run_id, decision).await?;
            println!("{}", run.summary());
            Ok(())
        }
        Commands::Cancel(args) => {
            let orchestrator = open_orchestrator(&args.store, config).await?;
            let run = orchestrator.cancel(args.run_id).await?;
            println!("{}", run.summary());
            Ok(())
        }
        Commands::Budget(args) => {
            let orchestrator = open_orchestrator(&args.run.store, config).await?;
            let run = orchestrator.resume_budget(args.run.run_id, args.cap).await?;
            println!("{}", run.summary());
            Ok(())
        }
        Commands::Metrics => {
            init_metrics()?;
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

/// Read a narrative file holding either a parsed narrative or a unit array.
fn read_units(path: &Path) -> anyhow::Result<Vec<NarrativeUnit>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let value: Value = serde_json::from_str(&content)?;
    let units = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        serde_json::from_value::<ParsedNarrative>(value)?.units
    };
    Ok(units)
}

fn run_plan_command(args: InputArgs, config: &ReelforgeConfig) -> anyhow::Result<()> {
    let units = read_units(&args.input)?;
    let plans = plan_sequence(&units, &config.planner)?;
    info!(units = units.len(), "Planned narrative");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    for plan in &plans {
        println!(
            "{}: {} shots, {:.1}s of {:.1}s target, {} pacing",
            plan.unit_id,
            plan.shots.len(),
            plan.total_duration(),
            plan.target_duration_secs,
            plan.pacing
        );
        for shot in &plan.shots {
            println!(
                "  {:>2}. {:<14} {:>5.1}s  {}",
                shot.sequence, shot.shot_type, shot.duration_secs, shot.subject
            );
        }
        for note in &plan.notes {
            println!("  note: {}", note);
        }
    }
    Ok(())
}

fn run_validate_command(args: InputArgs) -> anyhow::Result<()> {
    let units = read_units(&args.input)?;
    let validation = validate_sequence(&units, Canon::new())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&validation)?);
        return Ok(());
    }

    for validated in &validation.units {
        let marker = if validated.overlay.flagged_for_correction {
            " [flagged]"
        } else {
            ""
        };
        println!(
            "{}: score {:.2}{}",
            validated.unit.id, validated.overlay.score, marker
        );
        for violation in &validated.overlay.violations {
            println!("  [{}] {}", violation.severity, violation.message);
        }
    }
    println!("mean continuity score: {:.2}", validation.mean_score());
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let store = FileRunStore::open(&args.store).await?;
    let ids = match args.run_id {
        Some(id) => vec![id],
        None => store.list().await?,
    };

    for id in ids {
        let run = store.load(id).await?;
        if args.json {
            println!("{}", serde_json::to_string(&run.summary())?);
        } else {
            println!("{}", run.summary());
        }
    }
    Ok(())
}

/// Critic used by CLI orchestrators, which never drive refinement.
struct OfflineCritic;

#[async_trait]
impl QualityCritic<Value> for OfflineCritic {
    async fn critique(&self, _artifact: &Value) -> Result<QualityReport, CriticError> {
        Err(CriticError::Unavailable(
            "no critic is configured for the command line".to_string(),
        ))
    }
}

async fn open_orchestrator(store: &Path, config: ReelforgeConfig) -> anyhow::Result<Orchestrator> {
    let store = FileRunStore::open(store)
        .await?
        .with_lock_ttl(config.orchestrator.lock_ttl());
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(store),
        StageRegistry::new(),
        Arc::new(OfflineCritic),
    )?;
    Ok(orchestrator)
}
