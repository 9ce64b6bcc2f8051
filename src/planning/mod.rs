//! Shot budget planning.
//!
//! Builds a timed shot skeleton per narrative unit. Plan totals always match
//! their target within one rounding unit (0.1 s), including after playbook
//! overrides and individual shot replacement.
//!
//! # Example
//!
//! ```
//! use reelforge::narrative::NarrativeUnit;
//! use reelforge::planning::{plan, Pacing, PlannerConfig};
//!
//! let unit = NarrativeUnit::new("scene-1", 1).with_emotion("sorrow", 0.3);
//! let config = PlannerConfig::default().with_shot_count(5).with_pacing(Pacing::Contemplative);
//! let shots = plan(&unit, &config, None).unwrap();
//! assert_eq!(shots.total_duration(), 60.0);
//! ```

pub mod config;
pub mod constraints;
mod durations;
pub mod planner;
pub mod types;

pub use config::PlannerConfig;
pub use constraints::{apply_constraints, PlaybookConstraint};
pub use planner::{complexity_score, plan, plan_sequence, plan_with_context, PlanContext};
pub use types::{
    AppliedConstraint, CameraMotion, DurationBounds, HookStrategy, Pacing, Shot, ShotPlan,
    ShotRole, ShotType, Transition, TransitionKind,
};
