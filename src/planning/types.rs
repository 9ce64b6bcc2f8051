//! Shot plan model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::durations::{from_tenths, to_tenths, water_fill};
use crate::error::PlanningError;

/// Framing of a shot, widest to closest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotType {
    ExtremeWide,
    Wide,
    MediumWide,
    Medium,
    MediumClose,
    CloseUp,
    ExtremeClose,
    Cutaway,
    Pov,
}

impl ShotType {
    pub const ALL: [ShotType; 9] = [
        ShotType::ExtremeWide,
        ShotType::Wide,
        ShotType::MediumWide,
        ShotType::Medium,
        ShotType::MediumClose,
        ShotType::CloseUp,
        ShotType::ExtremeClose,
        ShotType::Cutaway,
        ShotType::Pov,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShotType::ExtremeWide => "extreme_wide",
            ShotType::Wide => "wide",
            ShotType::MediumWide => "medium_wide",
            ShotType::Medium => "medium",
            ShotType::MediumClose => "medium_close",
            ShotType::CloseUp => "close_up",
            ShotType::ExtremeClose => "extreme_close",
            ShotType::Cutaway => "cutaway",
            ShotType::Pov => "pov",
        }
    }

    /// Nearest framing used when this type is disallowed.
    pub fn substitute(&self) -> ShotType {
        match self {
            ShotType::ExtremeClose => ShotType::CloseUp,
            ShotType::CloseUp => ShotType::MediumClose,
            ShotType::MediumClose => ShotType::Medium,
            ShotType::Medium => ShotType::MediumWide,
            ShotType::MediumWide => ShotType::Wide,
            ShotType::Wide => ShotType::ExtremeWide,
            ShotType::ExtremeWide => ShotType::Cutaway,
            ShotType::Cutaway => ShotType::Pov,
            ShotType::Pov => ShotType::ExtremeClose,
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, ShotType::ExtremeWide | ShotType::Wide)
    }
}

impl fmt::Display for ShotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ShotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        ShotType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown shot type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMotion {
    Static,
    PanLeft,
    PanRight,
    TiltUp,
    TiltDown,
    ZoomIn,
    ZoomOut,
    DollyIn,
    DollyOut,
    TrackLeft,
    TrackRight,
}

/// Cutting rhythm of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    Contemplative,
    Moderate,
    Dynamic,
    Intense,
}

impl Pacing {
    /// Pacing for a primary emotion; unknown emotions fall back to `default`.
    pub fn from_emotion(emotion: &str, default: Pacing) -> Pacing {
        match emotion.trim().to_lowercase().as_str() {
            "tension" | "anxiety" | "action" => Pacing::Dynamic,
            "chaos" | "triumph" => Pacing::Intense,
            "sorrow" | "contemplative" | "hope" => Pacing::Contemplative,
            _ => default,
        }
    }

    /// Multiplier applied to the even split of non-hook time.
    pub fn duration_factor(&self) -> f64 {
        match self {
            Pacing::Contemplative => 1.2,
            Pacing::Intense => 0.6,
            Pacing::Moderate | Pacing::Dynamic => 1.0,
        }
    }

    /// Adjustment to the shot count.
    pub fn shot_adjustment(&self) -> i64 {
        match self {
            Pacing::Contemplative => -1,
            Pacing::Moderate => 0,
            Pacing::Dynamic | Pacing::Intense => 2,
        }
    }
}

impl fmt::Display for Pacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pacing::Contemplative => "contemplative",
            Pacing::Moderate => "moderate",
            Pacing::Dynamic => "dynamic",
            Pacing::Intense => "intense",
        };
        write!(f, "{}", name)
    }
}

/// How the opening shot grabs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStrategy {
    VisualImpact,
    Mystery,
    Action,
    Emotional,
}

impl HookStrategy {
    /// Shot type and motion of the hook shot.
    pub fn hook_shot(&self) -> (ShotType, CameraMotion) {
        match self {
            HookStrategy::VisualImpact => (ShotType::ExtremeWide, CameraMotion::ZoomIn),
            HookStrategy::Mystery => (ShotType::ExtremeClose, CameraMotion::DollyOut),
            HookStrategy::Action => (ShotType::Medium, CameraMotion::TrackRight),
            HookStrategy::Emotional => (ShotType::CloseUp, CameraMotion::Static),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotRole {
    Hook,
    Action,
    Detail,
    Reaction,
    Climax,
    Transition,
    Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    Dissolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub duration_secs: f64,
}

/// One timed sub-unit of a unit's visual plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub id: String,
    /// Position within the plan, starting at 1.
    pub sequence: u32,
    pub shot_type: ShotType,
    pub motion: CameraMotion,
    pub role: ShotRole,
    pub duration_secs: f64,
    pub subject: String,
    /// Narration words voiced over this shot.
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub narration_words: usize,
    #[serde(default)]
    pub transition_out: Option<Transition>,
}

/// Record of a playbook constraint that changed the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedConstraint {
    pub token: String,
    /// Ids of the shots the constraint touched.
    pub applied_to: Vec<String>,
    pub change: String,
}

/// Per-shot duration bounds in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationBounds {
    pub min_secs: f64,
    pub max_secs: f64,
}

/// Ordered shots for one narrative unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotPlan {
    pub unit_id: String,
    pub shots: Vec<Shot>,
    pub target_duration_secs: f64,
    pub pacing: Pacing,
    pub hook_strategy: HookStrategy,
    pub complexity: f64,
    pub bounds: DurationBounds,
    #[serde(default)]
    pub constraints_applied: Vec<AppliedConstraint>,
    #[serde(default)]
    pub notes: Vec<String>,
    /// Set when the continuity validator flagged the source unit.
    #[serde(default)]
    pub continuity_flagged: bool,
}

impl ShotPlan {
    pub fn total_duration(&self) -> f64 {
        from_tenths(self.shots.iter().map(|s| to_tenths(s.duration_secs)).sum())
    }

    /// Whether the total is within one rounding unit (0.1 s) of target.
    pub fn within_tolerance(&self) -> bool {
        let total: i64 = self.shots.iter().map(|s| to_tenths(s.duration_secs)).sum();
        (total - to_tenths(self.target_duration_secs)).abs() <= 1
    }

    pub fn final_shot_type(&self) -> Option<ShotType> {
        self.shots.last().map(|s| s.shot_type)
    }

    /// Replace the shot at `index`, rebalancing the other shots so the total
    /// stays at target. The plan is left unchanged on error.
    pub fn replace_shot(&mut self, index: usize, shot: Shot) -> Result<(), PlanningError> {
        if index >= self.shots.len() {
            return Err(PlanningError::InvalidReplacement {
                index,
                reason: format!("plan has {} shots", self.shots.len()),
            });
        }
        let new_tenths = to_tenths(shot.duration_secs);
        if new_tenths <= 0 {
            return Err(PlanningError::InvalidReplacement {
                index,
                reason: "duration must be positive".to_string(),
            });
        }

        let mut durations: Vec<i64> = self
            .shots
            .iter()
            .map(|s| to_tenths(s.duration_secs))
            .collect();
        let delta = durations[index] - new_tenths;
        durations[index] = new_tenths;

        let min = to_tenths(self.bounds.min_secs);
        let max = to_tenths(self.bounds.max_secs);
        let lower: Vec<i64> = durations.iter().map(|&d| d.min(min)).collect();
        let upper: Vec<i64> = durations.iter().map(|&d| d.max(max)).collect();
        // The hook keeps its duration unless it is the shot being replaced.
        let eligible: Vec<bool> = (0..durations.len())
            .map(|i| i != index && (i != 0 || index == 0))
            .collect();

        let leftover = water_fill(&mut durations, delta, &lower, &upper, &eligible);
        if leftover.abs() > 1 {
            return Err(PlanningError::InvalidReplacement {
                index,
                reason: format!(
                    "other shots cannot absorb {:.1}s within [{:.1}s, {:.1}s]",
                    from_tenths(leftover),
                    self.bounds.min_secs,
                    self.bounds.max_secs
                ),
            });
        }

        let mut shot = shot;
        shot.sequence = self.shots[index].sequence;
        self.shots[index] = shot;
        for (s, d) in self.shots.iter_mut().zip(durations) {
            s.duration_secs = from_tenths(d);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot(seq: u32, shot_type: ShotType, duration: f64) -> Shot {
        Shot {
            id: format!("u1-shot-{}", seq),
            sequence: seq,
            shot_type,
            motion: CameraMotion::Static,
            role: ShotRole::Action,
            duration_secs: duration,
            subject: "subject".to_string(),
            narration: None,
            narration_words: 0,
            transition_out: None,
        }
    }

    fn plan() -> ShotPlan {
        ShotPlan {
            unit_id: "u1".to_string(),
            shots: vec![
                shot(1, ShotType::ExtremeWide, 3.0),
                shot(2, ShotType::Medium, 6.0),
                shot(3, ShotType::CloseUp, 6.0),
                shot(4, ShotType::Medium, 5.0),
            ],
            target_duration_secs: 20.0,
            pacing: Pacing::Moderate,
            hook_strategy: HookStrategy::VisualImpact,
            complexity: 0.4,
            bounds: DurationBounds {
                min_secs: 2.0,
                max_secs: 8.0,
            },
            constraints_applied: Vec::new(),
            notes: Vec::new(),
            continuity_flagged: false,
        }
    }

    #[test]
    fn test_shot_type_parse() {
        assert_eq!("close-up".parse::<ShotType>().unwrap(), ShotType::CloseUp);
        assert_eq!("EXTREME_CLOSE".parse::<ShotType>().unwrap(), ShotType::ExtremeClose);
        assert!("dutch".parse::<ShotType>().is_err());
    }

    #[test]
    fn test_pacing_table() {
        assert_eq!(Pacing::from_emotion("Tension", Pacing::Moderate), Pacing::Dynamic);
        assert_eq!(Pacing::from_emotion("chaos", Pacing::Moderate), Pacing::Intense);
        assert_eq!(Pacing::from_emotion("hope", Pacing::Moderate), Pacing::Contemplative);
        assert_eq!(Pacing::from_emotion("joy", Pacing::Moderate), Pacing::Moderate);
    }

    #[test]
    fn test_replace_shot_preserves_total() {
        let mut plan = plan();
        plan.replace_shot(2, shot(9, ShotType::Cutaway, 3.0)).unwrap();

        assert!(plan.within_tolerance());
        assert_eq!(plan.total_duration(), 20.0);
        assert_eq!(plan.shots[2].shot_type, ShotType::Cutaway);
        assert_eq!(plan.shots[2].sequence, 3);
        assert_eq!(plan.shots[2].duration_secs, 3.0);
        assert_eq!(plan.shots[0].duration_secs, 3.0);
    }

    #[test]
    fn test_replace_shot_rejects_unabsorbable_change() {
        let mut plan = plan();
        let before = plan.clone();
        let err = plan
            .replace_shot(1, shot(2, ShotType::Medium, 16.0))
            .unwrap_err();
        assert!(matches!(err, PlanningError::InvalidReplacement { index: 1, .. }));
        assert_eq!(plan, before);
    }

    #[test]
    fn test_replace_shot_out_of_range() {
        let mut plan = plan();
        assert!(plan.replace_shot(7, shot(8, ShotType::Wide, 3.0)).is_err());
    }
}
