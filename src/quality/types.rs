//! Quality report model produced by critics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Quality dimension an issue is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    NarrativeClarity,
    HookStrength,
    Pacing,
    ShotComposition,
    Continuity,
    AudioMix,
    /// Any dimension name this crate does not know.
    #[serde(other)]
    Other,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::NarrativeClarity => "narrative_clarity",
            Dimension::HookStrength => "hook_strength",
            Dimension::Pacing => "pacing",
            Dimension::ShotComposition => "shot_composition",
            Dimension::Continuity => "continuity",
            Dimension::AudioMix => "audio_mix",
            Dimension::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Issue severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Major,
    Minor,
    Suggestion,
}

impl IssueSeverity {
    /// Priority multiplier used when ordering fixes.
    pub fn multiplier(&self) -> f64 {
        match self {
            IssueSeverity::Critical => 2.0,
            IssueSeverity::Major => 1.5,
            IssueSeverity::Minor => 1.0,
            IssueSeverity::Suggestion => 0.5,
        }
    }
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssueSeverity::Critical => "critical",
            IssueSeverity::Major => "major",
            IssueSeverity::Minor => "minor",
            IssueSeverity::Suggestion => "suggestion",
        };
        write!(f, "{}", name)
    }
}

/// Kind of repair an issue calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixCategory {
    RegenerateImage,
    AdjustComposition,
    FixConsistency,
    ChangeShotType,
    AdjustDuration,
    ChangeTransition,
    ReorderShots,
    RegenerateVoiceover,
    AdjustAudioMix,
    ChangeMusic,
    AddSfx,
    RewriteNarration,
    AddShot,
    RemoveShot,
    #[serde(other)]
    Other,
}

/// Critic's overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    ApproveWithNotes,
    MinorFixes,
    MajorRevision,
    Reject,
}

impl Recommendation {
    pub fn is_approval(&self) -> bool {
        matches!(self, Recommendation::Approve | Recommendation::ApproveWithNotes)
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Recommendation::Approve => "approve",
            Recommendation::ApproveWithNotes => "approve_with_notes",
            Recommendation::MinorFixes => "minor_fixes",
            Recommendation::MajorRevision => "major_revision",
            Recommendation::Reject => "reject",
        };
        write!(f, "{}", name)
    }
}

/// A typed defect reported against one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub dimension: Dimension,
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(default = "default_fix_category")]
    pub fix_category: FixCategory,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

fn default_fix_category() -> FixCategory {
    FixCategory::Other
}

impl Issue {
    pub fn new(dimension: Dimension, severity: IssueSeverity, description: impl Into<String>) -> Self {
        Self {
            id: format!("issue-{}", Uuid::new_v4().simple()),
            dimension,
            severity,
            description: description.into(),
            fix_category: FixCategory::Other,
            suggested_fix: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_fix(mut self, category: FixCategory, suggestion: impl Into<String>) -> Self {
        self.fix_category = category;
        self.suggested_fix = Some(suggestion.into());
        self
    }
}

/// Per-dimension scores, each in 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionScores {
    pub narrative_clarity: u8,
    pub hook_strength: u8,
    pub pacing: u8,
    pub shot_composition: u8,
    pub continuity: u8,
    pub audio_mix: u8,
}

impl Default for DimensionScores {
    fn default() -> Self {
        Self::uniform(3)
    }
}

impl DimensionScores {
    pub fn uniform(score: u8) -> Self {
        let s = score.clamp(1, 5);
        Self {
            narrative_clarity: s,
            hook_strength: s,
            pacing: s,
            shot_composition: s,
            continuity: s,
            audio_mix: s,
        }
    }

    /// Clamp every score into 1..=5.
    pub fn clamped(self) -> Self {
        Self {
            narrative_clarity: self.narrative_clarity.clamp(1, 5),
            hook_strength: self.hook_strength.clamp(1, 5),
            pacing: self.pacing.clamp(1, 5),
            shot_composition: self.shot_composition.clamp(1, 5),
            continuity: self.continuity.clamp(1, 5),
            audio_mix: self.audio_mix.clamp(1, 5),
        }
    }

    pub fn average(&self) -> f64 {
        let sum = self.narrative_clarity as u32
            + self.hook_strength as u32
            + self.pacing as u32
            + self.shot_composition as u32
            + self.continuity as u32
            + self.audio_mix as u32;
        sum as f64 / 6.0
    }

    /// Average mapped onto the 0-10 overall scale.
    pub fn to_overall_score(&self) -> f64 {
        self.average() * 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportData {
    #[serde(default = "new_report_id")]
    id: String,
    overall_score: f64,
    #[serde(default)]
    dimension_scores: DimensionScores,
    #[serde(default)]
    issues: Vec<Issue>,
    recommendation: Recommendation,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

fn new_report_id() -> String {
    format!("report-{}", Uuid::new_v4().simple())
}

/// A critic's structured verdict on one artifact.
///
/// Scores are clamped on construction and deserialization; a report is
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ReportData", into = "ReportData")]
pub struct QualityReport {
    id: String,
    overall_score: f64,
    dimension_scores: DimensionScores,
    issues: Vec<Issue>,
    recommendation: Recommendation,
    created_at: DateTime<Utc>,
}

impl From<ReportData> for QualityReport {
    fn from(data: ReportData) -> Self {
        Self {
            id: data.id,
            overall_score: clamp_overall(data.overall_score),
            dimension_scores: data.dimension_scores.clamped(),
            issues: data.issues,
            recommendation: data.recommendation,
            created_at: data.created_at,
        }
    }
}

impl From<QualityReport> for ReportData {
    fn from(report: QualityReport) -> Self {
        Self {
            id: report.id,
            overall_score: report.overall_score,
            dimension_scores: report.dimension_scores,
            issues: report.issues,
            recommendation: report.recommendation,
            created_at: report.created_at,
        }
    }
}

fn clamp_overall(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 10.0)
    } else {
        0.0
    }
}

impl QualityReport {
    pub fn new(
        overall_score: f64,
        dimension_scores: DimensionScores,
        issues: Vec<Issue>,
        recommendation: Recommendation,
    ) -> Self {
        ReportData {
            id: new_report_id(),
            overall_score,
            dimension_scores,
            issues,
            recommendation,
            created_at: Utc::now(),
        }
        .into()
    }

    /// Report whose overall score is derived from the dimension scores.
    pub fn from_dimensions(
        dimension_scores: DimensionScores,
        issues: Vec<Issue>,
        recommendation: Recommendation,
    ) -> Self {
        let overall = dimension_scores.clamped().to_overall_score();
        Self::new(overall, dimension_scores, issues, recommendation)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Overall score in [0, 10].
    pub fn overall_score(&self) -> f64 {
        self.overall_score
    }

    pub fn dimension_scores(&self) -> &DimensionScores {
        &self.dimension_scores
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn recommendation(&self) -> Recommendation {
        self.recommendation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_clamped_on_construction() {
        let report = QualityReport::new(
            14.0,
            DimensionScores {
                narrative_clarity: 9,
                hook_strength: 0,
                ..DimensionScores::default()
            },
            Vec::new(),
            Recommendation::Approve,
        );
        assert_eq!(report.overall_score(), 10.0);
        assert_eq!(report.dimension_scores().narrative_clarity, 5);
        assert_eq!(report.dimension_scores().hook_strength, 1);
    }

    #[test]
    fn test_scores_clamped_on_deserialize() {
        let json = r#"{
            "overall_score": -3.0,
            "recommendation": "major_revision",
            "issues": [
                {"id": "i1", "dimension": "lighting", "severity": "minor", "description": "flat"}
            ]
        }"#;
        let report: QualityReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.overall_score(), 0.0);
        assert_eq!(report.issues()[0].dimension, Dimension::Other);
        assert_eq!(report.issues()[0].fix_category, FixCategory::Other);
        assert_eq!(report.recommendation(), Recommendation::MajorRevision);
    }

    #[test]
    fn test_overall_from_dimensions() {
        let report = QualityReport::from_dimensions(
            DimensionScores::uniform(4),
            Vec::new(),
            Recommendation::ApproveWithNotes,
        );
        assert_eq!(report.overall_score(), 8.0);
        assert!(report.recommendation().is_approval());
        assert!(!Recommendation::MinorFixes.is_approval());
    }

    #[test]
    fn test_report_survives_serialization() {
        let report = QualityReport::new(
            6.5,
            DimensionScores::default(),
            vec![Issue::new(Dimension::Pacing, IssueSeverity::Major, "drags").with_id("p1")],
            Recommendation::MinorFixes,
        );
        let json = serde_json::to_string(&report).unwrap();
        let back: QualityReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
