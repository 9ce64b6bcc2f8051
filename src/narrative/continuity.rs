//! Continuity validation of narrative units against canon.
//!
//! Four independent rules are checked per unit:
//!
//! 1. Referenced characters must be introduced at or before the unit
//!    (CRITICAL if never introduced, HIGH if introduced later).
//! 2. Locations shown in close detail must already be established (MEDIUM).
//! 3. Explicit time markers must not regress unless the unit is a
//!    flashback (HIGH).
//! 4. Props seen again must match their last known state, and removed props
//!    must not reappear (LOW).
//!
//! The canon delta of a unit is merged only when the unit has no CRITICAL
//! violation; otherwise canon is left untouched and the unit is flagged.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::canon::{Canon, CanonDelta, PropFact};
use super::types::NarrativeUnit;
use crate::error::NarrativeError;

/// Severity of a continuity violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationSeverity {
    /// Weight of one violation in the continuity score.
    pub fn weight(&self) -> f64 {
        match self {
            ViolationSeverity::Critical => 1.0,
            ViolationSeverity::High => 0.75,
            ViolationSeverity::Medium => 0.5,
            ViolationSeverity::Low => 0.25,
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationSeverity::Low => write!(f, "low"),
            ViolationSeverity::Medium => write!(f, "medium"),
            ViolationSeverity::High => write!(f, "high"),
            ViolationSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Which rule produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityRule {
    CharacterIntroduction,
    LocationEstablished,
    TimeProgression,
    PropState,
}

/// A detected inconsistency between a unit and canon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub unit_id: String,
    pub rule: ContinuityRule,
    pub severity: ViolationSeverity,
    /// Entity the violation is about.
    pub entity: String,
    pub message: String,
}

/// Validation results attached beside an unmodified unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityOverlay {
    /// Continuity score in [0, 1].
    pub score: f64,
    pub violations: Vec<Violation>,
    /// Set when a CRITICAL violation blocked the canon merge.
    pub flagged_for_correction: bool,
}

impl ContinuityOverlay {
    pub fn has_critical(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Critical)
    }
}

/// A unit together with its continuity overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedUnit {
    pub unit: NarrativeUnit,
    pub overlay: ContinuityOverlay,
}

/// Result of validating a whole sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceValidation {
    pub units: Vec<ValidatedUnit>,
    /// Canon after merging every non-flagged unit.
    pub canon: Canon,
}

impl SequenceValidation {
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.units.iter().flat_map(|u| u.overlay.violations.iter())
    }

    pub fn flagged_units(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| u.overlay.flagged_for_correction)
            .map(|u| u.unit.id.as_str())
            .collect()
    }

    /// Mean continuity score across units (1.0 for an empty sequence).
    pub fn mean_score(&self) -> f64 {
        if self.units.is_empty() {
            return 1.0;
        }
        self.units.iter().map(|u| u.overlay.score).sum::<f64>() / self.units.len() as f64
    }
}

/// Validate one unit against canon.
///
/// Returns the unit with its overlay, the canon delta it would contribute,
/// and the violations found. Canon itself is never modified here.
pub fn validate(unit: &NarrativeUnit, canon: &Canon) -> (ValidatedUnit, CanonDelta, Vec<Violation>) {
    let mut violations = Vec::new();

    check_characters(unit, canon, &mut violations);
    check_close_detail_locations(unit, canon, &mut violations);
    check_time_marker(unit, canon, &mut violations);
    check_props(unit, canon, &mut violations);

    let score = continuity_score(unit.reference_count(), &violations);
    let flagged = violations
        .iter()
        .any(|v| v.severity == ViolationSeverity::Critical);

    let delta = build_delta(unit);
    let validated = ValidatedUnit {
        unit: unit.clone(),
        overlay: ContinuityOverlay {
            score,
            violations: violations.clone(),
            flagged_for_correction: flagged,
        },
    };

    (validated, delta, violations)
}

/// Validate units in narrative order, merging each clean unit's delta before
/// the next unit is checked.
///
/// # Errors
///
/// Returns `NarrativeError::OutOfOrder` if sequences are not strictly
/// increasing.
pub fn validate_sequence(
    units: &[NarrativeUnit],
    canon: Canon,
) -> Result<SequenceValidation, NarrativeError> {
    let mut previous: Option<u32> = None;
    for unit in units {
        if let Some(prev) = previous {
            if unit.sequence <= prev {
                return Err(NarrativeError::OutOfOrder {
                    unit_id: unit.id.clone(),
                    sequence: unit.sequence,
                    previous: prev,
                });
            }
        }
        previous = Some(unit.sequence);
    }

    let mut canon = canon;
    let mut validated_units = Vec::with_capacity(units.len());

    for unit in units {
        let (validated, delta, violations) = validate(unit, &canon);

        if validated.overlay.flagged_for_correction {
            tracing::warn!(
                unit_id = %unit.id,
                sequence = unit.sequence,
                violations = violations.len(),
                "Critical continuity violation, canon left unchanged"
            );
        } else {
            canon.apply(&delta);
            if !violations.is_empty() {
                tracing::warn!(
                    unit_id = %unit.id,
                    sequence = unit.sequence,
                    violations = violations.len(),
                    score = validated.overlay.score,
                    "Continuity violations detected"
                );
            }
        }

        validated_units.push(validated);
    }

    Ok(SequenceValidation {
        units: validated_units,
        canon,
    })
}

fn continuity_score(reference_count: usize, violations: &[Violation]) -> f64 {
    if reference_count == 0 {
        return 1.0;
    }
    let weighted: f64 = violations.iter().map(|v| v.severity.weight()).sum();
    (1.0 - weighted / reference_count as f64).clamp(0.0, 1.0)
}

fn check_characters(unit: &NarrativeUnit, canon: &Canon, violations: &mut Vec<Violation>) {
    for character in &unit.characters {
        if unit.introduces.contains(character) {
            continue;
        }
        match canon.introduced_at(character) {
            Some(seq) if seq <= unit.sequence => {}
            Some(seq) => violations.push(Violation {
                unit_id: unit.id.clone(),
                rule: ContinuityRule::CharacterIntroduction,
                severity: ViolationSeverity::High,
                entity: character.clone(),
                message: format!(
                    "character '{}' appears in unit {} but is introduced in unit {}",
                    character, unit.sequence, seq
                ),
            }),
            None => violations.push(Violation {
                unit_id: unit.id.clone(),
                rule: ContinuityRule::CharacterIntroduction,
                severity: ViolationSeverity::Critical,
                entity: character.clone(),
                message: format!(
                    "character '{}' appears in unit {} but is never introduced",
                    character, unit.sequence
                ),
            }),
        }
    }
}

fn check_close_detail_locations(
    unit: &NarrativeUnit,
    canon: &Canon,
    violations: &mut Vec<Violation>,
) {
    for location in &unit.close_detail_locations {
        if canon.has_location(location) || unit.locations.contains(location) {
            continue;
        }
        violations.push(Violation {
            unit_id: unit.id.clone(),
            rule: ContinuityRule::LocationEstablished,
            severity: ViolationSeverity::Medium,
            entity: location.clone(),
            message: format!(
                "location '{}' shown in close detail before it is established",
                location
            ),
        });
    }
}

fn check_time_marker(unit: &NarrativeUnit, canon: &Canon, violations: &mut Vec<Violation>) {
    let (Some(marker), Some(latest)) = (unit.time_marker, canon.latest_time_marker) else {
        return;
    };
    if marker < latest && !unit.is_flashback {
        violations.push(Violation {
            unit_id: unit.id.clone(),
            rule: ContinuityRule::TimeProgression,
            severity: ViolationSeverity::High,
            entity: format!("t{}", marker),
            message: format!(
                "time marker {} regresses from {} without a flashback flag",
                marker, latest
            ),
        });
    }
}

fn check_props(unit: &NarrativeUnit, canon: &Canon, violations: &mut Vec<Violation>) {
    for prop in &unit.props {
        let Some(fact) = canon.prop(&prop.id) else {
            continue;
        };
        if prop.removed {
            continue;
        }
        let message = if fact.removed {
            format!(
                "prop '{}' reappears after being removed in unit {}",
                prop.id, fact.last_seen
            )
        } else if fact.state != prop.state {
            format!(
                "prop '{}' is '{}' but was last '{}' in unit {}",
                prop.id, prop.state, fact.state, fact.last_seen
            )
        } else {
            continue;
        };
        violations.push(Violation {
            unit_id: unit.id.clone(),
            rule: ContinuityRule::PropState,
            severity: ViolationSeverity::Low,
            entity: prop.id.clone(),
            message,
        });
    }
}

fn build_delta(unit: &NarrativeUnit) -> CanonDelta {
    let mut delta = CanonDelta::default();
    for character in &unit.introduces {
        delta
            .introductions
            .insert(character.clone(), unit.sequence);
    }
    delta.locations.extend(unit.locations.iter().cloned());
    if !unit.setting.location_name.is_empty() {
        delta.locations.insert(unit.setting.location_name.clone());
    }
    if !unit.is_flashback {
        delta.time_marker = unit.time_marker;
    }
    for prop in &unit.props {
        delta.props.insert(
            prop.id.clone(),
            PropFact {
                state: prop.state.clone(),
                removed: prop.removed,
                last_seen: unit.sequence,
            },
        );
    }
    delta
}
