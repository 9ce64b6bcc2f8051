//! Accumulated narrative canon.
//!
//! Canon is an append-only mapping from entity id to the facts established
//! about it. Facts are only ever removed through an explicit `Correction`,
//! which is itself recorded.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::NarrativeUnit;
use crate::error::NarrativeError;

/// Last known state of a prop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropFact {
    pub state: String,
    pub removed: bool,
    /// Sequence of the unit that last touched the prop.
    pub last_seen: u32,
}

/// Facts established by one validated unit, pending merge into canon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonDelta {
    pub introductions: BTreeMap<String, u32>,
    pub locations: BTreeSet<String>,
    pub time_marker: Option<u32>,
    pub props: BTreeMap<String, PropFact>,
}

impl CanonDelta {
    pub fn is_empty(&self) -> bool {
        self.introductions.is_empty()
            && self.locations.is_empty()
            && self.time_marker.is_none()
            && self.props.is_empty()
    }
}

/// Explicit retraction of a canon fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Correction {
    RetractIntroduction { character: String },
    RetractLocation { location: String },
    ResetTimeMarker { marker: Option<u32> },
    RetractProp { prop: String },
}

/// Logged correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub correction: Correction,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
}

/// Established facts accumulated across units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Canon {
    /// Character id to the sequence of the unit that introduced it.
    pub character_introductions: BTreeMap<String, u32>,
    pub locations: BTreeSet<String>,
    /// Latest non-flashback time marker seen so far.
    pub latest_time_marker: Option<u32>,
    pub props: BTreeMap<String, PropFact>,
    #[serde(default)]
    pub corrections: Vec<CorrectionRecord>,
}

impl Canon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Introduction order for a whole story: each character maps to the
    /// first unit that introduces it.
    ///
    /// Checking a unit against this canon classifies forward references as
    /// "introduced later" instead of "never introduced".
    pub fn from_units(units: &[NarrativeUnit]) -> Self {
        let mut canon = Self::default();
        for unit in units {
            for character in &unit.introduces {
                canon
                    .character_introductions
                    .entry(character.clone())
                    .and_modify(|seq| *seq = (*seq).min(unit.sequence))
                    .or_insert(unit.sequence);
            }
        }
        canon
    }

    /// Sequence at which a character was introduced, if known.
    pub fn introduced_at(&self, character: &str) -> Option<u32> {
        self.character_introductions.get(character).copied()
    }

    pub fn has_location(&self, location: &str) -> bool {
        self.locations.contains(location)
    }

    pub fn prop(&self, id: &str) -> Option<&PropFact> {
        self.props.get(id)
    }

    /// Merge a delta. Introductions keep the earliest sequence, locations
    /// only grow, the time marker only moves forward and props take their
    /// newest state.
    pub fn apply(&mut self, delta: &CanonDelta) {
        for (character, &sequence) in &delta.introductions {
            self.character_introductions
                .entry(character.clone())
                .and_modify(|seq| *seq = (*seq).min(sequence))
                .or_insert(sequence);
        }

        self.locations.extend(delta.locations.iter().cloned());

        if let Some(marker) = delta.time_marker {
            self.latest_time_marker = Some(self.latest_time_marker.map_or(marker, |m| m.max(marker)));
        }

        for (id, fact) in &delta.props {
            self.props.insert(id.clone(), fact.clone());
        }
    }

    /// Apply an explicit correction and log it.
    pub fn correct(
        &mut self,
        correction: Correction,
        reason: impl Into<String>,
    ) -> Result<(), NarrativeError> {
        match &correction {
            Correction::RetractIntroduction { character } => {
                if self.character_introductions.remove(character).is_none() {
                    return Err(NarrativeError::UnknownEntity(character.clone()));
                }
            }
            Correction::RetractLocation { location } => {
                if !self.locations.remove(location) {
                    return Err(NarrativeError::UnknownEntity(location.clone()));
                }
            }
            Correction::ResetTimeMarker { marker } => {
                self.latest_time_marker = *marker;
            }
            Correction::RetractProp { prop } => {
                if self.props.remove(prop).is_none() {
                    return Err(NarrativeError::UnknownEntity(prop.clone()));
                }
            }
        }

        let reason = reason.into();
        tracing::info!(correction = ?correction, reason = %reason, "Canon corrected");
        self.corrections.push(CorrectionRecord {
            correction,
            reason,
            applied_at: Utc::now(),
        });
        Ok(())
    }

    /// Total number of facts held, used to check monotonic growth.
    pub fn fact_count(&self) -> usize {
        self.character_introductions.len()
            + self.locations.len()
            + usize::from(self.latest_time_marker.is_some())
            + self.props.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_introducing(character: &str, sequence: u32) -> CanonDelta {
        let mut delta = CanonDelta::default();
        delta
            .introductions
            .insert(character.to_string(), sequence);
        delta
    }

    #[test]
    fn test_apply_keeps_earliest_introduction() {
        let mut canon = Canon::new();
        canon.apply(&delta_introducing("mara", 2));
        canon.apply(&delta_introducing("mara", 5));
        canon.apply(&delta_introducing("mara", 1));
        assert_eq!(canon.introduced_at("mara"), Some(1));
    }

    #[test]
    fn test_time_marker_only_moves_forward() {
        let mut canon = Canon::new();
        let mut delta = CanonDelta {
            time_marker: Some(4),
            ..CanonDelta::default()
        };
        canon.apply(&delta);
        delta.time_marker = Some(2);
        canon.apply(&delta);
        assert_eq!(canon.latest_time_marker, Some(4));
    }

    #[test]
    fn test_apply_never_removes_facts() {
        let mut canon = Canon::new();
        let mut delta = delta_introducing("mara", 1);
        delta.locations.insert("harbor".to_string());
        delta.props.insert(
            "lantern".to_string(),
            PropFact {
                state: "lit".to_string(),
                removed: false,
                last_seen: 1,
            },
        );
        canon.apply(&delta);
        let before = canon.fact_count();

        let mut removal = CanonDelta::default();
        removal.props.insert(
            "lantern".to_string(),
            PropFact {
                state: "smashed".to_string(),
                removed: true,
                last_seen: 2,
            },
        );
        canon.apply(&removal);

        assert_eq!(canon.fact_count(), before);
        assert!(canon.prop("lantern").map(|p| p.removed).unwrap_or(false));
    }

    #[test]
    fn test_correction_is_logged() {
        let mut canon = Canon::new();
        canon.apply(&delta_introducing("ghost", 3));

        canon
            .correct(
                Correction::RetractIntroduction {
                    character: "ghost".to_string(),
                },
                "cut from the story",
            )
            .unwrap();

        assert!(canon.introduced_at("ghost").is_none());
        assert_eq!(canon.corrections.len(), 1);
        assert_eq!(canon.corrections[0].reason, "cut from the story");
    }

    #[test]
    fn test_correction_of_unknown_entity_fails() {
        let mut canon = Canon::new();
        let result = canon.correct(
            Correction::RetractLocation {
                location: "moon".to_string(),
            },
            "typo",
        );
        assert!(matches!(result, Err(NarrativeError::UnknownEntity(_))));
        assert!(canon.corrections.is_empty());
    }

    #[test]
    fn test_from_units_uses_first_introduction() {
        let units = vec![
            NarrativeUnit::new("u1", 1).with_introductions(["ava"]),
            NarrativeUnit::new("u2", 2).with_introductions(["ben", "ava"]),
            NarrativeUnit::new("u3", 3).with_introductions(["cy"]),
        ];
        let canon = Canon::from_units(&units);
        assert_eq!(canon.introduced_at("ava"), Some(1));
        assert_eq!(canon.introduced_at("ben"), Some(2));
        assert_eq!(canon.introduced_at("cy"), Some(3));
        assert!(canon.locations.is_empty());
    }
}
