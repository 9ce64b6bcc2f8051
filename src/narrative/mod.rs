//! Narrative units, canon and continuity validation.
//!
//! Units are validated strictly in narrative order. Each clean unit's facts
//! are merged into canon before the next unit is checked, so later units
//! are judged against everything established before them.

pub mod canon;
pub mod continuity;
pub mod types;

pub use canon::{Canon, CanonDelta, Correction, CorrectionRecord, PropFact};
pub use continuity::{
    validate, validate_sequence, ContinuityOverlay, ContinuityRule, SequenceValidation,
    ValidatedUnit, Violation, ViolationSeverity,
};
pub use types::{EmotionalBeat, NarrativeUnit, ParsedNarrative, PropRef, Setting};
