//! Narrative unit model.
//!
//! A `NarrativeUnit` is one ordered beat of a story (a scene) together with
//! the entity references continuity checks run against. Units are immutable
//! once validated; validation results live in a `ContinuityOverlay` beside
//! the unit.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Physical and temporal setting of a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Setting {
    pub location_name: String,
    pub location_description: String,
    pub time_of_day: Option<String>,
    pub era: Option<String>,
    pub atmosphere: Option<String>,
    pub interior_exterior: Option<String>,
}

/// Emotional beat carried by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionalBeat {
    /// Primary emotion, e.g. "tension", "sorrow", "hope".
    pub primary_emotion: String,
    /// Intensity in [0, 1].
    pub intensity: f64,
    /// Arc within the unit, e.g. "rising" or "falling".
    pub arc: Option<String>,
    /// Narrative function, e.g. "hook", "climax", "resolution".
    pub narrative_function: Option<String>,
}

impl Default for EmotionalBeat {
    fn default() -> Self {
        Self {
            primary_emotion: "neutral".to_string(),
            intensity: 0.5,
            arc: None,
            narrative_function: None,
        }
    }
}

impl EmotionalBeat {
    pub fn new(primary_emotion: impl Into<String>, intensity: f64) -> Self {
        Self {
            primary_emotion: primary_emotion.into(),
            intensity: intensity.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    /// Intensity clamped to [0, 1].
    pub fn clamped_intensity(&self) -> f64 {
        if self.intensity.is_finite() {
            self.intensity.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// A prop referenced by a unit, with the state it appears in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropRef {
    pub id: String,
    pub state: String,
    /// The unit removes this prop from the story (destroyed, taken away).
    #[serde(default)]
    pub removed: bool,
}

impl PropRef {
    pub fn new(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: state.into(),
            removed: false,
        }
    }

    pub fn removed(mut self) -> Self {
        self.removed = true;
        self
    }
}

/// One ordered unit of a narrative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeUnit {
    pub id: String,
    #[serde(default)]
    pub story_id: String,
    /// Position in narrative order, starting at 1.
    pub sequence: u32,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub setting: Setting,
    #[serde(default)]
    pub emotional_beat: EmotionalBeat,
    /// Characters referenced anywhere in the unit.
    #[serde(default)]
    pub characters: Vec<String>,
    /// Characters this unit introduces to the audience.
    #[serde(default)]
    pub introduces: Vec<String>,
    /// Locations this unit establishes on screen.
    #[serde(default)]
    pub locations: Vec<String>,
    /// Locations shown in close detail.
    #[serde(default)]
    pub close_detail_locations: Vec<String>,
    #[serde(default)]
    pub props: Vec<PropRef>,
    /// Explicit story-time ordinal, if the text pins one.
    #[serde(default)]
    pub time_marker: Option<u32>,
    #[serde(default)]
    pub is_flashback: bool,
    /// Narration text to be voiced over the unit's shots.
    #[serde(default)]
    pub narration: Option<String>,
    /// Estimated screen time in seconds.
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
    /// Playbook constraint tokens applied by the shot planner.
    #[serde(default)]
    pub playbook_constraints: Vec<String>,
}

impl NarrativeUnit {
    pub fn new(id: impl Into<String>, sequence: u32) -> Self {
        Self {
            id: id.into(),
            story_id: String::new(),
            sequence,
            raw_text: String::new(),
            summary: String::new(),
            setting: Setting::default(),
            emotional_beat: EmotionalBeat::default(),
            characters: Vec::new(),
            introduces: Vec::new(),
            locations: Vec::new(),
            close_detail_locations: Vec::new(),
            props: Vec::new(),
            time_marker: None,
            is_flashback: false,
            narration: None,
            estimated_duration_secs: None,
            playbook_constraints: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.raw_text = text.into();
        self
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>, intensity: f64) -> Self {
        self.emotional_beat = EmotionalBeat::new(emotion, intensity);
        self
    }

    pub fn with_characters<I, S>(mut self, characters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.characters = characters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_introductions<I, S>(mut self, characters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.introduces = characters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_close_detail<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.close_detail_locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_props(mut self, props: Vec<PropRef>) -> Self {
        self.props = props;
        self
    }

    pub fn with_time_marker(mut self, marker: u32) -> Self {
        self.time_marker = Some(marker);
        self
    }

    pub fn as_flashback(mut self) -> Self {
        self.is_flashback = true;
        self
    }

    pub fn with_narration(mut self, narration: impl Into<String>) -> Self {
        self.narration = Some(narration.into());
        self
    }

    pub fn with_constraints<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.playbook_constraints = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn word_count(&self) -> usize {
        self.raw_text.split_whitespace().count()
    }

    /// Number of distinct entities (characters, locations, props) the unit touches.
    pub fn entity_count(&self) -> usize {
        let characters: BTreeSet<&str> = self
            .characters
            .iter()
            .chain(self.introduces.iter())
            .map(String::as_str)
            .collect();
        let locations: BTreeSet<&str> = self
            .locations
            .iter()
            .chain(self.close_detail_locations.iter())
            .map(String::as_str)
            .collect();
        let props: BTreeSet<&str> = self.props.iter().map(|p| p.id.as_str()).collect();
        characters.len() + locations.len() + props.len()
    }

    /// Number of references continuity rules are checked against.
    pub fn reference_count(&self) -> usize {
        self.characters.len()
            + self.close_detail_locations.len()
            + usize::from(self.time_marker.is_some())
            + self.props.len()
    }
}

/// Output of the parse stage: a story broken into ordered units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedNarrative {
    pub story_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub units: Vec<NarrativeUnit>,
}
