//! Shot budget planner.
//!
//! Turns a narrative unit into a timed shot skeleton: pick pacing from the
//! unit's emotion, derive a shot count from complexity, reserve the hook,
//! split the rest, and finally apply playbook overrides.

use super::config::PlannerConfig;
use super::constraints::apply_constraints;
use super::durations::{from_tenths, spread_evenly, to_tenths, water_fill};
use super::types::{
    CameraMotion, DurationBounds, HookStrategy, Pacing, Shot, ShotPlan, ShotRole, ShotType,
    Transition, TransitionKind,
};
use crate::error::PlanningError;
use crate::narrative::NarrativeUnit;

const PREFERRED_TYPES: [ShotType; 6] = [
    ShotType::Medium,
    ShotType::CloseUp,
    ShotType::MediumWide,
    ShotType::Cutaway,
    ShotType::MediumClose,
    ShotType::Wide,
];

const INTENSE_TYPES: [ShotType; 4] = [
    ShotType::CloseUp,
    ShotType::MediumClose,
    ShotType::Medium,
    ShotType::Cutaway,
];

const DYNAMIC_MOTIONS: [CameraMotion; 3] = [
    CameraMotion::PanLeft,
    CameraMotion::PanRight,
    CameraMotion::ZoomIn,
];

const DISSOLVE_SECS: f64 = 0.8;

/// Where a unit sits in its story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanContext {
    /// First unit of the story.
    pub is_opening: bool,
    /// Last unit of the story.
    pub is_closing: bool,
    /// Final shot type of the previous unit's plan.
    pub previous_ending_shot_type: Option<ShotType>,
}

/// Plan a single unit that follows a unit ending on
/// `previous_ending_shot_type` (or opens the story when `None`).
pub fn plan(
    unit: &NarrativeUnit,
    config: &PlannerConfig,
    previous_ending_shot_type: Option<ShotType>,
) -> Result<ShotPlan, PlanningError> {
    let context = PlanContext {
        is_opening: previous_ending_shot_type.is_none(),
        is_closing: false,
        previous_ending_shot_type,
    };
    plan_with_context(unit, config, &context)
}

/// Plan a unit with explicit story position.
pub fn plan_with_context(
    unit: &NarrativeUnit,
    config: &PlannerConfig,
    context: &PlanContext,
) -> Result<ShotPlan, PlanningError> {
    config
        .validate()
        .map_err(|e| PlanningError::InvalidConfig(e.to_string()))?;

    let emotion = unit.emotional_beat.primary_emotion.to_lowercase();
    let intensity = unit.emotional_beat.clamped_intensity();
    let pacing = config
        .pacing_override
        .unwrap_or_else(|| Pacing::from_emotion(&emotion, config.default_pacing));
    let complexity = complexity_score(unit, config);
    let shot_count = shot_count(complexity, pacing, config);
    let hook_strategy = select_hook_strategy(
        &emotion,
        intensity,
        context.is_opening,
        config.default_hook_strategy,
    );

    let target = to_tenths(target_duration(unit, config));
    let hook = to_tenths(config.hook_duration_secs);
    let min = to_tenths(config.min_shot_duration_secs);
    let max = to_tenths(config.max_shot_duration_secs);

    let mut notes = Vec::new();
    let (durations, relaxed) = allocate_durations(
        &unit.id,
        target,
        hook,
        shot_count,
        pacing.duration_factor(),
        min,
        max,
    )?;
    if relaxed {
        tracing::warn!(
            unit_id = %unit.id,
            shot_count = shot_count,
            target_secs = from_tenths(target),
            "Shot duration bounds relaxed to meet target"
        );
        notes.push(format!(
            "{} shots cannot fill {:.1}s within [{:.1}s, {:.1}s]; bounds relaxed",
            shot_count,
            from_tenths(target),
            config.min_shot_duration_secs,
            config.max_shot_duration_secs
        ));
    }

    let shots = build_shots(unit, &durations, pacing, hook_strategy, context, intensity);
    let mut plan = ShotPlan {
        unit_id: unit.id.clone(),
        shots,
        target_duration_secs: from_tenths(target),
        pacing,
        hook_strategy,
        complexity,
        bounds: DurationBounds {
            min_secs: config.min_shot_duration_secs,
            max_secs: config.max_shot_duration_secs,
        },
        constraints_applied: Vec::new(),
        notes,
        continuity_flagged: false,
    };

    apply_constraints(
        &mut plan,
        &unit.playbook_constraints,
        context.previous_ending_shot_type,
    )?;
    allocate_narration(&mut plan.shots, unit.narration.as_deref());
    if config.include_transitions {
        add_transitions(&mut plan.shots, pacing);
    }

    tracing::debug!(
        unit_id = %unit.id,
        shots = plan.shots.len(),
        pacing = %pacing,
        complexity = complexity,
        total_secs = plan.total_duration(),
        "Planned shots"
    );

    Ok(plan)
}

/// Plan every unit in narrative order, carrying each plan's final shot type
/// into the next unit.
pub fn plan_sequence(
    units: &[NarrativeUnit],
    config: &PlannerConfig,
) -> Result<Vec<ShotPlan>, PlanningError> {
    for pair in units.windows(2) {
        if pair[1].sequence <= pair[0].sequence {
            return Err(PlanningError::OutOfOrder(format!(
                "unit '{}' (sequence {}) follows sequence {}",
                pair[1].id, pair[1].sequence, pair[0].sequence
            )));
        }
    }

    let mut plans = Vec::with_capacity(units.len());
    let mut previous = None;
    for (index, unit) in units.iter().enumerate() {
        let context = PlanContext {
            is_opening: index == 0,
            is_closing: index + 1 == units.len(),
            previous_ending_shot_type: previous,
        };
        let plan = plan_with_context(unit, config, &context)?;
        previous = plan.final_shot_type();
        plans.push(plan);
    }
    Ok(plans)
}

/// Normalized complexity in [0, 1] from text length, entity count and
/// emotional intensity.
pub fn complexity_score(unit: &NarrativeUnit, config: &PlannerConfig) -> f64 {
    let words = (unit.word_count() as f64 / config.complexity_word_scale as f64).min(1.0);
    let entities = (unit.entity_count() as f64 / config.complexity_entity_scale as f64).min(1.0);
    let intensity = unit.emotional_beat.clamped_intensity();
    ((words + entities + intensity) / 3.0).clamp(0.0, 1.0)
}

fn shot_count(complexity: f64, pacing: Pacing, config: &PlannerConfig) -> usize {
    if let Some(count) = config.shot_count_override {
        return count;
    }
    let raw = config.base_shot_count as i64 + (complexity * 3.0).round() as i64 + pacing.shot_adjustment();
    raw.clamp(config.min_shots as i64, config.max_shots as i64) as usize
}

fn select_hook_strategy(
    emotion: &str,
    intensity: f64,
    is_opening: bool,
    default: HookStrategy,
) -> HookStrategy {
    if is_opening {
        return HookStrategy::VisualImpact;
    }
    if intensity > 0.7 {
        return if matches!(emotion, "tension" | "action" | "chaos") {
            HookStrategy::Action
        } else {
            HookStrategy::Emotional
        };
    }
    match emotion {
        "mystery" | "contemplative" => HookStrategy::Mystery,
        "sorrow" | "hope" | "triumph" => HookStrategy::Emotional,
        _ => default,
    }
}

fn target_duration(unit: &NarrativeUnit, config: &PlannerConfig) -> f64 {
    let target = config.target_duration_secs;
    match unit.estimated_duration_secs {
        Some(estimate) if config.use_unit_estimate && estimate.is_finite() && estimate > 0.0 => {
            estimate.clamp(target * 0.5, target * 1.5)
        }
        _ => target,
    }
}

/// Split `target` tenths into `count` shots: hook first, an even paced split
/// for the middle, and the final shot absorbing the remainder. Returns the
/// durations and whether per-shot bounds had to be relaxed.
fn allocate_durations(
    unit_id: &str,
    target: i64,
    hook: i64,
    count: usize,
    factor: f64,
    min: i64,
    max: i64,
) -> Result<(Vec<i64>, bool), PlanningError> {
    if count <= 1 {
        return Ok((vec![target], false));
    }
    if hook >= target {
        return Err(PlanningError::InvalidConfig(format!(
            "hook of {:.1}s leaves no time in a {:.1}s unit '{}'",
            from_tenths(hook),
            from_tenths(target),
            unit_id
        )));
    }

    let rest = count - 1;
    let remainder = target - hook;
    if remainder < rest as i64 {
        return Err(PlanningError::InvalidConfig(format!(
            "{:.1}s cannot be split across {} shots in unit '{}'",
            from_tenths(remainder),
            rest,
            unit_id
        )));
    }

    let base = remainder as f64 / rest as f64 * factor;
    let per_shot = (base.round() as i64).clamp(min, max);

    let mut durations = Vec::with_capacity(count);
    durations.push(hook);
    durations.extend(std::iter::repeat(per_shot).take(rest - 1));
    let last = remainder - per_shot * (rest as i64 - 1);
    let last_clamped = last.clamp(min, max);
    durations.push(last_clamped);

    if last == last_clamped {
        return Ok((durations, false));
    }

    let lower = vec![min; count];
    let upper = vec![max; count];
    let eligible: Vec<bool> = (0..count).map(|i| i != 0).collect();
    let leftover = water_fill(&mut durations, last - last_clamped, &lower, &upper, &eligible);
    if leftover == 0 {
        return Ok((durations, false));
    }

    spread_evenly(&mut durations, leftover, &eligible);
    Ok((durations, true))
}

fn build_shots(
    unit: &NarrativeUnit,
    durations: &[i64],
    pacing: Pacing,
    hook_strategy: HookStrategy,
    context: &PlanContext,
    intensity: f64,
) -> Vec<Shot> {
    let count = durations.len();
    let mut shots = Vec::with_capacity(count);

    let (mut hook_type, hook_motion) = hook_strategy.hook_shot();
    if Some(hook_type) == context.previous_ending_shot_type {
        hook_type = if hook_type == ShotType::Medium {
            ShotType::Wide
        } else {
            ShotType::Medium
        };
    }
    shots.push(new_shot(unit, 1, hook_type, hook_motion, ShotRole::Hook, durations[0]));

    let preferred: &[ShotType] = if pacing == Pacing::Intense {
        &INTENSE_TYPES
    } else {
        &PREFERRED_TYPES
    };
    let mut used = vec![hook_type];

    for (index, &duration) in durations.iter().enumerate().skip(1) {
        let sequence = index as u32 + 1;
        if index + 1 == count {
            let (shot_type, motion, role) = if context.is_closing {
                (ShotType::ExtremeWide, CameraMotion::ZoomOut, ShotRole::Resolution)
            } else {
                (ShotType::Medium, CameraMotion::Static, ShotRole::Transition)
            };
            shots.push(new_shot(unit, sequence, shot_type, motion, role, duration));
            break;
        }

        let shot_type = preferred
            .iter()
            .copied()
            .find(|t| !used.contains(t))
            .unwrap_or(preferred[index % preferred.len()]);
        used.push(shot_type);

        let motion = match pacing {
            Pacing::Contemplative | Pacing::Moderate => CameraMotion::Static,
            Pacing::Dynamic => DYNAMIC_MOTIONS[sequence as usize % DYNAMIC_MOTIONS.len()],
            Pacing::Intense => CameraMotion::ZoomIn,
        };
        let role = match shot_type {
            ShotType::CloseUp | ShotType::ExtremeClose | ShotType::Cutaway => ShotRole::Detail,
            ShotType::Pov => ShotRole::Reaction,
            _ if intensity > 0.7 => ShotRole::Climax,
            _ => ShotRole::Action,
        };
        shots.push(new_shot(unit, sequence, shot_type, motion, role, duration));
    }

    shots
}

fn new_shot(
    unit: &NarrativeUnit,
    sequence: u32,
    shot_type: ShotType,
    motion: CameraMotion,
    role: ShotRole,
    duration: i64,
) -> Shot {
    Shot {
        id: format!("{}-shot-{}", unit.id, sequence),
        sequence,
        shot_type,
        motion,
        role,
        duration_secs: from_tenths(duration),
        subject: subject_for(shot_type, role, unit),
        narration: None,
        narration_words: 0,
        transition_out: None,
    }
}

fn subject_for(shot_type: ShotType, role: ShotRole, unit: &NarrativeUnit) -> String {
    let location = if unit.setting.location_name.is_empty() {
        "the scene"
    } else {
        unit.setting.location_name.as_str()
    };
    let lead = unit.characters.first().map(String::as_str);
    match (role, shot_type, lead) {
        (ShotRole::Hook, ShotType::ExtremeWide, _) => format!("Establishing view of {}", location),
        (ShotRole::Hook, _, Some(character)) => format!("{} in {}", character, location),
        (ShotRole::Resolution, _, _) => format!("Final wide of {}", location),
        (ShotRole::Transition, _, _) => "Closing shot bridging to the next unit".to_string(),
        (_, ShotType::Wide, _) => location.to_string(),
        (_, ShotType::MediumWide, _) => format!("Activity in {}", location),
        (_, ShotType::MediumClose, Some(character)) => character.to_string(),
        (_, ShotType::CloseUp, _) => "Important detail".to_string(),
        (_, ShotType::Cutaway, _) => "Contextual detail".to_string(),
        (_, ShotType::Pov, Some(character)) => format!("{}'s perspective", character),
        _ => "Scene subject".to_string(),
    }
}

/// Split narration words across shots in proportion to duration.
fn allocate_narration(shots: &mut [Shot], narration: Option<&str>) {
    let words: Vec<&str> = narration
        .map(|n| n.split_whitespace().collect())
        .unwrap_or_default();
    let total_words = words.len() as i64;
    let total: i64 = shots.iter().map(|s| to_tenths(s.duration_secs)).sum();
    if total_words == 0 || total <= 0 {
        return;
    }

    let mut elapsed = 0;
    let mut start = 0usize;
    for shot in shots.iter_mut() {
        elapsed += to_tenths(shot.duration_secs);
        let end = ((total_words * elapsed * 2 + total) / (2 * total)) as usize;
        let end = end.min(words.len());
        let slice = &words[start..end];
        shot.narration_words = slice.len();
        shot.narration = (!slice.is_empty()).then(|| slice.join(" "));
        start = end;
    }
}

fn add_transitions(shots: &mut [Shot], pacing: Pacing) {
    let transition = match pacing {
        Pacing::Contemplative => Transition {
            kind: TransitionKind::Dissolve,
            duration_secs: DISSOLVE_SECS,
        },
        _ => Transition {
            kind: TransitionKind::Cut,
            duration_secs: 0.0,
        },
    };
    let last = shots.len().saturating_sub(1);
    for shot in shots.iter_mut().take(last) {
        shot.transition_out = Some(transition);
    }
}
