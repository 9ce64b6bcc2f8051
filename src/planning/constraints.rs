//! Playbook constraint overrides.
//!
//! Constraint tokens come from reviewer feedback and are applied after the
//! planner has built a plan. Duration overrides fix the shots they touch and
//! push the difference onto the remaining shots; when those cannot absorb it
//! the plan is rejected instead of breaking its total duration.

use std::collections::BTreeSet;

use super::durations::{from_tenths, to_tenths, water_fill};
use super::types::{AppliedConstraint, CameraMotion, HookStrategy, ShotPlan, ShotType};
use crate::error::PlanningError;

/// A parsed playbook token.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybookConstraint {
    /// `min_duration:<secs>`: every shot lasts at least this long.
    MinDuration(f64),
    /// `avoid:<shot_type>` or `avoid_extreme_close`.
    Avoid(ShotType),
    /// `prefer_static`: all camera motion becomes static.
    PreferStatic,
    /// `longer_establishing`: a wide opening shot runs 1.5x longer.
    LongerEstablishing,
    /// `mystery_hook`: open on an extreme close-up dolly-out.
    MysteryHook,
}

impl PlaybookConstraint {
    /// Parse a token. Unknown tokens yield `Ok(None)`; known tokens with a
    /// malformed value are an error.
    pub fn parse(token: &str) -> Result<Option<Self>, PlanningError> {
        let normalized = token.trim().to_lowercase();
        let invalid = |reason: String| PlanningError::InvalidConstraint {
            token: token.to_string(),
            reason,
        };

        if let Some(value) = normalized.strip_prefix("min_duration") {
            let value = value.trim_start_matches([':', '=']).trim();
            let secs: f64 = value
                .parse()
                .map_err(|_| invalid(format!("'{}' is not a number of seconds", value)))?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(invalid("minimum duration must be positive".to_string()));
            }
            return Ok(Some(PlaybookConstraint::MinDuration(secs)));
        }

        if let Some(value) = normalized.strip_prefix("avoid:") {
            let shot_type = value.parse::<ShotType>().map_err(invalid)?;
            return Ok(Some(PlaybookConstraint::Avoid(shot_type)));
        }

        match normalized.as_str() {
            "avoid_extreme_close" => Ok(Some(PlaybookConstraint::Avoid(ShotType::ExtremeClose))),
            "prefer_static" => Ok(Some(PlaybookConstraint::PreferStatic)),
            "longer_establishing" => Ok(Some(PlaybookConstraint::LongerEstablishing)),
            "mystery_hook" | "hook_mystery" => Ok(Some(PlaybookConstraint::MysteryHook)),
            _ => Ok(None),
        }
    }
}

/// Apply playbook tokens to a finished plan.
///
/// Hook overrides go first, then disallowed types, motion, and finally
/// durations. The plan is only modified when every token applies cleanly.
pub fn apply_constraints(
    plan: &mut ShotPlan,
    tokens: &[String],
    previous_ending_shot_type: Option<ShotType>,
) -> Result<(), PlanningError> {
    if tokens.is_empty() || plan.shots.is_empty() {
        return Ok(());
    }

    let mut parsed = Vec::with_capacity(tokens.len());
    let mut working = plan.clone();
    for token in tokens {
        match PlaybookConstraint::parse(token)? {
            Some(constraint) => parsed.push((token.clone(), constraint)),
            None => {
                tracing::warn!(unit_id = %plan.unit_id, token = %token, "Ignoring unknown playbook constraint");
                working
                    .notes
                    .push(format!("ignored unknown constraint '{}'", token));
            }
        }
    }

    let avoided: BTreeSet<&'static str> = parsed
        .iter()
        .filter_map(|(_, c)| match c {
            PlaybookConstraint::Avoid(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    if avoided.len() == ShotType::ALL.len() {
        return Err(PlanningError::UnsatisfiableConstraints {
            unit_id: plan.unit_id.clone(),
            reason: "every shot type is disallowed".to_string(),
        });
    }
    let is_avoided = |t: ShotType| avoided.contains(t.as_str());

    for (token, constraint) in &parsed {
        if *constraint == PlaybookConstraint::MysteryHook {
            let hook = &mut working.shots[0];
            let (shot_type, motion) = HookStrategy::Mystery.hook_shot();
            hook.shot_type = shot_type;
            hook.motion = motion;
            working.hook_strategy = HookStrategy::Mystery;
            working.constraints_applied.push(AppliedConstraint {
                token: token.clone(),
                applied_to: vec![hook.id.clone()],
                change: "hook -> extreme_close/dolly_out".to_string(),
            });
        }
    }

    // The opener rule still binds after a hook override.
    let original_types: Vec<ShotType> = working.shots.iter().map(|s| s.shot_type).collect();
    for (index, shot) in working.shots.iter_mut().enumerate() {
        let opener_rule = if index == 0 { previous_ending_shot_type } else { None };
        shot.shot_type = first_allowed(shot.shot_type, &is_avoided, opener_rule);
    }
    if working.hook_strategy == HookStrategy::Mystery
        && previous_ending_shot_type == Some(original_types[0])
        && working.shots[0].shot_type != original_types[0]
    {
        working.notes.push(format!(
            "mystery hook opens on {} to differ from the previous unit's ending",
            working.shots[0].shot_type
        ));
    }
    for (token, constraint) in &parsed {
        if let PlaybookConstraint::Avoid(avoided_type) = constraint {
            let applied_to: Vec<String> = working
                .shots
                .iter()
                .zip(&original_types)
                .filter(|(_, original)| *original == avoided_type)
                .map(|(shot, _)| shot.id.clone())
                .collect();
            if !applied_to.is_empty() {
                working.constraints_applied.push(AppliedConstraint {
                    token: token.clone(),
                    applied_to,
                    change: format!("{} -> substitute framing", avoided_type),
                });
            }
        }
    }

    if parsed
        .iter()
        .any(|(_, c)| *c == PlaybookConstraint::PreferStatic)
    {
        let applied_to: Vec<String> = working
            .shots
            .iter_mut()
            .filter(|s| s.motion != CameraMotion::Static)
            .map(|s| {
                s.motion = CameraMotion::Static;
                s.id.clone()
            })
            .collect();
        if !applied_to.is_empty() {
            let token = parsed
                .iter()
                .find(|(_, c)| *c == PlaybookConstraint::PreferStatic)
                .map(|(t, _)| t.clone())
                .unwrap_or_default();
            working.constraints_applied.push(AppliedConstraint {
                token,
                applied_to,
                change: "camera motion -> static".to_string(),
            });
        }
    }

    apply_duration_constraints(&mut working, &parsed)?;

    *plan = working;
    Ok(())
}

fn first_allowed(
    start: ShotType,
    is_avoided: &impl Fn(ShotType) -> bool,
    must_differ_from: Option<ShotType>,
) -> ShotType {
    let mut candidate = start;
    for _ in 0..ShotType::ALL.len() {
        if !is_avoided(candidate) && Some(candidate) != must_differ_from {
            return candidate;
        }
        candidate = candidate.substitute();
    }
    // Only the previous-ending rule can block every remaining type.
    let mut candidate = start;
    for _ in 0..ShotType::ALL.len() {
        if !is_avoided(candidate) {
            return candidate;
        }
        candidate = candidate.substitute();
    }
    start
}

fn apply_duration_constraints(
    plan: &mut ShotPlan,
    parsed: &[(String, PlaybookConstraint)],
) -> Result<(), PlanningError> {
    let floor = parsed
        .iter()
        .filter_map(|(_, c)| match c {
            PlaybookConstraint::MinDuration(secs) => Some(to_tenths(*secs)),
            _ => None,
        })
        .max();
    let longer_establishing = parsed
        .iter()
        .find(|(_, c)| *c == PlaybookConstraint::LongerEstablishing);

    if floor.is_none() && longer_establishing.is_none() {
        return Ok(());
    }

    let mut durations: Vec<i64> = plan.shots.iter().map(|s| to_tenths(s.duration_secs)).collect();
    let target: i64 = durations.iter().sum();
    let mut fixed = vec![false; durations.len()];

    if let Some((token, _)) = longer_establishing {
        if plan.shots[0].shot_type.is_wide() {
            durations[0] = (durations[0] as f64 * 1.5).round() as i64;
            fixed[0] = true;
            plan.constraints_applied.push(AppliedConstraint {
                token: token.clone(),
                applied_to: vec![plan.shots[0].id.clone()],
                change: "establishing duration x1.5".to_string(),
            });
        }
    }

    if let Some(floor) = floor {
        let mut applied_to = Vec::new();
        for (i, d) in durations.iter_mut().enumerate() {
            if *d < floor {
                *d = floor;
                fixed[i] = true;
                applied_to.push(plan.shots[i].id.clone());
            }
        }
        if !applied_to.is_empty() {
            let token = parsed
                .iter()
                .filter(|(_, c)| matches!(c, PlaybookConstraint::MinDuration(_)))
                .max_by_key(|(_, c)| match c {
                    PlaybookConstraint::MinDuration(secs) => to_tenths(*secs),
                    _ => 0,
                })
                .map(|(t, _)| t.clone())
                .unwrap_or_default();
            plan.constraints_applied.push(AppliedConstraint {
                token,
                applied_to,
                change: format!("minimum duration {:.1}s", from_tenths(floor)),
            });
        }
    }

    let min = to_tenths(plan.bounds.min_secs).max(floor.unwrap_or(0));
    let max = to_tenths(plan.bounds.max_secs);
    let lower: Vec<i64> = durations.iter().map(|&d| d.min(min)).collect();
    let upper: Vec<i64> = durations.iter().map(|&d| d.max(max)).collect();
    let eligible: Vec<bool> = (0..durations.len()).map(|i| i != 0 && !fixed[i]).collect();

    let delta = target - durations.iter().sum::<i64>();
    let leftover = water_fill(&mut durations, delta, &lower, &upper, &eligible);
    if leftover.abs() > 1 {
        return Err(PlanningError::UnsatisfiableConstraints {
            unit_id: plan.unit_id.clone(),
            reason: format!(
                "{:.1}s cannot be redistributed across unconstrained shots",
                from_tenths(leftover.abs())
            ),
        });
    }

    for (shot, d) in plan.shots.iter_mut().zip(durations) {
        shot.duration_secs = from_tenths(d);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::types::{DurationBounds, Pacing, Shot, ShotRole};

    fn plan_with(durations: &[f64], types: &[ShotType]) -> ShotPlan {
        let shots = durations
            .iter()
            .zip(types)
            .enumerate()
            .map(|(i, (&d, &t))| Shot {
                id: format!("u1-shot-{}", i + 1),
                sequence: i as u32 + 1,
                shot_type: t,
                motion: if i == 0 {
                    CameraMotion::ZoomIn
                } else {
                    CameraMotion::PanLeft
                },
                role: if i == 0 { ShotRole::Hook } else { ShotRole::Action },
                duration_secs: d,
                subject: String::new(),
                narration: None,
                narration_words: 0,
                transition_out: None,
            })
            .collect();
        ShotPlan {
            unit_id: "u1".to_string(),
            shots,
            target_duration_secs: durations.iter().sum(),
            pacing: Pacing::Moderate,
            hook_strategy: HookStrategy::VisualImpact,
            complexity: 0.5,
            bounds: DurationBounds {
                min_secs: 2.0,
                max_secs: 8.0,
            },
            constraints_applied: Vec::new(),
            notes: Vec::new(),
            continuity_flagged: false,
        }
    }

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(
            PlaybookConstraint::parse("min_duration:4.5").unwrap(),
            Some(PlaybookConstraint::MinDuration(4.5))
        );
        assert_eq!(
            PlaybookConstraint::parse("avoid:close_up").unwrap(),
            Some(PlaybookConstraint::Avoid(ShotType::CloseUp))
        );
        assert_eq!(
            PlaybookConstraint::parse("AVOID_EXTREME_CLOSE").unwrap(),
            Some(PlaybookConstraint::Avoid(ShotType::ExtremeClose))
        );
        assert_eq!(PlaybookConstraint::parse("more_lens_flare").unwrap(), None);
        assert!(matches!(
            PlaybookConstraint::parse("min_duration:soon"),
            Err(PlanningError::InvalidConstraint { .. })
        ));
        assert!(PlaybookConstraint::parse("avoid:dutch_angle").is_err());
    }

    #[test]
    fn test_min_duration_redistributes_excess() {
        let mut plan = plan_with(
            &[3.0, 2.0, 8.0, 8.0, 4.0],
            &[
                ShotType::ExtremeWide,
                ShotType::Medium,
                ShotType::CloseUp,
                ShotType::MediumWide,
                ShotType::Medium,
            ],
        );
        apply_constraints(&mut plan, &tokens(&["min_duration:3.5"]), None).unwrap();

        let durations: Vec<f64> = plan.shots.iter().map(|s| s.duration_secs).collect();
        assert!(plan.within_tolerance());
        assert!(durations.iter().all(|&d| d >= 3.5));
        assert_eq!(durations[0], 3.5);
        assert_eq!(durations[1], 3.5);
        assert_eq!(plan.constraints_applied.len(), 1);
        assert_eq!(plan.constraints_applied[0].applied_to.len(), 2);
    }

    #[test]
    fn test_unsatisfiable_min_duration() {
        let mut plan = plan_with(
            &[3.0, 3.0, 3.0, 3.0],
            &[
                ShotType::ExtremeWide,
                ShotType::Medium,
                ShotType::CloseUp,
                ShotType::Medium,
            ],
        );
        let before = plan.clone();
        let err = apply_constraints(&mut plan, &tokens(&["min_duration:5"]), None).unwrap_err();
        assert!(matches!(err, PlanningError::UnsatisfiableConstraints { .. }));
        assert_eq!(plan, before);
    }

    #[test]
    fn test_avoid_substitutes_and_respects_opener() {
        let mut plan = plan_with(
            &[3.0, 5.0, 5.0],
            &[ShotType::ExtremeClose, ShotType::CloseUp, ShotType::Medium],
        );
        apply_constraints(
            &mut plan,
            &tokens(&["avoid_extreme_close", "avoid:close_up"]),
            Some(ShotType::MediumClose),
        )
        .unwrap();

        // extreme_close -> close_up (avoided) -> medium_close (previous ending) -> medium
        assert_eq!(plan.shots[0].shot_type, ShotType::Medium);
        assert_eq!(plan.shots[1].shot_type, ShotType::MediumClose);
        assert_eq!(plan.shots[2].shot_type, ShotType::Medium);
        assert_eq!(plan.constraints_applied.len(), 2);
    }

    #[test]
    fn test_all_types_avoided_is_unsatisfiable() {
        let mut plan = plan_with(&[3.0, 5.0], &[ShotType::Wide, ShotType::Medium]);
        let all: Vec<String> = ShotType::ALL
            .iter()
            .map(|t| format!("avoid:{}", t))
            .collect();
        assert!(matches!(
            apply_constraints(&mut plan, &all, None),
            Err(PlanningError::UnsatisfiableConstraints { .. })
        ));
    }

    #[test]
    fn test_prefer_static_and_unknown_token() {
        let mut plan = plan_with(&[3.0, 5.0], &[ShotType::Wide, ShotType::Medium]);
        apply_constraints(&mut plan, &tokens(&["prefer_static", "sparkles"]), None).unwrap();
        assert!(plan.shots.iter().all(|s| s.motion == CameraMotion::Static));
        assert_eq!(plan.notes.len(), 1);
        assert_eq!(plan.constraints_applied[0].applied_to.len(), 2);
    }

    #[test]
    fn test_longer_establishing_takes_time_from_others() {
        let mut plan = plan_with(
            &[4.0, 6.0, 6.0],
            &[ShotType::ExtremeWide, ShotType::Medium, ShotType::CloseUp],
        );
        apply_constraints(&mut plan, &tokens(&["longer_establishing"]), None).unwrap();
        assert_eq!(plan.shots[0].duration_secs, 6.0);
        assert_eq!(plan.total_duration(), 16.0);
    }

    #[test]
    fn test_mystery_hook() {
        let mut plan = plan_with(&[3.0, 5.0], &[ShotType::ExtremeWide, ShotType::Medium]);
        apply_constraints(&mut plan, &tokens(&["mystery_hook"]), None).unwrap();
        assert_eq!(plan.shots[0].shot_type, ShotType::ExtremeClose);
        assert_eq!(plan.shots[0].motion, CameraMotion::DollyOut);
        assert_eq!(plan.hook_strategy, HookStrategy::Mystery);
    }

    #[test]
    fn test_mystery_hook_respects_previous_ending() {
        let mut plan = plan_with(&[3.0, 5.0], &[ShotType::ExtremeWide, ShotType::Medium]);
        apply_constraints(
            &mut plan,
            &tokens(&["mystery_hook"]),
            Some(ShotType::ExtremeClose),
        )
        .unwrap();

        assert_eq!(plan.shots[0].shot_type, ShotType::CloseUp);
        assert_eq!(plan.shots[0].motion, CameraMotion::DollyOut);
        assert_eq!(plan.hook_strategy, HookStrategy::Mystery);
        assert!(plan.notes.iter().any(|n| n.contains("mystery hook")));
    }
}
