//! Issue prioritization by severity and dimension weight.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{Dimension, Issue};

/// An issue with its computed priority weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedIssue {
    pub issue: Issue,
    pub weight: f64,
    /// Position in the critic's original list.
    pub original_index: usize,
}

/// Orders issues by `severity multiplier * dimension weight`, descending.
///
/// Dimensions without a configured weight count as 1.0. Ties keep the
/// critic's order.
pub fn prioritize(issues: &[Issue], weights: &BTreeMap<Dimension, f64>) -> Vec<PrioritizedIssue> {
    let mut ranked: Vec<PrioritizedIssue> = issues
        .iter()
        .enumerate()
        .map(|(index, issue)| {
            let dimension_weight = weights.get(&issue.dimension).copied().unwrap_or(1.0);
            PrioritizedIssue {
                issue: issue.clone(),
                weight: issue.severity.multiplier() * dimension_weight,
                original_index: index,
            }
        })
        .collect();

    // sort_by is stable, so equal weights retain input order
    ranked.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::types::IssueSeverity;

    fn issue(id: &str, dimension: Dimension, severity: IssueSeverity) -> Issue {
        Issue::new(dimension, severity, id).with_id(id)
    }

    #[test]
    fn test_orders_by_weight() {
        let issues = vec![
            issue("a", Dimension::Pacing, IssueSeverity::Minor),
            issue("b", Dimension::HookStrength, IssueSeverity::Critical),
            issue("c", Dimension::AudioMix, IssueSeverity::Major),
        ];
        let mut weights = BTreeMap::new();
        weights.insert(Dimension::HookStrength, 1.5);
        weights.insert(Dimension::AudioMix, 0.7);

        let ranked = prioritize(&issues, &weights);
        let ids: Vec<&str> = ranked.iter().map(|p| p.issue.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!((ranked[0].weight - 3.0).abs() < 1e-9);
        assert!((ranked[1].weight - 1.05).abs() < 1e-9);
        assert_eq!(ranked[2].original_index, 0);
    }

    #[test]
    fn test_ties_preserve_input_order() {
        let issues = vec![
            issue("first", Dimension::Pacing, IssueSeverity::Minor),
            issue("second", Dimension::Other, IssueSeverity::Minor),
            issue("third", Dimension::Continuity, IssueSeverity::Minor),
        ];
        let ranked = prioritize(&issues, &BTreeMap::new());
        let ids: Vec<&str> = ranked.iter().map(|p| p.issue.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(prioritize(&[], &BTreeMap::new()).is_empty());
    }
}
