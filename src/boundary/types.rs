//! Boundary-check data types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::decompose::{TaskId, ValidationTask};
use crate::pipeline::types::TaskResult;

/// A deliberately absurd alternative answer for one task. Generated once,
/// never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidiculousSolution {
    /// The unit the absurdity was derived from
    pub original_problem: String,
    /// Absurd re-reading of the unit, as tasks
    pub ridiculous_breakdown: Vec<ValidationTask>,
    /// Synthesized results for the absurd reading
    pub absurd_solutions: Vec<TaskResult>,
    /// How confidently absurd the alternative is (0.0-1.0)
    pub confidence_level: f64,
    /// Failure shapes the absurdity exemplifies
    pub anti_patterns: Vec<String>,
}

impl RidiculousSolution {
    pub fn absurd_text(&self) -> String {
        self.ridiculous_breakdown
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Whether the contrast produced usable bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSpace {
    Bounded,
    Unbounded,
}

/// What a task result is and is not allowed to mean.
///
/// `can_mean` and `cannot_mean` are always disjoint; an interpretation
/// appearing on both sides is excluded, `cannot_mean` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationBoundaries {
    pub can_mean: BTreeSet<String>,
    pub cannot_mean: BTreeSet<String>,
    pub boundary_confidence: f64,
    /// Distance of the real answer from the absurd one, 0 means identical
    pub contrast_ratio: f64,
    pub validation_space: ValidationSpace,
}

impl ValidationBoundaries {
    pub fn new(
        can_mean: BTreeSet<String>,
        cannot_mean: BTreeSet<String>,
        boundary_confidence: f64,
        contrast_ratio: f64,
    ) -> Self {
        let can_mean: BTreeSet<String> = can_mean
            .into_iter()
            .filter(|m| !cannot_mean.contains(m))
            .collect();
        let validation_space = if cannot_mean.is_empty() {
            ValidationSpace::Unbounded
        } else {
            ValidationSpace::Bounded
        };

        Self {
            can_mean,
            cannot_mean,
            boundary_confidence: boundary_confidence.clamp(0.0, 1.0),
            contrast_ratio: contrast_ratio.max(0.0),
            validation_space,
        }
    }
}

/// Verdict of the contrast check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalValidation {
    /// Real answer sits far from the absurd one
    NotRidiculous,
    /// Contrast is weak or the task itself failed
    Questionable,
    /// Real answer is suspiciously close to the absurd one
    PotentiallyRidiculous,
}

impl std::fmt::Display for FinalValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRidiculous => write!(f, "not-ridiculous"),
            Self::Questionable => write!(f, "questionable"),
            Self::PotentiallyRidiculous => write!(f, "potentially-ridiculous"),
        }
    }
}

/// One task's real results paired with its absurd counterpart and the
/// derived boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PugachevCobraResult {
    pub task_id: TaskId,
    pub real_results: Vec<TaskResult>,
    pub ridiculous: RidiculousSolution,
    pub boundaries: ValidationBoundaries,
    pub final_validation: FinalValidation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cannot_mean_wins_overlap() {
        let b = ValidationBoundaries::new(
            set(&["a", "b", "c"]),
            set(&["b", "d"]),
            0.8,
            0.5,
        );
        assert_eq!(b.can_mean, set(&["a", "c"]));
        assert_eq!(b.cannot_mean, set(&["b", "d"]));
    }

    #[test]
    fn test_empty_cannot_mean_is_unbounded() {
        let b = ValidationBoundaries::new(set(&["a"]), set(&[]), 0.8, 0.5);
        assert_eq!(b.validation_space, ValidationSpace::Unbounded);
    }

    #[test]
    fn test_final_validation_serde_kebab() {
        let json = serde_json::to_string(&FinalValidation::PotentiallyRidiculous).unwrap();
        assert_eq!(json, "\"potentially-ridiculous\"");
    }

    proptest! {
        #[test]
        fn prop_boundaries_always_disjoint(
            can in proptest::collection::btree_set("[a-e]{1,3}", 0..8),
            cannot in proptest::collection::btree_set("[a-e]{1,3}", 0..8),
            confidence in -5.0f64..5.0,
            contrast in -5.0f64..5.0,
        ) {
            let b = ValidationBoundaries::new(can, cannot, confidence, contrast);
            prop_assert!(b.can_mean.is_disjoint(&b.cannot_mean));
            prop_assert!((0.0..=1.0).contains(&b.boundary_confidence));
            prop_assert!(b.contrast_ratio >= 0.0);
        }
    }
}
