//! Session-level quality assessment (stage 7).
//!
//! The assessor is a pure function of the current task-result set: the same
//! results always produce the same metrics, and nothing is cached between
//! calls. Each configured dimension scores the whole result set; the overall
//! score is the weight-normalized sum.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::types::{IssueSeverity, TaskResult};

/// Built-in quality dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityDimensionKind {
    /// Importance-weighted adequacy of successful results
    Accuracy,
    /// Share of tasks that completed successfully
    Completeness,
    /// Freedom from recorded issues
    Consistency,
    /// Importance-weighted result confidence
    Confidence,
    /// Cross-task coherence of adequacy scores
    Integration,
}

impl std::fmt::Display for QualityDimensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accuracy => write!(f, "accuracy"),
            Self::Completeness => write!(f, "completeness"),
            Self::Consistency => write!(f, "consistency"),
            Self::Confidence => write!(f, "confidence"),
            Self::Integration => write!(f, "integration"),
        }
    }
}

impl QualityDimensionKind {
    /// Score the dimension over the full result set. Always within [0,1].
    fn assess(&self, results: &[TaskResult]) -> f64 {
        if results.is_empty() {
            return 0.0;
        }
        match self {
            Self::Accuracy => weighted_mean(results, |r| {
                if r.success {
                    r.adequacy_contribution
                } else {
                    0.0
                }
            }),
            Self::Completeness => {
                weighted_mean(results, |r| if r.success { 1.0 } else { 0.0 })
            }
            Self::Consistency => {
                let penalty: f64 = results
                    .iter()
                    .flat_map(|r| r.issues.iter())
                    .map(|i| match i.severity {
                        IssueSeverity::Error => 0.25,
                        IssueSeverity::Warning => 0.1,
                        IssueSeverity::Info => 0.0,
                    })
                    .sum();
                (1.0 - penalty / results.len() as f64).clamp(0.0, 1.0)
            }
            Self::Confidence => weighted_mean(results, |r| r.confidence),
            Self::Integration => {
                let mean = results.iter().map(|r| r.adequacy_contribution).sum::<f64>()
                    / results.len() as f64;
                let spread = results
                    .iter()
                    .map(|r| (r.adequacy_contribution - mean).abs())
                    .sum::<f64>()
                    / results.len() as f64;
                (1.0 - 2.0 * spread).clamp(0.0, 1.0)
            }
        }
    }
}

/// One configured dimension: what to score, how much it counts, and the
/// floor below which it is considered deficient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityDimension {
    pub kind: QualityDimensionKind,
    pub weight: f64,
    pub threshold: f64,
}

impl QualityDimension {
    pub fn new(kind: QualityDimensionKind, weight: f64, threshold: f64) -> Self {
        Self {
            kind,
            weight: weight.clamp(0.0, 1.0),
            threshold: threshold.clamp(0.0, 1.0),
        }
    }
}

/// Aggregate quality of a session's current result set. Recomputed whole
/// every refinement iteration, never partially updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall_score: f64,
    pub confidence: f64,
    pub critical_issues: usize,
    pub dimension_scores: BTreeMap<QualityDimensionKind, f64>,
}

impl QualityMetrics {
    pub fn empty() -> Self {
        Self {
            overall_score: 0.0,
            confidence: 0.0,
            critical_issues: 0,
            dimension_scores: BTreeMap::new(),
        }
    }
}

/// Scores a task-result set against configured dimensions.
pub struct QualityAssessor {
    dimensions: Vec<QualityDimension>,
}

impl QualityAssessor {
    /// Default dimensions. Integration ships disabled (weight 0.0) and is
    /// turned on by configuration when cross-task coherence matters.
    pub fn new() -> Self {
        Self {
            dimensions: vec![
                QualityDimension::new(QualityDimensionKind::Accuracy, 0.35, 0.7),
                QualityDimension::new(QualityDimensionKind::Completeness, 0.25, 0.7),
                QualityDimension::new(QualityDimensionKind::Consistency, 0.2, 0.6),
                QualityDimension::new(QualityDimensionKind::Confidence, 0.2, 0.6),
                QualityDimension::new(QualityDimensionKind::Integration, 0.0, 0.5),
            ],
        }
    }

    pub fn with_dimensions(dimensions: Vec<QualityDimension>) -> Self {
        Self { dimensions }
    }

    /// Enable the integration dimension with the given weight.
    pub fn with_integration_weight(mut self, weight: f64) -> Self {
        for dim in &mut self.dimensions {
            if dim.kind == QualityDimensionKind::Integration {
                dim.weight = weight.clamp(0.0, 1.0);
            }
        }
        self
    }

    pub fn assess(&self, results: &[TaskResult]) -> QualityMetrics {
        if results.is_empty() {
            return QualityMetrics::empty();
        }

        let mut dimension_scores = BTreeMap::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for dim in &self.dimensions {
            let score = dim.kind.assess(results);
            dimension_scores.insert(dim.kind, score);
            weighted_sum += dim.weight * score;
            weight_total += dim.weight;
        }

        let overall_score = if weight_total <= f64::EPSILON {
            0.0
        } else {
            (weighted_sum / weight_total).clamp(0.0, 1.0)
        };
        let confidence = weighted_mean(results, |r| r.confidence);
        let critical_issues = results.iter().map(|r| r.critical_issue_count()).sum();

        QualityMetrics {
            overall_score,
            confidence,
            critical_issues,
            dimension_scores,
        }
    }

    /// Dimensions scoring below their configured floor, ordered worst first.
    pub fn deficient_dimensions(&self, metrics: &QualityMetrics) -> Vec<QualityDimensionKind> {
        let mut deficient: Vec<(QualityDimensionKind, f64)> = self
            .dimensions
            .iter()
            .filter(|d| d.weight > 0.0)
            .filter_map(|d| {
                let score = *metrics.dimension_scores.get(&d.kind)?;
                (score < d.threshold).then_some((d.kind, score))
            })
            .collect();
        deficient.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        deficient.into_iter().map(|(kind, _)| kind).collect()
    }
}

impl Default for QualityAssessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Importance-weighted mean over results. Uniform when all importances are 0.
fn weighted_mean(results: &[TaskResult], value: impl Fn(&TaskResult) -> f64) -> f64 {
    let weight_total: f64 = results.iter().map(|r| r.importance_weight).sum();
    if weight_total <= f64::EPSILON {
        let sum: f64 = results.iter().map(&value).sum();
        return (sum / results.len().max(1) as f64).clamp(0.0, 1.0);
    }
    let sum: f64 = results
        .iter()
        .map(|r| r.importance_weight * value(r))
        .sum();
    (sum / weight_total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::TaskId;
    use crate::pipeline::types::ValidationIssue;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn result(success: bool, adequacy: f64, importance: f64, confidence: f64) -> TaskResult {
        TaskResult::new(TaskId::new(), success, adequacy, importance, confidence)
    }

    #[test]
    fn test_empty_result_set() {
        let metrics = QualityAssessor::new().assess(&[]);
        assert_eq!(metrics.overall_score, 0.0);
        assert_eq!(metrics.critical_issues, 0);
    }

    #[test]
    fn test_importance_weighting() {
        // The important task dominates the unimportant one.
        let strong = vec![result(true, 0.9, 0.9, 0.9), result(true, 0.1, 0.1, 0.1)];
        let weak = vec![result(true, 0.9, 0.1, 0.9), result(true, 0.1, 0.9, 0.1)];

        let assessor = QualityAssessor::new();
        assert!(
            assessor.assess(&strong).overall_score > assessor.assess(&weak).overall_score
        );
    }

    #[test]
    fn test_critical_issue_counting() {
        let mut r = result(true, 0.8, 0.5, 0.8);
        r.issues.push(ValidationIssue::error("bad", "test"));
        r.issues.push(ValidationIssue::warning("meh", "test"));

        let metrics = QualityAssessor::new().assess(&[r, result(true, 0.8, 0.5, 0.8)]);
        assert_eq!(metrics.critical_issues, 1);
    }

    #[test]
    fn test_failed_tasks_depress_completeness() {
        let results = vec![result(true, 0.9, 0.5, 0.9), result(false, 0.0, 0.5, 0.2)];
        let metrics = QualityAssessor::new().assess(&results);
        let completeness = metrics.dimension_scores[&QualityDimensionKind::Completeness];
        assert!((completeness - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_integration_off_by_default() {
        let uneven = vec![result(true, 1.0, 0.5, 0.8), result(true, 0.0, 0.5, 0.8)];
        let even = vec![result(true, 0.5, 0.5, 0.8), result(true, 0.5, 0.5, 0.8)];

        let default_assessor = QualityAssessor::new();
        // With weight 0 the integration spread does not move the overall score
        // beyond what accuracy already captures.
        let with_integration = QualityAssessor::new().with_integration_weight(0.5);
        let delta_default = default_assessor.assess(&even).overall_score
            - default_assessor.assess(&uneven).overall_score;
        let delta_integrated = with_integration.assess(&even).overall_score
            - with_integration.assess(&uneven).overall_score;
        assert!(delta_integrated > delta_default);
    }

    #[test]
    fn test_deficient_dimensions_ordered_worst_first() {
        let results = vec![result(false, 0.0, 0.5, 0.1)];
        let assessor = QualityAssessor::new();
        let metrics = assessor.assess(&results);
        let deficient = assessor.deficient_dimensions(&metrics);

        assert!(!deficient.is_empty());
        let scores: Vec<f64> = deficient
            .iter()
            .map(|k| metrics.dimension_scores[k])
            .collect();
        assert!(scores.windows(2).all(|w| w[0] <= w[1]));
    }

    proptest! {
        #[test]
        fn prop_assessment_is_idempotent_and_in_range(
            inputs in proptest::collection::vec(
                (any::<bool>(), -2.0f64..2.0, -2.0f64..2.0, -2.0f64..2.0),
                0..16,
            )
        ) {
            let results: Vec<TaskResult> = inputs
                .into_iter()
                .map(|(s, a, i, c)| result(s, a, i, c))
                .collect();

            let assessor = QualityAssessor::new();
            let first = assessor.assess(&results);
            let second = assessor.assess(&results);

            prop_assert_eq!(&first, &second);
            prop_assert!((0.0..=1.0).contains(&first.overall_score));
            prop_assert!((0.0..=1.0).contains(&first.confidence));
            for score in first.dimension_scores.values() {
                prop_assert!((0.0..=1.0).contains(score));
            }
        }
    }
}
