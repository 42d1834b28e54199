//! Stage input/output types for the assessment pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decompose::TaskId;

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single finding recorded against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub message: String,
    pub severity: IssueSeverity,
    /// Confidence in the finding (0.0-1.0)
    pub confidence: f64,
    pub category: String,
}

impl ValidationIssue {
    pub fn new(
        message: impl Into<String>,
        severity: IssueSeverity,
        confidence: f64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            category: category.into(),
        }
    }

    pub fn error(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self::new(message, IssueSeverity::Error, 0.9, category)
    }

    pub fn warning(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self::new(message, IssueSeverity::Warning, 0.7, category)
    }

    pub fn info(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self::new(message, IssueSeverity::Info, 0.5, category)
    }

    pub fn is_critical(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

/// Stage 1 output: the task's content reduced to an assessable query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    /// What the unit is trying to do (assert, instruct, demonstrate)
    pub intent: String,
    /// Named entities and quantities found in the unit
    pub entities: Vec<String>,
    /// Explicit constraints the unit imposes or assumes
    pub constraints: Vec<String>,
    pub confidence: f64,
}

impl StructuredQuery {
    pub fn new(intent: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: intent.into(),
            entities: Vec::new(),
            constraints: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// One piece of evidence gathered in stage 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub statement: String,
    /// Whether the evidence supports the unit's claim
    pub supports: bool,
    pub confidence: f64,
}

impl Evidence {
    pub fn new(statement: impl Into<String>, supports: bool, confidence: f64) -> Self {
        Self {
            statement: statement.into(),
            supports,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// How a conflict between evidence items was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub topic: String,
    pub chosen: String,
    pub rejected: String,
    /// Confidence margin of the winning side
    pub confidence: f64,
}

/// Stage 2 output: evidence, consensus, and resolved conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainKnowledgeOutput {
    pub evidence: Vec<Evidence>,
    /// Statements the evidence agrees on
    pub consensus: Vec<String>,
    pub conflicts: Vec<ConflictResolution>,
    pub confidence: f64,
}

impl DomainKnowledgeOutput {
    /// Supporting-evidence fraction weighted by item confidence.
    pub fn support_ratio(&self) -> f64 {
        let total: f64 = self.evidence.iter().map(|e| e.confidence).sum();
        if total <= f64::EPSILON {
            return 0.5;
        }
        let supporting: f64 = self
            .evidence
            .iter()
            .filter(|e| e.supports)
            .map(|e| e.confidence)
            .sum();
        (supporting / total).clamp(0.0, 1.0)
    }
}

/// Stage 3 output: one candidate assessment of the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionCandidate {
    pub text: String,
    pub quality_score: f64,
    pub confidence: f64,
}

impl SolutionCandidate {
    pub fn new(text: impl Into<String>, quality_score: f64, confidence: f64) -> Self {
        Self {
            text: text.into(),
            quality_score: quality_score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A criterion every candidate must satisfy in stage 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationCriterion {
    LogicalConsistency,
    FactualAccuracy,
    ContextCompliance,
    ConstraintSatisfaction,
    QualityStandards,
}

impl VerificationCriterion {
    pub const ALL: [Self; 5] = [
        Self::LogicalConsistency,
        Self::FactualAccuracy,
        Self::ContextCompliance,
        Self::ConstraintSatisfaction,
        Self::QualityStandards,
    ];
}

impl std::fmt::Display for VerificationCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LogicalConsistency => write!(f, "logical_consistency"),
            Self::FactualAccuracy => write!(f, "factual_accuracy"),
            Self::ContextCompliance => write!(f, "context_compliance"),
            Self::ConstraintSatisfaction => write!(f, "constraint_satisfaction"),
            Self::QualityStandards => write!(f, "quality_standards"),
        }
    }
}

/// One criterion's verdict for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionCheck {
    pub criterion: VerificationCriterion,
    pub passed: bool,
    pub confidence: f64,
    pub note: Option<String>,
}

/// Stage 5 output for one candidate. Passing requires every criterion to hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub candidate: SolutionCandidate,
    pub checks: Vec<CriterionCheck>,
}

impl VerificationOutcome {
    pub fn passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_criteria(&self) -> Vec<VerificationCriterion> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.criterion)
            .collect()
    }
}

/// Stage 6 output: agreement between the primary and an independent pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusValidation {
    /// Agreement between the two passes (0.0-1.0)
    pub agreement: f64,
    pub independent_confidence: f64,
    /// True when disagreement exceeded the configured threshold
    pub escalated: bool,
}

impl ConsensusValidation {
    pub fn new(agreement: f64, independent_confidence: f64, disagreement_threshold: f64) -> Self {
        let agreement = agreement.clamp(0.0, 1.0);
        Self {
            agreement,
            independent_confidence: independent_confidence.clamp(0.0, 1.0),
            escalated: (1.0 - agreement) > disagreement_threshold,
        }
    }
}

/// The six per-task stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    QueryProcessing,
    DomainKnowledge,
    SolutionGeneration,
    EnsembleDiversification,
    ThresholdVerification,
    CounterValidation,
}

impl StageKind {
    pub const ORDERED: [Self; 6] = [
        Self::QueryProcessing,
        Self::DomainKnowledge,
        Self::SolutionGeneration,
        Self::EnsembleDiversification,
        Self::ThresholdVerification,
        Self::CounterValidation,
    ];

    pub fn number(&self) -> u8 {
        match self {
            Self::QueryProcessing => 1,
            Self::DomainKnowledge => 2,
            Self::SolutionGeneration => 3,
            Self::EnsembleDiversification => 4,
            Self::ThresholdVerification => 5,
            Self::CounterValidation => 6,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryProcessing => write!(f, "query_processing"),
            Self::DomainKnowledge => write!(f, "domain_knowledge"),
            Self::SolutionGeneration => write!(f, "solution_generation"),
            Self::EnsembleDiversification => write!(f, "ensemble_diversification"),
            Self::ThresholdVerification => write!(f, "threshold_verification"),
            Self::CounterValidation => write!(f, "counter_validation"),
        }
    }
}

/// Typed payload of one stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Query(StructuredQuery),
    Knowledge(DomainKnowledgeOutput),
    Candidates(Vec<SolutionCandidate>),
    Ensemble(Vec<SolutionCandidate>),
    Verification(Vec<VerificationOutcome>),
    Consensus(ConsensusValidation),
    /// The stage failed before producing output
    Failed { message: String },
}

/// Provider calls and wall time consumed by one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub llm_calls: u32,
    pub elapsed_ms: u64,
}

impl ResourceUsage {
    pub fn new(llm_calls: u32, elapsed_ms: u64) -> Self {
        Self {
            llm_calls,
            elapsed_ms,
        }
    }
}

/// Outcome of one stage for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub success: bool,
    pub output: StageOutput,
    pub quality_score: f64,
    pub confidence: f64,
    pub resources_used: ResourceUsage,
}

impl StageResult {
    pub fn new(
        stage: StageKind,
        output: StageOutput,
        quality_score: f64,
        confidence: f64,
        resources_used: ResourceUsage,
    ) -> Self {
        Self {
            stage,
            success: true,
            output,
            quality_score: quality_score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            resources_used,
        }
    }

    /// A failed stage keeps its resource usage but carries no output.
    pub fn failed(
        stage: StageKind,
        message: impl Into<String>,
        resources_used: ResourceUsage,
    ) -> Self {
        Self {
            stage,
            success: false,
            output: StageOutput::Failed {
                message: message.into(),
            },
            quality_score: 0.0,
            confidence: 0.0,
            resources_used,
        }
    }
}

/// Per-stage execution limits and ensemble knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfiguration {
    /// Hard ceiling per stage, enforced with a timeout around provider work
    pub timeout_ms: u64,
    /// Retries for transient provider errors before the task fails
    pub retry_count: u32,
    /// Minimum pairwise diversity the ensemble aims for
    pub diversity_threshold: f64,
    /// Candidates surviving stage 4
    pub max_candidates: usize,
    /// Counter-validation disagreement above this escalates
    pub disagreement_threshold: f64,
}

impl Default for StageConfiguration {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_count: 1,
            diversity_threshold: 0.3,
            max_candidates: 3,
            disagreement_threshold: 0.4,
        }
    }
}

impl StageConfiguration {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates.max(1);
        self
    }

    pub fn with_diversity_threshold(mut self, diversity_threshold: f64) -> Self {
        self.diversity_threshold = diversity_threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_disagreement_threshold(mut self, disagreement_threshold: f64) -> Self {
        self.disagreement_threshold = disagreement_threshold.clamp(0.0, 1.0);
        self
    }
}

/// Final outcome of stages 1-6 for one task. Superseded, never mutated,
/// on refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    /// How much this result satisfies the task's validation purpose (0.0-1.0)
    pub adequacy_contribution: f64,
    pub importance_weight: f64,
    pub confidence: f64,
    pub issues: Vec<ValidationIssue>,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(
        task_id: TaskId,
        success: bool,
        adequacy_contribution: f64,
        importance_weight: f64,
        confidence: f64,
    ) -> Self {
        Self {
            task_id,
            success,
            adequacy_contribution: adequacy_contribution.clamp(0.0, 1.0),
            importance_weight: importance_weight.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            issues: Vec::new(),
            processing_time_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// A failed result carrying one issue, used when a stage cannot recover.
    pub fn failed(task_id: TaskId, importance_weight: f64, issue: ValidationIssue) -> Self {
        let mut result = Self::new(task_id, false, 0.0, importance_weight, 0.0);
        result.issues.push(issue);
        result
    }

    pub fn with_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_processing_time_ms(mut self, ms: u64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    pub fn critical_issue_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_critical()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_issue_confidence_clamped() {
        let issue = ValidationIssue::new("too sure", IssueSeverity::Warning, 3.2, "test");
        assert_eq!(issue.confidence, 1.0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(IssueSeverity::Error > IssueSeverity::Warning);
        assert!(IssueSeverity::Warning > IssueSeverity::Info);
    }

    #[test]
    fn test_verification_requires_all_criteria() {
        let candidate = SolutionCandidate::new("ok", 0.8, 0.8);
        let mut outcome = VerificationOutcome {
            candidate,
            checks: VerificationCriterion::ALL
                .iter()
                .map(|c| CriterionCheck {
                    criterion: *c,
                    passed: true,
                    confidence: 0.8,
                    note: None,
                })
                .collect(),
        };
        assert!(outcome.passed());

        outcome.checks[2].passed = false;
        assert!(!outcome.passed());
        assert_eq!(
            outcome.failed_criteria(),
            vec![VerificationCriterion::ContextCompliance]
        );
    }

    #[test]
    fn test_consensus_escalation() {
        let agreeing = ConsensusValidation::new(0.9, 0.8, 0.4);
        assert!(!agreeing.escalated);

        let disagreeing = ConsensusValidation::new(0.3, 0.8, 0.4);
        assert!(disagreeing.escalated);
    }

    #[test]
    fn test_support_ratio_empty_evidence() {
        let output = DomainKnowledgeOutput {
            evidence: vec![],
            consensus: vec![],
            conflicts: vec![],
            confidence: 0.5,
        };
        assert_eq!(output.support_ratio(), 0.5);
    }

    #[test]
    fn test_failed_result_carries_issue() {
        let result = TaskResult::failed(
            crate::decompose::TaskId::new(),
            0.5,
            ValidationIssue::error("provider timed out", "provider"),
        );
        assert!(!result.success);
        assert_eq!(result.adequacy_contribution, 0.0);
        assert_eq!(result.critical_issue_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_task_result_fields_clamped(
            adequacy in -10.0f64..10.0,
            importance in -10.0f64..10.0,
            confidence in -10.0f64..10.0,
        ) {
            let result = TaskResult::new(
                crate::decompose::TaskId::new(), true, adequacy, importance, confidence,
            );
            prop_assert!((0.0..=1.0).contains(&result.adequacy_contribution));
            prop_assert!((0.0..=1.0).contains(&result.importance_weight));
            prop_assert!((0.0..=1.0).contains(&result.confidence));
        }

        #[test]
        fn prop_support_ratio_in_range(
            items in proptest::collection::vec((any::<bool>(), 0.0f64..1.0), 0..12)
        ) {
            let output = DomainKnowledgeOutput {
                evidence: items
                    .into_iter()
                    .map(|(s, c)| Evidence::new("e", s, c))
                    .collect(),
                consensus: vec![],
                conflicts: vec![],
                confidence: 0.5,
            };
            prop_assert!((0.0..=1.0).contains(&output.support_ratio()));
        }
    }
}
