//! Staged per-task assessment pipeline.
//!
//! Stages 1-6 run per task in dependency order: query processing, domain
//! knowledge, solution generation, ensemble diversification, threshold
//! verification, counter-validation. Stages 7 and 8 (quality assessment and
//! refinement) are session-level and live in [`crate::quality`] and
//! [`crate::refine`].

pub mod ensemble;
pub mod stages;
pub mod types;

pub use ensemble::{
    ensemble_strategy_for, DiversityMaximizingStrategy, EnsembleStrategy, EnsembleStrategyKind,
    GreedyStrategy, RandomSamplingStrategy,
};
pub use stages::{StagePipeline, TaskExecution};
pub use types::{
    ConflictResolution, ConsensusValidation, CriterionCheck, DomainKnowledgeOutput, Evidence,
    IssueSeverity, ResourceUsage, SolutionCandidate, StageConfiguration, StageKind, StageOutput,
    StageResult, StructuredQuery, TaskResult, ValidationIssue, VerificationCriterion,
    VerificationOutcome,
};
