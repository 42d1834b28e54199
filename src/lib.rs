//! # metacog-core
//!
//! A metacognitive validation orchestration library. Content is classified,
//! decomposed into a dependency graph of bounded subtasks, pushed through a
//! staged assessment pipeline backed by an abstract language-model provider,
//! contrasted against deliberately absurd alternatives, and iteratively
//! refined until quality thresholds or budgets are met.
//!
//! ## Core Components
//!
//! - **Context**: Problem classification and systematic bias derivation
//! - **Decompose**: Semantic-unit task graphs with dependency scheduling
//! - **Pipeline**: The six per-task assessment stages
//! - **Boundary**: Contrastive "can mean / cannot mean" bounding
//! - **Quality / Refine**: Session-level scoring and the refinement loop
//! - **Orchestrator**: The single entry point composing everything
//!
//! ## Example
//!
//! ```rust,ignore
//! use metacog_core::{Approach, Orchestrator};
//! use std::sync::Arc;
//!
//! let orchestrator = Orchestrator::new(provider).with_approach(Approach::Cautious);
//! let result = orchestrator
//!     .orchestrate_validation("The Amazon river is 6400 km long.", None)
//!     .await;
//!
//! println!("{}: {}", result.termination_reason, result.quality.overall_score);
//! ```

pub mod boundary;
pub mod context;
pub mod decompose;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod quality;
pub mod refine;
pub mod session;
pub mod trajectory;

// Re-exports for convenience
pub use boundary::{
    BoundaryEngine, FinalValidation, PugachevCobraResult, RidiculousSolution,
    ValidationBoundaries, ValidationSpace,
};
pub use context::{
    ContextCharacteristics, ContextClassifier, ContextType, ProblemContext, Stakes,
    SystematicBias, TerminationCriteria,
};
pub use decompose::{Capability, TaskDecomposer, TaskGraph, TaskId, TaskType, ValidationTask};
pub use error::{Error, Result};
pub use orchestrator::{
    Approach, OrchestrationStrategy, Orchestrator, ResourceAllocation, TerminationConditions,
    ValidationResult,
};
pub use pipeline::{
    ConsensusValidation, DomainKnowledgeOutput, EnsembleStrategy, EnsembleStrategyKind,
    IssueSeverity, SolutionCandidate, StageConfiguration, StageKind, StagePipeline, StageResult,
    StructuredQuery, TaskExecution, TaskResult, ValidationIssue, VerificationCriterion,
};
pub use provider::{Completion, CompletionConfig, LanguageModelProvider, RetryingProvider};
pub use quality::{QualityAssessor, QualityDimension, QualityDimensionKind, QualityMetrics};
pub use refine::{
    QualityThresholds, RefinementController, RefinementDecision, RefinementState,
    TerminationReason,
};
pub use session::{
    CancellationToken, IterationRecord, ProcessingSession, ResourceLedger, SessionId,
    SessionStatus,
};
pub use trajectory::{
    BroadcastEmitter, CollectingEmitter, NullEmitter, TrajectoryEmitter, TrajectoryEvent,
    TrajectoryEventType, Verbosity,
};
