//! The metacognitive orchestrator.
//!
//! Composes classification, decomposition, the staged pipeline, boundary
//! checking, quality assessment and refinement into one
//! [`Orchestrator::orchestrate_validation`] call. The call always returns a
//! structured [`ValidationResult`]; only decomposition failure and total
//! provider unavailability surface as a failed result, never as a panic or
//! bare error.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::boundary::{BoundaryEngine, PugachevCobraResult};
use crate::context::{ContextClassifier, ProblemContext, SystematicBias};
use crate::decompose::{TaskDecomposer, TaskGraph, TaskId};
use crate::error::Error;
use crate::pipeline::ensemble::{ensemble_strategy_for, EnsembleStrategyKind};
use crate::pipeline::stages::{StagePipeline, TaskExecution};
use crate::pipeline::types::{StageConfiguration, TaskResult};
use crate::provider::LanguageModelProvider;
use crate::quality::{QualityAssessor, QualityMetrics};
use crate::refine::{QualityThresholds, RefinementController, TerminationReason};
use crate::session::{CancellationToken, IterationRecord, ProcessingSession, SessionId};
use crate::trajectory::{NullEmitter, TrajectoryEmitter, TrajectoryEvent};

/// High-level validation posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    /// Thorough: generous budgets, diversity-seeking ensemble
    Comprehensive,
    /// Strict: high thresholds, low tolerance for disagreement
    Cautious,
    /// Fast: tight budgets, greedy ensemble, single refinement pass
    Efficient,
}

impl std::fmt::Display for Approach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Comprehensive => write!(f, "comprehensive"),
            Self::Cautious => write!(f, "cautious"),
            Self::Efficient => write!(f, "efficient"),
        }
    }
}

/// Hard resource ceilings for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub max_processing_time_ms: u64,
    pub max_memory_mb: u64,
    pub max_llm_calls: u32,
}

/// Limits on the refinement loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminationConditions {
    pub max_refinement_iterations: u32,
    pub max_processing_time_ms: u64,
    /// Minimum between-iteration improvement; less means stagnation
    pub quality_stagnation_threshold: f64,
    /// Fraction of the LLM-call budget at which new work stops
    pub resource_exhaustion_threshold: f64,
}

/// Full configuration for one orchestration call. Immutable for the
/// duration of the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationStrategy {
    pub approach: Approach,
    pub resource_allocation: ResourceAllocation,
    pub termination_conditions: TerminationConditions,
    pub ensemble: EnsembleStrategyKind,
    pub quality_thresholds: QualityThresholds,
    pub stage_config: StageConfiguration,
}

impl OrchestrationStrategy {
    pub fn for_approach(approach: Approach) -> Self {
        match approach {
            Approach::Comprehensive => Self {
                approach,
                resource_allocation: ResourceAllocation {
                    max_processing_time_ms: 120_000,
                    max_memory_mb: 512,
                    max_llm_calls: 200,
                },
                termination_conditions: TerminationConditions {
                    max_refinement_iterations: 4,
                    max_processing_time_ms: 120_000,
                    quality_stagnation_threshold: 0.01,
                    resource_exhaustion_threshold: 0.9,
                },
                ensemble: EnsembleStrategyKind::DiversityMaximizing,
                quality_thresholds: QualityThresholds {
                    overall_score: 0.8,
                    confidence: 0.65,
                },
                stage_config: StageConfiguration::default()
                    .with_timeout_ms(15_000)
                    .with_retry_count(2)
                    .with_max_candidates(4),
            },
            Approach::Cautious => Self {
                approach,
                resource_allocation: ResourceAllocation {
                    max_processing_time_ms: 60_000,
                    max_memory_mb: 256,
                    max_llm_calls: 100,
                },
                termination_conditions: TerminationConditions {
                    max_refinement_iterations: 3,
                    max_processing_time_ms: 60_000,
                    quality_stagnation_threshold: 0.02,
                    resource_exhaustion_threshold: 0.9,
                },
                ensemble: EnsembleStrategyKind::DiversityMaximizing,
                quality_thresholds: QualityThresholds {
                    overall_score: 0.85,
                    confidence: 0.7,
                },
                stage_config: StageConfiguration::default()
                    .with_timeout_ms(10_000)
                    .with_retry_count(1)
                    .with_disagreement_threshold(0.3),
            },
            Approach::Efficient => Self {
                approach,
                resource_allocation: ResourceAllocation {
                    max_processing_time_ms: 20_000,
                    max_memory_mb: 128,
                    max_llm_calls: 40,
                },
                termination_conditions: TerminationConditions {
                    max_refinement_iterations: 1,
                    max_processing_time_ms: 20_000,
                    quality_stagnation_threshold: 0.05,
                    resource_exhaustion_threshold: 1.0,
                },
                ensemble: EnsembleStrategyKind::Greedy,
                quality_thresholds: QualityThresholds {
                    overall_score: 0.65,
                    confidence: 0.5,
                },
                stage_config: StageConfiguration::default()
                    .with_timeout_ms(5_000)
                    .with_retry_count(1)
                    .with_max_candidates(2),
            },
        }
    }
}

impl Default for OrchestrationStrategy {
    fn default() -> Self {
        Self::for_approach(Approach::Comprehensive)
    }
}

/// Outcome of one orchestration call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub session_id: SessionId,
    /// True only when the session converged on its quality thresholds
    pub success: bool,
    pub task_results: Vec<TaskResult>,
    pub quality: QualityMetrics,
    pub boundary_checks: Vec<PugachevCobraResult>,
    pub strategy: OrchestrationStrategy,
    pub termination_reason: TerminationReason,
    pub iterations: u32,
    pub history: Vec<IterationRecord>,
    pub started_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    pub llm_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Composes the validation components into one entry point.
///
/// One [`ProcessingSession`] is created and archived per call; no state is
/// shared across concurrent calls.
pub struct Orchestrator {
    provider: Arc<dyn LanguageModelProvider>,
    strategy: OrchestrationStrategy,
    assessor: QualityAssessor,
    emitter: Arc<dyn TrajectoryEmitter>,
    contrast_floor: f64,
    bias_override: Option<SystematicBias>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn LanguageModelProvider>) -> Self {
        Self {
            provider,
            strategy: OrchestrationStrategy::default(),
            assessor: QualityAssessor::new(),
            emitter: Arc::new(NullEmitter),
            contrast_floor: 0.35,
            bias_override: None,
        }
    }

    pub fn with_strategy(mut self, strategy: OrchestrationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_approach(self, approach: Approach) -> Self {
        let strategy = OrchestrationStrategy::for_approach(approach);
        self.with_strategy(strategy)
    }

    pub fn with_assessor(mut self, assessor: QualityAssessor) -> Self {
        self.assessor = assessor;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn TrajectoryEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_contrast_floor(mut self, contrast_floor: f64) -> Self {
        self.contrast_floor = contrast_floor.clamp(0.0, 1.0);
        self
    }

    /// Replaces the context-derived bias with a caller-supplied one. The
    /// override is treated as immutable for the duration of each call.
    pub fn with_bias(mut self, bias: SystematicBias) -> Self {
        self.bias_override = Some(bias);
        self
    }

    pub fn strategy(&self) -> &OrchestrationStrategy {
        &self.strategy
    }

    /// Validate content. When no context is supplied one is classified from
    /// the content itself.
    pub async fn orchestrate_validation(
        &self,
        content: &str,
        context: Option<ProblemContext>,
    ) -> ValidationResult {
        self.orchestrate_with_cancellation(content, context, CancellationToken::new())
            .await
    }

    /// Validate content under an external cancellation token, so a newer
    /// request for the same document can supersede this one.
    #[instrument(skip_all, fields(content_len = content.len()))]
    pub async fn orchestrate_with_cancellation(
        &self,
        content: &str,
        context: Option<ProblemContext>,
        cancel: CancellationToken,
    ) -> ValidationResult {
        let context = match context {
            Some(ctx) => ctx,
            None => ContextClassifier::new().classify(content).await,
        };
        let bias = match &self.bias_override {
            Some(bias) => bias.clone(),
            None => SystematicBias::from_context(&context),
        };
        let mut session = ProcessingSession::new(context.clone()).with_cancellation(cancel);

        self.emitter.emit(TrajectoryEvent::session_start(
            session.id().to_string(),
            content.len(),
        ));
        self.emitter.emit(TrajectoryEvent::context_classified(
            context.context_type.to_string(),
            context.stakes.to_string(),
        ));

        let graph = match TaskDecomposer::new().decompose(content, &context) {
            Ok(graph) => graph,
            Err(err) => {
                self.emitter.emit(TrajectoryEvent::error(0, err.to_string()));
                return self.fatal_result(session, TerminationReason::DecompositionFailed, err);
            }
        };
        let levels = match graph.topological_levels() {
            Ok(levels) => levels,
            Err(err) => {
                self.emitter.emit(TrajectoryEvent::error(0, err.to_string()));
                return self.fatal_result(session, TerminationReason::DecompositionFailed, err);
            }
        };
        self.emitter
            .emit(TrajectoryEvent::decompose(graph.len(), levels.len()));

        let pipeline = StagePipeline::new(
            Arc::clone(&self.provider),
            self.strategy.stage_config.clone(),
            ensemble_strategy_for(self.strategy.ensemble),
        )
        .with_emitter(Arc::clone(&self.emitter));
        let engine = BoundaryEngine::new(Arc::clone(&self.provider))
            .with_contrast_floor(self.contrast_floor)
            .with_timeout_ms(self.strategy.stage_config.timeout_ms);

        let limits = self.effective_limits(&bias);
        let mut controller = RefinementController::new(
            self.strategy.quality_thresholds,
            limits.max_iterations,
            limits.max_time_ms,
            self.strategy.termination_conditions.quality_stagnation_threshold,
        );

        let mut result_map: HashMap<TaskId, TaskResult> = HashMap::new();
        let token = session.cancellation_token();

        let (metrics, boundary_checks) = loop {
            let iteration = controller.iteration();
            let executions = self
                .run_iteration(
                    &pipeline, &graph, &levels, &context, &bias, &result_map, &token, &limits,
                    &mut session, &mut controller, iteration,
                )
                .await;

            for exec in &executions {
                result_map.insert(exec.result.task_id, exec.result.clone());
            }

            let checks = self
                .run_boundary_checks(&engine, &graph, &executions, &limits, &mut session,
                    &mut controller, iteration)
                .await;

            let ordered: Vec<TaskResult> = graph
                .tasks()
                .iter()
                .filter_map(|t| result_map.get(&t.id).cloned())
                .collect();
            session.supersede_results(ordered);

            // A result set where every task died on a transient provider
            // error means the provider is effectively down.
            let results = session.results();
            if !results.is_empty()
                && results.iter().all(|r| {
                    !r.success && r.issues.iter().any(|i| i.category == "provider")
                })
            {
                controller.force_termination(TerminationReason::ResourceExhausted);
            }

            let metrics = self.assessor.assess(session.results());
            self.emitter.emit(TrajectoryEvent::quality_assessed(
                iteration,
                metrics.overall_score,
                metrics.critical_issues,
            ));

            let target_areas = self.assessor.deficient_dimensions(&metrics);
            let decision =
                controller.evaluate(&metrics, target_areas, session.ledger().elapsed_ms());
            session.record_iteration(metrics.clone(), decision.clone());

            if !decision.needs_refinement {
                break (metrics, checks);
            }
            self.emitter.emit(TrajectoryEvent::refinement_triggered(
                decision.iteration,
                decision
                    .target_areas
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        };

        let termination_reason = controller
            .termination_reason()
            .unwrap_or(TerminationReason::Converged);
        let success = termination_reason == TerminationReason::Converged;

        if success {
            session.complete();
        } else {
            session.fail();
        }
        self.emitter.emit(TrajectoryEvent::final_result(
            controller.iteration(),
            termination_reason.to_string(),
            success,
        ));

        let result = ValidationResult {
            session_id: session.id(),
            success,
            task_results: session.results().to_vec(),
            quality: metrics,
            boundary_checks,
            strategy: self.strategy.clone(),
            termination_reason,
            iterations: controller.iteration(),
            history: session.history().to_vec(),
            started_at: session.started_at(),
            processing_time_ms: session.ledger().elapsed_ms(),
            llm_calls: session.ledger().llm_calls(),
            error: None,
        };
        session.archive();

        tracing::info!(
            session_id = %result.session_id,
            success,
            reason = %termination_reason,
            tasks = result.task_results.len(),
            llm_calls = result.llm_calls,
            "orchestration finished"
        );
        result
    }

    /// One full pass of stages 1-6 over the task graph, level by level.
    /// Between levels the budgets and the token are checked; an exceeded
    /// budget stops new work while completed results are kept.
    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        pipeline: &StagePipeline,
        graph: &TaskGraph,
        levels: &[Vec<TaskId>],
        context: &ProblemContext,
        bias: &SystematicBias,
        prior_results: &HashMap<TaskId, TaskResult>,
        token: &CancellationToken,
        limits: &EffectiveLimits,
        session: &mut ProcessingSession,
        controller: &mut RefinementController,
        iteration: u32,
    ) -> Vec<TaskExecution> {
        let mut executions = Vec::new();
        let mut level_results: HashMap<TaskId, TaskResult> = HashMap::new();

        for level in levels {
            if let Some(resource) = limits.exceeded(session) {
                tracing::warn!(resource, "session budget exhausted, stopping new work");
                controller.force_termination(TerminationReason::ResourceExhausted);
                return executions;
            }
            if token.is_cancelled() {
                controller.force_termination(TerminationReason::Cancelled);
                return executions;
            }

            let futures = level.iter().filter_map(|id| graph.get(*id)).map(|task| {
                let prerequisites: Vec<TaskResult> = task
                    .depends_on
                    .iter()
                    .filter_map(|dep| {
                        level_results.get(dep).or_else(|| prior_results.get(dep))
                    })
                    .cloned()
                    .collect();
                async move {
                    (
                        task,
                        pipeline
                            .run_task(task, context, bias, &prerequisites, iteration, token)
                            .await,
                    )
                }
            });

            for (task, outcome) in join_all(futures).await {
                match outcome {
                    Ok(exec) => {
                        session.ledger_mut().record_llm_calls(exec.llm_calls());
                        level_results.insert(task.id, exec.result.clone());
                        executions.push(exec);
                    }
                    Err(Error::Cancelled) => {
                        controller.force_termination(TerminationReason::Cancelled);
                        return executions;
                    }
                    Err(err) => {
                        // Pipeline contains stage failures itself; anything
                        // escaping here is unexpected but still contained.
                        tracing::warn!(task_id = %task.id, error = %err, "task execution error");
                        self.emitter
                            .emit(TrajectoryEvent::error(iteration, err.to_string()));
                    }
                }
            }
        }

        executions
    }

    async fn run_boundary_checks(
        &self,
        engine: &BoundaryEngine,
        graph: &TaskGraph,
        executions: &[TaskExecution],
        limits: &EffectiveLimits,
        session: &mut ProcessingSession,
        controller: &mut RefinementController,
        iteration: u32,
    ) -> Vec<PugachevCobraResult> {
        let mut checks = Vec::with_capacity(executions.len());

        for exec in executions {
            if limits.exceeded(session).is_some() {
                controller.force_termination(TerminationReason::ResourceExhausted);
                break;
            }
            if session.is_cancelled() {
                controller.force_termination(TerminationReason::Cancelled);
                break;
            }
            let Some(task) = graph.get(exec.result.task_id) else {
                continue;
            };

            if engine.would_consult_provider(&exec.result) {
                session.ledger_mut().record_llm_calls(1);
            }
            let check = engine.check_task(task, exec).await;
            self.emitter.emit(TrajectoryEvent::boundary_check(
                iteration,
                task.id.to_string(),
                check.final_validation.to_string(),
                check.boundaries.contrast_ratio,
            ));
            checks.push(check);
        }

        checks
    }

    /// The binding budgets for one call: the strategy's ceilings tightened
    /// by the bias-derived termination criteria.
    fn effective_limits(&self, bias: &SystematicBias) -> EffectiveLimits {
        let conditions = &self.strategy.termination_conditions;
        let allocation = &self.strategy.resource_allocation;

        let max_time_ms = allocation
            .max_processing_time_ms
            .min(conditions.max_processing_time_ms)
            .min(bias.termination_criteria.max_processing_time_ms);
        let max_iterations = conditions
            .max_refinement_iterations
            .min(bias.termination_criteria.max_iterations);
        let call_budget = ((allocation.max_llm_calls as f64
            * conditions.resource_exhaustion_threshold)
            .ceil() as u32)
            .max(1);

        EffectiveLimits {
            max_time_ms,
            max_iterations,
            call_budget,
        }
    }

    fn fatal_result(
        &self,
        mut session: ProcessingSession,
        reason: TerminationReason,
        err: Error,
    ) -> ValidationResult {
        session.fail();
        let result = ValidationResult {
            session_id: session.id(),
            success: false,
            task_results: Vec::new(),
            quality: QualityMetrics::empty(),
            boundary_checks: Vec::new(),
            strategy: self.strategy.clone(),
            termination_reason: reason,
            iterations: 0,
            history: Vec::new(),
            started_at: session.started_at(),
            processing_time_ms: session.ledger().elapsed_ms(),
            llm_calls: session.ledger().llm_calls(),
            error: Some(err.to_string()),
        };
        session.archive();
        result
    }
}

struct EffectiveLimits {
    max_time_ms: u64,
    max_iterations: u32,
    call_budget: u32,
}

impl EffectiveLimits {
    /// Name of the first exceeded resource, if any.
    fn exceeded(&self, session: &ProcessingSession) -> Option<&'static str> {
        if session.ledger().elapsed_ms() >= self.max_time_ms {
            return Some("processing time");
        }
        if session.ledger().llm_calls() >= self.call_budget {
            return Some("llm calls");
        }
        None
    }
}
