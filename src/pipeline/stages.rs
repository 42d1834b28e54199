//! The per-task stage runner.
//!
//! Stages run strictly in order for one task. A provider failure that
//! survives the retry budget marks the task failed and skips its remaining
//! stages; it never aborts other tasks. Cancellation is checked between
//! stages and propagates as [`Error::Cancelled`].

use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crate::context::{ProblemContext, SystematicBias};
use crate::decompose::{TaskType, ValidationTask};
use crate::error::{Error, Result};
use crate::provider::{CompletionConfig, LanguageModelProvider, RetryingProvider};
use crate::session::CancellationToken;
use crate::trajectory::{NullEmitter, TrajectoryEmitter, TrajectoryEvent};

use super::ensemble::{jaccard_similarity, EnsembleStrategy};
use super::types::{
    ConflictResolution, ConsensusValidation, CriterionCheck, DomainKnowledgeOutput, Evidence,
    ResourceUsage, SolutionCandidate, StageConfiguration, StageKind, StageOutput, StageResult,
    StructuredQuery, TaskResult, ValidationIssue, VerificationCriterion, VerificationOutcome,
};

static NEGATIVE_VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(contradict\w*|incorrect|inaccurate|false|unsupported|wrong|misleading)\b")
        .unwrap()
});
static OVERCLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(definitely|certainly|undoubtedly|proves|guaranteed)\b").unwrap()
});
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-zA-Z]+\b|\b\d+(?:\.\d+)?\b").unwrap());
static CONSTRAINT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(must|should|only|never|always|at (?:least|most))\b").unwrap()
});

/// Everything stages 1-6 produced for one task.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub result: TaskResult,
    pub stages: Vec<StageResult>,
}

impl TaskExecution {
    pub fn llm_calls(&self) -> u32 {
        self.stages.iter().map(|s| s.resources_used.llm_calls).sum()
    }
}

/// Runs stages 1-6 for individual tasks.
pub struct StagePipeline {
    provider: Arc<RetryingProvider>,
    config: StageConfiguration,
    ensemble: Box<dyn EnsembleStrategy>,
    emitter: Arc<dyn TrajectoryEmitter>,
}

impl StagePipeline {
    /// The provider is wrapped with the configuration's retry budget; every
    /// stage call inherits the configured timeout.
    pub fn new(
        provider: Arc<dyn LanguageModelProvider>,
        config: StageConfiguration,
        ensemble: Box<dyn EnsembleStrategy>,
    ) -> Self {
        let provider = Arc::new(RetryingProvider::new(provider, config.retry_count));
        Self {
            provider,
            config,
            ensemble,
            emitter: Arc::new(NullEmitter),
        }
    }

    /// Emits a stage start/complete event pair for every stage run.
    pub fn with_emitter(mut self, emitter: Arc<dyn TrajectoryEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn retrying_provider(&self) -> Arc<RetryingProvider> {
        Arc::clone(&self.provider)
    }

    /// Run stages 1-6 for one task. Prerequisite results are the completed
    /// results of every task this one depends on; the orchestrator's level
    /// scheduling guarantees they are all present.
    pub async fn run_task(
        &self,
        task: &ValidationTask,
        context: &ProblemContext,
        bias: &SystematicBias,
        prerequisites: &[TaskResult],
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<TaskExecution> {
        let started = Instant::now();
        let mut stages = Vec::new();

        // Stage 1: query processing (no provider work)
        self.emit_start(iteration, task, StageKind::QueryProcessing);
        let stage_start = Instant::now();
        let query = self.process_query(task, prerequisites);
        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::new(
                StageKind::QueryProcessing,
                StageOutput::Query(query.clone()),
                0.8,
                query.confidence,
                ResourceUsage::new(0, elapsed_ms(stage_start)),
            ),
        );
        check_cancelled(cancel)?;

        // Stage 2: domain knowledge
        self.emit_start(iteration, task, StageKind::DomainKnowledge);
        let stage_start = Instant::now();
        let knowledge = match self.gather_knowledge(task, context).await {
            Ok(k) => k,
            Err(err) => {
                return self.contain_failure(
                    task,
                    stages,
                    StageKind::DomainKnowledge,
                    ResourceUsage::new(1, elapsed_ms(stage_start)),
                    started,
                    iteration,
                    cancel,
                    err,
                )
            }
        };
        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::new(
                StageKind::DomainKnowledge,
                StageOutput::Knowledge(knowledge.clone()),
                knowledge.confidence,
                knowledge.confidence,
                ResourceUsage::new(1, elapsed_ms(stage_start)),
            ),
        );
        check_cancelled(cancel)?;

        // Stage 3: solution generation
        self.emit_start(iteration, task, StageKind::SolutionGeneration);
        let stage_start = Instant::now();
        let candidates = match self.generate_candidates(task, bias).await {
            Ok(c) if c.is_empty() => {
                return self.contain_failure(
                    task,
                    stages,
                    StageKind::SolutionGeneration,
                    ResourceUsage::new(1, elapsed_ms(stage_start)),
                    started,
                    iteration,
                    cancel,
                    Error::Verification("no solution candidates generated".to_string()),
                )
            }
            Ok(c) => c,
            Err(err) => {
                return self.contain_failure(
                    task,
                    stages,
                    StageKind::SolutionGeneration,
                    ResourceUsage::new(1, elapsed_ms(stage_start)),
                    started,
                    iteration,
                    cancel,
                    err,
                )
            }
        };
        let candidate_quality = mean(candidates.iter().map(|c| c.quality_score));
        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::new(
                StageKind::SolutionGeneration,
                StageOutput::Candidates(candidates.clone()),
                candidate_quality,
                mean(candidates.iter().map(|c| c.confidence)),
                ResourceUsage::new(1, elapsed_ms(stage_start)),
            ),
        );
        check_cancelled(cancel)?;

        // Stage 4: ensemble diversification (no provider work)
        self.emit_start(iteration, task, StageKind::EnsembleDiversification);
        let stage_start = Instant::now();
        let ensemble = self.ensemble.select(&candidates, &self.config);
        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::new(
                StageKind::EnsembleDiversification,
                StageOutput::Ensemble(ensemble.clone()),
                mean(ensemble.iter().map(|c| c.quality_score)),
                mean(ensemble.iter().map(|c| c.confidence)),
                ResourceUsage::new(0, elapsed_ms(stage_start)),
            ),
        );
        check_cancelled(cancel)?;

        // Stage 5: threshold verification (no provider work)
        self.emit_start(iteration, task, StageKind::ThresholdVerification);
        let stage_start = Instant::now();
        let outcomes: Vec<VerificationOutcome> = ensemble
            .iter()
            .map(|c| self.verify_candidate(c, &query, &knowledge, context, bias))
            .collect();
        let passed_fraction = if outcomes.is_empty() {
            0.0
        } else {
            outcomes.iter().filter(|o| o.passed()).count() as f64 / outcomes.len() as f64
        };
        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::new(
                StageKind::ThresholdVerification,
                StageOutput::Verification(outcomes.clone()),
                passed_fraction,
                mean(outcomes.iter().flat_map(|o| o.checks.iter().map(|c| c.confidence))),
                ResourceUsage::new(0, elapsed_ms(stage_start)),
            ),
        );
        check_cancelled(cancel)?;

        // Stage 6: counter-validation
        self.emit_start(iteration, task, StageKind::CounterValidation);
        let stage_start = Instant::now();
        let primary = best_candidate(&outcomes, &ensemble);
        let consensus = match self.counter_validate(task, primary).await {
            Ok(c) => c,
            Err(err) => {
                return self.contain_failure(
                    task,
                    stages,
                    StageKind::CounterValidation,
                    ResourceUsage::new(1, elapsed_ms(stage_start)),
                    started,
                    iteration,
                    cancel,
                    err,
                )
            }
        };
        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::new(
                StageKind::CounterValidation,
                StageOutput::Consensus(consensus.clone()),
                consensus.agreement,
                consensus.independent_confidence,
                ResourceUsage::new(1, elapsed_ms(stage_start)),
            ),
        );

        let result = self.aggregate(task, &knowledge, &outcomes, &consensus, started);
        tracing::debug!(
            task_id = %task.id,
            success = result.success,
            adequacy = result.adequacy_contribution,
            "task pipeline complete"
        );

        Ok(TaskExecution { result, stages })
    }

    fn process_query(&self, task: &ValidationTask, prerequisites: &[TaskResult]) -> StructuredQuery {
        let intent = match task.task_type {
            TaskType::Claim => "assert a factual claim",
            TaskType::Instruction => "prescribe a procedure step",
            TaskType::CodeBlock => "demonstrate working code",
            TaskType::WholeDocument => "assess the document as a whole",
        };

        let mut query = StructuredQuery::new(intent, 0.9);
        query.entities = ENTITY
            .find_iter(&task.content)
            .map(|m| m.as_str().to_string())
            .take(16)
            .collect();
        query.constraints = task
            .content
            .split(['.', ';', '\n'])
            .filter(|s| CONSTRAINT_MARKER.is_match(s))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(8)
            .collect();

        if !prerequisites.is_empty() {
            query.constraints.push(format!(
                "consistent with {} prior validated unit(s)",
                prerequisites.len()
            ));
        }

        query
    }

    async fn gather_knowledge(
        &self,
        task: &ValidationTask,
        context: &ProblemContext,
    ) -> Result<DomainKnowledgeOutput> {
        let prompt = format!(
            "List evidence for assessing the following {} unit in the {} domain. \
             Prefix each supporting line with SUPPORTS: and each contradicting line \
             with CONTRADICTS:.\n\n{}",
            task.task_type, context.domain, task.content
        );
        let config = self.completion_config().with_temperature(0.1);
        let completion = self.provider.complete(&prompt, &config).await?;

        let mut evidence = Vec::new();
        for line in completion.text.lines() {
            let line = line.trim();
            if let Some(statement) = strip_prefix_ci(line, "SUPPORTS:") {
                evidence.push(Evidence::new(statement, true, completion.confidence));
            } else if let Some(statement) = strip_prefix_ci(line, "CONTRADICTS:") {
                evidence.push(Evidence::new(statement, false, completion.confidence));
            }
        }
        // Unprefixed replies count as one supporting observation.
        if evidence.is_empty() && !completion.text.trim().is_empty() {
            evidence.push(Evidence::new(
                completion.text.trim(),
                true,
                completion.confidence,
            ));
        }

        let consensus = evidence
            .iter()
            .filter(|e| e.supports)
            .map(|e| e.statement.clone())
            .collect();
        let conflicts = resolve_conflicts(&evidence);

        Ok(DomainKnowledgeOutput {
            evidence,
            consensus,
            conflicts,
            confidence: completion.confidence,
        })
    }

    async fn generate_candidates(
        &self,
        task: &ValidationTask,
        bias: &SystematicBias,
    ) -> Result<Vec<SolutionCandidate>> {
        let prompt = format!(
            "Give up to {} independent one-line assessments of whether the following \
             unit is sound. One assessment per line.\n\n{}",
            self.config.max_candidates * 2,
            task.content
        );
        let temperature = 0.3 + bias.creativity_allowance * 0.4;
        let config = self.completion_config().with_temperature(temperature);
        let completion = self.provider.complete(&prompt, &config).await?;

        let mut candidates: Vec<SolutionCandidate> = completion
            .text
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).trim())
            .filter(|l| !l.is_empty())
            .take(self.config.max_candidates * 2)
            .enumerate()
            .map(|(i, line)| {
                SolutionCandidate::new(
                    line,
                    completion.confidence * (1.0 - 0.05 * i as f64),
                    completion.confidence,
                )
            })
            .collect();

        if candidates.is_empty() && !completion.text.trim().is_empty() {
            candidates.push(SolutionCandidate::new(
                completion.text.trim(),
                completion.confidence,
                completion.confidence,
            ));
        }

        Ok(candidates)
    }

    fn verify_candidate(
        &self,
        candidate: &SolutionCandidate,
        query: &StructuredQuery,
        knowledge: &DomainKnowledgeOutput,
        context: &ProblemContext,
        bias: &SystematicBias,
    ) -> VerificationOutcome {
        let check_confidence = 0.5 * (candidate.confidence + knowledge.confidence);
        let mut checks = Vec::with_capacity(VerificationCriterion::ALL.len());

        // Near-tie conflicts mean the evidence itself is inconsistent.
        let unresolved = knowledge.conflicts.iter().any(|c| c.confidence < 0.25);
        checks.push(CriterionCheck {
            criterion: VerificationCriterion::LogicalConsistency,
            passed: !unresolved,
            confidence: check_confidence,
            note: unresolved.then(|| "evidence conflict unresolved".to_string()),
        });

        // The candidate's verdict direction must match the evidence.
        let supported = knowledge.support_ratio() >= 0.5;
        let negative = NEGATIVE_VERDICT.is_match(&candidate.text);
        checks.push(CriterionCheck {
            criterion: VerificationCriterion::FactualAccuracy,
            passed: supported != negative,
            confidence: check_confidence,
            note: (supported == negative).then(|| "verdict contradicts evidence".to_string()),
        });

        // Cautious contexts reject overclaiming language.
        let overclaims = bias.conservativeness > 0.7
            && !context.characteristics.allows_creativity
            && OVERCLAIM.is_match(&candidate.text);
        checks.push(CriterionCheck {
            criterion: VerificationCriterion::ContextCompliance,
            passed: !overclaims,
            confidence: check_confidence,
            note: overclaims.then(|| "overclaims under cautious bias".to_string()),
        });

        let constraints_met = query.constraints.is_empty()
            || jaccard_similarity(&candidate.text, &query.constraints.join(" ")) > 0.0;
        checks.push(CriterionCheck {
            criterion: VerificationCriterion::ConstraintSatisfaction,
            passed: constraints_met,
            confidence: check_confidence,
            note: None,
        });

        let quality_floor = 0.3 + 0.2 * bias.conservativeness;
        checks.push(CriterionCheck {
            criterion: VerificationCriterion::QualityStandards,
            passed: candidate.quality_score >= quality_floor,
            confidence: check_confidence,
            note: None,
        });

        VerificationOutcome {
            candidate: candidate.clone(),
            checks,
        }
    }

    async fn counter_validate(
        &self,
        task: &ValidationTask,
        primary: Option<&SolutionCandidate>,
    ) -> Result<ConsensusValidation> {
        let prompt = format!(
            "Independently assess whether the following unit is sound, in one line:\n\n{}",
            task.content
        );
        let config = self.completion_config().with_temperature(0.7);
        let completion = self.provider.complete(&prompt, &config).await?;

        let (primary_negative, primary_confidence) = match primary {
            Some(c) => (NEGATIVE_VERDICT.is_match(&c.text), c.confidence),
            None => (true, 0.0),
        };
        let independent_negative = NEGATIVE_VERDICT.is_match(&completion.text);

        let direction = if primary_negative == independent_negative {
            1.0
        } else {
            0.0
        };
        let agreement =
            0.6 * direction + 0.4 * (1.0 - (primary_confidence - completion.confidence).abs());

        Ok(ConsensusValidation::new(
            agreement,
            completion.confidence,
            self.config.disagreement_threshold,
        ))
    }

    fn aggregate(
        &self,
        task: &ValidationTask,
        knowledge: &DomainKnowledgeOutput,
        outcomes: &[VerificationOutcome],
        consensus: &ConsensusValidation,
        started: Instant,
    ) -> TaskResult {
        let passed: Vec<&VerificationOutcome> =
            outcomes.iter().filter(|o| o.passed()).collect();
        let success = !passed.is_empty();

        let mut issues = Vec::new();
        for conflict in &knowledge.conflicts {
            if conflict.confidence < 0.25 {
                issues.push(ValidationIssue::error(
                    format!("unresolved evidence conflict on {}", conflict.topic),
                    "consistency",
                ));
            } else {
                issues.push(ValidationIssue::warning(
                    format!(
                        "evidence conflict on {} resolved toward: {}",
                        conflict.topic, conflict.chosen
                    ),
                    "consistency",
                ));
            }
        }
        for outcome in outcomes.iter().filter(|o| !o.passed()) {
            let failed: Vec<String> = outcome
                .failed_criteria()
                .iter()
                .map(|c| c.to_string())
                .collect();
            issues.push(ValidationIssue::warning(
                format!("candidate failed verification: {}", failed.join(", ")),
                "verification",
            ));
        }
        if !success {
            issues.push(ValidationIssue::error(
                "no candidate passed threshold verification",
                "verification",
            ));
        }
        if consensus.escalated {
            issues.push(ValidationIssue::error(
                format!(
                    "counter-validation disagreement (agreement {:.2})",
                    consensus.agreement
                ),
                "consensus",
            ));
        }

        let adequacy = if success {
            let best = passed
                .iter()
                .map(|o| o.candidate.quality_score)
                .fold(0.0, f64::max);
            0.5 * best + 0.25 * knowledge.confidence + 0.25 * consensus.agreement
        } else {
            0.15
        };
        let confidence = if success {
            let best_conf = passed
                .iter()
                .map(|o| o.candidate.confidence)
                .fold(0.0, f64::max);
            0.6 * best_conf + 0.4 * consensus.independent_confidence
        } else {
            0.2
        };

        TaskResult::new(task.id, success, adequacy, task.importance, confidence)
            .with_issues(issues)
            .with_processing_time_ms(elapsed_ms(started))
    }

    fn emit_start(&self, iteration: u32, task: &ValidationTask, stage: StageKind) {
        self.emitter.emit(TrajectoryEvent::stage_start(
            iteration,
            task.id.to_string(),
            stage.to_string(),
        ));
    }

    fn push_stage(
        &self,
        stages: &mut Vec<StageResult>,
        iteration: u32,
        task: &ValidationTask,
        stage: StageResult,
    ) {
        self.emitter.emit(TrajectoryEvent::stage_complete(
            iteration,
            task.id.to_string(),
            stage.stage.to_string(),
            stage.success,
        ));
        stages.push(stage);
    }

    /// A stage failure is contained at the task level; the failing stage is
    /// recorded with `success = false`, remaining stages are skipped, and the
    /// failure becomes the task's result. Cancellation still propagates as
    /// an error.
    #[allow(clippy::too_many_arguments)]
    fn contain_failure(
        &self,
        task: &ValidationTask,
        mut stages: Vec<StageResult>,
        failed_stage: StageKind,
        usage: ResourceUsage,
        started: Instant,
        iteration: u32,
        cancel: &CancellationToken,
        err: Error,
    ) -> Result<TaskExecution> {
        check_cancelled(cancel)?;

        let category = if err.is_transient() {
            "provider"
        } else {
            "verification"
        };
        tracing::warn!(task_id = %task.id, error = %err, "task stage failed");

        self.push_stage(
            &mut stages,
            iteration,
            task,
            StageResult::failed(failed_stage, err.to_string(), usage),
        );

        let result = TaskResult::failed(
            task.id,
            task.importance,
            ValidationIssue::error(err.to_string(), category),
        )
        .with_processing_time_ms(elapsed_ms(started));

        Ok(TaskExecution { result, stages })
    }

    fn completion_config(&self) -> CompletionConfig {
        CompletionConfig::default().with_timeout_ms(self.config.timeout_ms)
    }
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| line[prefix.len()..].trim())
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// The strongest candidate to compare against in stage 6. A candidate that
/// passed verification always wins over one that failed; the full ensemble
/// is only the fallback when nothing passed.
fn best_candidate<'a>(
    outcomes: &'a [VerificationOutcome],
    ensemble: &'a [SolutionCandidate],
) -> Option<&'a SolutionCandidate> {
    let by_quality = |a: &&SolutionCandidate, b: &&SolutionCandidate| {
        a.quality_score
            .partial_cmp(&b.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    };

    outcomes
        .iter()
        .filter(|o| o.passed())
        .map(|o| &o.candidate)
        .max_by(by_quality)
        .or_else(|| ensemble.iter().max_by(by_quality))
}

/// Conflicts are resolved confidence-weighted; ties go to the side with more
/// evidence items.
fn resolve_conflicts(evidence: &[Evidence]) -> Vec<ConflictResolution> {
    let supporting: Vec<&Evidence> = evidence.iter().filter(|e| e.supports).collect();
    let contradicting: Vec<&Evidence> = evidence.iter().filter(|e| !e.supports).collect();
    if supporting.is_empty() || contradicting.is_empty() {
        return Vec::new();
    }

    let support_weight: f64 = supporting.iter().map(|e| e.confidence).sum();
    let contradict_weight: f64 = contradicting.iter().map(|e| e.confidence).sum();
    let total = support_weight + contradict_weight;

    let support_wins = if (support_weight - contradict_weight).abs() < f64::EPSILON {
        supporting.len() >= contradicting.len()
    } else {
        support_weight > contradict_weight
    };

    let (chosen, rejected) = if support_wins {
        (&supporting, &contradicting)
    } else {
        (&contradicting, &supporting)
    };

    let margin = if total <= f64::EPSILON {
        0.0
    } else {
        (support_weight - contradict_weight).abs() / total
    };

    vec![ConflictResolution {
        topic: "evidence direction".to_string(),
        chosen: chosen[0].statement.clone(),
        rejected: rejected[0].statement.clone(),
        confidence: margin.clamp(0.0, 1.0),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProblemContext;
    use crate::decompose::TaskDecomposer;
    use crate::pipeline::ensemble::GreedyStrategy;
    use crate::provider::MockProvider;

    fn pipeline(provider: MockProvider) -> StagePipeline {
        StagePipeline::new(
            Arc::new(provider),
            StageConfiguration::default(),
            Box::new(GreedyStrategy),
        )
    }

    fn single_task(content: &str) -> ValidationTask {
        let graph = TaskDecomposer::new()
            .decompose(content, &ProblemContext::general())
            .unwrap();
        graph.tasks()[0].clone()
    }

    async fn run(pipeline: &StagePipeline, task: &ValidationTask) -> Result<TaskExecution> {
        let context = ProblemContext::general();
        let bias = SystematicBias::from_context(&context);
        pipeline
            .run_task(task, &context, &bias, &[], 0, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_happy_path_runs_all_six_stages() {
        let pipeline = pipeline(MockProvider::new());
        let task = single_task("The Nile is a long river.");

        let execution = run(&pipeline, &task).await.unwrap();

        assert!(execution.result.success);
        assert_eq!(execution.stages.len(), 6);
        assert_eq!(execution.llm_calls(), 3);
        assert!((0.0..=1.0).contains(&execution.result.adequacy_contribution));
        assert_eq!(execution.result.critical_issue_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_timeout_contains_failure() {
        let pipeline = pipeline(MockProvider::always_timeout());
        let task = single_task("Some claim that needs evidence.");

        let execution = run(&pipeline, &task).await.unwrap();

        assert!(!execution.result.success);
        assert_eq!(execution.result.adequacy_contribution, 0.0);
        assert!(execution
            .result
            .issues
            .iter()
            .any(|i| i.category == "provider" && i.is_critical()));
        // Stage 1 succeeded, stage 2 is recorded as failed, 3-6 never ran.
        assert_eq!(execution.stages.len(), 2);
        let failed = &execution.stages[1];
        assert_eq!(failed.stage, StageKind::DomainKnowledge);
        assert!(!failed.success);
        assert!(matches!(failed.output, StageOutput::Failed { .. }));
    }

    #[tokio::test]
    async fn test_tied_evidence_conflict_fails_verification() {
        let mock = MockProvider::new()
            .push_text("SUPPORTS: the figure is standard\nCONTRADICTS: the figure is outdated", 0.8)
            .push_text("the assessment is mixed", 0.8)
            .push_text("the assessment is mixed", 0.8);
        let pipeline = pipeline(mock);
        let task = single_task("The figure is correct.");

        let execution = run(&pipeline, &task).await.unwrap();

        assert!(!execution.result.success);
        assert!(execution.result.critical_issue_count() >= 1);
        assert!(execution
            .result
            .issues
            .iter()
            .any(|i| i.category == "consistency" && i.is_critical()));
    }

    #[tokio::test]
    async fn test_counter_validation_disagreement_escalates() {
        let mock = MockProvider::new()
            .push_text("SUPPORTS: widely documented", 0.9)
            .push_text("the claim is sound and well supported", 0.9)
            .push_text("the claim is false and incorrect", 0.9);
        let pipeline = pipeline(mock);
        let task = single_task("A well known fact.");

        let execution = run(&pipeline, &task).await.unwrap();

        // The primary verdict stands, but the disagreement is surfaced
        // as a critical issue, never silently accepted.
        assert!(execution.result.success);
        assert!(execution
            .result
            .issues
            .iter()
            .any(|i| i.category == "consensus" && i.is_critical()));
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let pipeline = pipeline(MockProvider::new());
        let task = single_task("Anything at all.");
        let context = ProblemContext::general();
        let bias = SystematicBias::from_context(&context);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .run_task(&task, &context, &bias, &[], 0, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_prerequisites_surface_as_constraint() {
        let pipeline = pipeline(MockProvider::new());
        let task = single_task("Therefore the conclusion holds.");
        let context = ProblemContext::general();
        let bias = SystematicBias::from_context(&context);
        let prereq = TaskResult::new(crate::decompose::TaskId::new(), true, 0.8, 0.5, 0.8);

        let execution = pipeline
            .run_task(&task, &context, &bias, &[prereq], 0, &CancellationToken::new())
            .await
            .unwrap();

        let query = match &execution.stages[0].output {
            StageOutput::Query(q) => q,
            other => panic!("unexpected stage 1 output: {:?}", other),
        };
        assert!(query.constraints.iter().any(|c| c.contains("prior validated")));
    }

    #[test]
    fn test_best_candidate_prefers_verified() {
        let weak_pass = SolutionCandidate::new("a cautious reading", 0.4, 0.6);
        let strong_fail = SolutionCandidate::new("a bold overclaim", 0.9, 0.9);
        let outcomes = vec![
            VerificationOutcome {
                candidate: weak_pass.clone(),
                checks: vec![CriterionCheck {
                    criterion: VerificationCriterion::LogicalConsistency,
                    passed: true,
                    confidence: 0.8,
                    note: None,
                }],
            },
            VerificationOutcome {
                candidate: strong_fail.clone(),
                checks: vec![CriterionCheck {
                    criterion: VerificationCriterion::FactualAccuracy,
                    passed: false,
                    confidence: 0.8,
                    note: None,
                }],
            },
        ];
        let ensemble = vec![weak_pass.clone(), strong_fail.clone()];

        let best = best_candidate(&outcomes, &ensemble).unwrap();
        assert_eq!(best.text, weak_pass.text);

        // With nothing passing, the ensemble maximum is the fallback.
        let none_passed: Vec<VerificationOutcome> = outcomes
            .iter()
            .cloned()
            .map(|mut o| {
                for check in &mut o.checks {
                    check.passed = false;
                }
                o
            })
            .collect();
        let fallback = best_candidate(&none_passed, &ensemble).unwrap();
        assert_eq!(fallback.text, strong_fail.text);
    }

    #[test]
    fn test_conflict_tie_goes_to_larger_side() {
        let evidence = vec![
            Evidence::new("a", true, 0.4),
            Evidence::new("b", true, 0.4),
            Evidence::new("c", false, 0.8),
        ];
        let conflicts = resolve_conflicts(&evidence);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].chosen, "a");
        assert!(conflicts[0].confidence < 0.25);
    }
}
