//! Contrast generation and boundary derivation.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::decompose::{TaskId, ValidationTask};
use crate::pipeline::ensemble::jaccard_similarity;
use crate::pipeline::stages::TaskExecution;
use crate::pipeline::types::{
    DomainKnowledgeOutput, StageOutput, TaskResult, VerificationCriterion, VerificationOutcome,
};
use crate::provider::{CompletionConfig, LanguageModelProvider, RetryingProvider};

use super::types::{
    FinalValidation, PugachevCobraResult, RidiculousSolution, ValidationBoundaries,
};

/// Generates the absurd counterpart for a task and derives boundaries from
/// the contrast.
///
/// Bounding effort is spent only on uncertain results: a successful result
/// whose confidence clears `known_confidence` gets a deterministic inversion
/// with no provider call. The engine itself never fails a session; provider
/// errors fall back to the deterministic inversion.
pub struct BoundaryEngine {
    provider: Arc<RetryingProvider>,
    /// Below this contrast the real answer is flagged potentially-ridiculous
    contrast_floor: f64,
    /// At or above this confidence the provider is not consulted
    known_confidence: f64,
    timeout_ms: u64,
}

impl BoundaryEngine {
    pub fn new(provider: Arc<dyn LanguageModelProvider>) -> Self {
        Self {
            provider: Arc::new(RetryingProvider::new(provider, 1)),
            contrast_floor: 0.35,
            known_confidence: 0.9,
            timeout_ms: 10_000,
        }
    }

    pub fn with_contrast_floor(mut self, contrast_floor: f64) -> Self {
        self.contrast_floor = contrast_floor.clamp(0.0, 1.0);
        self
    }

    pub fn with_known_confidence(mut self, known_confidence: f64) -> Self {
        self.known_confidence = known_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Whether a check for this result will spend a provider call.
    pub fn would_consult_provider(&self, result: &TaskResult) -> bool {
        !(result.success && result.confidence >= self.known_confidence)
    }

    /// Contrast one task's pipeline outcome against a deliberate absurdity.
    pub async fn check_task(
        &self,
        task: &ValidationTask,
        execution: &TaskExecution,
    ) -> PugachevCobraResult {
        let result = &execution.result;
        let knowledge = extract_knowledge(execution);
        let outcomes = extract_outcomes(execution);

        let ridiculous = if result.success && result.confidence >= self.known_confidence {
            self.deterministic_inversion(task)
        } else {
            match self.generate_absurdity(task).await {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(task_id = %task.id, error = %err, "absurdity generation failed, using inversion");
                    self.deterministic_inversion(task)
                }
            }
        };

        let real_text = best_passed_text(&outcomes).unwrap_or_else(|| task.content.clone());
        let absurd_text = ridiculous.absurd_text();
        let contrast_ratio = 1.0 - jaccard_similarity(&real_text, &absurd_text);

        let mut can_mean: BTreeSet<String> = knowledge
            .map(|k| k.consensus.iter().cloned().collect())
            .unwrap_or_default();
        if let Some(text) = best_passed_text(&outcomes) {
            can_mean.insert(text);
        }

        let mut cannot_mean: BTreeSet<String> = ridiculous.anti_patterns.iter().cloned().collect();
        cannot_mean.insert(absurd_text);
        for outcome in &outcomes {
            if outcome
                .failed_criteria()
                .contains(&VerificationCriterion::FactualAccuracy)
            {
                cannot_mean.insert(outcome.candidate.text.clone());
            }
        }

        let boundary_confidence = 0.6 * result.confidence + 0.4 * ridiculous.confidence_level;
        let boundaries =
            ValidationBoundaries::new(can_mean, cannot_mean, boundary_confidence, contrast_ratio);

        let final_validation = if !result.success {
            FinalValidation::Questionable
        } else if contrast_ratio < self.contrast_floor {
            FinalValidation::PotentiallyRidiculous
        } else if contrast_ratio < self.contrast_floor + 0.15 {
            FinalValidation::Questionable
        } else {
            FinalValidation::NotRidiculous
        };

        tracing::debug!(
            task_id = %task.id,
            contrast = boundaries.contrast_ratio,
            verdict = %final_validation,
            "boundary check complete"
        );

        PugachevCobraResult {
            task_id: task.id,
            real_results: vec![result.clone()],
            ridiculous,
            boundaries,
            final_validation,
        }
    }

    async fn generate_absurdity(
        &self,
        task: &ValidationTask,
    ) -> crate::error::Result<RidiculousSolution> {
        let prompt = format!(
            "Invent a deliberately absurd alternative interpretation of the following \
             unit, built on inverted or extreme assumptions. First line: the absurd \
             interpretation. Then list the reasoning failures it exemplifies, one per \
             line, prefixed ANTI:.\n\n{}",
            task.content
        );
        let config = CompletionConfig::default()
            .with_temperature(0.9)
            .with_timeout_ms(self.timeout_ms);
        let completion = self.provider.complete(&prompt, &config).await?;

        let mut absurd_lines = Vec::new();
        let mut anti_patterns = Vec::new();
        for line in completion.text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if let Some(rest) = lower.strip_prefix("anti:") {
                if !rest.trim().is_empty() {
                    anti_patterns.push(line[line.len() - rest.len()..].trim().to_string());
                }
            } else {
                absurd_lines.push(line.to_string());
            }
        }

        if absurd_lines.is_empty() {
            return Ok(self.deterministic_inversion(task));
        }

        Ok(self.build_solution(
            task,
            absurd_lines.join(" "),
            completion.confidence,
            anti_patterns,
        ))
    }

    /// Provider-free absurdity: the unit read as meaning its own opposite.
    fn deterministic_inversion(&self, task: &ValidationTask) -> RidiculousSolution {
        let absurd = format!(
            "the opposite holds and none of it is true: {}",
            task.content
        );
        self.build_solution(
            task,
            absurd,
            0.95,
            vec![
                "inverted premise".to_string(),
                "conclusion detached from evidence".to_string(),
            ],
        )
    }

    fn build_solution(
        &self,
        task: &ValidationTask,
        absurd_text: String,
        confidence_level: f64,
        anti_patterns: Vec<String>,
    ) -> RidiculousSolution {
        let absurd_task = ValidationTask {
            id: TaskId::new(),
            task_type: task.task_type,
            content: absurd_text,
            importance: task.importance,
            estimated_complexity: task.estimated_complexity,
            required_capabilities: task.required_capabilities.clone(),
            depends_on: Default::default(),
        };
        let absurd_result = TaskResult::new(
            absurd_task.id,
            false,
            0.05,
            task.importance,
            confidence_level * 0.3,
        );

        RidiculousSolution {
            original_problem: task.content.clone(),
            ridiculous_breakdown: vec![absurd_task],
            absurd_solutions: vec![absurd_result],
            confidence_level: confidence_level.clamp(0.0, 1.0),
            anti_patterns,
        }
    }
}

fn extract_knowledge(execution: &TaskExecution) -> Option<&DomainKnowledgeOutput> {
    execution.stages.iter().find_map(|s| match &s.output {
        StageOutput::Knowledge(k) => Some(k),
        _ => None,
    })
}

fn extract_outcomes(execution: &TaskExecution) -> Vec<VerificationOutcome> {
    execution
        .stages
        .iter()
        .find_map(|s| match &s.output {
            StageOutput::Verification(v) => Some(v.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn best_passed_text(outcomes: &[VerificationOutcome]) -> Option<String> {
    outcomes
        .iter()
        .filter(|o| o.passed())
        .max_by(|a, b| {
            a.candidate
                .quality_score
                .partial_cmp(&b.candidate.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|o| o.candidate.text.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{
        CriterionCheck, Evidence, ResourceUsage, SolutionCandidate, StageKind, StageResult,
    };
    use crate::provider::MockProvider;

    fn task(content: &str) -> ValidationTask {
        ValidationTask {
            id: TaskId::new(),
            task_type: crate::decompose::TaskType::Claim,
            content: content.to_string(),
            importance: 0.7,
            estimated_complexity: 0.2,
            required_capabilities: Default::default(),
            depends_on: Default::default(),
        }
    }

    fn passing_outcome(text: &str) -> VerificationOutcome {
        VerificationOutcome {
            candidate: SolutionCandidate::new(text, 0.85, 0.85),
            checks: VerificationCriterion::ALL
                .iter()
                .map(|c| CriterionCheck {
                    criterion: *c,
                    passed: true,
                    confidence: 0.85,
                    note: None,
                })
                .collect(),
        }
    }

    fn execution(task: &ValidationTask, success: bool, confidence: f64) -> TaskExecution {
        let knowledge = DomainKnowledgeOutput {
            evidence: vec![Evidence::new("documented in references", true, 0.8)],
            consensus: vec!["documented in references".to_string()],
            conflicts: vec![],
            confidence: 0.8,
        };
        let outcomes = vec![passing_outcome("the claim is accurate and well grounded")];

        TaskExecution {
            result: TaskResult::new(task.id, success, 0.8, task.importance, confidence),
            stages: vec![
                StageResult::new(
                    StageKind::DomainKnowledge,
                    StageOutput::Knowledge(knowledge),
                    0.8,
                    0.8,
                    ResourceUsage::new(1, 5),
                ),
                StageResult::new(
                    StageKind::ThresholdVerification,
                    StageOutput::Verification(outcomes),
                    1.0,
                    0.85,
                    ResourceUsage::new(0, 1),
                ),
            ],
        }
    }

    #[tokio::test]
    async fn test_distant_absurdity_is_not_ridiculous() {
        let mock = Arc::new(MockProvider::new().push_text(
            "gravity reverses on Tuesdays so the figure is a lunar tide artifact\nANTI: inverted premise",
            0.9,
        ));
        let engine = BoundaryEngine::new(mock);
        let task = task("Water boils at 100 degrees at sea level.");

        let check = engine.check_task(&task, &execution(&task, true, 0.8)).await;

        assert_eq!(check.final_validation, FinalValidation::NotRidiculous);
        assert!(check.boundaries.contrast_ratio > 0.5);
        assert!(check.boundaries.can_mean.is_disjoint(&check.boundaries.cannot_mean));
    }

    #[tokio::test]
    async fn test_absurdity_close_to_real_answer_is_flagged() {
        // The scripted absurdity reuses the real answer's words, so the
        // contrast collapses.
        let mock = Arc::new(
            MockProvider::new().push_text("the claim is accurate and well grounded", 0.9),
        );
        let engine = BoundaryEngine::new(mock);
        let task = task("Water boils at 100 degrees at sea level.");

        let check = engine.check_task(&task, &execution(&task, true, 0.8)).await;

        assert_eq!(check.final_validation, FinalValidation::PotentiallyRidiculous);
        assert!(check.boundaries.contrast_ratio < 0.35);
    }

    #[tokio::test]
    async fn test_confident_result_skips_provider() {
        let mock = Arc::new(MockProvider::new());
        let engine = BoundaryEngine::new(Arc::clone(&mock) as Arc<dyn LanguageModelProvider>);
        let task = task("Two plus two equals four.");

        let check = engine.check_task(&task, &execution(&task, true, 0.95)).await;

        assert_eq!(mock.call_count(), 0);
        assert_eq!(check.final_validation, FinalValidation::NotRidiculous);
        assert!(!check.ridiculous.anti_patterns.is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_inversion() {
        let engine = BoundaryEngine::new(Arc::new(MockProvider::always_unavailable()));
        let task = task("The report cites three sources.");

        let check = engine.check_task(&task, &execution(&task, true, 0.5)).await;

        // Inversion text embeds the original unit, so it stays available
        // as a cannot-mean entry and the check still completes.
        assert!(!check.boundaries.cannot_mean.is_empty());
        assert!(check
            .ridiculous
            .absurd_text()
            .contains("The report cites three sources."));
    }

    #[tokio::test]
    async fn test_failed_task_is_questionable() {
        let mock = Arc::new(MockProvider::new().push_text("nothing means anything here", 0.9));
        let engine = BoundaryEngine::new(mock);
        let task = task("Unverifiable claim.");

        let check = engine.check_task(&task, &execution(&task, false, 0.2)).await;

        assert_eq!(check.final_validation, FinalValidation::Questionable);
    }
}
