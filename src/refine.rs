//! The refinement decision loop (stage 8).
//!
//! A state machine over one session: initial, running, needs-refinement,
//! and the two terminal states converged and exhausted. Both terminal
//! states are ordinary outcomes reported through a [`TerminationReason`],
//! never errors. Stagnation forces termination even with thresholds unmet
//! so the loop always makes progress.

use serde::{Deserialize, Serialize};

use crate::quality::{QualityDimensionKind, QualityMetrics};

/// Why a session stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// Quality thresholds were met
    Converged,
    /// Refinement iteration budget spent
    MaxIterations,
    /// Session wall-clock budget spent
    TimeBudgetExceeded,
    /// Quality stopped improving between iterations
    QualityStagnation,
    /// LLM-call or other resource budget spent
    ResourceExhausted,
    /// Content produced no task graph
    DecompositionFailed,
    /// Cooperatively cancelled
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::MaxIterations => write!(f, "max-iterations"),
            Self::TimeBudgetExceeded => write!(f, "time-budget-exceeded"),
            Self::QualityStagnation => write!(f, "quality-stagnation"),
            Self::ResourceExhausted => write!(f, "resource-exhausted"),
            Self::DecompositionFailed => write!(f, "decomposition-failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Quality floors a session must clear to converge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub overall_score: f64,
    pub confidence: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            overall_score: 0.75,
            confidence: 0.6,
        }
    }
}

/// The controller's position in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementState {
    Initial,
    NeedsRefinement,
    Converged,
    Exhausted,
}

/// One iteration's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementDecision {
    pub needs_refinement: bool,
    /// Deficient dimensions to focus the next pass on, worst first
    pub target_areas: Vec<QualityDimensionKind>,
    /// Iteration this decision belongs to, starting at 0
    pub iteration: u32,
}

/// Decides whether a session's results warrant another pipeline pass.
pub struct RefinementController {
    thresholds: QualityThresholds,
    max_iterations: u32,
    max_processing_time_ms: u64,
    stagnation_threshold: f64,
    state: RefinementState,
    iteration: u32,
    last_score: Option<f64>,
    termination: Option<TerminationReason>,
}

impl RefinementController {
    pub fn new(
        thresholds: QualityThresholds,
        max_iterations: u32,
        max_processing_time_ms: u64,
        stagnation_threshold: f64,
    ) -> Self {
        Self {
            thresholds,
            max_iterations,
            max_processing_time_ms,
            stagnation_threshold: stagnation_threshold.clamp(0.0, 1.0),
            state: RefinementState::Initial,
            iteration: 0,
            last_score: None,
            termination: None,
        }
    }

    pub fn state(&self) -> RefinementState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Set once a terminal state is reached.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Evaluate the current metrics and decide whether to loop.
    ///
    /// Once a terminal state is reached every further call returns a
    /// no-refinement decision with the same reason.
    pub fn evaluate(
        &mut self,
        metrics: &QualityMetrics,
        target_areas: Vec<QualityDimensionKind>,
        elapsed_ms: u64,
    ) -> RefinementDecision {
        if matches!(
            self.state,
            RefinementState::Converged | RefinementState::Exhausted
        ) {
            return self.decision(false, Vec::new());
        }

        let thresholds_met = metrics.overall_score >= self.thresholds.overall_score
            && metrics.confidence >= self.thresholds.confidence
            && metrics.critical_issues == 0;

        if thresholds_met {
            return self.terminate(RefinementState::Converged, TerminationReason::Converged);
        }
        if elapsed_ms >= self.max_processing_time_ms {
            return self.terminate(
                RefinementState::Exhausted,
                TerminationReason::TimeBudgetExceeded,
            );
        }
        if self.iteration >= self.max_iterations {
            return self.terminate(RefinementState::Exhausted, TerminationReason::MaxIterations);
        }
        if let Some(last) = self.last_score {
            if metrics.overall_score - last < self.stagnation_threshold {
                return self.terminate(
                    RefinementState::Exhausted,
                    TerminationReason::QualityStagnation,
                );
            }
        }

        self.last_score = Some(metrics.overall_score);
        self.state = RefinementState::NeedsRefinement;
        let decision = self.decision(true, target_areas);
        self.iteration += 1;

        tracing::debug!(
            iteration = decision.iteration,
            score = metrics.overall_score,
            critical = metrics.critical_issues,
            "refinement triggered"
        );
        decision
    }

    /// Force a terminal state from outside the quality loop, used for
    /// resource exhaustion and cancellation.
    pub fn force_termination(&mut self, reason: TerminationReason) {
        if self.termination.is_none() {
            self.state = match reason {
                TerminationReason::Converged => RefinementState::Converged,
                _ => RefinementState::Exhausted,
            };
            self.termination = Some(reason);
        }
    }

    fn terminate(
        &mut self,
        state: RefinementState,
        reason: TerminationReason,
    ) -> RefinementDecision {
        self.state = state;
        self.termination = Some(reason);
        self.decision(false, Vec::new())
    }

    fn decision(
        &self,
        needs_refinement: bool,
        target_areas: Vec<QualityDimensionKind>,
    ) -> RefinementDecision {
        RefinementDecision {
            needs_refinement,
            target_areas,
            iteration: self.iteration,
        }
    }
}
