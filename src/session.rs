//! Per-call session state.
//!
//! One [`ProcessingSession`] is created per orchestration call and owns
//! everything produced during it: the current task-result set, the
//! per-iteration history, and the resource ledger. The orchestrator is the
//! session's only writer; concurrent task futures report usage through
//! their stage results, which the orchestrator folds into the ledger after
//! each level joins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::context::ProblemContext;
use crate::pipeline::types::TaskResult;
use crate::quality::QualityMetrics;
use crate::refine::RefinementDecision;

/// Unique identifier for a processing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session. Active until the orchestrator finishes, then
/// completed or failed, then archived when the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Archived,
}

/// Cooperative cancellation flag shared between an orchestration call and
/// whoever may want to supersede it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Time and provider-call accounting for one session. Single writer.
#[derive(Debug)]
pub struct ResourceLedger {
    started: Instant,
    llm_calls: u32,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            llm_calls: 0,
        }
    }

    pub fn record_llm_calls(&mut self, calls: u32) {
        self.llm_calls = self.llm_calls.saturating_add(calls);
    }

    pub fn llm_calls(&self) -> u32 {
        self.llm_calls
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// One refinement pass as recorded in the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub metrics: QualityMetrics,
    pub decision: RefinementDecision,
    pub timestamp: DateTime<Utc>,
}

/// State owned by one orchestration call.
pub struct ProcessingSession {
    id: SessionId,
    status: SessionStatus,
    context: ProblemContext,
    started_at: DateTime<Utc>,
    ledger: ResourceLedger,
    task_results: Vec<TaskResult>,
    history: Vec<IterationRecord>,
    cancel: CancellationToken,
}

impl ProcessingSession {
    pub fn new(context: ProblemContext) -> Self {
        Self {
            id: SessionId::new(),
            status: SessionStatus::Active,
            context,
            started_at: Utc::now(),
            ledger: ResourceLedger::new(),
            task_results: Vec::new(),
            history: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an externally provided token so a newer request for the same
    /// document can cancel this session.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn context(&self) -> &ProblemContext {
        &self.context
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut ResourceLedger {
        &mut self.ledger
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.task_results
    }

    /// Replace the current result set. Results are superseded whole on each
    /// refinement pass, never mutated in place.
    pub fn supersede_results(&mut self, results: Vec<TaskResult>) {
        self.task_results = results;
    }

    pub fn record_iteration(&mut self, metrics: QualityMetrics, decision: RefinementDecision) {
        self.history.push(IterationRecord {
            iteration: decision.iteration,
            metrics,
            decision,
            timestamp: Utc::now(),
        });
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    /// Fraction of tasks that succeeded; 0.0 until results exist.
    pub fn success_rate(&self) -> f64 {
        if self.task_results.is_empty() {
            return 0.0;
        }
        let succeeded = self.task_results.iter().filter(|r| r.success).count();
        succeeded as f64 / self.task_results.len() as f64
    }

    pub fn complete(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Completed;
        }
    }

    pub fn fail(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Failed;
        }
    }

    /// Terminal transition; an active session is failed first.
    pub fn archive(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Failed;
        }
        self.status = SessionStatus::Archived;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::TaskId;
    use crate::quality::QualityMetrics;
    use crate::refine::RefinementDecision;

    fn session() -> ProcessingSession {
        ProcessingSession::new(ProblemContext::general())
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut s = session();
        assert_eq!(s.status(), SessionStatus::Active);

        s.complete();
        assert_eq!(s.status(), SessionStatus::Completed);

        // A finished session cannot flip outcome.
        s.fail();
        assert_eq!(s.status(), SessionStatus::Completed);

        s.archive();
        assert_eq!(s.status(), SessionStatus::Archived);
    }

    #[test]
    fn test_archiving_active_session_marks_failure_first() {
        let mut s = session();
        s.archive();
        assert_eq!(s.status(), SessionStatus::Archived);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let s = session();
        let token = s.cancellation_token();
        assert!(!s.is_cancelled());

        token.cancel();
        assert!(s.is_cancelled());
    }

    #[test]
    fn test_ledger_accumulates() {
        let mut s = session();
        s.ledger_mut().record_llm_calls(3);
        s.ledger_mut().record_llm_calls(2);
        assert_eq!(s.ledger().llm_calls(), 5);
    }

    #[test]
    fn test_success_rate() {
        let mut s = session();
        assert_eq!(s.success_rate(), 0.0);

        s.supersede_results(vec![
            TaskResult::new(TaskId::new(), true, 0.8, 0.5, 0.8),
            TaskResult::new(TaskId::new(), false, 0.0, 0.5, 0.1),
        ]);
        assert_eq!(s.success_rate(), 0.5);
    }

    #[test]
    fn test_history_records_iterations() {
        let mut s = session();
        let decision = RefinementDecision {
            needs_refinement: true,
            target_areas: Vec::new(),
            iteration: 0,
        };
        s.record_iteration(QualityMetrics::empty(), decision);

        assert_eq!(s.history().len(), 1);
        assert_eq!(s.history()[0].iteration, 0);
    }
}
