//! Trajectory event types for observable validation runs.
//!
//! The trajectory system provides a stream of events that can be rendered
//! differently depending on the deployment context:
//! - Editor host: diagnostics and progress UI updates
//! - Analysis: JSON export for convergence replay
//!
//! Events carry verbosity levels so a progress UI can subscribe at
//! `Normal` while an analyzer subscribes at `Debug`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Types of events emitted during a validation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrajectoryEventType {
    /// Session opened for a content request
    SessionStart,
    /// Context classified and bias derived
    ContextClassified,
    /// Content decomposed into a task graph
    Decompose,
    /// One pipeline stage started for a task
    StageStart,
    /// One pipeline stage completed for a task
    StageComplete,
    /// Boundary contrast computed for a task
    BoundaryCheck,
    /// Session-level quality metrics computed
    QualityAssessed,
    /// Refinement pass triggered
    RefinementTriggered,
    /// Final validation result produced
    Final,
    /// Error occurred
    Error,
}

impl std::fmt::Display for TrajectoryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SessionStart => "SESSION_START",
            Self::ContextClassified => "CONTEXT_CLASSIFIED",
            Self::Decompose => "DECOMPOSE",
            Self::StageStart => "STAGE_START",
            Self::StageComplete => "STAGE_COMPLETE",
            Self::BoundaryCheck => "BOUNDARY_CHECK",
            Self::QualityAssessed => "QUALITY_ASSESSED",
            Self::RefinementTriggered => "REFINEMENT_TRIGGERED",
            Self::Final => "FINAL",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Verbosity level for trajectory output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Only errors and final results
    Minimal,
    /// Normal operation events
    Normal,
    /// Include per-task stage progress
    Verbose,
    /// Full debug output
    Debug,
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::Normal
    }
}

impl TrajectoryEventType {
    /// Minimum verbosity at which this event is emitted.
    pub fn min_verbosity(&self) -> Verbosity {
        match self {
            Self::Error | Self::Final => Verbosity::Minimal,
            Self::SessionStart
            | Self::Decompose
            | Self::QualityAssessed
            | Self::RefinementTriggered => Verbosity::Normal,
            Self::ContextClassified | Self::BoundaryCheck => Verbosity::Verbose,
            Self::StageStart | Self::StageComplete => Verbosity::Debug,
        }
    }

    pub fn should_emit(&self, verbosity: Verbosity) -> bool {
        self.min_verbosity() <= verbosity
    }
}

/// One event in a session's trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    /// Type of the event
    pub event_type: TrajectoryEventType,
    /// Refinement iteration the event belongs to (0 = first pass)
    pub iteration: u32,
    /// Human-readable content describing the event
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl TrajectoryEvent {
    pub fn new(
        event_type: TrajectoryEventType,
        iteration: u32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            iteration,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    pub fn session_start(session_id: impl Into<String>, content_len: usize) -> Self {
        Self::new(TrajectoryEventType::SessionStart, 0, session_id)
            .with_metadata("content_len", content_len)
    }

    pub fn context_classified(context_type: impl Into<String>, stakes: impl Into<String>) -> Self {
        let stakes: String = stakes.into();
        Self::new(TrajectoryEventType::ContextClassified, 0, context_type)
            .with_metadata("stakes", stakes)
    }

    pub fn decompose(task_count: usize, level_count: usize) -> Self {
        Self::new(
            TrajectoryEventType::Decompose,
            0,
            format!("{} tasks in {} levels", task_count, level_count),
        )
        .with_metadata("task_count", task_count)
        .with_metadata("level_count", level_count)
    }

    pub fn stage_start(iteration: u32, task_id: impl Into<String>, stage: impl Into<String>) -> Self {
        let task_id: String = task_id.into();
        Self::new(TrajectoryEventType::StageStart, iteration, stage)
            .with_metadata("task_id", task_id)
    }

    pub fn stage_complete(
        iteration: u32,
        task_id: impl Into<String>,
        stage: impl Into<String>,
        success: bool,
    ) -> Self {
        let task_id: String = task_id.into();
        Self::new(TrajectoryEventType::StageComplete, iteration, stage)
            .with_metadata("task_id", task_id)
            .with_metadata("success", success)
    }

    pub fn boundary_check(
        iteration: u32,
        task_id: impl Into<String>,
        verdict: impl Into<String>,
        contrast_ratio: f64,
    ) -> Self {
        let task_id: String = task_id.into();
        Self::new(TrajectoryEventType::BoundaryCheck, iteration, verdict)
            .with_metadata("task_id", task_id)
            .with_metadata("contrast_ratio", contrast_ratio)
    }

    pub fn quality_assessed(iteration: u32, overall_score: f64, critical_issues: usize) -> Self {
        Self::new(
            TrajectoryEventType::QualityAssessed,
            iteration,
            format!("overall {:.2}", overall_score),
        )
        .with_metadata("overall_score", overall_score)
        .with_metadata("critical_issues", critical_issues)
    }

    pub fn refinement_triggered(iteration: u32, target_areas: impl Into<String>) -> Self {
        Self::new(
            TrajectoryEventType::RefinementTriggered,
            iteration,
            target_areas,
        )
    }

    pub fn final_result(iteration: u32, termination: impl Into<String>, success: bool) -> Self {
        Self::new(TrajectoryEventType::Final, iteration, termination)
            .with_metadata("success", success)
    }

    pub fn error(iteration: u32, error: impl Into<String>) -> Self {
        Self::new(TrajectoryEventType::Error, iteration, error)
    }

    pub fn is_error(&self) -> bool {
        self.event_type == TrajectoryEventType::Error
    }

    pub fn is_final(&self) -> bool {
        self.event_type == TrajectoryEventType::Final
    }

    /// Single-line rendering for plain-text logs.
    pub fn as_log_line(&self) -> String {
        format!(
            "[{}] i{} {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.iteration,
            self.event_type,
            self.content
        )
    }
}

/// Sink for trajectory events.
pub trait TrajectoryEmitter: Send + Sync {
    /// Emit a trajectory event.
    fn emit(&self, event: TrajectoryEvent);

    /// Get current verbosity level.
    fn verbosity(&self) -> Verbosity;

    /// Set verbosity level.
    fn set_verbosity(&mut self, verbosity: Verbosity);
}

/// Broadcast-based trajectory emitter.
pub struct BroadcastEmitter {
    sender: broadcast::Sender<TrajectoryEvent>,
    verbosity: Verbosity,
}

impl BroadcastEmitter {
    /// Create new broadcast emitter with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            verbosity: Verbosity::default(),
        }
    }

    /// Subscribe to trajectory events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrajectoryEvent> {
        self.sender.subscribe()
    }

    /// Get number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl TrajectoryEmitter for BroadcastEmitter {
    fn emit(&self, event: TrajectoryEvent) {
        if event.event_type.should_emit(self.verbosity) {
            let _ = self.sender.send(event);
        }
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }
}

/// Collecting emitter that stores events in a Vec.
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    events: Arc<RwLock<Vec<TrajectoryEvent>>>,
    verbosity: Verbosity,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbosity(verbosity: Verbosity) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            verbosity,
        }
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<TrajectoryEvent> {
        self.events.read().unwrap().clone()
    }

    /// Clear collected events.
    pub fn clear(&self) {
        self.events.write().unwrap().clear();
    }
}

impl TrajectoryEmitter for CollectingEmitter {
    fn emit(&self, event: TrajectoryEvent) {
        if event.event_type.should_emit(self.verbosity) {
            self.events.write().unwrap().push(event);
        }
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }
}

/// Null emitter that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl TrajectoryEmitter for NullEmitter {
    fn emit(&self, _event: TrajectoryEvent) {}
    fn verbosity(&self) -> Verbosity {
        Verbosity::Minimal
    }
    fn set_verbosity(&mut self, _verbosity: Verbosity) {}
}
