//! Content decomposition into a validation task graph.
//!
//! The decomposer splits content into semantic units (claims, instructions,
//! code blocks), sizes each unit, and wires dependency edges only where one
//! unit's meaning is stated to depend on another. The resulting graph must
//! be a DAG before scheduling; cycles are repaired by dropping back edges
//! and decomposition fails if a cycle survives repair.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::context::ProblemContext;
use crate::error::{Error, Result};

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[\s\S]*?```").unwrap());
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*])\s+(.+)$").unwrap());
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s+").unwrap());
static DEPENDENCY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(therefore|thus|hence|consequently|as (?:shown|stated|noted) above|this (?:implies|means|shows)|it follows)\b")
        .unwrap()
});
static NUMERIC_CLAIM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\b").unwrap());

/// Unique identifier for a validation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of semantic unit a task validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A factual assertion
    Claim,
    /// An instruction or procedural step
    Instruction,
    /// A fenced code block
    CodeBlock,
    /// The whole document as one unit (empty-content fallback)
    WholeDocument,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claim => write!(f, "claim"),
            Self::Instruction => write!(f, "instruction"),
            Self::CodeBlock => write!(f, "code_block"),
            Self::WholeDocument => write!(f, "whole_document"),
        }
    }
}

/// Capability a task needs from the assessment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FactChecking,
    LogicalReasoning,
    CodeAnalysis,
    DomainKnowledge,
}

/// One bounded validation subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationTask {
    /// Unique within a session
    pub id: TaskId,
    /// Unit kind
    pub task_type: TaskType,
    /// The unit's text
    pub content: String,
    /// Relative importance (0.0-1.0)
    pub importance: f64,
    /// Estimated complexity (0.0-1.0)
    pub estimated_complexity: f64,
    /// Capabilities the pipeline must bring to bear
    pub required_capabilities: HashSet<Capability>,
    /// Tasks whose results this task's meaning depends on
    pub depends_on: HashSet<TaskId>,
}

impl ValidationTask {
    fn new(task_type: TaskType, content: impl Into<String>) -> Self {
        let content = content.into();
        let estimated_complexity = (content.len() as f64 / 600.0).clamp(0.05, 1.0);

        Self {
            id: TaskId::new(),
            task_type,
            content,
            importance: 0.5,
            estimated_complexity,
            required_capabilities: HashSet::new(),
            depends_on: HashSet::new(),
        }
    }

    fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }
}

/// A validated DAG of tasks together with its schedulable level order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: Vec<ValidationTask>,
}

impl TaskGraph {
    /// Build a graph, repairing cycles by dropping back edges and failing
    /// if a cycle survives.
    pub fn new(mut tasks: Vec<ValidationTask>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(Error::decomposition("no tasks derived"));
        }

        let known: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let order: HashMap<TaskId, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();

        // Dangling edges are decomposition bugs; back edges (a dependency on
        // a later unit) are treated as forward mentions and dropped.
        for (idx, task) in tasks.iter_mut().enumerate() {
            task.depends_on
                .retain(|dep| known.contains(dep) && order[dep] < idx);
        }

        let graph = Self { tasks };
        graph.topological_levels()?;
        Ok(graph)
    }

    pub fn tasks(&self) -> &[ValidationTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: TaskId) -> Option<&ValidationTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Kahn's algorithm. Tasks in the same level have all dependencies in
    /// earlier levels and may run concurrently.
    pub fn topological_levels(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id, t.depends_on.len()))
            .collect();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in &self.tasks {
            for dep in &task.depends_on {
                dependents.entry(*dep).or_default().push(task.id);
            }
        }

        let mut ready: VecDeque<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.depends_on.is_empty())
            .map(|t| t.id)
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !ready.is_empty() {
            let level: Vec<TaskId> = ready.drain(..).collect();
            placed += level.len();

            for id in &level {
                if let Some(children) = dependents.get(id) {
                    for child in children {
                        let degree = in_degree
                            .get_mut(child)
                            .ok_or_else(|| Error::Internal("unknown task in graph".into()))?;
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(*child);
                        }
                    }
                }
            }

            levels.push(level);
        }

        if placed != self.tasks.len() {
            return Err(Error::decomposition("dependency cycle in task graph"));
        }

        Ok(levels)
    }
}

/// Splits content into a dependency graph of validation tasks.
pub struct TaskDecomposer {
    max_tasks: usize,
}

impl TaskDecomposer {
    pub fn new() -> Self {
        Self { max_tasks: 16 }
    }

    /// Cap the number of tasks; surplus trailing units merge into the last task.
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    /// Decompose content under a classified context.
    ///
    /// Empty content yields a single trivial whole-document task. Non-empty
    /// content that produces no units is a [`Error::Decomposition`].
    pub fn decompose(&self, content: &str, context: &ProblemContext) -> Result<TaskGraph> {
        if content.trim().is_empty() {
            let task = ValidationTask::new(TaskType::WholeDocument, content)
                .with_importance(1.0)
                .with_capability(Capability::LogicalReasoning);
            return TaskGraph::new(vec![task]);
        }

        let mut tasks = self.split_units(content, context);
        if tasks.is_empty() {
            return Err(Error::decomposition(
                "non-empty content produced no semantic units",
            ));
        }

        if tasks.len() > self.max_tasks {
            let overflow: Vec<String> = tasks
                .drain(self.max_tasks - 1..)
                .map(|t| t.content)
                .collect();
            let merged = ValidationTask::new(TaskType::Claim, overflow.join("\n"))
                .with_importance(0.5)
                .with_capability(Capability::LogicalReasoning);
            tasks.push(merged);
        }

        self.link_dependencies(&mut tasks);

        tracing::debug!(task_count = tasks.len(), "decomposed content");
        TaskGraph::new(tasks)
    }

    fn split_units(&self, content: &str, context: &ProblemContext) -> Vec<ValidationTask> {
        let mut tasks = Vec::new();

        // Code blocks come out first so sentence splitting never sees them.
        let mut remainder = String::new();
        let mut last = 0;
        for m in FENCED_CODE.find_iter(content) {
            remainder.push_str(&content[last..m.start()]);
            remainder.push('\n');
            last = m.end();

            let code = m.as_str().trim();
            if !code.is_empty() {
                tasks.push(
                    ValidationTask::new(TaskType::CodeBlock, code)
                        .with_importance(0.7)
                        .with_capability(Capability::CodeAnalysis),
                );
            }
        }
        remainder.push_str(&content[last..]);

        for paragraph in remainder.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            let list_items: Vec<&str> = LIST_ITEM
                .captures_iter(paragraph)
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect();

            if !list_items.is_empty() {
                for item in list_items {
                    tasks.push(
                        ValidationTask::new(TaskType::Instruction, item.trim())
                            .with_importance(0.6)
                            .with_capability(Capability::LogicalReasoning),
                    );
                }
                continue;
            }

            for sentence in split_sentences(paragraph) {
                let sentence = sentence.trim().trim_end_matches(['.', '!', '?']);
                if sentence.chars().filter(|c| c.is_alphanumeric()).count() < 3 {
                    continue;
                }

                let mut importance = 0.5;
                if NUMERIC_CLAIM.is_match(sentence) {
                    importance += 0.2;
                }
                if DEPENDENCY_MARKER.is_match(sentence) {
                    importance += 0.1;
                }
                if context.characteristics.requires_factual_accuracy {
                    importance += 0.1;
                }

                let mut task = ValidationTask::new(TaskType::Claim, sentence)
                    .with_importance(importance)
                    .with_capability(Capability::LogicalReasoning);
                if NUMERIC_CLAIM.is_match(sentence)
                    || context.characteristics.requires_factual_accuracy
                {
                    task = task.with_capability(Capability::FactChecking);
                }
                if context.domain != "general" {
                    task = task.with_capability(Capability::DomainKnowledge);
                }
                tasks.push(task);
            }
        }

        tasks
    }

    /// A unit whose meaning is stated to depend on earlier discourse gets an
    /// edge to the immediately preceding non-code unit.
    fn link_dependencies(&self, tasks: &mut [ValidationTask]) {
        let mut prev_text_unit: Option<TaskId> = None;

        for task in tasks.iter_mut() {
            if task.task_type != TaskType::CodeBlock {
                if DEPENDENCY_MARKER.is_match(&task.content) {
                    if let Some(prev) = prev_text_unit {
                        task.depends_on.insert(prev);
                    }
                }
                prev_text_unit = Some(task.id);
            }
        }
    }
}

impl Default for TaskDecomposer {
    fn default() -> Self {
        Self::new()
    }
}

/// A sentence boundary is end punctuation plus whitespace followed by an
/// uppercase letter. The regex engine has no look-around, so the uppercase
/// check runs on the character after the match.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for m in SENTENCE_END.find_iter(text) {
        let follows_upper = text[m.end()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_uppercase());
        if follows_upper {
            sentences.push(&text[start..m.end()]);
            start = m.end();
        }
    }
    sentences.push(&text[start..]);

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProblemContext;
    use proptest::prelude::*;

    fn decompose(content: &str) -> Result<TaskGraph> {
        TaskDecomposer::new().decompose(content, &ProblemContext::general())
    }

    #[test]
    fn test_empty_content_yields_trivial_task() {
        let graph = decompose("").unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.tasks()[0].task_type, TaskType::WholeDocument);
    }

    #[test]
    fn test_sentences_become_claims() {
        let graph = decompose("The sky is blue. Water boils at 100 degrees.").unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.tasks().iter().all(|t| t.task_type == TaskType::Claim));
    }

    #[test]
    fn test_abbreviation_before_lowercase_does_not_split() {
        let graph = decompose("The buffer holds approx. twelve entries in practice.").unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_mixed_terminators_split_into_claims() {
        let graph = decompose("Is the valve open? The gauge reads zero! Check the seal.").unwrap();
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_code_block_extraction() {
        let graph = decompose("Use this helper.\n```rust\nfn id(x: u8) -> u8 { x }\n```").unwrap();
        assert!(graph
            .tasks()
            .iter()
            .any(|t| t.task_type == TaskType::CodeBlock));
        assert!(graph
            .tasks()
            .iter()
            .filter(|t| t.task_type == TaskType::CodeBlock)
            .all(|t| t.required_capabilities.contains(&Capability::CodeAnalysis)));
    }

    #[test]
    fn test_list_items_become_instructions() {
        let graph = decompose("Steps:\n\n1. Open the valve\n2. Check the pressure").unwrap();
        let instructions: Vec<_> = graph
            .tasks()
            .iter()
            .filter(|t| t.task_type == TaskType::Instruction)
            .collect();
        assert_eq!(instructions.len(), 2);
    }

    #[test]
    fn test_conclusion_depends_on_premise() {
        let graph =
            decompose("All metals conduct electricity. Therefore copper conducts electricity.")
                .unwrap();
        assert_eq!(graph.len(), 2);

        let dependent = graph
            .tasks()
            .iter()
            .find(|t| t.content.contains("Therefore"))
            .unwrap();
        assert_eq!(dependent.depends_on.len(), 1);

        let levels = graph.topological_levels().unwrap();
        assert_eq!(levels.len(), 2);
    }

    #[test]
    fn test_importance_is_clamped() {
        let graph = decompose(
            "Therefore the dosage of 500 mg proves 90 percent of the 120 cases recovered.",
        )
        .unwrap();
        for task in graph.tasks() {
            assert!((0.0..=1.0).contains(&task.importance));
        }
    }

    #[test]
    fn test_back_edge_is_dropped_during_repair() {
        // a lists b as a dependency, but b comes later in document order.
        let mut a = ValidationTask::new(TaskType::Claim, "a");
        let b = ValidationTask::new(TaskType::Claim, "b");
        a.depends_on.insert(b.id);

        let graph = TaskGraph::new(vec![a, b]).unwrap();
        assert!(graph.tasks().iter().all(|t| t.depends_on.is_empty()));
    }

    #[test]
    fn test_max_tasks_merges_overflow() {
        let content = (0..40)
            .map(|i| format!("Statement number {} stands alone.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let graph = TaskDecomposer::new()
            .with_max_tasks(5)
            .decompose(&content, &ProblemContext::general())
            .unwrap();
        assert_eq!(graph.len(), 5);
    }

    #[test]
    fn test_levels_cover_all_tasks() {
        let graph = decompose(
            "Iron is a metal. Copper is a metal. Therefore both conduct electricity.",
        )
        .unwrap();
        let levels = graph.topological_levels().unwrap();
        let total: usize = levels.iter().map(|l| l.len()).sum();
        assert_eq!(total, graph.len());
    }

    proptest! {
        #[test]
        fn prop_repaired_graph_is_acyclic(
            task_count in 1usize..12,
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..24),
        ) {
            let mut tasks: Vec<ValidationTask> = (0..task_count)
                .map(|i| ValidationTask::new(TaskType::Claim, format!("unit {}", i)))
                .collect();
            let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

            for (from, to) in edges {
                if from < task_count && to < task_count {
                    tasks[from].depends_on.insert(ids[to]);
                }
            }

            let graph = TaskGraph::new(tasks).unwrap();
            let levels = graph.topological_levels().unwrap();

            let total: usize = levels.iter().map(|l| l.len()).sum();
            prop_assert_eq!(total, graph.len());

            // Every dependency resolves to a strictly earlier level.
            let mut level_of: HashMap<TaskId, usize> = HashMap::new();
            for (depth, level) in levels.iter().enumerate() {
                for id in level {
                    level_of.insert(*id, depth);
                }
            }
            for task in graph.tasks() {
                for dep in &task.depends_on {
                    prop_assert!(level_of[dep] < level_of[&task.id]);
                }
            }
        }
    }
}
