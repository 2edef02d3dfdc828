//! Task data model.
//!
//! A [`Task`] is the unit of work and the unit of memory in agentmesh: the
//! same record that is enqueued onto the event bus for execution is later
//! stored in the memory tiers once it reaches a terminal status. Tasks carry
//! an open parameter map (typically with a `content` key), an open result
//! map, and metadata used by memory promotion (`importance`), delegation
//! (`depth`) and distributed tracing (`trace_id` / `span_id`).
//!
//! # Status lifecycle
//!
//! ```text
//! Pending ──▶ Running ──▶ Completed
//!                    ├──▶ Failed
//!                    └──▶ Cancelled
//! ```
//!
//! Transitions are monotonic: once a task reaches a terminal status
//! ([`TaskStatus::is_terminal`]) no further transition is applied —
//! [`Task::transition`] on a terminal task is a no-op that returns `false`.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::task::{Task, TaskAction, TaskStatus};
//!
//! let mut task = Task::new(TaskAction::Execute, "index the repository")
//!     .with_target("worker")
//!     .with_importance(0.8);
//!
//! assert_eq!(task.status, TaskStatus::Pending);
//! assert!(task.transition(TaskStatus::Running));
//! assert!(task.transition(TaskStatus::Completed));
//! // Terminal — further transitions are rejected.
//! assert!(!task.transition(TaskStatus::Failed));
//! assert_eq!(task.status, TaskStatus::Completed);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Fixed action vocabulary carried by task envelopes on the bus.
///
/// Serialises in `snake_case` so wire payloads read `"execute"`,
/// `"delegate"`, etc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Run the task content through the agent loop.
    Execute,
    /// A sub-task produced by delegation.
    Delegate,
    /// A step of a locally executed plan.
    PlanStep,
    /// Ask an agent a question without side effects.
    Query,
    /// A self-evaluation pass over a completed task.
    Evaluate,
    /// Summarize or compress prior work.
    Summarize,
}

impl TaskAction {
    /// Wire name of the action (`"execute"`, `"delegate"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Execute => "execute",
            TaskAction::Delegate => "delegate",
            TaskAction::PlanStep => "plan_step",
            TaskAction::Query => "query",
            TaskAction::Evaluate => "evaluate",
            TaskAction::Summarize => "summarize",
        }
    }
}

/// Execution status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, not yet picked up.
    Pending,
    /// Owned by an agent loop.
    Running,
    /// Finished successfully; `result.content` is populated.
    Completed,
    /// Finished unsuccessfully; `result.error` is populated.
    Failed,
    /// Stopped by a cooperative cancellation signal.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Monotonic ordering rank used to validate transitions.
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 2,
        }
    }
}

/// Metadata attached to every task.
///
/// `importance` drives tier promotion (L1 eviction promotes tasks whose
/// importance clears the configured threshold); `depth` tracks the task's
/// position in the delegation tree; `trace_id`/`span_id` form a hierarchy
/// compatible with distributed tracing — a child task shares its parent's
/// `trace_id` and gets a fresh `span_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Relative importance in `[0, 1]`; defaults to `0.5`.
    pub importance: f64,
    /// Wall-clock time the metadata was stamped.
    pub timestamp: DateTime<Utc>,
    /// Delegation depth; the root task is depth 0.
    pub depth: usize,
    /// Trace identifier shared across a delegation tree.
    pub trace_id: String,
    /// Span identifier unique to this task.
    pub span_id: String,
    /// Open extension map for application metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, JsonValue>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            importance: 0.5,
            timestamp: Utc::now(),
            depth: 0,
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            extra: HashMap::new(),
        }
    }
}

/// Terminal outcome of a task.
///
/// `content` carries the final answer text for completed tasks. `error`
/// is set for failed tasks and holds a structured
/// `{ kind, message, retry_count }` object. `quality_metrics`, when
/// self-evaluation is enabled, holds `{confidence, coverage, novelty}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// Final output text.
    #[serde(default)]
    pub content: String,
    /// Structured error for failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    /// Optional self-evaluation scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
    /// Open extension map (tool traces, usage accounting, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, JsonValue>,
}

/// Structured error recorded on a failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Stable error kind (e.g. `"budget_exceeded"`, `"depth_limit"`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// How many retries were attempted before giving up.
    pub retry_count: usize,
}

/// Scores produced by the optional post-completion self-evaluation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Model's confidence in the answer, `[0, 1]`.
    pub confidence: f64,
    /// How completely the answer covers the request, `[0, 1]`.
    pub coverage: f64,
    /// How much new information the answer contains, `[0, 1]`.
    pub novelty: f64,
}

/// The unit of work and the unit of memory.
///
/// Created by a submitter, owned by the executing agent until it reaches a
/// terminal status, then owned by the memory tiers. See the module docs for
/// the status lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUID v4 string).
    pub task_id: String,
    /// Parent task in a delegation tree, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Owning session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Node that created the task.
    #[serde(default)]
    pub source_agent: String,
    /// Node the task is addressed to.
    #[serde(default)]
    pub target_agent: String,
    /// What to do.
    pub action: TaskAction,
    /// Open parameter map; `content` holds the request text by convention.
    #[serde(default)]
    pub parameters: HashMap<String, JsonValue>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Terminal outcome; empty until the task completes.
    #[serde(default)]
    pub result: TaskResult,
    /// Promotion / tracing metadata.
    pub metadata: TaskMetadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with the given action and `content` parameter.
    pub fn new(action: TaskAction, content: impl Into<String>) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("content".to_string(), JsonValue::String(content.into()));
        Self {
            task_id: Uuid::new_v4().to_string(),
            parent_task_id: None,
            session_id: None,
            source_agent: String::new(),
            target_agent: String::new(),
            action,
            parameters,
            status: TaskStatus::Pending,
            result: TaskResult::default(),
            metadata: TaskMetadata::default(),
            created_at: Utc::now(),
        }
    }

    /// Set the target agent (builder pattern).
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_agent = target.into();
        self
    }

    /// Set the source agent (builder pattern).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_agent = source.into();
        self
    }

    /// Bind the task to a session (builder pattern).
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the importance used for tier promotion, clamped to `[0, 1]`.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.metadata.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Add an arbitrary parameter (builder pattern).
    pub fn with_parameter(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// The `content` parameter, or an empty string when absent.
    pub fn content(&self) -> &str {
        self.parameters
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Derive a child task for delegation.
    ///
    /// The child shares the parent's session and `trace_id`, records the
    /// parent's `task_id` as `parent_task_id`, and sits one level deeper in
    /// the delegation tree with a fresh `span_id`.
    pub fn child(&self, action: TaskAction, content: impl Into<String>) -> Task {
        let mut child = Task::new(action, content);
        child.parent_task_id = Some(self.task_id.clone());
        child.session_id = self.session_id.clone();
        child.source_agent = self.target_agent.clone();
        child.metadata.trace_id = self.metadata.trace_id.clone();
        child.metadata.depth = self.metadata.depth + 1;
        child.metadata.importance = self.metadata.importance;
        child
    }

    /// Apply a status transition, enforcing monotonicity.
    ///
    /// Returns `true` if the transition was applied. A transition that would
    /// leave a terminal state, or go backwards (e.g. `Running → Pending`),
    /// is ignored and returns `false`. Transitioning a task to the status it
    /// already has is also a no-op returning `false`.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    /// Mark the task completed with the given result content.
    pub fn complete(&mut self, content: impl Into<String>) -> bool {
        let applied = self.transition(TaskStatus::Completed);
        if applied {
            self.result.content = content.into();
        }
        applied
    }

    /// Mark the task failed with a structured error.
    pub fn fail(&mut self, kind: impl Into<String>, message: impl Into<String>, retries: usize) -> bool {
        let applied = self.transition(TaskStatus::Failed);
        if applied {
            self.result.error = Some(TaskFailure {
                kind: kind.into(),
                message: message.into(),
                retry_count: retries,
            });
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_monotonicity() {
        let mut task = Task::new(TaskAction::Execute, "x");
        assert!(task.transition(TaskStatus::Running));
        assert!(!task.transition(TaskStatus::Pending));
        assert!(task.transition(TaskStatus::Cancelled));
        assert!(!task.transition(TaskStatus::Completed));
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let mut task = Task::new(TaskAction::Execute, "x");
        task.transition(TaskStatus::Running);
        assert!(task.complete("done"));
        // Cancelling an already-terminal task is a no-op.
        assert!(!task.transition(TaskStatus::Cancelled));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.content, "done");
    }

    #[test]
    fn test_child_inherits_trace_and_depth() {
        let parent = Task::new(TaskAction::Execute, "root")
            .with_session("s1")
            .with_target("parent-node");
        let child = parent.child(TaskAction::Delegate, "sub");

        assert_eq!(child.parent_task_id.as_deref(), Some(parent.task_id.as_str()));
        assert_eq!(child.session_id.as_deref(), Some("s1"));
        assert_eq!(child.metadata.trace_id, parent.metadata.trace_id);
        assert_ne!(child.metadata.span_id, parent.metadata.span_id);
        assert_eq!(child.metadata.depth, 1);
        assert_eq!(child.source_agent, "parent-node");
    }

    #[test]
    fn test_importance_clamped() {
        let task = Task::new(TaskAction::Execute, "x").with_importance(1.7);
        assert!((task.metadata.importance - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut task = Task::new(TaskAction::Execute, "hello").with_importance(0.9);
        task.transition(TaskStatus::Running);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, task.task_id);
        assert_eq!(back.status, TaskStatus::Running);
        assert_eq!(back.content(), "hello");
    }
}
