//! Event types for the observability and coordination substrate.
//!
//! Every observable happening in the system — streamed thinking text, tool
//! activity, node lifecycle, memory operations, skill activation, delegated
//! task envelopes — is wrapped in an immutable [`Event`] and published on
//! the [`EventBus`](crate::event_bus::EventBus). Events double as the
//! transport for delegated work: a task envelope is just an event whose
//! payload carries the serialized [`Task`](crate::task::Task).
//!
//! `(trace_id, span_id)` form a hierarchy matching parent/child task
//! relationships, compatible with distributed tracing: all events of one
//! delegation tree share a `trace_id`, and each agent's events carry its
//! task's `span_id`, so downstream consumers can reconstruct per-agent
//! order even when siblings interleave.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::event::{Event, EventType};
//!
//! let event = Event::new(EventType::NodeThinking, "researcher")
//!     .with_task("task-1")
//!     .with_payload(serde_json::json!({"delta": "considering..."}));
//!
//! assert_eq!(event.event_type, EventType::NodeThinking);
//! assert!(event.event_type.droppable());   // text deltas may be shed
//! assert!(!EventType::ToolResult.droppable());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Fixed vocabulary of event types on the bus.
///
/// Serialises in dotted wire form (`"node.thinking"`, `"tool.call"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A streamed chunk of assistant text.
    #[serde(rename = "node.thinking")]
    NodeThinking,
    /// A tool invocation was dispatched.
    #[serde(rename = "tool.call")]
    ToolCall,
    /// A tool invocation returned.
    #[serde(rename = "tool.result")]
    ToolResult,
    /// A node started working on a task.
    #[serde(rename = "node.start")]
    NodeStart,
    /// A node finished a task (payload carries terminal status and result).
    #[serde(rename = "node.complete")]
    NodeComplete,
    /// A node hit an error (including captured subscriber errors).
    #[serde(rename = "node.error")]
    NodeError,
    /// Memory retrieval began.
    #[serde(rename = "memory.retrieve.start")]
    MemoryRetrieveStart,
    /// Memory retrieval finished.
    #[serde(rename = "memory.retrieve.complete")]
    MemoryRetrieveComplete,
    /// Vectorization of a memory entry began.
    #[serde(rename = "memory.vectorize.start")]
    MemoryVectorizeStart,
    /// Vectorization of a memory entry finished.
    #[serde(rename = "memory.vectorize.complete")]
    MemoryVectorizeComplete,
    /// A short-lived context snippet was pinned.
    #[serde(rename = "ephemeral.add")]
    EphemeralAdd,
    /// Pinned context snippets were cleared.
    #[serde(rename = "ephemeral.clear")]
    EphemeralClear,
    /// A parent delegated a sub-task to a child node.
    #[serde(rename = "task.delegate")]
    TaskDelegate,
    /// A node accepted a delegated task.
    #[serde(rename = "task.accept")]
    TaskAccept,
    /// A skill was activated for a task.
    #[serde(rename = "skill.activate")]
    SkillActivate,
    /// Task envelope: a task submitted for execution (request/reply request).
    #[serde(rename = "task.submit")]
    TaskSubmit,
    /// Task envelope: terminal outcome of a submitted task (request/reply reply).
    #[serde(rename = "task.complete")]
    TaskComplete,
    /// A plan step progressed.
    #[serde(rename = "plan.step")]
    PlanStep,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NodeThinking => "node.thinking",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::NodeStart => "node.start",
            EventType::NodeComplete => "node.complete",
            EventType::NodeError => "node.error",
            EventType::MemoryRetrieveStart => "memory.retrieve.start",
            EventType::MemoryRetrieveComplete => "memory.retrieve.complete",
            EventType::MemoryVectorizeStart => "memory.vectorize.start",
            EventType::MemoryVectorizeComplete => "memory.vectorize.complete",
            EventType::EphemeralAdd => "ephemeral.add",
            EventType::EphemeralClear => "ephemeral.clear",
            EventType::TaskDelegate => "task.delegate",
            EventType::TaskAccept => "task.accept",
            EventType::SkillActivate => "skill.activate",
            EventType::TaskSubmit => "task.submit",
            EventType::TaskComplete => "task.complete",
            EventType::PlanStep => "plan.step",
        }
    }

    /// Whether the bus may shed this event type under back-pressure.
    ///
    /// Text deltas are the only shed-first class; tool results, task
    /// terminal envelopes, and errors must never be dropped.
    pub fn droppable(&self) -> bool {
        matches!(self, EventType::NodeThinking)
    }

    /// Whether this is a terminal task envelope (`task.complete` /
    /// `node.complete`), relevant to request/reply pinning.
    pub fn is_task_terminal(&self) -> bool {
        matches!(self, EventType::TaskComplete | EventType::NodeComplete)
    }
}

/// An immutable envelope for one observable happening.
///
/// Events are created by the publisher, sequenced by the bus on publish
/// (see [`Event::sequence`]), and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier (UUID v4 string).
    pub event_id: String,
    /// What happened.
    pub event_type: EventType,
    /// Node that published the event.
    pub source_node: String,
    /// Node the event is addressed to, for routed envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    /// Task the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Task action for envelope events, used by action-indexed queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Open payload.
    #[serde(default)]
    pub payload: JsonValue,
    /// Publication wall-clock time.
    pub timestamp: DateTime<Utc>,
    /// Trace identifier shared across a delegation tree.
    #[serde(default)]
    pub trace_id: String,
    /// Span identifier of the producing task.
    #[serde(default)]
    pub span_id: String,
    /// Bus-assigned monotonic sequence number (0 until published).
    #[serde(default)]
    pub sequence: u64,
}

impl Event {
    /// Create an event from `source_node` with an empty payload.
    pub fn new(event_type: EventType, source_node: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            source_node: source_node.into(),
            target_node: None,
            task_id: None,
            action: None,
            payload: JsonValue::Null,
            timestamp: Utc::now(),
            trace_id: String::new(),
            span_id: String::new(),
            sequence: 0,
        }
    }

    /// Address the event to a specific node (builder pattern).
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_node = Some(target.into());
        self
    }

    /// Associate the event with a task (builder pattern).
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Tag the event with a task action (builder pattern).
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attach a payload (builder pattern).
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Stamp tracing identifiers (builder pattern).
    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self.span_id = span_id.into();
        self
    }

    /// Extract an embedded [`Task`](crate::task::Task) from the payload's
    /// `task` field, if present and well-formed.
    pub fn embedded_task(&self) -> Option<crate::agentmesh::task::Task> {
        self.payload
            .get("task")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Predicate used to route events to subscribers.
///
/// All set fields must match; an empty selector matches every event.
#[derive(Debug, Clone, Default)]
pub struct EventSelector {
    /// Match events addressed to this node.
    pub target_node: Option<String>,
    /// Match any of these event types; `None` matches all types.
    pub event_types: Option<Vec<EventType>>,
    /// Match envelope events carrying this action.
    pub action: Option<String>,
}

impl EventSelector {
    /// A selector matching every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only events addressed to `node`.
    pub fn for_node(node: impl Into<String>) -> Self {
        Self {
            target_node: Some(node.into()),
            ..Self::default()
        }
    }

    /// Match only the given event types.
    pub fn of_types(event_types: Vec<EventType>) -> Self {
        Self {
            event_types: Some(event_types),
            ..Self::default()
        }
    }

    /// Restrict to envelope events carrying `action` (builder pattern).
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Whether `event` satisfies this selector.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(target) = &self.target_node {
            if event.target_node.as_deref() != Some(target.as_str()) {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if event.action.as_deref() != Some(action.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&EventType::MemoryRetrieveStart).unwrap();
        assert_eq!(json, "\"memory.retrieve.start\"");
        assert_eq!(EventType::ToolCall.as_str(), "tool.call");
    }

    #[test]
    fn test_droppable_classes() {
        assert!(EventType::NodeThinking.droppable());
        for critical in [
            EventType::ToolResult,
            EventType::NodeComplete,
            EventType::NodeError,
            EventType::TaskComplete,
        ] {
            assert!(!critical.droppable(), "{:?} must never drop", critical);
        }
    }

    #[test]
    fn test_selector_matching() {
        let event = Event::new(EventType::TaskSubmit, "parent")
            .with_target("worker")
            .with_action("execute");

        assert!(EventSelector::all().matches(&event));
        assert!(EventSelector::for_node("worker").matches(&event));
        assert!(!EventSelector::for_node("other").matches(&event));
        assert!(EventSelector::of_types(vec![EventType::TaskSubmit]).matches(&event));
        assert!(!EventSelector::of_types(vec![EventType::ToolCall]).matches(&event));
        assert!(EventSelector::for_node("worker")
            .with_action("execute")
            .matches(&event));
        assert!(!EventSelector::for_node("worker")
            .with_action("query")
            .matches(&event));
    }

    #[test]
    fn test_embedded_task_round_trip() {
        use crate::agentmesh::task::{Task, TaskAction};
        let task = Task::new(TaskAction::Execute, "hello");
        let event = Event::new(EventType::TaskSubmit, "a")
            .with_task(task.task_id.as_str())
            .with_payload(serde_json::json!({ "task": task }));
        let back = event.embedded_task().unwrap();
        assert_eq!(back.task_id, task.task_id);
        assert_eq!(back.content(), "hello");
    }
}
