//! The recursive agent execution loop.
//!
//! An [`Agent`] drives a task through perceive→reason→act→observe cycles:
//! each iteration assembles context through the
//! [`ContextOrchestrator`](crate::context_orchestrator::ContextOrchestrator),
//! streams an LLM call (publishing every text chunk as a `node.thinking`
//! event), dispatches the tool calls the model produced, and feeds the
//! results back into the next iteration's conversation buffer.
//!
//! # Meta-tools
//!
//! Besides the tools in the registry, the loop itself handles a small
//! vocabulary of control-flow tools:
//!
//! | Meta-tool | Effect |
//! |---|---|
//! | `done` | completes the task with the given content |
//! | `create_plan` | runs an ordered list of sub-tasks locally |
//! | `delegate_task` | spawns a child agent (see [`delegation`](crate::delegation)) |
//! | `query_l1_memory` / `query_l2_memory` | reads the memory tiers |
//! | `query_events_by_action` | inspects the event bus |
//!
//! Tool errors are returned to the LLM as tool-role messages so it can
//! adapt; only depth/budget exhaustion, permanent provider failures, an
//! unassemblable context, and cancellation are task-fatal.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──run()──▶ running ──▶ completed   (done, or loop exhaustion)
//!                         ├────▶ failed      (task-fatal error, retries spent)
//!                         └────▶ cancelled   (cooperative cancel)
//! ```
//!
//! A terminal `node.complete` event (carrying the task) is always
//! published, the terminal task is written back to the memory tiers, and
//! tier promotion is triggered asynchronously.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::agent::Agent;
//! use agentmesh::clients::scripted::{ScriptedClient, ScriptedTurn};
//! use agentmesh::task::{Task, TaskAction};
//! use std::sync::Arc;
//!
//! # async {
//! let client = Arc::new(ScriptedClient::new(vec![ScriptedTurn::tool_call(
//!     "done",
//!     serde_json::json!({"content": "finished"}),
//! )]));
//! let agent = Agent::new("worker", client).await;
//! let task = Task::new(TaskAction::Execute, "do the thing").with_target("worker");
//! let done = agent.run(task).await;
//! assert_eq!(done.result.content, "finished");
//! # };
//! ```

use crate::agentmesh::budget::Budget;
use crate::agentmesh::cancel::CancelToken;
use crate::agentmesh::client_wrapper::{
    ChatParams, Message, Role, SharedClient, StreamChunk, ToolCallRequest, ToolDefinition,
};
use crate::agentmesh::config::AgentConfig;
use crate::agentmesh::context_orchestrator::{ContextConfig, ContextOrchestrator};
use crate::agentmesh::context_source::{
    AgentOutputSource, ContextCounter, ContextSource, KnowledgeSource, MemoryTierSource,
    PromptSource, SkillSource, TierSelection, ToolSource, UserInputSource,
};
use crate::agentmesh::error::AgentError;
use crate::agentmesh::event::{Event, EventSelector, EventType};
use crate::agentmesh::event_bus::{EventBus, EventObserver};
use crate::agentmesh::memory_tiers::MemoryTierStore;
use crate::agentmesh::providers::KnowledgeBase;
use crate::agentmesh::scoped_memory::ScopedMemory;
use crate::agentmesh::skill::{InstantiatedNode, SkillActivator, SkillRegistry};
use crate::agentmesh::task::{QualityMetrics, Task, TaskAction, TaskStatus};
use crate::agentmesh::token_counter::TokenCounter;
use crate::agentmesh::tool_executor::ToolExecutor;
use crate::agentmesh::tool_protocol::ToolRegistry;
use crate::agentmesh::tool_protocols::FunctionToolProtocol;
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Names of the loop-handled meta-tools.
pub const META_TOOLS: [&str; 8] = [
    "done",
    "create_plan",
    "delegate_task",
    "query_l1_memory",
    "query_l2_memory",
    "query_events_by_action",
    "write_memory",
    "read_memory",
];

/// Base delay for the exponential LLM retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// An LLM-driven agent node.
///
/// Shares the bus, tool registry, skill registry, and budget with its
/// delegation tree; owns its scoped memory, memory tiers, and per-run
/// conversation buffer.
pub struct Agent {
    /// Stable node identifier on the bus.
    pub id: String,
    pub(crate) config: AgentConfig,
    pub(crate) client: SharedClient,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) tools: Arc<RwLock<ToolRegistry>>,
    pub(crate) compile_protocol: Arc<FunctionToolProtocol>,
    pub(crate) skills: Arc<SkillRegistry>,
    pub(crate) memory: Arc<ScopedMemory>,
    pub(crate) tiers: Arc<MemoryTierStore>,
    pub(crate) budget: Budget,
    pub(crate) counter: Arc<TokenCounter>,
    pub(crate) knowledge: Option<Arc<dyn KnowledgeBase>>,
    pub(crate) orchestrator: ContextOrchestrator,
    pub(crate) executor: ToolExecutor,
    pub(crate) activator: SkillActivator,
    pub(crate) skill_source: Arc<SkillSource>,
    pub(crate) instantiated: RwLock<Vec<InstantiatedNode>>,
    pub(crate) active: RwLock<HashMap<String, CancelToken>>,
    pub(crate) depth: usize,
}

impl Agent {
    /// Create an agent with default infrastructure: a fresh bus, an empty
    /// tool registry backed by a function protocol, an empty skill
    /// registry, fresh memory tiers, and an unlimited budget.
    ///
    /// Use [`AgentSetup`] when several agents should share infrastructure.
    pub async fn new(id: impl Into<String>, client: SharedClient) -> Self {
        AgentSetup::default().build(id, client).await
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The shared event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The agent's scoped memory.
    pub fn memory(&self) -> &Arc<ScopedMemory> {
        &self.memory
    }

    /// The agent's memory tiers.
    pub fn tiers(&self) -> &Arc<MemoryTierStore> {
        &self.tiers
    }

    /// The shared budget.
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// The shared tool registry.
    pub fn tools(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.tools
    }

    /// Delegation depth of this agent (0 for a root agent).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Open an event stream filtered by `selector` (consumer API).
    pub fn stream_events(&self, selector: EventSelector) -> tokio::sync::mpsc::Receiver<Arc<Event>> {
        self.bus.stream_events(selector)
    }

    /// Borrow the agent's context orchestrator.
    pub fn orchestrator(&self) -> &ContextOrchestrator {
        &self.orchestrator
    }

    /// Pin a snippet into the next context assembly only.
    pub async fn add_ephemeral(&self, text: impl Into<String>) {
        let text = text.into();
        self.orchestrator.add_ephemeral(text.clone()).await;
        self.bus
            .publish(
                Event::new(EventType::EphemeralAdd, self.id.clone())
                    .with_payload(serde_json::json!({ "text": text })),
            )
            .await;
    }

    /// Discard pinned ephemeral snippets.
    pub async fn clear_ephemeral(&self) {
        self.orchestrator.clear_ephemeral().await;
        self.bus
            .publish(Event::new(EventType::EphemeralClear, self.id.clone()))
            .await;
    }

    /// Signal cooperative cancellation of a running task.
    ///
    /// A no-op when the task is not currently running on this agent
    /// (including already-terminal tasks).
    pub async fn cancel(&self, task_id: &str) {
        if let Some(token) = self.active.read().await.get(task_id) {
            token.cancel();
        }
    }

    /// Subscribe this agent to task envelopes addressed to it.
    ///
    /// Every `task.submit` event targeting the agent's id is accepted
    /// (publishing `task.accept`) and run; the terminal `node.complete`
    /// event resolves any [`request_reply`](EventBus::request_reply)
    /// waiter. Returns immediately; processing happens on the bus worker.
    /// Call as `Arc::clone(&agent).serve()`.
    pub fn serve(self: Arc<Self>) {
        struct Inbox {
            agent: Arc<Agent>,
        }

        #[async_trait]
        impl EventObserver for Inbox {
            async fn on_event(
                &self,
                event: &Event,
            ) -> Result<(), crate::agentmesh::error::BoxError> {
                if event.event_type != EventType::TaskSubmit {
                    return Ok(());
                }
                let task = match event.embedded_task() {
                    Some(task) => task,
                    None => return Ok(()),
                };
                self.agent
                    .bus
                    .publish(
                        Event::new(EventType::TaskAccept, self.agent.id.clone())
                            .with_task(task.task_id.as_str())
                            .with_trace(
                                task.metadata.trace_id.clone(),
                                task.metadata.span_id.clone(),
                            ),
                    )
                    .await;
                let agent = Arc::clone(&self.agent);
                tokio::spawn(async move {
                    agent.run(task).await;
                });
                Ok(())
            }
        }

        let bus = Arc::clone(&self.bus);
        let selector = EventSelector::for_node(self.id.as_str());
        bus.subscribe(selector, Arc::new(Inbox { agent: self }));
    }

    /// Dyn-erased recursion point for plan steps and delegation.
    pub(crate) fn run_boxed<'a>(
        &'a self,
        task: Task,
    ) -> Pin<Box<dyn Future<Output = Task> + Send + 'a>> {
        Box::pin(self.run(task))
    }

    /// Execute a task to a terminal status.
    ///
    /// Always returns the terminal task: `completed` with
    /// `result.content`, `failed` with `result.error`, or `cancelled`.
    /// The caller never sees a raised error — failures are folded into the
    /// task per the error taxonomy.
    pub async fn run(&self, mut task: Task) -> Task {
        if task.target_agent.is_empty() {
            task.target_agent = self.id.clone();
        }
        task.metadata.depth = self.depth;
        task.transition(TaskStatus::Running);

        let cancel = CancelToken::new();
        self.active
            .write()
            .await
            .insert(task.task_id.clone(), cancel.clone());

        self.publish_task_event(EventType::NodeStart, &task, serde_json::Value::Null)
            .await;
        self.tiers.add_task(task.clone());

        let outcome = self.run_loop(&mut task, &cancel).await;

        match outcome {
            Ok(content) => {
                task.complete(content);
                if self.config.self_evaluation {
                    if let Some(metrics) = self.self_evaluate(&task).await {
                        task.result.quality_metrics = Some(metrics);
                    }
                }
            }
            Err(AgentError::Cancelled) => {
                task.transition(TaskStatus::Cancelled);
                info!("[{}] task {} cancelled", self.id, task.task_id);
            }
            Err(error) => {
                warn!("[{}] task {} failed: {}", self.id, task.task_id, error);
                self.publish_task_event(
                    EventType::NodeError,
                    &task,
                    serde_json::json!({ "error": error.to_string(), "kind": error.kind() }),
                )
                .await;
                task.fail(error.kind(), error.to_string(), self.config.max_retries);
            }
        }

        self.active.write().await.remove(&task.task_id);
        self.tiers.update_task(&task);
        if task.metadata.importance >= self.config.importance_promote_threshold
            && task.status == TaskStatus::Completed
        {
            self.publish_task_event(
                EventType::MemoryVectorizeStart,
                &task,
                serde_json::Value::Null,
            )
            .await;
            self.tiers.memorize(&task).await;
            self.publish_task_event(
                EventType::MemoryVectorizeComplete,
                &task,
                serde_json::Value::Null,
            )
            .await;
        }

        self.publish_task_event(
            EventType::NodeComplete,
            &task,
            serde_json::json!({
                "status": task.status,
                "task": &task,
            }),
        )
        .await;

        // Promotion strictly after completion, off the hot path.
        Arc::clone(&self.tiers).promote_tasks_async();

        task
    }

    async fn run_loop(&self, task: &mut Task, cancel: &CancelToken) -> Result<String, AgentError> {
        // Skill activation happens once, on entry. Form-1 instructions are
        // recorded in the skill source so every assembly of this run
        // carries them in the system segment.
        let activation = self.activator.activate(task, &self.config).await;
        {
            let active = self.skill_source.active_skills();
            let mut active = active.write().await;
            active.clear();
            for (name, text, priority) in &activation.injected_instructions {
                active.push((name.clone(), text.clone(), *priority));
            }
        }
        if !activation.instantiated_nodes.is_empty() {
            self.instantiated
                .write()
                .await
                .extend(activation.instantiated_nodes.into_iter());
        }

        let mut conversation: Vec<Message> = Vec::new();
        let mut last_text = String::new();

        for iteration in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            // Perceive: assemble the context for this iteration.
            let mut messages = self.orchestrator.build_context(task, iteration).await?;
            // The user-input message sits last; conversation history goes
            // before it so the active request stays in the recency slot.
            let user_slot = messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .unwrap_or(messages.len());
            for (offset, message) in conversation.iter().cloned().enumerate() {
                messages.insert(user_slot + offset, message);
            }

            let tool_definitions = self.tool_definitions().await;

            // Reason: stream the LLM call (with retries and the budget).
            let turn = self
                .stream_llm(task, &messages, tool_definitions, cancel)
                .await?;
            if !turn.text.is_empty() {
                last_text = turn.text.clone();
            }

            if turn.tool_calls.is_empty() {
                if self.config.require_done_tool {
                    conversation.push(Message::text(Role::Assistant, turn.text));
                    conversation.push(Message::text(
                        Role::User,
                        "Finish by calling the `done` tool with your final answer.",
                    ));
                    continue;
                }
                return Ok(turn.text);
            }

            // Act: dispatch tool calls in issued order.
            conversation.push(Message {
                role: Role::Assistant,
                content: turn.text.clone(),
                tool_calls: turn.tool_calls.clone(),
            });

            match self
                .dispatch_calls(task, &turn.tool_calls, cancel, &mut conversation)
                .await?
            {
                Some(final_content) => return Ok(final_content),
                None => {}
            }
        }

        // Loop exhaustion: the accumulated text is the best answer we have.
        debug!(
            "[{}] task {} exhausted {} iterations",
            self.id, task.task_id, self.config.max_iterations
        );
        Ok(last_text)
    }

    /// Dispatch one response's tool calls. Returns `Some(content)` when a
    /// `done` call completed the task.
    async fn dispatch_calls(
        &self,
        task: &Task,
        calls: &[ToolCallRequest],
        cancel: &CancelToken,
        conversation: &mut Vec<Message>,
    ) -> Result<Option<String>, AgentError> {
        let mut index = 0;
        while index < calls.len() {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let call = &calls[index];

            if !META_TOOLS.contains(&call.name.as_str()) {
                // Batch the maximal run of consecutive regular tools so the
                // executor can apply its read/write discipline.
                let mut end = index;
                while end < calls.len() && !META_TOOLS.contains(&calls[end].name.as_str()) {
                    end += 1;
                }
                let outcomes = self
                    .executor
                    .execute_batch_cancellable(&calls[index..end], &self.id, Some(task), cancel)
                    .await;
                for outcome in outcomes {
                    conversation.push(Message::tool_result(
                        outcome.call.id.clone(),
                        render_tool_result(&outcome.call.name, &outcome.result),
                    ));
                }
                index = end;
                continue;
            }

            // Meta-tool: handled by the loop itself, but still observable
            // as tool.call / tool.result events.
            self.publish_task_event(
                EventType::ToolCall,
                task,
                serde_json::json!({
                    "call_id": call.id,
                    "tool": call.name,
                    "arguments": call.arguments,
                }),
            )
            .await;

            let meta_result: Result<serde_json::Value, AgentError> = match call.name.as_str() {
                "done" => {
                    let content = call
                        .arguments
                        .get("content")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.publish_task_event(
                        EventType::ToolResult,
                        task,
                        serde_json::json!({
                            "call_id": call.id,
                            "tool": "done",
                            "success": true,
                        }),
                    )
                    .await;
                    return Ok(Some(content));
                }
                "create_plan" => self.execute_plan(task, &call.arguments).await,
                "delegate_task" => self
                    .delegate_from_call(task, &call.arguments)
                    .await
                    .map(|content| serde_json::json!({ "result": content })),
                "query_l1_memory" => {
                    let limit = call.arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(10);
                    let tasks = self
                        .tiers
                        .get_l1_tasks(limit as usize, task.session_id.as_deref());
                    Ok(serde_json::json!({ "tasks": render_tasks(&tasks) }))
                }
                "query_l2_memory" => {
                    let limit = call.arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(10);
                    let tasks = self
                        .tiers
                        .get_l2_tasks(limit as usize, task.session_id.as_deref());
                    Ok(serde_json::json!({ "tasks": render_tasks(&tasks) }))
                }
                "query_events_by_action" => {
                    let action = call
                        .arguments
                        .get("action")
                        .and_then(|v| v.as_str())
                        .unwrap_or("execute");
                    let limit = call.arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(10);
                    let events = self.bus.query_by_action(action, limit as usize).await;
                    let rendered: Vec<serde_json::Value> = events
                        .iter()
                        .map(|e| {
                            serde_json::json!({
                                "event_type": e.event_type.as_str(),
                                "source_node": e.source_node,
                                "payload": e.payload,
                            })
                        })
                        .collect();
                    Ok(serde_json::json!({ "events": rendered }))
                }
                "write_memory" => self.write_memory_call(&call.arguments).await,
                "read_memory" => self.read_memory_call(task, &call.arguments).await,
                _ => unreachable!("meta dispatch covers META_TOOLS"),
            };

            let (payload, message) = match meta_result {
                Ok(value) => (
                    serde_json::json!({
                        "call_id": call.id,
                        "tool": call.name,
                        "success": true,
                        "output": value,
                    }),
                    format!("{}", value),
                ),
                Err(error) if error.is_task_fatal() && error != AgentError::Cancelled => {
                    // Depth/budget failures on meta-tools go back to the
                    // LLM as tool errors; the loop itself continues.
                    (
                        serde_json::json!({
                            "call_id": call.id,
                            "tool": call.name,
                            "success": false,
                            "error": error.to_string(),
                        }),
                        format!("Error: {}", error),
                    )
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(error) => (
                    serde_json::json!({
                        "call_id": call.id,
                        "tool": call.name,
                        "success": false,
                        "error": error.to_string(),
                    }),
                    format!("Error: {}", error),
                ),
            };

            self.publish_task_event(EventType::ToolResult, task, payload).await;
            conversation.push(Message::tool_result(call.id.clone(), message));
            index += 1;
        }
        Ok(None)
    }

    /// Execute a `create_plan` call: ordered sub-tasks run locally, each
    /// step receiving the previous step's output as context.
    async fn execute_plan(
        &self,
        task: &Task,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let steps: Vec<String> = arguments
            .get("steps")
            .and_then(|v| v.as_array())
            .map(|steps| {
                steps
                    .iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if steps.is_empty() {
            return Err(AgentError::InvalidArguments {
                tool: "create_plan".to_string(),
                message: "plan requires a non-empty 'steps' array".to_string(),
            });
        }

        let mut results = Vec::with_capacity(steps.len());
        let mut carried = String::new();
        for (i, step) in steps.iter().enumerate() {
            let content = if carried.is_empty() {
                step.clone()
            } else {
                format!("{}\n\nPrevious step result: {}", step, carried)
            };
            let step_task = task.child(TaskAction::PlanStep, content);
            self.publish_task_event(
                EventType::PlanStep,
                task,
                serde_json::json!({ "step": i + 1, "total": steps.len(), "description": step }),
            )
            .await;

            let finished = self.run_boxed(step_task).await;
            if finished.status != TaskStatus::Completed {
                let message = finished
                    .result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "plan step did not complete".to_string());
                return Err(AgentError::TaskFailed(format!(
                    "plan step {} failed: {}",
                    i + 1,
                    message
                )));
            }
            carried = finished.result.content.clone();
            results.push(serde_json::json!({
                "step": i + 1,
                "result": finished.result.content,
            }));
        }

        Ok(serde_json::json!({ "steps": results, "final": carried }))
    }

    /// `write_memory {id, content, scope?}` against the scoped store.
    async fn write_memory_call(
        &self,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let id = arguments
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidArguments {
                tool: "write_memory".to_string(),
                message: "missing 'id'".to_string(),
            })?;
        let content = arguments
            .get("content")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let scope = parse_scope(
            arguments.get("scope").and_then(|v| v.as_str()).unwrap_or("local"),
        )
        .ok_or_else(|| AgentError::InvalidArguments {
            tool: "write_memory".to_string(),
            message: "scope must be one of local/shared/global".to_string(),
        })?;

        let entry = self.memory.write(id, content, scope).await?;
        Ok(serde_json::json!({ "id": entry.id, "version": entry.version }))
    }

    /// `read_memory {id, scopes?}` against the scoped store (parent chain
    /// included for `inherited`).
    async fn read_memory_call(
        &self,
        task: &Task,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let id = arguments
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidArguments {
                tool: "read_memory".to_string(),
                message: "missing 'id'".to_string(),
            })?;
        let scopes: Option<Vec<crate::agentmesh::scoped_memory::MemoryScope>> = arguments
            .get("scopes")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|s| s.as_str().and_then(parse_scope))
                    .collect()
            });

        self.publish_task_event(
            EventType::MemoryRetrieveStart,
            task,
            serde_json::json!({ "id": id }),
        )
        .await;
        let entry = self.memory.read(id, scopes.as_deref()).await;
        self.publish_task_event(
            EventType::MemoryRetrieveComplete,
            task,
            serde_json::json!({ "id": id, "found": entry.is_some() }),
        )
        .await;

        match entry {
            Some(entry) => Ok(serde_json::json!({
                "id": entry.id,
                "content": entry.content,
                "scope": entry.scope,
                "version": entry.version,
            })),
            None => Ok(serde_json::json!({ "id": id, "content": null, "found": false })),
        }
    }

    async fn delegate_from_call(
        &self,
        task: &Task,
        arguments: &serde_json::Value,
    ) -> Result<String, AgentError> {
        let description = arguments
            .get("description")
            .or_else(|| arguments.get("subtask_description"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidArguments {
                tool: "delegate_task".to_string(),
                message: "missing 'description'".to_string(),
            })?;
        let capabilities: Vec<String> = arguments
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let hints: Vec<String> = arguments
            .get("context_hints")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        self.delegate(task, description, &capabilities, &hints).await
    }

    /// Stream one LLM call with per-call deadline, transient retry with
    /// exponential backoff and jitter, budget charging, and `node.thinking`
    /// publication per text chunk.
    async fn stream_llm(
        &self,
        task: &Task,
        messages: &[Message],
        tools: Vec<ToolDefinition>,
        cancel: &CancelToken,
    ) -> Result<LlmTurn, AgentError> {
        // Budget: charge the prompt estimate up front; the call is not
        // made once the shared budget is exhausted.
        let prompt_tokens = self
            .counter
            .count_messages(&self.config.model, messages)
            .unwrap_or_else(|_| messages.iter().map(|m| m.content.len() / 4).sum());
        self.budget.charge(prompt_tokens as u64)?;

        let deadline = Duration::from_secs(self.config.llm_timeout_s.max(1));
        let mut attempt = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let result = tokio::time::timeout(
                deadline,
                self.stream_once(task, messages, tools.clone(), cancel),
            )
            .await;

            let error = match result {
                Ok(Ok(turn)) => {
                    // Charge generated tokens as reported by the provider.
                    if turn.output_tokens > 0 {
                        self.budget.charge(turn.output_tokens as u64)?;
                    }
                    debug!(
                        "[{}] llm call: {} in / {} out tokens, {} remaining in budget",
                        self.id,
                        turn.input_tokens,
                        turn.output_tokens,
                        self.budget.remaining()
                    );
                    return Ok(turn);
                }
                Ok(Err(error)) => error,
                Err(_) => AgentError::Timeout(format!("LLM call after {:?}", deadline)),
            };

            if !error.is_retryable() || attempt >= self.config.max_retries {
                return Err(error);
            }
            attempt += 1;

            // Exponential backoff with clock-derived jitter.
            let jitter = Duration::from_millis((Utc::now().nanosecond() % 100) as u64);
            let delay = RETRY_BASE_DELAY * (1 << (attempt - 1).min(8) as u32) + jitter;
            debug!(
                "[{}] retrying LLM call (attempt {}/{}) in {:?}: {}",
                self.id, attempt, self.config.max_retries, delay, error
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_once(
        &self,
        task: &Task,
        messages: &[Message],
        tools: Vec<ToolDefinition>,
        cancel: &CancelToken,
    ) -> Result<LlmTurn, AgentError> {
        let params = ChatParams {
            temperature: None,
            max_output_tokens: Some(
                (self.config.max_context_tokens as f64 * self.config.output_reserve_ratio)
                    as usize,
            ),
        };
        let mut stream = self
            .client
            .stream_chat(messages, Some(tools), Some(params))
            .await
            .map_err(classify_client_error)?;

        let mut turn = LlmTurn::default();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => return Err(classify_client_error(error)),
                None => break,
            };
            match chunk {
                StreamChunk::Text { delta } => {
                    turn.text.push_str(&delta);
                    self.publish_task_event(
                        EventType::NodeThinking,
                        task,
                        serde_json::json!({ "delta": delta }),
                    )
                    .await;
                }
                StreamChunk::ToolCallComplete { id, name, arguments } => {
                    turn.tool_calls.push(ToolCallRequest { id, name, arguments });
                }
                StreamChunk::Usage { input, output } => {
                    turn.input_tokens += input;
                    turn.output_tokens += output;
                }
                StreamChunk::Finish { .. } => break,
                StreamChunk::ToolCallStart { .. } | StreamChunk::ToolCallDelta { .. } => {}
            }
        }
        Ok(turn)
    }

    /// Registry tools plus the loop's meta-tools, as provider definitions.
    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = {
            let registry = self.tools.read().await;
            registry
                .list_tools()
                .iter()
                .filter(|t| self.config.tool_allowed(&t.name))
                .map(|t| t.to_tool_definition())
                .collect()
        };
        definitions.extend(meta_tool_definitions());
        definitions
    }

    /// One short LLM call producing `{confidence, coverage, novelty}`.
    async fn self_evaluate(&self, task: &Task) -> Option<QualityMetrics> {
        let prompt = format!(
            "Task: {}\nAnswer: {}\n\nScore the answer. Reply with exactly one JSON object: \
             {{\"confidence\": 0..1, \"coverage\": 0..1, \"novelty\": 0..1}}",
            task.content(),
            task.result.content
        );
        let messages = [
            Message::text(Role::System, "You score completed work, strictly as JSON."),
            Message::text(Role::User, prompt),
        ];

        let mut stream = self.client.stream_chat(&messages, None, None).await.ok()?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let Ok(StreamChunk::Text { delta }) = chunk {
                text.push_str(&delta);
            }
        }

        let start = text.find('{')?;
        let end = text.rfind('}')?;
        let parsed: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;
        Some(QualityMetrics {
            confidence: parsed.get("confidence")?.as_f64()?.clamp(0.0, 1.0),
            coverage: parsed.get("coverage")?.as_f64()?.clamp(0.0, 1.0),
            novelty: parsed.get("novelty")?.as_f64()?.clamp(0.0, 1.0),
        })
    }

    pub(crate) async fn publish_task_event(
        &self,
        event_type: EventType,
        task: &Task,
        payload: serde_json::Value,
    ) {
        self.bus
            .publish(
                Event::new(event_type, self.id.clone())
                    .with_task(task.task_id.as_str())
                    .with_action(task.action.as_str())
                    .with_trace(task.metadata.trace_id.clone(), task.metadata.span_id.clone())
                    .with_payload(payload),
            )
            .await;
    }
}

/// Accumulated output of one streamed LLM call.
#[derive(Default)]
pub(crate) struct LlmTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

fn render_tool_result(
    name: &str,
    result: &crate::agentmesh::tool_protocol::ToolResult,
) -> String {
    match result.error() {
        None => format!(
            "Tool '{}' succeeded. Result: {}",
            name,
            serde_json::to_string(result.output()).unwrap_or_else(|_| "null".to_string())
        ),
        Some(message) => format!("Tool '{}' failed. Error: {}", name, message),
    }
}

fn render_tasks(tasks: &[Task]) -> Vec<serde_json::Value> {
    tasks
        .iter()
        .map(|t| {
            serde_json::json!({
                "task_id": t.task_id,
                "content": t.content(),
                "result": t.result.content,
                "importance": t.metadata.importance,
                "status": t.status,
            })
        })
        .collect()
}

/// Parse a scope name for the memory meta-tools.
///
/// `inherited` parses so read searches can target it; writes against it
/// surface `ReadOnlyScope` from the store.
fn parse_scope(name: &str) -> Option<crate::agentmesh::scoped_memory::MemoryScope> {
    use crate::agentmesh::scoped_memory::MemoryScope;
    match name {
        "local" => Some(MemoryScope::Local),
        "shared" => Some(MemoryScope::Shared),
        "global" => Some(MemoryScope::Global),
        "inherited" => Some(MemoryScope::Inherited),
        _ => None,
    }
}

/// Map a boxed client error into the retry taxonomy.
///
/// Errors that already carry an [`AgentError`] keep their classification;
/// anything else from a provider is assumed transient (network hiccups,
/// 5xx) and left to the retry budget.
fn classify_client_error(error: crate::agentmesh::error::BoxError) -> AgentError {
    match error.downcast::<AgentError>() {
        Ok(known) => *known,
        Err(other) => AgentError::LlmTransient(other.to_string()),
    }
}

/// Provider definitions for the loop's meta-tools.
fn meta_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "done".to_string(),
            description: "Finish the task and return the final answer.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": { "content": { "type": "string" } },
                "required": ["content"],
            }),
        },
        ToolDefinition {
            name: "create_plan".to_string(),
            description: "Run an ordered list of sub-tasks locally.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "steps": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["steps"],
            }),
        },
        ToolDefinition {
            name: "delegate_task".to_string(),
            description: "Hand an independent sub-task to a child agent.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "description": { "type": "string" },
                    "required_capabilities": {
                        "type": "array", "items": { "type": "string" }
                    },
                    "context_hints": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["description"],
            }),
        },
        ToolDefinition {
            name: "query_l1_memory".to_string(),
            description: "Read the most recent tasks from memory.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": { "limit": { "type": "integer" } },
            }),
        },
        ToolDefinition {
            name: "query_l2_memory".to_string(),
            description: "Read the most important tasks from memory.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": { "limit": { "type": "integer" } },
            }),
        },
        ToolDefinition {
            name: "query_events_by_action".to_string(),
            description: "Inspect recent bus events by task action.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["action"],
            }),
        },
        ToolDefinition {
            name: "write_memory".to_string(),
            description: "Store a named entry in scoped memory.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "content": {},
                    "scope": {
                        "type": "string",
                        "enum": ["local", "shared", "global"]
                    }
                },
                "required": ["id", "content"],
            }),
        },
        ToolDefinition {
            name: "read_memory".to_string(),
            description: "Read a named entry from scoped memory.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "scopes": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["id"],
            }),
        },
    ]
}

/// Shared infrastructure for building agents.
///
/// Collects the pieces several agents (or an agent and its delegation
/// tree) share — bus, tool registry, skill registry, budget, token
/// counter, knowledge backend — and wires the per-agent pieces (scoped
/// memory, tiers, orchestrator) on [`build`](AgentSetup::build).
pub struct AgentSetup {
    /// Agent configuration applied to built agents.
    pub config: AgentConfig,
    /// Shared event bus; a fresh one is created when absent.
    pub bus: Option<Arc<EventBus>>,
    /// Shared tool registry; a fresh one is created when absent.
    pub tools: Option<Arc<RwLock<ToolRegistry>>>,
    /// Function protocol that skill compilation targets.
    pub compile_protocol: Option<Arc<FunctionToolProtocol>>,
    /// Shared skill registry.
    pub skills: Option<Arc<SkillRegistry>>,
    /// Shared budget; unlimited when absent.
    pub budget: Option<Budget>,
    /// Token counter; heuristic default when absent.
    pub counter: Option<Arc<TokenCounter>>,
    /// Optional knowledge backend for the RAG source.
    pub knowledge: Option<Arc<dyn KnowledgeBase>>,
    /// Base system prompt.
    pub system_prompt: String,
    /// Optional LLM client for skill discovery.
    pub discovery_client: Option<SharedClient>,
}

impl Default for AgentSetup {
    fn default() -> Self {
        Self {
            config: AgentConfig::default(),
            bus: None,
            tools: None,
            compile_protocol: None,
            skills: None,
            budget: None,
            counter: None,
            knowledge: None,
            system_prompt: String::new(),
            discovery_client: None,
        }
    }
}

impl AgentSetup {
    /// Start from an explicit configuration.
    pub fn with_config(config: AgentConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Use a shared bus (builder pattern).
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use a shared tool registry (builder pattern).
    pub fn tools(mut self, tools: Arc<RwLock<ToolRegistry>>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Use a shared skill registry (builder pattern).
    pub fn skills(mut self, skills: Arc<SkillRegistry>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Use a shared budget (builder pattern).
    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Attach a knowledge backend (builder pattern).
    pub fn knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    /// Set the base system prompt (builder pattern).
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Build an agent at delegation depth 0.
    pub async fn build(self, id: impl Into<String>, client: SharedClient) -> Agent {
        self.build_at_depth(id, client, 0, None).await
    }

    /// Build an agent at an explicit depth with an optional parent memory.
    pub(crate) async fn build_at_depth(
        self,
        id: impl Into<String>,
        client: SharedClient,
        depth: usize,
        parent_memory: Option<&Arc<ScopedMemory>>,
    ) -> Agent {
        let id = id.into();
        let config = self.config;

        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::new(config.bus_history_cap));
        let compile_protocol = self
            .compile_protocol
            .unwrap_or_else(|| Arc::new(FunctionToolProtocol::new()));
        let tools = match self.tools {
            Some(tools) => tools,
            None => {
                let mut registry = ToolRegistry::new();
                // The compile target is always discoverable.
                registry
                    .add_protocol("functions", compile_protocol.clone())
                    .await
                    .ok();
                Arc::new(RwLock::new(registry))
            }
        };
        let skills = self.skills.unwrap_or_else(|| Arc::new(SkillRegistry::new()));
        let budget = self.budget.unwrap_or_else(Budget::unlimited);
        let counter = self
            .counter
            .unwrap_or_else(|| Arc::new(TokenCounter::with_default_heuristic()));

        let memory = match parent_memory {
            Some(parent) => ScopedMemory::child_of(parent, id.clone()),
            None => Arc::new(ScopedMemory::new(id.clone())),
        };
        let tiers = Arc::new(MemoryTierStore::new(
            config.max_l1_size,
            config.max_l2_size,
            config.max_l3_size,
        ));

        let prompt_source = Arc::new(PromptSource::new(self.system_prompt.clone()));
        let skill_source = Arc::new(SkillSource::new());
        let context_counter = ContextCounter::new(Arc::clone(&counter), config.model.clone());
        let mut sources: Vec<Arc<dyn ContextSource>> = vec![
            Arc::new(ToolSource::new(Arc::clone(&tools))),
            Arc::clone(&skill_source) as Arc<dyn ContextSource>,
            Arc::new(MemoryTierSource::new(Arc::clone(&tiers), TierSelection::Recent)),
            Arc::new(MemoryTierSource::new(
                Arc::clone(&tiers),
                TierSelection::Important,
            )),
            Arc::new(MemoryTierSource::new(
                Arc::clone(&tiers),
                TierSelection::Session,
            )),
            Arc::new(MemoryTierSource::new(
                Arc::clone(&tiers),
                TierSelection::Semantic,
            )),
            Arc::new(AgentOutputSource::new(Arc::clone(&tiers))),
        ];
        if let Some(knowledge) = &self.knowledge {
            sources.push(Arc::new(KnowledgeSource::new(Arc::clone(knowledge))));
        }
        sources.push(Arc::new(UserInputSource));

        let orchestrator = ContextOrchestrator::new(
            prompt_source,
            sources,
            context_counter,
            ContextConfig {
                max_context_tokens: config.max_context_tokens,
                output_reserve_ratio: config.output_reserve_ratio,
                ..ContextConfig::default()
            },
        );

        let executor = ToolExecutor::new(Arc::clone(&tools), Arc::clone(&bus))
            .with_concurrency_limit(config.tool_concurrency_limit)
            .with_call_timeout(Duration::from_secs(config.tool_timeout_s.max(1)));

        let mut activator = SkillActivator::new(
            Arc::clone(&skills),
            Arc::clone(&tools),
            Arc::clone(&compile_protocol),
            Arc::clone(&bus),
        );
        if let Some(discovery) = self.discovery_client {
            activator = activator.with_discovery_client(discovery);
        }

        Agent {
            id,
            config,
            client,
            bus,
            tools,
            compile_protocol,
            skills,
            memory,
            tiers,
            budget,
            counter,
            knowledge: self.knowledge,
            orchestrator,
            executor,
            activator,
            skill_source,
            instantiated: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            depth,
        }
    }
}
