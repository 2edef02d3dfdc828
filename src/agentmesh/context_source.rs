//! Pluggable context sources for LLM input assembly.
//!
//! A [`ContextSource`] produces candidate fragments ([`ContextComponent`]s)
//! of the model's input for the current task, within a token budget. Seven
//! sources ship with the crate, mirroring where an agent's context comes
//! from:
//!
//! 1. [`UserInputSource`] — the incoming task content
//! 2. [`AgentOutputSource`] — recent assistant outputs from the tiers
//! 3. [`MemoryTierSource`] — L1 recent / L2 important / L3 session tasks
//!    plus L4 semantic retrieval
//! 4. [`KnowledgeSource`] — external RAG snippets
//! 5. [`PromptSource`] — the three-layer system prompt
//! 6. [`ToolSource`] — tool schemas, pruned to fit
//! 7. [`SkillSource`] — activated skill instructions
//!
//! Components carry a semantic priority (CRITICAL=100 down to LOW=30), a
//! placement class used by the orchestrator's ordering rules, a measured
//! token count, and an overflow strategy. A source must respect its
//! budget: the sum of returned `token_count`s never exceeds it, with
//! higher-priority and newer items favored when something must give.
//! Components live only for the duration of one assembly.

use crate::agentmesh::client_wrapper::Role;
use crate::agentmesh::memory_tiers::MemoryTierStore;
use crate::agentmesh::providers::KnowledgeBase;
use crate::agentmesh::task::Task;
use crate::agentmesh::token_counter::TokenCounter;
use crate::agentmesh::tool_protocol::ToolRegistry;
use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Semantic priority levels for context components.
pub mod priority {
    /// System prompt and tool list.
    pub const CRITICAL: u8 = 100;
    /// RAG / long-term semantic retrieval.
    pub const ESSENTIAL: u8 = 90;
    /// Recent and important history.
    pub const HIGH: u8 = 70;
    /// Session history, agent outputs.
    pub const MEDIUM: u8 = 50;
    /// Older history.
    pub const LOW: u8 = 30;
}

/// What to do with a component when the assembly exceeds its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Replace the content with a short extract.
    Summarize,
    /// Cut the content to fit.
    Truncate,
    /// Remove the component entirely.
    Drop,
    /// Never shrink or remove.
    Keep,
}

/// Where the orchestrator slots a component in the final message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The composed system prompt; always first.
    System,
    /// Retrieved knowledge; immediately after the system prompt, before
    /// any history ("primacy placement").
    Rag,
    /// Session history and memory, ordered by priority then recency.
    History,
    /// The current request; always last.
    UserInput,
}

/// A candidate fragment of the LLM input.
///
/// Created per assembly and discarded after the assembly returns.
#[derive(Debug, Clone)]
pub struct ContextComponent {
    /// Which source produced the component.
    pub source_name: String,
    /// Message role the component renders as.
    pub role: Role,
    /// The content text.
    pub content: String,
    /// Semantic priority, 0–100 (see [`priority`]).
    pub priority: u8,
    /// Measured token count of `content`.
    pub token_count: usize,
    /// Overflow handling.
    pub strategy: OverflowStrategy,
    /// Ordering class.
    pub placement: Placement,
    /// Open metadata; `task_id` is used for deduplication.
    pub metadata: JsonValue,
}

impl ContextComponent {
    /// The originating task id recorded in metadata, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get("task_id").and_then(|v| v.as_str())
    }
}

/// Token counting scoped to one model, with a heuristic fallback.
///
/// Sources measure with this instead of the raw counter so an unknown
/// model can't fail an assembly mid-flight.
#[derive(Clone)]
pub struct ContextCounter {
    counter: Arc<TokenCounter>,
    model: String,
}

impl ContextCounter {
    /// Bind a counter to a model name.
    pub fn new(counter: Arc<TokenCounter>, model: impl Into<String>) -> Self {
        Self {
            counter,
            model: model.into(),
        }
    }

    /// Count tokens, falling back to the 4-chars heuristic when the model
    /// is unregistered.
    pub fn count(&self, text: &str) -> usize {
        self.counter
            .count_text(&self.model, text)
            .unwrap_or_else(|_| (text.len() / 4).max(1))
    }
}

/// The query a source collects against: the current task plus loop state.
#[derive(Debug, Clone)]
pub struct ContextQuery {
    /// Request text of the current task.
    pub content: String,
    /// Current task id (excluded from history dedup).
    pub task_id: String,
    /// Session filter, when the task belongs to a session.
    pub session_id: Option<String>,
    /// Zero-based loop iteration.
    pub iteration: usize,
}

impl ContextQuery {
    /// Build a query from a task at a given iteration.
    pub fn from_task(task: &Task, iteration: usize) -> Self {
        Self {
            content: task.content().to_string(),
            task_id: task.task_id.clone(),
            session_id: task.session_id.clone(),
            iteration,
        }
    }
}

/// A pluggable producer of context components.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Stable source identifier, used for budget allocation.
    fn source_name(&self) -> &str;

    /// Collect components for `query` within `token_budget`.
    ///
    /// The sum of returned `token_count`s must not exceed the budget;
    /// sources favor higher-priority and newer items when trimming.
    async fn collect(
        &self,
        query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent>;
}

/// Take components in the given order until the budget is spent.
fn take_within_budget(
    components: Vec<ContextComponent>,
    token_budget: usize,
) -> Vec<ContextComponent> {
    let mut taken = Vec::new();
    let mut spent = 0;
    for component in components {
        if spent + component.token_count > token_budget {
            continue;
        }
        spent += component.token_count;
        taken.push(component);
    }
    taken
}

// ---------------------------------------------------------------------------
// UserInputSource
// ---------------------------------------------------------------------------

/// The incoming task content, rendered as the final user message.
pub struct UserInputSource;

#[async_trait]
impl ContextSource for UserInputSource {
    fn source_name(&self) -> &str {
        "user_input"
    }

    async fn collect(
        &self,
        query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        if query.content.is_empty() {
            return Vec::new();
        }
        let token_count = counter.count(&query.content);
        let component = ContextComponent {
            source_name: self.source_name().to_string(),
            role: Role::User,
            content: query.content.clone(),
            priority: priority::ESSENTIAL,
            token_count,
            strategy: OverflowStrategy::Keep,
            placement: Placement::UserInput,
            metadata: serde_json::json!({ "task_id": query.task_id }),
        };
        take_within_budget(vec![component], token_budget.max(token_count))
    }
}

// ---------------------------------------------------------------------------
// AgentOutputSource
// ---------------------------------------------------------------------------

/// Recent assistant outputs pulled from the memory tiers.
pub struct AgentOutputSource {
    tiers: Arc<MemoryTierStore>,
    limit: usize,
}

impl AgentOutputSource {
    /// Create a source over the given tier store (default: last 5 outputs).
    pub fn new(tiers: Arc<MemoryTierStore>) -> Self {
        Self { tiers, limit: 5 }
    }
}

#[async_trait]
impl ContextSource for AgentOutputSource {
    fn source_name(&self) -> &str {
        "agent_output"
    }

    async fn collect(
        &self,
        query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        let tasks = self
            .tiers
            .get_l1_tasks(self.limit, query.session_id.as_deref());
        let components: Vec<ContextComponent> = tasks
            .into_iter()
            .filter(|t| t.status.is_terminal() && !t.result.content.is_empty())
            .filter(|t| t.task_id != query.task_id)
            .map(|t| {
                let content = t.result.content.clone();
                let token_count = counter.count(&content);
                ContextComponent {
                    source_name: self.source_name().to_string(),
                    role: Role::Assistant,
                    content,
                    priority: priority::MEDIUM,
                    token_count,
                    strategy: OverflowStrategy::Truncate,
                    placement: Placement::History,
                    metadata: serde_json::json!({ "task_id": t.task_id }),
                }
            })
            .collect();
        take_within_budget(components, token_budget)
    }
}

// ---------------------------------------------------------------------------
// MemoryTierSource
// ---------------------------------------------------------------------------

/// Which tier a [`MemoryTierSource`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSelection {
    /// L1 recent tasks (HIGH priority).
    Recent,
    /// L2 important tasks (HIGH priority).
    Important,
    /// L3 session tasks (MEDIUM priority).
    Session,
    /// L4 semantic retrieval (ESSENTIAL priority, RAG placement).
    Semantic,
}

/// Context from one memory tier.
pub struct MemoryTierSource {
    tiers: Arc<MemoryTierStore>,
    selection: TierSelection,
    limit: usize,
}

impl MemoryTierSource {
    /// Create a source over one tier (default limit: 10 items).
    pub fn new(tiers: Arc<MemoryTierStore>, selection: TierSelection) -> Self {
        Self {
            tiers,
            selection,
            limit: 10,
        }
    }

    /// Override the per-assembly item limit (builder pattern).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn render_task(task: &Task) -> String {
        if task.result.content.is_empty() {
            task.content().to_string()
        } else {
            format!("{} -> {}", task.content(), task.result.content)
        }
    }
}

#[async_trait]
impl ContextSource for MemoryTierSource {
    fn source_name(&self) -> &str {
        match self.selection {
            TierSelection::Recent => "memory_l1",
            TierSelection::Important => "memory_l2",
            TierSelection::Session => "memory_l3",
            TierSelection::Semantic => "memory_l4",
        }
    }

    async fn collect(
        &self,
        query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        let session = query.session_id.as_deref();

        let components: Vec<ContextComponent> = match self.selection {
            TierSelection::Semantic => {
                let hits = self.tiers.semantic_search(&query.content, self.limit).await;
                hits.into_iter()
                    .map(|hit| {
                        let token_count = counter.count(&hit.entry.text);
                        ContextComponent {
                            source_name: self.source_name().to_string(),
                            role: Role::System,
                            content: hit.entry.text,
                            priority: priority::ESSENTIAL,
                            token_count,
                            strategy: OverflowStrategy::Drop,
                            placement: Placement::Rag,
                            metadata: serde_json::json!({ "score": hit.score }),
                        }
                    })
                    .collect()
            }
            selection => {
                let (tasks, item_priority) = match selection {
                    TierSelection::Recent => {
                        (self.tiers.get_l1_tasks(self.limit, session), priority::HIGH)
                    }
                    TierSelection::Important => {
                        (self.tiers.get_l2_tasks(self.limit, session), priority::HIGH)
                    }
                    TierSelection::Session => (
                        session
                            .map(|s| self.tiers.get_l3_tasks(s, self.limit))
                            .unwrap_or_default(),
                        priority::MEDIUM,
                    ),
                    TierSelection::Semantic => unreachable!(),
                };
                tasks
                    .into_iter()
                    .filter(|t| t.task_id != query.task_id)
                    .enumerate()
                    .map(|(i, task)| {
                        let content = Self::render_task(&task);
                        let token_count = counter.count(&content);
                        // Stratify by recency: older entries fall a band.
                        let priority = if i < 3 { item_priority } else { priority::LOW };
                        ContextComponent {
                            source_name: self.source_name().to_string(),
                            role: Role::Assistant,
                            content,
                            priority,
                            token_count,
                            strategy: OverflowStrategy::Truncate,
                            placement: Placement::History,
                            metadata: serde_json::json!({ "task_id": task.task_id }),
                        }
                    })
                    .collect()
            }
        };

        take_within_budget(components, token_budget)
    }
}

// ---------------------------------------------------------------------------
// KnowledgeSource
// ---------------------------------------------------------------------------

/// External RAG snippets; falls back to empty on provider failure.
pub struct KnowledgeSource {
    knowledge: Arc<dyn KnowledgeBase>,
    top_k: usize,
    relevance_threshold: f32,
}

impl KnowledgeSource {
    /// Create a source over a knowledge backend (default: top 3 documents
    /// at relevance ≥ 0.3).
    pub fn new(knowledge: Arc<dyn KnowledgeBase>) -> Self {
        Self {
            knowledge,
            top_k: 3,
            relevance_threshold: 0.3,
        }
    }

    /// Override retrieval depth (builder pattern).
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

#[async_trait]
impl ContextSource for KnowledgeSource {
    fn source_name(&self) -> &str {
        "knowledge"
    }

    async fn collect(
        &self,
        query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        let documents = match self
            .knowledge
            .retrieve(&query.content, self.top_k, self.relevance_threshold)
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                debug!("knowledge retrieval failed, continuing without: {}", e);
                return Vec::new();
            }
        };

        let components: Vec<ContextComponent> = documents
            .into_iter()
            .map(|doc| {
                let token_count = counter.count(&doc.content);
                ContextComponent {
                    source_name: self.source_name().to_string(),
                    role: Role::System,
                    content: doc.content,
                    priority: priority::ESSENTIAL,
                    token_count,
                    strategy: OverflowStrategy::Drop,
                    placement: Placement::Rag,
                    metadata: serde_json::json!({
                        "document_id": doc.id,
                        "relevance": doc.relevance,
                    }),
                }
            })
            .collect();
        take_within_budget(components, token_budget)
    }
}

// ---------------------------------------------------------------------------
// PromptSource
// ---------------------------------------------------------------------------

/// The three-layer system prompt: user-provided instructions, activated
/// skill instructions, and the framework's autonomy layer.
pub struct PromptSource {
    base_prompt: String,
    skill_instructions: Arc<RwLock<Vec<String>>>,
    autonomy_notes: bool,
}

/// Framework autonomy layer appended to every system prompt.
const AUTONOMY_INSTRUCTIONS: &str = "\
Work in reason-act cycles: think about the request, call tools when they \
help, observe their results, and continue until the task is done. \
When you have the final answer, call the `done` tool with the result. \
For multi-step work, `create_plan` lays out ordered sub-tasks; \
`delegate_task` hands an independent sub-task to a child agent.";

impl PromptSource {
    /// Create a prompt source with a user-provided base prompt.
    pub fn new(base_prompt: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
            skill_instructions: Arc::new(RwLock::new(Vec::new())),
            autonomy_notes: true,
        }
    }

    /// Disable the framework autonomy layer (builder pattern).
    pub fn without_autonomy_notes(mut self) -> Self {
        self.autonomy_notes = false;
        self
    }

    /// Handle through which the skill activator injects instructions.
    pub fn skill_instructions(&self) -> Arc<RwLock<Vec<String>>> {
        Arc::clone(&self.skill_instructions)
    }

    /// Render the composed prompt (all three layers).
    pub async fn compose(&self) -> String {
        let mut prompt = self.base_prompt.clone();
        let skills = self.skill_instructions.read().await;
        for instructions in skills.iter() {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(instructions);
        }
        if self.autonomy_notes {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(AUTONOMY_INSTRUCTIONS);
        }
        prompt
    }
}

#[async_trait]
impl ContextSource for PromptSource {
    fn source_name(&self) -> &str {
        "prompt"
    }

    async fn collect(
        &self,
        _query: &ContextQuery,
        _token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        let content = self.compose().await;
        if content.is_empty() {
            return Vec::new();
        }
        let token_count = counter.count(&content);
        vec![ContextComponent {
            source_name: self.source_name().to_string(),
            role: Role::System,
            content,
            priority: priority::CRITICAL,
            token_count,
            strategy: OverflowStrategy::Keep,
            placement: Placement::System,
            metadata: JsonValue::Null,
        }]
    }
}

// ---------------------------------------------------------------------------
// ToolSource
// ---------------------------------------------------------------------------

/// Renders the available tool list into the prompt, pruning descriptions
/// to fit the budget.
pub struct ToolSource {
    registry: Arc<RwLock<ToolRegistry>>,
}

impl ToolSource {
    /// Create a source over the shared tool registry.
    pub fn new(registry: Arc<RwLock<ToolRegistry>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ContextSource for ToolSource {
    fn source_name(&self) -> &str {
        "tools"
    }

    async fn collect(
        &self,
        _query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        let registry = self.registry.read().await;
        let tools = registry.list_tools();
        if tools.is_empty() {
            return Vec::new();
        }

        // Full rendering first; prune to name-only lines if over budget.
        let full: String = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n");
        let content = if counter.count(&full) <= token_budget {
            full
        } else {
            tools
                .iter()
                .map(|t| format!("- {}", t.name))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let content = format!("Available tools:\n{}", content);
        let token_count = counter.count(&content);
        if token_count > token_budget {
            return Vec::new();
        }
        vec![ContextComponent {
            source_name: self.source_name().to_string(),
            role: Role::System,
            content,
            priority: priority::HIGH,
            token_count,
            strategy: OverflowStrategy::Truncate,
            placement: Placement::System,
            metadata: JsonValue::Null,
        }]
    }
}

// ---------------------------------------------------------------------------
// SkillSource
// ---------------------------------------------------------------------------

/// Instructions of skills activated for the current task.
pub struct SkillSource {
    active: Arc<RwLock<Vec<(String, String, u8)>>>,
}

impl SkillSource {
    /// Create an empty skill source; the activator pushes entries of
    /// `(skill_name, instructions, priority)`.
    pub fn new() -> Self {
        Self {
            active: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Handle through which the skill activator records activations.
    pub fn active_skills(&self) -> Arc<RwLock<Vec<(String, String, u8)>>> {
        Arc::clone(&self.active)
    }
}

impl Default for SkillSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextSource for SkillSource {
    fn source_name(&self) -> &str {
        "skills"
    }

    async fn collect(
        &self,
        _query: &ContextQuery,
        token_budget: usize,
        counter: &ContextCounter,
    ) -> Vec<ContextComponent> {
        let active = self.active.read().await;
        let components: Vec<ContextComponent> = active
            .iter()
            .map(|(name, instructions, skill_priority)| {
                let token_count = counter.count(instructions);
                ContextComponent {
                    source_name: self.source_name().to_string(),
                    role: Role::System,
                    content: instructions.clone(),
                    priority: (*skill_priority).clamp(priority::MEDIUM, priority::HIGH),
                    token_count,
                    strategy: OverflowStrategy::Truncate,
                    placement: Placement::System,
                    metadata: serde_json::json!({ "skill": name }),
                }
            })
            .collect();
        take_within_budget(components, token_budget)
    }
}
