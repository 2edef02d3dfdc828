//! Priority- and budget-driven context assembly.
//!
//! The [`ContextOrchestrator`] builds the LLM's input for one loop
//! iteration from the registered [`ContextSource`]s, within the agent's
//! token budget:
//!
//! 1. The composed system prompt is collected first and its token cost is
//!    subtracted from `max_context_tokens`. If the prompt alone doesn't
//!    fit, assembly fails with `BudgetTooSmall` — the only hard failure.
//! 2. An output reserve (`output_reserve_ratio`, default 10%) is set aside
//!    for the model's reply.
//! 3. The remaining budget is split across sources by configured ratios,
//!    in allocation order, with unused budget rolling over to the next
//!    source.
//! 4. Collected components are session-filtered and deduplicated by
//!    originating task id.
//! 5. Messages are emitted in strict priority order with **primacy
//!    placement**: system prompt first, then retrieved knowledge (RAG and
//!    L4 hits, ESSENTIAL priority) *before any session history*, then
//!    history by priority and recency, and the current user input last.
//!    Mid-context information is empirically discounted by LLMs, so
//!    retrieved knowledge is pinned to the primacy position.
//! 6. If the assembly still exceeds the budget, components are dropped
//!    bottom-up by priority and then shrunk according to their declared
//!    overflow strategy.
//!
//! Provider failures inside sources never fail the assembly — the result
//! is best-effort.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::context_orchestrator::{ContextConfig, ContextOrchestrator};
//! use agentmesh::context_source::{ContextCounter, PromptSource, UserInputSource};
//! use agentmesh::task::{Task, TaskAction};
//! use agentmesh::token_counter::TokenCounter;
//! use std::sync::Arc;
//!
//! # async {
//! let counter = ContextCounter::new(Arc::new(TokenCounter::with_default_heuristic()), "m");
//! let orchestrator = ContextOrchestrator::new(
//!     Arc::new(PromptSource::new("You are helpful.")),
//!     vec![Arc::new(UserInputSource)],
//!     counter,
//!     ContextConfig::default(),
//! );
//! let task = Task::new(TaskAction::Execute, "hello");
//! let messages = orchestrator.build_context(&task, 0).await.unwrap();
//! assert_eq!(messages.len(), 2); // system + user
//! # };
//! ```

use crate::agentmesh::client_wrapper::Message;
use crate::agentmesh::context_source::{
    ContextComponent, ContextCounter, ContextQuery, ContextSource, OverflowStrategy, Placement,
    PromptSource,
};
use crate::agentmesh::error::AgentError;
use crate::agentmesh::task::Task;
use log::{debug, trace};
use std::collections::HashSet;
use std::sync::Arc;

/// Budget configuration for context assembly.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Total window available to the assembly, in tokens.
    pub max_context_tokens: usize,
    /// Fraction of the window reserved for the LLM's reply.
    pub output_reserve_ratio: f64,
    /// Per-source budget shares, consulted in allocation order. Sources
    /// not listed get the `default_ratio` share.
    pub ratios: Vec<(String, f64)>,
    /// Share for sources missing from `ratios`.
    pub default_ratio: f64,
}

impl Default for ContextConfig {
    /// The stock allocation: tools 15%, user 12%, L1 18%, L2 12%, L4 6%,
    /// RAG 10%, skills 10%, agent output 5% — heuristic shares, tunable
    /// per model. The ordering guarantees are enforced regardless.
    fn default() -> Self {
        Self {
            max_context_tokens: 8_000,
            output_reserve_ratio: 0.10,
            ratios: vec![
                ("user_input".to_string(), 0.12),
                ("tools".to_string(), 0.15),
                ("skills".to_string(), 0.10),
                ("memory_l1".to_string(), 0.18),
                ("memory_l2".to_string(), 0.12),
                ("memory_l4".to_string(), 0.06),
                ("knowledge".to_string(), 0.10),
                ("agent_output".to_string(), 0.05),
            ],
            default_ratio: 0.05,
        }
    }
}

impl ContextConfig {
    fn ratio_for(&self, source_name: &str) -> f64 {
        self.ratios
            .iter()
            .find(|(name, _)| name == source_name)
            .map(|(_, ratio)| *ratio)
            .unwrap_or(self.default_ratio)
    }
}

/// Assembles the per-iteration message list from the registered sources.
pub struct ContextOrchestrator {
    prompt: Arc<PromptSource>,
    sources: Vec<Arc<dyn ContextSource>>,
    counter: ContextCounter,
    config: ContextConfig,
    /// Short-lived snippets pinned for the next assembly only.
    ephemeral: tokio::sync::RwLock<Vec<String>>,
}

impl ContextOrchestrator {
    /// Create an orchestrator over a prompt source and the remaining
    /// sources in allocation order.
    pub fn new(
        prompt: Arc<PromptSource>,
        sources: Vec<Arc<dyn ContextSource>>,
        counter: ContextCounter,
        config: ContextConfig,
    ) -> Self {
        Self {
            prompt,
            sources,
            counter,
            config,
            ephemeral: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    /// Pin a snippet into the next assembly only.
    ///
    /// Ephemeral entries render as high-priority system messages right
    /// after the composed prompt and are drained when the assembly runs.
    pub async fn add_ephemeral(&self, text: impl Into<String>) {
        self.ephemeral.write().await.push(text.into());
    }

    /// Discard any pinned ephemeral snippets without assembling.
    pub async fn clear_ephemeral(&self) {
        self.ephemeral.write().await.clear();
    }

    /// Borrow the prompt source (for skill-instruction injection).
    pub fn prompt_source(&self) -> &Arc<PromptSource> {
        &self.prompt
    }

    /// Borrow the bound counter.
    pub fn counter(&self) -> &ContextCounter {
        &self.counter
    }

    /// The configured context budget.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the message list for `task` at loop `iteration`.
    ///
    /// Returns a best-effort list even when individual sources fail; the
    /// only hard error is [`AgentError::BudgetTooSmall`] when the system
    /// prompt alone exceeds the window.
    pub async fn build_context(
        &self,
        task: &Task,
        iteration: usize,
    ) -> Result<Vec<Message>, AgentError> {
        let query = ContextQuery::from_task(task, iteration);

        // Step 1: the system prompt is non-negotiable; measure it first.
        let system_components = self
            .prompt
            .collect(&query, self.config.max_context_tokens, &self.counter)
            .await;
        let system_tokens: usize = system_components.iter().map(|c| c.token_count).sum();
        if system_tokens > self.config.max_context_tokens {
            return Err(AgentError::BudgetTooSmall {
                needed: system_tokens,
                available: self.config.max_context_tokens,
            });
        }

        // Step 2: reserve headroom for the reply.
        let reserve =
            (self.config.max_context_tokens as f64 * self.config.output_reserve_ratio) as usize;
        let assembly_limit = self.config.max_context_tokens.saturating_sub(reserve);
        let mut available = assembly_limit.saturating_sub(system_tokens);

        let mut components: Vec<ContextComponent> = system_components;

        // Pinned ephemeral snippets ride along once, then are drained.
        let pinned: Vec<String> = self.ephemeral.write().await.drain(..).collect();
        for text in pinned {
            let token_count = self.counter.count(&text);
            available = available.saturating_sub(token_count.min(available));
            components.push(ContextComponent {
                source_name: "ephemeral".to_string(),
                role: crate::agentmesh::client_wrapper::Role::System,
                content: text,
                priority: crate::agentmesh::context_source::priority::HIGH,
                token_count,
                strategy: OverflowStrategy::Drop,
                placement: Placement::System,
                metadata: serde_json::Value::Null,
            });
        }

        // Step 3: ratio allocation with roll-over, in registration order.
        let total_ratio: f64 = self
            .sources
            .iter()
            .map(|s| self.config.ratio_for(s.source_name()))
            .sum();
        let mut rollover = 0usize;
        for source in &self.sources {
            let share = if total_ratio > 0.0 {
                self.config.ratio_for(source.source_name()) / total_ratio
            } else {
                1.0 / self.sources.len().max(1) as f64
            };
            let budget = ((available as f64 * share) as usize).saturating_add(rollover);
            let collected = source.collect(&query, budget, &self.counter).await;
            let spent: usize = collected.iter().map(|c| c.token_count).sum();
            trace!(
                "source '{}' spent {}/{} tokens ({} components)",
                source.source_name(),
                spent,
                budget,
                collected.len()
            );
            rollover = budget.saturating_sub(spent);
            available = available.saturating_sub(spent.min(available));
            components.extend(collected);
        }

        // Step 4: dedup by originating task id (higher-priority first wins).
        components = Self::dedup_by_task(components);

        // Step 5: strict ordering with primacy placement.
        let mut ordered = Self::order(components);

        // Step 6: enforce the assembly limit bottom-up.
        self.enforce_budget(&mut ordered, assembly_limit);

        Ok(ordered
            .into_iter()
            .map(|c| Message::text(c.role, c.content))
            .collect())
    }

    fn dedup_by_task(components: Vec<ContextComponent>) -> Vec<ContextComponent> {
        // Consider higher-priority copies first so they win the slot.
        let mut indexed: Vec<(usize, ContextComponent)> =
            components.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.cmp(&b.0)));

        let mut seen: HashSet<String> = HashSet::new();
        let mut kept: Vec<(usize, ContextComponent)> = Vec::new();
        for (index, component) in indexed {
            if let Some(task_id) = component.task_id() {
                if !seen.insert(task_id.to_string()) {
                    continue;
                }
            }
            kept.push((index, component));
        }
        kept.sort_by_key(|(index, _)| *index);
        kept.into_iter().map(|(_, c)| c).collect()
    }

    /// System prompt → RAG → history (priority desc, recency-stable) →
    /// current user input.
    fn order(components: Vec<ContextComponent>) -> Vec<ContextComponent> {
        let mut system = Vec::new();
        let mut rag = Vec::new();
        let mut history = Vec::new();
        let mut user = Vec::new();

        for component in components {
            match component.placement {
                Placement::System => system.push(component),
                Placement::Rag => rag.push(component),
                Placement::History => history.push(component),
                Placement::UserInput => user.push(component),
            }
        }

        // Stable by priority so same-priority items keep recency order.
        history.sort_by(|a, b| b.priority.cmp(&a.priority));
        rag.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut ordered = system;
        ordered.extend(rag);
        ordered.extend(history);
        ordered.extend(user);
        ordered
    }

    fn enforce_budget(&self, components: &mut Vec<ContextComponent>, limit: usize) {
        let total = |components: &Vec<ContextComponent>| -> usize {
            components.iter().map(|c| c.token_count).sum()
        };

        // Pass 1: drop bottom-up by priority.
        while total(components) > limit {
            let victim = components
                .iter()
                .enumerate()
                .filter(|(_, c)| c.strategy != OverflowStrategy::Keep)
                .min_by_key(|(_, c)| c.priority)
                .map(|(i, _)| i);
            let victim = match victim {
                Some(i) => i,
                None => break,
            };

            let over = total(components) - limit;
            let component = &mut components[victim];
            match component.strategy {
                OverflowStrategy::Drop => {
                    debug!(
                        "dropping '{}' component ({} tokens) to fit budget",
                        component.source_name, component.token_count
                    );
                    components.remove(victim);
                }
                OverflowStrategy::Truncate | OverflowStrategy::Summarize => {
                    if component.token_count <= over {
                        components.remove(victim);
                    } else {
                        let keep_tokens = component.token_count - over;
                        let keep_chars = keep_tokens.saturating_mul(4);
                        let mut cut = keep_chars.min(component.content.len());
                        while cut > 0 && !component.content.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        component.content.truncate(cut);
                        component.token_count = self.counter.count(&component.content);
                        if component.content.is_empty() {
                            components.remove(victim);
                        }
                    }
                }
                OverflowStrategy::Keep => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::client_wrapper::Role;
    use crate::agentmesh::context_source::{
        priority, KnowledgeSource, MemoryTierSource, TierSelection, UserInputSource,
    };
    use crate::agentmesh::memory_tiers::MemoryTierStore;
    use crate::agentmesh::providers::StaticKnowledgeBase;
    use crate::agentmesh::task::{TaskAction, TaskStatus};
    use crate::agentmesh::token_counter::TokenCounter;

    fn counter() -> ContextCounter {
        ContextCounter::new(Arc::new(TokenCounter::with_default_heuristic()), "m")
    }

    fn orchestrator_with(
        prompt: &str,
        sources: Vec<Arc<dyn ContextSource>>,
        max_tokens: usize,
    ) -> ContextOrchestrator {
        ContextOrchestrator::new(
            Arc::new(PromptSource::new(prompt)),
            sources,
            counter(),
            ContextConfig {
                max_context_tokens: max_tokens,
                ..ContextConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_system_then_user() {
        let orchestrator =
            orchestrator_with("You are helpful.", vec![Arc::new(UserInputSource)], 8_000);
        let task = Task::new(TaskAction::Execute, "hello there");
        let messages = orchestrator.build_context(&task, 0).await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "hello there");
    }

    #[tokio::test]
    async fn test_budget_too_small() {
        let huge_prompt = "word ".repeat(10_000);
        let orchestrator = orchestrator_with(&huge_prompt, vec![Arc::new(UserInputSource)], 100);
        let task = Task::new(TaskAction::Execute, "hi");
        let err = orchestrator.build_context(&task, 0).await.unwrap_err();
        assert!(matches!(err, AgentError::BudgetTooSmall { .. }));
    }

    #[tokio::test]
    async fn test_rag_primacy_over_history() {
        // Session history in L1 plus a knowledge hit: the knowledge
        // snippet must precede every history message.
        let tiers = Arc::new(MemoryTierStore::new(50, 100, 500));
        for i in 0..10 {
            let mut task = Task::new(TaskAction::Execute, format!("history item {}", i))
                .with_session("s1");
            task.transition(TaskStatus::Running);
            task.complete(format!("history result {}", i));
            tiers.add_task(task);
        }
        let kb = StaticKnowledgeBase::new(vec![(
            "doc1".into(),
            "retrieved knowledge about indexing".into(),
        )]);

        let sources: Vec<Arc<dyn ContextSource>> = vec![
            Arc::new(MemoryTierSource::new(Arc::clone(&tiers), TierSelection::Recent)),
            Arc::new(KnowledgeSource::new(Arc::new(kb))),
            Arc::new(UserInputSource),
        ];
        let orchestrator = orchestrator_with("system prompt", sources, 8_000);

        let task = Task::new(TaskAction::Execute, "indexing knowledge").with_session("s1");
        let messages = orchestrator.build_context(&task, 0).await.unwrap();

        let rag_position = messages
            .iter()
            .position(|m| m.content.contains("retrieved knowledge"))
            .expect("rag message present");
        let first_history = messages
            .iter()
            .position(|m| m.content.contains("history"))
            .expect("history present");
        assert_eq!(rag_position, 1, "RAG sits immediately after the system prompt");
        assert!(rag_position < first_history);
    }

    #[tokio::test]
    async fn test_dedup_by_task_id() {
        // The same task visible in L1 and L2 must appear once.
        let tiers = Arc::new(MemoryTierStore::new(50, 100, 500));
        let mut task = Task::new(TaskAction::Execute, "dup task").with_importance(0.9);
        task.transition(TaskStatus::Running);
        task.complete("dup result");
        tiers.add_task(task);

        let sources: Vec<Arc<dyn ContextSource>> = vec![
            Arc::new(MemoryTierSource::new(Arc::clone(&tiers), TierSelection::Recent)),
            Arc::new(MemoryTierSource::new(Arc::clone(&tiers), TierSelection::Recent)),
        ];
        let orchestrator = orchestrator_with("p", sources, 8_000);
        let messages = orchestrator
            .build_context(&Task::new(TaskAction::Execute, "q"), 0)
            .await
            .unwrap();

        let duplicates = messages
            .iter()
            .filter(|m| m.content.contains("dup result"))
            .count();
        assert_eq!(duplicates, 1);
    }

    #[tokio::test]
    async fn test_ephemeral_pinned_for_one_assembly() {
        let orchestrator =
            orchestrator_with("base prompt", vec![Arc::new(UserInputSource)], 8_000);
        orchestrator.add_ephemeral("pinned reminder text").await;

        let task = Task::new(TaskAction::Execute, "q");
        let first = orchestrator.build_context(&task, 0).await.unwrap();
        assert!(first.iter().any(|m| m.content.contains("pinned reminder")));

        // Drained after one assembly.
        let second = orchestrator.build_context(&task, 1).await.unwrap();
        assert!(!second.iter().any(|m| m.content.contains("pinned reminder")));
    }

    #[tokio::test]
    async fn test_overflow_drops_lowest_priority() {
        let mut components = vec![
            ContextComponent {
                source_name: "a".into(),
                role: Role::System,
                content: "keep me".into(),
                priority: priority::CRITICAL,
                token_count: 50,
                strategy: OverflowStrategy::Keep,
                placement: Placement::System,
                metadata: serde_json::Value::Null,
            },
            ContextComponent {
                source_name: "b".into(),
                role: Role::Assistant,
                content: "drop me".into(),
                priority: priority::LOW,
                token_count: 60,
                strategy: OverflowStrategy::Drop,
                placement: Placement::History,
                metadata: serde_json::Value::Null,
            },
        ];
        let orchestrator = orchestrator_with("p", vec![], 8_000);
        orchestrator.enforce_budget(&mut components, 80);

        assert_eq!(components.len(), 1);
        assert_eq!(components[0].content, "keep me");
    }

    #[tokio::test]
    async fn test_overflow_truncates_when_droppables_exhausted() {
        let mut components = vec![ContextComponent {
            source_name: "h".into(),
            role: Role::Assistant,
            content: "w".repeat(400),
            priority: priority::MEDIUM,
            token_count: 100,
            strategy: OverflowStrategy::Truncate,
            placement: Placement::History,
            metadata: serde_json::Value::Null,
        }];
        let orchestrator = orchestrator_with("p", vec![], 8_000);
        orchestrator.enforce_budget(&mut components, 40);

        assert_eq!(components.len(), 1);
        assert!(components[0].token_count <= 40);
    }
}
