//! Delegation and fractal composition.
//!
//! Delegation spawns a child agent for a sub-task. The child is a smaller
//! copy of its parent — same bus, same tool and skill registries, same
//! shared budget — with its own scoped memory (chained to the parent's),
//! its own memory tiers, and its own conversation state. Children can
//! delegate further, bounded by `max_recursion_depth` and the shared
//! budget, giving the system its fractal shape.
//!
//! The delegation sequence:
//!
//! 1. Depth check (`DepthLimitExceeded`) and budget check
//!    (`BudgetExceeded`).
//! 2. A child [`Task`] is derived from the current one (same session and
//!    trace, `parent_task_id` set, depth + 1).
//! 3. A child [`ScopedMemory`] is chained to the parent's, seeded with
//!    inherited projections of parent `shared`/`global` entries matching
//!    the `context_hints` (top-k by recency).
//! 4. The child agent runs its loop to completion; `task.delegate` and
//!    `task.accept` events bracket the hand-off.
//! 5. The child's `shared` entries merge back into the parent's shared
//!    scope (version-aware, parent's newer entries win).
//! 6. The child result's content is returned as a string.
//!
//! Child events interleave with siblings on the bus but stay monotonic per
//! child; consumers reconstruct per-agent order via `span_id`.

use crate::agentmesh::agent::{Agent, AgentSetup};
use crate::agentmesh::config::AgentConfig;
use crate::agentmesh::error::AgentError;
use crate::agentmesh::event::EventType;
use crate::agentmesh::scoped_memory::ScopedMemory;
use crate::agentmesh::skill::InstantiatedNode;
use crate::agentmesh::task::{Task, TaskAction, TaskStatus};
use log::{debug, info};
use std::sync::Arc;
use uuid::Uuid;

/// How many inherited projections a hint seed takes, per delegation.
const HINT_SEED_TOP_K: usize = 8;

impl Agent {
    /// Delegate a sub-task to a freshly spawned child agent.
    ///
    /// `required_capabilities` select a Form-3 instantiated node template
    /// when one matches (by skill name); otherwise a general child is
    /// spawned with the parent's configuration. `context_hints` pick which
    /// parent `shared`/`global` entries the child sees as `inherited`
    /// projections.
    ///
    /// Returns the child result's content. Fails with
    /// [`AgentError::DepthLimitExceeded`] past the recursion limit,
    /// [`AgentError::BudgetExceeded`] when the shared budget is spent, and
    /// [`AgentError::TaskFailed`] when the child terminates unsuccessfully
    /// — all of which the loop reports back to the LLM as tool errors.
    pub async fn delegate(
        &self,
        current_task: &Task,
        description: &str,
        required_capabilities: &[String],
        context_hints: &[String],
    ) -> Result<String, AgentError> {
        if self.depth >= self.config.max_recursion_depth {
            return Err(AgentError::DepthLimitExceeded {
                depth: self.depth + 1,
                limit: self.config.max_recursion_depth,
            });
        }
        if self.budget.is_exhausted() {
            return Err(AgentError::BudgetExceeded {
                requested: 1,
                remaining: 0,
            });
        }

        let template = {
            let nodes = self.instantiated.read().await;
            required_capabilities
                .iter()
                .find_map(|capability| {
                    nodes
                        .iter()
                        .find(|n| &n.skill == capability)
                        .cloned()
                })
        };

        // A matching template specializes the child through all four
        // inheritance channels; a plain delegation changes nothing.
        let spec = template.unwrap_or_else(|| InstantiatedNode {
            node_id: format!("{}-sub-{}", self.id, &Uuid::new_v4().to_string()[..8]),
            skill: String::new(),
            system_prompt: String::new(),
            add_skills: Vec::new(),
            remove_skills: Vec::new(),
            add_tools: Vec::new(),
            remove_tools: Vec::new(),
        });
        let child_id = spec.node_id.clone();

        let mut child_task = current_task.child(TaskAction::Delegate, description);
        child_task.target_agent = child_id.clone();

        self.publish_task_event(
            EventType::TaskDelegate,
            &child_task,
            serde_json::json!({
                "parent_task_id": current_task.task_id,
                "child_node": child_id,
                "description": description,
            }),
        )
        .await;

        let child = self.spawn_child(&child_id, &spec).await;
        child
            .memory()
            .seed_from_parent(context_hints, HINT_SEED_TOP_K)
            .await;

        child
            .publish_task_event(EventType::TaskAccept, &child_task, serde_json::Value::Null)
            .await;
        info!(
            "[{}] delegated '{}' to {} (depth {})",
            self.id,
            description,
            child_id,
            self.depth + 1
        );

        let finished = child.run_boxed(child_task).await;

        // Termination-time merge of the child's shared scope.
        let adopted = self
            .memory
            .merge_shared(child.memory().snapshot_shared().await)
            .await;
        debug!(
            "[{}] merged {} shared entries from {}",
            self.id, adopted, child_id
        );

        match finished.status {
            TaskStatus::Completed => Ok(finished.result.content),
            TaskStatus::Cancelled => Err(AgentError::Cancelled),
            _ => {
                let message = finished
                    .result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "delegated task failed".to_string());
                Err(AgentError::TaskFailed(message))
            }
        }
    }

    /// Build a child agent one level deeper from a node specification.
    ///
    /// Inherited: skill registry, tool registry, compile protocol, event
    /// bus, budget, counter, knowledge backend, client. Independent:
    /// scoped memory (chained to the parent's), memory tiers,
    /// conversation state, active skill set. The spec's four channels
    /// apply the full `(parent ∪ add) \ remove` configuration algebra.
    pub(crate) async fn spawn_child(&self, child_id: &str, spec: &InstantiatedNode) -> Agent {
        let child_config = AgentConfig::inherit(
            &self.config,
            &spec.add_skills,
            &spec.remove_skills,
            &spec.add_tools,
            &spec.remove_tools,
        );

        let setup = AgentSetup {
            config: child_config,
            bus: Some(Arc::clone(&self.bus)),
            tools: Some(Arc::clone(&self.tools)),
            compile_protocol: Some(Arc::clone(&self.compile_protocol)),
            skills: Some(Arc::clone(&self.skills)),
            budget: Some(self.budget.clone()),
            counter: Some(Arc::clone(&self.counter)),
            knowledge: self.knowledge.clone(),
            system_prompt: spec.system_prompt.clone(),
            discovery_client: None,
        };

        setup
            .build_at_depth(
                child_id,
                Arc::clone(&self.client),
                self.depth + 1,
                Some(&self.memory),
            )
            .await
    }

    /// Direct access to child scoped-memory chaining, used by tests and by
    /// embedders that manage their own child agents.
    pub fn child_memory(&self, child_id: &str) -> Arc<ScopedMemory> {
        ScopedMemory::child_of(&self.memory, child_id)
    }
}
