//! Per-agent configuration and inheritance.
//!
//! [`AgentConfig`] is the bag of capabilities and limits attached to each
//! agent: which skills and tools are enabled, how many loop iterations and
//! delegation levels are allowed, and how the context window is budgeted.
//!
//! Child agents created through delegation derive their configuration with
//! [`AgentConfig::inherit`]: the child's skill set is
//! `(parent.enabled_skills ∪ add) \ remove`, the tool sets follow the same
//! pattern, and the activation mode and limits are inherited as-is.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::config::{AgentConfig, SkillActivationMode};
//!
//! let parent = AgentConfig::default()
//!     .with_skill("research")
//!     .with_skill("summarize");
//!
//! let child = AgentConfig::inherit(
//!     &parent,
//!     &["cite".to_string()],        // add skills
//!     &["summarize".to_string()],   // remove skills
//!     &[],                          // add tools
//!     &[],                          // remove tools
//! );
//!
//! assert!(child.enabled_skills.contains("research"));
//! assert!(child.enabled_skills.contains("cite"));
//! assert!(!child.enabled_skills.contains("summarize"));
//! assert_eq!(child.skill_activation_mode, parent.skill_activation_mode);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How skills are discovered and activated for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillActivationMode {
    /// Rule-based candidate generation, optionally LLM-filtered.
    Hybrid,
    /// Only skills explicitly listed in `enabled_skills` are activated.
    Explicit,
    /// LLM-driven discovery only (falls back to rules without a client).
    Auto,
}

/// Per-agent capability and limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Skills the agent may activate.
    pub enabled_skills: HashSet<String>,
    /// Skills explicitly blocked even if discovered.
    pub disabled_skills: HashSet<String>,
    /// Tools granted beyond the shared registry defaults.
    pub extra_tools: HashSet<String>,
    /// Tools withheld from this agent.
    pub disabled_tools: HashSet<String>,
    /// Skill discovery/activation mode.
    pub skill_activation_mode: SkillActivationMode,
    /// Maximum reason-act iterations per task.
    pub max_iterations: usize,
    /// Maximum delegation depth below this agent's root task.
    pub max_recursion_depth: usize,
    /// Total context window available to the orchestrator, in tokens.
    pub max_context_tokens: usize,
    /// Fraction of the window reserved for the LLM's reply.
    pub output_reserve_ratio: f64,
    /// L1 (recent) tier capacity.
    pub max_l1_size: usize,
    /// L2 (important) tier capacity.
    pub max_l2_size: usize,
    /// L3 (session) tier capacity.
    pub max_l3_size: usize,
    /// Importance above which an L1 eviction promotes into L2.
    pub importance_promote_threshold: f64,
    /// Concurrency cap for read-only tool batches.
    pub tool_concurrency_limit: usize,
    /// Per-LLM-call deadline in seconds.
    pub llm_timeout_s: u64,
    /// Per-tool-call deadline in seconds.
    pub tool_timeout_s: u64,
    /// Event bus retention cap.
    pub bus_history_cap: usize,
    /// Retries for transient LLM failures within one iteration.
    pub max_retries: usize,
    /// Whether the LLM must call `done` to finish (vs. plain text answers).
    pub require_done_tool: bool,
    /// Run the post-completion self-evaluation call.
    pub self_evaluation: bool,
    /// Model identifier handed to the token counter.
    pub model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled_skills: HashSet::new(),
            disabled_skills: HashSet::new(),
            extra_tools: HashSet::new(),
            disabled_tools: HashSet::new(),
            skill_activation_mode: SkillActivationMode::Hybrid,
            max_iterations: 10,
            max_recursion_depth: 5,
            max_context_tokens: 8_000,
            output_reserve_ratio: 0.10,
            max_l1_size: 50,
            max_l2_size: 100,
            max_l3_size: 500,
            importance_promote_threshold: 0.6,
            tool_concurrency_limit: 10,
            llm_timeout_s: 60,
            tool_timeout_s: 120,
            bus_history_cap: 1_000,
            max_retries: 1,
            require_done_tool: false,
            self_evaluation: false,
            model: "default".to_string(),
        }
    }
}

impl AgentConfig {
    /// Enable a skill (builder pattern).
    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.enabled_skills.insert(skill.into());
        self
    }

    /// Grant an extra tool (builder pattern).
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.extra_tools.insert(tool.into());
        self
    }

    /// Override the iteration cap (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Override the delegation depth cap (builder pattern).
    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Override the context window size (builder pattern).
    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    /// Select the skill activation mode (builder pattern).
    pub fn with_skill_activation_mode(mut self, mode: SkillActivationMode) -> Self {
        self.skill_activation_mode = mode;
        self
    }

    /// Whether a tool is usable under this configuration.
    pub fn tool_allowed(&self, name: &str) -> bool {
        !self.disabled_tools.contains(name)
    }

    /// Whether a skill may be activated under this configuration.
    pub fn skill_allowed(&self, name: &str) -> bool {
        !self.disabled_skills.contains(name)
    }

    /// Derive a child configuration for a delegated agent.
    ///
    /// Skills: `(parent.enabled_skills ∪ add_skills) \ remove_skills`.
    /// Tools follow the same pattern over `extra_tools`; removed tools are
    /// also recorded in `disabled_tools` so registry-provided tools are
    /// withheld too. Everything else (mode, limits, thresholds) is
    /// inherited unchanged.
    pub fn inherit(
        parent: &AgentConfig,
        add_skills: &[String],
        remove_skills: &[String],
        add_tools: &[String],
        remove_tools: &[String],
    ) -> AgentConfig {
        let mut child = parent.clone();

        for skill in add_skills {
            child.enabled_skills.insert(skill.clone());
        }
        for skill in remove_skills {
            child.enabled_skills.remove(skill);
            child.disabled_skills.insert(skill.clone());
        }

        for tool in add_tools {
            child.extra_tools.insert(tool.clone());
        }
        for tool in remove_tools {
            child.extra_tools.remove(tool);
            child.disabled_tools.insert(tool.clone());
        }

        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.max_recursion_depth, 5);
        assert_eq!(config.max_context_tokens, 8_000);
        assert!((config.output_reserve_ratio - 0.10).abs() < f64::EPSILON);
        assert_eq!(config.max_l1_size, 50);
        assert_eq!(config.max_l2_size, 100);
        assert_eq!(config.max_l3_size, 500);
        assert!((config.importance_promote_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.tool_concurrency_limit, 10);
        assert_eq!(config.bus_history_cap, 1_000);
    }

    #[test]
    fn test_inherit_set_algebra() {
        let parent = AgentConfig::default()
            .with_skill("a")
            .with_skill("b")
            .with_tool("t1");

        let child = AgentConfig::inherit(
            &parent,
            &["c".to_string()],
            &["b".to_string()],
            &["t2".to_string()],
            &["t1".to_string()],
        );

        assert!(child.enabled_skills.contains("a"));
        assert!(child.enabled_skills.contains("c"));
        assert!(!child.enabled_skills.contains("b"));
        assert!(child.extra_tools.contains("t2"));
        assert!(!child.extra_tools.contains("t1"));
        assert!(!child.tool_allowed("t1"));
        assert!(!child.skill_allowed("b"));
    }
}
