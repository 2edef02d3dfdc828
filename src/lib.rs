// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-exporting key items for easier external access.
pub use agentmesh::agent::{Agent, AgentSetup};
pub use agentmesh::budget::Budget;
pub use agentmesh::cancel::CancelToken;
pub use agentmesh::config::{AgentConfig, SkillActivationMode};
pub use agentmesh::event_bus::EventBus;
pub use agentmesh::session::{Session, SessionController};
pub use agentmesh::task::{Task, TaskAction, TaskStatus};

// Flatten the module paths used in doc examples and downstream imports:
// `agentmesh::task::Task` instead of `agentmesh::agentmesh::task::Task`.
pub use agentmesh::agent;
pub use agentmesh::{
    budget, cancel, client_wrapper, clients, config, context_orchestrator, context_source,
    delegation, error, event, event_bus, event_journal, memory_tiers, providers, scoped_memory,
    semantic_store, session, skill, task, token_counter, tool_executor, tool_protocol,
    tool_protocols,
};
