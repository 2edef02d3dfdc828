//! Error taxonomy for the agent core.
//!
//! Errors are grouped by *behavior*, matching how the agent loop reacts to
//! them rather than where they originate:
//!
//! - **Recoverable / per-iteration** — transient LLM failures, provider
//!   lookups that miss. Retried with exponential backoff, then surfaced to
//!   the LLM as a tool-role message.
//! - **Recoverable / reported to the LLM** — tool execution failures and
//!   invalid arguments. Returned as tool-role messages; never fail the task.
//! - **Task-fatal** — depth/budget exhaustion, an unassemblable context,
//!   cancellation. The task transitions to `failed`/`cancelled` and a
//!   `node.error` event is published.
//! - **Programmer errors** — writes to a read-only scope, unknown models,
//!   unregistered tools. Raised immediately, never retried.
//!
//! [`AgentError::is_retryable`] and [`AgentError::is_task_fatal`] encode the
//! classification so call sites don't re-derive it.

use std::error::Error;
use std::fmt;

/// Boxed error type used across async seams.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Unified error type for agent execution.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentError {
    /// The LLM provider failed transiently (timeout, rate limit, 5xx).
    LlmTransient(String),
    /// The LLM provider failed permanently (auth, malformed request).
    LlmPermanent(String),
    /// A deadline expired (LLM call or tool call).
    Timeout(String),
    /// Delegation attempted past `max_recursion_depth`.
    DepthLimitExceeded { depth: usize, limit: usize },
    /// The shared token budget is exhausted.
    BudgetExceeded { requested: u64, remaining: u64 },
    /// The system prompt alone exceeds `max_context_tokens`.
    BudgetTooSmall { needed: usize, available: usize },
    /// The task was cancelled cooperatively.
    Cancelled,
    /// A `request_reply` waiter timed out or its task failed downstream.
    TaskFailed(String),
    /// No tokenizer registered for the model and no default configured.
    UnknownModel(String),
    /// Write attempted against an `inherited` (read-only) scope entry.
    ReadOnlyScope(String),
    /// Tool arguments failed schema validation.
    InvalidArguments { tool: String, message: String },
    /// Tool not present in the registry.
    UnknownTool(String),
    /// A skill could not be activated (missing required tools, ...).
    SkillUnavailable { skill: String, reason: String },
    /// Catch-all for subsystem failures that carry only a message.
    Internal(String),
}

impl AgentError {
    /// Whether the agent loop should retry the failed operation.
    ///
    /// Only transient LLM failures and timeouts are retryable; everything
    /// else either goes back to the LLM as a tool message or fails the task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::LlmTransient(_) | AgentError::Timeout(_))
    }

    /// Whether the error terminates the task (status `failed`/`cancelled`).
    pub fn is_task_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::DepthLimitExceeded { .. }
                | AgentError::BudgetExceeded { .. }
                | AgentError::BudgetTooSmall { .. }
                | AgentError::LlmPermanent(_)
                | AgentError::Cancelled
        )
    }

    /// Stable kind string recorded in `Task.result.error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::LlmTransient(_) => "llm_transient",
            AgentError::LlmPermanent(_) => "llm_permanent",
            AgentError::Timeout(_) => "timeout",
            AgentError::DepthLimitExceeded { .. } => "depth_limit",
            AgentError::BudgetExceeded { .. } => "budget_exceeded",
            AgentError::BudgetTooSmall { .. } => "budget_too_small",
            AgentError::Cancelled => "cancelled",
            AgentError::TaskFailed(_) => "task_failed",
            AgentError::UnknownModel(_) => "unknown_model",
            AgentError::ReadOnlyScope(_) => "read_only_scope",
            AgentError::InvalidArguments { .. } => "invalid_arguments",
            AgentError::UnknownTool(_) => "unknown_tool",
            AgentError::SkillUnavailable { .. } => "skill_unavailable",
            AgentError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::LlmTransient(msg) => write!(f, "transient LLM failure: {}", msg),
            AgentError::LlmPermanent(msg) => write!(f, "permanent LLM failure: {}", msg),
            AgentError::Timeout(what) => write!(f, "deadline expired: {}", what),
            AgentError::DepthLimitExceeded { depth, limit } => {
                write!(f, "delegation depth {} exceeds limit {}", depth, limit)
            }
            AgentError::BudgetExceeded { requested, remaining } => write!(
                f,
                "budget exhausted: requested {} tokens, {} remaining",
                requested, remaining
            ),
            AgentError::BudgetTooSmall { needed, available } => write!(
                f,
                "context budget too small: system prompt needs {} tokens, {} available",
                needed, available
            ),
            AgentError::Cancelled => write!(f, "task cancelled"),
            AgentError::TaskFailed(msg) => write!(f, "delegated task failed: {}", msg),
            AgentError::UnknownModel(model) => write!(f, "no tokenizer for model: {}", model),
            AgentError::ReadOnlyScope(id) => {
                write!(f, "write rejected: entry '{}' is inherited (read-only)", id)
            }
            AgentError::InvalidArguments { tool, message } => {
                write!(f, "invalid arguments for tool '{}': {}", tool, message)
            }
            AgentError::UnknownTool(name) => write!(f, "tool not registered: {}", name),
            AgentError::SkillUnavailable { skill, reason } => {
                write!(f, "skill '{}' unavailable: {}", skill, reason)
            }
            AgentError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for AgentError {}
