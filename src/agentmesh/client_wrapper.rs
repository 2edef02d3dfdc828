//! Shared primitives for provider-agnostic LLM clients.
//!
//! The agent core drives models exclusively through the [`ClientWrapper`]
//! trait and the lightweight data types in this module. The trait abstracts
//! over concrete vendor implementations while the supporting structs
//! describe chat messages, streamed chunks, tool schemas, and token
//! accounting. No vendor SDK leaks into the core: implementations live
//! outside the crate (the deterministic [`ScriptedClient`] used by the test
//! suite lives in [`clients::scripted`](crate::clients::scripted)).
//!
//! # Streaming contract
//!
//! [`ClientWrapper::stream_chat`] returns an async sequence of
//! [`StreamChunk`]s. A well-behaved provider:
//!
//! - emits [`StreamChunk::Finish`] exactly once, as the last chunk;
//! - emits [`StreamChunk::ToolCallComplete`] with fully-formed JSON
//!   arguments for every call it started;
//! - may interleave [`StreamChunk::Text`] deltas with tool-call chunks.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::client_wrapper::{ClientWrapper, Message, Role};
//! use agentmesh::clients::scripted::ScriptedClient;
//! use futures_util::StreamExt;
//!
//! # async {
//! let client = ScriptedClient::replying(vec!["Hello there.".to_string()]);
//! let mut chunks = client
//!     .stream_chat(&[Message::text(Role::User, "Hi")], None, None)
//!     .await
//!     .unwrap();
//! while let Some(chunk) = chunks.next().await {
//!     println!("{:?}", chunk.unwrap());
//! }
//! # };
//! ```

use crate::agentmesh::error::BoxError;
use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    Tool {
        /// The provider-assigned id of the tool call this message answers.
        call_id: String,
    },
}

/// A single tool call extracted from a completed LLM response.
///
/// Providers assign an opaque [`id`](ToolCallRequest::id) to each call so
/// that the tool result can be correlated back in a follow-up `Role::Tool`
/// message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, e.g. `"call_01"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent with the request.
    pub name: String,
    /// Fully-formed JSON arguments supplied by the LLM.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the LLM along with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the provider's `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Represents a generic message exchanged with an LLM.
///
/// The `tool_calls` field is non-empty only on assistant messages whose
/// generation produced tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Message {
    /// Convenience constructor for a plain text message.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Convenience constructor for a tool-result message.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// One element of a streamed LLM response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// An incremental piece of assistant text.
    Text {
        /// The delta to append to the accumulated response.
        delta: String,
    },
    /// The provider opened a tool call.
    ToolCallStart {
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A fragment of the tool call's JSON arguments.
    ToolCallDelta {
        /// Provider-assigned call id.
        id: String,
        /// Partial JSON text to accumulate.
        partial_json: String,
    },
    /// The tool call finished; `arguments` is a fully-formed JSON object.
    ToolCallComplete {
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
        /// Complete, parsed JSON arguments.
        arguments: serde_json::Value,
    },
    /// Token accounting for the call so far.
    Usage {
        /// Prompt tokens billed.
        input: usize,
        /// Completion tokens billed.
        output: usize,
    },
    /// Terminal chunk; emitted exactly once per stream.
    Finish {
        /// Provider-specific finish reason (`"stop"`, `"tool_calls"`, ...).
        reason: String,
    },
}

/// Optional request parameters forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    /// Sampling temperature, when the provider supports it.
    pub temperature: Option<f64>,
    /// Hard cap on generated tokens.
    pub max_output_tokens: Option<usize>,
}

/// Type alias for a stream of chunks compatible with `Send` executors.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, BoxError>> + Send>>;

/// Trait-driven abstraction for a concrete LLM provider.
///
/// A [`ClientWrapper`] instance translates core requests into the provider
/// specific wire format and exposes responses as a uniform chunk stream.
/// The abstraction deliberately excludes conversation bookkeeping — that
/// lives in the agent's conversation buffer.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks via `Arc<dyn ClientWrapper>`.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Open a streaming chat completion.
    ///
    /// `messages` must include any system priming messages the caller wants
    /// sent. `tools`, when `Some` and non-empty, is forwarded to the
    /// provider's native function-calling surface.
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        params: Option<ChatParams>,
    ) -> Result<ChunkStream, BoxError>;

    /// Return the identifier used to select the upstream model.
    fn model_name(&self) -> &str;
}

/// Shared handle to a client.
pub type SharedClient = Arc<dyn ClientWrapper>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let m = Message::text(Role::User, "hi");
        assert_eq!(m.role, Role::User);
        assert!(m.tool_calls.is_empty());

        let t = Message::tool_result("call_1", "ok");
        match t.role {
            Role::Tool { ref call_id } => assert_eq!(call_id, "call_1"),
            _ => panic!("expected tool role"),
        }
    }

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let tool = Role::Tool {
            call_id: "c1".into(),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("c1"));
    }
}
