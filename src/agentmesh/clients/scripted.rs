//! Deterministic scripted LLM client.
//!
//! [`ScriptedClient`] implements [`ClientWrapper`] by replaying a fixed
//! sequence of [`ScriptedTurn`]s, one per `stream_chat` call. Each turn can
//! stream text (split into word-sized deltas), emit tool calls, report
//! usage, or fail with an injected transient error. When the script runs
//! out, subsequent calls replay the configured fallback turn.
//!
//! The scripted client is what the integration tests drive the agent loop
//! with; it is also useful to downstream consumers for offline end-to-end
//! testing of agent wiring without a network.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::clients::scripted::{ScriptedClient, ScriptedTurn};
//! use serde_json::json;
//!
//! // First call: ask for the echo tool. Second call: finish via done.
//! let client = ScriptedClient::new(vec![
//!     ScriptedTurn::tool_call("echo", json!({"text": "hello"})),
//!     ScriptedTurn::tool_call("done", json!({"content": "hello"})),
//! ]);
//! assert_eq!(client.calls_made(), 0);
//! ```

use crate::agentmesh::client_wrapper::{
    ChatParams, ChunkStream, ClientWrapper, Message, StreamChunk, ToolDefinition,
};
use crate::agentmesh::error::{AgentError, BoxError};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One scripted LLM response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// Assistant text streamed before any tool calls.
    pub text: String,
    /// Tool calls emitted after the text, in order, as `(name, arguments)`.
    pub tool_calls: Vec<(String, JsonValue)>,
    /// When set, the call fails with a transient error instead of streaming.
    pub fail_with: Option<String>,
    /// Usage reported at the end of the stream; `(input, output)`.
    pub usage: Option<(usize, usize)>,
}

impl ScriptedTurn {
    /// A plain text reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// A single tool call with no surrounding text.
    pub fn tool_call(name: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            tool_calls: vec![(name.into(), arguments)],
            ..Self::default()
        }
    }

    /// Several tool calls issued in one response.
    pub fn tool_calls(calls: Vec<(&str, JsonValue)>) -> Self {
        Self {
            tool_calls: calls
                .into_iter()
                .map(|(n, a)| (n.to_string(), a))
                .collect(),
            ..Self::default()
        }
    }

    /// An injected transient failure (for retry tests).
    pub fn transient_failure(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    /// Add leading assistant text to a tool-call turn (builder pattern).
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Report explicit token usage for this turn (builder pattern).
    pub fn with_usage(mut self, input: usize, output: usize) -> Self {
        self.usage = Some((input, output));
        self
    }
}

/// A [`ClientWrapper`] that replays scripted turns.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    fallback: ScriptedTurn,
    calls: AtomicUsize,
    model: String,
}

impl ScriptedClient {
    /// Create a client that replays `turns` in order.
    ///
    /// Once the script is exhausted the fallback turn (a plain "Done."
    /// text reply) is replayed for every further call.
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            fallback: ScriptedTurn::text("Done."),
            calls: AtomicUsize::new(0),
            model: "scripted".to_string(),
        }
    }

    /// Create a client that replies with the given texts, one per call.
    pub fn replying(texts: Vec<String>) -> Self {
        Self::new(texts.into_iter().map(ScriptedTurn::text).collect())
    }

    /// Override the fallback turn used after the script runs out.
    pub fn with_fallback(mut self, fallback: ScriptedTurn) -> Self {
        self.fallback = fallback;
        self
    }

    /// Override the reported model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Number of `stream_chat` calls made so far.
    pub fn calls_made(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    fn next_turn(&self) -> ScriptedTurn {
        self.turns
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn render(turn: ScriptedTurn, prompt_chars: usize) -> Vec<Result<StreamChunk, BoxError>> {
        let mut chunks: Vec<Result<StreamChunk, BoxError>> = Vec::new();

        // Stream the text word by word so consumers observe real deltas.
        if !turn.text.is_empty() {
            for word in turn.text.split_inclusive(' ') {
                chunks.push(Ok(StreamChunk::Text {
                    delta: word.to_string(),
                }));
            }
        }

        for (i, (name, arguments)) in turn.tool_calls.iter().enumerate() {
            let id = format!("call_{}", i);
            chunks.push(Ok(StreamChunk::ToolCallStart {
                id: id.clone(),
                name: name.clone(),
            }));
            let rendered = arguments.to_string();
            chunks.push(Ok(StreamChunk::ToolCallDelta {
                id: id.clone(),
                partial_json: rendered,
            }));
            chunks.push(Ok(StreamChunk::ToolCallComplete {
                id,
                name: name.clone(),
                arguments: arguments.clone(),
            }));
        }

        let estimated = ((prompt_chars / 4).max(1), (turn.text.len() / 4).max(1));
        let (input, output) = turn.usage.unwrap_or(estimated);
        chunks.push(Ok(StreamChunk::Usage { input, output }));

        let reason = if turn.tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        chunks.push(Ok(StreamChunk::Finish {
            reason: reason.to_string(),
        }));
        chunks
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn stream_chat(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
        _params: Option<ChatParams>,
    ) -> Result<ChunkStream, BoxError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let turn = self.next_turn();

        if let Some(message) = turn.fail_with {
            return Err(Box::new(AgentError::LlmTransient(message)));
        }

        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let chunks = Self::render(turn, prompt_chars);
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::client_wrapper::Role;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_text_turn_streams_deltas_and_finish() {
        let client = ScriptedClient::replying(vec!["one two three".to_string()]);
        let mut stream = client
            .stream_chat(&[Message::text(Role::User, "hi")], None, None)
            .await
            .unwrap();

        let mut text = String::new();
        let mut finishes = 0;
        while let Some(chunk) = stream.next().await {
            match chunk.unwrap() {
                StreamChunk::Text { delta } => text.push_str(&delta),
                StreamChunk::Finish { reason } => {
                    finishes += 1;
                    assert_eq!(reason, "stop");
                }
                _ => {}
            }
        }
        assert_eq!(text, "one two three");
        assert_eq!(finishes, 1);
        assert_eq!(client.calls_made(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_turn() {
        let client = ScriptedClient::new(vec![ScriptedTurn::tool_call(
            "echo",
            json!({"text": "hello"}),
        )]);
        let mut stream = client
            .stream_chat(&[Message::text(Role::User, "say hello")], None, None)
            .await
            .unwrap();

        let mut complete = None;
        while let Some(chunk) = stream.next().await {
            if let StreamChunk::ToolCallComplete { name, arguments, .. } = chunk.unwrap() {
                complete = Some((name, arguments));
            }
        }
        let (name, arguments) = complete.expect("tool call streamed");
        assert_eq!(name, "echo");
        assert_eq!(arguments["text"], "hello");
    }

    #[tokio::test]
    async fn test_injected_failure_then_fallback() {
        let client = ScriptedClient::new(vec![ScriptedTurn::transient_failure("rate limited")]);
        let err = client
            .stream_chat(&[Message::text(Role::User, "x")], None, None)
            .await
            .err()
            .expect("scripted failure");
        assert!(err.to_string().contains("rate limited"));

        // Script exhausted — fallback kicks in.
        let ok = client
            .stream_chat(&[Message::text(Role::User, "x")], None, None)
            .await;
        assert!(ok.is_ok());
    }
}
