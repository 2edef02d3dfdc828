//! Model-aware token counting.
//!
//! The [`TokenCounter`] maps a model name to a registered [`Tokenizer`] and
//! counts the tokens of plain text or whole message lists. Counting is a
//! pure function of `(model, input)`: the same arguments always produce the
//! same count, which lets the context orchestrator budget deterministically.
//!
//! The built-in tokenizer is a character-ratio heuristic (one token per ~4
//! characters, floor of 1) with a per-message role overhead — accurate
//! enough for budgeting without pulling in a vocabulary. Exact tokenizers
//! can be registered per model; registration is expected at process
//! initialization, after which the table is effectively read-only.
//!
//! Counts are cached by `(model, sha256(content))` behind a bounded map, so
//! repeated assemblies over the same memory entries don't re-scan them.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::token_counter::TokenCounter;
//!
//! let counter = TokenCounter::with_default_heuristic();
//! let n = counter.count_text("default", "hello world").unwrap();
//! assert!(n >= 2);
//!
//! // Unknown model without a default fails.
//! let strict = TokenCounter::new();
//! assert!(strict.count_text("gpt-unknown", "hi").is_err());
//! ```

use crate::agentmesh::client_wrapper::Message;
use crate::agentmesh::error::AgentError;
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Tokens added per message to account for role/framing overhead.
const ROLE_OVERHEAD_TOKENS: usize = 3;

/// Upper bound on cached `(model, content-hash)` entries.
const CACHE_CAP: usize = 4_096;

lazy_static! {
    /// Process-wide model table consulted by [`TokenCounter::for_process`].
    ///
    /// Writable during initialization via [`register_global_model`], then
    /// effectively read-only for the lifetime of the process.
    static ref GLOBAL_MODELS: Mutex<HashMap<String, Arc<dyn Tokenizer>>> =
        Mutex::new(HashMap::new());
}

/// A tokenizer for one model family.
pub trait Tokenizer: Send + Sync {
    /// Count the tokens of `text`. Must be deterministic.
    fn count(&self, text: &str) -> usize;
}

/// Character-ratio heuristic tokenizer.
///
/// Estimates one token per `chars_per_token` characters with a floor of one
/// token for non-empty text. The default ratio of 4 matches common English
/// prose under BPE vocabularies closely enough for budgeting.
pub struct HeuristicTokenizer {
    /// Characters per estimated token.
    pub chars_per_token: usize,
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() / self.chars_per_token.max(1)).max(1)
    }
}

/// Register a tokenizer in the process-wide model table.
///
/// Intended for use during initialization only; later registrations are
/// accepted but racing them against live counting is a programmer error.
pub fn register_global_model(model: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) {
    GLOBAL_MODELS
        .lock()
        .expect("model table poisoned")
        .insert(model.into(), tokenizer);
}

/// Deterministic, cache-backed token counter over a model table.
pub struct TokenCounter {
    models: HashMap<String, Arc<dyn Tokenizer>>,
    default: Option<Arc<dyn Tokenizer>>,
    cache: Mutex<HashMap<(String, [u8; 32]), usize>>,
}

impl TokenCounter {
    /// Create a counter with an empty model table and no default.
    ///
    /// Counting against an unregistered model fails with
    /// [`AgentError::UnknownModel`].
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            default: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Create a counter whose default tokenizer is the 4-chars heuristic.
    ///
    /// Any model name resolves; unknown models fall back to the heuristic.
    pub fn with_default_heuristic() -> Self {
        let mut counter = Self::new();
        counter.default = Some(Arc::new(HeuristicTokenizer::default()));
        counter
    }

    /// Create a counter seeded from the process-wide model table, with the
    /// heuristic default.
    pub fn for_process() -> Self {
        let mut counter = Self::with_default_heuristic();
        let table = GLOBAL_MODELS.lock().expect("model table poisoned");
        for (model, tokenizer) in table.iter() {
            counter.models.insert(model.clone(), Arc::clone(tokenizer));
        }
        counter
    }

    /// Register a tokenizer for a specific model (builder pattern).
    pub fn with_model(mut self, model: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.models.insert(model.into(), tokenizer);
        self
    }

    /// Set the fallback tokenizer used for unregistered models.
    pub fn with_default(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.default = Some(tokenizer);
        self
    }

    fn resolve(&self, model: &str) -> Result<&Arc<dyn Tokenizer>, AgentError> {
        self.models
            .get(model)
            .or(self.default.as_ref())
            .ok_or_else(|| AgentError::UnknownModel(model.to_string()))
    }

    /// Count the tokens of `text` under `model`.
    ///
    /// Deterministic; fails with [`AgentError::UnknownModel`] when `model`
    /// has no registered tokenizer and no default is configured.
    pub fn count_text(&self, model: &str, text: &str) -> Result<usize, AgentError> {
        let tokenizer = self.resolve(model)?;

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let key = (model.to_string(), digest);

        {
            let cache = self.cache.lock().expect("count cache poisoned");
            if let Some(&hit) = cache.get(&key) {
                return Ok(hit);
            }
        }

        let count = tokenizer.count(text);

        let mut cache = self.cache.lock().expect("count cache poisoned");
        if cache.len() >= CACHE_CAP {
            cache.clear();
        }
        cache.insert(key, count);
        Ok(count)
    }

    /// Count the tokens of a message list under `model`.
    ///
    /// The sum of per-message content tokens plus a fixed per-message role
    /// overhead.
    pub fn count_messages(&self, model: &str, messages: &[Message]) -> Result<usize, AgentError> {
        let mut total = 0;
        for message in messages {
            total += ROLE_OVERHEAD_TOKENS + self.count_text(model, &message.content)?;
        }
        Ok(total)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::with_default_heuristic()
    }
}
