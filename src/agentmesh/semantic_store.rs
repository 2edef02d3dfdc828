//! L4: the compressed semantic memory store.
//!
//! The semantic tier holds a bounded set of compressed facts distilled from
//! completed work — logically unbounded, physically capped at a nominal
//! target (~150 entries). Entries carry text, an optional embedding, open
//! metadata, and the ids of the tasks they were distilled from.
//!
//! New facts are cluster-merged: when an incoming fact is close enough
//! (cosine ≥ `merge_threshold`) to an existing entry, the two are merged
//! instead of growing the store. When the store still overflows its cap,
//! the two most similar entries are merged to make room.
//!
//! Retrieval is cosine-similarity over embeddings when an embedding
//! provider is configured, and degrades gracefully to keyword scoring when
//! it isn't (or when embedding a given entry failed).
//!
//! # Example
//!
//! ```rust
//! use agentmesh::semantic_store::SemanticStore;
//! use agentmesh::providers::HashingEmbedder;
//! use std::sync::Arc;
//!
//! # async {
//! let store = SemanticStore::new(150).with_embedder(Arc::new(HashingEmbedder::default()));
//! store.add("the indexer processes five modules", serde_json::json!({}), None).await;
//! let hits = store.search("indexer modules", 3).await;
//! assert!(!hits.is_empty());
//! # };
//! ```

use crate::agentmesh::providers::{cosine_similarity, EmbeddingProvider};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default similarity above which an incoming fact merges into an existing
/// entry instead of creating a new one.
const DEFAULT_MERGE_THRESHOLD: f32 = 0.80;

/// Maximum characters of text kept per entry after compression.
const SUMMARY_CHAR_BUDGET: usize = 500;

/// One compressed fact in the semantic tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEntry {
    /// Stable identifier.
    pub id: String,
    /// Compressed fact text.
    pub text: String,
    /// Embedding vector; `None` when no provider was available or it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Open metadata (session, importance, ...).
    #[serde(default)]
    pub metadata: JsonValue,
    /// Tasks this fact was distilled from.
    #[serde(default)]
    pub source_task_ids: Vec<String>,
    /// Creation time of the (most recent merge into the) entry.
    pub updated_at: DateTime<Utc>,
}

/// A retrieval hit from the semantic tier.
#[derive(Debug, Clone)]
pub struct SemanticHit {
    /// The matched entry.
    pub entry: SemanticEntry,
    /// Similarity score in `[0, 1]` (cosine, or keyword fraction on the
    /// degraded path).
    pub score: f32,
}

/// The compressed semantic store backing L4.
pub struct SemanticStore {
    entries: RwLock<Vec<SemanticEntry>>,
    cap: usize,
    merge_threshold: f32,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SemanticStore {
    /// Create a store with the given nominal size target.
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cap: cap.max(1),
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            embedder: None,
        }
    }

    /// Attach an embedding provider (builder pattern).
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Override the cluster-merge similarity threshold (builder pattern).
    pub fn with_merge_threshold(mut self, threshold: f32) -> Self {
        self.merge_threshold = threshold;
        self
    }

    /// Whether an embedding provider is configured.
    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Number of stored facts.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Add a fact to the store, compressing and cluster-merging as needed.
    ///
    /// Embedding failures are non-fatal: the entry is stored without a
    /// vector and participates in keyword retrieval only. Returns the id of
    /// the entry the fact ended up in (new or merged).
    pub async fn add(
        &self,
        text: &str,
        metadata: JsonValue,
        source_task_id: Option<&str>,
    ) -> String {
        let compressed = compress_text(text, SUMMARY_CHAR_BUDGET);

        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(&compressed).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    debug!("embedding failed, storing without vector: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut entries = self.entries.write().await;

        // Cluster-merge into the nearest existing entry when close enough.
        if let Some(vector) = &embedding {
            let mut best: Option<(usize, f32)> = None;
            for (i, entry) in entries.iter().enumerate() {
                if let Some(existing) = &entry.embedding {
                    let score = cosine_similarity(vector, existing);
                    if best.map(|(_, s)| score > s).unwrap_or(true) {
                        best = Some((i, score));
                    }
                }
            }
            if let Some((i, score)) = best {
                if score >= self.merge_threshold {
                    let entry = &mut entries[i];
                    merge_into(entry, &compressed, vector.clone(), source_task_id);
                    return entry.id.clone();
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        entries.push(SemanticEntry {
            id: id.clone(),
            text: compressed,
            embedding,
            metadata,
            source_task_ids: source_task_id.map(|s| vec![s.to_string()]).unwrap_or_default(),
            updated_at: Utc::now(),
        });

        // Keep the store near its nominal size by merging the two most
        // similar entries on overflow (oldest pair wins ties).
        while entries.len() > self.cap {
            merge_closest_pair(&mut entries);
        }

        id
    }

    /// Retrieve the `top_k` most similar facts for `query`.
    ///
    /// Cosine retrieval when the query can be embedded; keyword scoring
    /// otherwise. Never fails — an empty store or a failed embed yields the
    /// degraded path or an empty result.
    pub async fn search(&self, query: &str, top_k: usize) -> Vec<SemanticHit> {
        let query_vector = match &self.embedder {
            Some(embedder) => embedder.embed(query).await.ok(),
            None => None,
        };

        let entries = self.entries.read().await;
        let mut hits: Vec<SemanticHit> = entries
            .iter()
            .map(|entry| {
                let score = match (&query_vector, &entry.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => keyword_score(query, &entry.text),
                };
                SemanticHit {
                    entry: entry.clone(),
                    score,
                }
            })
            .filter(|hit| hit.score > 0.0)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        hits
    }

    /// Snapshot of every stored fact (diagnostics / persistence).
    pub async fn entries(&self) -> Vec<SemanticEntry> {
        self.entries.read().await.clone()
    }
}

fn merge_into(
    entry: &mut SemanticEntry,
    incoming_text: &str,
    incoming_vector: Vec<f32>,
    source_task_id: Option<&str>,
) {
    // Keep the union of the texts within the summary budget and average the
    // vectors so the cluster centroid drifts toward new evidence.
    if !entry.text.contains(incoming_text) {
        let merged = format!("{} {}", entry.text, incoming_text);
        entry.text = compress_text(&merged, SUMMARY_CHAR_BUDGET);
    }
    if let Some(existing) = &mut entry.embedding {
        if existing.len() == incoming_vector.len() {
            for (a, b) in existing.iter_mut().zip(incoming_vector.iter()) {
                *a = (*a + *b) / 2.0;
            }
        }
    } else {
        entry.embedding = Some(incoming_vector);
    }
    if let Some(task_id) = source_task_id {
        if !entry.source_task_ids.iter().any(|t| t == task_id) {
            entry.source_task_ids.push(task_id.to_string());
        }
    }
    entry.updated_at = Utc::now();
}

fn merge_closest_pair(entries: &mut Vec<SemanticEntry>) {
    if entries.len() < 2 {
        return;
    }
    let mut best: Option<(usize, usize, f32)> = None;
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let score = match (&entries[i].embedding, &entries[j].embedding) {
                (Some(a), Some(b)) => cosine_similarity(a, b),
                _ => keyword_score(&entries[i].text, &entries[j].text),
            };
            if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                best = Some((i, j, score));
            }
        }
    }
    if let Some((i, j, _)) = best {
        let absorbed = entries.remove(j);
        let vector = absorbed
            .embedding
            .clone()
            .or_else(|| entries[i].embedding.clone())
            .unwrap_or_default();
        let text = absorbed.text.clone();
        let sources = absorbed.source_task_ids.clone();
        let entry = &mut entries[i];
        merge_into(entry, &text, vector, None);
        for task_id in sources {
            if !entry.source_task_ids.contains(&task_id) {
                entry.source_task_ids.push(task_id);
            }
        }
    }
}

/// Extractive compression: whole words up to `budget` characters.
fn compress_text(text: &str, budget: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= budget {
        return trimmed.to_string();
    }
    let mut out = String::with_capacity(budget);
    for word in trimmed.split_whitespace() {
        if out.len() + word.len() + 1 > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Fraction of distinct query words present in `text` (case-insensitive).
fn keyword_score(query: &str, text: &str) -> f32 {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let matched = words.iter().filter(|w| lower.contains(*w)).count();
    matched as f32 / words.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::providers::HashingEmbedder;
    use serde_json::json;

    #[tokio::test]
    async fn test_keyword_fallback_without_embedder() {
        let store = SemanticStore::new(10);
        store.add("five modules found in the repo", json!({}), None).await;
        store.add("weather is sunny today", json!({}), None).await;

        let hits = store.search("modules repo", 5).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].entry.text.contains("modules"));
    }

    #[tokio::test]
    async fn test_cosine_retrieval_with_embedder() {
        let store = SemanticStore::new(10).with_embedder(Arc::new(HashingEmbedder::new(128)));
        store
            .add("database schema migrated to v2", json!({}), Some("t1"))
            .await;
        store.add("ui palette refreshed", json!({}), Some("t2")).await;

        let hits = store.search("database schema migration", 1).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].entry.text.contains("schema"));
        assert_eq!(hits[0].entry.source_task_ids, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_identical_facts_cluster_merge() {
        let store = SemanticStore::new(10).with_embedder(Arc::new(HashingEmbedder::new(128)));
        let a = store.add("the cache layer is warm", json!({}), Some("t1")).await;
        let b = store.add("the cache layer is warm", json!({}), Some("t2")).await;
        assert_eq!(a, b, "identical facts must merge into one entry");
        assert_eq!(store.len().await, 1);

        let entries = store.entries().await;
        assert_eq!(entries[0].source_task_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_cap_enforced_by_merging() {
        let store = SemanticStore::new(3);
        for i in 0..10 {
            store
                .add(&format!("isolated fact number {}", i), json!({}), None)
                .await;
        }
        assert!(store.len().await <= 3);
    }

    #[test]
    fn test_compress_text_word_boundary() {
        let long = "alpha beta gamma delta".repeat(100);
        let compressed = compress_text(&long, 50);
        assert!(compressed.len() <= 50);
        assert!(!compressed.ends_with(' '));
    }
}
