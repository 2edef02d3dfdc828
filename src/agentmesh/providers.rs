//! Consumed provider interfaces: embeddings, vector search, knowledge.
//!
//! The core never talks to a network itself — semantic memory (L4) and the
//! knowledge-base context source reach external systems only through the
//! traits in this module. Reference in-process implementations are included
//! so the crate is fully functional offline:
//!
//! - [`HashingEmbedder`] — a deterministic feature-hashing embedder;
//! - [`InMemoryVectorStore`] — a cosine-similarity store over a `Vec`;
//! - [`StaticKnowledgeBase`] — a fixed document list scored by keyword
//!   overlap.
//!
//! Provider failures are non-fatal to memory writes: an embedding failure
//! leaves the entry's vector empty and retrieval degrades to keyword
//! search.

use crate::agentmesh::error::BoxError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Produces dense vectors for text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BoxError>;

    /// Embed a batch of texts; the default loops over [`embed`](Self::embed).
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BoxError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of the produced vectors.
    fn dimension(&self) -> usize;
}

/// A single vector-store hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Entry identifier.
    pub id: String,
    /// Cosine similarity in `[0, 1]`.
    pub score: f32,
    /// Metadata stored alongside the vector.
    pub metadata: JsonValue,
}

/// Stores and searches dense vectors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace an entry.
    async fn upsert(&self, id: &str, vector: Vec<f32>, metadata: JsonValue)
        -> Result<(), BoxError>;

    /// Return the `top_k` most similar entries, highest score first.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&JsonValue>,
    ) -> Result<Vec<VectorHit>, BoxError>;

    /// Remove an entry; removing an absent id is a no-op.
    async fn delete(&self, id: &str) -> Result<(), BoxError>;
}

/// A retrieved knowledge document.
#[derive(Debug, Clone)]
pub struct KnowledgeDocument {
    /// Source identifier (path, URL, doc id, ...).
    pub id: String,
    /// Snippet text.
    pub content: String,
    /// Relevance score in `[0, 1]`.
    pub relevance: f32,
}

/// External RAG backend consumed by the knowledge context source.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Retrieve up to `top_k` documents scoring at least
    /// `relevance_threshold` for `query`.
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        relevance_threshold: f32,
    ) -> Result<Vec<KnowledgeDocument>, BoxError>;
}

/// Cosine similarity mapped into `[0, 1]`.
///
/// Returns `0.0` for zero-length or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let raw = dot / (norm_a.sqrt() * norm_b.sqrt());
    ((raw + 1.0) / 2.0).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// HashingEmbedder
// ---------------------------------------------------------------------------

/// Deterministic feature-hashing embedder.
///
/// Each lowercased word is hashed into one of `dimension` buckets; the
/// resulting count vector is L2-normalized. Not a semantic model, but
/// deterministic, dependency-free, and good enough for tests and keyword-ish
/// similarity offline.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder with the given output dimensionality.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    /// 256-dimensional embedder.
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BoxError> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.split_whitespace() {
            let mut hasher = Sha256::new();
            hasher.update(word.to_lowercase().as_bytes());
            let digest = hasher.finalize();
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ---------------------------------------------------------------------------
// InMemoryVectorStore
// ---------------------------------------------------------------------------

/// Brute-force cosine-similarity vector store.
///
/// Suitable for the L4 tier's nominal size (~150 entries); larger corpora
/// belong behind a real vector database implementing [`VectorStore`].
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<String, (Vec<f32>, JsonValue)>>,
}

impl InMemoryVectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored vectors.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: JsonValue,
    ) -> Result<(), BoxError> {
        self.entries
            .write()
            .await
            .insert(id.to_string(), (vector, metadata));
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&JsonValue>,
    ) -> Result<Vec<VectorHit>, BoxError> {
        let entries = self.entries.read().await;
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, (_, metadata))| match filter {
                Some(JsonValue::Object(wanted)) => wanted.iter().all(|(k, v)| {
                    metadata
                        .as_object()
                        .and_then(|m| m.get(k))
                        .map(|found| found == v)
                        .unwrap_or(false)
                }),
                _ => true,
            })
            .map(|(id, (stored, metadata))| VectorHit {
                id: id.clone(),
                score: cosine_similarity(vector, stored),
                metadata: metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> Result<(), BoxError> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticKnowledgeBase
// ---------------------------------------------------------------------------

/// Knowledge base over a fixed document list, scored by keyword overlap.
///
/// The score is the fraction of distinct query words that appear in the
/// document (case-insensitive). Useful for tests and air-gapped deployments.
pub struct StaticKnowledgeBase {
    documents: Vec<(String, String)>,
}

impl StaticKnowledgeBase {
    /// Create a knowledge base over `(id, content)` pairs.
    pub fn new(documents: Vec<(String, String)>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        relevance_threshold: f32,
    ) -> Result<Vec<KnowledgeDocument>, BoxError> {
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<KnowledgeDocument> = self
            .documents
            .iter()
            .map(|(id, content)| {
                let lower = content.to_lowercase();
                let matched = words.iter().filter(|w| lower.contains(*w)).count();
                KnowledgeDocument {
                    id: id.clone(),
                    content: content.clone(),
                    relevance: matched as f32 / words.len() as f32,
                }
            })
            .filter(|doc| doc.relevance >= relevance_threshold)
            .collect();
        scored.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}
