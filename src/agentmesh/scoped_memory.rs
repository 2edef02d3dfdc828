//! Per-node memory with four access scopes and parent inheritance.
//!
//! Every agent node owns a [`ScopedMemory`]: a map of named entries, each
//! tagged with one of four scopes governing visibility and mutability:
//!
//! | Scope | Readable | Writable | Propagates up | Propagates down |
//! |-----------|----------|----------|---------------|-----------------|
//! | local     | yes      | yes      | no            | no              |
//! | shared    | yes      | yes      | yes (merge)   | yes (inherit)   |
//! | inherited | yes      | no       | no            | yes             |
//! | global    | yes      | yes      | yes           | yes             |
//!
//! `shared` entries flow down to children as read-only `inherited`
//! projections and flow back up through the version-aware merge performed
//! at child termination. `global` entries live in a registry shared by the
//! whole node tree, so a write anywhere is visible everywhere. `inherited`
//! entries are one-way snapshots: writing one fails with `ReadOnlyScope`,
//! and the parent's entry is never mutated through a child.
//!
//! Reads fault through the parent chain: a miss on `inherited` consults the
//! parent's `shared`/`global` entries (recursively), then caches a
//! read-only projection keyed by the source version.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::scoped_memory::{MemoryScope, ScopedMemory};
//! use std::sync::Arc;
//!
//! # async {
//! let parent = Arc::new(ScopedMemory::new("parent"));
//! parent
//!     .write("goal", serde_json::json!("build index"), MemoryScope::Shared)
//!     .await
//!     .unwrap();
//!
//! let child = ScopedMemory::child_of(&parent, "child");
//! let entry = child
//!     .read("goal", Some(&[MemoryScope::Inherited]))
//!     .await
//!     .unwrap();
//! assert_eq!(entry.scope, MemoryScope::Inherited);
//! assert_eq!(entry.content, serde_json::json!("build index"));
//!
//! // Inherited entries are read-only.
//! assert!(child
//!     .write("goal", serde_json::json!("x"), MemoryScope::Inherited)
//!     .await
//!     .is_err());
//! # };
//! ```

use crate::agentmesh::error::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Visibility/mutability class of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Private to the owning node.
    Local,
    /// Owned by the node, projected down to children and merged back up.
    Shared,
    /// Read-only projection of an ancestor's shared/global entry.
    Inherited,
    /// Tree-wide registry entry, readable and writable everywhere.
    Global,
}

/// Default scope search order for reads.
pub const DEFAULT_SEARCH_SCOPES: [MemoryScope; 4] = [
    MemoryScope::Local,
    MemoryScope::Shared,
    MemoryScope::Inherited,
    MemoryScope::Global,
];

/// A named item of node memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Entry name, unique per node.
    pub id: String,
    /// Arbitrary JSON content.
    pub content: JsonValue,
    /// Visibility class.
    pub scope: MemoryScope,
    /// Monotonic version, starting at 1.
    pub version: u64,
    /// Node that created the entry.
    pub created_by: String,
    /// Node that performed the last write.
    pub updated_by: String,
    /// For inherited projections: the source entry's version at copy time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u64>,
    /// Open metadata.
    #[serde(default)]
    pub metadata: JsonValue,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Per-node scoped memory over named entries.
///
/// The parent link is a `Weak` reference — children never keep their parent
/// alive, and a dropped parent simply ends the inheritance chain.
pub struct ScopedMemory {
    node_id: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
    globals: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    parent: Option<Weak<ScopedMemory>>,
}

impl ScopedMemory {
    /// Create a root memory for `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            entries: RwLock::new(HashMap::new()),
            globals: Arc::new(RwLock::new(HashMap::new())),
            parent: None,
        }
    }

    /// Create a child memory whose parent chain starts at `parent`.
    ///
    /// The child shares the tree-wide global registry and holds only a weak
    /// reference to the parent.
    pub fn child_of(parent: &Arc<ScopedMemory>, node_id: impl Into<String>) -> Arc<ScopedMemory> {
        Arc::new(Self {
            node_id: node_id.into(),
            entries: RwLock::new(HashMap::new()),
            globals: Arc::clone(&parent.globals),
            parent: Some(Arc::downgrade(parent)),
        })
    }

    /// The owning node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write an entry.
    ///
    /// Rejects `scope == Inherited` and writes against an existing
    /// inherited projection with [`AgentError::ReadOnlyScope`]. A new entry
    /// begins at version 1; an existing one increments its version by
    /// exactly 1 and records the writer in `updated_by`.
    pub async fn write(
        &self,
        id: &str,
        content: JsonValue,
        scope: MemoryScope,
    ) -> Result<MemoryEntry, AgentError> {
        if scope == MemoryScope::Inherited {
            return Err(AgentError::ReadOnlyScope(id.to_string()));
        }

        if scope == MemoryScope::Global {
            let mut globals = self.globals.write().await;
            let entry = Self::upsert(&mut globals, id, content, scope, &self.node_id)?;
            return Ok(entry);
        }

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(id) {
            if existing.scope == MemoryScope::Inherited {
                return Err(AgentError::ReadOnlyScope(id.to_string()));
            }
        }
        Self::upsert(&mut entries, id, content, scope, &self.node_id)
    }

    fn upsert(
        entries: &mut HashMap<String, MemoryEntry>,
        id: &str,
        content: JsonValue,
        scope: MemoryScope,
        writer: &str,
    ) -> Result<MemoryEntry, AgentError> {
        let entry = match entries.get_mut(id) {
            Some(existing) => {
                existing.content = content;
                existing.scope = scope;
                existing.version += 1;
                existing.updated_by = writer.to_string();
                existing.updated_at = Utc::now();
                existing.clone()
            }
            None => {
                let entry = MemoryEntry {
                    id: id.to_string(),
                    content,
                    scope,
                    version: 1,
                    created_by: writer.to_string(),
                    updated_by: writer.to_string(),
                    parent_version: None,
                    metadata: JsonValue::Null,
                    updated_at: Utc::now(),
                };
                entries.insert(id.to_string(), entry.clone());
                entry
            }
        };
        Ok(entry)
    }

    /// Read an entry, searching `search_scopes` in order (defaulting to
    /// local → shared → inherited → global).
    ///
    /// An `inherited` lookup that misses the local cache faults through the
    /// parent chain — consulting each ancestor's `shared` then `global`
    /// entries — and caches a read-only projection keyed by the source
    /// version on a hit.
    pub async fn read(
        &self,
        id: &str,
        search_scopes: Option<&[MemoryScope]>,
    ) -> Option<MemoryEntry> {
        let scopes = search_scopes.unwrap_or(&DEFAULT_SEARCH_SCOPES);

        for scope in scopes {
            match scope {
                MemoryScope::Local | MemoryScope::Shared => {
                    let entries = self.entries.read().await;
                    if let Some(entry) = entries.get(id) {
                        if entry.scope == *scope {
                            return Some(entry.clone());
                        }
                    }
                }
                MemoryScope::Inherited => {
                    {
                        let entries = self.entries.read().await;
                        if let Some(entry) = entries.get(id) {
                            if entry.scope == MemoryScope::Inherited {
                                return Some(entry.clone());
                            }
                        }
                    }
                    if let Some(source) = self.lookup_ancestors(id).await {
                        let projection = self.cache_inherited(&source).await;
                        return Some(projection);
                    }
                }
                MemoryScope::Global => {
                    let globals = self.globals.read().await;
                    if let Some(entry) = globals.get(id) {
                        return Some(entry.clone());
                    }
                }
            }
        }
        None
    }

    /// Walk the parent chain looking for a `shared` or `global` entry.
    async fn lookup_ancestors(&self, id: &str) -> Option<MemoryEntry> {
        let mut current = self.parent.clone();
        while let Some(weak) = current {
            let parent = weak.upgrade()?;
            {
                let entries = parent.entries.read().await;
                if let Some(entry) = entries.get(id) {
                    if entry.scope == MemoryScope::Shared {
                        return Some(entry.clone());
                    }
                }
            }
            {
                let globals = parent.globals.read().await;
                if let Some(entry) = globals.get(id) {
                    return Some(entry.clone());
                }
            }
            current = parent.parent.clone();
        }
        None
    }

    /// Cache a read-only inherited projection of an ancestor entry.
    ///
    /// The projection snapshots the source content and records the source
    /// version in `parent_version`; the source entry itself is never
    /// touched.
    async fn cache_inherited(&self, source: &MemoryEntry) -> MemoryEntry {
        let projection = MemoryEntry {
            id: source.id.clone(),
            content: source.content.clone(),
            scope: MemoryScope::Inherited,
            version: source.version,
            created_by: source.created_by.clone(),
            updated_by: source.updated_by.clone(),
            parent_version: Some(source.version),
            metadata: source.metadata.clone(),
            updated_at: source.updated_at,
        };
        let mut entries = self.entries.write().await;
        // A concurrent local/shared write wins over the projection.
        entries
            .entry(projection.id.clone())
            .or_insert_with(|| projection.clone());
        projection
    }

    /// List all entries with the given scope, most recently updated first.
    pub async fn list_by_scope(&self, scope: MemoryScope) -> Vec<MemoryEntry> {
        let mut out: Vec<MemoryEntry> = if scope == MemoryScope::Global {
            self.globals.read().await.values().cloned().collect()
        } else {
            self.entries
                .read()
                .await
                .values()
                .filter(|e| e.scope == scope)
                .cloned()
                .collect()
        };
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Seed inherited projections from the parent's shared/global entries
    /// whose ids match any of `hints` (substring, case-insensitive), taking
    /// the `top_k` most recently updated.
    ///
    /// Used by delegation to pre-fault the context a child is likely to
    /// need. Returns the number of projections cached.
    pub async fn seed_from_parent(&self, hints: &[String], top_k: usize) -> usize {
        let parent = match self.parent.as_ref().and_then(|w| w.upgrade()) {
            Some(parent) => parent,
            None => return 0,
        };

        let mut candidates: Vec<MemoryEntry> = Vec::new();
        {
            let entries = parent.entries.read().await;
            candidates.extend(
                entries
                    .values()
                    .filter(|e| e.scope == MemoryScope::Shared)
                    .cloned(),
            );
        }
        {
            let globals = parent.globals.read().await;
            candidates.extend(globals.values().cloned());
        }

        let lowered: Vec<String> = hints.iter().map(|h| h.to_lowercase()).collect();
        let mut matched: Vec<MemoryEntry> = candidates
            .into_iter()
            .filter(|entry| {
                let id = entry.id.to_lowercase();
                lowered.iter().any(|h| id.contains(h) || h.contains(&id))
            })
            .collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matched.truncate(top_k);

        let mut seeded = 0;
        for source in &matched {
            self.cache_inherited(source).await;
            seeded += 1;
        }
        seeded
    }

    /// Snapshot of this node's `shared` entries, for the termination-time
    /// merge back into the parent.
    pub async fn snapshot_shared(&self) -> Vec<MemoryEntry> {
        self.list_by_scope(MemoryScope::Shared).await
    }

    /// Merge a child's shared entries into this node's shared scope.
    ///
    /// Version-aware: an existing entry with a version higher than the
    /// incoming one wins; otherwise the child's content and version are
    /// adopted (with `updated_by` preserved from the child's writer).
    /// Returns the number of entries adopted.
    pub async fn merge_shared(&self, incoming: Vec<MemoryEntry>) -> usize {
        let mut entries = self.entries.write().await;
        let mut adopted = 0;
        for mut entry in incoming {
            if entry.scope != MemoryScope::Shared {
                continue;
            }
            entry.parent_version = None;
            match entries.get(&entry.id) {
                Some(existing)
                    if existing.scope != MemoryScope::Inherited
                        && existing.version > entry.version => {}
                _ => {
                    entries.insert(entry.id.clone(), entry);
                    adopted += 1;
                }
            }
        }
        adopted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_read_local_round_trip() {
        let memory = ScopedMemory::new("n1");
        let entry = memory
            .write("note", json!("exact content"), MemoryScope::Local)
            .await
            .unwrap();
        assert_eq!(entry.version, 1);

        let read = memory.read("note", None).await.unwrap();
        assert_eq!(read.content, json!("exact content"));
        assert_eq!(read.version, 1);
        assert_eq!(read.created_by, "n1");
    }

    #[tokio::test]
    async fn test_version_increments_by_one() {
        let memory = ScopedMemory::new("n1");
        for expected in 1..=5u64 {
            let entry = memory
                .write("counter", json!(expected), MemoryScope::Local)
                .await
                .unwrap();
            assert_eq!(entry.version, expected);
        }
    }

    #[tokio::test]
    async fn test_inherited_writes_always_fail() {
        let memory = ScopedMemory::new("n1");
        let err = memory
            .write("x", json!(1), MemoryScope::Inherited)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ReadOnlyScope(_)));
    }

    #[tokio::test]
    async fn test_parent_chain_fault_and_cache() {
        let parent = Arc::new(ScopedMemory::new("parent"));
        parent
            .write("goal", json!("build index"), MemoryScope::Shared)
            .await
            .unwrap();

        let child = ScopedMemory::child_of(&parent, "child");
        let entry = child
            .read("goal", Some(&[MemoryScope::Inherited]))
            .await
            .unwrap();
        assert_eq!(entry.scope, MemoryScope::Inherited);
        assert_eq!(entry.parent_version, Some(1));

        // Cached projection is now read-only on the child.
        let err = child
            .write("goal", json!("mutate"), MemoryScope::Shared)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ReadOnlyScope(_)));

        // Parent entry untouched.
        let source = parent.read("goal", None).await.unwrap();
        assert_eq!(source.version, 1);
        assert_eq!(source.content, json!("build index"));
    }

    #[tokio::test]
    async fn test_grandparent_lookup() {
        let grandparent = Arc::new(ScopedMemory::new("gp"));
        grandparent
            .write("policy", json!("be thorough"), MemoryScope::Shared)
            .await
            .unwrap();
        let parent = ScopedMemory::child_of(&grandparent, "p");
        let child = ScopedMemory::child_of(&parent, "c");

        let entry = child
            .read("policy", Some(&[MemoryScope::Inherited]))
            .await
            .unwrap();
        assert_eq!(entry.content, json!("be thorough"));
    }

    #[tokio::test]
    async fn test_global_propagates_both_ways() {
        let parent = Arc::new(ScopedMemory::new("parent"));
        let child = ScopedMemory::child_of(&parent, "child");

        child
            .write("announcement", json!("from child"), MemoryScope::Global)
            .await
            .unwrap();

        let seen = parent
            .read("announcement", Some(&[MemoryScope::Global]))
            .await
            .unwrap();
        assert_eq!(seen.content, json!("from child"));
        assert_eq!(seen.updated_by, "child");
    }

    #[tokio::test]
    async fn test_scope_priority_order() {
        let memory = ScopedMemory::new("n1");
        memory
            .write("k", json!("local"), MemoryScope::Local)
            .await
            .unwrap();
        memory
            .write("k2", json!("global"), MemoryScope::Global)
            .await
            .unwrap();

        // Local found before global for the same search.
        let read = memory.read("k", None).await.unwrap();
        assert_eq!(read.scope, MemoryScope::Local);
        let read = memory.read("k2", None).await.unwrap();
        assert_eq!(read.scope, MemoryScope::Global);
    }

    #[tokio::test]
    async fn test_seed_from_parent_matches_hints() {
        let parent = Arc::new(ScopedMemory::new("parent"));
        parent
            .write("goal", json!("g"), MemoryScope::Shared)
            .await
            .unwrap();
        parent
            .write("scratch", json!("s"), MemoryScope::Shared)
            .await
            .unwrap();
        parent
            .write("secret", json!("x"), MemoryScope::Local)
            .await
            .unwrap();

        let child = ScopedMemory::child_of(&parent, "child");
        let seeded = child.seed_from_parent(&["goal".to_string()], 5).await;
        assert_eq!(seeded, 1);

        let inherited = child.list_by_scope(MemoryScope::Inherited).await;
        assert_eq!(inherited.len(), 1);
        assert_eq!(inherited[0].id, "goal");

        // Local entries never propagate.
        assert!(child
            .read("secret", Some(&[MemoryScope::Inherited]))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_merge_shared_version_aware() {
        let parent = Arc::new(ScopedMemory::new("parent"));
        // Parent writes twice — version 2.
        parent.write("plan", json!("v1"), MemoryScope::Shared).await.unwrap();
        parent.write("plan", json!("v2"), MemoryScope::Shared).await.unwrap();

        let child = ScopedMemory::child_of(&parent, "child");
        child
            .write("plan", json!("child plan"), MemoryScope::Shared)
            .await
            .unwrap(); // version 1
        child
            .write("finding", json!("5 modules"), MemoryScope::Shared)
            .await
            .unwrap();

        let adopted = parent.merge_shared(child.snapshot_shared().await).await;
        assert_eq!(adopted, 1, "only the new 'finding' entry is adopted");

        let plan = parent.read("plan", None).await.unwrap();
        assert_eq!(plan.content, json!("v2"), "higher parent version wins");
        let finding = parent.read("finding", None).await.unwrap();
        assert_eq!(finding.content, json!("5 modules"));
        assert_eq!(finding.updated_by, "child");
    }
}
