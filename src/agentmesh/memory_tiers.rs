//! Four-tier hierarchical task memory (L1–L4).
//!
//! The [`MemoryTierStore`] keeps completed work reachable at four levels of
//! compression:
//!
//! - **L1 (recent)** — a bounded FIFO of the latest tasks (default 50).
//! - **L2 (important)** — a bounded importance-ordered tier (default 100);
//!   at capacity a new task replaces the current minimum only if it
//!   outranks it (ties break by newer timestamp).
//! - **L3 (session)** — bounded per-session FIFO sub-buffers (default 500
//!   per session), indexed by `session_id`.
//! - **L4 (semantic)** — the compressed fact store in
//!   [`SemanticStore`](crate::semantic_store::SemanticStore).
//!
//! Promotion flows downward on eviction: an L1 eviction whose importance
//! clears `promote_threshold` (default 0.6) moves to L2; a task displaced
//! from L2 whose importance clears the higher `session_promote_threshold`
//! moves to L3; L3 evictions are summarized into L4.
//!
//! Tiers are disjoint except during a transient promotion;
//! [`MemoryTierStore::find_task`] returns at most one tier hit.
//!
//! Each tier is guarded by its own short-held mutex — a single writer at a
//! time per tier, promotions serialized on the destination tier's lock.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::memory_tiers::MemoryTierStore;
//! use agentmesh::task::{Task, TaskAction};
//!
//! # async {
//! let store = MemoryTierStore::new(3, 100, 500);
//! for i in 0..4 {
//!     let task = Task::new(TaskAction::Execute, format!("step {}", i))
//!         .with_importance(if i == 0 { 0.7 } else { 0.3 });
//!     store.add_task(task);
//! }
//! // The evicted first task (importance 0.7) was promoted to L2.
//! assert_eq!(store.l1_len(), 3);
//! assert_eq!(store.get_l2_tasks(10, None).len(), 1);
//! # };
//! ```

use crate::agentmesh::semantic_store::{SemanticHit, SemanticStore};
use crate::agentmesh::task::Task;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Default L1 → L2 promotion threshold.
const DEFAULT_PROMOTE_THRESHOLD: f64 = 0.6;

/// Default L2 → L3 promotion threshold (strictly above the L1 → L2 one).
const DEFAULT_SESSION_PROMOTE_THRESHOLD: f64 = 0.75;

/// Which tier a task was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Recent FIFO tier.
    L1,
    /// Importance tier.
    L2,
    /// Session tier.
    L3,
}

/// Importance-ordered bounded container backing L2.
///
/// Kept sorted descending by `(importance, timestamp)` so the top-k is a
/// prefix read and the replacement candidate is the tail.
struct ImportanceQueue {
    tasks: Vec<Task>,
    cap: usize,
}

impl ImportanceQueue {
    fn new(cap: usize) -> Self {
        Self {
            tasks: Vec::new(),
            cap: cap.max(1),
        }
    }

    fn outranks(a: &Task, b: &Task) -> bool {
        let (ia, ib) = (a.metadata.importance, b.metadata.importance);
        if (ia - ib).abs() > f64::EPSILON {
            return ia > ib;
        }
        a.metadata.timestamp > b.metadata.timestamp
    }

    /// Insert a task, displacing the current minimum when at capacity.
    ///
    /// Returns the displaced task when the insertion bumped one out, which
    /// the caller may promote further.
    fn insert(&mut self, task: Task) -> Option<Task> {
        let position = self
            .tasks
            .binary_search_by(|probe| {
                if Self::outranks(probe, &task) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_or_else(|i| i);

        if self.tasks.len() < self.cap {
            self.tasks.insert(position, task);
            return None;
        }

        // At capacity: only admit if the newcomer outranks the minimum.
        let min = self.tasks.last().expect("non-empty at capacity");
        if Self::outranks(&task, min) {
            let displaced = self.tasks.pop();
            self.tasks.insert(position.min(self.tasks.len()), task);
            displaced
        } else {
            Some(task)
        }
    }

    fn top(&self, limit: usize) -> Vec<Task> {
        self.tasks.iter().take(limit).cloned().collect()
    }

    fn remove(&mut self, task_id: &str) -> Option<Task> {
        let index = self.tasks.iter().position(|t| t.task_id == task_id)?;
        Some(self.tasks.remove(index))
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// The four-tier task store.
pub struct MemoryTierStore {
    l1: Mutex<VecDeque<Task>>,
    l2: Mutex<ImportanceQueue>,
    l3: Mutex<HashMap<String, VecDeque<Task>>>,
    /// Tasks evicted from L3, awaiting summarization into L4 by the next
    /// promotion sweep (L4 writes are async; L3 inserts are not).
    l3_overflow: Mutex<Vec<Task>>,
    l4: SemanticStore,
    max_l1_size: usize,
    max_l3_size: usize,
    promote_threshold: f64,
    session_promote_threshold: f64,
}

impl MemoryTierStore {
    /// Create a store with the given tier capacities and default thresholds.
    pub fn new(max_l1_size: usize, max_l2_size: usize, max_l3_size: usize) -> Self {
        Self {
            l1: Mutex::new(VecDeque::new()),
            l2: Mutex::new(ImportanceQueue::new(max_l2_size)),
            l3: Mutex::new(HashMap::new()),
            l3_overflow: Mutex::new(Vec::new()),
            l4: SemanticStore::new(150),
            max_l1_size: max_l1_size.max(1),
            max_l3_size: max_l3_size.max(1),
            promote_threshold: DEFAULT_PROMOTE_THRESHOLD,
            session_promote_threshold: DEFAULT_SESSION_PROMOTE_THRESHOLD,
        }
    }

    /// Override the L1 → L2 promotion threshold (builder pattern).
    pub fn with_promote_threshold(mut self, threshold: f64) -> Self {
        self.promote_threshold = threshold;
        self
    }

    /// Replace the L4 semantic store (builder pattern) — typically to
    /// attach an embedding provider.
    pub fn with_semantic_store(mut self, store: SemanticStore) -> Self {
        self.l4 = store;
        self
    }

    /// Borrow the L4 semantic store.
    pub fn semantic(&self) -> &SemanticStore {
        &self.l4
    }

    /// Current L1 occupancy.
    pub fn l1_len(&self) -> usize {
        self.l1.lock().expect("l1 poisoned").len()
    }

    /// Current L2 occupancy.
    pub fn l2_len(&self) -> usize {
        self.l2.lock().expect("l2 poisoned").len()
    }

    /// Insert a task into L1.
    ///
    /// On L1 overflow the oldest task is evicted synchronously; the
    /// eviction path decides promotion (importance ≥ `promote_threshold`
    /// moves the task into L2, which may in turn displace its minimum into
    /// L3). The L1 lock is released before any promotion so eviction
    /// handling never re-enters L1.
    pub fn add_task(&self, task: Task) {
        let evicted = {
            let mut l1 = self.l1.lock().expect("l1 poisoned");
            l1.push_back(task);
            if l1.len() > self.max_l1_size {
                l1.pop_front()
            } else {
                None
            }
        };

        if let Some(evicted) = evicted {
            self.handle_l1_eviction(evicted);
        }
    }

    fn handle_l1_eviction(&self, task: Task) {
        if task.metadata.importance >= self.promote_threshold {
            trace!(
                "promoting task {} (importance {:.2}) to L2",
                task.task_id,
                task.metadata.importance
            );
            let displaced = self.l2.lock().expect("l2 poisoned").insert(task);
            if let Some(displaced) = displaced {
                self.handle_l2_displacement(displaced);
            }
        }
    }

    fn handle_l2_displacement(&self, task: Task) {
        if task.metadata.importance >= self.session_promote_threshold {
            if let Some(session_id) = task.session_id.clone() {
                trace!("promoting task {} to L3 ({})", task.task_id, session_id);
                self.insert_l3(&session_id, task);
            }
        }
    }

    fn insert_l3(&self, session_id: &str, task: Task) {
        let mut evicted = Vec::new();
        {
            let mut l3 = self.l3.lock().expect("l3 poisoned");
            let buffer = l3
                .entry(session_id.to_string())
                .or_insert_with(VecDeque::new);
            buffer.push_back(task);
            while buffer.len() > self.max_l3_size {
                if let Some(task) = buffer.pop_front() {
                    evicted.push(task);
                }
            }
        }
        if !evicted.is_empty() {
            // L4 writes are async; park evictions for the next sweep.
            self.l3_overflow
                .lock()
                .expect("l3 overflow poisoned")
                .extend(evicted);
        }
    }

    /// The most recent `limit` L1 tasks, newest first, optionally filtered
    /// by session.
    pub fn get_l1_tasks(&self, limit: usize, session_id: Option<&str>) -> Vec<Task> {
        let l1 = self.l1.lock().expect("l1 poisoned");
        l1.iter()
            .rev()
            .filter(|t| match session_id {
                Some(s) => t.session_id.as_deref() == Some(s),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// The `limit` highest-importance L2 tasks (ties newest first),
    /// optionally filtered by session.
    pub fn get_l2_tasks(&self, limit: usize, session_id: Option<&str>) -> Vec<Task> {
        let l2 = self.l2.lock().expect("l2 poisoned");
        l2.top(usize::MAX)
            .into_iter()
            .filter(|t| match session_id {
                Some(s) => t.session_id.as_deref() == Some(s),
                None => true,
            })
            .take(limit)
            .collect()
    }

    /// The most recent `limit` L3 tasks for a session, newest first.
    pub fn get_l3_tasks(&self, session_id: &str, limit: usize) -> Vec<Task> {
        let l3 = self.l3.lock().expect("l3 poisoned");
        l3.get(session_id)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Replace a task in whatever tier currently holds it.
    ///
    /// Used when a task reaches a terminal status so the stored record
    /// carries the result. A task not present in any tier is a no-op.
    pub fn update_task(&self, task: &Task) {
        {
            let mut l1 = self.l1.lock().expect("l1 poisoned");
            if let Some(slot) = l1.iter_mut().find(|t| t.task_id == task.task_id) {
                *slot = task.clone();
                return;
            }
        }
        let displaced = {
            let mut l2 = self.l2.lock().expect("l2 poisoned");
            if l2.remove(&task.task_id).is_some() {
                Some(l2.insert(task.clone()))
            } else {
                None
            }
        };
        if let Some(displaced) = displaced {
            if let Some(out) = displaced {
                self.handle_l2_displacement(out);
            }
            return;
        }
        let mut l3 = self.l3.lock().expect("l3 poisoned");
        for buffer in l3.values_mut() {
            if let Some(slot) = buffer.iter_mut().find(|t| t.task_id == task.task_id) {
                *slot = task.clone();
                return;
            }
        }
    }

    /// Locate a task by id across the structured tiers.
    ///
    /// Tiers are disjoint, so at most one hit is returned; L1 is consulted
    /// first, then L2, then L3.
    pub fn find_task(&self, task_id: &str) -> Option<(Tier, Task)> {
        {
            let l1 = self.l1.lock().expect("l1 poisoned");
            if let Some(task) = l1.iter().find(|t| t.task_id == task_id) {
                return Some((Tier::L1, task.clone()));
            }
        }
        {
            let l2 = self.l2.lock().expect("l2 poisoned");
            if let Some(task) = l2.tasks.iter().find(|t| t.task_id == task_id) {
                return Some((Tier::L2, task.clone()));
            }
        }
        let l3 = self.l3.lock().expect("l3 poisoned");
        for buffer in l3.values() {
            if let Some(task) = buffer.iter().find(|t| t.task_id == task_id) {
                return Some((Tier::L3, task.clone()));
            }
        }
        None
    }

    /// Sweep aged tasks through the tiers.
    ///
    /// - Terminal L1 tasks whose importance clears `promote_threshold` move
    ///   to L2 (their L1 slot is freed).
    /// - Tasks displaced from L2 move to L3 when they clear the session
    ///   threshold.
    /// - L3 overflow is summarized into L4 (text compressed, embedded when
    ///   a provider is configured).
    ///
    /// Promotions run strictly after task completion; concurrent sweeps
    /// serialize on each tier's writer lock.
    pub async fn promote_tasks(&self) {
        // L1 → L2: move terminal, important tasks out of the recent tier.
        let promotable: Vec<Task> = {
            let mut l1 = self.l1.lock().expect("l1 poisoned");
            let mut keep = VecDeque::with_capacity(l1.len());
            let mut moved = Vec::new();
            while let Some(task) = l1.pop_front() {
                if task.status.is_terminal()
                    && task.metadata.importance >= self.promote_threshold
                {
                    moved.push(task);
                } else {
                    keep.push_back(task);
                }
            }
            *l1 = keep;
            moved
        };

        let mut displaced = Vec::new();
        if !promotable.is_empty() {
            let mut l2 = self.l2.lock().expect("l2 poisoned");
            for task in promotable {
                if let Some(out) = l2.insert(task) {
                    displaced.push(out);
                }
            }
        }
        for task in displaced {
            self.handle_l2_displacement(task);
        }

        // L3 evictions parked by insert_l3 → L4 summaries.
        let overflow: Vec<Task> = self
            .l3_overflow
            .lock()
            .expect("l3 overflow poisoned")
            .drain(..)
            .collect();
        for task in overflow {
            self.summarize_into_l4(&task).await;
        }
    }

    /// Spawn [`promote_tasks`](MemoryTierStore::promote_tasks) on the
    /// runtime and return immediately.
    pub fn promote_tasks_async(self: Arc<Self>) {
        tokio::spawn(async move {
            self.promote_tasks().await;
        });
    }

    /// Compress a task into an L4 fact.
    ///
    /// Shared by the L3-eviction sweep and [`memorize`](Self::memorize).
    async fn summarize_into_l4(&self, task: &Task) {
        let summary = format!("{} -> {}", task.content(), task.result.content);
        let metadata = serde_json::json!({
            "session_id": task.session_id,
            "importance": task.metadata.importance,
            "action": task.action.as_str(),
        });
        self.l4.add(&summary, metadata, Some(&task.task_id)).await;
    }

    /// Distill a terminal task directly into L4.
    ///
    /// Used by the agent loop for explicitly memorable results regardless
    /// of the L3 overflow path.
    pub async fn memorize(&self, task: &Task) {
        self.summarize_into_l4(task).await;
    }

    /// Search L4 for facts relevant to `query_text`.
    ///
    /// Fails soft: with no embedding provider configured the search
    /// degrades to keyword scoring, and an empty store yields an empty
    /// result.
    pub async fn semantic_search(&self, query_text: &str, top_k: usize) -> Vec<SemanticHit> {
        self.l4.search(query_text, top_k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::task::{TaskAction, TaskStatus};

    fn task(content: &str, importance: f64) -> Task {
        Task::new(TaskAction::Execute, content).with_importance(importance)
    }

    #[test]
    fn test_l1_capacity_and_fifo_eviction() {
        let store = MemoryTierStore::new(3, 100, 500);
        for i in 0..5 {
            store.add_task(task(&format!("t{}", i), 0.1));
        }
        assert_eq!(store.l1_len(), 3);
        let recent = store.get_l1_tasks(10, None);
        assert_eq!(recent.len(), 3);
        // Newest first; t0 and t1 were evicted (and not promoted at 0.1).
        assert_eq!(recent[0].content(), "t4");
        assert_eq!(recent[2].content(), "t2");
        assert_eq!(store.l2_len(), 0);
    }

    #[test]
    fn test_eviction_promotes_important_tasks() {
        // Mirrors the documented promotion scenario: capacity 3, threshold
        // 0.6, importances [0.7, 0.3, 0.8, 0.4].
        let store = MemoryTierStore::new(3, 100, 500);
        store.add_task(task("t1", 0.7));
        store.add_task(task("t2", 0.3));
        store.add_task(task("t3", 0.8));
        store.add_task(task("t4", 0.4));

        let l1: Vec<String> = store
            .get_l1_tasks(10, None)
            .iter()
            .map(|t| t.content().to_string())
            .collect();
        assert_eq!(l1, vec!["t4", "t3", "t2"]);

        let l2 = store.get_l2_tasks(10, None);
        assert_eq!(l2.len(), 1);
        assert_eq!(l2[0].content(), "t1");
    }

    #[test]
    fn test_l2_ordering_and_min_replacement() {
        let store = MemoryTierStore::new(1, 2, 500);
        // Push through L1 so everything above threshold lands in L2.
        store.add_task(task("a", 0.65));
        store.add_task(task("b", 0.9));
        store.add_task(task("c", 0.7));
        store.add_task(task("filler", 0.0)); // evicts "c" into L2

        // L2 cap is 2: holds the two highest of {a: .65, b: .9, c: .7}.
        let top = store.get_l2_tasks(10, None);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].content(), "b");
        assert_eq!(top[1].content(), "c");
    }

    #[test]
    fn test_l2_rejects_lower_importance_at_capacity() {
        let mut queue = ImportanceQueue::new(1);
        assert!(queue.insert(task("high", 0.9)).is_none());
        let rejected = queue.insert(task("low", 0.2)).expect("low bounced");
        assert_eq!(rejected.content(), "low");
        assert_eq!(queue.top(1)[0].content(), "high");
    }

    #[test]
    fn test_find_task_single_tier() {
        let store = MemoryTierStore::new(2, 100, 500);
        let t = task("find me", 0.9);
        let id = t.task_id.clone();
        store.add_task(t);

        let (tier, found) = store.find_task(&id).unwrap();
        assert_eq!(tier, Tier::L1);
        assert_eq!(found.content(), "find me");

        // Push it out of L1 so it promotes to L2; still exactly one hit.
        store.add_task(task("x", 0.1));
        store.add_task(task("y", 0.1));
        let (tier, found) = store.find_task(&id).unwrap();
        assert_eq!(tier, Tier::L2);
        assert_eq!(found.task_id, id);
    }

    #[tokio::test]
    async fn test_promote_sweep_moves_terminal_tasks() {
        let store = MemoryTierStore::new(10, 100, 500);
        let mut done = task("finished work", 0.8);
        done.transition(TaskStatus::Running);
        done.complete("result");
        store.add_task(done);
        store.add_task(task("still pending", 0.8));

        store.promote_tasks().await;

        assert_eq!(store.l1_len(), 1, "pending task stays in L1");
        let l2 = store.get_l2_tasks(10, None);
        assert_eq!(l2.len(), 1);
        assert_eq!(l2[0].content(), "finished work");
    }

    #[tokio::test]
    async fn test_semantic_search_fails_soft() {
        let store = MemoryTierStore::new(10, 100, 500);
        assert!(store.semantic_search("anything", 5).await.is_empty());

        let mut t = task("catalog the crates", 0.9);
        t.transition(TaskStatus::Running);
        t.complete("14 crates catalogued");
        store.memorize(&t).await;

        let hits = store.semantic_search("crates catalogued", 3).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_l3_eviction_summarized_into_l4() {
        let store = MemoryTierStore::new(10, 100, 2);
        let mut first = task("catalog the launch checklist", 0.9).with_session("s1");
        first.transition(TaskStatus::Running);
        first.complete("checklist has nine entries");
        store.insert_l3("s1", first);
        store.insert_l3("s1", task("triage bug reports", 0.8).with_session("s1"));
        store.insert_l3("s1", task("review release notes", 0.8).with_session("s1"));

        // Capacity 2: the first task was evicted and parked for the sweep.
        assert_eq!(store.get_l3_tasks("s1", 10).len(), 2);
        assert!(
            store.semantic_search("launch checklist", 3).await.is_empty(),
            "eviction reaches L4 only through the promotion sweep"
        );

        store.promote_tasks().await;

        let hits = store.semantic_search("launch checklist", 3).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].entry.text.contains("nine entries"));
        // The parked queue drained; a second sweep adds nothing.
        store.promote_tasks().await;
        assert_eq!(store.semantic().len().await, 1);
    }

    #[test]
    fn test_l3_session_isolation() {
        let store = MemoryTierStore::new(10, 100, 500);
        store.insert_l3("s1", task("s1 work", 0.8).with_session("s1"));
        store.insert_l3("s2", task("s2 work", 0.8).with_session("s2"));

        assert_eq!(store.get_l3_tasks("s1", 10).len(), 1);
        assert_eq!(store.get_l3_tasks("s1", 10)[0].content(), "s1 work");
        assert_eq!(store.get_l3_tasks("missing", 10).len(), 0);
    }
}
