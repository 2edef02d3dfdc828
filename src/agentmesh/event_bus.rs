//! Append-only, multi-index queryable event bus with pub/sub routing.
//!
//! The [`EventBus`] is the substrate every agent publishes onto and the
//! transport delegated tasks travel over. It keeps a bounded, append-only
//! history with per-node / per-action / per-task indices maintained on
//! publish, routes events to subscribers through bounded channels, and
//! implements the request/reply pattern used for task envelopes.
//!
//! # Ordering
//!
//! Publications from the same producer are observed in submission order:
//! every published event receives a bus-wide monotonic sequence number, the
//! history appends in sequence order, and each subscription drains its
//! channel serially, so a subscriber never sees `e2` before `e1` when one
//! producer published `e1` first. Distinct subscriptions process distinct
//! events concurrently.
//!
//! # Back-pressure
//!
//! Subscriber channels are bounded by the high-water mark. A publish into a
//! full channel drops the event when its type is shed-eligible (text deltas
//! — see [`EventType::droppable`]) and otherwise suspends the producer
//! until space frees up. Tool results, task terminal envelopes, and errors
//! are therefore never lost.
//!
//! # Retention
//!
//! History is a circular buffer capped at `history_cap` (default 1,000)
//! with FIFO eviction — except that terminal task envelopes referenced by
//! an outstanding [`request_reply`](EventBus::request_reply) are moved to a
//! pinned side store instead of being discarded, and released when the
//! waiter completes.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::event::{Event, EventType};
//! use agentmesh::event_bus::EventBus;
//!
//! # async {
//! let bus = EventBus::new(1_000);
//! bus.publish(
//!     Event::new(EventType::NodeStart, "researcher").with_task("t1"),
//! )
//! .await;
//!
//! let recent = bus.query_recent(10).await;
//! assert_eq!(recent.len(), 1);
//! # };
//! ```

use crate::agentmesh::error::{AgentError, BoxError};
use crate::agentmesh::event::{Event, EventSelector, EventType};
use crate::agentmesh::task::{Task, TaskStatus};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default bounded-channel depth per subscription.
const DEFAULT_HIGH_WATER_MARK: usize = 256;

/// Asynchronous event consumer registered via [`EventBus::subscribe`].
///
/// Handlers for one subscription run serially; handlers across different
/// subscriptions run concurrently. A returned error is captured and
/// re-published as a `node.error` event — it never affects other
/// subscribers or the producer.
#[async_trait]
pub trait EventObserver: Send + Sync {
    /// Handle one event.
    async fn on_event(&self, event: &Event) -> Result<(), BoxError>;
}

/// Seam for forwarding events beyond the local process.
///
/// The in-memory bus is the default single-process transport; a message-
/// queue backed implementation forwards every local publish and feeds
/// remote events back in through [`EventBus::ingest`]. Implementations
/// must preserve per-publisher ordering and deliver at least once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Forward a locally published event to the external substrate.
    async fn forward(&self, event: &Event) -> Result<(), BoxError>;

    /// Transport identifier for logging.
    fn name(&self) -> &str;
}

/// Identifier returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    selector: EventSelector,
    sender: mpsc::Sender<Arc<Event>>,
}

#[derive(Default)]
struct BusState {
    history: VecDeque<Arc<Event>>,
    by_node: HashMap<String, VecDeque<Arc<Event>>>,
    by_action: HashMap<String, VecDeque<Arc<Event>>>,
    by_task: HashMap<String, VecDeque<Arc<Event>>>,
    /// Terminal envelopes kept alive for outstanding request/reply waiters.
    pinned_store: HashMap<String, Vec<Arc<Event>>>,
}

impl BusState {
    fn append(&mut self, event: Arc<Event>, cap: usize, pinned: &HashSet<String>) {
        self.history.push_back(Arc::clone(&event));
        self.by_node
            .entry(event.source_node.clone())
            .or_insert_with(VecDeque::new)
            .push_back(Arc::clone(&event));
        if let Some(action) = &event.action {
            self.by_action
                .entry(action.clone())
                .or_insert_with(VecDeque::new)
                .push_back(Arc::clone(&event));
        }
        if let Some(task_id) = &event.task_id {
            self.by_task
                .entry(task_id.clone())
                .or_insert_with(VecDeque::new)
                .push_back(Arc::clone(&event));
        }

        while self.history.len() > cap {
            let evicted = match self.history.pop_front() {
                Some(e) => e,
                None => break,
            };
            self.prune_indices(&evicted);
            // Terminal envelopes with a live waiter are retained aside.
            if evicted.event_type.is_task_terminal() {
                if let Some(task_id) = &evicted.task_id {
                    if pinned.contains(task_id) {
                        self.pinned_store
                            .entry(task_id.clone())
                            .or_insert_with(Vec::new)
                            .push(evicted);
                    }
                }
            }
        }
    }

    /// The evicted event is the oldest in the bus, so it sits at the front
    /// of every index deque it appears in.
    fn prune_indices(&mut self, evicted: &Arc<Event>) {
        if let Some(deque) = self.by_node.get_mut(&evicted.source_node) {
            if deque.front().map(|e| e.event_id == evicted.event_id) == Some(true) {
                deque.pop_front();
            }
            if deque.is_empty() {
                self.by_node.remove(&evicted.source_node);
            }
        }
        if let Some(action) = &evicted.action {
            if let Some(deque) = self.by_action.get_mut(action) {
                if deque.front().map(|e| e.event_id == evicted.event_id) == Some(true) {
                    deque.pop_front();
                }
                if deque.is_empty() {
                    self.by_action.remove(action);
                }
            }
        }
        if let Some(task_id) = &evicted.task_id {
            if let Some(deque) = self.by_task.get_mut(task_id) {
                if deque.front().map(|e| e.event_id == evicted.event_id) == Some(true) {
                    deque.pop_front();
                }
                if deque.is_empty() {
                    self.by_task.remove(task_id);
                }
            }
        }
    }
}

/// The multi-producer multi-consumer event substrate.
///
/// Constructed behind an `Arc` so subscription workers and agents can share
/// it. See the module docs for ordering, back-pressure, and retention
/// semantics.
pub struct EventBus {
    state: Mutex<BusState>,
    sequence: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Task>>>,
    pinned: Mutex<HashSet<String>>,
    history_cap: usize,
    high_water_mark: usize,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Count of shed (dropped) events, for diagnostics.
    dropped: AtomicUsize,
    /// Back-reference for workers that must republish (set at construction).
    weak_self: Mutex<Weak<EventBus>>,
}

impl EventBus {
    /// Create a bus with the given history cap and the default high-water
    /// mark.
    pub fn new(history_cap: usize) -> Arc<Self> {
        Self::with_high_water_mark(history_cap, DEFAULT_HIGH_WATER_MARK)
    }

    /// Create a bus with explicit history cap and per-subscription channel
    /// depth.
    pub fn with_high_water_mark(history_cap: usize, high_water_mark: usize) -> Arc<Self> {
        let bus = Arc::new(Self {
            state: Mutex::new(BusState::default()),
            sequence: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashSet::new()),
            history_cap: history_cap.max(1),
            high_water_mark: high_water_mark.max(1),
            transport: Mutex::new(None),
            dropped: AtomicUsize::new(0),
            weak_self: Mutex::new(Weak::new()),
        });
        *bus.weak_self.lock().expect("weak slot poisoned") = Arc::downgrade(&bus);
        bus
    }

    /// Attach an external transport; every subsequent publish is forwarded.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock().expect("transport slot poisoned") = Some(transport);
    }

    /// Number of events shed under back-pressure so far.
    pub fn dropped_events(&self) -> usize {
        self.dropped.load(Ordering::Acquire)
    }

    /// Current history length (pinned side store excluded).
    pub fn history_len(&self) -> usize {
        self.state.lock().expect("bus state poisoned").history.len()
    }

    /// Publish an event: sequence it, append it to the history and indices,
    /// resolve any matching request/reply waiter, route it to subscribers,
    /// and forward it to the external transport when one is attached.
    ///
    /// Returns the stored, sequenced event.
    pub async fn publish(&self, mut event: Event) -> Arc<Event> {
        event.sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let event = Arc::new(event);

        {
            let pinned = self.pinned.lock().expect("pinned set poisoned").clone();
            let mut state = self.state.lock().expect("bus state poisoned");
            state.append(Arc::clone(&event), self.history_cap, &pinned);
        }

        self.resolve_pending(&event);
        self.route(&event).await;

        let transport = self
            .transport
            .lock()
            .expect("transport slot poisoned")
            .clone();
        if let Some(transport) = transport {
            if let Err(e) = transport.forward(&event).await {
                warn!(
                    "transport '{}' failed to forward {}: {}",
                    transport.name(),
                    event.event_type.as_str(),
                    e
                );
            }
        }

        event
    }

    /// Ingest an event that arrived from an external transport.
    ///
    /// Same as [`publish`](EventBus::publish) but never forwarded back out,
    /// so two bridged buses don't loop.
    pub async fn ingest(&self, mut event: Event) -> Arc<Event> {
        event.sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let event = Arc::new(event);
        {
            let pinned = self.pinned.lock().expect("pinned set poisoned").clone();
            let mut state = self.state.lock().expect("bus state poisoned");
            state.append(Arc::clone(&event), self.history_cap, &pinned);
        }
        self.resolve_pending(&event);
        self.route(&event).await;
        event
    }

    fn resolve_pending(&self, event: &Arc<Event>) {
        if !event.event_type.is_task_terminal() {
            return;
        }
        let task_id = match &event.task_id {
            Some(id) => id.clone(),
            None => return,
        };
        let waiter = self
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&task_id);
        if let Some(sender) = waiter {
            if let Some(task) = event.embedded_task() {
                let _ = sender.send(task);
            }
        }
    }

    async fn route(&self, event: &Arc<Event>) {
        // Snapshot matching senders so the subscription lock is not held
        // across awaits, then deliver in registration order.
        let targets: Vec<(SubscriptionId, mpsc::Sender<Arc<Event>>)> = {
            let subs = self.subscriptions.lock().expect("subscriptions poisoned");
            subs.iter()
                .filter(|s| s.selector.matches(event))
                .map(|s| (s.id, s.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(Arc::clone(event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(held)) => {
                    if event.event_type.droppable() {
                        self.dropped.fetch_add(1, Ordering::AcqRel);
                        debug!(
                            "bus shed {} event from '{}' (subscriber saturated)",
                            event.event_type.as_str(),
                            event.source_node
                        );
                    } else {
                        // Critical event types suspend the producer instead.
                        if sender.send(held).await.is_err() {
                            dead.push(id);
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
            subs.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Register a handler for events matching `selector`.
    ///
    /// Spawns a worker that drains the subscription's channel serially and
    /// invokes the handler once per event. Handler errors are captured and
    /// re-published as `node.error` events (except for failures while
    /// handling a `node.error` event itself, which are only logged).
    pub fn subscribe(
        &self,
        selector: EventSelector,
        handler: Arc<dyn EventObserver>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::AcqRel));
        let (sender, mut receiver) = mpsc::channel::<Arc<Event>>(self.high_water_mark);

        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .push(Subscription {
                id,
                selector,
                sender,
            });

        let bus = self.weak_self.lock().expect("weak slot poisoned").clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(error) = handler.on_event(&event).await {
                    if event.event_type == EventType::NodeError {
                        warn!("subscriber failed on node.error event: {}", error);
                        continue;
                    }
                    if let Some(bus) = bus.upgrade() {
                        let mut report = Event::new(EventType::NodeError, "event-bus")
                            .with_payload(serde_json::json!({
                                "error": error.to_string(),
                                "failed_event_id": event.event_id,
                                "failed_event_type": event.event_type.as_str(),
                            }));
                        report.task_id = event.task_id.clone();
                        report.trace_id = event.trace_id.clone();
                        bus.publish(report).await;
                    }
                }
            }
        });

        id
    }

    /// Remove a subscription; its worker exits once the channel drains.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .retain(|s| s.id != id);
    }

    /// Open a raw event stream for events matching `selector`.
    ///
    /// This is the consumer-facing `stream_events` surface: the returned
    /// receiver observes matching events in publish order and is subject to
    /// the same back-pressure rules as any other subscription.
    pub fn stream_events(&self, selector: EventSelector) -> mpsc::Receiver<Arc<Event>> {
        let (sender, receiver) = mpsc::channel(self.high_water_mark);

        struct Forwarder {
            sender: mpsc::Sender<Arc<Event>>,
        }

        #[async_trait]
        impl EventObserver for Forwarder {
            async fn on_event(&self, event: &Event) -> Result<(), BoxError> {
                // A closed receiver just ends the stream; not an error.
                let _ = self.sender.send(Arc::new(event.clone())).await;
                Ok(())
            }
        }

        self.subscribe(selector, Arc::new(Forwarder { sender }));
        receiver
    }

    // ---- Queries -----------------------------------------------------------

    /// Most recent events published by `node_id`, newest first.
    pub async fn query_by_node(&self, node_id: &str, limit: usize) -> Vec<Arc<Event>> {
        let state = self.state.lock().expect("bus state poisoned");
        state
            .by_node
            .get(node_id)
            .map(|deque| deque.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent envelope events carrying `action`, newest first.
    pub async fn query_by_action(&self, action: &str, limit: usize) -> Vec<Arc<Event>> {
        let state = self.state.lock().expect("bus state poisoned");
        state
            .by_action
            .get(action)
            .map(|deque| deque.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// All retained events for a task, oldest first (pinned envelopes
    /// included).
    pub async fn query_by_task(&self, task_id: &str) -> Vec<Arc<Event>> {
        let state = self.state.lock().expect("bus state poisoned");
        let mut events: Vec<Arc<Event>> = state
            .pinned_store
            .get(task_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        if let Some(deque) = state.by_task.get(task_id) {
            events.extend(deque.iter().cloned());
        }
        events.sort_by_key(|e| e.sequence);
        events
    }

    /// The most recent `limit` events across all producers, newest first.
    pub async fn query_recent(&self, limit: usize) -> Vec<Arc<Event>> {
        let state = self.state.lock().expect("bus state poisoned");
        state.history.iter().rev().take(limit).cloned().collect()
    }

    /// Keyword-relevance scan over the retained history.
    ///
    /// Scores each event by the fraction of distinct query words found in
    /// its payload text and action, returning the best `limit` matches
    /// (ties resolved newest first). This is a bounded scan, not an index
    /// lookup — callers use it for peer inspection, not hot paths.
    pub async fn search_relevant(&self, text: &str, limit: usize) -> Vec<Arc<Event>> {
        let words: Vec<String> = text
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        if words.is_empty() {
            return Vec::new();
        }

        let state = self.state.lock().expect("bus state poisoned");
        let mut scored: Vec<(f64, Arc<Event>)> = state
            .history
            .iter()
            .filter_map(|event| {
                let haystack = format!(
                    "{} {}",
                    event.action.as_deref().unwrap_or(""),
                    event.payload
                )
                .to_lowercase();
                let matched = words.iter().filter(|w| haystack.contains(*w)).count();
                if matched == 0 {
                    None
                } else {
                    Some((matched as f64 / words.len() as f64, Arc::clone(event)))
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.sequence.cmp(&a.1.sequence))
        });
        scored.into_iter().take(limit).map(|(_, e)| e).collect()
    }

    // ---- Request / reply ---------------------------------------------------

    /// Publish a task envelope to `target_node` and await the correlated
    /// terminal envelope.
    ///
    /// The task's id is pinned for the duration so its terminal event
    /// cannot be evicted before this waiter observes it. Fails with
    /// [`AgentError::Timeout`] when no reply arrives within `timeout`, or
    /// [`AgentError::TaskFailed`] when the replied task is failed.
    pub async fn request_reply(
        &self,
        target_node: &str,
        task: Task,
        timeout: Duration,
    ) -> Result<Task, AgentError> {
        let task_id = task.task_id.clone();
        let (sender, receiver) = oneshot::channel();

        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(task_id.clone(), sender);
        self.pinned
            .lock()
            .expect("pinned set poisoned")
            .insert(task_id.clone());

        let envelope = Event::new(EventType::TaskSubmit, task.source_agent.clone())
            .with_target(target_node)
            .with_task(task_id.as_str())
            .with_action(task.action.as_str())
            .with_trace(task.metadata.trace_id.clone(), task.metadata.span_id.clone())
            .with_payload(serde_json::json!({ "task": task }));
        self.publish(envelope).await;

        let outcome = tokio::time::timeout(timeout, receiver).await;

        // Unpin and release any stashed terminal events.
        self.pinned.lock().expect("pinned set poisoned").remove(&task_id);
        self.state
            .lock()
            .expect("bus state poisoned")
            .pinned_store
            .remove(&task_id);

        match outcome {
            Ok(Ok(task)) => {
                if task.status == TaskStatus::Failed {
                    let message = task
                        .result
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "task failed".to_string());
                    Err(AgentError::TaskFailed(message))
                } else {
                    Ok(task)
                }
            }
            Ok(Err(_)) => Err(AgentError::Internal(
                "reply channel closed before completion".to_string(),
            )),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&task_id);
                Err(AgentError::Timeout(format!(
                    "request_reply for task {} after {:?}",
                    task_id, timeout
                )))
            }
        }
    }
}
