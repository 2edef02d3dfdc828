//! Session lifecycle and multi-session control.
//!
//! A [`Session`] owns one conversation's task flow: tasks submitted
//! through it are stamped with the session id, travel the event bus as
//! `task.submit` envelopes, run on the session's agent, and (optionally)
//! land in a hash-chained
//! [`EventJournal`](crate::event_journal::EventJournal) for persistence.
//!
//! Session status is monotonic: `Active → Paused → Ended`. Paused and
//! ended sessions reject new tasks.
//!
//! A [`SessionController`] manages several sessions bound to the same
//! agent infrastructure and provides cross-session operations:
//! [`aggregate_context`](SessionController::aggregate_context) merges
//! per-session assemblies under a proportional re-budget, and
//! [`distribute_task`](SessionController::distribute_task) broadcasts a
//! task across (a filtered subset of) sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::agent::Agent;
//! use agentmesh::clients::scripted::ScriptedClient;
//! use agentmesh::session::Session;
//! use agentmesh::task::{Task, TaskAction};
//! use std::sync::Arc;
//!
//! # async {
//! let client = Arc::new(ScriptedClient::replying(vec!["hi".to_string()]));
//! let agent = Arc::new(Agent::new("assistant", client).await);
//! let session = Session::new("s1", agent);
//!
//! let done = session
//!     .add_task(Task::new(TaskAction::Execute, "say hi"))
//!     .await
//!     .unwrap();
//! assert_eq!(done.result.content, "hi");
//! # };
//! ```

use crate::agentmesh::agent::Agent;
use crate::agentmesh::client_wrapper::Message;
use crate::agentmesh::error::AgentError;
use crate::agentmesh::event::{Event, EventSelector, EventType};
use crate::agentmesh::event_journal::EventJournal;
use crate::agentmesh::event_bus::EventObserver;
use crate::agentmesh::task::Task;
use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Lifecycle state of a session; transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting tasks.
    Active,
    /// Suspended; tasks rejected, state retained.
    Paused,
    /// Finished; terminal.
    Ended,
}

impl SessionStatus {
    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Active => 0,
            SessionStatus::Paused => 1,
            SessionStatus::Ended => 2,
        }
    }
}

/// One conversation's task flow, bound to an agent.
pub struct Session {
    /// Session identifier.
    pub id: String,
    agent: Arc<Agent>,
    status: RwLock<SessionStatus>,
    task_ids: RwLock<Vec<String>>,
    journal: Option<Arc<Mutex<EventJournal>>>,
}

impl Session {
    /// Create an active session bound to `agent`.
    pub fn new(id: impl Into<String>, agent: Arc<Agent>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            agent,
            status: RwLock::new(SessionStatus::Active),
            task_ids: RwLock::new(Vec::new()),
            journal: None,
        })
    }

    /// Create a session that journals its events under `journal_dir`.
    ///
    /// Every bus event carrying one of the session's task ids is appended
    /// to the hash-chained journal. Returns an error when the journal file
    /// cannot be opened.
    pub fn with_journal(
        id: impl Into<String>,
        agent: Arc<Agent>,
        journal_dir: &PathBuf,
    ) -> std::io::Result<Arc<Self>> {
        let id = id.into();
        let journal = Arc::new(Mutex::new(EventJournal::open(journal_dir, &id)?));

        let session = Arc::new(Self {
            id,
            agent,
            status: RwLock::new(SessionStatus::Active),
            task_ids: RwLock::new(Vec::new()),
            journal: Some(Arc::clone(&journal)),
        });

        struct Journaler {
            session: std::sync::Weak<Session>,
            journal: Arc<Mutex<EventJournal>>,
        }

        #[async_trait]
        impl EventObserver for Journaler {
            async fn on_event(
                &self,
                event: &Event,
            ) -> Result<(), crate::agentmesh::error::BoxError> {
                let session = match self.session.upgrade() {
                    Some(session) => session,
                    None => return Ok(()),
                };
                let belongs = match &event.task_id {
                    Some(task_id) => session.task_ids.read().await.contains(task_id),
                    None => false,
                };
                if belongs {
                    if let Err(e) = self.journal.lock().expect("journal poisoned").append(event)
                    {
                        warn!("session {} journal append failed: {}", session.id, e);
                    }
                }
                Ok(())
            }
        }

        session.agent.bus().subscribe(
            EventSelector::all(),
            Arc::new(Journaler {
                session: Arc::downgrade(&session),
                journal,
            }),
        );

        Ok(session)
    }

    /// The session's current status.
    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    /// The agent bound to this session.
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Ids of tasks submitted through this session, in submission order.
    pub async fn task_ids(&self) -> Vec<String> {
        self.task_ids.read().await.clone()
    }

    /// Borrow the journal, when journaling is enabled.
    pub fn journal(&self) -> Option<&Arc<Mutex<EventJournal>>> {
        self.journal.as_ref()
    }

    async fn transition(&self, next: SessionStatus) -> bool {
        let mut status = self.status.write().await;
        if next.rank() <= status.rank() {
            return false;
        }
        *status = next;
        true
    }

    /// Submit a task and run it to a terminal status.
    ///
    /// The task is stamped with the session id, announced on the bus as a
    /// `task.submit` envelope, run on the session's agent, and returned in
    /// its terminal state. Fails with an internal error when the session
    /// is not active.
    pub async fn add_task(&self, mut task: Task) -> Result<Task, AgentError> {
        if self.status().await != SessionStatus::Active {
            return Err(AgentError::Internal(format!(
                "session {} is not active",
                self.id
            )));
        }

        task.session_id = Some(self.id.clone());
        if task.target_agent.is_empty() {
            task.target_agent = self.agent.id.clone();
        }
        self.task_ids.write().await.push(task.task_id.clone());

        // The envelope is informational (journals, peer inspection); the
        // session drives the agent itself, so no target is set — a
        // serve()d agent must not pick the task up a second time.
        self.agent
            .bus()
            .publish(
                Event::new(EventType::TaskSubmit, "session")
                    .with_task(task.task_id.as_str())
                    .with_action(task.action.as_str())
                    .with_trace(task.metadata.trace_id.clone(), task.metadata.span_id.clone())
                    .with_payload(serde_json::json!({ "task": &task })),
            )
            .await;

        Ok(self.agent.run(task).await)
    }

    /// Cooperatively cancel a running task submitted through this session.
    pub async fn cancel(&self, task_id: &str) {
        self.agent.cancel(task_id).await;
    }

    /// Pause the session. Returns `false` if it was already paused/ended.
    pub async fn pause(&self) -> bool {
        self.transition(SessionStatus::Paused).await
    }

    /// End the session. Terminal; running tasks are cancelled.
    pub async fn end(&self) {
        self.transition(SessionStatus::Ended).await;
        for task_id in self.task_ids.read().await.iter() {
            self.agent.cancel(task_id).await;
        }
    }

    /// Assemble the session's context for a probe task.
    ///
    /// Used by the controller's aggregation; the probe is stamped with the
    /// session id so session-filtered sources apply.
    pub async fn build_context(&self, task: &Task) -> Result<Vec<Message>, AgentError> {
        let mut probe = task.clone();
        probe.session_id = Some(self.id.clone());
        self.agent.orchestrator().build_context(&probe, 0).await
    }
}

/// Manages multiple sessions over shared agent infrastructure.
pub struct SessionController {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionController {
    /// Create an empty controller.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session; replaces any session with the same id.
    pub async fn register(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove and end a session.
    pub async fn end_session(&self, id: &str) {
        let session = self.sessions.write().await.remove(id);
        if let Some(session) = session {
            session.end().await;
        }
    }

    /// Ids of all registered sessions.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Merge per-session context assemblies under a proportional budget.
    ///
    /// Each selected session contributes an assembly for `task`; the
    /// merged list keeps the first session's system prompt, then takes
    /// messages from each session round-robin-by-session up to an equal
    /// share of `max_tokens` (estimated at four characters per token).
    pub async fn aggregate_context(
        &self,
        task: &Task,
        session_ids: &[String],
        max_tokens: usize,
    ) -> Vec<Message> {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.read().await;
            session_ids
                .iter()
                .filter_map(|id| map.get(id).cloned())
                .collect()
        };
        if sessions.is_empty() {
            return Vec::new();
        }

        let share = max_tokens / sessions.len();
        let mut merged: Vec<Message> = Vec::new();
        let mut system_taken = false;

        for session in &sessions {
            let assembly = match session.build_context(task).await {
                Ok(messages) => messages,
                Err(e) => {
                    debug!("session {} assembly failed: {}", session.id, e);
                    continue;
                }
            };
            let mut spent = 0usize;
            for (position, message) in assembly.into_iter().enumerate() {
                // Each per-session assembly leads with its system prompt;
                // the merged view keeps only the first one.
                if position == 0
                    && matches!(
                        message.role,
                        crate::agentmesh::client_wrapper::Role::System
                    )
                {
                    if !system_taken {
                        system_taken = true;
                        merged.insert(0, message);
                    }
                    continue;
                }
                let cost = (message.content.len() / 4).max(1);
                if spent + cost > share {
                    continue;
                }
                spent += cost;
                merged.push(message);
            }
        }
        merged
    }

    /// Broadcast a task across sessions, optionally filtered by id.
    ///
    /// Each selected session receives its own copy of the task (fresh task
    /// id, session stamped); copies run concurrently and the terminal
    /// tasks are returned in session-id order.
    pub async fn distribute_task(
        &self,
        task: &Task,
        session_ids: Option<&[String]>,
    ) -> Vec<Task> {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.read().await;
            let mut selected: Vec<Arc<Session>> = match session_ids {
                Some(ids) => ids.iter().filter_map(|id| map.get(id).cloned()).collect(),
                None => map.values().cloned().collect(),
            };
            selected.sort_by(|a, b| a.id.cmp(&b.id));
            selected
        };

        let runs = sessions.iter().map(|session| {
            let mut copy = task.clone();
            copy.task_id = uuid::Uuid::new_v4().to_string();
            copy.session_id = Some(session.id.clone());
            let session = Arc::clone(session);
            async move { session.add_task(copy).await }
        });

        join_all(runs)
            .await
            .into_iter()
            .filter_map(|outcome| outcome.ok())
            .collect()
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::clients::scripted::ScriptedClient;
    use crate::agentmesh::task::{TaskAction, TaskStatus};

    async fn agent_with(replies: Vec<&str>) -> Arc<Agent> {
        let client = Arc::new(ScriptedClient::replying(
            replies.into_iter().map(String::from).collect(),
        ));
        Arc::new(Agent::new("assistant", client).await)
    }

    #[tokio::test]
    async fn test_add_task_runs_to_completion() {
        let session = Session::new("s1", agent_with(vec!["the answer"]).await);
        let done = session
            .add_task(Task::new(TaskAction::Execute, "question"))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.content, "the answer");
        assert_eq!(done.session_id.as_deref(), Some("s1"));
        assert_eq!(session.task_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_status_monotonic() {
        let session = Session::new("s1", agent_with(vec![]).await);
        assert_eq!(session.status().await, SessionStatus::Active);
        assert!(session.pause().await);
        assert!(!session.pause().await);
        session.end().await;
        assert_eq!(session.status().await, SessionStatus::Ended);

        let rejected = session
            .add_task(Task::new(TaskAction::Execute, "late"))
            .await;
        assert!(rejected.is_err());
    }

    #[tokio::test]
    async fn test_paused_session_rejects_tasks() {
        let session = Session::new("s1", agent_with(vec!["x"]).await);
        session.pause().await;
        assert!(session
            .add_task(Task::new(TaskAction::Execute, "nope"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_distribute_task_across_sessions() {
        let controller = SessionController::new();
        controller
            .register(Session::new("s1", agent_with(vec!["from s1"]).await))
            .await;
        controller
            .register(Session::new("s2", agent_with(vec!["from s2"]).await))
            .await;

        let task = Task::new(TaskAction::Execute, "broadcast");
        let results = controller.distribute_task(&task, None).await;
        assert_eq!(results.len(), 2);
        let sessions: Vec<&str> = results
            .iter()
            .map(|t| t.session_id.as_deref().unwrap())
            .collect();
        assert_eq!(sessions, vec!["s1", "s2"]);
        // Each copy got its own id.
        assert_ne!(results[0].task_id, results[1].task_id);
        assert_ne!(results[0].task_id, task.task_id);
    }

    #[tokio::test]
    async fn test_distribute_task_filtered() {
        let controller = SessionController::new();
        controller
            .register(Session::new("s1", agent_with(vec!["one"]).await))
            .await;
        controller
            .register(Session::new("s2", agent_with(vec!["two"]).await))
            .await;

        let task = Task::new(TaskAction::Execute, "selective");
        let results = controller
            .distribute_task(&task, Some(&["s2".to_string()]))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_aggregate_context_merges_sessions() {
        let controller = SessionController::new();
        controller
            .register(Session::new("s1", agent_with(vec![]).await))
            .await;
        controller
            .register(Session::new("s2", agent_with(vec![]).await))
            .await;

        let task = Task::new(TaskAction::Execute, "what is the status?");
        let merged = controller
            .aggregate_context(
                &task,
                &["s1".to_string(), "s2".to_string()],
                4_000,
            )
            .await;
        // At minimum the probe's user message appears per session.
        let users = merged
            .iter()
            .filter(|m| m.role == crate::agentmesh::client_wrapper::Role::User)
            .count();
        assert!(users >= 1);
    }
}
