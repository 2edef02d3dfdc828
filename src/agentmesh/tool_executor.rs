//! Batched tool execution with read/write discipline.
//!
//! The [`ToolExecutor`] runs the tool calls an LLM issued in one response.
//! Calls are classified as read-only or mutating from the registry's
//! metadata (unknown tools default to mutating), then partitioned into
//! maximal contiguous groups of the same class **preserving LLM-issued
//! order**. Read-only groups execute concurrently under a bounded
//! semaphore (default 10 permits); mutating groups execute strictly
//! serially. Whatever the completion order, results are reassembled in the
//! order the calls were issued.
//!
//! Per call, the executor:
//!
//! 1. publishes a `tool.call` event,
//! 2. runs the tool under the per-call deadline (and the task's
//!    cancellation token),
//! 3. truncates oversized output (default cap 100k characters, with a
//!    marker), and
//! 4. publishes a `tool.result` event carrying success and the (truncated)
//!    output.
//!
//! Tool failures never raise: they come back as failed [`ToolResult`]s for
//! the agent loop to relay to the LLM as tool-role messages.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::client_wrapper::ToolCallRequest;
//! use agentmesh::event_bus::EventBus;
//! use agentmesh::tool_executor::ToolExecutor;
//! use agentmesh::tool_protocol::ToolRegistry;
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! # async {
//! let registry = Arc::new(RwLock::new(ToolRegistry::new()));
//! let bus = EventBus::new(1_000);
//! let executor = ToolExecutor::new(registry, bus);
//!
//! let calls = vec![ToolCallRequest {
//!     id: "call_0".into(),
//!     name: "echo".into(),
//!     arguments: serde_json::json!({"text": "hi"}),
//! }];
//! let outcomes = executor.execute_batch(&calls, "agent-1", None).await;
//! assert_eq!(outcomes.len(), 1);
//! # };
//! ```

use crate::agentmesh::cancel::CancelToken;
use crate::agentmesh::client_wrapper::ToolCallRequest;
use crate::agentmesh::event::{Event, EventType};
use crate::agentmesh::event_bus::EventBus;
use crate::agentmesh::task::Task;
use crate::agentmesh::tool_protocol::{ToolRegistry, ToolResult};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

/// Default per-call deadline.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on serialized tool output, in characters.
const DEFAULT_OUTPUT_CHAR_CAP: usize = 100_000;

/// Marker appended to truncated tool output.
const TRUNCATION_MARKER: &str = "…[output truncated]";

/// Outcome of one call in a batch, in LLM-issued order.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// The originating call.
    pub call: ToolCallRequest,
    /// The (possibly failed, possibly truncated) result.
    pub result: ToolResult,
}

/// Executes batches of tool calls against a shared registry.
pub struct ToolExecutor {
    registry: Arc<RwLock<ToolRegistry>>,
    bus: Arc<EventBus>,
    concurrency_limit: usize,
    call_timeout: Duration,
    output_char_cap: usize,
}

impl ToolExecutor {
    /// Create an executor with default limits (10 concurrent read-only
    /// calls, 120 s per call, 100k character output cap).
    pub fn new(registry: Arc<RwLock<ToolRegistry>>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            bus,
            concurrency_limit: 10,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            output_char_cap: DEFAULT_OUTPUT_CHAR_CAP,
        }
    }

    /// Override the read-only concurrency cap (builder pattern).
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Override the per-call deadline (builder pattern).
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override the output character cap (builder pattern).
    pub fn with_output_char_cap(mut self, cap: usize) -> Self {
        self.output_char_cap = cap.max(TRUNCATION_MARKER.len());
        self
    }

    /// Borrow the shared registry handle.
    pub fn registry(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.registry
    }

    /// Execute a batch of tool calls, returning outcomes in issued order.
    ///
    /// `task` scopes the published events (task id and trace); when `None`
    /// the events carry only the source node. Cancellation is honored
    /// between and during calls via the optional token inside `task`'s
    /// scope — see [`execute_batch_cancellable`](Self::execute_batch_cancellable).
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallRequest],
        source_node: &str,
        task: Option<&Task>,
    ) -> Vec<ToolOutcome> {
        self.execute_batch_cancellable(calls, source_node, task, &CancelToken::new())
            .await
    }

    /// Execute a batch under a cooperative cancellation token.
    ///
    /// On cancellation, calls not yet started return failed results and
    /// in-flight calls are abandoned at their next suspension point; their
    /// partial results are discarded.
    pub async fn execute_batch_cancellable(
        &self,
        calls: &[ToolCallRequest],
        source_node: &str,
        task: Option<&Task>,
        cancel: &CancelToken,
    ) -> Vec<ToolOutcome> {
        let mut outcomes: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));

        // Partition into maximal contiguous same-class groups, preserving
        // issued order.
        let classes: Vec<bool> = {
            let registry = self.registry.read().await;
            calls.iter().map(|c| registry.is_read_only(&c.name)).collect()
        };

        let mut index = 0;
        while index < calls.len() {
            let read_only = classes[index];
            let mut end = index + 1;
            while end < calls.len() && classes[end] == read_only {
                end += 1;
            }

            if cancel.is_cancelled() {
                for i in index..calls.len() {
                    outcomes[i] = Some(ToolOutcome {
                        call: calls[i].clone(),
                        result: ToolResult::err("cancelled before execution"),
                    });
                }
                break;
            }

            if read_only {
                // Concurrent group under the semaphore; results land by index.
                let mut handles = Vec::with_capacity(end - index);
                for i in index..end {
                    let call = calls[i].clone();
                    let permit_source = Arc::clone(&semaphore);
                    let executor = self.clone_handles();
                    let source = source_node.to_string();
                    let task = task.cloned();
                    let cancel = cancel.clone();
                    handles.push((
                        i,
                        tokio::spawn(async move {
                            let _permit = permit_source
                                .acquire()
                                .await
                                .expect("semaphore closed");
                            executor.run_one(&call, &source, task.as_ref(), &cancel).await
                        }),
                    ));
                }
                for (i, handle) in handles {
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(join_error) => ToolOutcome {
                            call: calls[i].clone(),
                            result: ToolResult::err(format!(
                                "tool task panicked: {}",
                                join_error
                            )),
                        },
                    };
                    outcomes[i] = Some(outcome);
                }
            } else {
                for i in index..end {
                    if cancel.is_cancelled() {
                        outcomes[i] = Some(ToolOutcome {
                            call: calls[i].clone(),
                            result: ToolResult::err("cancelled before execution"),
                        });
                        continue;
                    }
                    outcomes[i] =
                        Some(self.run_one(&calls[i], source_node, task, cancel).await);
                }
            }

            index = end;
        }

        outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| {
                outcome.unwrap_or_else(|| ToolOutcome {
                    call: calls[i].clone(),
                    result: ToolResult::err("call skipped"),
                })
            })
            .collect()
    }

    /// Shallow handle clone used to move the executor into spawned calls.
    fn clone_handles(&self) -> ToolExecutor {
        ToolExecutor {
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            concurrency_limit: self.concurrency_limit,
            call_timeout: self.call_timeout,
            output_char_cap: self.output_char_cap,
        }
    }

    async fn run_one(
        &self,
        call: &ToolCallRequest,
        source_node: &str,
        task: Option<&Task>,
        cancel: &CancelToken,
    ) -> ToolOutcome {
        let mut event = Event::new(EventType::ToolCall, source_node).with_payload(
            serde_json::json!({
                "call_id": call.id,
                "tool": call.name,
                "arguments": call.arguments,
            }),
        );
        if let Some(task) = task {
            event.task_id = Some(task.task_id.clone());
            event.trace_id = task.metadata.trace_id.clone();
            event.span_id = task.metadata.span_id.clone();
        }
        self.bus.publish(event).await;

        let started = std::time::Instant::now();
        let execution = async {
            let registry = self.registry.read().await;
            registry.execute_tool(&call.name, call.arguments.clone()).await
        };

        let raw = tokio::select! {
            outcome = tokio::time::timeout(self.call_timeout, execution) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(error)) => ToolResult::err(error.to_string()),
                Err(_) => {
                    warn!(
                        "tool '{}' exceeded its {}s deadline",
                        call.name,
                        self.call_timeout.as_secs()
                    );
                    ToolResult::err(format!(
                        "deadline expired after {}s",
                        self.call_timeout.as_secs()
                    ))
                }
            },
            _ = cancel.cancelled() => {
                debug!("tool '{}' abandoned on cancellation", call.name);
                ToolResult::err("cancelled")
            }
        };

        let result = self.truncate_output(raw);

        let mut event = Event::new(EventType::ToolResult, source_node).with_payload(
            serde_json::json!({
                "call_id": call.id,
                "tool": call.name,
                "success": result.is_ok(),
                "output": result.output(),
                "error": result.error(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        if let Some(task) = task {
            event.task_id = Some(task.task_id.clone());
            event.trace_id = task.metadata.trace_id.clone();
            event.span_id = task.metadata.span_id.clone();
        }
        self.bus.publish(event).await;

        ToolOutcome {
            call: call.clone(),
            result,
        }
    }

    /// Cap the serialized size of a successful result's output.
    fn truncate_output(&self, result: ToolResult) -> ToolResult {
        let (output, annotations) = match result {
            ToolResult::Ok {
                output,
                annotations,
            } => (output, annotations),
            failed => return failed,
        };

        let serialized = output.to_string();
        if serialized.len() <= self.output_char_cap {
            return ToolResult::Ok {
                output,
                annotations,
            };
        }

        let keep = self.output_char_cap - TRUNCATION_MARKER.len();
        let mut cut = keep;
        while cut > 0 && !serialized.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}{}", &serialized[..cut], TRUNCATION_MARKER);
        let mut annotations = annotations;
        annotations.insert("truncated".to_string(), serde_json::Value::Bool(true));
        ToolResult::Ok {
            output: serde_json::Value::String(truncated),
            annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::tool_protocol::{ArgKind, ArgSpec, ToolMetadata, ToolScope};
    use crate::agentmesh::tool_protocols::FunctionToolProtocol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup(
        protocol: Arc<FunctionToolProtocol>,
    ) -> (ToolExecutor, Arc<EventBus>) {
        let mut registry = ToolRegistry::new();
        registry.add_protocol("functions", protocol).await.unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let bus = EventBus::new(1_000);
        (ToolExecutor::new(registry, Arc::clone(&bus)), bus)
    }

    fn call(i: usize, name: &str, arguments: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest {
            id: format!("call_{}", i),
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_results_in_issued_order() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        protocol
            .register_async_tool(
                ToolMetadata::new("slow", "Sleeps then echoes", ToolScope::Context),
                Arc::new(|params, _| {
                    Box::pin(async move {
                        let ms = params["ms"].as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(ToolResult::ok(serde_json::json!({"ms": ms})))
                    })
                }),
            )
            .await;
        let (executor, _bus) = setup(protocol).await;

        // First call finishes last; results must still come back in order.
        let calls = vec![
            call(0, "slow", serde_json::json!({"ms": 80})),
            call(1, "slow", serde_json::json!({"ms": 10})),
            call(2, "slow", serde_json::json!({"ms": 1})),
        ];
        let outcomes = executor.execute_batch(&calls, "agent", None).await;
        let order: Vec<u64> = outcomes
            .iter()
            .map(|o| o.result.output()["ms"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![80, 10, 1]);
    }

    #[tokio::test]
    async fn test_read_only_overlap_and_mutating_serialization() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            protocol
                .register_async_tool(
                    ToolMetadata::new("read", "Read-only probe", ToolScope::Context),
                    Arc::new(move |_params, _| {
                        let concurrent = Arc::clone(&concurrent);
                        let peak = Arc::clone(&peak);
                        Box::pin(async move {
                            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                            Ok(ToolResult::ok(serde_json::json!("read")))
                        })
                    }),
                )
                .await;
        }
        {
            let concurrent = Arc::clone(&concurrent);
            protocol
                .register_async_tool(
                    ToolMetadata::new("write", "Mutating op", ToolScope::System),
                    Arc::new(move |_params, _| {
                        let concurrent = Arc::clone(&concurrent);
                        Box::pin(async move {
                            assert_eq!(
                                concurrent.load(Ordering::SeqCst),
                                0,
                                "mutating call overlapped another call"
                            );
                            Ok(ToolResult::ok(serde_json::json!("write")))
                        })
                    }),
                )
                .await;
        }

        let (executor, _bus) = setup(protocol).await;
        let calls = vec![
            call(0, "read", serde_json::json!({})),
            call(1, "read", serde_json::json!({})),
            call(2, "write", serde_json::json!({})),
        ];
        let outcomes = executor.execute_batch(&calls, "agent", None).await;

        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(
            peak.load(Ordering::SeqCst) >= 2,
            "read-only calls must overlap"
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            protocol
                .register_async_tool(
                    ToolMetadata::new("read", "Read-only probe", ToolScope::Context),
                    Arc::new(move |_params, _| {
                        let concurrent = Arc::clone(&concurrent);
                        let peak = Arc::clone(&peak);
                        Box::pin(async move {
                            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                            Ok(ToolResult::ok(serde_json::json!(null)))
                        })
                    }),
                )
                .await;
        }

        let (executor, _bus) = setup(protocol).await;
        let executor = executor.with_concurrency_limit(2);
        let calls: Vec<ToolCallRequest> = (0..8)
            .map(|i| call(i, "read", serde_json::json!({})))
            .collect();
        executor.execute_batch(&calls, "agent", None).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_without_raising() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        protocol
            .register_tool(
                ToolMetadata::new("echo", "Echo", ToolScope::Context)
                    .with_arg(ArgSpec::required("text", ArgKind::String)),
                Arc::new(|params| Ok(ToolResult::ok(params))),
            )
            .await;
        let (executor, _bus) = setup(protocol).await;

        let calls = vec![call(0, "echo", serde_json::json!({"wrong": 1}))];
        let outcomes = executor.execute_batch(&calls, "agent", None).await;
        assert!(!outcomes[0].result.is_ok());
        assert!(outcomes[0]
            .result
            .error()
            .unwrap()
            .contains("required argument 'text'"));
    }

    #[tokio::test]
    async fn test_timeout_yields_failed_result() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        protocol
            .register_async_tool(
                ToolMetadata::new("stall", "Never returns", ToolScope::Context),
                Arc::new(|_params, _| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(ToolResult::ok(serde_json::json!(null)))
                    })
                }),
            )
            .await;
        let (executor, _bus) = setup(protocol).await;
        let executor = executor.with_call_timeout(Duration::from_millis(50));

        let calls = vec![call(0, "stall", serde_json::json!({}))];
        let outcomes = executor.execute_batch(&calls, "agent", None).await;
        assert!(!outcomes[0].result.is_ok());
        assert!(outcomes[0].result.error().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        protocol
            .register_tool(
                ToolMetadata::new("blob", "Huge output", ToolScope::Context),
                Arc::new(|_| {
                    Ok(ToolResult::ok(serde_json::json!(
                        "x".repeat(10_000)
                    )))
                }),
            )
            .await;
        let (executor, _bus) = setup(protocol).await;
        let executor = executor.with_output_char_cap(100);

        let calls = vec![call(0, "blob", serde_json::json!({}))];
        let outcomes = executor.execute_batch(&calls, "agent", None).await;
        let output = outcomes[0].result.output().as_str().unwrap().to_string();
        assert!(output.len() <= 100);
        assert!(output.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            outcomes[0].result.annotations().unwrap()["truncated"],
            true
        );
    }

    #[tokio::test]
    async fn test_events_published_per_call() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        protocol
            .register_tool(
                ToolMetadata::new("ping", "Ping", ToolScope::Context),
                Arc::new(|_| Ok(ToolResult::ok(serde_json::json!("pong")))),
            )
            .await;
        let (executor, bus) = setup(protocol).await;

        let calls = vec![call(0, "ping", serde_json::json!({}))];
        executor.execute_batch(&calls, "agent", None).await;

        let recent = bus.query_recent(10).await;
        let types: Vec<EventType> = recent.iter().rev().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::ToolCall, EventType::ToolResult]);
    }

    #[tokio::test]
    async fn test_cancellation_discards_pending_calls() {
        let protocol = Arc::new(FunctionToolProtocol::new());
        protocol
            .register_tool(
                ToolMetadata::new("noop", "No-op", ToolScope::System),
                Arc::new(|_| Ok(ToolResult::ok(serde_json::json!(null)))),
            )
            .await;
        let (executor, _bus) = setup(protocol).await;

        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = vec![call(0, "noop", serde_json::json!({}))];
        let outcomes = executor
            .execute_batch_cancellable(&calls, "agent", None, &cancel)
            .await;
        assert!(!outcomes[0].result.is_ok());
    }
}
