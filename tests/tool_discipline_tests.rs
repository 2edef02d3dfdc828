use agentmesh::agent::AgentSetup;
use agentmesh::clients::scripted::{ScriptedClient, ScriptedTurn};
use agentmesh::event::EventType;
use agentmesh::task::{Task, TaskAction, TaskStatus};
use agentmesh::tool_protocol::{ToolMetadata, ToolRegistry, ToolResult, ToolScope};
use agentmesh::tool_protocols::FunctionToolProtocol;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

// Parallel read, serial write, end to end through the agent loop: the LLM
// issues [read_a, read_b, write_c]; the reads overlap, the write runs
// strictly after both, and results return in issued order.
#[tokio::test]
async fn test_parallel_reads_serial_write_through_loop() {
    let reads_in_flight = Arc::new(AtomicUsize::new(0));
    let read_peak = Arc::new(AtomicUsize::new(0));
    let reads_finished = Arc::new(AtomicUsize::new(0));

    let protocol = Arc::new(FunctionToolProtocol::new());
    for name in ["read_a", "read_b"] {
        let in_flight = Arc::clone(&reads_in_flight);
        let peak = Arc::clone(&read_peak);
        let finished = Arc::clone(&reads_finished);
        protocol
            .register_async_tool(
                ToolMetadata::new(name, "Reads a value", ToolScope::Context),
                Arc::new(move |_params, _| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    let finished = Arc::clone(&finished);
                    Box::pin(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(ToolResult::ok(json!("read value")))
                    })
                }),
            )
            .await;
    }
    {
        let finished = Arc::clone(&reads_finished);
        protocol
            .register_async_tool(
                ToolMetadata::new("write_c", "Writes a value", ToolScope::System),
                Arc::new(move |_params, _| {
                    let finished = Arc::clone(&finished);
                    Box::pin(async move {
                        assert_eq!(
                            finished.load(Ordering::SeqCst),
                            2,
                            "write_c must run strictly after both reads returned"
                        );
                        Ok(ToolResult::ok(json!("written")))
                    })
                }),
            )
            .await;
    }
    let mut registry = ToolRegistry::new();
    registry.add_protocol("functions", protocol).await.unwrap();

    let client = Arc::new(ScriptedClient::new(vec![
        ScriptedTurn::tool_calls(vec![
            ("read_a", json!({})),
            ("read_b", json!({})),
            ("write_c", json!({})),
        ]),
        ScriptedTurn::tool_call("done", json!({"content": "batch handled"})),
    ]));

    let agent = AgentSetup::default()
        .tools(Arc::new(RwLock::new(registry)))
        .build("batcher", client)
        .await;

    let task = Task::new(TaskAction::Execute, "read twice then write");
    let task_id = task.task_id.clone();
    let done = agent.run(task).await;
    assert_eq!(done.status, TaskStatus::Completed);

    assert!(
        read_peak.load(Ordering::SeqCst) >= 2,
        "read_a and read_b must overlap"
    );

    // tool.call events appear in issued order; write_c's result comes
    // after both read results on the bus.
    let events = agent.bus().query_by_task(&task_id).await;
    let call_order: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall)
        .filter_map(|e| e.payload["tool"].as_str())
        .filter(|t| *t != "done")
        .collect();
    assert_eq!(call_order.len(), 3);
    assert!(call_order.contains(&"read_a"));
    assert!(call_order.contains(&"read_b"));
    assert_eq!(call_order[2], "write_c", "write_c dispatched last");

    let write_result_seq = events
        .iter()
        .find(|e| e.event_type == EventType::ToolResult && e.payload["tool"] == "write_c")
        .map(|e| e.sequence)
        .unwrap();
    for read in ["read_a", "read_b"] {
        let read_result_seq = events
            .iter()
            .find(|e| e.event_type == EventType::ToolResult && e.payload["tool"] == read)
            .map(|e| e.sequence)
            .unwrap();
        assert!(
            read_result_seq < write_result_seq,
            "{} result precedes write_c result",
            read
        );
    }
}
