//! Benchmark to measure the cost of context assembly under load.
//!
//! This benchmark demonstrates that priority ordering, deduplication, and
//! budget enforcement are negligible compared to LLM round-trip time, even
//! with full memory tiers.
//!
//! Run with: cargo bench --bench context_assembly_bench

use agentmesh::context_orchestrator::{ContextConfig, ContextOrchestrator};
use agentmesh::context_source::{
    ContextCounter, ContextSource, MemoryTierSource, PromptSource, TierSelection,
    UserInputSource,
};
use agentmesh::memory_tiers::MemoryTierStore;
use agentmesh::task::{Task, TaskAction, TaskStatus};
use agentmesh::token_counter::TokenCounter;
use std::sync::Arc;
use std::time::Instant;

fn main() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    runtime.block_on(async {
        // Fill the tiers with a realistic session's worth of work.
        let tiers = Arc::new(MemoryTierStore::new(50, 100, 500));
        for i in 0..200 {
            let mut task = Task::new(
                TaskAction::Execute,
                format!("task {} with a moderately sized request body", i),
            )
            .with_session("bench")
            .with_importance((i % 10) as f64 / 10.0);
            task.transition(TaskStatus::Running);
            task.complete(format!("result {} with enough text to cost real tokens", i));
            tiers.add_task(task);
        }

        let counter = ContextCounter::new(
            Arc::new(TokenCounter::with_default_heuristic()),
            "bench-model",
        );
        let sources: Vec<Arc<dyn ContextSource>> = vec![
            Arc::new(MemoryTierSource::new(Arc::clone(&tiers), TierSelection::Recent)),
            Arc::new(MemoryTierSource::new(
                Arc::clone(&tiers),
                TierSelection::Important,
            )),
            Arc::new(UserInputSource),
        ];
        let orchestrator = ContextOrchestrator::new(
            Arc::new(PromptSource::new("You are a benchmark assistant.")),
            sources,
            counter,
            ContextConfig::default(),
        );

        let probe = Task::new(TaskAction::Execute, "assemble my context").with_session("bench");

        // Warm up caches.
        for _ in 0..10 {
            let _ = orchestrator.build_context(&probe, 0).await;
        }

        let iterations = 1_000;
        let start = Instant::now();
        let mut total_messages = 0usize;
        for _ in 0..iterations {
            let messages = orchestrator
                .build_context(&probe, 0)
                .await
                .expect("assembly");
            total_messages += messages.len();
        }
        let elapsed = start.elapsed();

        println!(
            "{} assemblies in {:?} ({:.1} µs each, avg {} messages)",
            iterations,
            elapsed,
            elapsed.as_micros() as f64 / iterations as f64,
            total_messages / iterations
        );
    });
}
