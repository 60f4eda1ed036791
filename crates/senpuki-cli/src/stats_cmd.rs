//! `senpuki stats` / `senpuki watch`: execution-state counts without a full
//! table scan — every number here comes from `StorageBackend::count_*`.

use senpuki::{ExecutionState, StorageBackend};
use std::time::Duration;

const STATES: [ExecutionState; 6] = [
    ExecutionState::Pending,
    ExecutionState::Running,
    ExecutionState::Completed,
    ExecutionState::Failed,
    ExecutionState::TimedOut,
    ExecutionState::Cancelled,
];

pub async fn run_stats(backend: &dyn StorageBackend) -> anyhow::Result<()> {
    println!("Executions:");
    let mut total = 0u64;
    for state in STATES {
        let count = backend.count_executions(Some(state)).await?;
        total += count;
        println!("  {:<12} {}", state.as_str(), count);
    }
    println!("  {:<12} {}", "total", total);

    let dead = backend.count_dead_tasks().await?;
    println!("Dead-lettered tasks: {dead}");
    Ok(())
}

pub async fn run_watch(backend: &dyn StorageBackend, interval: Duration) -> anyhow::Result<()> {
    loop {
        run_stats(backend).await?;
        println!();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("stopped");
                return Ok(());
            }
        }
    }
}
