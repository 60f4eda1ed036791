//! `senpuki dlq list|show|replay|delete`: inspect and recover dead-lettered
//! tasks. `show`/`replay`/`delete` exit 2 (not 1) when the task ID is valid
//! but no dead letter exists, so scripts can tell "not found" from "error".

use senpuki::StorageBackend;
use uuid::Uuid;

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max])
    } else {
        s.to_string()
    }
}

pub async fn run_list(backend: &dyn StorageBackend, limit: usize) -> anyhow::Result<()> {
    let letters = backend.list_dead_letters(limit).await?;
    if letters.is_empty() {
        println!("(no dead-lettered tasks)");
        return Ok(());
    }
    println!("{:<36}  {:<16}  {:<25}  {}", "task_id", "queue", "dead_lettered_at", "final_error");
    for dl in letters {
        println!(
            "{:<36}  {:<16}  {:<25}  {}",
            dl.id,
            dl.task.queue,
            dl.dead_lettered_at.to_rfc3339(),
            truncate(&dl.final_error, 60)
        );
    }
    Ok(())
}

pub async fn run_show(backend: &dyn StorageBackend, task_id: Uuid) -> anyhow::Result<i32> {
    match backend.get_dead_letter(task_id).await? {
        Some(dl) => {
            println!("id:                {}", dl.id);
            println!("execution_id:      {}", dl.task.execution_id);
            println!("step_name:         {}", dl.task.step_name);
            println!("queue:             {}", dl.task.queue);
            println!("attempt:           {}/{}", dl.task.attempt, dl.task.max_attempts);
            println!("dead_lettered_at:  {}", dl.dead_lettered_at.to_rfc3339());
            println!("final_error:       {}", dl.final_error);
            Ok(0)
        }
        None => {
            eprintln!("no dead letter with id {task_id}");
            Ok(2)
        }
    }
}

pub async fn run_replay(backend: &dyn StorageBackend, task_id: Uuid, queue: Option<String>) -> anyhow::Result<i32> {
    match backend.replay_dead_letter(task_id, queue).await {
        Ok(new_id) => {
            println!("replayed as new task {new_id}");
            Ok(0)
        }
        Err(e) => {
            eprintln!("replay failed: {e}");
            Ok(2)
        }
    }
}

pub async fn run_delete(backend: &dyn StorageBackend, task_id: Uuid) -> anyhow::Result<i32> {
    backend.delete_dead_letter(task_id).await?;
    println!("deleted dead letter {task_id}");
    Ok(0)
}
