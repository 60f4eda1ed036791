//! An in-memory [`senpuki::StorageBackend`] and a small worker harness, for
//! testing durable functions without a database.
//!
//! Modeled on a mock job store: state lives behind one lock, seeded and
//! inspected directly by tests rather than through the trait when a test
//! needs to peek past the public API (e.g. asserting dead-letter snapshots).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use senpuki::{
    CacheEntry, ClaimFilter, DeadLetter, Execution, ExecutionId, ExecutionState, ExecutionView,
    FailDisposition, LeaseRenewal, Payload, ProgressStep, SenpukiError, StorageBackend, Task, TaskId,
    TaskState,
};
use std::collections::HashMap;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    executions: HashMap<ExecutionId, Execution>,
    tasks: HashMap<TaskId, Task>,
    dead_letters: HashMap<TaskId, DeadLetter>,
    cache: HashMap<String, CacheEntry>,
    signals: HashMap<(ExecutionId, String), VecDeque<Payload>>,
}

/// An in-memory [`StorageBackend`]. One `tokio::sync::Mutex` guards the whole
/// state, which doubles as the claim transaction: exactly one caller holds
/// the lock while selecting and transitioning a task, so concurrent claimers
/// never double-win a row.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an execution and its root task directly, bypassing
    /// `create_execution_with_root_task`, for tests that want to construct a
    /// scenario without going through `Executor::dispatch`.
    pub async fn seed(&self, execution: Execution, task: Task) {
        let mut state = self.state.lock().await;
        state.executions.insert(execution.id, execution);
        state.tasks.insert(task.id, task);
    }

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.state.lock().await.dead_letters.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn init_db(&self) -> Result<(), SenpukiError> {
        Ok(())
    }

    async fn create_execution_with_root_task(&self, execution: Execution, task: Task) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        state.executions.insert(execution.id, execution);
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn create_child_task(&self, task: Task) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
        lease_duration: chrono::Duration,
    ) -> Result<Option<Task>, SenpukiError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let running_counts: HashMap<String, u32> = {
            let mut counts: HashMap<String, u32> = HashMap::new();
            for task in state.tasks.values() {
                if task.state == TaskState::Running {
                    if let Some(group) = &task.concurrency_group {
                        if task.lease_expires_at.map(|e| e > now).unwrap_or(true) {
                            *counts.entry(group.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }
            counts
        };

        let mut candidates: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| {
                (t.state == TaskState::Pending
                    || (t.state == TaskState::Running && t.lease_expires_at.map(|e| e <= now).unwrap_or(false)))
                    && t.scheduled_for <= now
                    && filter.queues.iter().any(|q| q == &t.queue)
                    && filter.required_tags.is_subset(&t.tags)
            })
            .filter(|t| match (&t.concurrency_group, t.concurrency_limit) {
                (Some(group), Some(limit)) => running_counts.get(group).copied().unwrap_or(0) < limit,
                _ => true,
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
                .then(a.created_at.cmp(&b.created_at))
        });

        let Some(winner_id) = candidates.first().map(|t| t.id) else {
            return Ok(None);
        };

        let task = state.tasks.get_mut(&winner_id).expect("candidate id must exist");
        task.state = TaskState::Running;
        task.worker_id = Some(worker_id.to_string());
        task.lease_expires_at = Some(now + lease_duration);
        task.last_heartbeat_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn renew_lease(&self, task_id: TaskId, worker_id: &str, new_expiry: DateTime<Utc>) -> Result<LeaseRenewal, SenpukiError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(LeaseRenewal::Lost);
        };
        if task.state != TaskState::Running || task.worker_id.as_deref() != Some(worker_id) {
            return Ok(LeaseRenewal::Lost);
        }
        if task.lease_expires_at.map(|e| e < Utc::now()).unwrap_or(false) {
            return Ok(LeaseRenewal::Lost);
        }
        task.lease_expires_at = Some(new_expiry);
        task.last_heartbeat_at = Some(Utc::now());
        Ok(LeaseRenewal::Renewed)
    }

    async fn complete_task(&self, task_id: TaskId, worker_id: &str, result: Payload) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(SenpukiError::Other(anyhow::anyhow!("no such task {task_id}")));
        };
        if task.worker_id.as_deref() != Some(worker_id) {
            return Ok(());
        }
        task.state = TaskState::Completed;
        task.result = Some(result);
        task.worker_id = None;
        task.lease_expires_at = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_task(&self, task_id: TaskId, worker_id: &str, error: &str, disposition: FailDisposition) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(SenpukiError::Other(anyhow::anyhow!("no such task {task_id}")));
        };
        if task.worker_id.as_deref() != Some(worker_id) {
            return Ok(());
        }
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();
        match disposition {
            FailDisposition::Retry { retry_at } => {
                task.state = TaskState::Pending;
                task.attempt += 1;
                task.worker_id = None;
                task.lease_expires_at = None;
                task.scheduled_for = retry_at;
            }
            FailDisposition::Dead => {
                task.state = TaskState::Dead;
                task.worker_id = None;
                task.lease_expires_at = None;
                let snapshot = task.clone();
                state.dead_letters.insert(
                    task_id,
                    DeadLetter { id: task_id, task: snapshot, final_error: error.to_string(), dead_lettered_at: Utc::now() },
                );
            }
        }
        Ok(())
    }

    async fn wake_task(&self, task_id: TaskId, scheduled_for: DateTime<Utc>) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            if task.state == TaskState::Pending {
                task.scheduled_for = task.scheduled_for.min(scheduled_for);
            }
        }
        Ok(())
    }

    async fn park_task(&self, task_id: TaskId, worker_id: &str, scheduled_for: DateTime<Utc>) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(SenpukiError::Other(anyhow::anyhow!("no such task {task_id}")));
        };
        if task.worker_id.as_deref() != Some(worker_id) {
            return Ok(());
        }
        task.state = TaskState::Pending;
        task.worker_id = None;
        task.lease_expires_at = None;
        task.scheduled_for = scheduled_for;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_progress(&self, task_id: TaskId, progress: Vec<ProgressStep>) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.progress = progress;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, SenpukiError> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn update_task(&self, task: Task) -> Result<(), SenpukiError> {
        self.state.lock().await.tasks.insert(task.id, task);
        Ok(())
    }

    async fn list_tasks(&self, execution_id: Option<ExecutionId>, state_filter: Option<TaskState>, limit: usize) -> Result<Vec<Task>, SenpukiError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| execution_id.map(|id| id == t.execution_id).unwrap_or(true))
            .filter(|t| state_filter.map(|s| s == t.state).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn count_executions(&self, state_filter: Option<ExecutionState>) -> Result<u64, SenpukiError> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .values()
            .filter(|e| state_filter.map(|s| s == e.state).unwrap_or(true))
            .count() as u64)
    }

    async fn list_executions(&self, state_filter: Option<ExecutionState>, limit: usize) -> Result<Vec<Execution>, SenpukiError> {
        let state = self.state.lock().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| state_filter.map(|s| s == e.state).unwrap_or(true))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        executions.truncate(limit);
        Ok(executions)
    }

    async fn count_dead_tasks(&self) -> Result<u64, SenpukiError> {
        Ok(self.state.lock().await.dead_letters.len() as u64)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, SenpukiError> {
        let state = self.state.lock().await;
        let mut letters: Vec<DeadLetter> = state.dead_letters.values().cloned().collect();
        letters.sort_by_key(|d| d.dead_lettered_at);
        letters.truncate(limit);
        Ok(letters)
    }

    async fn get_dead_letter(&self, task_id: TaskId) -> Result<Option<DeadLetter>, SenpukiError> {
        Ok(self.state.lock().await.dead_letters.get(&task_id).cloned())
    }

    async fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), SenpukiError> {
        self.state.lock().await.dead_letters.remove(&task_id);
        Ok(())
    }

    async fn replay_dead_letter(&self, task_id: TaskId, queue: Option<String>) -> Result<TaskId, SenpukiError> {
        let mut state = self.state.lock().await;
        let Some(letter) = state.dead_letters.get(&task_id) else {
            return Err(SenpukiError::Other(anyhow::anyhow!("no dead letter for {task_id}")));
        };
        let mut replayed = letter.task.clone();
        replayed.id = Uuid::new_v4();
        replayed.state = TaskState::Pending;
        replayed.attempt = 0;
        replayed.worker_id = None;
        replayed.lease_expires_at = None;
        replayed.error = None;
        replayed.result = None;
        replayed.scheduled_for = Utc::now();
        if let Some(queue) = queue {
            replayed.queue = queue;
        }
        let new_id = replayed.id;
        state.tasks.insert(new_id, replayed);
        Ok(new_id)
    }

    async fn set_execution_state(&self, execution_id: ExecutionId, new_state: ExecutionState) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(&execution_id) {
            execution.state = new_state;
            execution.updated_at = Utc::now();
            if new_state.is_terminal() {
                execution.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_execution_result(&self, execution_id: ExecutionId, result: Result<Payload, String>) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(&execution_id) {
            match result {
                Ok(payload) => execution.result = Some(payload),
                Err(message) => execution.error = Some(message),
            }
            execution.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn add_counter(&self, execution_id: ExecutionId, name: &str, delta: i64) -> Result<i64, SenpukiError> {
        let mut state = self.state.lock().await;
        let Some(execution) = state.executions.get_mut(&execution_id) else {
            return Err(SenpukiError::Other(anyhow::anyhow!("no such execution {execution_id}")));
        };
        let entry = execution.counters.entry(name.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn set_custom_state(&self, execution_id: ExecutionId, key: &str, value: Payload) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(&execution_id) {
            execution.custom_state.insert(key.to_string(), value);
        }
        Ok(())
    }

    async fn get_execution_state(&self, execution_id: ExecutionId) -> Result<Option<ExecutionView>, SenpukiError> {
        Ok(self.state.lock().await.executions.get(&execution_id).cloned().map(ExecutionView::from))
    }

    async fn send_signal(&self, execution_id: ExecutionId, name: &str, payload: Payload) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        state.signals.entry((execution_id, name.to_string())).or_default().push_back(payload);
        Ok(())
    }

    async fn consume_signal(&self, execution_id: ExecutionId, name: &str) -> Result<Option<Payload>, SenpukiError> {
        let mut state = self.state.lock().await;
        Ok(state.signals.get_mut(&(execution_id, name.to_string())).and_then(|q| q.pop_front()))
    }

    async fn get_cache(&self, key: &str) -> Result<Option<Payload>, SenpukiError> {
        let state = self.state.lock().await;
        Ok(state.cache.get(key).filter(|e| !e.is_expired(Utc::now())).map(|e| e.value.clone()))
    }

    async fn put_cache(&self, key: &str, value: Payload, ttl: Option<chrono::Duration>) -> Result<(), SenpukiError> {
        let mut state = self.state.lock().await;
        state.cache.insert(key.to_string(), CacheEntry { key: key.to_string(), value, created_at: Utc::now(), ttl });
        Ok(())
    }

    async fn cleanup_executions(&self, older_than: DateTime<Utc>) -> Result<u64, SenpukiError> {
        let mut state = self.state.lock().await;
        let stale: Vec<ExecutionId> = state
            .executions
            .values()
            .filter(|e| e.state.is_terminal() && e.completed_at.map(|c| c < older_than).unwrap_or(false))
            .map(|e| e.id)
            .collect();
        for id in &stale {
            state.executions.remove(id);
            state.tasks.retain(|_, t| t.execution_id != *id);
            state.signals.retain(|(eid, _), _| eid != id);
        }
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use senpuki::{ExecutionId as Eid, TaskKind};

    fn make_root_task(execution_id: Eid, queue: &str) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            execution_id,
            parent_task_id: None,
            kind: TaskKind::Activity,
            step_name: "noop".into(),
            arguments: Payload(vec![1]),
            state: TaskState::Pending,
            attempt: 0,
            max_attempts: 3,
            scheduled_for: now,
            expires_at: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            queue: queue.to_string(),
            priority: 0,
            tags: Default::default(),
            idempotency_key: None,
            cache_key: None,
            concurrency_group: None,
            concurrency_limit: None,
            result: None,
            error: None,
            progress: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn claim_then_complete_round_trips() {
        let backend = MemoryBackend::new();
        let execution_id = Uuid::new_v4();
        let task = make_root_task(execution_id, "default");
        let task_id = task.id;
        backend.seed(Execution::new(execution_id, "noop", Payload(vec![1])), task).await;

        let claimed = backend
            .claim_next_task("w1", &ClaimFilter::queue("default"), chrono::Duration::seconds(30))
            .await
            .unwrap()
            .expect("task should be claimable");
        assert_eq!(claimed.id, task_id);
        assert_eq!(claimed.state, TaskState::Running);

        backend.complete_task(task_id, "w1", Payload(vec![9])).await.unwrap();
        let settled = backend.task(task_id).await.unwrap();
        assert_eq!(settled.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn only_one_of_many_concurrent_claimers_wins() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let execution_id = Uuid::new_v4();
        let task = make_root_task(execution_id, "default");
        backend.seed(Execution::new(execution_id, "noop", Payload(vec![1])), task).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .claim_next_task(&format!("w{i}"), &ClaimFilter::queue("default"), chrono::Duration::seconds(30))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn dead_letter_then_replay_creates_fresh_pending_task() {
        let backend = MemoryBackend::new();
        let execution_id = Uuid::new_v4();
        let mut task = make_root_task(execution_id, "default");
        task.attempt = 2;
        let task_id = task.id;
        backend.seed(Execution::new(execution_id, "noop", Payload(vec![1])), task).await;

        backend
            .claim_next_task("w1", &ClaimFilter::queue("default"), chrono::Duration::seconds(30))
            .await
            .unwrap();
        backend.fail_task(task_id, "w1", "boom", FailDisposition::Dead).await.unwrap();

        assert_eq!(backend.dead_letter_count().await, 1);
        let new_id = backend.replay_dead_letter(task_id, Some("retry".into())).await.unwrap();
        assert_ne!(new_id, task_id);
        let replayed = backend.task(new_id).await.unwrap();
        assert_eq!(replayed.attempt, 0);
        assert_eq!(replayed.queue, "retry");
        assert!(backend.get_dead_letter(task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn count_executions_matches_list_len_for_every_state() {
        let backend = MemoryBackend::new();
        for (i, state) in [
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::Completed,
            ExecutionState::Failed,
        ]
        .into_iter()
        .enumerate()
        {
            let execution_id = Uuid::new_v4();
            let mut execution = Execution::new(execution_id, "noop", Payload(vec![1]));
            execution.state = state;
            let task = make_root_task(execution_id, "default");
            backend.seed(execution, task).await;
            let _ = i;
        }
        for state in [
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::TimedOut,
            ExecutionState::Cancelled,
        ] {
            let counted = backend.count_executions(Some(state)).await.unwrap();
            let listed = backend.list_executions(Some(state), usize::MAX).await.unwrap().len() as u64;
            assert_eq!(counted, listed, "mismatch for {state:?}");
        }
    }

    #[tokio::test]
    async fn concurrency_limit_admits_at_most_the_configured_count() {
        let backend = MemoryBackend::new();
        let limit = 2u32;
        let mut task_ids = Vec::new();
        for _ in 0..5 {
            let execution_id = Uuid::new_v4();
            let mut task = make_root_task(execution_id, "default");
            task.concurrency_group = Some("group-a".into());
            task.concurrency_limit = Some(limit);
            task_ids.push(task.id);
            backend.seed(Execution::new(execution_id, "noop", Payload(vec![1])), task).await;
        }

        let mut claimed = 0;
        for i in 0..5 {
            let result = backend
                .claim_next_task(&format!("w{i}"), &ClaimFilter::queue("default"), chrono::Duration::seconds(30))
                .await
                .unwrap();
            if result.is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, limit as usize, "only `limit` tasks should be admitted while the rest stay pending");
    }

    #[tokio::test]
    async fn a_worker_that_loses_its_lease_must_not_overwrite_the_reclaimer() {
        let backend = MemoryBackend::new();
        let execution_id = Uuid::new_v4();
        let task = make_root_task(execution_id, "default");
        let task_id = task.id;
        backend.seed(Execution::new(execution_id, "noop", Payload(vec![1])), task).await;

        // Worker A claims with a lease that's already expired by the time it
        // tries to act on it (simulating a stalled heartbeat).
        backend
            .claim_next_task("worker-a", &ClaimFilter::queue("default"), chrono::Duration::seconds(-1))
            .await
            .unwrap();

        // Worker B reclaims the now-expired lease.
        let reclaimed = backend
            .claim_next_task("worker-b", &ClaimFilter::queue("default"), chrono::Duration::seconds(30))
            .await
            .unwrap()
            .expect("worker B should be able to reclaim an expired lease");
        assert_eq!(reclaimed.worker_id.as_deref(), Some("worker-b"));

        // Worker A's completion is rejected because it no longer owns the row.
        backend.complete_task(task_id, "worker-a", Payload(vec![0xA])).await.unwrap();
        let after_a = backend.task(task_id).await.unwrap();
        assert_eq!(after_a.state, TaskState::Running, "stale worker must not settle the task");

        backend.complete_task(task_id, "worker-b", Payload(vec![0xB])).await.unwrap();
        let after_b = backend.task(task_id).await.unwrap();
        assert_eq!(after_b.state, TaskState::Completed);
        assert_eq!(after_b.result, Some(Payload(vec![0xB])));
    }
}
