//! The storage backend contract.
//!
//! Every method here is a failure-domain boundary: a backend implementation
//! (SQLite, Postgres, or the in-memory test double in `senpuki-testing`) owns
//! the atomicity and locking story described on each method. The worker loop
//! and orchestrator driver never reach around this trait to touch storage
//! directly.

use crate::codec::Payload;
use crate::error::SenpukiError;
use crate::model::{
    CacheEntry, DeadLetter, Execution, ExecutionId, ExecutionState, ExecutionView, FailDisposition,
    LeaseRenewal, Task, TaskId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Parameters narrowing the candidate set for [`StorageBackend::claim_next_task`].
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    pub queues: Vec<String>,
    pub required_tags: HashSet<String>,
}

impl ClaimFilter {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queues: vec![queue.into()],
            required_tags: HashSet::new(),
        }
    }
}

/// Transactional persistence of executions, tasks, dead letters, cache
/// entries, signals, counters, and custom state.
///
/// Implementations must serialise `claim_next_task` against concurrent
/// claimers of the *same* row (SQLite: `BEGIN IMMEDIATE`; Postgres:
/// `SELECT ... FOR UPDATE SKIP LOCKED`; in-memory: a real mutex around the
/// whole claim transaction) so that exactly one worker wins a race for a
/// given task, per testable property 3.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Creates the backend's tables and indexes if absent. Idempotent.
    async fn init_db(&self) -> Result<(), SenpukiError>;

    /// Atomically writes an execution and its root task. Both rows appear or
    /// neither does.
    async fn create_execution_with_root_task(
        &self,
        execution: Execution,
        task: Task,
    ) -> Result<(), SenpukiError>;

    /// Creates a child task row belonging to an existing execution (spawned
    /// by the orchestrator driver for a durable call).
    async fn create_child_task(&self, task: Task) -> Result<(), SenpukiError>;

    /// Atomically selects and claims the highest-priority, oldest-scheduled
    /// eligible task matching `filter`, honoring any configured concurrency
    /// limit for its `concurrency_group`. Returns `None` when nothing is
    /// claimable right now.
    async fn claim_next_task(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
        lease_duration: chrono::Duration,
    ) -> Result<Option<Task>, SenpukiError>;

    /// Extends a held lease. Succeeds only while the row is still `running`,
    /// owned by `worker_id`, and not already expired.
    async fn renew_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<LeaseRenewal, SenpukiError>;

    /// Marks a task completed and stores its result. Conditional on
    /// `worker_id` still owning the row.
    async fn complete_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: Payload,
    ) -> Result<(), SenpukiError>;

    /// Marks a task failed, either scheduling a retry or dead-lettering it
    /// per `disposition`. Conditional on `worker_id` still owning the row.
    async fn fail_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        disposition: FailDisposition,
    ) -> Result<(), SenpukiError>;

    /// Reschedules an orchestrator task to be claimable again, e.g. after a
    /// child task settles or a durable sleep elapses. Does not change
    /// `attempt` or `worker_id`.
    async fn wake_task(&self, task_id: TaskId, scheduled_for: DateTime<Utc>) -> Result<(), SenpukiError>;

    /// Parks a running orchestrator task at an unresolved durable step:
    /// releases the worker's claim (clears `worker_id`/`lease_expires_at`)
    /// and returns the row to `pending` with `scheduled_for` set to the
    /// step's wake condition, without touching `attempt`, `result`, or
    /// `error`. Conditional on `worker_id` still owning the row.
    async fn park_task(
        &self,
        task_id: TaskId,
        worker_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<(), SenpukiError>;

    /// Overwrites an orchestrator task's progress log in place, used by the
    /// driver to record a step outcome before parking or resuming.
    async fn update_task_progress(
        &self,
        task_id: TaskId,
        progress: Vec<crate::model::ProgressStep>,
    ) -> Result<(), SenpukiError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, SenpukiError>;

    /// Direct row replacement, for manual operator reclaim via the CLI.
    async fn update_task(&self, task: Task) -> Result<(), SenpukiError>;

    async fn list_tasks(
        &self,
        execution_id: Option<ExecutionId>,
        state: Option<crate::model::TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, SenpukiError>;

    async fn count_executions(&self, state: Option<ExecutionState>) -> Result<u64, SenpukiError>;

    async fn list_executions(
        &self,
        state: Option<ExecutionState>,
        limit: usize,
    ) -> Result<Vec<Execution>, SenpukiError>;

    async fn count_dead_tasks(&self) -> Result<u64, SenpukiError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, SenpukiError>;

    async fn get_dead_letter(&self, task_id: TaskId) -> Result<Option<DeadLetter>, SenpukiError>;

    async fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), SenpukiError>;

    /// Re-creates a pending task from a dead-letter snapshot, resetting
    /// `attempt`, lease, and state. Optionally moves it to a different
    /// queue. The original dead-letter row is left untouched.
    async fn replay_dead_letter(
        &self,
        task_id: TaskId,
        queue: Option<String>,
    ) -> Result<TaskId, SenpukiError>;

    async fn set_execution_state(
        &self,
        execution_id: ExecutionId,
        state: ExecutionState,
    ) -> Result<(), SenpukiError>;

    async fn set_execution_result(
        &self,
        execution_id: ExecutionId,
        result: Result<Payload, String>,
    ) -> Result<(), SenpukiError>;

    async fn add_counter(
        &self,
        execution_id: ExecutionId,
        name: &str,
        delta: i64,
    ) -> Result<i64, SenpukiError>;

    async fn set_custom_state(
        &self,
        execution_id: ExecutionId,
        key: &str,
        value: Payload,
    ) -> Result<(), SenpukiError>;

    async fn get_execution_state(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionView>, SenpukiError>;

    /// Appends a payload to a signal's FIFO queue.
    async fn send_signal(
        &self,
        execution_id: ExecutionId,
        name: &str,
        payload: Payload,
    ) -> Result<(), SenpukiError>;

    /// Atomically pops the oldest pending payload for `(execution_id, name)`,
    /// or `None` if the queue is empty.
    async fn consume_signal(
        &self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<Option<Payload>, SenpukiError>;

    async fn get_cache(&self, key: &str) -> Result<Option<Payload>, SenpukiError>;

    async fn put_cache(
        &self,
        key: &str,
        value: Payload,
        ttl: Option<chrono::Duration>,
    ) -> Result<(), SenpukiError>;

    /// Cascades deletion of executions (and their tasks, counters, custom
    /// state, and signals) older than `older_than`. Returns the number of
    /// executions removed.
    async fn cleanup_executions(&self, older_than: DateTime<Utc>) -> Result<u64, SenpukiError>;
}
