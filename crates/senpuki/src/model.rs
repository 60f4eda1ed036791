//! Execution, task, dead-letter, cache, and signal row shapes.
//!
//! These are the types every [`crate::backend::StorageBackend`] implementation
//! persists and returns; they are deliberately storage-agnostic (no SQL types
//! leak in here) so the SQLite and Postgres backends, and the in-memory test
//! backend, all speak the same vocabulary.

use crate::codec::Payload;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type ExecutionId = Uuid;
pub type TaskId = Uuid;

/// Progress rows are summarised past this many entries so hot task rows stay
/// bounded regardless of how many durable steps an orchestrator issues.
pub const MAX_INLINE_PROGRESS_STEPS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = crate::error::SenpukiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => ExecutionState::Pending,
            "running" => ExecutionState::Running,
            "completed" => ExecutionState::Completed,
            "failed" => ExecutionState::Failed,
            "timed_out" => ExecutionState::TimedOut,
            "cancelled" => ExecutionState::Cancelled,
            other => {
                return Err(crate::error::SenpukiError::Other(anyhow::anyhow!(
                    "unknown execution state {other:?}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Dead => "dead",
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = crate::error::SenpukiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => TaskState::Pending,
            "running" => TaskState::Running,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "dead" => TaskState::Dead,
            other => {
                return Err(crate::error::SenpukiError::Other(anyhow::anyhow!(
                    "unknown task state {other:?}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TaskKind {
    Orchestrator,
    Activity,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Orchestrator => "orchestrator",
            TaskKind::Activity => "activity",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = crate::error::SenpukiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "orchestrator" => TaskKind::Orchestrator,
            "activity" => TaskKind::Activity,
            other => {
                return Err(crate::error::SenpukiError::Other(anyhow::anyhow!(
                    "unknown task kind {other:?}"
                )))
            }
        })
    }
}

/// One logical workflow instance.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub root_step_name: String,
    pub arguments: Payload,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub counters: HashMap<String, i64>,
    pub custom_state: HashMap<String, Payload>,
}

impl Execution {
    pub fn new(id: ExecutionId, root_step_name: impl Into<String>, arguments: Payload) -> Self {
        let now = Utc::now();
        Self {
            id,
            root_step_name: root_step_name.into(),
            arguments,
            state: ExecutionState::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            counters: HashMap::new(),
            custom_state: HashMap::new(),
        }
    }
}

/// One durable step's record on an orchestrator task's progress log. Present
/// from the moment a step first parks, so a crash between "park" and
/// "settle" can be recovered from the task row alone, without any in-memory
/// state surviving the restart.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ProgressStep {
    /// A durable call to another function. `outcome` is `None` while the
    /// child is outstanding.
    Call {
        child_task_id: TaskId,
        outcome: Option<StepOutcome>,
    },
    /// A durable sleep. `elapsed` is set once a resumed pass observes
    /// `until` has passed.
    Sleep { until: DateTime<Utc>, elapsed: bool },
    /// A signal wait. `payload` is `None` while parked; `timeout_at` bounds
    /// how long to wait before the step fails with a timeout.
    Signal {
        name: String,
        timeout_at: Option<DateTime<Utc>>,
        payload: Option<Payload>,
    },
    /// Older entries beyond [`MAX_INLINE_PROGRESS_STEPS`] are folded into
    /// one marker so hot task rows stay bounded.
    Truncated { count: usize },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StepOutcome {
    Success(Payload),
    Failure(String),
}

/// One unit of worker-consumed work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub execution_id: ExecutionId,
    pub parent_task_id: Option<TaskId>,
    pub kind: TaskKind,
    pub step_name: String,
    pub arguments: Payload,
    pub state: TaskState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_for: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub queue: String,
    pub priority: i32,
    pub tags: HashSet<String>,
    pub idempotency_key: Option<String>,
    pub cache_key: Option<String>,
    pub concurrency_group: Option<String>,
    /// Denormalized from the registered function's
    /// [`crate::registry::FunctionMeta::concurrency_limit`] at creation time,
    /// so `claim_next_task` can enforce it without a registry lookup.
    pub concurrency_limit: Option<u32>,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub progress: Vec<ProgressStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Appends a progress step, folding the oldest entries into a
    /// [`ProgressStep::Truncated`] marker once the list grows past
    /// [`MAX_INLINE_PROGRESS_STEPS`].
    pub fn push_progress(&mut self, step: ProgressStep) {
        self.progress.push(step);
        if self.progress.len() > MAX_INLINE_PROGRESS_STEPS {
            let overflow = self.progress.len() - MAX_INLINE_PROGRESS_STEPS;
            let already_truncated = matches!(self.progress.first(), Some(ProgressStep::Truncated { .. }));
            let prior_count = if already_truncated {
                match self.progress.remove(0) {
                    ProgressStep::Truncated { count } => count,
                    _ => unreachable!(),
                }
            } else {
                0
            };
            let drained: Vec<_> = self.progress.drain(0..overflow).collect();
            self.progress
                .insert(0, ProgressStep::Truncated { count: prior_count + drained.len() });
        }
    }
}

/// Whether a failed task should be retried or dead-lettered.
#[derive(Debug, Clone)]
pub enum FailDisposition {
    Retry { retry_at: DateTime<Utc> },
    Dead,
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRenewal {
    Renewed,
    Lost,
}

/// Persisted full snapshot of a task that exhausted retries or failed
/// terminally. Carries the task payload verbatim.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: TaskId,
    pub task: Task,
    pub final_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A cache or idempotency entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Payload,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<chrono::Duration>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now > self.created_at + ttl,
            None => false,
        }
    }
}

/// A full, read-only view of an execution's state, including its durable
/// counters and custom state, as returned by
/// [`crate::backend::StorageBackend::get_execution_state`].
#[derive(Debug, Clone)]
pub struct ExecutionView {
    pub id: ExecutionId,
    pub state: ExecutionState,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub counters: HashMap<String, i64>,
    pub custom_state: HashMap<String, Payload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Execution> for ExecutionView {
    fn from(e: Execution) -> Self {
        ExecutionView {
            id: e.id,
            state: e.state,
            result: e.result,
            error: e.error,
            counters: e.counters,
            custom_state: e.custom_state,
            created_at: e.created_at,
            updated_at: e.updated_at,
            completed_at: e.completed_at,
        }
    }
}
