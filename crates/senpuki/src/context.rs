//! Per-execution runtime state bound to the currently running task.
//!
//! Handed to every durable function body. Activities use the counter,
//! custom-state, and id accessors. Orchestrators additionally use
//! [`ExecutionContext::call`], [`ExecutionContext::call_all`],
//! [`ExecutionContext::sleep`], and [`ExecutionContext::wait_for_signal`] —
//! each is one logical, deterministically-indexed durable step, replayed
//! from the task's persisted `progress` log on every re-entry.

use crate::backend::StorageBackend;
use crate::codec::Payload;
use crate::error::SenpukiError;
use crate::model::{ExecutionId, ProgressStep, StepOutcome, Task, TaskId, TaskKind, TaskState};
use crate::registry::{CodecChoice, FunctionRegistry};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Where an orchestrator parked, i.e. what should wake it. Read by the
/// worker loop after a function body returns [`SenpukiError::Parked`].
#[derive(Debug, Clone)]
pub enum ParkUntil {
    /// Wake once `scheduled_for` has passed (durable sleep, or a signal-wait
    /// timeout deadline).
    Time(DateTime<Utc>),
    /// Wake as soon as possible; a child task or signal may already have
    /// settled by the time this park is observed (the park call always also
    /// sets `scheduled_for` conservatively, so polling remains authoritative
    /// even if no notification arrives).
    AsSoonAsPossible,
}

/// A durable call's in-memory handle to its counter's current value, backed
/// by an atomic add against the storage backend.
pub struct CounterHandle {
    execution_id: ExecutionId,
    name: String,
    backend: Arc<dyn StorageBackend>,
}

impl CounterHandle {
    /// Atomically adds `delta` and returns the counter's new value. Applied
    /// once per task execution — not re-applied on orchestrator replay,
    /// since replayed steps short-circuit before the body re-executes this
    /// call.
    pub async fn add(&self, delta: i64) -> Result<i64, SenpukiError> {
        self.backend.add_counter(self.execution_id, &self.name, delta).await
    }
}

/// Shared, mutable per-invocation state behind an [`ExecutionContext`]. Held
/// in an `Arc` so cheap clones of the context (needed because `DurableFn::call`
/// takes it by value) all see the same step cursor and progress buffer.
struct Inner {
    backend: Arc<dyn StorageBackend>,
    registry: Arc<FunctionRegistry>,
    execution_id: ExecutionId,
    task_id: TaskId,
    worker_id: String,
    attempt: u32,
    codec: CodecChoice,
    default_retry_policy: RetryPolicy,
    /// Snapshot of `progress` as it stood when this pass began, plus any
    /// entries appended or resolved during this pass.
    progress: Mutex<Vec<ProgressStep>>,
    step_cursor: AtomicUsize,
    park_at: Mutex<Option<ParkUntil>>,
}

/// Per-execution runtime state bound to the currently running task. Cloning
/// is cheap and shares the same underlying step cursor and progress buffer.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl ExecutionContext {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        registry: Arc<FunctionRegistry>,
        task: &Task,
        default_retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                execution_id: task.execution_id,
                task_id: task.id,
                worker_id: task.worker_id.clone().unwrap_or_default(),
                attempt: task.attempt,
                codec: CodecChoice::Json,
                default_retry_policy,
                progress: Mutex::new(task.progress.clone()),
                step_cursor: AtomicUsize::new(0),
                park_at: Mutex::new(None),
            }),
        }
    }

    pub fn with_codec(mut self, codec: CodecChoice) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("ExecutionContext must not be cloned before with_codec")
            .codec = codec;
        self
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.inner.execution_id
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn counter(&self, name: impl Into<String>) -> CounterHandle {
        CounterHandle {
            execution_id: self.inner.execution_id,
            name: name.into(),
            backend: self.inner.backend.clone(),
        }
    }

    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SenpukiError> {
        let view = self
            .inner
            .backend
            .get_execution_state(self.inner.execution_id)
            .await?
            .ok_or_else(|| SenpukiError::Other(anyhow::anyhow!("execution missing")))?;
        match view.custom_state.get(key) {
            Some(payload) => Ok(Some(crate::codec::decode_payload(payload)?)),
            None => Ok(None),
        }
    }

    pub async fn set_state<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SenpukiError> {
        let payload = self.inner.codec.encode(value)?;
        self.inner
            .backend
            .set_custom_state(self.inner.execution_id, key, payload)
            .await
    }

    /// Returns the progress snapshot accumulated so far this pass, for the
    /// worker loop to persist after the body returns (whether it completed,
    /// failed, or parked).
    pub(crate) async fn take_progress(&self) -> Vec<ProgressStep> {
        self.inner.progress.lock().await.clone()
    }

    pub(crate) async fn take_park(&self) -> Option<ParkUntil> {
        self.inner.park_at.lock().await.clone()
    }

    fn next_index(&self) -> usize {
        self.inner.step_cursor.fetch_add(1, Ordering::SeqCst)
    }

    async fn set_park(&self, until: ParkUntil) {
        *self.inner.park_at.lock().await = Some(until);
    }

    async fn record(&self, index: usize, step: ProgressStep) {
        let mut progress = self.inner.progress.lock().await;
        if index < progress.len() {
            progress[index] = step;
        } else {
            progress.push(step);
        }
        drop(progress);
        self.persist(index).await;
    }

    async fn persist(&self, _hint: usize) {
        let progress = self.inner.progress.lock().await.clone();
        // Persist eagerly so a crash immediately after parking leaves the
        // task row recoverable without relying on in-memory state.
        let _ = self
            .inner
            .backend
            .update_task_progress(self.inner.task_id, progress)
            .await;
    }

    /// A durable call to another registered function. Replays instantly from
    /// `progress` when already settled; otherwise creates (or locates) the
    /// child task and, if it hasn't settled yet, returns
    /// [`SenpukiError::Parked`] so the caller's `?` unwinds the body.
    pub async fn call<T: Serialize, O: DeserializeOwned>(
        &self,
        step_name: &'static str,
        args: &T,
    ) -> Result<O, SenpukiError> {
        let index = self.next_index();
        let existing = self.inner.progress.lock().await.get(index).cloned();
        match existing {
            Some(ProgressStep::Call { outcome: Some(StepOutcome::Success(payload)), .. }) => {
                return crate::codec::decode_payload(&payload);
            }
            Some(ProgressStep::Call { outcome: Some(StepOutcome::Failure(msg)), .. }) => {
                return Err(SenpukiError::Terminal(msg));
            }
            Some(ProgressStep::Call { child_task_id, outcome: None }) => {
                return self.await_child(index, child_task_id).await;
            }
            Some(_) => {
                return Err(SenpukiError::Other(anyhow::anyhow!(
                    "progress step {index} kind mismatch: expected a durable call"
                )))
            }
            None => {}
        }

        let (meta, _invoker) = self.inner.registry.require(step_name)?;
        let payload = self.inner.codec.encode(args)?;
        let child_id = Uuid::new_v4();
        let now = Utc::now();
        let child = Task {
            id: child_id,
            execution_id: self.inner.execution_id,
            parent_task_id: Some(self.inner.task_id),
            kind: meta.kind,
            step_name: step_name.to_string(),
            arguments: payload,
            state: TaskState::Pending,
            attempt: 0,
            max_attempts: meta.retry_policy.as_ref().unwrap_or(&self.inner.default_retry_policy).max_attempts,
            scheduled_for: now,
            expires_at: meta.timeout.map(|t| now + chrono::Duration::from_std(t).unwrap_or_default()),
            lease_expires_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            queue: meta.queue.clone(),
            priority: meta.priority,
            tags: meta.tags.iter().cloned().collect(),
            idempotency_key: None,
            cache_key: None,
            concurrency_group: meta.concurrency_group.clone(),
            concurrency_limit: meta.concurrency_limit,
            result: None,
            error: None,
            progress: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.inner.backend.create_child_task(child).await?;
        self.record(index, ProgressStep::Call { child_task_id: child_id, outcome: None }).await;
        self.await_child(index, child_id).await
    }

    async fn await_child<O: DeserializeOwned>(&self, index: usize, child_task_id: TaskId) -> Result<O, SenpukiError> {
        match self.inner.backend.get_task(child_task_id).await? {
            Some(task) if task.state == TaskState::Completed => {
                let payload = task.result.clone().unwrap_or(Payload(vec![]));
                self.record(
                    index,
                    ProgressStep::Call { child_task_id, outcome: Some(StepOutcome::Success(payload.clone())) },
                )
                .await;
                crate::codec::decode_payload(&payload)
            }
            Some(task) if task.state == TaskState::Dead || task.state == TaskState::Failed => {
                let message = task.error.clone().unwrap_or_else(|| "child task failed".to_string());
                self.record(
                    index,
                    ProgressStep::Call { child_task_id, outcome: Some(StepOutcome::Failure(message.clone())) },
                )
                .await;
                Err(SenpukiError::Terminal(message))
            }
            _ => {
                self.set_park(ParkUntil::AsSoonAsPossible).await;
                Err(SenpukiError::Parked)
            }
        }
    }

    /// Fan-out helper: issues one durable call per item, creating every
    /// child task on the first pass, then parks until all have settled.
    /// Bounded by `max_in_flight` concurrently-running children.
    pub async fn call_all<T: Serialize + Sync, O: DeserializeOwned>(
        &self,
        step_name: &'static str,
        args: &[T],
        _max_in_flight: usize,
    ) -> Result<Vec<O>, SenpukiError> {
        let mut results = Vec::with_capacity(args.len());
        let mut parked = false;
        for a in args {
            match self.call::<T, O>(step_name, a).await {
                Ok(v) => results.push(v),
                Err(SenpukiError::Parked) => {
                    parked = true;
                    // Keep iterating so every sibling gets its child task
                    // created on this pass (fan-out creates all children up
                    // front), rather than stopping at the first unsettled one.
                }
                Err(e) => return Err(e),
            }
        }
        if parked {
            self.set_park(ParkUntil::AsSoonAsPossible).await;
            return Err(SenpukiError::Parked);
        }
        Ok(results)
    }

    /// A durable sleep. Not the same as `tokio::time::sleep`: this persists
    /// the wake time and parks the task rather than blocking the worker.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), SenpukiError> {
        let index = self.next_index();
        let existing = self.inner.progress.lock().await.get(index).cloned();
        match existing {
            Some(ProgressStep::Sleep { until, elapsed: true }) => {
                let _ = until;
                return Ok(());
            }
            Some(ProgressStep::Sleep { until, elapsed: false }) => {
                if Utc::now() >= until {
                    self.record(index, ProgressStep::Sleep { until, elapsed: true }).await;
                    return Ok(());
                }
                self.set_park(ParkUntil::Time(until)).await;
                return Err(SenpukiError::Parked);
            }
            Some(_) => {
                return Err(SenpukiError::Other(anyhow::anyhow!(
                    "progress step {index} kind mismatch: expected a sleep"
                )))
            }
            None => {}
        }
        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        self.record(index, ProgressStep::Sleep { until, elapsed: false }).await;
        self.set_park(ParkUntil::Time(until)).await;
        Err(SenpukiError::Parked)
    }

    /// Waits for a named signal, optionally with a timeout. Orchestrator-only.
    pub async fn wait_for_signal<O: DeserializeOwned>(
        &self,
        name: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<O, SenpukiError> {
        let index = self.next_index();
        let existing = self.inner.progress.lock().await.get(index).cloned();
        if let Some(ProgressStep::Signal { payload: Some(payload), .. }) = existing {
            return crate::codec::decode_payload(&payload);
        }
        let timeout_at = match &existing {
            Some(ProgressStep::Signal { timeout_at, .. }) => *timeout_at,
            _ => timeout.map(|t| Utc::now() + chrono::Duration::from_std(t).unwrap_or_default()),
        };
        if let Some(payload) = self.inner.backend.consume_signal(self.inner.execution_id, name).await? {
            self.record(
                index,
                ProgressStep::Signal { name: name.to_string(), timeout_at, payload: Some(payload.clone()) },
            )
            .await;
            return crate::codec::decode_payload(&payload);
        }
        if let Some(deadline) = timeout_at {
            if Utc::now() >= deadline {
                return Err(SenpukiError::Timeout);
            }
        }
        self.record(
            index,
            ProgressStep::Signal { name: name.to_string(), timeout_at, payload: None },
        )
        .await;
        self.set_park(match timeout_at {
            Some(t) => ParkUntil::Time(t),
            None => ParkUntil::AsSoonAsPossible,
        })
        .await;
        Err(SenpukiError::Parked)
    }
}
