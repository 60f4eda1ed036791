//! The worker loop: claims tasks, dispatches to activity or orchestrator
//! execution, renews leases, writes results, schedules retries,
//! dead-letters, emits notifications, and respects drain requests.

use crate::backend::{ClaimFilter, StorageBackend};
use crate::bus::{execution_channel, task_channel, ChannelMessage, NotificationBus};
use crate::context::{ExecutionContext, ParkUntil};
use crate::error::SenpukiError;
use crate::model::{ExecutionState, FailDisposition, ProgressStep, Task, TaskKind, TaskState};
use crate::registry::FunctionRegistry;
use crate::retry::RetryPolicy;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, instrument, warn};

const RUN_STATE_RUNNING: u8 = 0;
const RUN_STATE_FINISHED: u8 = 1;
const RUN_STATE_LEASE_LOST: u8 = 2;
const RUN_STATE_TIMED_OUT: u8 = 3;

/// Cap on how many parked orchestrator tasks one sweep pass inspects, mirroring
/// `claim_next_task`'s own batch cap.
const PARK_SWEEP_BATCH: usize = 10_000;

/// Re-schedules parked orchestrator tasks whose awaited child has already
/// settled. The fast path is the in-process `wake_task` call issued right
/// after a child settles (see `on_success`/`settle_terminal`); this sweep is
/// the polling fallback for when that call never happens, e.g. the worker
/// that just committed the child's completion is killed before it can also
/// wake the parent. Safe to call repeatedly and from multiple processes —
/// `wake_task` on an already-awake task is a no-op.
pub async fn sweep_parked_orchestrators(backend: &Arc<dyn StorageBackend>) -> Result<u64, SenpukiError> {
    let now = Utc::now();
    let mut woken = 0u64;
    for task in backend.list_tasks(None, Some(TaskState::Pending), PARK_SWEEP_BATCH).await? {
        if task.kind != TaskKind::Orchestrator || task.scheduled_for <= now {
            continue;
        }
        let mut child_settled = false;
        for step in &task.progress {
            if let ProgressStep::Call { child_task_id, outcome: None } = step {
                if let Some(child) = backend.get_task(*child_task_id).await? {
                    if matches!(child.state, TaskState::Completed | TaskState::Failed | TaskState::Dead) {
                        child_settled = true;
                        break;
                    }
                }
            }
        }
        if child_settled {
            backend.wake_task(task.id, now).await?;
            woken += 1;
        }
    }
    Ok(woken)
}

/// Handle used to request a graceful shutdown and to observe loop phase
/// transitions, independent of any one [`Worker`] instance's lifetime.
#[derive(Clone)]
pub struct WorkerLifecycle {
    name: String,
    draining: Arc<std::sync::atomic::AtomicBool>,
    ready_tx: Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,
    stopped_tx: Arc<watch::Sender<bool>>,
    stopped_rx: watch::Receiver<bool>,
}

impl WorkerLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        Self {
            name: name.into(),
            draining: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            ready_tx: Arc::new(ready_tx),
            ready_rx,
            stopped_tx: Arc::new(stopped_tx),
            stopped_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Resolves once the loop has entered its claim step at least once.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the loop has returned after a drain.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.stopped_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn mark_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    fn mark_stopped(&self) {
        let _ = self.stopped_tx.send(true);
    }
}

/// Tunables for one [`Worker`] instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: String,
    pub queues: Vec<String>,
    pub tags: HashSet<String>,
    pub max_concurrency: usize,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(300);
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4()),
            queues: vec!["default".to_string()],
            tags: HashSet::new(),
            max_concurrency: 10,
            // Clock-skew note (SPEC_FULL §9): heartbeat_interval must be <=
            // lease_duration / 3.
            heartbeat_interval: lease_duration / 4,
            lease_duration,
            poll_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Claims tasks from a [`StorageBackend`], dispatches them to registered
/// functions, and keeps their leases alive until they settle.
pub struct Worker {
    backend: Arc<dyn StorageBackend>,
    bus: Arc<dyn NotificationBus>,
    registry: Arc<FunctionRegistry>,
    default_retry_policy: RetryPolicy,
    config: WorkerConfig,
    lifecycle: WorkerLifecycle,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        bus: Arc<dyn NotificationBus>,
        registry: Arc<FunctionRegistry>,
        default_retry_policy: RetryPolicy,
        config: WorkerConfig,
        lifecycle: WorkerLifecycle,
    ) -> Self {
        Self {
            backend,
            bus,
            registry,
            default_retry_policy,
            config,
            lifecycle,
        }
    }

    /// Runs the claim/execute/heartbeat loop until the lifecycle is drained.
    #[instrument(skip(self), fields(worker_id = %self.config.id))]
    pub async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut running = tokio::task::JoinSet::new();
        let filter = ClaimFilter {
            queues: self.config.queues.clone(),
            required_tags: self.config.tags.clone(),
        };
        let mut poll_backoff = crate::poll::PollBackoff::new(
            self.config.poll_interval,
            self.config.poll_interval.max(Duration::from_secs(5)),
            2.0,
        );
        let runner = Arc::new(self.task_runner());

        loop {
            self.lifecycle.mark_ready();

            if self.lifecycle.is_draining() {
                break;
            }

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue;
                }
            };

            let lease_duration = ChronoDuration::from_std(self.config.lease_duration).unwrap_or_default();
            match self.backend.claim_next_task(&self.config.id, &filter, lease_duration).await {
                Ok(Some(task)) => {
                    poll_backoff.reset();
                    let runner = runner.clone();
                    running.spawn(async move {
                        runner.run_claimed_task(task).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    let sleep_for = poll_backoff.current();
                    poll_backoff.backoff();
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "claim_next_task failed; backing off");
                    tokio::time::sleep(poll_backoff.current()).await;
                    poll_backoff.backoff();
                }
            }

            // Drain finished runners without blocking the claim loop.
            while running.try_join_next().is_some() {}
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        while !running.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("stop_timeout elapsed with tasks still running; returning anyway");
                break;
            }
            tokio::select! {
                _ = running.join_next() => {}
                _ = tokio::time::sleep(remaining) => break,
            }
        }

        self.lifecycle.mark_stopped();
    }

    fn task_runner(&self) -> WorkerTaskRunner {
        WorkerTaskRunner {
            backend: self.backend.clone(),
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            default_retry_policy: self.default_retry_policy.clone(),
            worker_id: self.config.id.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        }
    }
}

/// The state needed to run and heartbeat exactly one claimed task,
/// independent of the claim loop so it can be shared across spawned runners.
struct WorkerTaskRunner {
    backend: Arc<dyn StorageBackend>,
    bus: Arc<dyn NotificationBus>,
    registry: Arc<FunctionRegistry>,
    default_retry_policy: RetryPolicy,
    worker_id: String,
    heartbeat_interval: Duration,
}

impl WorkerTaskRunner {
    #[instrument(skip(self, task), fields(task_id = %task.id, step = %task.step_name, attempt = task.attempt))]
    async fn run_claimed_task(&self, task: Task) {
        let run_state = Arc::new(AtomicU8::new(RUN_STATE_RUNNING));
        let heartbeat = {
            let backend = self.backend.clone();
            let task_id = task.id;
            let worker_id = self.worker_id.clone();
            let interval = self.heartbeat_interval;
            let lease_duration = interval * 3;
            let expires_at = task.expires_at;
            let run_state = run_state.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if run_state.load(Ordering::SeqCst) != RUN_STATE_RUNNING {
                        return;
                    }
                    if let Some(expires_at) = expires_at {
                        if Utc::now() >= expires_at {
                            run_state.store(RUN_STATE_TIMED_OUT, Ordering::SeqCst);
                            return;
                        }
                    }
                    let new_expiry = Utc::now() + ChronoDuration::from_std(lease_duration).unwrap_or_default();
                    match backend.renew_lease(task_id, &worker_id, new_expiry).await {
                        Ok(crate::model::LeaseRenewal::Renewed) => {}
                        Ok(crate::model::LeaseRenewal::Lost) | Err(_) => {
                            run_state.store(RUN_STATE_LEASE_LOST, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            })
        };

        let (ctx, outcome) = self.execute(&task).await;

        let observed = run_state.compare_exchange(RUN_STATE_RUNNING, RUN_STATE_FINISHED, Ordering::SeqCst, Ordering::SeqCst);
        heartbeat.abort();

        match observed {
            Ok(_) => match outcome {
                Ok(bytes) => self.on_success(&task, bytes).await,
                Err(e) => self.on_failure(&task, e, ctx).await,
            },
            Err(RUN_STATE_LEASE_LOST) => {
                debug!(task_id = %task.id, "lease lost; dropping runner without writing a result");
            }
            Err(RUN_STATE_TIMED_OUT) => {
                debug!(task_id = %task.id, "deadline elapsed mid-execution; dead-lettering as timed out");
                self.handle_timeout(&task).await;
            }
            Err(_) => unreachable!("heartbeat only ever stores LEASE_LOST or TIMED_OUT"),
        }
    }

    /// Runs the registered function body for `task`, returning the context
    /// it ran in (needed by the caller even on failure, to read parked
    /// step/progress state) alongside the encoded result or error.
    async fn execute(&self, task: &Task) -> (ExecutionContext, Result<Vec<u8>, SenpukiError>) {
        let ctx = ExecutionContext::new(self.backend.clone(), self.registry.clone(), task, self.default_retry_policy.clone());

        match self.backend.get_execution_state(task.execution_id).await {
            Ok(Some(view)) if view.state == ExecutionState::Cancelled => {
                return (ctx, Err(SenpukiError::Cancelled));
            }
            Ok(_) => {}
            Err(e) => return (ctx, Err(e)),
        }

        if let Some(expires_at) = task.expires_at {
            if Utc::now() >= expires_at {
                return (ctx, Err(SenpukiError::Timeout));
            }
        }

        if let Some(key) = &task.idempotency_key {
            match self.backend.get_cache(key).await {
                Ok(Some(cached)) => return (ctx, Ok(cached.into_bytes())),
                Ok(None) => {}
                Err(e) => return (ctx, Err(e)),
            }
        }

        let (_meta, invoker) = match self.registry.require(&task.step_name) {
            Ok(found) => found,
            Err(e) => return (ctx, Err(e)),
        };

        let result = invoker(task.arguments.clone(), ctx.clone()).await;
        (ctx, result.map(|p| p.into_bytes()))
    }

    async fn on_success(&self, task: &Task, bytes: Vec<u8>) {
        let payload = crate::codec::Payload(bytes);
        if let Err(e) = self.backend.complete_task(task.id, &self.worker_id, payload.clone()).await {
            error!(task_id = %task.id, error = %e, "failed to record task completion");
            return;
        }

        if let Some(meta) = self.registry.meta(&task.step_name) {
            if meta.cacheable {
                if let Some(key) = &task.cache_key {
                    let _ = self.backend.put_cache(key, payload.clone(), None).await;
                }
            }
        }
        if let Some(key) = &task.idempotency_key {
            let _ = self.backend.put_cache(key, payload.clone(), None).await;
        }

        let _ = self
            .bus
            .publish(
                &task_channel(task.id),
                ChannelMessage { task_id: Some(task.id), execution_id: None, state: TaskState::Completed.as_str().into() },
            )
            .await;

        if let Some(parent_id) = task.parent_task_id {
            let _ = self.backend.wake_task(parent_id, Utc::now()).await;
            return;
        }

        let _ = self.backend.set_execution_result(task.execution_id, Ok(payload)).await;
        let _ = self.backend.set_execution_state(task.execution_id, ExecutionState::Completed).await;
        let _ = self
            .bus
            .publish(
                &execution_channel(task.execution_id),
                ChannelMessage {
                    task_id: None,
                    execution_id: Some(task.execution_id),
                    state: ExecutionState::Completed.as_str().into(),
                },
            )
            .await;
    }

    async fn on_failure(&self, task: &Task, error: SenpukiError, ctx: ExecutionContext) {
        if error.is_parked() {
            self.park(task, ctx).await;
            return;
        }

        if matches!(error, SenpukiError::Cancelled) {
            self.abort_for_cancellation(task).await;
            return;
        }

        if matches!(error, SenpukiError::NotRegistered(_)) {
            // Retrying an unresolvable name on the same binary cannot
            // succeed; dead-letter immediately.
            self.dead_letter(task, &error.to_string()).await;
            return;
        }

        if matches!(error, SenpukiError::Timeout) {
            self.handle_timeout(task).await;
            return;
        }

        let message = error.to_string();
        let retry_policy = self
            .registry
            .meta(&task.step_name)
            .and_then(|m| m.retry_policy.clone())
            .unwrap_or_else(|| self.default_retry_policy.clone());

        let is_terminal = matches!(error, SenpukiError::Terminal(_) | SenpukiError::SerializationFailed(_));
        let retry = !is_terminal && retry_policy.should_retry(task.attempt, &message);

        if retry {
            let retry_at = Utc::now() + retry_policy.next_delay_chrono(task.attempt);
            if let Err(e) = self
                .backend
                .fail_task(task.id, &self.worker_id, &message, FailDisposition::Retry { retry_at })
                .await
            {
                error!(task_id = %task.id, error = %e, "failed to schedule retry");
            }
            return;
        }

        self.dead_letter(task, &message).await;
    }

    async fn park(&self, task: &Task, ctx: ExecutionContext) {
        let progress = ctx.take_progress().await;
        if let Err(e) = self.backend.update_task_progress(task.id, progress).await {
            error!(task_id = %task.id, error = %e, "failed to persist orchestrator progress");
        }
        let scheduled_for = match ctx.take_park().await {
            Some(ParkUntil::Time(t)) => t,
            Some(ParkUntil::AsSoonAsPossible) | None => Utc::now() + ChronoDuration::days(365),
        };
        if let Err(e) = self.backend.park_task(task.id, &self.worker_id, scheduled_for).await {
            error!(task_id = %task.id, error = %e, "failed to park orchestrator task");
        }
    }

    async fn dead_letter(&self, task: &Task, message: &str) {
        if let Err(e) = self.backend.fail_task(task.id, &self.worker_id, message, FailDisposition::Dead).await {
            error!(task_id = %task.id, error = %e, "failed to dead-letter task");
        }
        self.settle_terminal(task, ExecutionState::Failed, message).await;
    }

    async fn handle_timeout(&self, task: &Task) {
        let _ = self
            .backend
            .fail_task(task.id, &self.worker_id, "task timed out", FailDisposition::Dead)
            .await;
        self.settle_terminal(task, ExecutionState::TimedOut, "task timed out").await;
    }

    /// A task whose owning execution was cancelled before (or while) it ran.
    /// The execution is already `cancelled` — set by whoever called
    /// `Executor::cancel` — so this only needs to settle the task itself and
    /// nudge its parent, never the execution state.
    async fn abort_for_cancellation(&self, task: &Task) {
        if let Err(e) = self
            .backend
            .fail_task(task.id, &self.worker_id, "execution cancelled", FailDisposition::Dead)
            .await
        {
            error!(task_id = %task.id, error = %e, "failed to dead-letter cancelled task");
        }
        let _ = self
            .bus
            .publish(
                &task_channel(task.id),
                ChannelMessage { task_id: Some(task.id), execution_id: None, state: TaskState::Dead.as_str().into() },
            )
            .await;
        if let Some(parent_id) = task.parent_task_id {
            // The parent is itself subject to the cancellation check on its
            // next claim; waking it just brings that claim forward.
            let _ = self.backend.wake_task(parent_id, Utc::now()).await;
        }
    }

    async fn settle_terminal(&self, task: &Task, state: ExecutionState, message: &str) {
        let _ = self
            .bus
            .publish(
                &task_channel(task.id),
                ChannelMessage { task_id: Some(task.id), execution_id: None, state: state.as_str().into() },
            )
            .await;
        if let Some(parent_id) = task.parent_task_id {
            // A failed child still wakes its parent: the orchestrator driver
            // replays the failure as a `Terminal` error at the recorded step.
            let _ = self.backend.wake_task(parent_id, Utc::now()).await;
            return;
        }
        let _ = self.backend.set_execution_state(task.execution_id, state).await;
        let _ = self
            .backend
            .set_execution_result(task.execution_id, Err(message.to_string()))
            .await;
        let _ = self
            .bus
            .publish(
                &execution_channel(task.execution_id),
                ChannelMessage { task_id: None, execution_id: Some(task.execution_id), state: state.as_str().into() },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;
    use crate::model::{Execution, ExecutionId, TaskId};
    use senpuki_testing::MemoryBackend;

    #[test]
    fn worker_config_heartbeat_within_bound() {
        let config = WorkerConfig::default();
        assert!(config.heartbeat_interval <= config.lease_duration / 3);
    }

    fn orchestrator_task(id: TaskId, execution_id: ExecutionId, progress: Vec<ProgressStep>, scheduled_for: chrono::DateTime<Utc>) -> Task {
        let now = Utc::now();
        Task {
            id,
            execution_id,
            parent_task_id: None,
            kind: TaskKind::Orchestrator,
            step_name: "orchestrator".into(),
            arguments: Payload(vec![]),
            state: TaskState::Pending,
            attempt: 0,
            max_attempts: 1,
            scheduled_for,
            expires_at: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            queue: "default".into(),
            priority: 0,
            tags: HashSet::new(),
            idempotency_key: None,
            cache_key: None,
            concurrency_group: None,
            concurrency_limit: None,
            result: None,
            error: None,
            progress,
            created_at: now,
            updated_at: now,
        }
    }

    fn activity_task(id: TaskId, execution_id: ExecutionId, parent_task_id: TaskId) -> Task {
        let mut task = orchestrator_task(id, execution_id, Vec::new(), Utc::now());
        task.kind = TaskKind::Activity;
        task.parent_task_id = Some(parent_task_id);
        task.state = TaskState::Running;
        task.worker_id = Some("some-worker".into());
        task.lease_expires_at = Some(Utc::now() + ChronoDuration::minutes(5));
        task
    }

    #[tokio::test]
    async fn sweep_wakes_a_parked_orchestrator_whose_child_already_settled() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let execution_id = uuid::Uuid::new_v4();
        let parent_id = uuid::Uuid::new_v4();
        let child_id = uuid::Uuid::new_v4();
        let far_future = Utc::now() + ChronoDuration::days(365);

        let parent = orchestrator_task(
            parent_id,
            execution_id,
            vec![ProgressStep::Call { child_task_id: child_id, outcome: None }],
            far_future,
        );
        backend.create_execution_with_root_task(Execution::new(execution_id, "orchestrator", Payload(vec![])), parent).await.unwrap();

        let child = activity_task(child_id, execution_id, parent_id);
        backend.create_child_task(child).await.unwrap();
        backend.complete_task(child_id, "some-worker", Payload(vec![1])).await.unwrap();

        // Simulates the in-process `wake_task` call after `complete_task`
        // never happening (e.g. the worker that completed the child died).
        let woken = sweep_parked_orchestrators(&backend).await.unwrap();
        assert_eq!(woken, 1);

        let parent_row = backend.get_task(parent_id).await.unwrap().unwrap();
        assert!(parent_row.scheduled_for <= Utc::now());
    }

    #[tokio::test]
    async fn sweep_leaves_orchestrators_whose_child_is_still_outstanding() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let execution_id = uuid::Uuid::new_v4();
        let parent_id = uuid::Uuid::new_v4();
        let child_id = uuid::Uuid::new_v4();
        let far_future = Utc::now() + ChronoDuration::days(365);

        let parent = orchestrator_task(
            parent_id,
            execution_id,
            vec![ProgressStep::Call { child_task_id: child_id, outcome: None }],
            far_future,
        );
        backend.create_execution_with_root_task(Execution::new(execution_id, "orchestrator", Payload(vec![])), parent).await.unwrap();
        backend.create_child_task(activity_task(child_id, execution_id, parent_id)).await.unwrap();

        let woken = sweep_parked_orchestrators(&backend).await.unwrap();
        assert_eq!(woken, 0);

        let parent_row = backend.get_task(parent_id).await.unwrap().unwrap();
        assert_eq!(parent_row.scheduled_for, far_future);
    }

    #[tokio::test]
    async fn lifecycle_ready_and_stopped_resolve_after_mark() {
        let lifecycle = WorkerLifecycle::new("w1");
        lifecycle.mark_ready();
        tokio::time::timeout(Duration::from_millis(100), lifecycle.wait_until_ready())
            .await
            .expect("ready should resolve immediately");
        lifecycle.mark_stopped();
        tokio::time::timeout(Duration::from_millis(100), lifecycle.wait_until_stopped())
            .await
            .expect("stopped should resolve immediately");
    }
}
