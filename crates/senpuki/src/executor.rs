//! The public surface: dispatch, wait_for, state_of, signals, the dead-letter
//! queue, worker lifecycles, and `serve`.

use crate::backend::StorageBackend;
use crate::bus::{execution_channel, ChannelMessage, NotificationBus};
use crate::codec::Payload;
use crate::error::{SenpukiError, WaitError};
use crate::model::{DeadLetter, Execution, ExecutionId, ExecutionState, ExecutionView, Task, TaskId, TaskKind, TaskState};
use crate::poll::PollBackoff;
use crate::registry::{CodecChoice, DurableFn, FunctionRegistry};
use crate::retry::RetryPolicy;
use crate::worker::{sweep_parked_orchestrators, Worker, WorkerConfig, WorkerLifecycle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Overrides accepted by [`Executor::dispatch`]. Anything left `None` falls
/// back to the registered function's [`crate::registry::FunctionMeta`], then
/// the executor's defaults.
#[derive(Default, Clone)]
pub struct DispatchOptions {
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub tags: Option<Vec<String>>,
    /// Shifts `scheduled_for` from "now" by this much.
    pub delay: Option<Duration>,
    /// Sets `expires_at`, measured from `scheduled_for` (not from dispatch
    /// time — see SPEC_FULL §9 resolved Open Question).
    pub expiry: Option<Duration>,
    pub idempotency_key: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Options for [`Executor::serve`].
#[derive(Clone)]
pub struct ServeOptions {
    pub max_concurrency: usize,
    pub queues: Vec<String>,
    pub tags: HashSet<String>,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub cleanup_interval: Option<Duration>,
    pub retention_period: Duration,
    /// How often to sweep for parked orchestrator tasks whose awaited child
    /// has already settled. This is the polling-authoritative fallback for
    /// the in-process parent wake-up (see `worker::sweep_parked_orchestrators`);
    /// `None` disables it, relying solely on that wake-up call.
    pub park_sweep_interval: Option<Duration>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        let config = WorkerConfig::default();
        Self {
            max_concurrency: config.max_concurrency,
            queues: config.queues,
            tags: config.tags,
            poll_interval: config.poll_interval,
            lease_duration: config.lease_duration,
            cleanup_interval: Some(Duration::from_secs(3600)),
            retention_period: Duration::from_secs(7 * 24 * 3600),
            park_sweep_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// A running worker plus its background retention and park sweeps, returned
/// by [`Executor::serve`].
pub struct ServeHandle {
    pub lifecycle: WorkerLifecycle,
    worker_task: tokio::task::JoinHandle<()>,
    cleanup_task: Option<tokio::task::JoinHandle<()>>,
    park_sweep_task: Option<tokio::task::JoinHandle<()>>,
}

impl ServeHandle {
    pub async fn stop(self) {
        self.lifecycle.request_drain();
        self.lifecycle.wait_until_stopped().await;
        if let Some(cleanup) = self.cleanup_task {
            cleanup.abort();
        }
        if let Some(sweep) = self.park_sweep_task {
            sweep.abort();
        }
        let _ = self.worker_task.await;
    }
}

/// The durable execution engine's public entry point. Owns a storage
/// backend, an optional notification bus, and a function registry populated
/// by explicit registration — never ambient global state.
pub struct Executor {
    backend: Arc<dyn StorageBackend>,
    bus: Arc<dyn NotificationBus>,
    registry: Arc<FunctionRegistry>,
    default_retry_policy: RetryPolicy,
}

impl Executor {
    pub fn new(backend: Arc<dyn StorageBackend>, bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            backend,
            bus,
            registry: Arc::new(FunctionRegistry::new(CodecChoice::Json)),
            default_retry_policy: RetryPolicy::default(),
        }
    }

    /// Opts into the `bincode` payload codec for every function registered
    /// afterward. A per-construction choice, documented as unsafe for
    /// untrusted or cross-version payloads.
    #[cfg(feature = "bincode")]
    pub fn with_binary_codec(mut self) -> Self {
        self.registry = Arc::new(FunctionRegistry::new(CodecChoice::Binary));
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    /// Registers `F` under its stable step name. Must be called before the
    /// first `dispatch` or `serve`; the registry is immutable once wrapped
    /// in the `Arc` shared with running workers (construct a fresh
    /// `Executor` per process, register everything, then call `serve`).
    pub fn register<F: DurableFn>(&mut self) {
        Arc::get_mut(&mut self.registry)
            .expect("register() must be called before the registry is shared with a running worker")
            .register::<F>();
    }

    pub fn create_worker_lifecycle(&self, name: impl Into<String>) -> WorkerLifecycle {
        WorkerLifecycle::new(name)
    }

    pub fn request_worker_drain(&self, lifecycle: &WorkerLifecycle) {
        lifecycle.request_drain();
    }

    /// Dispatches a root execution for `F`. Fails fast with `NotRegistered`
    /// if `F` was never registered.
    #[instrument(skip(self, args))]
    pub async fn dispatch<F: DurableFn>(&self, args: F::Args, options: DispatchOptions) -> Result<ExecutionId, SenpukiError> {
        let (meta, _invoker) = self.registry.require(F::NAME)?;
        let codec = self.registry.codec();
        let payload = codec.encode(&args)?;

        if let Some(key) = &options.idempotency_key {
            if self.backend.get_cache(key).await?.is_some() {
                return Err(SenpukiError::IdempotencyHit);
            }
        }

        let execution_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let scheduled_for = now + options.delay.map(|d| chrono::Duration::from_std(d).unwrap_or_default()).unwrap_or_default();
        let expires_at = options
            .expiry
            .map(|e| scheduled_for + chrono::Duration::from_std(e).unwrap_or_default());
        let retry_policy = options.retry_policy.or_else(|| meta.retry_policy.clone()).unwrap_or_else(|| self.default_retry_policy.clone());

        let execution = Execution::new(execution_id, F::NAME, payload.clone());
        let task = Task {
            id: task_id,
            execution_id,
            parent_task_id: None,
            kind: meta.kind,
            step_name: F::NAME.to_string(),
            arguments: payload,
            state: TaskState::Pending,
            attempt: 0,
            max_attempts: retry_policy.max_attempts,
            scheduled_for,
            expires_at,
            lease_expires_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            queue: options.queue.unwrap_or_else(|| meta.queue.clone()),
            priority: options.priority.unwrap_or(meta.priority),
            tags: options.tags.map(|t| t.into_iter().collect()).unwrap_or_else(|| meta.tags.iter().cloned().collect()),
            idempotency_key: options.idempotency_key,
            cache_key: meta.cacheable.then(|| cache_key_for(F::NAME, &execution.arguments)),
            concurrency_group: meta.concurrency_group.clone(),
            concurrency_limit: meta.concurrency_limit,
            result: None,
            error: None,
            progress: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.backend.create_execution_with_root_task(execution, task).await?;
        Ok(execution_id)
    }

    /// Waits for an execution to settle, via the notification bus if
    /// configured (always falling back to adaptive polling), and returns
    /// its result or a structured error reflecting the terminal state.
    pub async fn wait_for<O: DeserializeOwned>(&self, execution_id: ExecutionId, timeout: Option<Duration>) -> Result<O, WaitError> {
        let payload = self.wait_for_payload(execution_id, timeout).await?;
        crate::codec::decode_payload(&payload).map_err(WaitError::Backend)
    }

    async fn wait_for_payload(&self, execution_id: ExecutionId, timeout: Option<Duration>) -> Result<Payload, WaitError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut subscription = self.bus.subscribe(&execution_channel(execution_id)).await.map_err(WaitError::Backend)?;
        let mut backoff = PollBackoff::default_cadence();

        loop {
            if let Some(view) = self.backend.get_execution_state(execution_id).await.map_err(WaitError::Backend)? {
                if let Some(result) = terminal_result(&view)? {
                    return Ok(result);
                }
            }

            let sleep = backoff.current();
            backoff.backoff();
            let wait = async {
                tokio::select! {
                    msg = subscription.recv() => { let _ = msg; }
                    _ = tokio::time::sleep(sleep) => {}
                }
            };

            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, wait).await.is_err() {
                        return Err(WaitError::WaitTimeout);
                    }
                }
                None => wait.await,
            }
        }
    }

    pub async fn state_of(&self, execution_id: ExecutionId) -> Result<ExecutionView, SenpukiError> {
        self.backend
            .get_execution_state(execution_id)
            .await?
            .ok_or_else(|| SenpukiError::Other(anyhow::anyhow!("no such execution {execution_id}")))
    }

    /// Sends a signal payload and wakes any orchestrator tasks of this
    /// execution that are currently parked — possibly on this signal,
    /// possibly on something else, in which case the wake is a harmless
    /// no-op replay pass.
    pub async fn send_signal<T: Serialize>(&self, execution_id: ExecutionId, name: &str, payload: &T) -> Result<(), SenpukiError> {
        let encoded = self.registry.codec().encode(payload)?;
        self.backend.send_signal(execution_id, name, encoded).await?;
        for task in self
            .backend
            .list_tasks(Some(execution_id), Some(TaskState::Pending), usize::MAX)
            .await?
        {
            if task.kind == TaskKind::Orchestrator {
                self.backend.wake_task(task.id, chrono::Utc::now()).await?;
            }
        }
        let _ = self
            .bus
            .publish(
                &execution_channel(execution_id),
                ChannelMessage { task_id: None, execution_id: Some(execution_id), state: "signalled".into() },
            )
            .await;
        Ok(())
    }

    /// Cancels an execution. The next claim of any of its tasks observes the
    /// `cancelled` state in `execute()` and aborts before running user code;
    /// a task already mid-flight still runs to completion but its result is
    /// discarded once it settles (see `worker::WorkerTaskRunner::on_failure`).
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<(), SenpukiError> {
        self.backend.set_execution_state(execution_id, ExecutionState::Cancelled).await?;
        for task in self
            .backend
            .list_tasks(Some(execution_id), Some(TaskState::Pending), usize::MAX)
            .await?
        {
            if task.kind == TaskKind::Orchestrator {
                self.backend.wake_task(task.id, chrono::Utc::now()).await?;
            }
        }
        let _ = self
            .bus
            .publish(
                &execution_channel(execution_id),
                ChannelMessage { task_id: None, execution_id: Some(execution_id), state: ExecutionState::Cancelled.as_str().into() },
            )
            .await;
        Ok(())
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, SenpukiError> {
        self.backend.list_dead_letters(limit).await
    }

    pub async fn get_dead_letter(&self, task_id: TaskId) -> Result<Option<DeadLetter>, SenpukiError> {
        self.backend.get_dead_letter(task_id).await
    }

    pub async fn replay_dead_letter(&self, task_id: TaskId, queue: Option<String>) -> Result<TaskId, SenpukiError> {
        self.backend.replay_dead_letter(task_id, queue).await
    }

    pub async fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), SenpukiError> {
        self.backend.delete_dead_letter(task_id).await
    }

    pub async fn count_executions(&self, state: Option<ExecutionState>) -> Result<u64, SenpukiError> {
        self.backend.count_executions(state).await
    }

    pub async fn count_dead_tasks(&self) -> Result<u64, SenpukiError> {
        self.backend.count_dead_tasks().await
    }

    /// Spawns a worker loop plus a background retention sweep that calls
    /// `cleanup_executions` on `cleanup_interval`.
    pub fn serve(&self, lifecycle: WorkerLifecycle, options: ServeOptions) -> ServeHandle {
        let config = WorkerConfig {
            id: format!("{}-{}", lifecycle.name(), Uuid::new_v4()),
            queues: options.queues,
            tags: options.tags,
            max_concurrency: options.max_concurrency,
            lease_duration: options.lease_duration,
            heartbeat_interval: (options.lease_duration / 4).min(options.lease_duration / 3),
            poll_interval: options.poll_interval,
            stop_timeout: Duration::from_secs(30),
        };
        let worker = Worker::new(
            self.backend.clone(),
            self.bus.clone(),
            self.registry.clone(),
            self.default_retry_policy.clone(),
            config,
            lifecycle.clone(),
        );
        let worker_task = tokio::spawn(worker.run());

        let cleanup_task = options.cleanup_interval.map(|interval| {
            let backend = self.backend.clone();
            let retention = options.retention_period;
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if lifecycle.is_draining() {
                        return;
                    }
                    let older_than = chrono::Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
                    if let Err(e) = backend.cleanup_executions(older_than).await {
                        tracing::warn!(error = %e, "retention sweep failed");
                    }
                }
            })
        });

        let park_sweep_task = options.park_sweep_interval.map(|interval| {
            let backend = self.backend.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if lifecycle.is_draining() {
                        return;
                    }
                    if let Err(e) = sweep_parked_orchestrators(&backend).await {
                        tracing::warn!(error = %e, "parked-orchestrator sweep failed");
                    }
                }
            })
        });

        ServeHandle { lifecycle, worker_task, cleanup_task, park_sweep_task }
    }
}

fn terminal_result(view: &ExecutionView) -> Result<Option<Payload>, WaitError> {
    match view.state {
        ExecutionState::Completed => Ok(Some(view.result.clone().unwrap_or(Payload(vec![])))),
        ExecutionState::Failed => Err(WaitError::Failed(view.error.clone().unwrap_or_default())),
        ExecutionState::TimedOut => Err(WaitError::TimedOut),
        ExecutionState::Cancelled => Err(WaitError::Cancelled),
        ExecutionState::Pending | ExecutionState::Running => Ok(None),
    }
}

fn cache_key_for(step_name: &str, arguments: &Payload) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    arguments.as_bytes().hash(&mut hasher);
    format!("{step_name}:{:x}", hasher.finish())
}
