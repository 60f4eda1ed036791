//! # Senpuki
//!
//! A durable-function orchestration engine: workflows survive crashes, retry
//! on failure, and resume after restart.
//!
//! ## Core Concepts
//!
//! Senpuki separates **activities** from **orchestrators**:
//! - An activity is a [`DurableFn`] that does real work (an HTTP call, a
//!   database write) and may be retried on failure.
//! - An orchestrator is a [`DurableFn`] that calls other durable functions
//!   through its [`ExecutionContext`], sleeps, and waits on signals — its
//!   body replays deterministically from a persisted step log every time it
//!   resumes, so it can park indefinitely (across worker restarts, across
//!   process restarts) without losing its place.
//!
//! The key principle: **every durable step is a row**. A [`Task`] claimed by
//! a worker, executed, and settled is the unit of at-most-once-success work;
//! an [`Execution`] is the workflow instance a root task belongs to.
//!
//! ## Architecture
//!
//! ```text
//! Executor::dispatch::<F>(args) ─────────► StorageBackend (execution + root task)
//!                                                  │
//!                                      Worker::run  │ claim_next_task
//!                                                  ▼
//!                                    WorkerTaskRunner::run_claimed_task
//!                                       │                        │
//!                            activity ──┤                       ├── orchestrator
//!                                       │                        │
//!                                registry.invoker()     ExecutionContext::call/sleep/
//!                                       │                wait_for_signal (park-on-?)
//!                                       ▼                        │
//!                              complete_task / fail_task ◄───────┘
//!                                       │
//!                          NotificationBus.publish (optimization)
//!                                       │
//!                          Executor::wait_for (poll fallback, always correct)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Claims are exactly-once** - two workers racing for the same task,
//!    exactly one wins (testable property 3).
//! 2. **Leases expire** - a worker that stops heartbeating loses ownership
//!    and must write nothing back (`SenpukiError::LeaseLost`).
//! 3. **Orchestrator bodies are deterministic** - given the same recorded
//!    step outcomes, they issue the same steps in the same order.
//! 4. **Notifications are an optimization** - a dropped pub/sub message never
//!    produces an incorrect result, only a slower one; polling is always
//!    the authoritative fallback.
//! 5. **Dead letters carry a full snapshot** - a terminally failed task can
//!    always be inspected and replayed without re-deriving its arguments.
//!
//! ## What This Is Not
//!
//! Senpuki is **not**:
//! - A general job queue (it's opinionated about retries, leases, and replay)
//! - A saga engine with manual compensation steps
//! - An actor framework
//! - A CLI's business logic — `senpuki-cli` only ever calls
//!   [`Executor`]/[`StorageBackend`] operations
//!
//! Senpuki **is**:
//! > A durable-function orchestration engine where workflows are ordinary
//! > async functions that survive the process that started them.

mod backend;
mod bus;
mod codec;
mod context;
mod error;
mod executor;
#[macro_use]
mod macros;
mod model;
mod orchestrator;
mod poll;
mod registry;
mod retry;
mod worker;

#[cfg(test)]
mod stress_tests;

pub use backend::{ClaimFilter, StorageBackend};
pub use bus::{execution_channel, task_channel, ChannelMessage, InProcessBus, NoOpBus, NotificationBus, Subscription};
pub use codec::{binary, decode_payload, json, BinaryCodec, Codec, JsonCodec, Payload, BINARY_TAG, JSON_TAG};
pub use context::{CounterHandle, ExecutionContext, ParkUntil};
pub use error::{SenpukiError, WaitError};
pub use executor::{DispatchOptions, Executor, ServeHandle, ServeOptions};
pub use model::{
    CacheEntry, DeadLetter, Execution, ExecutionId, ExecutionState, ExecutionView, FailDisposition,
    LeaseRenewal, ProgressStep, StepOutcome, Task, TaskId, TaskKind, TaskState, MAX_INLINE_PROGRESS_STEPS,
};
pub use orchestrator::{encode_args, map};
pub use poll::PollBackoff;
pub use registry::{CodecChoice, DurableFn, FunctionMeta, FunctionRegistry, Invoker, KeyFn};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerConfig, WorkerLifecycle};

// Re-export commonly used external types, for downstream crates implementing
// `StorageBackend`/`NotificationBus` without pinning their own version.
pub use async_trait::async_trait;
