//! Error taxonomy for the durable execution engine.
//!
//! Every variant corresponds to one of the failure domains in the design:
//! dispatch-time registration failures, per-task serialization failures,
//! worker-local lease loss, the two durable-function outcomes (retryable /
//! terminal), timeouts, cancellation, and transient backend unavailability.

use thiserror::Error;

/// The error type threaded through the executor, worker loop, and orchestrator
/// driver.
#[derive(Debug, Error)]
pub enum SenpukiError {
    /// `dispatch` was called for a step name that was never registered with
    /// the executor's [`crate::registry::FunctionRegistry`]. Fatal, dispatch-time.
    #[error("function {0:?} is not registered with this executor")]
    NotRegistered(String),

    /// Encoding or decoding a payload failed. Fatal for the task that hit it;
    /// never retried, since a different attempt on the same binary cannot
    /// succeed where serialization itself failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// This worker's lease on a task expired or was stolen before it finished.
    /// Worker-local only: it must abort its in-flight runner and write
    /// nothing back, never propagate past the worker loop.
    #[error("lease lost for task")]
    LeaseLost,

    /// The durable function body raised an error the retry policy classified
    /// as retryable; wraps the underlying message.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// The durable function body raised an error the retry policy classified
    /// as terminal (or exhausted max_attempts); routes straight to dead-letter.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// The task's `expires_at` deadline was reached while it was still
    /// running or pending. Terminal regardless of retry policy.
    #[error("task timed out")]
    Timeout,

    /// The owning execution was cancelled; any task claimed afterward aborts
    /// before user code runs.
    #[error("execution was cancelled")]
    Cancelled,

    /// The storage backend could not be reached or returned a transient
    /// failure. Workers back off and retry the claim loop; `dispatch` and
    /// other facade calls surface this to the caller.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Not a true error: an idempotency-key cache hit short-circuited
    /// dispatch with a previously-stored result. Represented as `Ok` at the
    /// call site; documented here because the worker loop's match on
    /// dispatch outcomes lives beside the error arms above.
    #[error("idempotency key already has a cached result")]
    IdempotencyHit,

    /// A generic wrapper for errors surfaced by a storage or bus
    /// implementation that do not fit a more specific variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Internal sentinel: an orchestrator body hit an unresolved durable
    /// step (a child call, sleep, or signal wait with no recorded outcome
    /// yet) and must suspend. Propagated via `?` out of the orchestrator
    /// body so the driver can intercept it before it ever reaches retry
    /// classification; never surfaced to a `wait_for` caller.
    #[error("orchestrator parked awaiting a durable step")]
    Parked,
}

impl SenpukiError {
    /// True for error kinds that should never be visible to `dispatch`/`wait_for`
    /// callers as anything but an internal retry — i.e. the worker loop
    /// swallows these rather than propagating them.
    pub fn is_worker_local(&self) -> bool {
        matches!(self, SenpukiError::LeaseLost)
    }

    /// True for the orchestrator-parked sentinel, which must never be
    /// classified by a [`crate::retry::RetryPolicy`].
    pub fn is_parked(&self) -> bool {
        matches!(self, SenpukiError::Parked)
    }
}

/// The error surfaced by [`crate::executor::Executor::wait_for`] once an
/// execution reaches a terminal, non-completed state.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution timed out")]
    TimedOut,

    #[error("execution was cancelled")]
    Cancelled,

    #[error("timed out waiting for execution to settle")]
    WaitTimeout,

    #[error(transparent)]
    Backend(#[from] SenpukiError),
}
