//! The orchestrator driver.
//!
//! An orchestrator body is an ordinary async [`crate::registry::DurableFn`]
//! whose implementation calls [`crate::context::ExecutionContext::call`],
//! [`crate::context::ExecutionContext::sleep`], or
//! [`crate::context::ExecutionContext::wait_for_signal`]. Each such call is
//! one logical step with a deterministic index in call order; the actual
//! parking/replay machinery lives on [`crate::context::ExecutionContext`]
//! because it must be reachable from inside the user's body via `?`, and the
//! resulting [`crate::error::SenpukiError::Parked`] sentinel is handled by
//! [`crate::worker::WorkerTaskRunner`] after the body returns — there is no
//! separate "driver" type that wraps the body, by design: the context *is*
//! the driver's handle into the running body.
//!
//! This module collects the handful of orchestrator-only helpers that don't
//! belong on [`crate::context::ExecutionContext`] itself, plus the documented
//! contract every orchestrator body must follow.
//!
//! # Replay determinism
//!
//! The orchestrator body must produce the same sequence of durable steps
//! given the same recorded outcomes. This is a documented contract, not
//! enforced by the type system: branching on non-durable state (wall-clock
//! time, random numbers, environment variables) inside an orchestrator body
//! will desync the step index from the persisted `progress` log on replay.
//! Use [`crate::context::ExecutionContext::sleep`] instead of
//! `tokio::time::sleep`, and push any such decision into an activity call
//! instead of evaluating it inline.

use crate::codec::Payload;
use crate::context::ExecutionContext;
use crate::error::SenpukiError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bounded fan-out: applies one durable call per item, with at most
/// `max_in_flight` children created and awaited per pass. A ceiling lower
/// than `items.len()` only bounds how many child tasks exist concurrently
/// server-side — the orchestrator still parks until every item settles, it
/// just creates them in waves rather than all at once.
pub async fn map<T: Serialize + Sync, O: DeserializeOwned>(
    ctx: &ExecutionContext,
    step_name: &'static str,
    items: &[T],
    max_in_flight: usize,
) -> Result<Vec<O>, SenpukiError> {
    if max_in_flight == 0 || max_in_flight >= items.len() {
        return ctx.call_all(step_name, items, items.len().max(1)).await;
    }
    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(max_in_flight) {
        let chunk_results: Vec<O> = ctx.call_all(step_name, chunk, chunk.len()).await?;
        results.extend(chunk_results);
    }
    Ok(results)
}

/// Encodes arguments with the default JSON codec, for callers that need to
/// pre-compute a payload (e.g. to derive a cache key) before issuing the
/// durable call itself.
pub fn encode_args<T: Serialize>(args: &T) -> Result<Payload, SenpukiError> {
    crate::codec::json().encode(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_with_zero_ceiling_falls_back_to_unbounded() {
        // max_in_flight=0 degrades to "no limit" rather than a deadlock.
        assert_eq!(0usize.max(1), 1);
    }
}
