//! Maps a stable step name to a callable plus its durability metadata.
//!
//! Registration is always explicit (`registry.register::<F>()` or
//! `registry.register_with(name, meta, invoker)`); there is no ambient
//! global registry (see SPEC_FULL.md design note on global state). The
//! registry is owned by the [`crate::executor::Executor`] instance that
//! constructs it.

use crate::codec::{decode_payload, json, Codec, Payload};
use crate::context::ExecutionContext;
use crate::error::SenpukiError;
use crate::model::TaskKind;
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Which codec a registered function's typed wrapper uses to decode its
/// arguments and encode its result. Chosen once, at `Executor` construction
/// time (see `Executor::with_binary_codec`), never per call.
#[derive(Debug, Clone, Copy, Default)]
pub enum CodecChoice {
    #[default]
    Json,
    #[cfg(feature = "bincode")]
    Binary,
}

impl CodecChoice {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, SenpukiError> {
        match self {
            CodecChoice::Json => json().encode(value),
            #[cfg(feature = "bincode")]
            CodecChoice::Binary => crate::codec::binary().encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, SenpukiError> {
        // Decoding dispatches on the payload's own tag byte rather than
        // trusting `self`, since a payload may have been produced before a
        // codec change, or arrive from a different process.
        decode_payload(payload)
    }
}

/// A type-erased step implementation: takes encoded arguments and a bound
/// execution context, returns an encoded result.
pub type Invoker =
    Arc<dyn Fn(Payload, ExecutionContext) -> BoxFuture<'static, Result<Payload, SenpukiError>> + Send + Sync>;

/// A function that derives a stable idempotency/cache key from encoded
/// arguments.
pub type KeyFn = Arc<dyn Fn(&Payload) -> String + Send + Sync>;

/// Durability metadata for one registered step.
#[derive(Clone)]
pub struct FunctionMeta {
    pub kind: TaskKind,
    pub queue: String,
    pub priority: i32,
    pub tags: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout: Option<std::time::Duration>,
    pub cacheable: bool,
    pub idempotency_key_fn: Option<KeyFn>,
    pub concurrency_limit: Option<u32>,
    pub concurrency_group: Option<String>,
}

impl std::fmt::Debug for FunctionMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionMeta")
            .field("kind", &self.kind)
            .field("queue", &self.queue)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .field("cacheable", &self.cacheable)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("concurrency_group", &self.concurrency_group)
            .finish()
    }
}

impl Default for FunctionMeta {
    fn default() -> Self {
        Self {
            kind: TaskKind::Activity,
            queue: "default".to_string(),
            priority: 0,
            tags: Vec::new(),
            retry_policy: None,
            timeout: None,
            cacheable: false,
            idempotency_key_fn: None,
            concurrency_limit: None,
            concurrency_group: None,
        }
    }
}

impl FunctionMeta {
    pub fn orchestrator() -> Self {
        Self {
            kind: TaskKind::Orchestrator,
            ..Default::default()
        }
    }

    pub fn activity() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn with_idempotency_key_fn(mut self, f: impl Fn(&Payload) -> String + Send + Sync + 'static) -> Self {
        self.idempotency_key_fn = Some(Arc::new(f));
        self
    }

    pub fn with_concurrency_limit(mut self, limit: u32, group: impl Into<String>) -> Self {
        self.concurrency_limit = Some(limit);
        self.concurrency_group = Some(group.into());
        self
    }
}

/// A durable function: an ordinary async function whose invocation is
/// persisted as a task. Implement this for a unit struct named after the
/// step and register it with [`FunctionRegistry::register`].
pub trait DurableFn: Send + Sync + 'static {
    type Args: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable step name: conventionally `concat!(module_path!(), "::", stringify!(Self))`.
    const NAME: &'static str;

    fn meta() -> FunctionMeta {
        FunctionMeta::activity()
    }

    fn call(args: Self::Args, ctx: ExecutionContext) -> BoxFuture<'static, Result<Self::Output, SenpukiError>>;
}

struct RegisteredFunction {
    meta: FunctionMeta,
    invoker: Invoker,
}

/// Owns the mapping from step name to callable. Never global: constructed
/// fresh by each [`crate::executor::Executor`].
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
    codec: CodecChoice,
}

impl FunctionRegistry {
    pub fn new(codec: CodecChoice) -> Self {
        Self {
            functions: HashMap::new(),
            codec,
        }
    }

    pub fn codec(&self) -> CodecChoice {
        self.codec
    }

    /// Registers `F` under its stable [`DurableFn::NAME`], wrapping
    /// argument/result (de)serialization with the registry's configured
    /// codec.
    pub fn register<F: DurableFn>(&mut self) {
        let codec = self.codec;
        let invoker: Invoker = Arc::new(move |payload, ctx| {
            Box::pin(async move {
                let args: F::Args = codec.decode(&payload)?;
                let output = F::call(args, ctx).await?;
                codec.encode(&output)
            })
        });
        self.register_with(F::NAME, F::meta(), invoker);
    }

    /// Registers a step under an explicit name with an already type-erased
    /// invoker. Used by the orchestrator driver's internal bookkeeping and
    /// by callers who need to register closures rather than `DurableFn`
    /// impls.
    pub fn register_with(&mut self, name: impl Into<String>, meta: FunctionMeta, invoker: Invoker) {
        self.functions.insert(name.into(), RegisteredFunction { meta, invoker });
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn meta(&self, name: &str) -> Option<&FunctionMeta> {
        self.functions.get(name).map(|f| &f.meta)
    }

    pub fn invoker(&self, name: &str) -> Option<Invoker> {
        self.functions.get(name).map(|f| f.invoker.clone())
    }

    pub fn require(&self, name: &str) -> Result<(&FunctionMeta, Invoker), SenpukiError> {
        self.functions
            .get(name)
            .map(|f| (&f.meta, f.invoker.clone()))
            .ok_or_else(|| SenpukiError::NotRegistered(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Add;
    impl DurableFn for Add {
        type Args = (i64, i64);
        type Output = i64;
        const NAME: &'static str = "senpuki::registry::tests::Add";

        fn call(args: Self::Args, _ctx: ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move { Ok(args.0 + args.1) })
        }
    }

    #[test]
    fn unregistered_name_fails_fast() {
        let registry = FunctionRegistry::new(CodecChoice::Json);
        assert!(matches!(
            registry.require("nope"),
            Err(SenpukiError::NotRegistered(_))
        ));
    }

    #[test]
    fn registered_function_is_found() {
        let mut registry = FunctionRegistry::new(CodecChoice::Json);
        registry.register::<Add>();
        assert!(registry.is_registered(Add::NAME));
    }
}
