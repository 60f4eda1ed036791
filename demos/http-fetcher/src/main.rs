//! # HTTP Fetcher Demo
//!
//! Shows a durable activity built straight on `reqwest` — no adapter layer,
//! just a plain async function wrapped in [`senpuki::DurableFn`] — fanned out
//! by a durable orchestrator. Runs entirely in-memory so it has no database
//! to set up; swap `senpuki_testing::MemoryBackend` for `senpuki_sqlite` or
//! `senpuki_postgres` to make it crash-durable across process restarts.

use futures::future::BoxFuture;
use senpuki::{
    DispatchOptions, DurableFn, Executor, ExecutionContext, FunctionMeta, RetryPolicy, SenpukiError,
    WorkerLifecycle,
};
use senpuki_testing::MemoryBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchOutcome {
    url: String,
    status: u16,
    bytes: usize,
}

struct FetchUrl;

impl DurableFn for FetchUrl {
    type Args = String;
    type Output = FetchOutcome;
    const NAME: &'static str = "http_fetcher::FetchUrl";

    fn meta() -> FunctionMeta {
        // Network hiccups are retryable; the orchestrator fans out with a
        // shared client per attempt rather than holding one across replays.
        FunctionMeta::activity().with_retry_policy(RetryPolicy::new(
            4,
            Duration::from_millis(100),
            Duration::from_secs(5),
            2.0,
            0.2,
        ))
    }

    fn call(url: Self::Args, _ctx: ExecutionContext) -> BoxFuture<'static, Result<Self::Output, SenpukiError>> {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| SenpukiError::Terminal(e.to_string()))?;

            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| SenpukiError::Retryable(format!("{url}: {e}")))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| SenpukiError::Retryable(format!("{url}: reading body: {e}")))?;

            Ok(FetchOutcome { url, status, bytes: body.len() })
        })
    }
}

struct FetchAll;

impl DurableFn for FetchAll {
    type Args = Vec<String>;
    type Output = Vec<FetchOutcome>;
    const NAME: &'static str = "http_fetcher::FetchAll";

    fn meta() -> FunctionMeta {
        FunctionMeta::orchestrator()
    }

    fn call(urls: Self::Args, ctx: ExecutionContext) -> BoxFuture<'static, Result<Self::Output, SenpukiError>> {
        Box::pin(async move {
            // At most 3 fetches in flight at once, regardless of how many
            // URLs were passed in.
            senpuki::map(&ctx, FetchUrl::NAME, &urls, 3).await
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let backend = Arc::new(MemoryBackend::new());
    let bus = Arc::new(senpuki::InProcessBus::new());
    let mut executor = Executor::new(backend, bus);
    executor.register::<FetchUrl>();
    executor.register::<FetchAll>();

    let lifecycle = WorkerLifecycle::new("http-fetcher-worker");
    let handle = executor.serve(lifecycle.clone(), Default::default());
    lifecycle.wait_until_ready().await;

    let urls = vec![
        "https://example.com".to_string(),
        "https://httpbin.org/status/200".to_string(),
        "https://httpbin.org/status/404".to_string(),
    ];

    println!("Dispatching a fetch-all orchestrator for {} urls...", urls.len());
    let execution_id = executor.dispatch::<FetchAll>(urls, DispatchOptions::default()).await?;

    match executor.wait_for::<Vec<FetchOutcome>>(execution_id, Some(Duration::from_secs(30))).await {
        Ok(results) => {
            for r in results {
                println!("  {} -> {} ({} bytes)", r.url, r.status, r.bytes);
            }
        }
        Err(e) => println!("fetch-all failed: {e}"),
    }

    handle.stop().await;
    Ok(())
}
