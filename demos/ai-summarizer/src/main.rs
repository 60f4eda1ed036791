//! # AI Summarizer Demo
//!
//! Calls the Anthropic API directly from a durable activity body — no
//! adapter layer, just `reqwest` + `serde` — and lets senpuki's retry policy
//! handle the transient-vs-terminal classification (a dropped connection is
//! worth retrying, a 4xx from a malformed request is not).

use futures::future::BoxFuture;
use senpuki::{DispatchOptions, DurableFn, Executor, ExecutionContext, FunctionMeta, RetryPolicy, SenpukiError};
use senpuki_testing::MemoryBackend;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

async fn call_anthropic(client: &reqwest::Client, api_key: &str, request: AnthropicRequest) -> Result<AnthropicResponse, SenpukiError> {
    let response = client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|e| SenpukiError::Retryable(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = format!("API error {status}: {body}");
        // A 5xx or rate limit is worth retrying; anything else (bad request,
        // auth failure) never gets more attempts.
        return if status.is_server_error() || status.as_u16() == 429 {
            Err(SenpukiError::Retryable(message))
        } else {
            Err(SenpukiError::Terminal(message))
        };
    }

    response.json().await.map_err(|e| SenpukiError::Retryable(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Summary {
    summary: String,
    tokens_used: u32,
}

struct SummarizeText;

impl DurableFn for SummarizeText {
    type Args = String;
    type Output = Summary;
    const NAME: &'static str = "ai_summarizer::SummarizeText";

    fn meta() -> FunctionMeta {
        FunctionMeta::activity()
            .with_timeout(Duration::from_secs(30))
            .with_retry_policy(RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(20), 2.0, 0.2))
    }

    fn call(text: Self::Args, _ctx: ExecutionContext) -> BoxFuture<'static, Result<Self::Output, SenpukiError>> {
        Box::pin(async move {
            let api_key = env::var("ANTHROPIC_API_KEY")
                .map_err(|_| SenpukiError::Terminal("ANTHROPIC_API_KEY environment variable required".into()))?;
            let client = reqwest::Client::new();

            let request = AnthropicRequest {
                model: "claude-3-5-sonnet-20241022".to_string(),
                max_tokens: 1024,
                messages: vec![Message { role: "user".to_string(), content: format!("Summarize this text in 2-3 sentences:\n\n{text}") }],
            };

            let response = call_anthropic(&client, &api_key, request).await?;
            let summary = response.content.first().and_then(|c| c.text.clone()).unwrap_or_default();
            Ok(Summary { summary, tokens_used: response.usage.input_tokens + response.usage.output_tokens })
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
    executor.register::<SummarizeText>();

    let lifecycle = senpuki::WorkerLifecycle::new("ai-summarizer-worker");
    let handle = executor.serve(lifecycle.clone(), Default::default());
    lifecycle.wait_until_ready().await;

    let text = r#"
        Rust is a multi-paradigm, general-purpose programming language that emphasizes
        performance, type safety, and concurrency. It enforces memory safety -- meaning that
        all references point to valid memory -- without a garbage collector. To simultaneously
        enforce memory safety and prevent data races, its "borrow checker" tracks the object
        lifetime of all references in a program during compilation.
    "#;

    println!("Summarizing text...");
    let execution_id = executor.dispatch::<SummarizeText>(text.to_string(), DispatchOptions::default()).await?;

    match executor.wait_for::<Summary>(execution_id, Some(Duration::from_secs(60))).await {
        Ok(summary) => {
            println!("Summary ({} tokens): {}", summary.tokens_used, summary.summary);
        }
        Err(e) => println!("summarization failed: {e}"),
    }

    handle.stop().await;
    Ok(())
}
