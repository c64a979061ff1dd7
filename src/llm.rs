//! Language-model invocation.
//!
//! Defines the [`CompletionTransport`] trait and its HTTP implementation,
//! plus the [`ModelInvoker`] that wraps a transport with a hard timeout and
//! bounded retry.
//!
//! # Transport
//!
//! [`HttpTransport`] posts an OpenAI-compatible chat completion to
//! `{base_url}/chat/completions` with a bearer token read from the
//! configured environment variable. Two response modes converge on the same
//! [`Completion`]:
//!
//! - **buffered**: `choices[0].message.content` from one JSON body
//! - **streaming**: Server-Sent Events; `choices[0].delta.content`
//!   fragments are accumulated by [`SseAccumulator`] until `data: [DONE]`
//!   or the stream closes
//!
//! # Retry Strategy
//!
//! - timeout, network error, HTTP 429, HTTP 5xx → retry
//! - any other HTTP status, undecodable body, missing API key → fail immediately
//! - at most `max_retries` retries (default 1)
//! - backoff: `min(500ms · 2^attempt, 1500ms)`
//!
//! Exhausting retries never panics or propagates: the caller receives an
//! [`Invocation`] whose `outcome` is the last error, together with the retry
//! count, so it can fall back to precheck-only results.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ModelConfig;
use crate::error::InvokeError;
use crate::models::TokenUsage;

const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 1_500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub stream: bool,
}

impl ChatRequest {
    /// A deterministic single-message request.
    pub fn user(model: &str, prompt: &str, max_tokens: u32, stream: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.0,
            max_tokens,
            top_p: 1.0,
            stream,
        }
    }
}

/// Raw text returned by the model, however it was transported.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// A way of getting one completion for one request.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, InvokeError>;
}

// ============ HTTP transport ============

/// OpenAI-compatible chat completions over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key_env: String,
    timeout_secs: u64,
}

impl HttpTransport {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key_env: config.api_key_env.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> InvokeError {
        if e.is_timeout() {
            InvokeError::Timeout(self.timeout_secs)
        } else if e.is_decode() {
            InvokeError::Decode(e.to_string())
        } else {
            InvokeError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, InvokeError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");
        // An empty variable name means the provider takes no credentials.
        if !self.api_key_env.is_empty() {
            let api_key = std::env::var(&self.api_key_env)
                .map_err(|_| InvokeError::MissingApiKey(self.api_key_env.clone()))?;
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if request.stream {
            let mut response = response;
            let mut acc = SseAccumulator::default();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| self.map_reqwest_error(e))?
            {
                acc.push_bytes(&chunk);
                if acc.is_done() {
                    break;
                }
            }
            return Ok(acc.finish());
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InvokeError::Decode(e.to_string()))?;
        parse_completion_response(&json)
    }
}

/// Extracts `choices[0].message.content` and `usage` from a buffered reply.
pub fn parse_completion_response(json: &serde_json::Value) -> Result<Completion, InvokeError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| InvokeError::Decode("missing choices[0].message.content".to_string()))?;

    Ok(Completion {
        text: text.to_string(),
        usage: parse_usage(json),
    })
}

fn parse_usage(json: &serde_json::Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
        estimated: false,
    })
}

// ============ SSE ============

/// Incremental Server-Sent-Events reader for streamed completions.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    pending: Vec<u8>,
    text: String,
    usage: Option<TokenUsage>,
    done: bool,
}

impl SseAccumulator {
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.done {
            return;
        }
        self.pending.extend_from_slice(bytes);
        while let Some(nl) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=nl).collect();
            self.process_line(&String::from_utf8_lossy(&line));
            if self.done {
                self.pending.clear();
                return;
            }
        }
    }

    fn process_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\n', '\r']);
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
            log::debug!("skipping undecodable SSE frame: {}", payload);
            return;
        };
        if let Some(fragment) = json
            .pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())
        {
            self.text.push_str(fragment);
        }
        if let Some(usage) = parse_usage(&json) {
            self.usage = Some(usage);
        }
    }

    /// True once `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Flushes a final unterminated line and returns the accumulated text.
    pub fn finish(mut self) -> Completion {
        if !self.done && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.process_line(&String::from_utf8_lossy(&rest));
        }
        Completion {
            text: self.text,
            usage: self.usage,
        }
    }
}

// ============ Invoker ============

/// Result of one logical model call, including every retry.
#[derive(Debug)]
pub struct Invocation {
    pub outcome: Result<Completion, InvokeError>,
    pub retry_count: u32,
    pub latency_ms: u64,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Delay before retry number `attempt + 1`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(MAX_DELAY_MS))
}

/// Calls a [`CompletionTransport`] with timeout and retry.
pub struct ModelInvoker {
    transport: Arc<dyn CompletionTransport>,
    model: String,
    max_retries: u32,
    timeout: Duration,
}

impl ModelInvoker {
    /// Builds an invoker over [`HttpTransport`].
    pub fn from_config(config: &ModelConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(HttpTransport::new(config)?);
        Ok(Self::with_transport(
            transport,
            &config.model,
            config.max_retries,
            config.timeout_secs,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn CompletionTransport>,
        model: &str,
        max_retries: u32,
        timeout_secs: u64,
    ) -> Self {
        Self {
            transport,
            model: model.to_string(),
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn invoke(&self, prompt: &str, max_tokens: u32, stream: bool) -> Invocation {
        let request = ChatRequest::user(&self.model, prompt, max_tokens, stream);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let result = match tokio::time::timeout(self.timeout, self.transport.complete(&request)).await {
                Ok(r) => r,
                Err(_) => Err(InvokeError::Timeout(self.timeout.as_secs())),
            };

            match result {
                Ok(mut completion) => {
                    if completion.usage.is_none() {
                        completion.usage = Some(estimate_usage(prompt, &completion.text));
                    }
                    log::debug!(
                        "model call succeeded after {} retr{} ({} chars)",
                        attempt,
                        if attempt == 1 { "y" } else { "ies" },
                        completion.text.len()
                    );
                    return Invocation {
                        outcome: Ok(completion),
                        retry_count: attempt,
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    log::warn!("model call failed ({}); retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("model call failed after {} retries: {}", attempt, e);
                    return Invocation {
                        outcome: Err(e),
                        retry_count: attempt,
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }
    }
}

/// Rough token counts (4 chars per token) for providers that report none.
fn estimate_usage(prompt: &str, completion: &str) -> TokenUsage {
    let p = (prompt.chars().count() as u64).div_ceil(4);
    let c = (completion.chars().count() as u64).div_ceil(4);
    TokenUsage {
        prompt_tokens: p,
        completion_tokens: c,
        total_tokens: p + c,
        estimated: true,
    }
}
