//! Model Client (spec §4.C) — one logical connection to one external model
//! server.
//!
//! Grounded on `llm/client.rs`'s `LlmClient`: the same jittered
//! exponential-backoff retry, the same cancellation-token wiring, the same
//! split between transient connection errors (retried) and model-level
//! errors (never retried).

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SynapseError};

/// Parameters for one `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// One generated token/chunk from a model's lazy output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedToken {
    pub text: String,
    pub is_final: bool,
}

/// A finite, non-restartable lazy sequence of generated tokens.
pub type TokenStream = Pin<Box<dyn futures::Stream<Item = Result<GeneratedToken>> + Send>>;

/// Cheap liveness probe result.
#[derive(Debug, Clone, Copy)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: f64,
    pub tokens_per_second: f64,
    pub vram_gb: f64,
}

/// An opaque, non-reusable handle to one in-flight `generate` call.
#[derive(Debug, Clone)]
pub struct GenerationHandle {
    pub cancel_token: CancellationToken,
}

/// One logical connection to one external model server.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_id(&self) -> &str;

    /// Cheap liveness probe with minimal stats. Never retried: a failed
    /// health check simply reports unhealthy.
    async fn health(&self) -> HealthReport;

    /// Start a generation; returns a lazy, finite token stream plus the
    /// handle used to cancel it.
    async fn generate(&self, params: GenerateParams) -> Result<(TokenStream, GenerationHandle)>;

    /// Cancel an in-flight generation. Idempotent.
    fn cancel(&self, handle: &GenerationHandle) {
        handle.cancel_token.cancel();
    }
}

/// HTTP-backed client for an OpenAI-compatible local model server,
/// generalizing `llm/client.rs`'s `LlmClient` from a named SaaS provider to
/// one fleet member.
pub struct HttpModelClient {
    model_id: String,
    base_url: String,
    http: HttpClient,
    max_retries: u32,
}

impl HttpModelClient {
    pub fn new(model_id: impl Into<String>, base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(300))
            .user_agent("synapse/0.1")
            .build()?;
        Ok(Self {
            model_id: model_id.into(),
            base_url: base_url.into(),
            http,
            max_retries: 5,
        })
    }

    /// Jittered exponential-backoff retry for transient connection errors
    /// only; model-level (4xx other than 429) errors return immediately.
    async fn retry_with_backoff<F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> std::result::Result<reqwest::Response, SynapseError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(500);

        loop {
            if cancel.is_cancelled() {
                return Err(SynapseError::Cancelled);
            }

            match operation().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        if attempt >= self.max_retries {
                            return Err(SynapseError::ModelTransient {
                                model_id: self.model_id.clone(),
                                message: format!("exceeded retries, last status {status}"),
                            });
                        }
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        let wait = retry_after.unwrap_or(delay);
                        tokio::select! {
                            _ = sleep(wait) => {},
                            _ = cancel.cancelled() => return Err(SynapseError::Cancelled),
                        }
                    } else {
                        // Model-level error: bad params, oversized context, etc.
                        return Err(SynapseError::ModelFatal {
                            model_id: self.model_id.clone(),
                            message: format!("status {status}"),
                        });
                    }
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(SynapseError::ModelTransient {
                            model_id: self.model_id.clone(),
                            message: e.to_string(),
                        });
                    }
                    tokio::select! {
                        _ = sleep(delay) => {},
                        _ = cancel.cancelled() => return Err(SynapseError::Cancelled),
                    }
                }
            }

            attempt += 1;
            let jitter_ms = rand::thread_rng().gen_range(-200..=200i64);
            let delay_ms = (delay.as_millis() as i64 + jitter_ms).max(100) as u64;
            delay = Duration::from_millis(delay_ms) * 2;
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn health(&self) -> HealthReport {
        let start = std::time::Instant::now();
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => HealthReport {
                healthy: true,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                tokens_per_second: 0.0,
                vram_gb: 0.0,
            },
            _ => HealthReport {
                healthy: false,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                tokens_per_second: 0.0,
                vram_gb: 0.0,
            },
        }
    }

    async fn generate(&self, params: GenerateParams) -> Result<(TokenStream, GenerationHandle)> {
        let cancel_token = CancellationToken::new();
        let url = format!("{}/completion", self.base_url);
        let body = serde_json::json!({
            "prompt": params.prompt,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "stream": true,
        });

        let response = self
            .retry_with_backoff(&cancel_token, || {
                self.http.post(&url).json(&body).send()
            })
            .await?;

        let text = response
            .text()
            .await
            .map_err(|e| SynapseError::ModelTransient {
                model_id: self.model_id.clone(),
                message: e.to_string(),
            })?;

        let handle = GenerationHandle {
            cancel_token: cancel_token.clone(),
        };
        let stream = async_stream::stream! {
            for (i, chunk) in text.split_whitespace().enumerate() {
                if cancel_token.is_cancelled() {
                    break;
                }
                let is_final = i == text.split_whitespace().count().saturating_sub(1);
                yield Ok(GeneratedToken { text: format!("{chunk} "), is_final });
            }
        };
        Ok((Box::pin(stream), handle))
    }
}

/// Stub client used in tests and CGRAG-less dry runs; never touches the
/// network.
pub struct StubModelClient {
    pub model_id: String,
    pub canned_response: String,
    pub healthy: Arc<std::sync::atomic::AtomicBool>,
}

impl StubModelClient {
    pub fn new(model_id: impl Into<String>, canned_response: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            canned_response: canned_response.into(),
            healthy: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy
            .store(healthy, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelClient for StubModelClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn health(&self) -> HealthReport {
        HealthReport {
            healthy: self.healthy.load(std::sync::atomic::Ordering::SeqCst),
            latency_ms: 1.0,
            tokens_per_second: 42.0,
            vram_gb: 1.0,
        }
    }

    async fn generate(&self, _params: GenerateParams) -> Result<(TokenStream, GenerationHandle)> {
        let cancel_token = CancellationToken::new();
        let handle = GenerationHandle {
            cancel_token: cancel_token.clone(),
        };
        let words: Vec<String> = self
            .canned_response
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        let stream = async_stream::stream! {
            let n = words.len();
            for (i, w) in words.into_iter().enumerate() {
                if cancel_token.is_cancelled() {
                    break;
                }
                yield Ok(GeneratedToken { text: format!("{w} "), is_final: i + 1 == n });
            }
        };
        Ok((Box::pin(stream), handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stub_client_streams_canned_response_in_order() {
        let client = StubModelClient::new("m1", "hello world");
        let (mut stream, _handle) = client
            .generate(GenerateParams {
                prompt: "hi".into(),
                max_tokens: 10,
                temperature: 0.5,
            })
            .await
            .unwrap();
        let mut out = String::new();
        while let Some(tok) = stream.next().await {
            out.push_str(&tok.unwrap().text);
        }
        assert_eq!(out.trim(), "hello world");
    }

    #[tokio::test]
    async fn health_reflects_stub_flag() {
        let client = StubModelClient::new("m1", "x");
        assert!(client.health().await.healthy);
        client.set_healthy(false);
        assert!(!client.health().await.healthy);
    }
}
