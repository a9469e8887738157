//! Classifier client.
//!
//! Each uncached request is classified by a small remote model. The call
//! runs under a tight latency budget: the streaming transport aborts the
//! upstream connection as soon as a single decision digit has been
//! decoded, so one stream byte is enough to route. Failures here never
//! reach the client; the routing layer degrades to the frontier tier.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::payload::{build_classifier_input, extract_decision};
use crate::sse::{is_done_marker, SseEventBuffer};
use crate::util::chat_completions_url;

/// Which part of the payload feeds the classifier prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Content of the last user message (full serialization fallback).
    LastUser,
    /// All messages serialized as `[{role, content}]`.
    FullMessages,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub strategy: SelectionStrategy,
    pub max_chars: usize,
    pub max_tokens: u64,
    pub temperature: f32,
    pub timeout_ms: u64,
    pub logit_bias: Option<Value>,
    pub force_stream: bool,
    pub warmup: bool,
    pub warmup_delay_ms: u64,
    pub keep_alive_ms: u64,
    pub loading_retry_ms: u64,
    pub loading_max_retries: u32,
}

/// Internal classifier failure taxonomy. These degrade to a frontier
/// route at the caller; they are never surfaced to the client.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("classifier timeout after {0} ms")]
    Timeout(u64),

    #[error("classifier model loading: {0}")]
    ModelLoading(String),

    #[error("classifier produced no decision")]
    NoDecision,

    #[error("classifier returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("classifier transport error: {0}")]
    Transport(String),
}

/// Floor for the widened timeout on the single timeout retry.
const RETRY_TIMEOUT_FLOOR_MS: u64 = 8_000;
/// Floor for the warmup call timeout; warmup exists to paint cold weights.
const WARMUP_TIMEOUT_FLOOR_MS: u64 = 10_000;

pub struct Classifier {
    cfg: ClassifierConfig,
    http: reqwest::Client,
}

impl Classifier {
    pub fn new(cfg: ClassifierConfig, http: reqwest::Client) -> Self {
        Self { cfg, http }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }

    pub fn endpoint(&self) -> String {
        chat_completions_url(&self.cfg.base_url)
    }

    /// Classify an inbound payload into a decision digit.
    pub async fn classify(&self, payload: &Value) -> Result<u8, ClassifyError> {
        let input = build_classifier_input(payload, &self.cfg.strategy, self.cfg.max_chars);
        self.classify_input(&input, self.cfg.timeout_ms).await
    }

    /// Classify raw input text. Applies the model-loading retry loop
    /// around the timeout-retry transport call.
    pub async fn classify_input(&self, input: &str, timeout_ms: u64) -> Result<u8, ClassifyError> {
        let mut loading_attempts = 0u32;
        loop {
            match self.classify_with_timeout_retry(input, timeout_ms).await {
                Err(ClassifyError::ModelLoading(detail))
                    if loading_attempts < self.cfg.loading_max_retries =>
                {
                    loading_attempts += 1;
                    warn!(
                        attempt = loading_attempts,
                        "classifier model loading, retrying: {detail}"
                    );
                    tokio::time::sleep(Duration::from_millis(self.cfg.loading_retry_ms)).await;
                }
                other => return other,
            }
        }
    }

    /// One classification attempt, retried once on timeout with the
    /// budget widened to at least eight seconds. A second timeout
    /// propagates.
    async fn classify_with_timeout_retry(
        &self,
        input: &str,
        timeout_ms: u64,
    ) -> Result<u8, ClassifyError> {
        match self.classify_modes(input, timeout_ms).await {
            Err(ClassifyError::Timeout(_)) => {
                warn!("classifier timeout, retrying once");
                let widened = (timeout_ms * 2).max(RETRY_TIMEOUT_FLOOR_MS);
                self.classify_modes(input, widened).await
            }
            other => other,
        }
    }

    /// Try both transports in the configured order; the second transport
    /// only runs when the first produced no decision.
    async fn classify_modes(&self, input: &str, timeout_ms: u64) -> Result<u8, ClassifyError> {
        if self.cfg.force_stream {
            match self.request_streaming(input, timeout_ms).await {
                Err(ClassifyError::NoDecision) => self.request_buffered(input, timeout_ms).await,
                other => other,
            }
        } else {
            match self.request_buffered(input, timeout_ms).await {
                Err(ClassifyError::NoDecision) => self.request_streaming(input, timeout_ms).await,
                other => other,
            }
        }
    }

    fn body(&self, input: &str, stream: bool) -> Value {
        let mut body = json!({
            "model": self.cfg.model,
            "messages": [
                {"role": "system", "content": self.cfg.system_prompt},
                {"role": "user", "content": format!("Return only 0, 1, or 2. Input:\n{input}")},
            ],
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_tokens,
            "stream": stream,
        });
        if let Some(bias) = &self.cfg.logit_bias {
            body["logit_bias"] = bias.clone();
        }
        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut rb = self
            .http
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(body);
        if let Some(key) = &self.cfg.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }

    async fn request_buffered(&self, input: &str, timeout_ms: u64) -> Result<u8, ClassifyError> {
        let body = self.body(input, false);
        let resp = self
            .request(&body)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout_ms))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| map_transport_error(e, timeout_ms))?;
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ClassifyError::Transport(format!("invalid classifier JSON: {e}")))?;
        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .or_else(|| parsed.pointer("/choices/0/text").and_then(|v| v.as_str()))
            .unwrap_or("");
        extract_decision(content).ok_or(ClassifyError::NoDecision)
    }

    /// Streaming transport. The whole exchange runs under one deadline;
    /// the connection is dropped the moment a digit is decoded.
    async fn request_streaming(&self, input: &str, timeout_ms: u64) -> Result<u8, ClassifyError> {
        let body = self.body(input, true);
        let fut = async {
            let resp = self
                .request(&body)
                .header("accept", "text/event-stream")
                .send()
                .await
                .map_err(|e| map_transport_error(e, timeout_ms))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(classify_http_error(status.as_u16(), text));
            }

            use futures_util::StreamExt;
            let mut stream = resp.bytes_stream();
            let mut events = SseEventBuffer::new();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| ClassifyError::Transport(e.to_string()))?;
                events.extend(&chunk);
                while let Some(data) = events.next_event() {
                    if is_done_marker(&data) {
                        return Err(ClassifyError::NoDecision);
                    }
                    let Ok(event) = serde_json::from_str::<Value>(&data) else {
                        continue;
                    };
                    let delta = event
                        .pointer("/choices/0/delta/content")
                        .and_then(|v| v.as_str())
                        .or_else(|| event.pointer("/choices/0/text").and_then(|v| v.as_str()))
                        .unwrap_or("");
                    if let Some(decision) = extract_decision(delta) {
                        // Dropping the stream here aborts the upstream
                        // connection.
                        return Ok(decision);
                    }
                }
            }
            Err(ClassifyError::NoDecision)
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(ClassifyError::Timeout(timeout_ms)),
        }
    }

    /// Synthetic classification to keep cold model weights resident.
    pub async fn warmup_once(&self) -> Result<u8, ClassifyError> {
        let timeout = self.cfg.timeout_ms.max(WARMUP_TIMEOUT_FLOOR_MS);
        self.classify_input("Warmup.", timeout).await
    }
}

/// Spawn the warmup task: one delayed synthetic call, then repeated at
/// the keep-alive interval when configured. Detached; never blocks
/// shutdown, and failures are only warn-logged.
pub fn spawn_warmup(classifier: Arc<Classifier>) {
    let cfg = classifier.config().clone();
    if !cfg.warmup {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(cfg.warmup_delay_ms)).await;
        loop {
            if let Err(e) = classifier.warmup_once().await {
                warn!("classifier warmup failed: {e}");
            }
            if cfg.keep_alive_ms == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(cfg.keep_alive_ms)).await;
        }
    });
}

fn classify_http_error(status: u16, body: String) -> ClassifyError {
    if is_model_loading(&body) {
        ClassifyError::ModelLoading(body)
    } else {
        ClassifyError::Upstream { status, body }
    }
}

fn map_transport_error(e: reqwest::Error, timeout_ms: u64) -> ClassifyError {
    if e.is_timeout() {
        ClassifyError::Timeout(timeout_ms)
    } else if e.to_string().contains("MODEL_LOADING") {
        ClassifyError::ModelLoading(e.to_string())
    } else {
        ClassifyError::Transport(e.to_string())
    }
}

fn is_model_loading(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("loading model") || lower.contains("model loading")
}
