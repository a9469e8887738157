//! Provider adapters.
//!
//! Every adapter owns the upstream HTTP exchange for one request, stamps
//! the decision/upstream response headers, and re-emits the reply in the
//! OpenAI chat-completion wire shape, buffered JSON or SSE chunks,
//! recording normalized token usage exactly once per request.

pub mod anthropic;
pub mod azure;
pub mod cohere;
pub mod gemini;
pub mod openai;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{Provider, Upstream};
use crate::sse::{is_done_marker, SseEventBuffer};
use crate::usage::{Route, UsageTracker};
use crate::util::{error_response, upstream_error_response, AppState};

/// Adapter selected for an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
    Gemini,
    Cohere,
    AzureOpenAi,
}

/// Resolve the adapter for an upstream.
///
/// A recognized literal tag wins. `auto` (or an empty tag) and unknown
/// tags infer from the base-URL host, then the API-key prefix, and fall
/// back to the OpenAI-compatible adapter, so a local engine tagged
/// `vllm` or `ollama` is still served by the pass-through. `None` here
/// becomes HTTP 501 `provider_not_supported`.
pub fn resolve_provider(upstream: &Upstream) -> Option<ProviderKind> {
    match &upstream.provider {
        Provider::OpenAiCompatible
        | Provider::OpenRouter
        | Provider::OpenAi
        | Provider::Mistral
        | Provider::Groq
        | Provider::Together
        | Provider::Perplexity => Some(ProviderKind::OpenAiCompatible),
        Provider::Anthropic => Some(ProviderKind::Anthropic),
        Provider::Gemini => Some(ProviderKind::Gemini),
        Provider::Cohere => Some(ProviderKind::Cohere),
        Provider::AzureOpenAi => Some(ProviderKind::AzureOpenAi),
        Provider::Auto | Provider::Other(_) => Some(
            infer_from_host(&upstream.base_url)
                .or_else(|| infer_from_key(upstream.api_key.as_deref()))
                .unwrap_or(ProviderKind::OpenAiCompatible),
        ),
    }
}

fn host_of(url: &str) -> &str {
    url.split("://")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("")
}

fn infer_from_host(base_url: &str) -> Option<ProviderKind> {
    let host = host_of(base_url);
    if host.contains("anthropic.com") {
        Some(ProviderKind::Anthropic)
    } else if host.contains("generativelanguage.googleapis.com") {
        Some(ProviderKind::Gemini)
    } else if host.contains("api.cohere.ai") || host.contains("api.cohere.com") {
        // The upstream service moved hosts; both spellings are live.
        Some(ProviderKind::Cohere)
    } else if host.contains("openai.azure.com") {
        Some(ProviderKind::AzureOpenAi)
    } else if host.contains("api.mistral.ai")
        || host.contains("api.groq.com")
        || host.contains("api.together.xyz")
        || host.contains("api.perplexity.ai")
        || host.contains("openrouter.ai")
        || host.contains("api.openai.com")
    {
        Some(ProviderKind::OpenAiCompatible)
    } else {
        None
    }
}

fn infer_from_key(api_key: Option<&str>) -> Option<ProviderKind> {
    let key = api_key?;
    if key.starts_with("sk-ant-") {
        Some(ProviderKind::Anthropic)
    } else if key.starts_with("AIza") {
        Some(ProviderKind::Gemini)
    } else if key.to_ascii_lowercase().contains("cohere") {
        Some(ProviderKind::Cohere)
    } else {
        None
    }
}

/// Per-request routing outcome handed to the adapters.
#[derive(Clone)]
pub struct RouteInfo {
    pub decision: u8,
    pub route: Route,
    pub decision_header: String,
    pub upstream_header: String,
    pub upstream_name: String,
}

impl RouteInfo {
    pub fn new(state: &AppState, decision: u8, route: Route, upstream: &Upstream) -> Self {
        Self {
            decision,
            route,
            decision_header: state.config.decision_header.clone(),
            upstream_header: state.config.upstream_header.clone(),
            upstream_name: upstream.name.clone(),
        }
    }

    /// Stamp the decision and upstream headers on a response.
    pub fn decorate(&self, builder: &mut HttpResponseBuilder) {
        builder.insert_header((self.decision_header.as_str(), self.decision.to_string()));
        builder.insert_header((self.upstream_header.as_str(), self.upstream_name.as_str()));
    }
}

/// Resolve the adapter and delegate the exchange to it.
pub async fn dispatch(
    state: &AppState,
    decision: u8,
    route: Route,
    payload: Value,
) -> HttpResponse {
    let upstream = state.config.upstream_for(route);
    let info = RouteInfo::new(state, decision, route, upstream);

    let Some(kind) = resolve_provider(upstream) else {
        let mut builder = HttpResponse::build(StatusCode::NOT_IMPLEMENTED);
        info.decorate(&mut builder);
        return builder.json(json!({ "error": "provider_not_supported" }));
    };

    match kind {
        ProviderKind::OpenAiCompatible => openai::forward(state, upstream, &info, payload).await,
        ProviderKind::Anthropic => anthropic::forward(state, upstream, &info, payload).await,
        ProviderKind::Gemini => gemini::forward(state, upstream, &info, payload).await,
        ProviderKind::Cohere => cohere::forward(state, upstream, &info, payload).await,
        ProviderKind::AzureOpenAi => azure::forward(state, upstream, &info, payload).await,
    }
}

/// Send the outbound request with the tier's extra headers and timeout.
///
/// Buffered exchanges run under the timeout end to end; streaming ones
/// only bound the wait for response headers, since the relay afterwards
/// is paced by the upstream. Failures come back as a ready-to-return 502.
pub async fn send_upstream(
    mut rb: reqwest::RequestBuilder,
    upstream: &Upstream,
    info: &RouteInfo,
    stream: bool,
) -> Result<reqwest::Response, HttpResponse> {
    for (name, value) in &upstream.headers {
        rb = rb.header(name.as_str(), value.as_str());
    }
    let budget = Duration::from_millis(upstream.timeout_ms);
    if stream {
        match tokio::time::timeout(budget, rb.send()).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(transport_error(info, &e)),
            Err(_) => {
                let mut resp = upstream_error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream timed out after {} ms", upstream.timeout_ms),
                );
                decorate_response(&mut resp, info);
                Err(resp)
            }
        }
    } else {
        rb.timeout(budget)
            .send()
            .await
            .map_err(|e| transport_error(info, &e))
    }
}

/// 502 response for an outbound transport failure.
pub fn transport_error(info: &RouteInfo, err: &reqwest::Error) -> HttpResponse {
    let mut resp = upstream_error_response(StatusCode::BAD_GATEWAY, &err.to_string());
    decorate_response(&mut resp, info);
    resp
}

/// Stamp the decision headers on an already-built response.
pub fn decorate_response(resp: &mut HttpResponse, info: &RouteInfo) {
    use actix_web::http::header::{HeaderName, HeaderValue};
    let headers = resp.headers_mut();
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(info.decision_header.as_bytes()),
        HeaderValue::from_str(&info.decision.to_string()),
    ) {
        headers.insert(name, value);
    }
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(info.upstream_header.as_bytes()),
        HeaderValue::from_str(&info.upstream_name),
    ) {
        headers.insert(name, value);
    }
}

/// 400 response for a client-side configuration gap (missing model or
/// deployment on a translating adapter).
pub fn invalid_upstream_response(info: &RouteInfo, kind: &str) -> HttpResponse {
    let mut resp = error_response(StatusCode::BAD_REQUEST, kind);
    decorate_response(&mut resp, info);
    resp
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Buffered OpenAI chat-completion body.
pub fn chat_completion_json(model: &str, content: &str, usage: Option<&Value>) -> Value {
    let mut body = json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
    });
    if let Some(u) = usage {
        body["usage"] = u.clone();
    }
    body
}

/// One OpenAI chat-completion chunk.
pub fn chunk_json(model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": completion_id(),
        "object": "chat.completion.chunk",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

pub fn sse_frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

pub fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// What a translated upstream SSE event contributed.
#[derive(Debug, Default)]
pub struct Translated {
    pub text: Option<String>,
    pub usage: Option<Value>,
    pub end: bool,
}

/// Translate an upstream SSE body into OpenAI chunks incrementally.
///
/// `on_event` decodes one upstream event into text/usage contributions.
/// Each text delta is emitted as soon as it decodes; the terminator chunk
/// and `[DONE]` are appended when the upstream ends. Usage is recorded
/// exactly once, falling back to a usage-less record when the upstream
/// never reported any.
pub fn translate_sse_stream(
    resp: reqwest::Response,
    model: String,
    usage: Arc<UsageTracker>,
    route: Route,
    upstream_name: String,
    mut on_event: impl FnMut(&Value) -> Translated + Send + 'static,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        use futures_util::StreamExt;
        let mut byte_stream = resp.bytes_stream();
        let mut events = SseEventBuffer::new();
        let mut recorded = false;

        'read: while let Some(chunk) = byte_stream.next().await {
            let Ok(chunk) = chunk else { break };
            events.extend(&chunk);
            while let Some(data) = events.next_event() {
                if is_done_marker(&data) {
                    break 'read;
                }
                let Ok(event) = serde_json::from_str::<Value>(&data) else {
                    continue;
                };
                let translated = on_event(&event);
                if let Some(u) = translated.usage {
                    if !recorded {
                        usage.record(Some(route), &upstream_name, Some(&u));
                        recorded = true;
                    }
                }
                if let Some(text) = translated.text {
                    if !text.is_empty() {
                        yield Ok(sse_frame(&chunk_json(&model, json!({"content": text}), None)));
                    }
                }
                if translated.end {
                    break 'read;
                }
            }
        }

        if !recorded {
            usage.record(Some(route), &upstream_name, None);
        }
        yield Ok(sse_frame(&chunk_json(&model, json!({}), Some("stop"))));
        yield Ok(sse_done());
    }
}

/// Relay an OpenAI-shaped SSE body byte-for-byte while a side decoder
/// scans for the first `usage` object.
pub fn relay_sse_stream(
    resp: reqwest::Response,
    usage: Arc<UsageTracker>,
    route: Route,
    upstream_name: String,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        use futures_util::StreamExt;
        let mut byte_stream = resp.bytes_stream();
        let mut events = SseEventBuffer::new();
        let mut recorded = false;

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if !recorded {
                        events.extend(&bytes);
                        while let Some(data) = events.next_event() {
                            if is_done_marker(&data) {
                                continue;
                            }
                            let Ok(event) = serde_json::from_str::<Value>(&data) else {
                                continue;
                            };
                            if let Some(u) = event.get("usage") {
                                if !u.is_null() {
                                    usage.record(Some(route), &upstream_name, Some(u));
                                    recorded = true;
                                    break;
                                }
                            }
                        }
                    }
                    yield Ok(bytes);
                }
                Err(e) => {
                    yield Err(std::io::Error::other(e.to_string()));
                    break;
                }
            }
        }

        if !recorded {
            usage.record(Some(route), &upstream_name, None);
        }
    }
}

/// Standard streaming response wrapper.
pub fn streaming_response(
    info: &RouteInfo,
    stream: impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + 'static,
) -> HttpResponse {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header(("content-type", "text/event-stream"))
        .insert_header(("cache-control", "no-cache"))
        .insert_header(("connection", "keep-alive"));
    info.decorate(&mut builder);
    builder.streaming(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn upstream(provider: Provider, base_url: &str, api_key: Option<&str>) -> Upstream {
        Upstream {
            name: "t".into(),
            provider,
            base_url: base_url.into(),
            api_key: api_key.map(String::from),
            model: None,
            deployment: None,
            api_version: None,
            headers: HashMap::new(),
            timeout_ms: 1000,
        }
    }

    #[test]
    fn literal_tags_pick_their_adapter() {
        let u = upstream(Provider::Anthropic, "https://example.com", None);
        assert_eq!(resolve_provider(&u), Some(ProviderKind::Anthropic));
        let u = upstream(Provider::Groq, "https://example.com", None);
        assert_eq!(resolve_provider(&u), Some(ProviderKind::OpenAiCompatible));
    }

    #[test]
    fn auto_infers_from_host() {
        let cases = [
            ("https://api.anthropic.com", ProviderKind::Anthropic),
            (
                "https://generativelanguage.googleapis.com/v1beta",
                ProviderKind::Gemini,
            ),
            ("https://api.cohere.ai/v2", ProviderKind::Cohere),
            ("https://api.cohere.com", ProviderKind::Cohere),
            ("https://my.openai.azure.com", ProviderKind::AzureOpenAi),
            ("https://api.groq.com/openai", ProviderKind::OpenAiCompatible),
            ("https://openrouter.ai/api", ProviderKind::OpenAiCompatible),
        ];
        for (url, expected) in cases {
            let u = upstream(Provider::Auto, url, None);
            assert_eq!(resolve_provider(&u), Some(expected), "{url}");
        }
    }

    #[test]
    fn auto_infers_from_key_prefix_then_defaults() {
        let u = upstream(Provider::Auto, "https://proxy.internal", Some("sk-ant-abc"));
        assert_eq!(resolve_provider(&u), Some(ProviderKind::Anthropic));
        let u = upstream(Provider::Auto, "https://proxy.internal", Some("AIzaXYZ"));
        assert_eq!(resolve_provider(&u), Some(ProviderKind::Gemini));
        let u = upstream(Provider::Auto, "https://proxy.internal", Some("COHERE-key"));
        assert_eq!(resolve_provider(&u), Some(ProviderKind::Cohere));
        let u = upstream(Provider::Auto, "https://proxy.internal", Some("sk-123"));
        assert_eq!(resolve_provider(&u), Some(ProviderKind::OpenAiCompatible));
    }

    #[test]
    fn unknown_explicit_tag_falls_back_to_openai_compatible() {
        let u = upstream(
            Provider::Other("vllm".into()),
            "http://localhost:8000",
            None,
        );
        assert_eq!(resolve_provider(&u), Some(ProviderKind::OpenAiCompatible));
        // Inference still wins over the fallback when it matches.
        let u = upstream(
            Provider::Other("bespoke".into()),
            "https://api.anthropic.com",
            None,
        );
        assert_eq!(resolve_provider(&u), Some(ProviderKind::Anthropic));
    }

    #[test]
    fn chunk_and_completion_shapes() {
        let chunk = chunk_json("m", json!({"content": "hi"}), None);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
        assert!(chunk["choices"][0]["finish_reason"].is_null());

        let stop = chunk_json("m", json!({}), Some("stop"));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");

        let full = chat_completion_json("m", "text", Some(&json!({"prompt_tokens": 1})));
        assert_eq!(full["object"], "chat.completion");
        assert_eq!(full["choices"][0]["message"]["content"], "text");
        assert_eq!(full["usage"]["prompt_tokens"], 1);
    }
}
