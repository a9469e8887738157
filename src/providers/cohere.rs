//! Cohere chat v2 adapter.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::{json, Value};

use super::{
    chat_completion_json, decorate_response, send_upstream, streaming_response,
    translate_sse_stream, transport_error, RouteInfo, Translated,
};
use crate::config::Upstream;
use crate::payload::coerce_content;
use crate::util::{normalize_base_url, upstream_error_response, AppState};

/// `<base>/v2/chat`, preserving URLs that already point at a chat path.
fn chat_url(base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    if base.ends_with("/v2/chat") || base.ends_with("/chat") {
        base
    } else {
        format!("{base}/v2/chat")
    }
}

fn build_body(payload: &Value, model: &str, stream: bool) -> Value {
    let empty = Vec::new();
    let messages: Vec<Value> = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .unwrap_or(&empty)
        .iter()
        .map(|msg| {
            let role = match msg.get("role").and_then(|r| r.as_str()).unwrap_or("user") {
                "system" => "system",
                "assistant" => "assistant",
                "tool" => "tool",
                _ => "user",
            };
            json!({
                "role": role,
                "content": coerce_content(msg.get("content").unwrap_or(&Value::Null)),
            })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    });
    if let Some(t) = payload.get("temperature").filter(|v| !v.is_null()) {
        body["temperature"] = t.clone();
    }
    if let Some(m) = payload.get("max_tokens").filter(|v| !v.is_null()) {
        body["max_tokens"] = m.clone();
    }
    body
}

/// Usage lives under `meta.tokens` (or nested `response.meta.tokens`);
/// the token fields follow the Anthropic-style input/output naming.
fn extract_usage(value: &Value) -> Option<Value> {
    value
        .pointer("/meta/tokens")
        .or_else(|| value.pointer("/response/meta/tokens"))
        .filter(|u| !u.is_null())
        .cloned()
}

fn translate_event(event: &Value) -> Translated {
    match event.get("type").and_then(|t| t.as_str()) {
        Some("content-delta") => Translated {
            text: event
                .pointer("/delta/message/content/text")
                .and_then(|t| t.as_str())
                .map(String::from),
            ..Translated::default()
        },
        Some("message-end") => Translated {
            usage: extract_usage(event)
                .or_else(|| event.pointer("/delta/usage/tokens").filter(|u| !u.is_null()).cloned()),
            end: true,
            ..Translated::default()
        },
        _ => Translated::default(),
    }
}

pub async fn forward(
    state: &AppState,
    upstream: &Upstream,
    info: &RouteInfo,
    payload: Value,
) -> HttpResponse {
    let model = upstream
        .model
        .clone()
        .or_else(|| {
            payload
                .get("model")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_default();
    if model.is_empty() {
        return super::invalid_upstream_response(info, "missing_model");
    }

    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let body = build_body(&payload, &model, stream);

    let mut rb = state
        .http
        .post(chat_url(&upstream.base_url))
        .header("content-type", "application/json")
        .json(&body);
    if let Some(key) = &upstream.api_key {
        rb = rb.bearer_auth(key);
    }
    if stream {
        rb = rb.header("accept", "text/event-stream");
    }

    let resp = match send_upstream(rb, upstream, info, stream).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let mut out = upstream_error_response(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            &text,
        );
        decorate_response(&mut out, info);
        return out;
    }

    if stream {
        let translated = translate_sse_stream(
            resp,
            model,
            state.usage.clone(),
            info.route,
            info.upstream_name.clone(),
            |event| translate_event(event),
        );
        return streaming_response(info, translated);
    }

    let parsed: Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => return transport_error(info, &e),
    };
    let content = parsed
        .pointer("/message/content")
        .and_then(|c| c.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let usage = extract_usage(&parsed);
    state
        .usage
        .record(Some(info.route), &info.upstream_name, usage.as_ref());

    let mut builder = HttpResponse::Ok();
    info.decorate(&mut builder);
    builder.json(chat_completion_json(&model, &content, usage.as_ref()))
}
