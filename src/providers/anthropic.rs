//! Anthropic messages adapter.
//!
//! Translates the OpenAI chat-completion shape to `/v1/messages` and
//! back. System messages are concatenated into the top-level `system`
//! field, `stop` becomes `stop_sequences` (always an array), and
//! `max_tokens` is mandatory on the wire.

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

fn messages_url(base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    if base.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

/// Build the Anthropic request body from the inbound payload.
fn build_body(payload: &Value, model: &str, default_max_tokens: u64, stream: bool) -> Value {
    let empty = Vec::new();
    let messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .unwrap_or(&empty);

    let mut system_parts: Vec<String> = Vec::new();
    let mut out_messages: Vec<Value> = Vec::new();
    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let text = coerce_content(msg.get("content").unwrap_or(&Value::Null));
        if role == "system" {
            system_parts.push(text);
        } else {
            let mapped = if role == "assistant" { "assistant" } else { "user" };
            out_messages.push(json!({"role": mapped, "content": text}));
        }
    }

    let max_tokens = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(default_max_tokens);

    let mut body = json!({
        "model": model,
        "messages": out_messages,
        "max_tokens": max_tokens,
        "stream": stream,
    });
    if !system_parts.is_empty() {
        body["system"] = Value::String(system_parts.join("\n"));
    }
    if let Some(t) = payload.get("temperature") {
        if !t.is_null() {
            body["temperature"] = t.clone();
        }
    }
    if let Some(p) = payload.get("top_p") {
        if !p.is_null() {
            body["top_p"] = p.clone();
        }
    }
    match payload.get("stop") {
        Some(Value::String(s)) => body["stop_sequences"] = json!([s]),
        Some(Value::Array(a)) => body["stop_sequences"] = Value::Array(a.clone()),
        _ => {}
    }
    body
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
    let body = build_body(
        &payload,
        &model,
        state.config.adapter_defaults.anthropic_max_tokens,
        stream,
    );

    let mut rb = state
        .http
        .post(messages_url(&upstream.base_url))
        .header("content-type", "application/json")
        .header(
            "anthropic-version",
            state.config.adapter_defaults.anthropic_version.as_str(),
        )
        .json(&body);
    if let Some(key) = &upstream.api_key {
        rb = rb.header("x-api-key", key.as_str());
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
        .get("content")
        .and_then(|c| c.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let usage = parsed.get("usage").filter(|u| !u.is_null()).cloned();
    state
        .usage
        .record(Some(info.route), &info.upstream_name, usage.as_ref());

    let mut builder = HttpResponse::Ok();
    info.decorate(&mut builder);
    builder.json(chat_completion_json(&model, &content, usage.as_ref()))
}

/// Decode one Anthropic SSE event.
fn translate_event(event: &Value) -> Translated {
    match event.get("type").and_then(|t| t.as_str()) {
        Some("message_start") => Translated {
            usage: event
                .pointer("/message/usage")
                .filter(|u| !u.is_null())
                .cloned(),
            ..Translated::default()
        },
        Some("content_block_delta") => Translated {
            text: event
                .pointer("/delta/text")
                .and_then(|t| t.as_str())
                .map(String::from),
            ..Translated::default()
        },
        Some("message_stop") => Translated {
            end: true,
            ..Translated::default()
        },
        _ => Translated::default(),
    }
}
