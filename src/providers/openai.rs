//! OpenAI-compatible pass-through adapter.
//!
//! Serves the `openai_compatible` family of tags (openrouter, openai,
//! mistral, groq, together, perplexity). The inbound payload is forwarded
//! verbatim except for the upstream's model override; streamed bytes are
//! relayed untouched while a side decoder watches for the first usage
//! object.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::Value;

use super::{relay_sse_stream, send_upstream, streaming_response, transport_error, RouteInfo};
use crate::config::Upstream;
use crate::util::{chat_completions_url, AppState};

pub async fn forward(
    state: &AppState,
    upstream: &Upstream,
    info: &RouteInfo,
    mut payload: Value,
) -> HttpResponse {
    if let Some(model) = &upstream.model {
        payload["model"] = Value::String(model.clone());
    }
    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let url = chat_completions_url(&upstream.base_url);
    let mut rb = state
        .http
        .post(&url)
        .header("content-type", "application/json")
        .json(&payload);
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
        // Pass-through relays the upstream error body and status as-is.
        let bytes = resp.bytes().await.unwrap_or_default();
        let mut builder = HttpResponse::build(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        );
        info.decorate(&mut builder);
        return builder.body(bytes);
    }

    if stream {
        let translated = relay_sse_stream(
            resp,
            state.usage.clone(),
            info.route,
            info.upstream_name.clone(),
        );
        return streaming_response(info, translated);
    }

    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => return transport_error(info, &e),
    };
    let usage = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("usage").filter(|u| !u.is_null()).cloned());
    state
        .usage
        .record(Some(info.route), &info.upstream_name, usage.as_ref());

    let mut builder =
        HttpResponse::build(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    builder.insert_header(("content-type", "application/json"));
    info.decorate(&mut builder);
    builder.body(bytes)
}
