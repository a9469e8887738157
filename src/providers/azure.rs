//! Azure OpenAI adapter.
//!
//! The deployment name takes the place of the model: the outbound body is
//! the inbound payload with `model` stripped, and the URL addresses the
//! deployment directly. Responses are OpenAI-shaped already, so streaming
//! is a byte relay with the usual side usage scan.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::Value;

use super::{relay_sse_stream, send_upstream, streaming_response, transport_error, RouteInfo};
use crate::config::Upstream;
use crate::util::{normalize_base_url, AppState};

/// Compose the deployment URL, forcing the `api-version` query parameter.
///
/// A base URL that already addresses `/openai/deployments/` keeps its
/// path (with `/chat/completions` appended when missing); otherwise the
/// path is built from the configured deployment name.
fn deployment_url(base_url: &str, deployment: &str, api_version: &str) -> String {
    let base = normalize_base_url(base_url);
    let (path, query) = match base.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (base, None),
    };

    let mut path = if path.contains("/openai/deployments/") {
        if path.ends_with("/chat/completions") {
            path
        } else {
            format!("{path}/chat/completions")
        }
    } else {
        format!("{path}/openai/deployments/{deployment}/chat/completions")
    };

    let mut params: Vec<String> = query
        .map(|q| {
            q.split('&')
                .filter(|p| !p.is_empty() && !p.starts_with("api-version="))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    params.push(format!("api-version={api_version}"));

    path.push('?');
    path.push_str(&params.join("&"));
    path
}

pub async fn forward(
    state: &AppState,
    upstream: &Upstream,
    info: &RouteInfo,
    mut payload: Value,
) -> HttpResponse {
    let preset_path = upstream.base_url.contains("/openai/deployments/");
    let deployment = upstream.deployment.clone().unwrap_or_default();
    if deployment.is_empty() && !preset_path {
        return super::invalid_upstream_response(info, "missing_deployment");
    }

    let api_version = upstream
        .api_version
        .clone()
        .unwrap_or_else(|| state.config.adapter_defaults.azure_api_version.clone());
    let url = deployment_url(&upstream.base_url, &deployment, &api_version);

    // The deployment IS the model.
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("model");
    }
    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut rb = state
        .http
        .post(&url)
        .header("content-type", "application/json")
        .json(&payload);
    if let Some(key) = &upstream.api_key {
        if let Some(bearer) = key.strip_prefix("Bearer ") {
            rb = rb.bearer_auth(bearer);
        } else {
            rb = rb.header("api-key", key.as_str());
        }
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
        let bytes = resp.bytes().await.unwrap_or_default();
        let mut builder = HttpResponse::build(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        );
        info.decorate(&mut builder);
        return builder.body(bytes);
    }

    if stream {
        let relayed = relay_sse_stream(
            resp,
            state.usage.clone(),
            info.route,
            info.upstream_name.clone(),
        );
        return streaming_response(info, relayed);
    }

    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => return transport_error(info, &e),
    };
    let usage = if content_type.contains("json") {
        serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.get("usage").filter(|u| !u.is_null()).cloned())
    } else {
        None
    };
    state
        .usage
        .record(Some(info.route), &info.upstream_name, usage.as_ref());

    let mut builder =
        HttpResponse::build(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    builder.insert_header(("content-type", content_type));
    info.decorate(&mut builder);
    builder.body(bytes)
}
