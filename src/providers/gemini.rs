//! Gemini generateContent adapter.
//!
//! Assistant turns become role `model`, every other role becomes `user`;
//! system messages are joined into `systemInstruction`. Generation
//! parameters move under `generationConfig` with Gemini's casing.

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

/// `<base>/models/<model>:<verb>` with `alt=sse` when streaming and the
/// key appended unless the URL already carries one.
fn generate_url(base_url: &str, model: &str, api_key: Option<&str>, stream: bool) -> String {
    let base = normalize_base_url(base_url);
    let (path, existing_query) = match base.split_once('?') {
        Some((p, q)) => (p.trim_end_matches('/').to_string(), Some(q.to_string())),
        None => (base, None),
    };
    let verb = if stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };

    let mut params: Vec<String> = existing_query
        .map(|q| {
            q.split('&')
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if stream {
        params.push("alt=sse".into());
    }
    if let Some(key) = api_key {
        if !params.iter().any(|p| p.starts_with("key=")) {
            params.push(format!("key={key}"));
        }
    }

    let mut url = format!("{path}/models/{model}:{verb}");
    if !params.is_empty() {
        url.push('?');
        url.push_str(&params.join("&"));
    }
    url
}

fn build_body(payload: &Value) -> Value {
    let empty = Vec::new();
    let messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .unwrap_or(&empty);

    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let text = coerce_content(msg.get("content").unwrap_or(&Value::Null));
        if role == "system" {
            system_parts.push(text);
            continue;
        }
        let mapped = if role == "assistant" { "model" } else { "user" };
        contents.push(json!({"role": mapped, "parts": [{"text": text}]}));
    }

    let mut body = json!({ "contents": contents });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system_parts.join("\n")}]});
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = payload.get("temperature").filter(|v| !v.is_null()) {
        generation.insert("temperature".into(), t.clone());
    }
    if let Some(p) = payload.get("top_p").filter(|v| !v.is_null()) {
        generation.insert("topP".into(), p.clone());
    }
    if let Some(m) = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .filter(|v| !v.is_null())
    {
        generation.insert("maxOutputTokens".into(), m.clone());
    }
    match payload.get("stop") {
        Some(Value::String(s)) => {
            generation.insert("stopSequences".into(), json!([s]));
        }
        Some(Value::Array(a)) => {
            generation.insert("stopSequences".into(), Value::Array(a.clone()));
        }
        _ => {}
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

fn candidate_text(value: &Value) -> String {
    value
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
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
    let body = build_body(&payload);
    let url = generate_url(&upstream.base_url, &model, upstream.api_key.as_deref(), stream);

    let mut rb = state
        .http
        .post(&url)
        .header("content-type", "application/json")
        .json(&body);
    if let Some(key) = &upstream.api_key {
        rb = rb.header("x-goog-api-key", key.as_str());
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
            |event| Translated {
                text: Some(candidate_text(event)),
                usage: event
                    .get("usageMetadata")
                    .filter(|u| !u.is_null())
                    .cloned(),
                end: false,
            },
        );
        return streaming_response(info, translated);
    }

    let parsed: Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => return transport_error(info, &e),
    };
    let content = candidate_text(&parsed);
    let usage = parsed.get("usageMetadata").filter(|u| !u.is_null()).cloned();
    state
        .usage
        .record(Some(info.route), &info.upstream_name, usage.as_ref());

    let mut builder = HttpResponse::Ok();
    info.decorate(&mut builder);
    builder.json(chat_completion_json(&model, &content, usage.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_verb_sse_and_key() {
        let url = generate_url(
            "https://generativelanguage.googleapis.com/v1beta/",
            "gemini-1.5-flash",
            Some("AIzaKEY"),
            true,
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:streamGenerateContent?alt=sse&key=AIzaKEY"
        );

        let url = generate_url(
            "https://host/v1beta?key=AIzaOther",
            "gemini-1.5-pro",
            Some("AIzaKEY"),
            false,
        );
        assert_eq!(
            url,
            "https://host/v1beta/models/gemini-1.5-pro:generateContent?key=AIzaOther"
        );
    }

    #[test]
    fn body_maps_roles_and_generation_config() {
        let payload = json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
                {"role": "tool", "content": "data"},
            ],
            "temperature": 0.2,
            "top_p": 0.8,
            "max_tokens": 64,
            "stop": ["DONE"],
        });
        let body = build_body(&payload);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "be brief"
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(body["generationConfig"]["topP"], 0.8);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(body["generationConfig"]["stopSequences"], json!(["DONE"]));
    }

    #[test]
    fn candidate_text_joins_parts() {
        let v = json!({"candidates": [{"content": {"parts": [
            {"text": "Hel"}, {"text": "lo"}
        ]}}]});
        assert_eq!(candidate_text(&v), "Hello");
        assert_eq!(candidate_text(&json!({})), "");
    }
}
