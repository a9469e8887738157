//! Routing-relevant views of an inbound chat-completion payload.
//!
//! The payload is handled as raw JSON at the proxy boundary; this module
//! provides the stable fingerprint used as the decision cache key, the
//! single definition of "message text" used by the classifier and the
//! translating adapters, and the digit scan that turns classifier output
//! into a routing decision.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::classifier::SelectionStrategy;

/// Hex SHA-256 over the deterministic JSON of the routing-relevant subset
/// of the payload: `(messages, tools, tool_choice, response_format)`.
///
/// Model name, stream flag and sampling parameters are deliberately
/// excluded: the decision depends only on task shape, so two otherwise
/// equal requests must collide.
pub fn hash_payload(payload: &Value) -> String {
    let subset = json!([
        payload.get("messages").cloned().unwrap_or(Value::Null),
        payload.get("tools").cloned().unwrap_or(Value::Null),
        payload.get("tool_choice").cloned().unwrap_or(Value::Null),
        payload.get("response_format").cloned().unwrap_or(Value::Null),
    ]);
    let serialized = serde_json::to_string(&subset).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Flatten message content to plain text.
///
/// Content may be a string or a heterogeneous part array. For each part,
/// "text" means, in order: the string itself, `part.text`,
/// `part.input_text`, a recursive coerce of `part.content`; otherwise the
/// part's JSON serialization. Null content is the empty string.
pub fn coerce_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                out.push_str(&coerce_part(part));
            }
            out
        }
        other => other.to_string(),
    }
}

fn coerce_part(part: &Value) -> String {
    if let Value::String(s) = part {
        return s.clone();
    }
    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
        return text.to_string();
    }
    if let Some(text) = part.get("input_text").and_then(|t| t.as_str()) {
        return text.to_string();
    }
    if let Some(inner) = part.get("content") {
        return coerce_content(inner);
    }
    part.to_string()
}

/// Scan for the first character in `[0-2]` and return it as an integer.
pub fn extract_decision(text: &str) -> Option<u8> {
    text.chars()
        .find(|c| matches!(c, '0' | '1' | '2'))
        .map(|c| c as u8 - b'0')
}

/// Build the classifier input from the payload.
///
/// `full_messages` serializes every message as `[{role, content}]` with
/// flattened content; `last_user` takes the text of the last user message,
/// falling back to the full serialization when there is none. The result
/// is truncated to `max_chars` with a trailing marker when cut.
pub fn build_classifier_input(
    payload: &Value,
    strategy: &SelectionStrategy,
    max_chars: usize,
) -> String {
    let messages = payload.get("messages").and_then(|m| m.as_array());

    let raw = match strategy {
        SelectionStrategy::FullMessages => serialize_messages(messages),
        SelectionStrategy::LastUser => {
            let last_user = messages.and_then(|msgs| {
                msgs.iter()
                    .rev()
                    .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
            });
            match last_user {
                Some(msg) => coerce_content(msg.get("content").unwrap_or(&Value::Null)),
                None => serialize_messages(messages),
            }
        }
    };

    truncate_with_marker(raw, max_chars)
}

fn serialize_messages(messages: Option<&Vec<Value>>) -> String {
    let projected: Vec<Value> = messages
        .map(|msgs| {
            msgs.iter()
                .map(|m| {
                    json!({
                        "role": m.get("role").and_then(|r| r.as_str()).unwrap_or(""),
                        "content": coerce_content(m.get("content").unwrap_or(&Value::Null)),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    serde_json::to_string(&projected).unwrap_or_default()
}

fn truncate_with_marker(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("\n[TRUNCATED]");
    cut
}
