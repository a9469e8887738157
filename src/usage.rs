//! Process-wide token-usage accounting.
//!
//! One bucket per route plus an `unknown` bucket. All mutation goes
//! through [`UsageTracker::record`]; snapshots copy under the lock so
//! readers never observe a torn update.

use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Routing tier selected by a decision digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Cheap,
    Medium,
    Frontier,
}

impl Route {
    pub fn from_decision(decision: u8) -> Self {
        match decision {
            0 => Route::Cheap,
            1 => Route::Medium,
            _ => Route::Frontier,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Cheap => "cheap",
            Route::Medium => "medium",
            Route::Frontier => "frontier",
        }
    }
}

/// Usage normalized out of a vendor-specific schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Recognize one of the three vendor usage schemas.
///
/// | fields | vendor |
/// |---|---|
/// | prompt_tokens / completion_tokens / total_tokens | OpenAI |
/// | input_tokens / output_tokens / total_tokens | Anthropic |
/// | promptTokenCount / candidatesTokenCount / totalTokenCount | Gemini |
///
/// Missing fields default to zero; a missing total is computed.
pub fn normalize_usage(usage: &Value) -> Option<NormalizedUsage> {
    let obj = usage.as_object()?;

    let field = |k: &str| obj.get(k).and_then(|v| v.as_u64());

    let (prompt, completion, total) =
        if obj.contains_key("prompt_tokens") || obj.contains_key("completion_tokens") {
            (
                field("prompt_tokens"),
                field("completion_tokens"),
                field("total_tokens"),
            )
        } else if obj.contains_key("input_tokens") || obj.contains_key("output_tokens") {
            (
                field("input_tokens"),
                field("output_tokens"),
                field("total_tokens"),
            )
        } else if obj.contains_key("promptTokenCount")
            || obj.contains_key("candidatesTokenCount")
            || obj.contains_key("totalTokenCount")
        {
            (
                field("promptTokenCount"),
                field("candidatesTokenCount"),
                field("totalTokenCount"),
            )
        } else {
            return None;
        };

    let prompt = prompt.unwrap_or(0);
    let completion = completion.unwrap_or(0);
    Some(NormalizedUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total.unwrap_or(prompt + completion),
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageBucket {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
    pub with_usage: u64,
}

impl UsageBucket {
    fn add(&mut self, usage: &NormalizedUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.with_usage += 1;
    }
}

#[derive(Debug, Default)]
struct Buckets {
    cheap: UsageBucket,
    medium: UsageBucket,
    frontier: UsageBucket,
    unknown: UsageBucket,
    last_updated: Option<u64>,
}

/// Deep copy of the buckets plus derived percentages.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub cheap: UsageBucket,
    pub medium: UsageBucket,
    pub frontier: UsageBucket,
    pub unknown: UsageBucket,
    /// Share of tracked requests per route (cheap + medium + frontier
    /// only), in percent.
    pub percentages: UsagePercentages,
    pub total_requests: u64,
    pub last_updated: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsagePercentages {
    pub cheap: f64,
    pub medium: f64,
    pub frontier: f64,
}

#[derive(Default)]
pub struct UsageTracker {
    inner: Mutex<Buckets>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request against a route's bucket, normalizing the
    /// upstream usage object when one of the known schemas is recognized.
    /// Unrecognized or missing usage only bumps the request counter.
    pub fn record(&self, route: Option<Route>, upstream: &str, usage: Option<&Value>) {
        let normalized = usage.and_then(normalize_usage);
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let bucket = match route {
            Some(Route::Cheap) => &mut guard.cheap,
            Some(Route::Medium) => &mut guard.medium,
            Some(Route::Frontier) => &mut guard.frontier,
            None => &mut guard.unknown,
        };
        bucket.requests += 1;
        if let Some(n) = normalized {
            bucket.add(&n);
            guard.last_updated = Some(now_epoch());
            debug!(
                upstream,
                prompt = n.prompt_tokens,
                completion = n.completion_tokens,
                "usage recorded"
            );
        } else {
            debug!(upstream, "request recorded without usage");
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let tracked =
            guard.cheap.requests + guard.medium.requests + guard.frontier.requests;
        let pct = |requests: u64| {
            if tracked == 0 {
                0.0
            } else {
                requests as f64 * 100.0 / tracked as f64
            }
        };
        UsageSnapshot {
            cheap: guard.cheap,
            medium: guard.medium,
            frontier: guard.frontier,
            unknown: guard.unknown,
            percentages: UsagePercentages {
                cheap: pct(guard.cheap.requests),
                medium: pct(guard.medium.requests),
                frontier: pct(guard.frontier.requests),
            },
            total_requests: tracked + guard.unknown.requests,
            last_updated: guard.last_updated,
        }
    }

    /// Explicit admin reset; buckets are never cleared otherwise.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Buckets::default();
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
