#![forbid(unsafe_code)]
#![doc = r#"
Trigate

OpenAI-compatible gateway that classifies every inbound chat-completion
request into a cheap/medium/frontier tier with a small classifier model,
then proxies it to the matching upstream, translating between vendor
dialects and the OpenAI wire shape in both buffered and streaming modes.

Crate highlights
- Classifier client with strict latency budgets: the streaming transport
  aborts as soon as one decision digit arrives.
- Decision cache keyed by a payload fingerprint, backed by an in-process
  LRU or Redis.
- Provider adapters for OpenAI-compatible, Anthropic, Gemini, Cohere and
  Azure OpenAI upstreams, all re-emitting OpenAI-shaped SSE.
- Per-tier token-usage accounting normalized across vendor schemas.

Modules
- `payload`: fingerprinting, content flattening, decision extraction.
- `classifier`: the remote classification call and its retry policy.
- `cache`: pluggable decision cache backends.
- `providers`: dialect adapters and dispatch.
- `config`: environment + upstreams.json merged into a frozen config.
- `server`: Actix router/handlers (the binary uses this).
- `usage`: process-wide usage buckets.
- `util`: shared helpers (tracing, env, HTTP client, errors).
"#]

pub mod cache;
pub mod classifier;
pub mod config;
pub mod payload;
pub mod providers;
pub mod server;
pub mod sse;
pub mod usage;
pub mod util;

pub use crate::cache::{make_cache, CacheSettings, DecisionCache, MemoryCache, NoopCache};
pub use crate::classifier::{
    spawn_warmup, Classifier, ClassifierConfig, ClassifyError, SelectionStrategy,
};
pub use crate::config::{Provider, RouterConfig, Upstream};
pub use crate::payload::{build_classifier_input, coerce_content, extract_decision, hash_payload};
pub use crate::usage::{normalize_usage, Route, UsageSnapshot, UsageTracker};
pub use crate::util::AppState;
