//! Routing configuration.
//!
//! Environment variables and an optional `upstreams.json` overlay are
//! merged once at startup into a frozen [`RouterConfig`]; handlers treat
//! it as read-only shared state for the lifetime of the process.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;

use crate::cache::CacheSettings;
use crate::classifier::{ClassifierConfig, SelectionStrategy};
use crate::usage::Route;
use crate::util::{
    env_f32, env_string, env_truthy, env_u64, env_usize, normalize_base_url,
};

/// Provider tag attached to an upstream. `Auto` (or an empty tag) defers
/// to base-URL and API-key inference at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    OpenAiCompatible,
    OpenRouter,
    OpenAi,
    Mistral,
    Groq,
    Together,
    Perplexity,
    Anthropic,
    Gemini,
    Cohere,
    AzureOpenAi,
    Auto,
    Other(String),
}

impl Provider {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Provider::Auto,
            "openai_compatible" => Provider::OpenAiCompatible,
            "openrouter" => Provider::OpenRouter,
            "openai" => Provider::OpenAi,
            "mistral" => Provider::Mistral,
            "groq" => Provider::Groq,
            "together" => Provider::Together,
            "perplexity" => Provider::Perplexity,
            "anthropic" => Provider::Anthropic,
            "gemini" => Provider::Gemini,
            "cohere" => Provider::Cohere,
            "azure_openai" => Provider::AzureOpenAi,
            other => Provider::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Provider::OpenAiCompatible => "openai_compatible",
            Provider::OpenRouter => "openrouter",
            Provider::OpenAi => "openai",
            Provider::Mistral => "mistral",
            Provider::Groq => "groq",
            Provider::Together => "together",
            Provider::Perplexity => "perplexity",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Cohere => "cohere",
            Provider::AzureOpenAi => "azure_openai",
            Provider::Auto => "auto",
            Provider::Other(s) => s,
        }
    }
}

/// One configured chat-completion endpoint for a tier.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub provider: Provider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
}

/// Defaults consumed by the translating adapters.
#[derive(Debug, Clone)]
pub struct AdapterDefaults {
    pub azure_api_version: String,
    pub anthropic_version: String,
    pub anthropic_max_tokens: u64,
}

/// Frozen routing configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub body_limit: usize,
    pub router_api_key: Option<String>,
    pub decision_header: String,
    pub upstream_header: String,
    pub classifier: ClassifierConfig,
    pub cache: CacheSettings,
    pub cheap: Option<Upstream>,
    pub medium: Option<Upstream>,
    pub frontier: Upstream,
    pub adapter_defaults: AdapterDefaults,
}

impl RouterConfig {
    /// Load from the environment plus the optional upstreams overlay,
    /// enforce required fields, and apply the cheap/classifier
    /// co-location rule.
    pub fn from_env() -> Result<Self> {
        let overlay = load_upstreams_overlay()?;

        let classifier = classifier_from_env()?;

        let cheap = build_tier("CHEAP", "cheap", 30_000, overlay.get("cheap"))?;
        let medium = build_tier("MEDIUM", "medium", 45_000, overlay.get("medium"))?;
        let frontier = build_tier("FRONTIER", "frontier", 60_000, overlay.get("frontier"))?
            .context("frontier upstream must not be suppressed")?;

        if frontier.base_url.is_empty() {
            bail!("FRONTIER_BASE_URL is required");
        }

        if classifier.enabled {
            match (&cheap, &medium) {
                (Some(c), Some(m)) if !c.base_url.is_empty() && !m.base_url.is_empty() => {}
                _ => bail!(
                    "CHEAP_BASE_URL and MEDIUM_BASE_URL are required while the classifier is enabled"
                ),
            }
        }

        let mut cheap = cheap;
        if classifier.enabled {
            if let Some(c) = cheap.as_mut() {
                // A single local engine cannot serve two model weights;
                // sharing a base URL with the classifier pins cheap to
                // the classifier's model.
                if normalize_base_url(&c.base_url) == normalize_base_url(&classifier.base_url) {
                    c.model = Some(classifier.model.clone());
                }
            }
        }

        Ok(Self {
            host: env_string("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: env_u64("PORT", 8787) as u16,
            body_limit: env_usize("BODY_LIMIT", 2 * 1024 * 1024),
            router_api_key: env_string("ROUTER_API_KEY"),
            decision_header: env_string("DECISION_HEADER")
                .unwrap_or_else(|| "x-openrouter-decision".into()),
            upstream_header: env_string("UPSTREAM_HEADER")
                .unwrap_or_else(|| "x-openrouter-upstream".into()),
            classifier,
            cache: CacheSettings {
                enabled: env_truthy("CACHE_ENABLED", true),
                redis_url: env_string("REDIS_URL"),
                ttl_ms: env_u64("CACHE_TTL_MS", 3_600_000),
                max_entries: env_usize("CACHE_MAX", 50_000),
            },
            cheap,
            medium,
            frontier,
            adapter_defaults: AdapterDefaults {
                azure_api_version: env_string("AZURE_API_VERSION")
                    .unwrap_or_else(|| "2024-10-21".into()),
                anthropic_version: env_string("ANTHROPIC_VERSION")
                    .unwrap_or_else(|| "2023-06-01".into()),
                anthropic_max_tokens: env_u64("ANTHROPIC_MAX_TOKENS", 1024),
            },
        })
    }

    /// Upstream serving a route. Cheap/medium fall back to frontier,
    /// which is only reachable when the classifier is disabled and those
    /// tiers were suppressed.
    pub fn upstream_for(&self, route: Route) -> &Upstream {
        match route {
            Route::Cheap => self.cheap.as_ref().unwrap_or(&self.frontier),
            Route::Medium => self.medium.as_ref().unwrap_or(&self.frontier),
            Route::Frontier => &self.frontier,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You route chat requests. Reply with exactly one digit: 0 for simple lookups and small talk, 1 for ordinary tasks, 2 for hard reasoning, long or high-stakes work.";

fn classifier_from_env() -> Result<ClassifierConfig> {
    let base_url = env_string("CLASSIFIER_BASE_URL").unwrap_or_default();
    let enabled = env_truthy("CLASSIFIER_ENABLED", !base_url.is_empty());
    if enabled && base_url.is_empty() {
        bail!("CLASSIFIER_BASE_URL is required while the classifier is enabled");
    }

    let system_prompt =
        env_string("CLASSIFIER_SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into());
    if system_prompt.contains('\n') {
        bail!("CLASSIFIER_SYSTEM_PROMPT must be a single line");
    }

    let logit_bias = match env_string("CLASSIFIER_LOGIT_BIAS") {
        Some(raw) => Some(
            serde_json::from_str::<Value>(&raw).context("CLASSIFIER_LOGIT_BIAS is not valid JSON")?,
        ),
        None => None,
    };

    let strategy = match env_string("CLASSIFIER_STRATEGY").as_deref() {
        Some("full_messages") => SelectionStrategy::FullMessages,
        _ => SelectionStrategy::LastUser,
    };

    Ok(ClassifierConfig {
        enabled,
        base_url,
        api_key: env_string("CLASSIFIER_API_KEY"),
        model: env_string("CLASSIFIER_MODEL").unwrap_or_default(),
        system_prompt,
        strategy,
        max_chars: env_usize("CLASSIFIER_MAX_CHARS", 8000),
        max_tokens: env_u64("CLASSIFIER_MAX_TOKENS", 1),
        temperature: env_f32("CLASSIFIER_TEMPERATURE", 0.0),
        timeout_ms: env_u64("CLASSIFIER_TIMEOUT_MS", 800),
        logit_bias,
        force_stream: env_truthy("CLASSIFIER_FORCE_STREAM", true),
        warmup: env_truthy("CLASSIFIER_WARMUP", false),
        warmup_delay_ms: env_u64("CLASSIFIER_WARMUP_DELAY_MS", 2_000),
        keep_alive_ms: env_u64("CLASSIFIER_KEEP_ALIVE_MS", 0),
        loading_retry_ms: env_u64("CLASSIFIER_LOADING_RETRY_MS", 1_200),
        loading_max_retries: env_u64("CLASSIFIER_LOADING_MAX_RETRIES", 2) as u32,
    })
}

/// Read the upstreams overlay: UPSTREAMS_JSON inline takes precedence,
/// then UPSTREAMS_FILE, then `./upstreams.json` when present.
fn load_upstreams_overlay() -> Result<serde_json::Map<String, Value>> {
    let raw = if let Some(inline) = env_string("UPSTREAMS_JSON") {
        Some(inline)
    } else if let Some(path) = env_string("UPSTREAMS_FILE") {
        Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read upstreams file {path}"))?,
        )
    } else if std::path::Path::new("upstreams.json").is_file() {
        Some(std::fs::read_to_string("upstreams.json").context("failed to read upstreams.json")?)
    } else {
        None
    };

    match raw {
        Some(text) => {
            let value: Value =
                serde_json::from_str(&text).context("upstreams overlay is not valid JSON")?;
            match value {
                Value::Object(map) => Ok(map),
                _ => bail!("upstreams overlay must be a JSON object"),
            }
        }
        None => Ok(serde_json::Map::new()),
    }
}

/// Build one tier's upstream from `<TIER>_*` env vars with the file
/// overlay applied on top. `Ok(None)` means the overlay suppressed the
/// tier with an explicit null.
fn build_tier(
    prefix: &str,
    default_name: &str,
    default_timeout_ms: u64,
    overlay: Option<&Value>,
) -> Result<Option<Upstream>> {
    if matches!(overlay, Some(Value::Null)) {
        if prefix == "FRONTIER" {
            bail!("frontier tier cannot be suppressed");
        }
        return Ok(None);
    }

    let var = |suffix: &str| env_string(&format!("{prefix}_{suffix}"));

    let headers = match var("HEADERS") {
        Some(raw) => serde_json::from_str::<HashMap<String, String>>(&raw)
            .with_context(|| format!("{prefix}_HEADERS is not a JSON string map"))?,
        None => HashMap::new(),
    };

    let mut upstream = Upstream {
        name: var("NAME").unwrap_or_else(|| default_name.into()),
        provider: Provider::from_tag(var("PROVIDER").as_deref().unwrap_or("")),
        base_url: var("BASE_URL").map(|u| normalize_base_url(&u)).unwrap_or_default(),
        api_key: var("API_KEY"),
        model: var("MODEL"),
        deployment: var("DEPLOYMENT"),
        api_version: var("API_VERSION"),
        headers,
        timeout_ms: env_u64(&format!("{prefix}_TIMEOUT_MS"), default_timeout_ms),
    };

    if let Some(Value::Object(map)) = overlay {
        apply_overlay(&mut upstream, map)?;
    }

    Ok(Some(upstream))
}

fn apply_overlay(upstream: &mut Upstream, map: &serde_json::Map<String, Value>) -> Result<()> {
    let get_str = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| map.get(*k))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    if let Some(name) = get_str(&["name"]) {
        upstream.name = name;
    }
    if let Some(tag) = get_str(&["provider"]) {
        upstream.provider = Provider::from_tag(&tag);
    }
    if let Some(url) = get_str(&["base_url", "baseUrl"]) {
        upstream.base_url = normalize_base_url(&url);
    }
    if let Some(key) = get_str(&["api_key", "apiKey"]) {
        upstream.api_key = Some(key);
    }
    if let Some(model) = get_str(&["model"]) {
        upstream.model = Some(model);
    }
    if let Some(dep) = get_str(&["deployment"]) {
        upstream.deployment = Some(dep);
    }
    if let Some(ver) = get_str(&["api_version", "apiVersion"]) {
        upstream.api_version = Some(ver);
    }
    if let Some(Value::Object(hdrs)) = map.get("headers") {
        for (k, v) in hdrs {
            if let Some(s) = v.as_str() {
                upstream.headers.insert(k.clone(), s.to_string());
            }
        }
    }
    if let Some(t) = map
        .iter()
        .find(|(k, _)| k.as_str() == "timeout_ms" || k.as_str() == "timeoutMs")
        .and_then(|(_, v)| v.as_u64())
    {
        upstream.timeout_ms = t;
    }
    Ok(())
}
