use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cache::DecisionCache;
use crate::classifier::Classifier;
use crate::config::RouterConfig;
use crate::usage::UsageTracker;

/// Initialize dotenv and structured tracing.
///
/// Environment:
/// - ENV_FILE / ENVFILE / DOTENV_PATH: explicit env file path, tried first
/// - LOG_LEVEL (fallback RUST_LOG): tracing filter, default "info"
/// - LOG_TO_FILE = 1|true|yes|on: write logs to a file instead of stderr
/// - LOG_DIR: directory for the log file (default "./logs")
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".into());

    if env_truthy("LOG_TO_FILE", false) {
        let dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".into());
        std::fs::create_dir_all(&dir).ok();
        let path = std::path::Path::new(&dir).join(format!("trigate-{}.log", std::process::id()));
        match std::fs::File::create(&path) {
            Ok(file) => {
                let subscriber = fmt()
                    .with_env_filter(EnvFilter::new(filter))
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
                tracing::info!("Logging to {}", path.display());
            }
            Err(e) => {
                let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
                tracing::warn!("Failed to open log file {}: {e}", path.display());
            }
        }
    } else {
        let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Read a boolean env var accepting 1|true|yes|on (case-insensitive).
pub fn env_truthy(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<f32>().ok())
        .unwrap_or(default)
}

/// Non-empty env var, trimmed.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Strip trailing slashes from a base URL.
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Compose `<baseUrl>/v1/chat/completions`, appending `/v1` only when the
/// base does not already end in it.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Shared application state used by the HTTP server and handlers.
///
/// Config and cache are created once at startup and shared read-only for
/// the lifetime of the process; usage buckets are the only process-wide
/// mutable state and are serialized inside `UsageTracker`.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub config: Arc<RouterConfig>,
    pub classifier: Option<Arc<Classifier>>,
    pub cache: Arc<dyn DecisionCache>,
    pub usage: Arc<UsageTracker>,
}

impl AppState {
    /// Wire the frozen config into runtime handles (HTTP client, cache
    /// backend, classifier client).
    pub async fn from_config(config: RouterConfig) -> Self {
        let http = build_http_client_from_env();
        let cache = crate::cache::make_cache(&config.cache).await;
        let classifier = if config.classifier.enabled {
            Some(Arc::new(Classifier::new(
                config.classifier.clone(),
                http.clone(),
            )))
        } else {
            None
        };
        Self {
            http,
            config: Arc::new(config),
            classifier,
            cache,
            usage: Arc::new(UsageTracker::new()),
        }
    }
}

/// Build the outbound HTTP client honoring proxy environment variables.
///
/// Per-request timeouts are applied at call sites (classifier and upstream
/// budgets differ), so no global timeout is set here.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if env_truthy("TRIGATE_NO_PROXY", false) {
        builder = builder.no_proxy();
    } else {
        if let Some(url) = env_string("HTTP_PROXY").or_else(|| env_string("http_proxy")) {
            if let Ok(p) = reqwest::Proxy::http(&url) {
                builder = builder.proxy(p);
            }
        }
        if let Some(url) = env_string("HTTPS_PROXY").or_else(|| env_string("https_proxy")) {
            if let Ok(p) = reqwest::Proxy::https(&url) {
                builder = builder.proxy(p);
            }
        }
    }

    builder = builder.user_agent(format!("trigate/{}", env!("CARGO_PKG_VERSION")));
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Build a JSON error body `{"error":"<kind>"}` with the given status.
pub fn error_response(status: StatusCode, kind: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "error": kind }))
}

/// Error body for upstream failures, carrying the raw upstream text.
pub fn upstream_error_response(status: StatusCode, details: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({
        "error": "upstream_error",
        "details": details,
    }))
}

/// Build a CORS configuration from environment variables.
///
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
///
/// Defaults are permissive.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let list: Vec<&str> = methods.split(',').map(|p| p.trim()).collect();
            cors = cors.allowed_methods(list);
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for part in headers.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_header(p);
                }
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    cors
}
