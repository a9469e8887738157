//! HTTP surface.
//!
//! One proxy handler (`POST /v1/chat/completions`) plus the read-only
//! health/usage/dashboard endpoints. Everything sits behind the bearer
//! gate when a router API key is configured.

use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde_json::json;
use tracing::warn;

use crate::payload::hash_payload;
use crate::providers;
use crate::usage::Route;
use crate::util::{error_response, normalize_base_url, AppState};

const DASHBOARD_HTML: &str = include_str!("../static/dashboard.html");

/// Verify the inbound bearer token against the configured router key.
/// With no key configured the gateway is open.
fn check_auth(state: &AppState, req: &HttpRequest) -> bool {
    let Some(expected) = state.config.router_api_key.as_deref() else {
        return true;
    };
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| {
            let s = s.trim();
            if s.len() >= 7 && s[..6].eq_ignore_ascii_case("bearer") {
                Some(s[6..].trim())
            } else {
                None
            }
        });
    presented == Some(expected)
}

/// Route-and-proxy handler.
///
/// auth → shape validation → fingerprint → cache lookup → classify →
/// cache store → adapter dispatch. Classifier failures of any kind
/// degrade to the frontier tier and are never surfaced to the client.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    if !check_auth(&state, &req) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let payload = body.into_inner();
    if !payload
        .get("messages")
        .map(|m| m.is_array())
        .unwrap_or(false)
    {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request");
    }

    let decision = match &state.classifier {
        None => 2,
        Some(classifier) => {
            let fingerprint = hash_payload(&payload);
            let cached = state
                .cache
                .get(&fingerprint)
                .await
                .and_then(|v| v.trim().parse::<u8>().ok())
                .filter(|d| *d <= 2);
            match cached {
                Some(d) => d,
                None => match classifier.classify(&payload).await {
                    Ok(d) => {
                        state.cache.set(&fingerprint, &d.to_string()).await;
                        d
                    }
                    Err(e) => {
                        warn!("classifier failed, falling back to frontier: {e}");
                        2
                    }
                },
            }
        }
    };

    let route = Route::from_decision(decision);
    providers::dispatch(&state, decision, route, payload).await
}

/// Liveness plus a config echo.
async fn health(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if !check_auth(&state, &req) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let tier = |upstream: Option<&crate::config::Upstream>| match upstream {
        Some(u) => json!({"name": u.name, "baseUrl": u.base_url}),
        None => serde_json::Value::Null,
    };

    HttpResponse::Ok().json(json!({
        "name": "trigate",
        "version": env!("CARGO_PKG_VERSION"),
        "classifier": {
            "enabled": state.config.classifier.enabled,
            "baseUrl": normalize_base_url(&state.config.classifier.base_url),
        },
        "upstreams": {
            "cheap": tier(state.config.cheap.as_ref()),
            "medium": tier(state.config.medium.as_ref()),
            "frontier": tier(Some(&state.config.frontier)),
        },
    }))
}

async fn usage(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if !check_auth(&state, &req) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    HttpResponse::Ok().json(state.usage.snapshot())
}

async fn dashboard(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if !check_auth(&state, &req) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    HttpResponse::Ok()
        .insert_header(("content-type", "text/html; charset=utf-8"))
        .body(DASHBOARD_HTML)
}

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/health", web::get().to(health))
            .route("/usage", web::get().to(usage))
            .route("/dashboard", web::get().to(dashboard)),
    );
}
