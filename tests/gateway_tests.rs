use actix_web::{test, web, App};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use trigate::cache::CacheSettings;
use trigate::classifier::{ClassifierConfig, SelectionStrategy};
use trigate::config::{AdapterDefaults, Provider, RouterConfig, Upstream};
use trigate::server::config_routes;
use trigate::util::AppState;

/// What the mock serves for one endpoint.
#[derive(Clone)]
enum MockReply {
    Json(Value),
    Sse(String),
    Status(u16, String),
}

#[derive(Clone)]
struct MockState {
    requests: Arc<AsyncMutex<Vec<Value>>>,
    calls: Arc<AtomicUsize>,
    reply: Arc<AsyncMutex<MockReply>>,
}

async fn handle(State(state): State<MockState>, Json(payload): Json<Value>) -> impl IntoResponse {
    state.requests.lock().await.push(payload);
    state.calls.fetch_add(1, Ordering::SeqCst);
    match state.reply.lock().await.clone() {
        MockReply::Json(v) => Json(v).into_response(),
        MockReply::Sse(body) => (
            [(CONTENT_TYPE, "text/event-stream")],
            body,
        )
            .into_response(),
        MockReply::Status(code, body) => (
            axum::http::StatusCode::from_u16(code).expect("status"),
            body,
        )
            .into_response(),
    }
}

struct MockUpstream {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<Value>>>,
    calls: Arc<AtomicUsize>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    /// Serve `reply` on every listed path.
    async fn start(paths: &[&str], reply: MockReply) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let state = MockState {
            requests: requests.clone(),
            calls: calls.clone(),
            reply: Arc::new(AsyncMutex::new(reply)),
        };

        let mut app = Router::new();
        for path in paths {
            app = app.route(path, post(handle));
        }
        let app = app.with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server error");
        });

        Self {
            base_url,
            requests,
            calls,
            join,
        }
    }

    async fn last_request(&self) -> Value {
        let guard = self.requests.lock().await;
        guard.last().cloned().unwrap_or_else(|| json!({}))
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn tier(name: &str, base_url: &str, model: &str, provider: Provider) -> Upstream {
    Upstream {
        name: name.into(),
        provider,
        base_url: base_url.into(),
        api_key: None,
        model: Some(model.into()),
        deployment: None,
        api_version: None,
        headers: HashMap::new(),
        timeout_ms: 5_000,
    }
}

fn classifier_config(base_url: &str) -> ClassifierConfig {
    ClassifierConfig {
        enabled: true,
        base_url: base_url.into(),
        api_key: None,
        model: "tiny-router".into(),
        system_prompt: "route".into(),
        strategy: SelectionStrategy::LastUser,
        max_chars: 8000,
        max_tokens: 1,
        temperature: 0.0,
        timeout_ms: 2_000,
        logit_bias: None,
        force_stream: true,
        warmup: false,
        warmup_delay_ms: 0,
        keep_alive_ms: 0,
        loading_retry_ms: 10,
        loading_max_retries: 1,
    }
}

fn router_config(
    classifier: Option<ClassifierConfig>,
    cheap: Option<Upstream>,
    medium: Option<Upstream>,
    frontier: Upstream,
) -> RouterConfig {
    RouterConfig {
        host: "127.0.0.1".into(),
        port: 0,
        body_limit: 1 << 20,
        router_api_key: None,
        decision_header: "x-openrouter-decision".into(),
        upstream_header: "x-openrouter-upstream".into(),
        classifier: classifier.unwrap_or_else(|| {
            let mut cfg = classifier_config("");
            cfg.enabled = false;
            cfg
        }),
        cache: CacheSettings {
            enabled: true,
            redis_url: None,
            ttl_ms: 60_000,
            max_entries: 128,
        },
        cheap,
        medium,
        frontier,
        adapter_defaults: AdapterDefaults {
            azure_api_version: "2024-10-21".into(),
            anthropic_version: "2023-06-01".into(),
            anthropic_max_tokens: 1024,
        },
    }
}

fn completion_reply(model: &str) -> MockReply {
    MockReply::Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    }))
}

fn classifier_sse(digit: &str) -> MockReply {
    MockReply::Sse(format!(
        "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{digit}\"}}}}]}}\n\ndata: [DONE]\n\n"
    ))
}

#[actix_web::test]
async fn classifier_digit_in_first_sse_event_routes_to_cheap() {
    let classifier = MockUpstream::start(&["/v1/chat/completions"], classifier_sse("0")).await;
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let config = router_config(
        Some(classifier_config(&classifier.base_url)),
        Some(tier("cheap", &upstream.base_url, "cheap-model", Provider::OpenAiCompatible)),
        Some(tier("medium", &upstream.base_url, "medium-model", Provider::OpenAiCompatible)),
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": [{"role": "user", "content": "2+2?"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("x-openrouter-decision").unwrap(),
        "0"
    );
    assert_eq!(
        resp.headers().get("x-openrouter-upstream").unwrap(),
        "cheap"
    );

    let forwarded = upstream.last_request().await;
    assert_eq!(forwarded["model"], "cheap-model");
    assert_eq!(classifier.call_count(), 1);
}

#[actix_web::test]
async fn cache_hit_skips_classifier_despite_sampling_changes() {
    let classifier = MockUpstream::start(&["/v1/chat/completions"], classifier_sse("1")).await;
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let config = router_config(
        Some(classifier_config(&classifier.base_url)),
        Some(tier("cheap", &upstream.base_url, "cheap-model", Provider::OpenAiCompatible)),
        Some(tier("medium", &upstream.base_url, "medium-model", Provider::OpenAiCompatible)),
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    for temperature in [0.1, 0.9] {
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(json!({
                "messages": [{"role": "user", "content": "summarize this"}],
                "temperature": temperature,
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("x-openrouter-upstream").unwrap(),
            "medium"
        );
    }

    assert_eq!(classifier.call_count(), 1);
    let forwarded = upstream.last_request().await;
    assert_eq!(forwarded["model"], "medium-model");
}

#[actix_web::test]
async fn disabled_classifier_always_routes_frontier() {
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let config = router_config(
        None,
        None,
        None,
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": [{"role": "user", "content": "anything"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert!(resp.status().is_success());
    assert_eq!(resp.headers().get("x-openrouter-decision").unwrap(), "2");
    assert_eq!(
        resp.headers().get("x-openrouter-upstream").unwrap(),
        "frontier"
    );
    let forwarded = upstream.last_request().await;
    assert_eq!(forwarded["model"], "frontier-model");
}

#[actix_web::test]
async fn classifier_failure_degrades_to_frontier() {
    let classifier = MockUpstream::start(
        &["/v1/chat/completions"],
        MockReply::Status(500, "boom".into()),
    )
    .await;
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let config = router_config(
        Some(classifier_config(&classifier.base_url)),
        Some(tier("cheap", &upstream.base_url, "cheap-model", Provider::OpenAiCompatible)),
        Some(tier("medium", &upstream.base_url, "medium-model", Provider::OpenAiCompatible)),
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": [{"role": "user", "content": "classify me"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert!(resp.status().is_success());
    assert_eq!(resp.headers().get("x-openrouter-decision").unwrap(), "2");
    let forwarded = upstream.last_request().await;
    assert_eq!(forwarded["model"], "frontier-model");
}

#[actix_web::test]
async fn model_loading_is_retried_before_frontier_fallback() {
    let classifier = MockUpstream::start(
        &["/v1/chat/completions"],
        MockReply::Status(503, "model loading, please wait".into()),
    )
    .await;
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let config = router_config(
        Some(classifier_config(&classifier.base_url)),
        Some(tier("cheap", &upstream.base_url, "cheap-model", Provider::OpenAiCompatible)),
        Some(tier("medium", &upstream.base_url, "medium-model", Provider::OpenAiCompatible)),
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": [{"role": "user", "content": "warm?"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert!(resp.status().is_success());
    assert_eq!(resp.headers().get("x-openrouter-decision").unwrap(), "2");
    // Initial attempt plus loading_max_retries more before giving up.
    assert_eq!(classifier.call_count(), 2);
}

#[actix_web::test]
async fn anthropic_stream_translates_to_openai_chunks() {
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let upstream =
        MockUpstream::start(&["/v1/messages"], MockReply::Sse(sse_body.into())).await;

    let config = router_config(
        None,
        None,
        None,
        tier("frontier", &upstream.base_url, "claude-3-5-haiku", Provider::Anthropic),
    );
    let state = AppState::from_config(config).await;
    let usage = state.usage.clone();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "messages": [{"role": "user", "content": "hello"}],
            "stream": true,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = test::read_body(resp).await;
    let text = String::from_utf8_lossy(&body);

    let frames: Vec<&str> = text
        .split("\n\n")
        .filter_map(|f| f.strip_prefix("data: "))
        .collect();

    let mut deltas = Vec::new();
    let mut stop_chunks = 0;
    let mut done_markers = 0;
    for frame in &frames {
        if *frame == "[DONE]" {
            done_markers += 1;
            continue;
        }
        let v: Value = serde_json::from_str(frame).expect("chunk json");
        assert_eq!(v["object"], "chat.completion.chunk");
        if v["choices"][0]["finish_reason"] == "stop" {
            stop_chunks += 1;
        } else if let Some(s) = v["choices"][0]["delta"]["content"].as_str() {
            deltas.push(s.to_string());
        }
    }

    assert_eq!(deltas, vec!["Hi", " there"]);
    assert_eq!(stop_chunks, 1);
    assert_eq!(done_markers, 1);

    // The [DONE] line must be the final frame.
    assert!(text.trim_end().ends_with("data: [DONE]"));

    let snap = usage.snapshot();
    assert_eq!(snap.frontier.prompt_tokens, 5);
    assert_eq!(snap.frontier.completion_tokens, 0);
    assert_eq!(snap.frontier.with_usage, 1);
}

#[actix_web::test]
async fn bearer_gate_and_shape_validation() {
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let mut config = router_config(
        None,
        None,
        None,
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    config.router_api_key = Some("sekrit".into());
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": [{"role": "user", "content": "hi"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "unauthorized");

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("authorization", "Bearer sekrit"))
        .set_json(json!({"model": "x"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "invalid_request");

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("authorization", "Bearer sekrit"))
        .set_json(json!({"messages": [{"role": "user", "content": "hi"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
async fn usage_endpoint_reports_tracked_routes() {
    let upstream = MockUpstream::start(&["/v1/chat/completions"], completion_reply("m")).await;

    let config = router_config(
        None,
        None,
        None,
        tier("frontier", &upstream.base_url, "frontier-model", Provider::OpenAiCompatible),
    );
    let state = AppState::from_config(config).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"messages": [{"role": "user", "content": "hi"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let _ = test::read_body(resp).await;

    let req = test::TestRequest::get().uri("/usage").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let snap: Value = test::read_body_json(resp).await;
    assert_eq!(snap["frontier"]["requests"], 1);
    assert_eq!(snap["frontier"]["prompt_tokens"], 3);
    assert_eq!(snap["percentages"]["frontier"], 100.0);
}
