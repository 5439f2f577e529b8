//! Integration tests against the HTTP surface (spec.md §6), driven through
//! `axum`'s `Router` directly via `tower::ServiceExt::oneshot` rather than a
//! bound socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use stinger::api::{router, AppState};
use stinger::audit::AuditTrail;
use stinger::guardrails::registry::{default_registry, RegistryContext};
use stinger::rate_limiter::{RateLimiter, RoleOverride, WindowLimits};

fn test_state(default_preset: &str, rate_limiter: Arc<RateLimiter>) -> Arc<AppState> {
    Arc::new(AppState::new(
        default_registry(),
        rate_limiter,
        Arc::new(AuditTrail::new()),
        default_preset,
        RegistryContext::default(),
        false,
    ))
}

async fn post_json(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, parsed)
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, parsed)
}

/// S1 — PII in the prompt is blocked under `customer_service`.
#[tokio::test]
async fn check_blocks_pii_in_prompt() {
    let state = test_state("customer_service", Arc::new(RateLimiter::new(WindowLimits::new())));
    let app = router(state);

    let (status, body) = post_json(
        app,
        "/v1/check",
        json!({ "text": "My SSN is 123-45-6789", "kind": "prompt" }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "block");
    assert!(body["reasons"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r.as_str().unwrap().to_lowercase().contains("pii")));
}

/// Clean content under the `basic` preset is allowed with empty reasons.
#[tokio::test]
async fn check_allows_clean_content() {
    let state = test_state("basic", Arc::new(RateLimiter::new(WindowLimits::new())));
    let app = router(state);

    let (status, body) = post_json(app, "/v1/check", json!({ "text": "What's the weather today?", "kind": "prompt" })).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "allow");
    assert!(body["reasons"].as_array().unwrap().is_empty());
}

/// An unknown preset is a named 404, not a silent fallback (spec.md §4.7).
#[tokio::test]
async fn check_rejects_unknown_preset() {
    let state = test_state("basic", Arc::new(RateLimiter::new(WindowLimits::new())));
    let app = router(state);

    let (status, body) = post_json(
        app,
        "/v1/check",
        json!({ "text": "hello", "kind": "prompt", "preset": "does_not_exist" }),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found_error");
}

/// S3 — a role override's tighter limit produces a 429 with rate-limit
/// headers once exhausted.
#[tokio::test]
async fn check_rate_limits_by_role_and_returns_headers() {
    let limiter = Arc::new(
        RateLimiter::new(WindowLimits::new().with(std::time::Duration::from_secs(60), 1000)).with_overrides(vec![RoleOverride {
            role_token: "premium".to_string(),
            exempt: false,
            limits: Some(WindowLimits::new().with(std::time::Duration::from_secs(60), 1)),
        }]),
    );
    let state = test_state("basic", limiter);
    let app = router(state);

    let body = json!({
        "text": "hello there",
        "kind": "prompt",
        "context": { "userId": "user-1", "role": "premium" }
    });

    let (first_status, _) = post_json(app.clone(), "/v1/check", body.clone()).await;
    assert_eq!(first_status, StatusCode::OK);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/check")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("x-ratelimit-limit"));
    assert!(response.headers().contains_key("retry-after"));
}

/// `GET /v1/rules` returns the named preset's spec plus a stable version.
#[tokio::test]
async fn rules_returns_preset_spec_with_version() {
    let state = test_state("medical", Arc::new(RateLimiter::new(WindowLimits::new())));
    let app = router(state);

    let (status, body) = get(app, "/v1/rules?preset=medical").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["input"].is_array());
    assert!(body["output"].is_array());
    assert!(body["version"].as_str().unwrap().starts_with("sha256:"));
}

/// `GET /health` reports pipeline availability and guardrail count.
#[tokio::test]
async fn health_reports_pipeline_available() {
    let state = test_state("basic", Arc::new(RateLimiter::new(WindowLimits::new())));
    let app = router(state);

    let (status, body) = get(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pipeline_available"], true);
    assert!(body["guardrail_count"].as_u64().unwrap() > 0);
}
