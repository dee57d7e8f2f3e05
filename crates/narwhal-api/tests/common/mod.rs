//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use narwhal_broker::{MemoryBroker, StreamBroker, default_streams, ensure_streams};
use narwhal_core::clock::Clock;
use narwhal_test_support::FixedClock;
use tempfile::TempDir;
use tower::ServiceExt;

use narwhal_api::bootstrap::app;
use narwhal_api::config::NarwhalConfig;
use narwhal_api::state::{AppState, Persistence};

/// Fixed timestamp used across all integration tests.
fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(
        chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 1, 15, 10, 0, 0).unwrap(),
    ))
}

/// The full app over in-memory stores and broker.
pub struct TestApp {
    /// Router with every route and layer of the server.
    pub router: Router,
    /// The state behind the router.
    pub state: AppState,
    /// Storage root; removed when dropped.
    pub storage: TempDir,
}

/// Build the full app with the same routes and layers as `main.rs`.
pub async fn build_test_app() -> TestApp {
    build_test_app_with(&[]).await
}

/// Build the full app with extra configuration variables.
pub async fn build_test_app_with(vars: &[(&str, String)]) -> TestApp {
    let storage = tempfile::tempdir().unwrap();
    let root = storage.path().to_string_lossy().into_owned();
    let config = NarwhalConfig::from_lookup(|key| {
        if key == "STORAGE_ROOT" {
            return Some(root.clone());
        }
        vars.iter().find(|(name, _)| *name == key).map(|(_, value)| value.clone())
    })
    .unwrap();
    let broker: Arc<dyn StreamBroker> = Arc::new(MemoryBroker::new());
    ensure_streams(broker.as_ref(), default_streams()).await.unwrap();
    let state = AppState::new(&config, &Persistence::memory(), broker, fixed_clock());
    TestApp {
        router: app(state.clone()),
        state,
        storage,
    }
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, json)
}

fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(app: Router, uri: &str, body: &serde_json::Value) -> (StatusCode, serde_json::Value) {
    send(app, json_request("POST", uri, body)).await
}

/// Send a PUT request with a JSON body and return the response.
pub async fn put_json(app: Router, uri: &str, body: &serde_json::Value) -> (StatusCode, serde_json::Value) {
    send(app, json_request("PUT", uri, body)).await
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

/// Send a DELETE request and return the response.
pub async fn delete(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}
