#![allow(dead_code)]

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use pollcast::api::{router, AppState};
use pollcast::broker::{Broker, BrokerConfig};
use tower::ServiceExt;

/// Build an app around a fresh broker. Returns the broker too so tests can
/// publish and inspect state directly.
pub fn create_test_app(config: BrokerConfig) -> (Router, Broker) {
    let broker = Broker::new(config);
    (router(test_state(broker.clone())), broker)
}

/// App state with test-friendly timeouts; override fields as needed.
pub fn test_state(broker: Broker) -> AppState {
    AppState {
        long_poll_timeout: Duration::from_millis(500),
        ..AppState::new(broker)
    }
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post(app: &Router, uri: &str, body: &'static str) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

/// Poll `condition` until it holds or a second passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
