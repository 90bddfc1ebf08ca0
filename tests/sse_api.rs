//! Integration tests for the server-sent events endpoint.

mod common;

use std::time::Duration;

use axum::{body::Body, http::StatusCode, http::Response};
use http_body_util::BodyExt;
use pollcast::broker::BrokerConfig;

/// Read body frames until the accumulated text contains `needle`.
async fn read_until(body: &mut Body, collected: &mut String, needle: &str) {
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !collected.contains(needle) {
            let frame = body
                .frame()
                .await
                .expect("stream ended early")
                .expect("body error");
            if let Ok(data) = frame.into_data() {
                collected.push_str(&String::from_utf8_lossy(&data));
            }
        }
    })
    .await;
    assert!(result.is_ok(), "did not see {needle:?}, got {collected:?}");
}

fn open_body(response: Response<Body>) -> Body {
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    response.into_body()
}

#[tokio::test]
async fn test_subscribe_streams_published_messages_in_order() {
    let (app, broker) = common::create_test_app(BrokerConfig::default());

    let mut body = open_body(common::get(&app, "/subscribe").await);
    assert_eq!(broker.stats().subscribers, 1);

    broker.publish("first");
    broker.publish("second");

    let mut collected = String::new();
    read_until(&mut body, &mut collected, "data: second").await;

    let first = collected.find("data: first").expect("first event");
    let second = collected.find("data: second").expect("second event");
    assert!(first < second);
    assert!(collected.contains("event: message"));
    assert!(collected.contains("id: 1"));
    assert!(collected.contains("id: 2"));
}

#[tokio::test]
async fn test_two_subscribers_both_receive() {
    let (app, broker) = common::create_test_app(BrokerConfig::default());

    let mut a = open_body(common::get(&app, "/subscribe").await);
    let mut b = open_body(common::get(&app, "/subscribe").await);

    common::post(&app, "/send-message", "x").await;

    let (mut seen_a, mut seen_b) = (String::new(), String::new());
    read_until(&mut a, &mut seen_a, "data: x").await;
    read_until(&mut b, &mut seen_b, "data: x").await;
    assert_eq!(broker.stats().subscribers, 2);
}

#[tokio::test]
async fn test_multiline_payload_split_into_data_lines() {
    let (app, broker) = common::create_test_app(BrokerConfig::default());

    let mut body = open_body(common::get(&app, "/subscribe").await);
    broker.publish("line one\r\nline two");

    let mut collected = String::new();
    read_until(&mut body, &mut collected, "data: line two").await;
    assert!(collected.contains("data: line one\n"));
}

#[tokio::test]
async fn test_disconnected_subscriber_is_removed() {
    let (app, broker) = common::create_test_app(BrokerConfig::default());

    let body = open_body(common::get(&app, "/subscribe").await);
    drop(body);

    // Detected on the next delivery attempt
    broker.publish("anyone there?");
    common::wait_until(|| broker.stats().subscribers == 0).await;
}

#[tokio::test]
async fn test_disconnect_frees_capacity_without_publish() {
    let (app, broker) = common::create_test_app(BrokerConfig {
        max_subscribers: Some(1),
        ..BrokerConfig::default()
    });

    let body = open_body(common::get(&app, "/subscribe").await);
    drop(body);

    common::wait_until(|| broker.stats().subscribers == 0).await;
    let _again = open_body(common::get(&app, "/subscribe").await);
    assert_eq!(broker.stats().subscribers, 1);
    assert_eq!(broker.stats().latest_seq, None);
}

#[tokio::test]
async fn test_subscribe_rejected_over_capacity() {
    let (app, _) = common::create_test_app(BrokerConfig {
        max_subscribers: Some(1),
        ..BrokerConfig::default()
    });

    let _held = open_body(common::get(&app, "/subscribe").await);

    let response = common::get(&app, "/subscribe").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_resubscribe_replaces_in_single_subscriber_mode() {
    let (app, broker) = common::create_test_app(BrokerConfig {
        single_subscriber: true,
        ..BrokerConfig::default()
    });

    let mut old = open_body(common::get(&app, "/subscribe").await);
    let mut new = open_body(common::get(&app, "/subscribe").await);
    assert_eq!(broker.stats().subscribers, 1);

    broker.publish("latest only");

    let mut collected = String::new();
    read_until(&mut new, &mut collected, "data: latest only").await;

    // The replaced stream ends without the message
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        let mut seen = String::new();
        while let Some(frame) = old.frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
        seen
    })
    .await
    .expect("replaced stream should end");
    assert!(!ended.contains("latest only"));
}

#[tokio::test]
async fn test_shutdown_ends_stream() {
    let (app, broker) = common::create_test_app(BrokerConfig::default());
    let mut body = open_body(common::get(&app, "/subscribe").await);

    broker.shutdown();

    let next = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("stream should end after shutdown");
    assert!(next.is_none());

    let response = common::get(&app, "/subscribe").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
