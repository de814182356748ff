//! Failure tests for the broker
//!
//! These tests verify that collector failures reach the callers as errors:
//! - error statuses with and without a body
//! - an unreachable collector
//! - missing and unmatched replies
//! - a closed broker

use std::time::Duration;

use assert_matches::assert_matches;
use netsampler::SamplingError;
use netsampler::broker::{ExchangeRequest, SamplingBroker};
use netsampler::error::{INTERNAL_CODE, TIMEOUT_CODE};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn request(channel: &str) -> ExchangeRequest {
    ExchangeRequest::new(channel, "GET", "sys").managed("network_device", "5")
}

async fn collector_with(template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(template)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_error_status_without_body() {
    let server = collector_with(ResponseTemplate::new(500)).await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let res = broker
        .create_client(request("aa"))
        .invoke(Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(res.error_code(), 500);
    assert_eq!(res.error_message(), "500: error");
    assert_eq!(broker.last_error().as_deref(), Some("500: error"));

    broker.close().await;
}

#[tokio::test]
async fn test_error_body_reaches_every_waiter_of_the_batch() {
    let server =
        collector_with(ResponseTemplate::new(406).set_body_string("'aaa' is not acceptable."))
            .await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let (tx, mut rx) = mpsc::channel(8);
    let sub = broker.subscribe_client(request("bb"), tx).await.unwrap();
    sub.send().await.unwrap();

    let client_a = broker.create_client(request("aa"));
    let client_c = broker.create_client(request("cc"));
    let (a, b) = tokio::join!(
        client_a.invoke(Duration::from_secs(2)),
        client_c.invoke(Duration::from_secs(2)),
    );

    for res in [a.unwrap(), b.unwrap()] {
        assert_eq!(res.error_code(), 406);
        assert_eq!(res.error_message(), "'aaa' is not acceptable.");
    }

    let got = recv_within(&mut rx, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.error_code(), 406);
    assert_eq!(got.channel_name, "bb");

    broker.close().await;
}

#[tokio::test]
async fn test_unreachable_collector() {
    let broker = SamplingBroker::spawn(create_test_broker_config("http://127.0.0.1:9/batch", 0))
        .unwrap();

    let res = broker
        .create_client(request("aa"))
        .invoke(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(res.error_code(), INTERNAL_CODE);
    assert!(res.error_message().starts_with("get failed, "));

    broker.close().await;
}

#[tokio::test]
async fn test_no_content_ends_in_timeout() {
    let server = collector_with(ResponseTemplate::new(204)).await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let res = broker
        .create_client(request("aa"))
        .invoke(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(res.error_code(), TIMEOUT_CODE);
    assert_eq!(broker.stats().await.unwrap().pending, 0);

    broker.close().await;
}

#[tokio::test]
async fn test_reply_with_unknown_id_is_dropped() {
    let server = collector_with(ResponseTemplate::new(202).set_body_json(json!([
        {"channel": "aa", "request_id": 999999, "created_at": "2024-01-01T00:00:00Z", "value": 1}
    ])))
    .await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let res = broker
        .create_client(request("zz"))
        .invoke(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(res.error_code(), TIMEOUT_CODE);

    broker.close().await;
}

#[tokio::test]
async fn test_malformed_reply() {
    let server = collector_with(ResponseTemplate::new(202).set_body_string("{invalid json")).await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let res = broker
        .create_client(request("aa"))
        .invoke(Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(res.error_code(), INTERNAL_CODE);

    broker.close().await;
}

#[tokio::test]
async fn test_closed_broker() {
    let server = collector_with(ResponseTemplate::new(204)).await;
    let broker = spawn_test_broker(&server.uri(), 0);
    let client = broker.create_client(request("aa"));
    let (tx, _rx) = mpsc::channel(8);
    let sub = tokio_test::assert_ok!(broker.subscribe_client(request("bb"), tx).await);

    broker.close().await;

    assert_matches!(client.invoke(Duration::from_secs(1)).await, Err(SamplingError::Closed));
    assert_matches!(sub.send().await, Err(SamplingError::Closed));
    tokio_test::assert_err!(broker.stats().await);

    let (tx, _rx) = mpsc::channel(8);
    assert_matches!(
        broker.subscribe_client(request("cc"), tx).await,
        Err(SamplingError::Closed)
    );
}

#[tokio::test]
async fn test_shutdown_fails_outstanding_requests() {
    let server = collector_with(ResponseTemplate::new(204)).await;
    let mut config = create_test_broker_config(&format!("{}/batch", server.uri()), 0);
    config.request_timeout_secs = 60;
    let broker = SamplingBroker::spawn(config).unwrap();

    let client = broker.create_client(request("aa"));
    let waiter = tokio::spawn(async move { client.invoke(Duration::from_secs(5)).await });

    // wait until the request is out
    for _ in 0..50 {
        if broker.stats().await.unwrap().pending == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    broker.close().await;

    let res = waiter.await.unwrap().unwrap();
    assert_eq!(res.error_code(), 503);
}
