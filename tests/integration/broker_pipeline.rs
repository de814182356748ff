//! End-to-end tests for the broker pipeline
//!
//! Client → SamplingBroker → HTTP collector (wiremock) → replies → waiters / subscribers

use std::time::Duration;

use netsampler::broker::{ExchangeRequest, make_channel_name};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use crate::helpers::*;

fn device_request(channel: &str, id: &str) -> ExchangeRequest {
    ExchangeRequest::new(channel, "GET", "sys").managed("network_device", id)
}

async fn collector() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/batch"))
        .respond_with(EchoCollector)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_one_send_reaches_every_subscriber_once() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let (tx1, mut rx1) = mpsc::channel(8);
    let (tx2, mut rx2) = mpsc::channel(8);
    let c1 = broker
        .subscribe_client(device_request("aa", "5"), tx1)
        .await
        .unwrap();
    let _c2 = broker
        .subscribe_client(device_request("aa", "5"), tx2)
        .await
        .unwrap();

    c1.send().await.unwrap();

    let r1 = recv_within(&mut rx1, Duration::from_secs(2)).await.unwrap();
    let r2 = recv_within(&mut rx2, Duration::from_secs(2)).await.unwrap();
    assert!(!r1.has_error());
    assert!(!r2.has_error());
    assert_eq!(r1.value, Some(json!({"metric": "sys", "target": "5"})));
    assert_eq!(r1.value, r2.value);
    assert_eq!(r1.id, r2.id);

    // exactly one each
    assert!(recv_within(&mut rx1, Duration::from_millis(200)).await.is_none());
    assert!(recv_within(&mut rx2, Duration::from_millis(200)).await.is_none());
    assert_eq!(received_batches(&server).await, 1);

    broker.close().await;
}

#[tokio::test]
async fn test_sends_within_window_are_coalesced() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 15);

    let (tx1, mut rx1) = mpsc::channel(8);
    let (tx2, mut rx2) = mpsc::channel(8);
    let c1 = broker
        .subscribe_client(device_request("cpu/5/", "5"), tx1)
        .await
        .unwrap();
    let _c2 = broker
        .subscribe_client(device_request("cpu/5/", "5"), tx2)
        .await
        .unwrap();

    c1.send().await.unwrap();
    c1.send().await.unwrap();

    // the subscriber that never called send still gets the reply
    assert!(recv_within(&mut rx2, Duration::from_secs(2)).await.is_some());
    assert!(recv_within(&mut rx1, Duration::from_secs(2)).await.is_some());

    // a trigger right after the reply is still inside the window
    c1.send().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(received_batches(&server).await, 1);
    assert!(recv_within(&mut rx1, Duration::from_millis(100)).await.is_none());

    broker.close().await;
}

#[tokio::test]
async fn test_closed_group_is_recreated_by_new_subscriber() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 15);
    let channel = make_channel_name("port", "5", "port/1");

    let (tx1, mut rx1) = mpsc::channel(8);
    let c1 = broker
        .subscribe_client(device_request(&channel, "5"), tx1)
        .await
        .unwrap();
    c1.send().await.unwrap();
    assert!(recv_within(&mut rx1, Duration::from_secs(2)).await.is_some());

    c1.close().await;
    assert_eq!(broker.stats().await.unwrap().groups, 0);

    let (tx2, mut rx2) = mpsc::channel(8);
    let c2 = broker
        .subscribe_client(device_request(&channel, "5"), tx2)
        .await
        .unwrap();
    c2.send().await.unwrap();

    let got = recv_within(&mut rx2, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.channel_name, channel);
    assert_eq!(received_batches(&server).await, 2);

    broker.close().await;
}

#[tokio::test]
async fn test_invoke_returns_collector_value() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 15);

    let client = broker.create_client(ExchangeRequest::new("", "GET", "icmp").address("10.0.0.1"));
    let res = client.invoke(Duration::from_secs(2)).await.unwrap();

    assert_eq!(
        res.into_result().unwrap(),
        json!({"metric": "icmp", "target": "10.0.0.1"})
    );

    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.exchanges, 1);

    broker.close().await;
}

#[tokio::test]
async fn test_one_shot_and_subscription_share_a_collector() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let (tx, mut rx) = mpsc::channel(8);
    let sub = broker
        .subscribe_client(device_request("mem/7/", "7"), tx)
        .await
        .unwrap();
    let one_shot = broker.create_client(device_request("mem/7/", "7"));

    sub.send().await.unwrap();
    let res = one_shot.invoke(Duration::from_secs(2)).await.unwrap();

    assert_eq!(res.value, Some(json!({"metric": "sys", "target": "7"})));
    assert!(recv_within(&mut rx, Duration::from_secs(2)).await.is_some());

    broker.close().await;
}
