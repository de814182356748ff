//! Concurrency tests
//!
//! Many callers share one broker; each must get its own reply back.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use netsampler::broker::ExchangeRequest;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

use crate::helpers::*;

async fn collector() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoCollector)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_concurrent_invokes_are_correlated() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let calls = (0..50).map(|i| {
        let broker = broker.clone();
        async move {
            let id = i.to_string();
            let client = broker.create_client(
                ExchangeRequest::new(format!("cpu/{id}/"), "GET", "cpu").managed("network_device", &id),
            );
            (id, client.invoke(Duration::from_secs(5)).await.unwrap())
        }
    });

    let results = join_all(calls).await;

    let mut ids = HashSet::new();
    for (id, res) in &results {
        assert!(!res.has_error());
        assert_eq!(res.value, Some(json!({"metric": "cpu", "target": id})));
        assert!(ids.insert(res.id), "correlation id {} reused", res.id);
    }

    // batching: never more round trips than requests
    assert!(received_batches(&server).await <= 50);

    broker.close().await;
}

#[tokio::test]
async fn test_many_subscribers_one_channel() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let mut receivers = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..10 {
        let (tx, rx) = mpsc::channel(4);
        let client = broker
            .subscribe_client(
                ExchangeRequest::new("if/9/", "GET", "interface").managed("network_device", "9"),
                tx,
            )
            .await
            .unwrap();
        receivers.push(rx);
        clients.push(client);
    }

    clients[3].send().await.unwrap();

    for rx in &mut receivers {
        let got = recv_within(rx, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.value, Some(json!({"metric": "interface", "target": "9"})));
    }

    for client in clients {
        client.close().await;
    }
    assert_eq!(broker.stats().await.unwrap().groups, 0);

    broker.close().await;
}

#[tokio::test]
async fn test_dropped_receiver_does_not_block_others() {
    let server = collector().await;
    let broker = spawn_test_broker(&server.uri(), 0);

    let (tx1, rx1) = mpsc::channel(4);
    let (tx2, mut rx2) = mpsc::channel(4);
    let c1 = broker
        .subscribe_client(ExchangeRequest::new("aa", "GET", "sys"), tx1)
        .await
        .unwrap();
    let _c2 = broker
        .subscribe_client(ExchangeRequest::new("aa", "GET", "sys"), tx2)
        .await
        .unwrap();
    drop(rx1);

    c1.send().await.unwrap();
    assert!(recv_within(&mut rx2, Duration::from_secs(2)).await.is_some());

    broker.close().await;
}
