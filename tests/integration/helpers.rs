//! Helper functions for integration tests

use std::net::SocketAddr;
use std::time::Duration;

use netsampler::broker::{ExchangeResponse, SamplingBroker};
use netsampler::config::BrokerConfig;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use wiremock::{Request, Respond, ResponseTemplate};

pub fn create_test_broker_config(url: &str, cached_timeout_secs: u64) -> BrokerConfig {
    let mut config = BrokerConfig::new(url);
    config.name = "test".to_string();
    config.tick_interval_ms = 20;
    config.sweep_every_ticks = 5;
    config.request_timeout_secs = 1;
    config.cached_timeout_secs = cached_timeout_secs;
    config
}

pub fn spawn_test_broker(server_uri: &str, cached_timeout_secs: u64) -> SamplingBroker {
    SamplingBroker::spawn(create_test_broker_config(
        &format!("{server_uri}/batch"),
        cached_timeout_secs,
    ))
    .unwrap()
}

/// Collector stand-in: answers each request with `{"metric": .., "target": ..}`
/// under its own channel and id
pub struct EchoCollector;

impl Respond for EchoCollector {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let requests: Vec<Value> = serde_json::from_slice(&request.body).unwrap_or_default();
        let replies: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!({
                    "channel": r["channel"],
                    "request_id": r["request_id"],
                    "created_at": "2024-01-01T00:00:00Z",
                    "value": {
                        "metric": r["metric-name"],
                        "target": r.get("managed_id").cloned().unwrap_or(r["address"].clone()),
                    }
                })
            })
            .collect();
        ResponseTemplate::new(202).set_body_json(replies)
    }
}

pub async fn recv_within(
    rx: &mut mpsc::Receiver<ExchangeResponse>,
    timeout: Duration,
) -> Option<ExchangeResponse> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Number of batches the mock collector has received
pub async fn received_batches(server: &wiremock::MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|r| r.len())
        .unwrap_or_default()
}

/// UDP echo server on localhost
pub async fn spawn_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}
