//! Probe workers against a real UDP echo peer

use std::time::Duration;

use assert_matches::assert_matches;
use netsampler::config::ProbeConfig;
use netsampler::params::Params;
use netsampler::probe::{ProbeKind, ProbeOutcome, ProbeWorker};
use netsampler::registry::{MethodContext, MethodRegistry, WorkerRegistry};
use netsampler::SamplingError;

use crate::helpers::*;

fn probe_config() -> ProbeConfig {
    ProbeConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..ProbeConfig::default()
    }
}

async fn wait_ready(worker: &ProbeWorker, params: &Params) -> Option<ProbeOutcome> {
    for _ in 0..100 {
        match worker.call(params).unwrap() {
            ProbeOutcome::Pending => tokio::time::sleep(Duration::from_millis(20)).await,
            ready => return Some(ready),
        }
    }
    None
}

#[tokio::test]
async fn test_icmp_style_echo_becomes_reachable() {
    let peer = spawn_echo_server().await;
    let worker = ProbeWorker::init(ProbeKind::Icmp, probe_config()).await.unwrap();
    let params = Params::new().with("@address", peer.to_string());

    assert_eq!(worker.call(&params).unwrap(), ProbeOutcome::Pending);

    let Some(ProbeOutcome::Ready { result, list }) = wait_ready(&worker, &params).await else {
        panic!("echo peer never answered");
    };
    assert!(result);
    assert_eq!(list.len(), 1);
    assert!(list[0].result);
    assert!(list[0].elapsed_ms >= 0);

    worker.close().await;
}

#[tokio::test]
async fn test_snmp_test_uses_port_parameter() {
    let peer = spawn_echo_server().await;
    let worker = ProbeWorker::init(ProbeKind::Snmp, probe_config()).await.unwrap();
    let params = Params::new()
        .with("@address", "127.0.0.1")
        .with("snmp.port", peer.port().to_string())
        .with("snmp.version", "v2c")
        .with("snmp.read_community", "public");

    let ready = wait_ready(&worker, &params).await;
    assert_matches!(ready, Some(ProbeOutcome::Ready { result: true, .. }));

    let stats = worker.stats();
    assert_eq!(stats.ports.len(), 1);
    assert_eq!(stats.ports[0].address, format!("127.0.0.1:{}", peer.port()));
    assert_eq!(stats.ports[0].key, "v2c/public");

    worker.close().await;
}

#[tokio::test]
async fn test_silent_peer_stays_pending() {
    // bound but never answering
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = silent.local_addr().unwrap().to_string();

    let worker = ProbeWorker::init(ProbeKind::Icmp, probe_config()).await.unwrap();
    let params = Params::new().with("@address", address);

    worker.call(&params).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(worker.call(&params).unwrap(), ProbeOutcome::Pending);

    worker.close().await;
}

#[tokio::test]
async fn test_init_fails_when_socket_cannot_be_opened() {
    let config = ProbeConfig {
        // TEST-NET-3, never a local address
        bind: "203.0.113.1:0".parse().unwrap(),
        ..ProbeConfig::default()
    };

    assert!(ProbeWorker::init(ProbeKind::Icmp, config).await.is_err());
}

#[tokio::test]
async fn test_methods_through_registries() {
    let peer = spawn_echo_server().await;
    let workers = WorkerRegistry::with_period(Duration::from_secs(60), Duration::ZERO);
    let methods = MethodRegistry::with_defaults();
    let ctx = MethodContext {
        workers: workers.clone(),
        probe: probe_config(),
    };

    let icmp = methods.build("default_icmp", ctx.clone()).await.unwrap();
    let snmp = methods.build("default_snmp_test", ctx).await.unwrap();

    let params = Params::new().with("@address", peer.to_string());
    assert_matches!(icmp.call(&params).await, Err(SamplingError::Pending));
    assert_matches!(
        snmp.call(&Params::new()).await,
        Err(SamplingError::Required(field)) if field == "address"
    );

    let mut value = None;
    for _ in 0..100 {
        match icmp.call(&params).await {
            Err(SamplingError::Pending) => tokio::time::sleep(Duration::from_millis(20)).await,
            other => {
                value = Some(other.unwrap());
                break;
            }
        }
    }
    let value = value.expect("icmp method never became ready");
    assert_eq!(value["result"], true);
    assert_eq!(value["list"].as_array().map(|l| l.len()), Some(1));

    assert_eq!(workers.stats().await.unwrap().len(), 2);
    workers.shutdown().await;
}
