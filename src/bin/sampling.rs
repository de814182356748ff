//! Sampling daemon
//!
//! Starts the worker registry, the sampling broker and the configured probe
//! workers, then keeps them alive until Ctrl-C. Request handling lives with
//! the embedding service: it builds clients from the broker handle and calls
//! methods from the method registry. This binary only runs the background
//! side and logs its stats.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use netsampler::{
    broker::SamplingBroker,
    config::{Config, ProbeConfig, read_config_file},
    registry::{MethodContext, MethodRegistry, WorkerRegistry},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Period of the stats line in the log
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![("netsampler", LevelFilter::DEBUG)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)
        .with_context(|| format!("read config file '{}'", args.file))?;

    let workers = WorkerRegistry::spawn(&config.registry);
    let broker = SamplingBroker::spawn(config.broker.clone()).context("start sampling broker")?;
    info!("sampling broker '{}' exchanging with {}", broker.name(), config.broker.url);

    if let Err(e) = start_probes(&config, &workers).await {
        error!("{e:#}");
        broker.close().await;
        workers.shutdown().await;
        return Err(e);
    }

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    stats.tick().await;

    loop {
        tokio::select! {
            _ = stats.tick() => log_stats(&broker, &workers).await,
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("waiting for ctrl-c failed: {e}");
                }
                break;
            }
        }
    }

    info!("shutting down");
    broker.close().await;
    workers.shutdown().await;
    Ok(())
}

async fn start_probes(config: &Config, workers: &WorkerRegistry) -> anyhow::Result<()> {
    let methods = MethodRegistry::with_defaults();
    let probes: [(&str, &Option<ProbeConfig>); 2] = [
        ("default_icmp", &config.icmp),
        ("default_snmp_test", &config.snmp_test),
    ];

    for (name, probe) in probes {
        let Some(probe) = probe else {
            debug!("'{name}' is not configured");
            continue;
        };

        let ctx = MethodContext {
            workers: workers.clone(),
            probe: probe.clone(),
        };
        // the worker stays reachable through the registry
        methods
            .build(name, ctx)
            .await
            .with_context(|| format!("start '{name}'"))?;
    }
    Ok(())
}

async fn log_stats(broker: &SamplingBroker, workers: &WorkerRegistry) {
    match broker.stats().await {
        Ok(stats) => info!(
            "broker '{}': queued={} pending={} groups={} exchanges={}",
            stats.name, stats.queued, stats.pending, stats.groups, stats.exchanges
        ),
        Err(e) => error!("broker stats: {e}"),
    }

    match workers.stats().await {
        Ok(stats) => {
            for s in stats {
                debug!("worker: {s}");
            }
        }
        Err(e) => error!("worker stats: {e}"),
    }
}
