use std::net::SocketAddr;
use std::time::Duration;

use tracing::trace;

/// Sampling broker configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BrokerConfig {
    /// Name used in logs and stats
    #[serde(default = "default_broker_name")]
    pub name: String,

    /// Collector endpoint receiving the batched requests
    pub url: String,

    /// HTTP method for the exchange call
    #[serde(default = "default_method")]
    pub method: String,

    /// Period of the broker ticker in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// The idle sweep runs on every n-th tick
    #[serde(default = "default_sweep_every_ticks")]
    pub sweep_every_ticks: u64,

    /// Pending one-shot requests older than this receive a timeout error
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Coalescing window for subscribed channels
    #[serde(default = "default_cached_timeout_secs")]
    pub cached_timeout_secs: u64,

    /// Maximum number of requests drained into one exchange call
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Capacity of the inbound exchange queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: default_broker_name(),
            url: url.into(),
            method: default_method(),
            tick_interval_ms: default_tick_interval_ms(),
            sweep_every_ticks: default_sweep_every_ticks(),
            request_timeout_secs: default_request_timeout_secs(),
            cached_timeout_secs: default_cached_timeout_secs(),
            max_batch: default_max_batch(),
            queue_size: default_queue_size(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cached_timeout(&self) -> Duration {
        Duration::from_secs(self.cached_timeout_secs)
    }
}

fn default_broker_name() -> String {
    String::from("default")
}

fn default_method() -> String {
    String::from("POST")
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_sweep_every_ticks() -> u64 {
    20
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_cached_timeout_secs() -> u64 {
    15
}

fn default_max_batch() -> usize {
    1000
}

fn default_queue_size() -> usize {
    1000
}

/// Probe worker configuration, shared by the ICMP and SNMP variants
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProbeConfig {
    /// Results kept per bucket
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Length of one scan cycle in ticks (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// A bucket nobody called for this many seconds is dropped
    #[serde(default = "default_expired_secs")]
    pub expired_secs: i64,

    /// A bucket without a result for this many seconds is unreachable
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i64,

    /// Local address for the echo socket
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            poll_interval: default_poll_interval(),
            expired_secs: default_expired_secs(),
            timeout_secs: default_timeout_secs(),
            bind: default_bind(),
        }
    }
}

fn default_buffer_size() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    30
}

fn default_expired_secs() -> i64 {
    600
}

fn default_timeout_secs() -> i64 {
    90
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Background worker registry configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistryConfig {
    /// Period of the lifecycle sweep
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Idle lifetime handed to workers on each sweep
    #[serde(default)]
    pub lifecycle_secs: u64,
}

impl RegistryConfig {
    /// Sweep period; zero falls back to the default
    pub fn period(&self) -> Duration {
        if self.period_secs == 0 {
            return Duration::from_secs(default_period_secs());
        }
        Duration::from_secs(self.period_secs)
    }

    pub fn lifecycle(&self) -> Duration {
        Duration::from_secs(self.lifecycle_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            lifecycle_secs: 0,
        }
    }
}

fn default_period_secs() -> u64 {
    5
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,

    /// ICMP reachability probes (optional - disabled when absent)
    pub icmp: Option<ProbeConfig>,

    /// SNMP reachability probes (optional - disabled when absent)
    pub snmp_test: Option<ProbeConfig>,

    #[serde(default)]
    pub registry: RegistryConfig,
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided! {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
