//! ProbeWorker - continuous reachability probes with bounded history
//!
//! ## Message Flow
//!
//! ```text
//! call(params) ── lock ──► ProbeTable ◄── lock ── actor
//!      │ new bucket                          ▲
//!      └──► ProbeNow ──────────────────────► │ ◄── 1s ticker (scan on sub-ticks 0..=3)
//!                                            │ ◄── EchoReply from the transport
//!                                            └──► EchoTransport::send
//! ```
//!
//! `call()` runs in the caller's task and only holds the table lock while it
//! reads. Probes are sent by the actor, never under the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, instrument, trace, warn};

use crate::config::ProbeConfig;
use crate::error::{SamplingError, SamplingResult};
use crate::params::Params;
use crate::registry::{BackgroundWorker, Method};
use crate::supervise::{LastError, spawn_supervised};

use super::bucket::{BucketStats, ProbeJob, ProbeOutcome, ProbeTable, ProbeVariant, SnmpVersion};
use super::transport::{EchoReply, EchoTransport, UdpEchoTransport};

/// Period of the scan ticker
pub const PROBE_TICK: Duration = Duration::from_secs(1);

/// Default SNMP agent port
pub const DEFAULT_SNMP_PORT: u16 = 161;

const COMMAND_QUEUE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Icmp,
    Snmp,
}

impl ProbeKind {
    pub fn worker_name(&self) -> &'static str {
        match self {
            ProbeKind::Icmp => "icmp_worker",
            ProbeKind::Snmp => "snmp_test_worker",
        }
    }

    /// Pull the probe target out of a call's parameters
    pub fn parse_target(&self, params: &Params) -> SamplingResult<(String, ProbeVariant)> {
        let address = params
            .get_string("@address")
            .map_err(|_| SamplingError::Required(String::from("address")))?;

        match self {
            ProbeKind::Icmp => Ok((address, ProbeVariant::Icmp)),
            ProbeKind::Snmp => {
                let port = params.get_string_with_default("snmp.port", "");
                let address = if port.is_empty() {
                    format!("{address}:{DEFAULT_SNMP_PORT}")
                } else if port.starts_with(':') {
                    format!("{address}{port}")
                } else {
                    format!("{address}:{port}")
                };

                let version = params.get_string_with_default("snmp.version", "");
                if version.is_empty() {
                    return Err(SamplingError::BadRequest(String::from(
                        "'snmp.version' is required.",
                    )));
                }

                let community = params.get_string_with_default("snmp.read_community", "");
                if community.is_empty() {
                    return Err(SamplingError::Required(String::from("snmp.read_community")));
                }

                let version = SnmpVersion::parse(&version)?;
                if version == SnmpVersion::V3 {
                    return Err(SamplingError::BadRequest(String::from(
                        "snmp v3 is unsupported",
                    )));
                }

                Ok((address, ProbeVariant::Snmp { version, community }))
            }
        }
    }
}

#[derive(Debug)]
enum ProbeCommand {
    /// Probe a freshly created bucket without waiting for the next scan
    ProbeNow { address: String, key: String },

    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub name: &'static str,
    pub ports: Vec<BucketStats>,
    pub last_error: Option<String>,
}

struct ProbeActor {
    kind: ProbeKind,
    poll_interval: u64,
    table: Arc<Mutex<ProbeTable>>,
    transport: Arc<dyn EchoTransport>,
    command_rx: mpsc::Receiver<ProbeCommand>,
    replies: mpsc::Receiver<EchoReply>,
    ticks: u64,
}

impl ProbeActor {
    #[instrument(skip(self), fields(worker = self.kind.worker_name()))]
    async fn run(mut self) {
        debug!("starting probe worker");

        let mut ticker = interval(PROBE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.ticks = self.ticks.wrapping_add(1);
                    self.scan(self.ticks % self.poll_interval).await;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ProbeCommand::ProbeNow { address, key }) => {
                            let job = self.table.lock().probe_now(&address, &key);
                            if let Some(job) = job {
                                self.send(job).await;
                            }
                        }
                        Some(ProbeCommand::Shutdown) | None => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                reply = self.replies.recv() => {
                    match reply {
                        Some(reply) => self.on_reply(reply),
                        None => {
                            warn!("echo transport closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("probe worker stopped");
    }

    async fn scan(&mut self, sub_tick: u64) {
        let (jobs, evicted) = {
            let mut table = self.table.lock();
            let jobs = table.plan_probes(Utc::now(), sub_tick);
            (jobs, table.take_evicted())
        };
        for address in &evicted {
            self.transport.forget(address);
        }

        if !jobs.is_empty() {
            trace!("sub-tick {sub_tick}: sending {} probes", jobs.len());
        }

        for job in jobs {
            self.send(job).await;
        }
    }

    async fn send(&mut self, job: ProbeJob) {
        let sent_at = Utc::now();
        match self.transport.send(job.id, &job.address, &job.variant).await {
            Ok(()) => {
                self.table.lock().record_pending(&job, sent_at);
            }
            Err(e) => warn!(
                "send probe to '{}' with '{}' failed, {}",
                job.address, job.key, e.message
            ),
        }
    }

    fn on_reply(&mut self, reply: EchoReply) {
        if let Some(e) = &reply.error {
            debug!("recv error from echo transport, {e}");
            return;
        }

        if !self.table.lock().record_reply(&reply) {
            trace!("echo {} from '{}' matched nothing", reply.id, reply.address);
        }
    }
}

struct WorkerInner {
    kind: ProbeKind,
    table: Arc<Mutex<ProbeTable>>,
    transport: Arc<dyn EchoTransport>,
    command_tx: mpsc::Sender<ProbeCommand>,
    closed: Arc<AtomicBool>,
    last_error: LastError,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle for a probe worker
#[derive(Clone)]
pub struct ProbeWorker {
    inner: Arc<WorkerInner>,
}

impl ProbeWorker {
    /// Open the echo socket and start the actor. Socket errors are returned
    /// to the caller.
    pub async fn init(kind: ProbeKind, config: ProbeConfig) -> anyhow::Result<Self> {
        let (transport, replies) = UdpEchoTransport::bind(config.bind)
            .await
            .with_context(|| format!("open echo socket on {} for {}", config.bind, kind.worker_name()))?;

        Ok(Self::with_transport(kind, config, Arc::new(transport), replies))
    }

    pub fn with_transport(
        kind: ProbeKind,
        config: ProbeConfig,
        transport: Arc<dyn EchoTransport>,
        replies: mpsc::Receiver<EchoReply>,
    ) -> Self {
        let table = Arc::new(Mutex::new(ProbeTable::new(&config)));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let last_error = LastError::default();

        let actor = ProbeActor {
            kind,
            poll_interval: config.poll_interval.max(1),
            table: table.clone(),
            transport: transport.clone(),
            command_rx,
            replies,
            ticks: 0,
        };

        let task = spawn_supervised(
            kind.worker_name().to_string(),
            closed.clone(),
            last_error.clone(),
            actor.run(),
        );

        Self {
            inner: Arc::new(WorkerInner {
                kind,
                table,
                transport,
                command_tx,
                closed,
                last_error,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }

    pub fn kind(&self) -> ProbeKind {
        self.inner.kind
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current history and verdict for the target named by `params`.
    ///
    /// The first call for a target creates its bucket and schedules an
    /// immediate probe; it answers `Pending` until a result arrives.
    pub fn call(&self, params: &Params) -> SamplingResult<ProbeOutcome> {
        if self.is_closed() {
            return Err(SamplingError::Closed);
        }

        let (address, variant) = self.inner.kind.parse_target(params)?;
        let (outcome, created) = self.inner.table.lock().call(&address, &variant, Utc::now());

        if created {
            let cmd = ProbeCommand::ProbeNow {
                address,
                key: variant.key(),
            };
            if self.inner.command_tx.try_send(cmd).is_err() {
                trace!("probe queue is full, new target waits for the next scan");
            }
        }
        Ok(outcome)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            name: self.inner.kind.worker_name(),
            ports: self.inner.table.lock().stats(),
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.command_tx.send(ProbeCommand::Shutdown).await;
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
        self.inner.transport.close();
        debug!("{} is closed", self.inner.kind.worker_name());
    }
}

#[async_trait]
impl BackgroundWorker for ProbeWorker {
    fn stats(&self) -> Value {
        serde_json::to_value(ProbeWorker::stats(self)).unwrap_or(Value::Null)
    }

    /// Probe workers live as long as their actor does
    fn is_expired(&self, _now: DateTime<Utc>, _lifecycle: Duration) -> bool {
        self.is_closed()
    }

    async fn close(&self) {
        ProbeWorker::close(self).await;
    }
}

#[async_trait]
impl Method for ProbeWorker {
    async fn call(&self, params: &Params) -> SamplingResult<Value> {
        match ProbeWorker::call(self, params)? {
            ProbeOutcome::Pending => Err(SamplingError::Pending),
            ready => serde_json::to_value(ready)
                .map_err(|e| SamplingError::BadRequest(e.to_string())),
        }
    }
}
