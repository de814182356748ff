//! SamplingBroker - batches metric reads into few collector round trips
//!
//! A single actor owns the correlation table and the channel groups. Callers
//! talk to it only through channels:
//!
//! ```text
//! Client::invoke ──┐                        ┌──► oneshot reply (by request id)
//! ChannelClient ───┼─► exchange queue ──► batch ──► Transport ──► replies ─┤
//! flush() ─────────┘                                                     └──► subscribers (by channel)
//!
//! subscribe / unsubscribe / stats ──► command queue
//! ticker ──► every n-th tick: time out stale one-shot requests
//! ```
//!
//! ## Batching
//!
//! On every exchange signal the actor drains the queue (up to `max_batch`
//! items), mints a fresh correlation id for every request that is actually
//! sent and makes exactly one transport call. A transport failure is
//! delivered to every request of the batch.
//!
//! ## Coalescing
//!
//! A subscription trigger is skipped while its group requested or received
//! within the coalescing window. Its subscribers get the next reply anyway.

pub mod client;
pub mod correlation;
pub mod group;
pub mod messages;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, instrument, trace, warn};

use crate::config::BrokerConfig;
use crate::error::{RuntimeError, SamplingError, SamplingResult};
use crate::supervise::{LastError, spawn_supervised};

pub use client::{ChannelClient, Client};
pub use correlation::CorrelationTable;
pub use group::{ChannelGroup, ChannelGroups};
pub use messages::{
    BrokerStats, ExchangeRequest, ExchangeResponse, ReplySink, Target, make_channel_name,
};
pub use transport::{HttpTransport, Transport};

use messages::{BrokerCommand, Exchange, PendingRequest};

/// How long subscribe/stats callers wait for the actor's acknowledgement
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// The actor half of the broker
struct BrokerActor {
    name: String,
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    exchange_rx: mpsc::Receiver<Exchange>,
    command_rx: mpsc::Receiver<BrokerCommand>,

    /// Last minted correlation id
    request_id: u64,
    correlation: CorrelationTable,
    groups: ChannelGroups,
    exchanges: u64,
    last_error: LastError,
}

/// A request that made it into the outbound batch
enum Dispatched {
    OneShot(PendingRequest),
    Subscribed {
        id: u64,
        channel_name: String,
        subscriber_id: String,
    },
}

impl BrokerActor {
    #[instrument(skip(self), fields(broker = %self.name))]
    async fn run(mut self) {
        debug!("starting sampling broker");

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sweep_every = self.config.sweep_every_ticks.max(1);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ticks = ticks.wrapping_add(1);
                    if ticks % sweep_every == 0 {
                        self.on_idle(Instant::now());
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(BrokerCommand::Shutdown) | None => {
                            debug!("received shutdown command");
                            break;
                        }
                        Some(cmd) => self.on_command(cmd),
                    }
                }

                item = self.exchange_rx.recv() => {
                    match item {
                        Some(item) => self.run_once(item).await,
                        None => {
                            warn!("exchange queue closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.correlation
            .drain(&RuntimeError::new(503, SamplingError::Closed.to_string()));
        debug!("sampling broker stopped");
    }

    fn on_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Subscribe {
                channel_name,
                subscriber_id,
                sink,
                respond_to,
            } => {
                let result = self.groups.subscribe(&channel_name, &subscriber_id, sink);
                let _ = respond_to.send(result);
            }

            BrokerCommand::Unsubscribe {
                channel_name,
                subscriber_id,
            } => {
                self.groups.unsubscribe(&channel_name, &subscriber_id);
            }

            BrokerCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }

            BrokerCommand::Shutdown => {}
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            name: self.name.clone(),
            queued: self.exchange_rx.len(),
            pending: self.correlation.len(),
            groups: self.groups.len(),
            exchanges: self.exchanges,
            last_error: self.last_error.lock().clone(),
        }
    }

    fn on_idle(&mut self, now: Instant) {
        let expired = self.correlation.sweep(now, self.config.request_timeout());
        if expired > 0 {
            debug!("{expired} pending requests timed out");
        }
    }

    fn next_id(&mut self) -> u64 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    /// Drain the queue behind `first` into one batch
    fn recv_batch(&mut self, first: Exchange) -> Vec<Exchange> {
        let max_batch = self.config.max_batch.max(1);
        let mut batch = Vec::with_capacity(max_batch.min(64));
        if !matches!(first, Exchange::Flush) {
            batch.push(first);
        }

        while batch.len() < max_batch {
            match self.exchange_rx.try_recv() {
                Ok(Exchange::Flush) => continue,
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        batch
    }

    async fn run_once(&mut self, first: Exchange) {
        let batch = self.recv_batch(first);
        if batch.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut dispatched = Vec::with_capacity(batch.len());
        let mut requests = Vec::with_capacity(batch.len());

        for item in batch {
            match item {
                Exchange::Invoke { mut request, reply } => {
                    if reply.is_closed() {
                        trace!("caller of '{}' already gave up", request.channel_name);
                        continue;
                    }
                    let id = self.next_id();
                    request.id = id;
                    requests.push(request.clone());
                    dispatched.push(Dispatched::OneShot(PendingRequest {
                        id,
                        created_at: now,
                        reply,
                        request,
                    }));
                }

                Exchange::Subscribed {
                    subscriber_id,
                    mut request,
                    cached_timeout,
                } => {
                    if !self
                        .groups
                        .begin_request(&request.channel_name, now, cached_timeout)
                    {
                        trace!("'{}' coalesced", request.channel_name);
                        continue;
                    }
                    let id = self.next_id();
                    request.id = id;
                    dispatched.push(Dispatched::Subscribed {
                        id,
                        channel_name: request.channel_name.clone(),
                        subscriber_id,
                    });
                    requests.push(request);
                }

                Exchange::Flush => {}
            }
        }

        if requests.is_empty() {
            return;
        }

        self.exchanges += 1;
        trace!("exchanging batch of {}", requests.len());

        match self.transport.exchange(&requests).await {
            Err(e) => {
                warn!("exchange failed for {} requests: {}", requests.len(), e.message);
                *self.last_error.lock() = Some(e.message.clone());
                self.fail_batch(dispatched, &e);
            }
            Ok(responses) => {
                for d in dispatched {
                    if let Dispatched::OneShot(pending) = d {
                        self.correlation.insert(pending);
                    }
                }

                let now = Instant::now();
                for response in &responses {
                    self.correlation.complete(response);
                    self.groups.publish(response, now);
                }
            }
        }
    }

    fn fail_batch(&mut self, dispatched: Vec<Dispatched>, error: &RuntimeError) {
        for d in dispatched {
            match d {
                Dispatched::OneShot(pending) => {
                    let _ = pending.reply.send(ExchangeResponse::from_error(
                        pending.request.channel_name,
                        pending.id,
                        error.clone(),
                    ));
                }
                Dispatched::Subscribed {
                    id,
                    channel_name,
                    subscriber_id,
                } => {
                    let response = ExchangeResponse::from_error(&channel_name, id, error.clone());
                    self.groups.reply_to(&channel_name, &subscriber_id, &response);
                }
            }
        }
    }
}

struct BrokerInner {
    name: String,
    exchange_tx: mpsc::Sender<Exchange>,
    command_tx: mpsc::Sender<BrokerCommand>,
    closed: Arc<AtomicBool>,
    last_error: LastError,
    cached_timeout: Duration,
    next_client: AtomicU64,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle for the sampling broker
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Clone)]
pub struct SamplingBroker {
    inner: Arc<BrokerInner>,
}

impl SamplingBroker {
    /// Spawn a broker talking HTTP to `config.url`
    pub fn spawn(config: BrokerConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config.method, &config.url, config.request_timeout())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Spawn a broker with a custom transport
    pub fn with_transport(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let (exchange_tx, exchange_rx) = mpsc::channel(config.queue_size.max(1));
        let (command_tx, command_rx) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));
        let last_error = LastError::default();
        let name = config.name.clone();
        let cached_timeout = config.cached_timeout();

        let actor = BrokerActor {
            name: name.clone(),
            config,
            transport,
            exchange_rx,
            command_rx,
            request_id: 0,
            correlation: CorrelationTable::new(),
            groups: ChannelGroups::new(),
            exchanges: 0,
            last_error: last_error.clone(),
        };

        let task = spawn_supervised(
            format!("sampling broker '{name}'"),
            closed.clone(),
            last_error.clone(),
            actor.run(),
        );

        Self {
            inner: Arc::new(BrokerInner {
                name,
                exchange_tx,
                command_tx,
                closed,
                last_error,
                cached_timeout,
                next_client: AtomicU64::new(0),
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    fn generate_id(&self) -> String {
        let n = self.inner.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.inner.name)
    }

    pub(crate) async fn enqueue(&self, item: Exchange) -> SamplingResult<()> {
        self.inner
            .exchange_tx
            .send(item)
            .await
            .map_err(|_| SamplingError::Closed)
    }

    /// Build a one-shot client for `request`
    pub fn create_client(&self, request: ExchangeRequest) -> Client {
        Client::new(self.generate_id(), self.clone(), request)
    }

    /// Subscribe `sink` to `request.channel_name` with the configured
    /// coalescing window
    pub async fn subscribe_client(
        &self,
        request: ExchangeRequest,
        sink: ReplySink,
    ) -> SamplingResult<ChannelClient> {
        self.subscribe_client_with_window(request, sink, self.inner.cached_timeout)
            .await
    }

    pub async fn subscribe_client_with_window(
        &self,
        request: ExchangeRequest,
        sink: ReplySink,
        cached_timeout: Duration,
    ) -> SamplingResult<ChannelClient> {
        let id = self.generate_id();
        self.subscribe(&request.channel_name, &id, sink).await?;
        Ok(ChannelClient::new(id, self.clone(), request, cached_timeout))
    }

    /// Register `sink` under `subscriber_id`; the id must be unique per channel
    pub async fn subscribe(
        &self,
        channel_name: &str,
        subscriber_id: &str,
        sink: ReplySink,
    ) -> SamplingResult<()> {
        if self.is_closed() {
            return Err(SamplingError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(BrokerCommand::Subscribe {
                channel_name: channel_name.to_string(),
                subscriber_id: subscriber_id.to_string(),
                sink,
                respond_to: tx,
            })
            .await
            .map_err(|_| SamplingError::Closed)?;

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SamplingError::Closed),
            Err(_) => Err(SamplingError::Timeout),
        }
    }

    /// Fire-and-forget removal of a subscriber
    pub async fn unsubscribe(&self, channel_name: &str, subscriber_id: &str) {
        if self.is_closed() {
            return;
        }

        let _ = self
            .inner
            .command_tx
            .send(BrokerCommand::Unsubscribe {
                channel_name: channel_name.to_string(),
                subscriber_id: subscriber_id.to_string(),
            })
            .await;
    }

    /// Ask the actor to send whatever is queued
    pub fn flush(&self) {
        let _ = self.inner.exchange_tx.try_send(Exchange::Flush);
    }

    pub async fn stats(&self) -> SamplingResult<BrokerStats> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(BrokerCommand::GetStats { respond_to: tx })
            .await
            .map_err(|_| SamplingError::Closed)?;

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(_)) => Err(SamplingError::Closed),
            Err(_) => Err(SamplingError::Timeout),
        }
    }

    /// Stop the actor and wait for it to exit. Pending one-shot requests are
    /// answered with a closed error.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.command_tx.send(BrokerCommand::Shutdown).await;
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
    }
}
