//! Explicit registries for background workers and sampling methods
//!
//! Both are plain values built at startup and handed to whoever needs them,
//! so several engines can run side by side in one process (and in tests).
//!
//! - [`WorkerRegistry`]: actor owning named background workers, sweeping
//!   expired ones on a fixed period
//! - [`MethodRegistry`]: route specs plus factories that build [`Method`]s

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument};

use crate::config::{ProbeConfig, RegistryConfig};
use crate::error::{SamplingError, SamplingResult};
use crate::params::Params;
use crate::probe::{ProbeKind, ProbeWorker};
use crate::supervise::{LastError, spawn_supervised};

/// How long `stats()` waits for the registry actor
pub const STATS_TIMEOUT: Duration = Duration::from_secs(20);

/// A long-running component managed by the [`WorkerRegistry`]
#[async_trait]
pub trait BackgroundWorker: Send + Sync {
    fn stats(&self) -> Value;

    /// Checked on every lifecycle sweep
    fn is_expired(&self, now: DateTime<Utc>, lifecycle: Duration) -> bool;

    async fn close(&self);
}

/// A sampling method callable with a parameter bag
#[async_trait]
pub trait Method: Send + Sync {
    async fn call(&self, params: &Params) -> SamplingResult<Value>;
}

enum RegistryCommand {
    Add {
        id: String,
        worker: Arc<dyn BackgroundWorker>,
    },
    Remove {
        id: String,
    },
    Stats {
        respond_to: oneshot::Sender<Vec<Value>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

struct RegistryActor {
    period: Duration,
    lifecycle: Duration,
    command_rx: mpsc::Receiver<RegistryCommand>,
    workers: HashMap<String, Arc<dyn BackgroundWorker>>,
}

impl RegistryActor {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting worker registry");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(Utc::now()).await,

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(RegistryCommand::Add { id, worker }) => {
                            if let Some(old) = self.workers.insert(id.clone(), worker) {
                                debug!("worker '{id}' replaced");
                                old.close().await;
                            }
                        }
                        Some(RegistryCommand::Remove { id }) => {
                            self.workers.remove(&id);
                        }
                        Some(RegistryCommand::Stats { respond_to }) => {
                            let stats = self.workers.values().map(|w| w.stats()).collect();
                            let _ = respond_to.send(stats);
                        }
                        Some(RegistryCommand::Shutdown { respond_to }) => {
                            self.close_all().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        None => {
                            self.close_all().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!("worker registry stopped");
    }

    async fn sweep(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.is_expired(now, self.lifecycle))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(worker) = self.workers.remove(&id) {
                debug!("worker '{id}' is expired");
                worker.close().await;
            }
        }
    }

    async fn close_all(&mut self) {
        for (id, worker) in self.workers.drain() {
            debug!("closing worker '{id}'");
            worker.close().await;
        }
    }
}

struct RegistryInner {
    command_tx: mpsc::Sender<RegistryCommand>,
    closed: Arc<AtomicBool>,
    last_error: LastError,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle for the background worker registry
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

impl WorkerRegistry {
    pub fn spawn(config: &RegistryConfig) -> Self {
        Self::with_period(config.period(), config.lifecycle())
    }

    pub fn with_period(period: Duration, lifecycle: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));
        let last_error = LastError::default();

        let actor = RegistryActor {
            period,
            lifecycle,
            command_rx,
            workers: HashMap::new(),
        };
        let task = spawn_supervised(
            String::from("worker registry"),
            closed.clone(),
            last_error.clone(),
            actor.run(),
        );

        Self {
            inner: Arc::new(RegistryInner {
                command_tx,
                closed,
                last_error,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Register `worker` under `id`, closing any worker it replaces
    pub async fn add(&self, id: impl Into<String>, worker: Arc<dyn BackgroundWorker>) -> SamplingResult<()> {
        self.inner
            .command_tx
            .send(RegistryCommand::Add {
                id: id.into(),
                worker,
            })
            .await
            .map_err(|_| SamplingError::Closed)
    }

    /// Forget `id` without closing it
    pub async fn remove(&self, id: impl Into<String>) -> SamplingResult<()> {
        self.inner
            .command_tx
            .send(RegistryCommand::Remove { id: id.into() })
            .await
            .map_err(|_| SamplingError::Closed)
    }

    pub async fn stats(&self) -> SamplingResult<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(RegistryCommand::Stats { respond_to: tx })
            .await
            .map_err(|_| SamplingError::Closed)?;

        match tokio::time::timeout(STATS_TIMEOUT, rx).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(_)) => Err(SamplingError::Closed),
            Err(_) => Err(SamplingError::Timeout),
        }
    }

    /// Close every worker and stop the registry
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .command_tx
            .send(RegistryCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// Description of a sampling method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    pub name: String,
    pub method: String,
    pub metric: String,
    pub description: String,
}

impl RouteSpec {
    pub fn new(name: &str, method: &str, metric: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            method: method.to_string(),
            metric: metric.to_string(),
            description: description.to_string(),
        }
    }
}

/// What a factory gets to build its method from
#[derive(Clone)]
pub struct MethodContext {
    pub workers: WorkerRegistry,
    pub probe: ProbeConfig,
}

type MethodFactory =
    Arc<dyn Fn(&RouteSpec, MethodContext) -> BoxFuture<'static, anyhow::Result<Arc<dyn Method>>> + Send + Sync>;

struct Route {
    spec: RouteSpec,
    factory: MethodFactory,
}

#[derive(Default)]
pub struct MethodRegistry {
    routes: BTreeMap<String, Route>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `default_icmp` and `default_snmp_test`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_probe(
            RouteSpec::new("default_icmp", "get", "icmp", "the result of icmp ping"),
            ProbeKind::Icmp,
        );
        registry.register_probe(
            RouteSpec::new("default_snmp_test", "get", "snmp_test", "the result of snmp ping"),
            ProbeKind::Snmp,
        );
        registry
    }

    fn register_probe(&mut self, spec: RouteSpec, kind: ProbeKind) {
        self.routes.insert(
            spec.name.clone(),
            Route {
                spec,
                factory: Arc::new(move |_: &RouteSpec, ctx: MethodContext| {
                    build_probe(kind, ctx).boxed()
                }),
            },
        );
    }

    pub fn register<F, Fut>(&mut self, spec: RouteSpec, factory: F) -> SamplingResult<()>
    where
        F: Fn(&RouteSpec, MethodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Method>>> + Send + 'static,
    {
        if self.routes.contains_key(&spec.name) {
            return Err(SamplingError::AlreadyExists);
        }

        let factory: MethodFactory =
            Arc::new(move |spec: &RouteSpec, ctx: MethodContext| factory(spec, ctx).boxed());
        self.routes.insert(spec.name.clone(), Route { spec, factory });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RouteSpec> {
        self.routes.get(name).map(|r| &r.spec)
    }

    pub fn specs(&self) -> impl Iterator<Item = &RouteSpec> {
        self.routes.values().map(|r| &r.spec)
    }

    /// Instantiate the method registered as `name`
    pub async fn build(&self, name: &str, ctx: MethodContext) -> anyhow::Result<Arc<dyn Method>> {
        let Some(route) = self.routes.get(name) else {
            bail!("method '{name}' is not found");
        };
        (route.factory)(&route.spec, ctx).await
    }
}

async fn build_probe(kind: ProbeKind, ctx: MethodContext) -> anyhow::Result<Arc<dyn Method>> {
    let worker = ProbeWorker::init(kind, ctx.probe).await?;
    if ctx.workers.add(kind.worker_name(), Arc::new(worker.clone())).await.is_err() {
        worker.close().await;
        bail!("worker registry is closed");
    }

    info!("{} started", kind.worker_name());
    Ok(Arc::new(worker))
}
