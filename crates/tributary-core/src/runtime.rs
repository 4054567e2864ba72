// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`EngineRuntime`] wires the runner, executor and pause manager together
//! and runs the background tasks that drive them:
//!
//! - a pool of workers leasing queue items and executing steps
//! - the pause expiry scanner
//! - the cron ticker
//! - the event pump feeding engine-produced events (run lifecycle, invokes)
//!   back into the runner
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tributary_core::runtime::EngineRuntime;
//! use tributary_core::state::MemoryStateStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EngineRuntime::builder()
//!         .state(Arc::new(MemoryStateStore::new()))
//!         .workers(8)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.registry().register(tenant, definition)?;
//!     runtime.publish(tenant, event).await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tributary_http::{HttpClient, HttpClientConfig, MAX_FUNCTION_TIMEOUT};

use crate::driver::{Driver, DriverRegistry, HttpDriver, HttpDriverConfig};
use crate::event::{ChannelSink, Event, TrackedEvent};
use crate::executor::{Executor, ExecutorConfig};
use crate::function::FunctionRegistry;
use crate::ids::TenantId;
use crate::lifecycle::Lifecycle;
use crate::pauses::PauseManager;
use crate::queue::{MemoryQueue, Queue};
use crate::runner::{EventOutcome, Runner};
use crate::state::StateStore;

/// Pauses timed out, and stranded resumptions replayed, per expiry scan.
const EXPIRY_BATCH: usize = 500;

/// How long an idle worker waits on the queue before re-checking shutdown.
const LEASE_POLL: Duration = Duration::from_secs(1);

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    state: Option<Arc<dyn StateStore>>,
    queue: Option<Arc<dyn Queue>>,
    registry: Option<Arc<FunctionRegistry>>,
    drivers: Option<DriverRegistry>,
    http: HttpClientConfig,
    http_driver: HttpDriverConfig,
    executor: ExecutorConfig,
    workers: usize,
    lease_timeout: Duration,
    expiry_interval: Duration,
    cron_interval: Duration,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("state", &self.state.as_ref().map(|_| "..."))
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("workers", &self.workers)
            .field("lease_timeout", &self.lease_timeout)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            state: None,
            queue: None,
            registry: None,
            drivers: None,
            http: HttpClientConfig::default(),
            http_driver: HttpDriverConfig::default(),
            executor: ExecutorConfig::default(),
            workers: 16,
            lease_timeout: MAX_FUNCTION_TIMEOUT + Duration::from_secs(60),
            expiry_interval: Duration::from_secs(1),
            cron_interval: Duration::from_secs(1),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state store (required).
    pub fn state(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the queue. Default: an in-process [`MemoryQueue`].
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Share an existing function registry.
    pub fn registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the drivers. Default: the HTTP driver built from
    /// [`http_client`](Self::http_client) and [`http_driver`](Self::http_driver).
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub fn http_client(mut self, config: HttpClientConfig) -> Self {
        self.http = config;
        self
    }

    pub fn http_driver(mut self, config: HttpDriverConfig) -> Self {
        self.http_driver = config;
        self
    }

    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Number of worker tasks. Default: 16.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// How long a leased item is hidden from other workers. Must exceed the
    /// longest driver request.
    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }

    pub fn cron_interval(mut self, interval: Duration) -> Self {
        self.cron_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("state store is required"))?;
        if self.workers == 0 {
            anyhow::bail!("at least one worker is required");
        }
        if self.lease_timeout <= self.http.timeout.min(MAX_FUNCTION_TIMEOUT) {
            warn!(
                lease_timeout = ?self.lease_timeout,
                "Lease timeout does not exceed the request timeout; slow steps may run twice"
            );
        }

        let drivers = match self.drivers {
            Some(drivers) => drivers,
            None => {
                let client = HttpClient::new(self.http)?;
                DriverRegistry::new().with(Driver::Http(HttpDriver::new(client, self.http_driver)))
            }
        };

        Ok(EngineRuntimeConfig {
            state,
            queue: self.queue.unwrap_or_else(|| Arc::new(MemoryQueue::new())),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(FunctionRegistry::new())),
            drivers,
            executor: self.executor,
            workers: self.workers,
            lease_timeout: self.lease_timeout,
            expiry_interval: self.expiry_interval,
            cron_interval: self.cron_interval,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    registry: Arc<FunctionRegistry>,
    drivers: DriverRegistry,
    executor: ExecutorConfig,
    workers: usize,
    lease_timeout: Duration,
    expiry_interval: Duration,
    cron_interval: Duration,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("state", &"...")
            .field("queue", &"...")
            .field("workers", &self.workers)
            .field("executor", &self.executor)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning workers and background tasks.
    pub async fn start(self) -> Result<EngineRuntime> {
        let (sink, events_rx) = ChannelSink::new();
        let lifecycle = Arc::new(Lifecycle::new(self.state.clone(), Arc::new(sink)));
        let pauses = Arc::new(PauseManager::new(
            self.state.clone(),
            self.queue.clone(),
            lifecycle.clone(),
            self.registry.expressions(),
        ));
        let runner = Arc::new(Runner::new(
            self.registry.clone(),
            self.state.clone(),
            self.queue.clone(),
            pauses.clone(),
            lifecycle.clone(),
        ));
        let executor = Arc::new(Executor::new(
            self.registry.clone(),
            self.state.clone(),
            self.queue.clone(),
            self.drivers,
            pauses.clone(),
            runner.clone(),
            lifecycle,
            self.executor,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(self.workers + 3);
        for worker in 0..self.workers {
            handles.push(tokio::spawn(run_worker(
                worker,
                self.queue.clone(),
                executor.clone(),
                self.lease_timeout,
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(run_expiry_scanner(
            pauses,
            self.expiry_interval,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_cron_ticker(
            runner.clone(),
            self.cron_interval,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_event_pump(
            runner.clone(),
            events_rx,
            shutdown_rx,
        )));

        info!(workers = self.workers, "EngineRuntime started");

        Ok(EngineRuntime {
            handles,
            shutdown_tx,
            runner,
            state: self.state,
            queue: self.queue,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination: workers
/// finish the item they hold before exiting.
pub struct EngineRuntime {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    runner: Arc<Runner>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        self.runner.registry()
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Ingest an external event.
    pub async fn publish(&self, tenant: TenantId, event: Event) -> Result<EventOutcome> {
        Ok(self.runner.handle_event(tenant, event).await?)
    }

    /// Check if every background task is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);

        let mut panicked = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("EngineRuntime task panicked: {}", e);
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow::anyhow!("{} runtime tasks panicked", panicked));
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<dyn Queue>,
    executor: Arc<Executor>,
    lease_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker, "Worker started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            leased = queue.lease(LEASE_POLL, lease_timeout) => match leased {
                Ok(Some(lease)) => executor.process(&lease).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker, error = %e, "Queue lease failed");
                    tokio::time::sleep(LEASE_POLL).await;
                }
            }
        }
    }
    debug!(worker, "Worker stopped");
}

async fn run_expiry_scanner(
    pauses: Arc<PauseManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                match pauses.scan_expired(Utc::now(), EXPIRY_BATCH).await {
                    Ok(0) => {}
                    Ok(n) => debug!(resumed = n, "Resumed expired or stranded pauses"),
                    Err(e) => warn!(error = %e, "Pause expiry scan failed"),
                }
            }
        }
    }
}

async fn run_cron_ticker(
    runner: Arc<Runner>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut from = Utc::now();
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let to = Utc::now();
                match runner.fire_crons(from, to).await {
                    Ok(runs) if !runs.is_empty() => debug!(count = runs.len(), "Cron runs scheduled"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Cron tick failed"),
                }
                from = to;
            }
        }
    }
}

async fn run_event_pump(
    runner: Arc<Runner>,
    mut events: mpsc::UnboundedReceiver<TrackedEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            received = events.recv() => {
                let Some(TrackedEvent { tenant, event }) = received else {
                    break;
                };
                let name = event.name.clone();
                if let Err(e) = runner.handle_event(tenant, event).await {
                    warn!(event = %name, error = %e, "Failed to handle engine event");
                }
            }
        }
    }
}
