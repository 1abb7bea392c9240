//! # Psych Provider
//!
//! The value a host owns. It holds the catalog, the shared pipeline state and
//! the two seams (transport and publisher), and exposes the host-facing
//! operations as three small traits:
//!
//! - [`Lifecycle`]: start the scheduler and the polling worker, stop them.
//! - [`Republish`]: run a soft or hard cycle for every resource now.
//! - [`Diagnostics`]: counters, per-resource status, shutdown flag.
//!
//! There is no global instance; several providers can live in one process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::{ConfigError, PsychConfig};
use crate::core::catalog::{CatalogSnapshot, ResourceCatalog, ResourceDefinition};
use crate::core::counters::CounterSnapshot;
use crate::core::dispatcher::Publisher;
use crate::core::policy::{CycleOutcome, ResourcePhase};
use crate::core::state::{shared_state, SharedState};
use crate::ingestors::psych_polling::{PollSettings, PollingWorker, WorkerCommand};
use crate::ingestors::scheduler::Scheduler;
use crate::retrieve::{FeedTransport, FetchMode, HttpFeedClient, TransportError, TransportOptions};

const COMMAND_QUEUE: usize = 64;

/// Errors of the provider facade.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration or catalog.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The HTTP transport could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A panic-level clock drift shut the core down.
    #[error("core is shut down")]
    Shutdown,
    /// `start` was called twice.
    #[error("provider already started")]
    AlreadyStarted,
    /// The operation needs a running provider.
    #[error("provider not started")]
    NotStarted,
    /// The worker did not answer within the request timeout.
    #[error("timed out waiting for the polling worker")]
    Timeout,
    /// The worker task has exited.
    #[error("polling worker is gone")]
    WorkerGone,
}

/// Manual republish flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepublishMode {
    /// Conditional fetch; unchanged feeds answer 304 and publish nothing.
    Soft,
    /// Unconditional fetch on a fresh connection; every mapped row is republished.
    Hard,
}

impl RepublishMode {
    /// Request mode used for the cycles.
    pub fn fetch_mode(self) -> FetchMode {
        match self {
            RepublishMode::Soft => FetchMode::Conditional,
            RepublishMode::Hard => FetchMode::Full,
        }
    }
}

/// Answer to a republish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Requested mode.
    pub mode: RepublishMode,
    /// Resources a cycle was started for.
    pub started: Vec<String>,
    /// Resources skipped because a cycle was already running.
    pub skipped: Vec<String>,
    /// How each started cycle ended.
    pub outcomes: BTreeMap<String, CycleOutcome>,
}

/// Diagnostic view of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// Resource name.
    pub name: String,
    /// Feed URL.
    pub url: String,
    /// Current phase.
    pub phase: ResourcePhase,
    /// Current or last cycle id.
    pub cycle: u64,
    /// Attempts in the current or last cycle.
    pub attempts: u32,
    /// Mode of the current or last cycle.
    pub mode: Option<FetchMode>,
    /// Start of the current or last cycle.
    pub cycle_started_at: Option<DateTime<Utc>>,
    /// End of the last finished cycle.
    pub last_completed_at: Option<DateTime<Utc>>,
    /// How the last cycle ended.
    pub last_outcome: Option<CycleOutcome>,
    /// Last content modification time, sent as `If-Modified-Since`.
    pub last_modified: Option<DateTime<Utc>>,
    /// Last attempt error.
    pub last_error: Option<String>,
    /// Open streams.
    pub streams: usize,
}

/// Start and stop.
pub trait Lifecycle {
    /// Spawns the scheduler and the polling worker on the current runtime.
    fn start(&self) -> Result<(), CoreError>;
    /// Cancels both tasks and waits for the worker to drain.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Manual republish.
pub trait Republish {
    /// Runs one cycle per idle resource and reports how each ended.
    fn republish(&self, mode: RepublishMode) -> BoxFuture<'_, Result<CycleReport, CoreError>>;
}

/// Read-only diagnostics.
pub trait Diagnostics {
    /// Counter values without resetting anything.
    fn counters(&self) -> BoxFuture<'_, CounterSnapshot>;
    /// Counter values; resets the windowed counters.
    fn snapshot_counters(&self) -> BoxFuture<'_, CounterSnapshot>;
    /// Per-resource status in catalog order.
    fn resource_status(&self) -> BoxFuture<'_, Vec<ResourceStatus>>;
    /// True after a panic-level drift.
    fn is_shutdown(&self) -> BoxFuture<'_, bool>;
}

struct Running {
    commands: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// # Psych Provider
pub struct PsychProvider {
    config: Arc<PsychConfig>,
    catalog: Arc<ResourceCatalog>,
    transport: Arc<dyn FeedTransport>,
    publisher: Arc<dyn Publisher>,
    state: SharedState,
    timer: bool,
    running: Mutex<Option<Running>>,
}

impl PsychProvider {
    /// # New
    ///
    /// Validates `config`, loads the catalog from its resources and wires the
    /// given transport and publisher. Nothing runs until [`Lifecycle::start`].
    pub fn new(
        config: PsychConfig,
        transport: Arc<dyn FeedTransport>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let catalog = Arc::new(ResourceCatalog::new());
        catalog.load(ResourceDefinition::all_from_config(&config)?)?;

        Ok(Self {
            config: Arc::new(config),
            catalog,
            transport,
            publisher,
            state: shared_state(Utc::now()),
            timer: true,
            running: Mutex::new(None),
        })
    }

    /// A provider on the production HTTP transport.
    pub fn with_http(config: PsychConfig, publisher: Arc<dyn Publisher>) -> Result<Self, CoreError> {
        let transport = HttpFeedClient::new(&TransportOptions::from_config(&config))?;
        Self::new(config, Arc::new(transport), publisher)
    }

    /// Runs without the interval timer; cycles start only on republish.
    pub fn without_timer(mut self) -> Self {
        self.timer = false;
        self
    }

    /// The configuration in force.
    pub fn config(&self) -> &PsychConfig {
        &self.config
    }

    /// The current catalog snapshot.
    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.snapshot()
    }

    /// # Reload
    ///
    /// Swaps the catalog. Cycles already running keep their old definition;
    /// streams of resources that left the catalog are withdrawn. Returns the
    /// new snapshot.
    pub async fn reload(&self, definitions: Vec<ResourceDefinition>) -> Result<Arc<CatalogSnapshot>, CoreError> {
        let snapshot = self.catalog.load(definitions)?;
        let Ok(commands) = self.commands() else {
            return Ok(snapshot);
        };

        let (tx, rx) = oneshot::channel();
        commands
            .send(WorkerCommand::Reload {
                snapshot: Arc::clone(&snapshot),
                responder: tx,
            })
            .await
            .map_err(|_| CoreError::WorkerGone)?;
        let withdrawn = rx.await.map_err(|_| CoreError::WorkerGone)?;
        log::info!("Reload withdrew {} streams", withdrawn);
        Ok(snapshot)
    }

    fn commands(&self) -> Result<mpsc::Sender<WorkerCommand>, CoreError> {
        self.running
            .lock()
            .expect("Provider lock poisoned")
            .as_ref()
            .map(|running| running.commands.clone())
            .ok_or(CoreError::NotStarted)
    }
}

impl Lifecycle for PsychProvider {
    fn start(&self) -> Result<(), CoreError> {
        let mut running = self.running.lock().expect("Provider lock poisoned");
        if running.is_some() {
            return Err(CoreError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        let scheduler = if self.timer {
            Some(Scheduler::new(&self.config, tx.clone(), cancel.clone())?)
        } else {
            None
        };
        let mut tasks = Vec::with_capacity(2);

        let worker = PollingWorker::new(
            PollSettings::from_config(&self.config),
            Arc::clone(&self.transport),
            Arc::clone(&self.publisher),
            Arc::clone(&self.state),
            self.catalog.snapshot(),
            rx,
            cancel.clone(),
        );
        tasks.push(tokio::spawn(worker.run()));

        if let Some(scheduler) = scheduler {
            tasks.push(tokio::spawn(scheduler.run()));
        }

        log::info!(
            "Provider {} started with {} resources",
            self.config.service_name,
            self.catalog.snapshot().len()
        );
        *running = Some(Running {
            commands: tx,
            cancel,
            tasks,
        });
        Ok(())
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let running = self.running.lock().expect("Provider lock poisoned").take();
            let Some(running) = running else {
                return;
            };
            running.cancel.cancel();
            drop(running.commands);
            for task in running.tasks {
                if let Err(e) = task.await {
                    log::error!("Provider task ended abnormally: {}", e);
                }
            }
            log::info!("Provider {} stopped", self.config.service_name);
        })
    }
}

impl Republish for PsychProvider {
    fn republish(&self, mode: RepublishMode) -> BoxFuture<'_, Result<CycleReport, CoreError>> {
        Box::pin(async move {
            let commands = self.commands()?;
            if self.state.read().await.shutdown {
                return Err(CoreError::Shutdown);
            }

            let (tx, rx) = oneshot::channel();
            commands
                .send(WorkerCommand::Republish { mode, responder: tx })
                .await
                .map_err(|_| CoreError::WorkerGone)?;

            match tokio::time::timeout(self.config.request_timeout(), rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CoreError::WorkerGone),
                Err(_) => {
                    log::warn!("Republish {:?} still running after {:?}", mode, self.config.request_timeout());
                    Err(CoreError::Timeout)
                }
            }
        })
    }
}

impl Diagnostics for PsychProvider {
    fn counters(&self) -> BoxFuture<'_, CounterSnapshot> {
        Box::pin(async move { self.state.read().await.counters.view(Utc::now()) })
    }

    fn snapshot_counters(&self) -> BoxFuture<'_, CounterSnapshot> {
        Box::pin(async move { self.state.write().await.counters.snapshot(Utc::now()) })
    }

    fn resource_status(&self) -> BoxFuture<'_, Vec<ResourceStatus>> {
        Box::pin(async move {
            let snapshot = self.catalog.snapshot();
            let state = self.state.read().await;
            snapshot
                .iter()
                .map(|definition| {
                    let resource = state.resources.get(&definition.name).cloned().unwrap_or_default();
                    ResourceStatus {
                        name: definition.name.clone(),
                        url: definition.url.to_string(),
                        phase: resource.phase,
                        cycle: resource.cycle,
                        attempts: resource.attempts,
                        mode: resource.mode,
                        cycle_started_at: resource.cycle_started_at,
                        last_completed_at: resource.last_completed_at,
                        last_outcome: resource.last_outcome,
                        last_modified: resource.last_modified,
                        last_error: resource.last_error,
                        streams: state.streams.for_resource(&definition.name).count(),
                    }
                })
                .collect()
        })
    }

    fn is_shutdown(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.state.read().await.shutdown })
    }
}
