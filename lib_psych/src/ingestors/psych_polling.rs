//! # Sentiment Feed Polling Worker
//!
//! A single task that owns every HTTP transfer of the provider. Triggers
//! (scheduler ticks, manual republish requests, catalog reloads) arrive over
//! one command channel; transfers are futures held in a `FuturesUnordered`,
//! so any number of resources are in flight at once and the worker never
//! waits on one of them.
//!
//! ## Key Design Principles:
//! - **One Connection per Resource**: a resource whose cycle is still running
//!   is skipped by the next trigger. Skips of cycles outstanding longer than
//!   the tolerable delay are counted as late.
//! - **Cycle Ids**: every attempt carries the id of the cycle it belongs to.
//!   Ids come from one worker-wide counter. A completion whose cycle is no
//!   longer live is discarded unread.
//! - **Retirement**: a resource dropped by a reload has its transfer aborted
//!   and reaped before the reload is answered.
//! - **Synchronous Commit**: parsing, drift checks and mapping run inline on
//!   completion, under the write lock of the shared state.
//! - **Panic Shutdown**: a clock offset at or past the panic threshold marks
//!   the core shut down. Ticks and republish requests are refused from then
//!   on; transfers already running are allowed to finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{AbortHandle, Abortable, Aborted, BoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::configs::PsychConfig;
use crate::core::catalog::{CatalogSnapshot, ResourceDefinition};
use crate::core::counters::{CounterKind, Counters};
use crate::core::dispatcher::Publisher;
use crate::core::mapper::{PublicationMapper, StreamTable};
use crate::core::policy::{CycleOutcome, RetryPolicy, Verdict};
use crate::core::provider::{CoreError, CycleReport, RepublishMode};
use crate::core::state::{PipelineState, SharedState};
use crate::markets::psych::parse_feed;
use crate::retrieve::{FeedTransport, FetchMode, FetchRequest, FetchResponse, TransportError};

/// Requests the worker accepts.
#[derive(Debug)]
pub enum WorkerCommand {
    /// A scheduler fire for the grid point `due`.
    Tick {
        /// Grid point the timer was set for.
        due: DateTime<Utc>,
    },
    /// A manual republish; answered once every cycle it started has ended.
    Republish {
        /// Soft (conditional) or hard (full) fetch.
        mode: RepublishMode,
        /// Where the report goes.
        responder: oneshot::Sender<Result<CycleReport, CoreError>>,
    },
    /// A new catalog snapshot.
    Reload {
        /// The snapshot now in force.
        snapshot: Arc<CatalogSnapshot>,
        /// Receives the number of streams withdrawn.
        responder: oneshot::Sender<usize>,
    },
}

/// Worker settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Retry rules.
    pub policy: RetryPolicy,
    /// How long a cycle may stay outstanding before a skip counts as late.
    pub tolerable_delay: Duration,
    /// Bound on one attempt, and on the shutdown drain.
    pub request_timeout: Duration,
    /// Smallest acceptable body.
    pub minimum_response_size: usize,
    /// Required `Content-Type` prefix.
    pub expected_content_type: Option<String>,
    /// Drift above this many seconds is counted.
    pub drift_tolerance: i64,
    /// Drift at or above this many seconds shuts the core down; 0 disables.
    pub panic_threshold: i64,
    /// Service id for entitlement locks.
    pub service_id: u32,
}

impl PollSettings {
    /// Settings of a configuration.
    pub fn from_config(config: &PsychConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            tolerable_delay: config.tolerable_delay(),
            request_timeout: config.request_timeout(),
            minimum_response_size: config.minimum_response_size,
            expected_content_type: config.expected_content_type.clone(),
            drift_tolerance: i64::try_from(config.drift_tolerance).unwrap_or(i64::MAX),
            panic_threshold: i64::try_from(config.panic_threshold).unwrap_or(i64::MAX),
            service_id: config.entitlement_service_id,
        }
    }
}

// One finished attempt, successful or not.
struct Completion {
    definition: Arc<ResourceDefinition>,
    cycle: u64,
    attempt: u32,
    mode: FetchMode,
    if_modified_since: Option<DateTime<Utc>>,
    requested_at: DateTime<Utc>,
    result: Result<FetchResponse, TransportError>,
}

// How a transfer left the in-flight set.
enum Landed {
    Completed(Completion),
    Aborted(String),
}

// A manual republish waiting for its cycles.
struct PendingReport {
    report: CycleReport,
    waiting: BTreeMap<String, u64>,
    responder: oneshot::Sender<Result<CycleReport, CoreError>>,
}

// What a completed attempt amounts to.
enum Evaluation {
    Done(CycleOutcome),
    Failed(String),
    Panic(String),
}

/// # Polling Worker
pub struct PollingWorker {
    settings: PollSettings,
    mapper: PublicationMapper,
    transport: Arc<dyn FeedTransport>,
    publisher: Arc<dyn Publisher>,
    state: SharedState,
    snapshot: Arc<CatalogSnapshot>,
    commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
    in_flight: FuturesUnordered<BoxFuture<'static, Landed>>,
    transfers: BTreeMap<String, (u64, AbortHandle)>,
    next_cycle: u64,
    pending: Vec<PendingReport>,
    stopping: bool,
    started: Instant,
}

impl PollingWorker {
    /// A worker polling the resources of `snapshot`.
    pub fn new(
        settings: PollSettings,
        transport: Arc<dyn FeedTransport>,
        publisher: Arc<dyn Publisher>,
        state: SharedState,
        snapshot: Arc<CatalogSnapshot>,
        commands: mpsc::Receiver<WorkerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mapper: PublicationMapper::new(settings.service_id),
            settings,
            transport,
            publisher,
            state,
            snapshot,
            commands,
            cancel,
            in_flight: FuturesUnordered::new(),
            transfers: BTreeMap::new(),
            next_cycle: 0,
            pending: Vec::new(),
            stopping: false,
            started: Instant::now(),
        }
    }

    /// # Main Execution Loop
    ///
    /// ## Workflow:
    /// 1.  **Wait**: on the next command, the next finished transfer, or
    ///     cancellation, whichever comes first.
    /// 2.  **Command**: start cycles for a tick or republish, or swap the
    ///     catalog. Starting a cycle only pushes a future; nothing is awaited.
    /// 3.  **Completion**: classify the response, then commit, retry or
    ///     abandon the cycle.
    /// 4.  **Drain**: after cancellation, let running transfers finish for at
    ///     most one request timeout, then log a runtime summary.
    pub async fn run(mut self) {
        log::info!(
            "Polling worker started with {} resources (catalog generation {})",
            self.snapshot.len(),
            self.snapshot.generation()
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(landed) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_landed(landed).await;
                }
            }
        }

        self.drain().await;
        log_summary(&self.state, self.started).await;
    }

    async fn on_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Tick { due } => self.on_tick(due).await,
            WorkerCommand::Republish { mode, responder } => self.on_republish(mode, responder).await,
            WorkerCommand::Reload { snapshot, responder } => {
                let withdrawn = self.on_reload(snapshot).await;
                let _ = responder.send(withdrawn);
            }
        }
    }

    // --- Triggers ---

    async fn on_tick(&mut self, due: DateTime<Utc>) {
        let state = Arc::clone(&self.state);
        let mut guard = state.write().await;
        if guard.shutdown {
            log::debug!("Ignoring tick for {}: core is shut down", due);
            return;
        }
        guard.counters.increment(CounterKind::TimerQueries);

        let (started, skipped) = self.start_cycles(&mut guard, FetchMode::Conditional);
        log::info!(
            "Tick {}: started {} cycles, skipped {}",
            due,
            started.len(),
            skipped.len()
        );
    }

    async fn on_republish(
        &mut self,
        mode: RepublishMode,
        responder: oneshot::Sender<Result<CycleReport, CoreError>>,
    ) {
        let state = Arc::clone(&self.state);
        let mut guard = state.write().await;
        if guard.shutdown {
            let _ = responder.send(Err(CoreError::Shutdown));
            return;
        }
        guard.counters.increment(CounterKind::ManualQueries);

        let (started, skipped) = self.start_cycles(&mut guard, mode.fetch_mode());
        log::info!(
            "Manual {:?} republish: started {} cycles, skipped {}",
            mode,
            started.len(),
            skipped.len()
        );

        let report = CycleReport {
            mode,
            started: started.keys().cloned().collect(),
            skipped,
            outcomes: BTreeMap::new(),
        };
        if started.is_empty() {
            let _ = responder.send(Ok(report));
        } else {
            self.pending.push(PendingReport {
                report,
                waiting: started,
                responder,
            });
        }
    }

    // Starts a cycle for every idle resource of the catalog. Busy resources
    // are skipped, and counted late when outstanding past the tolerable delay.
    fn start_cycles(&mut self, state: &mut PipelineState, mode: FetchMode) -> (BTreeMap<String, u64>, Vec<String>) {
        let now = Instant::now();
        let wall = Utc::now();
        let mut started = BTreeMap::new();
        let mut skipped = Vec::new();

        let PipelineState { resources, counters, .. } = state;
        let snapshot = Arc::clone(&self.snapshot);
        for definition in snapshot.iter() {
            let resource = resources.entry(definition.name.clone()).or_default();
            if resource.is_busy() {
                let outstanding = resource.outstanding(now).unwrap_or_default();
                if outstanding > self.settings.tolerable_delay {
                    counters.increment(CounterKind::LateCycles);
                    log::warn!(
                        "{} still outstanding after {}ms, skipping this cycle",
                        definition.name,
                        outstanding.as_millis()
                    );
                } else {
                    log::debug!("{} busy, skipping this cycle", definition.name);
                }
                skipped.push(definition.name.clone());
                continue;
            }

            self.next_cycle += 1;
            let cycle = resource.begin_cycle(self.next_cycle, mode, now, wall);
            resource.attempts = 1;
            let if_modified_since = match mode {
                FetchMode::Conditional => resource.last_modified,
                FetchMode::Full => None,
            };
            self.launch(Arc::clone(definition), cycle, 1, mode, Duration::ZERO, if_modified_since);
            started.insert(definition.name.clone(), cycle);
        }
        (started, skipped)
    }

    async fn on_reload(&mut self, snapshot: Arc<CatalogSnapshot>) -> usize {
        let state = Arc::clone(&self.state);
        let mut aborted = 0;
        let mut withdrawn = 0;
        let retired: Vec<String> = {
            let mut guard = state.write().await;
            let PipelineState { resources, streams, .. } = &mut *guard;

            let retired: Vec<String> = resources
                .keys()
                .filter(|name| snapshot.get(name).is_none())
                .cloned()
                .collect();
            for name in &retired {
                resources.remove(name);
                if let Some((cycle, handle)) = self.transfers.remove(name) {
                    log::info!("Aborting {} cycle {}", name, cycle);
                    handle.abort();
                    aborted += 1;
                }
                withdrawn += streams.remove_resource(name, self.publisher.as_ref());
                self.settle_pending(name, None, CycleOutcome::Cancelled);
                log::info!("Resource {} retired", name);
            }
            retired
        };

        // Aborted transfers resolve on their next poll; completions that land
        // meanwhile are committed as usual.
        while aborted > 0 {
            match self.in_flight.next().await {
                Some(Landed::Aborted(_)) => aborted -= 1,
                Some(Landed::Completed(completion)) => self.on_completion(completion).await,
                None => break,
            }
        }

        log::info!(
            "Catalog generation {} in force: {} resources, {} retired, {} streams withdrawn",
            snapshot.generation(),
            snapshot.len(),
            retired.len(),
            withdrawn
        );
        self.snapshot = snapshot;
        withdrawn
    }

    // --- Transfers ---

    fn launch(
        &mut self,
        definition: Arc<ResourceDefinition>,
        cycle: u64,
        attempt: u32,
        mode: FetchMode,
        delay: Duration,
        if_modified_since: Option<DateTime<Utc>>,
    ) {
        let transport = Arc::clone(&self.transport);
        let timeout = self.settings.request_timeout;
        let request = FetchRequest {
            resource: definition.name.clone(),
            url: definition.url.clone(),
            mode,
            if_modified_since,
        };

        log::debug!(
            "{} cycle {} attempt {} ({:?}) in {}ms",
            definition.name,
            cycle,
            attempt,
            mode,
            delay.as_millis()
        );

        let (handle, registration) = AbortHandle::new_pair();
        self.transfers.insert(definition.name.clone(), (cycle, handle));
        let resource = definition.name.clone();
        let transfer = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let requested_at = Utc::now();
            let result = match tokio::time::timeout(timeout, transport.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            Completion {
                definition,
                cycle,
                attempt,
                mode,
                if_modified_since,
                requested_at,
                result,
            }
        };
        let transfer = Abortable::new(transfer, registration);
        self.in_flight.push(Box::pin(async move {
            match transfer.await {
                Ok(completion) => Landed::Completed(completion),
                Err(Aborted) => Landed::Aborted(resource),
            }
        }));
    }

    async fn on_landed(&mut self, landed: Landed) {
        match landed {
            Landed::Completed(completion) => self.on_completion(completion).await,
            Landed::Aborted(name) => log::debug!("Reaped aborted transfer of {}", name),
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        let name = completion.definition.name.clone();
        if self
            .transfers
            .get(&name)
            .is_some_and(|(cycle, _)| *cycle == completion.cycle)
        {
            self.transfers.remove(&name);
        }

        let state = Arc::clone(&self.state);
        let mut guard = state.write().await;
        let PipelineState {
            resources,
            streams,
            counters,
            shutdown,
        } = &mut *guard;

        let Some(resource) = resources.get_mut(&name).filter(|r| r.accepts(completion.cycle)) else {
            log::debug!("Discarding late response for {} cycle {}", name, completion.cycle);
            return;
        };
        counters.increment(CounterKind::RequestsSent);

        // --- Phase 1: Classify ---
        let evaluation = match completion.result {
            Err(ref e) => Evaluation::Failed(e.to_string()),
            Ok(ref response) => self.evaluate(counters, streams, &completion, response),
        };

        // --- Phase 2: Commit, Retry or Abandon ---
        let now = Utc::now();
        match evaluation {
            Evaluation::Done(outcome) => {
                if outcome == CycleOutcome::Updated {
                    if let Ok(FetchResponse {
                        last_modified: Some(modified),
                        ..
                    }) = &completion.result
                    {
                        resource.last_modified = Some(*modified);
                    }
                }
                log::info!(
                    "{} cycle {} finished after {} attempts: {:?}",
                    name,
                    completion.cycle,
                    completion.attempt,
                    outcome
                );
                resource.complete(outcome, now);
                self.settle_pending(&name, Some(completion.cycle), outcome);
            }
            Evaluation::Panic(reason) => {
                log::error!("{}: {}. Shutting the core down.", name, reason);
                *shutdown = true;
                resource.last_error = Some(reason);
                resource.complete(CycleOutcome::Cancelled, now);
                self.settle_pending(&name, Some(completion.cycle), CycleOutcome::Cancelled);
            }
            Evaluation::Failed(reason) => {
                log::warn!(
                    "{} cycle {} attempt {} failed: {}",
                    name,
                    completion.cycle,
                    completion.attempt,
                    reason
                );
                let verdict = resource.record_failure(&self.settings.policy, reason, Instant::now());
                if *shutdown || self.stopping {
                    resource.complete(CycleOutcome::Cancelled, now);
                    self.settle_pending(&name, Some(completion.cycle), CycleOutcome::Cancelled);
                    return;
                }
                match verdict {
                    Verdict::Retry { delay } => {
                        resource.attempts += 1;
                        let attempt = resource.attempts;
                        self.launch(
                            Arc::clone(&completion.definition),
                            completion.cycle,
                            attempt,
                            completion.mode,
                            delay,
                            completion.if_modified_since,
                        );
                    }
                    Verdict::Abandon => {
                        counters.increment(CounterKind::RetriesExceeded);
                        log::error!(
                            "{} cycle {} abandoned after {} attempts",
                            name,
                            completion.cycle,
                            completion.attempt
                        );
                        resource.complete(CycleOutcome::Abandoned, now);
                        self.settle_pending(&name, Some(completion.cycle), CycleOutcome::Abandoned);
                    }
                }
            }
        }
    }

    // Status, content, drift, parse, then map. Counts every outcome on the way.
    fn evaluate(
        &self,
        counters: &mut Counters,
        streams: &mut StreamTable,
        completion: &Completion,
        response: &FetchResponse,
    ) -> Evaluation {
        let name = &completion.definition.name;

        // --- Status ---
        if let Some(class) = CounterKind::status_class(response.status) {
            counters.increment(class);
        }
        match response.status {
            304 => {
                counters.increment(CounterKind::Http304Received);
                return Evaluation::Done(CycleOutcome::NotModified);
            }
            200 => counters.increment(CounterKind::Http200Received),
            other => return Evaluation::Failed(format!("HTTP status {}", other)),
        }

        // --- Content ---
        if let Some(expected) = &self.settings.expected_content_type {
            let matches = response
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.to_ascii_lowercase().starts_with(&expected.to_ascii_lowercase()));
            if !matches {
                counters.increment(CounterKind::Malformed);
                return Evaluation::Failed(format!(
                    "content type {:?}, expected {}",
                    response.content_type, expected
                ));
            }
        }
        if response.body.len() < self.settings.minimum_response_size {
            counters.increment(CounterKind::Malformed);
            return Evaluation::Failed(format!(
                "{} byte body is under the {} byte minimum",
                response.body.len(),
                self.settings.minimum_response_size
            ));
        }
        let Ok(body) = std::str::from_utf8(&response.body) else {
            counters.increment(CounterKind::Malformed);
            return Evaluation::Failed("body is not UTF-8".to_string());
        };

        // --- Parse ---
        let feed = match parse_feed(body) {
            Ok(feed) => feed,
            Err(e) => {
                counters.increment(CounterKind::Malformed);
                return Evaluation::Failed(e.to_string());
            }
        };
        if feed.malformed_rows > 0 {
            log::warn!("{}: dropped {} malformed rows", name, feed.malformed_rows);
            counters.add(CounterKind::Malformed, feed.malformed_rows as u64);
        }

        // --- Clock Drift ---
        let observed = [
            (CounterKind::WebserverClockDrift, "webserver", response.server_date),
            (CounterKind::FilesystemClockDrift, "filesystem", response.last_modified),
            (CounterKind::FeedClockDrift, "feed", feed.close_time()),
        ];
        for (kind, label, at) in observed {
            let Some(at) = at else { continue };
            let offset = (at - completion.requested_at).num_seconds();
            let gauges = counters.drift_mut();
            match kind {
                CounterKind::WebserverClockDrift => gauges.webserver = Some(offset),
                CounterKind::FilesystemClockDrift => gauges.filesystem = Some(offset),
                _ => gauges.feed = Some(offset),
            }

            if offset.abs() > self.settings.drift_tolerance {
                counters.increment(kind);
                log::warn!("{}: {} clock offset {}s", name, label, offset);
            }
            if self.settings.panic_threshold > 0 && offset.abs() >= self.settings.panic_threshold {
                return Evaluation::Panic(format!(
                    "{} clock offset {}s reached the panic threshold of {}s",
                    label, offset, self.settings.panic_threshold
                ));
            }
        }

        // --- Map ---
        let outcome = self
            .mapper
            .map_feed(streams, &completion.definition, &feed, self.publisher.as_ref());
        if outcome.nacked > 0 {
            counters.add(CounterKind::PublishNacks, outcome.nacked as u64);
        }
        log::info!(
            "{}: {} rows, {} published, {} refused, {} unmapped, {} withdrawn",
            name,
            feed.rows.len(),
            outcome.published,
            outcome.nacked,
            outcome.unmapped,
            outcome.withdrawn
        );
        Evaluation::Done(CycleOutcome::Updated)
    }

    // Records `outcome` in every pending republish waiting on `name`, and
    // answers the ones that have nothing left to wait for. A `None` cycle
    // matches any.
    fn settle_pending(&mut self, name: &str, cycle: Option<u64>, outcome: CycleOutcome) {
        let mut i = 0;
        while i < self.pending.len() {
            let entry = &mut self.pending[i];
            let matches = entry
                .waiting
                .get(name)
                .is_some_and(|waiting| cycle.map_or(true, |c| c == *waiting));
            if matches {
                entry.waiting.remove(name);
                entry.report.outcomes.insert(name.to_string(), outcome);
            }

            if entry.waiting.is_empty() || entry.responder.is_closed() {
                let done = self.pending.swap_remove(i);
                let _ = done.responder.send(Ok(done.report));
            } else {
                i += 1;
            }
        }
    }

    // --- Shutdown ---

    async fn drain(&mut self) {
        self.stopping = true;
        if self.in_flight.is_empty() {
            return;
        }
        log::info!("Draining {} transfers", self.in_flight.len());

        let timeout = self.settings.request_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(landed) = self.in_flight.next().await {
                self.on_landed(landed).await;
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Dropping {} transfers still running after {:?}", self.in_flight.len(), timeout);
        }
    }
}

async fn log_summary(state: &SharedState, started: Instant) {
    let state = state.read().await;
    let c = &state.counters;
    log::info!(
        "Polling worker stopped after {:?}: {} timer and {} manual queries, {} requests, {} x 200, {} x 304, {} malformed, {} retries exceeded, {} late, {} nacks",
        started.elapsed(),
        c.cumulative(CounterKind::TimerQueries),
        c.cumulative(CounterKind::ManualQueries),
        c.cumulative(CounterKind::RequestsSent),
        c.cumulative(CounterKind::Http200Received),
        c.cumulative(CounterKind::Http304Received),
        c.cumulative(CounterKind::Malformed),
        c.cumulative(CounterKind::RetriesExceeded),
        c.cumulative(CounterKind::LateCycles),
        c.cumulative(CounterKind::PublishNacks),
    );
}
