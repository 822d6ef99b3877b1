//! Periodic polling of every worker.
//!
//! Each tick spawns one task per worker that is not already being polled.
//! A cycle runs on the blocking pool: fetch, parse, reconcile, sweep
//! benchmarks, determine status, publish the new view.

use crate::aggregator::{BenchmarkSweep, DisplayedUnit, Reconciliation, reconcile};
use crate::benchmarks::{BenchmarkKey, BenchmarkStore};
use crate::events::{EventBus, WORKER_POLLED, WORKER_STATUS_UNKNOWN};
use crate::history::CompletedUnitHistory;
use crate::status::{StatusDecision, StatusSnapshot, determine_status, frame_time};
use crate::transport::{FileFetcher, WorkerFiles, fetch_files};
use crate::worker::{DisplayedUnits, WorkerRegistry, WorkerState, WorkerView};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use foldwatch_common::config::{FrameTimeMethod, GeneralConfig};
use foldwatch_common::types::{ClientStatus, WorkerName};
use foldwatch_parse::{LogScan, QueueSnapshot, UnitInfo, decode_queue, parse_log_bytes, parse_unit_info};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Settings applied to every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub allow_running_async: bool,
    pub frame_time_method: FrameTimeMethod,
    /// This host's offset from UTC.
    pub utc_offset: ChronoDuration,
}

impl PollSettings {
    pub fn from_config(general: &GeneralConfig) -> Self {
        Self {
            allow_running_async: general.allow_running_async,
            frame_time_method: general.frame_time_method,
            utc_offset: local_utc_offset(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            allow_running_async: true,
            frame_time_method: FrameTimeMethod::default(),
            utc_offset: ChronoDuration::zero(),
        }
    }
}

pub fn local_utc_offset() -> ChronoDuration {
    ChronoDuration::seconds(i64::from(Local::now().offset().local_minus_utc()))
}

/// Everything a poll cycle needs besides the worker itself.
pub struct PollContext {
    pub fetcher: Arc<dyn FileFetcher>,
    pub benchmarks: Arc<BenchmarkStore>,
    pub history: Arc<CompletedUnitHistory>,
    pub events: EventBus,
    pub settings: PollSettings,
    /// Where the benchmark store is saved after each cycle.
    pub benchmarks_path: Option<PathBuf>,
    pub displayed: DisplayedUnits,
    save_lock: Mutex<()>,
}

impl PollContext {
    pub fn new(
        fetcher: Arc<dyn FileFetcher>,
        benchmarks: Arc<BenchmarkStore>,
        history: Arc<CompletedUnitHistory>,
        events: EventBus,
        settings: PollSettings,
    ) -> Self {
        Self {
            fetcher,
            benchmarks,
            history,
            events,
            settings,
            benchmarks_path: None,
            displayed: DisplayedUnits::default(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn with_displayed_units(mut self, displayed: DisplayedUnits) -> Self {
        self.displayed = displayed;
        self
    }

    pub fn with_benchmarks_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.benchmarks_path = Some(path.into());
        self
    }

    fn save_benchmarks(&self) {
        let Some(path) = self.benchmarks_path.as_deref() else {
            return;
        };
        let _lock = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.benchmarks.save_to_file(path) {
            warn!(error = %e, "Failed to save benchmarks");
        }
    }
}

/// Payload of [`WORKER_POLLED`] and [`WORKER_STATUS_UNKNOWN`].
#[derive(Debug, Clone, Serialize)]
pub struct PolledEvent<'a> {
    pub worker: &'a WorkerName,
    pub status: ClientStatus,
    pub previous_status: ClientStatus,
    pub changed: bool,
    pub unit: Option<String>,
    pub progress_percent: Option<u32>,
    pub frame_time_secs: u64,
    pub error: Option<&'a str>,
}

impl<'a> PolledEvent<'a> {
    fn new(view: &'a WorkerView, previous_status: ClientStatus) -> Self {
        Self {
            worker: &view.name,
            status: view.status,
            previous_status,
            changed: view.status != previous_status,
            unit: view
                .current_unit()
                .and_then(|unit| unit.identity)
                .map(|identity| identity.tag()),
            progress_percent: view.progress_percent,
            frame_time_secs: view.frame_time_secs,
            error: view.error.as_deref(),
        }
    }
}

/// How a poll request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(ClientStatus),
    /// Another poll of the same worker was still running.
    Skipped,
    /// The cycle panicked or was cancelled.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
        }
    }
}

/// Drives poll cycles for all registered workers.
pub struct Poller {
    registry: Arc<WorkerRegistry>,
    context: Arc<PollContext>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(registry: Arc<WorkerRegistry>, context: Arc<PollContext>, config: PollerConfig) -> Self {
        Self {
            registry,
            context,
            config,
        }
    }

    /// Poll every worker on each tick, forever.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let spawned = self.poll_once().len();
                debug!(workers = spawned, "Poll tick");
            }
        })
    }

    /// Spawn one poll per worker that is not already being polled.
    pub fn poll_once(&self) -> Vec<JoinHandle<PollOutcome>> {
        self.registry
            .all()
            .iter()
            .filter(|worker| !worker.is_polling())
            .map(|worker| tokio::spawn(poll_worker(Arc::clone(worker), Arc::clone(&self.context))))
            .collect()
    }

    /// Poll every worker once and wait for all of them.
    pub async fn poll_all(&self) -> Vec<PollOutcome> {
        let mut outcomes = Vec::with_capacity(self.registry.len());
        for task in self.poll_once() {
            outcomes.push(task.await.unwrap_or(PollOutcome::Failed));
        }
        outcomes
    }
}

/// Poll one worker unless a poll of it is already in flight.
pub async fn poll_worker(worker: Arc<WorkerState>, context: Arc<PollContext>) -> PollOutcome {
    let Some(guard) = worker.try_begin_poll() else {
        debug!(worker = %worker.name(), "Poll already in progress, skipping");
        return PollOutcome::Skipped;
    };

    let result = tokio::task::spawn_blocking(move || {
        let view = run_cycle(guard.worker(), &context, Utc::now());
        drop(guard);
        view.status
    })
    .await;

    match result {
        Ok(status) => PollOutcome::Completed(status),
        Err(e) => {
            warn!(worker = %worker.name(), error = %e, "Poll cycle failed");
            PollOutcome::Failed
        }
    }
}

/// One complete poll cycle with `now` as the retrieval time. Publishes and
/// returns the new view.
pub fn run_cycle(worker: &WorkerState, context: &PollContext, now: DateTime<Utc>) -> WorkerView {
    let previous = worker.view();

    let view = match fetch_files(context.fetcher.as_ref(), &worker.config) {
        Ok(files) => process_files(worker, context, &previous, files, now),
        Err(e) => {
            warn!(worker = %worker.name(), error = %e, "Log retrieval failed, worker offline");
            WorkerView {
                status: ClientStatus::Offline,
                reason: None,
                last_retrieval_time: Some(now),
                error: Some(e.to_string()),
                polls: previous.polls + 1,
                ..previous.clone()
            }
        }
    };

    if view.status != previous.status {
        info!(
            worker = %worker.name(),
            from = %previous.status,
            to = %view.status,
            reason = ?view.reason,
            "Worker status changed"
        );
    }

    worker.set_view(view.clone());
    if let Err(e) = context.displayed.update(worker.name(), view.displayed) {
        warn!(worker = %worker.name(), error = %e, "Failed to save displayed unit");
    }

    let event = PolledEvent::new(&view, previous.status);
    if view.status == ClientStatus::Unknown {
        warn!(worker = %worker.name(), "Worker status could not be determined");
        context.events.emit(WORKER_STATUS_UNKNOWN, &event);
    }
    context.events.emit(WORKER_POLLED, &event);

    view
}

struct ParsedFiles {
    scan: LogScan,
    queue: Option<QueueSnapshot>,
    unit_info: Option<UnitInfo>,
}

fn parse_files(worker: &WorkerState, files: &WorkerFiles, now: DateTime<Utc>) -> ParsedFiles {
    let scan = parse_log_bytes(&files.log);
    let queue = files
        .queue
        .as_deref()
        .and_then(|bytes| match decode_queue(bytes) {
            Ok(queue) => Some(queue),
            Err(e) => {
                debug!(worker = %worker.name(), error = %e, "Queue unusable, reconciling from log");
                None
            }
        });
    let unit_info = files
        .unit_info
        .as_deref()
        .map(|bytes| parse_unit_info(&String::from_utf8_lossy(bytes), now));

    ParsedFiles {
        scan,
        queue,
        unit_info,
    }
}

fn process_files(
    worker: &WorkerState,
    context: &PollContext,
    previous: &WorkerView,
    files: WorkerFiles,
    now: DateTime<Utc>,
) -> WorkerView {
    let config = &worker.config;
    let parsed = parse_files(worker, &files, now);
    let reconciliation = reconcile(&parsed.scan, parsed.queue.as_ref(), parsed.unit_info.as_ref());

    BenchmarkSweep {
        worker: config,
        benchmarks: &context.benchmarks,
        history: &context.history,
        frame_time_method: context.settings.frame_time_method,
    }
    .run(&reconciliation, previous.displayed.as_ref(), now);
    context.save_benchmarks();

    let current = reconciliation.current_unit();
    let displayed = current.and_then(DisplayedUnit::from_record);
    let progress_percent = current.and_then(|unit| {
        parsed
            .unit_info
            .as_ref()
            .filter(|info| info.identity.is_none() || info.identity == unit.identity)
            .and_then(|info| info.progress_percent)
            .or_else(|| unit.last_frame_id())
    });

    let frame_time = current
        .map(|unit| frame_time(&unit.frames, context.settings.frame_time_method))
        .unwrap_or_default();
    let average_frame_time = current
        .and_then(|unit| unit.identity)
        .map(|identity| {
            let key = BenchmarkKey::new(config.name.clone(), &config.path, identity.project);
            context.benchmarks.average_frame_time(&key)
        })
        .unwrap_or_default();

    let progress = track_progress(previous, displayed.as_ref(), progress_percent, now);

    let snapshot = StatusSnapshot {
        previous_status: previous.status,
        returned_status: reconciliation.status,
        last_retrieval_time: now,
        time_of_last_frame: current
            .and_then(|unit| unit.last_frame().map(|frame| frame.time_of_day).or(unit.unit_start)),
        time_of_last_unit_start: progress.unit_start,
        time_of_last_frame_progress: progress.frame_progress,
        client_time_offset: config.client_time_offset(),
        utc_offset: context.settings.utc_offset,
        ignore_utc_offset: config.ignore_utc_offset,
        frame_time,
        average_frame_time,
        worker_kind: config.kind,
        allow_running_async: context.settings.allow_running_async,
    };
    let decision = determine_status(&snapshot);

    build_view(
        previous,
        reconciliation,
        &parsed.scan,
        decision,
        ViewFields {
            now,
            displayed,
            progress_percent,
            frame_time,
            average_frame_time,
            progress,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    unit_start: Option<DateTime<Utc>>,
    frame_progress: Option<DateTime<Utc>>,
}

/// Update the last-progress moments. Nothing is inferred on the first poll.
fn track_progress(
    previous: &WorkerView,
    displayed: Option<&DisplayedUnit>,
    progress_percent: Option<u32>,
    now: DateTime<Utc>,
) -> Progress {
    let mut progress = Progress {
        unit_start: previous.time_of_last_unit_start,
        frame_progress: previous.time_of_last_frame_progress,
    };
    if previous.polls == 0 {
        return progress;
    }

    match (previous.displayed.as_ref(), displayed) {
        (Some(before), Some(after)) if before.is_same_unit(after) => {
            if progress_percent > previous.progress_percent {
                progress.frame_progress = Some(now);
            }
        }
        (_, Some(_)) => {
            progress.unit_start = Some(now);
            progress.frame_progress = Some(now);
        }
        _ => {}
    }
    progress
}

struct ViewFields {
    now: DateTime<Utc>,
    displayed: Option<DisplayedUnit>,
    progress_percent: Option<u32>,
    frame_time: Duration,
    average_frame_time: Duration,
    progress: Progress,
}

fn build_view(
    previous: &WorkerView,
    reconciliation: Reconciliation,
    scan: &LogScan,
    decision: StatusDecision,
    fields: ViewFields,
) -> WorkerView {
    let run = scan.current_run();
    WorkerView {
        name: previous.name.clone(),
        status: decision.status,
        reason: Some(decision.reason),
        last_retrieval_time: Some(fields.now),
        queue_present: reconciliation.queue_present,
        current_index: reconciliation.current_index,
        units: reconciliation.units,
        displayed: fields.displayed,
        progress_percent: fields.progress_percent,
        frame_time_secs: fields.frame_time.as_secs(),
        average_frame_time_secs: fields.average_frame_time.as_secs(),
        time_of_last_unit_start: fields.progress.unit_start,
        time_of_last_frame_progress: fields.progress.frame_progress,
        completed_units: run.map_or(0, |run| run.completed_units),
        failed_units: run.map_or(0, |run| run.failed_units),
        total_completed_units: run.and_then(|run| run.total_completed_units),
        client_version: run.and_then(|run| run.client_version.clone()),
        error: None,
        polls: previous.polls + 1,
    }
}
