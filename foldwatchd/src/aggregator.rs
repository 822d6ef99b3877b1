//! Reconciliation of queue, log and unit-info data into per-slot unit
//! records, and the benchmark sweep that feeds frame times from them.
//!
//! The queue is authoritative for which units exist and when they were
//! downloaded; the log supplies frames, results and status; the unit-info
//! file fills in the protein name and dates of the active unit. A slot whose
//! queue identity disagrees with everything the log says is dropped.

use crate::benchmarks::{BenchmarkKey, BenchmarkStore};
use crate::history::{CompletedUnit, CompletedUnitHistory};
use crate::status::frame_time;
use chrono::{DateTime, NaiveTime, Utc};
use foldwatch_common::config::{FrameTimeMethod, WorkerConfig};
use foldwatch_common::ring::RingIter;
use foldwatch_common::types::{ClientStatus, UnitIdentity, UnitResult};
use foldwatch_parse::{
    ClientRun, LogLine, LogScan, QueueSlot, QueueSlotStatus, QueueSnapshot, UnitFrame, UnitInfo,
    UnitLog,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Frame id of the last frame of a unit.
pub const FINAL_FRAME_ID: u32 = 100;

/// Slot the current unit occupies when there is no queue.
const LOG_ONLY_CURRENT_INDEX: usize = 1;

/// Canonical view of one work unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitRecord {
    /// Queue slot, or position (0 previous, 1 current) without a queue.
    pub queue_index: usize,
    pub slot_status: Option<QueueSlotStatus>,
    pub identity: Option<UnitIdentity>,
    pub download_time: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    /// Time of day (log time) the unit's first line was written.
    pub unit_start: Option<NaiveTime>,
    pub frames: BTreeMap<u32, UnitFrame>,
    pub core_version: Option<String>,
    pub core_number: Option<String>,
    pub protein_name: Option<String>,
    pub tag: Option<String>,
    pub user_name: Option<String>,
    pub team: Option<u32>,
    pub user_id: Option<String>,
    pub machine_id: Option<u32>,
    pub result: UnitResult,
    pub status: ClientStatus,
}

impl UnitRecord {
    pub fn empty(queue_index: usize) -> Self {
        Self {
            queue_index,
            ..Self::default()
        }
    }

    fn from_slot(slot: &QueueSlot) -> Self {
        let has_unit = slot.status.has_unit();
        let non_empty = |s: &str| {
            let s = s.trim();
            (has_unit && !s.is_empty()).then(|| s.to_string())
        };
        Self {
            queue_index: slot.index,
            slot_status: Some(slot.status),
            identity: slot.unit_identity(),
            download_time: slot.begin_time,
            due_time: slot.due_time,
            finished_time: slot.end_time.filter(|_| slot.status.is_finished()),
            core_number: non_empty(&slot.core_number),
            tag: non_empty(&slot.work_unit_tag),
            user_name: non_empty(&slot.user_name),
            team: has_unit.then_some(slot.team_number),
            user_id: non_empty(&slot.user_id),
            machine_id: has_unit.then_some(slot.machine_id),
            ..Self::default()
        }
    }

    /// Highest logged frame.
    pub fn last_frame(&self) -> Option<&UnitFrame> {
        self.frames.values().next_back()
    }

    pub fn last_frame_id(&self) -> Option<u32> {
        self.last_frame().map(|frame| frame.id)
    }

    /// Whether the final frame was logged.
    pub fn frames_complete(&self) -> bool {
        self.last_frame_id().is_some_and(|id| id >= FINAL_FRAME_ID)
    }

    /// Same unit, same download. A download time missing on either side
    /// matches on identity alone.
    pub fn is_same_unit(
        &self,
        identity: UnitIdentity,
        download_time: Option<DateTime<Utc>>,
    ) -> bool {
        self.identity == Some(identity) && same_download(self.download_time, download_time)
    }

    /// Overlay log-derived fields the queue did not supply.
    fn apply_log(&mut self, log: &UnitLog) {
        if self.identity.is_none() {
            self.identity = log.identity;
        }
        self.frames = log.frames.clone();
        if self.core_version.is_none() {
            self.core_version = log.core_version.clone();
        }
        if self.result == UnitResult::Unknown {
            self.result = log.result;
        }
        if self.unit_start.is_none() {
            self.unit_start = log.unit_start;
        }
        self.status = log.status;
    }

    /// Overlay run metadata (user, team, machine) the queue did not supply.
    fn apply_run(&mut self, run: &ClientRun) {
        if self.user_name.is_none() {
            self.user_name = run.user_name.clone();
        }
        if self.team.is_none() {
            self.team = run.team;
        }
        if self.user_id.is_none() {
            self.user_id = run.user_id.clone();
        }
        if self.machine_id.is_none() {
            self.machine_id = run.machine_id;
        }
    }

    /// Overlay unit-info fields when it describes this unit.
    fn apply_unit_info(&mut self, info: &UnitInfo) {
        match (self.identity, info.identity) {
            (Some(own), Some(theirs)) if own != theirs => return,
            (None, theirs) => self.identity = theirs,
            _ => {}
        }
        if info.protein_name.is_some() {
            self.protein_name = info.protein_name.clone();
        }
        if self.tag.is_none() {
            self.tag = info.tag.clone();
        }
        if self.download_time.is_none() {
            self.download_time = info.download_time;
        }
        if self.due_time.is_none() {
            self.due_time = info.due_time;
        }
    }
}

/// Result of reconciling one poll's inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Ten slots with a queue, `[previous, current]` without.
    pub units: Vec<Option<UnitRecord>>,
    pub current_index: usize,
    /// Status derived from the current run of the log.
    pub status: ClientStatus,
    pub queue_present: bool,
}

impl Reconciliation {
    pub fn current_unit(&self) -> Option<&UnitRecord> {
        self.units.get(self.current_index)?.as_ref()
    }
}

/// Merge the parsed inputs of one poll.
pub fn reconcile(
    scan: &LogScan,
    queue: Option<&QueueSnapshot>,
    unit_info: Option<&UnitInfo>,
) -> Reconciliation {
    let status = scan
        .current_run()
        .map_or(ClientStatus::Unknown, |run| run.status);

    match queue {
        Some(queue) => Reconciliation {
            units: (0..queue.slots.len())
                .map(|index| reconcile_slot(scan, queue, unit_info, index))
                .collect(),
            current_index: queue.active_index(),
            status,
            queue_present: true,
        },
        None => reconcile_log_only(scan, unit_info, status),
    }
}

fn reconcile_slot(
    scan: &LogScan,
    queue: &QueueSnapshot,
    unit_info: Option<&UnitInfo>,
    index: usize,
) -> Option<UnitRecord> {
    let slot = &queue.slots[index];
    let active = index == queue.active_index();

    let (lines, force_match): (Option<&[LogLine]>, bool) =
        match scan.unit_lines_for_queue_index(index) {
            Some(lines) => (Some(lines), false),
            None if active => (
                scan.current_unit_lines()
                    .or_else(|| scan.current_run_lines()),
                true,
            ),
            None => (None, false),
        };
    let log = lines.map(UnitLog::from_lines).unwrap_or_default();

    if force_match && log.status == ClientStatus::GettingWorkPacket {
        debug!(slot = index, "Active slot is fetching a new unit");
        return Some(UnitRecord::empty(index));
    }

    let mut record = UnitRecord::from_slot(slot);
    if record.identity.is_none() {
        record.identity = log.identity;
    }

    let matches_log = record.identity == log.identity;
    let matches_info = active && unit_info.is_some_and(|info| info.identity == record.identity);
    if !(force_match || matches_log || matches_info) {
        trace!(
            slot = index,
            queue = ?record.identity,
            log = ?log.identity,
            "Dropping slot that does not match the log"
        );
        return None;
    }

    record.apply_log(&log);
    if let Some(run) = scan.current_run() {
        record.apply_run(run);
    }
    if active && let Some(info) = unit_info {
        record.apply_unit_info(info);
    }
    Some(record)
}

fn reconcile_log_only(
    scan: &LogScan,
    unit_info: Option<&UnitInfo>,
    status: ClientStatus,
) -> Reconciliation {
    let from_lines = |position: usize, lines: &[LogLine]| {
        let mut record = UnitRecord::empty(position);
        record.apply_log(&UnitLog::from_lines(lines));
        if let Some(run) = scan.current_run() {
            record.apply_run(run);
        }
        record
    };

    let previous = scan
        .previous_unit_lines()
        .map(|lines| from_lines(LOG_ONLY_CURRENT_INDEX - 1, lines));
    let mut current = scan
        .current_unit_lines()
        .or_else(|| scan.current_run_lines())
        .map(|lines| from_lines(LOG_ONLY_CURRENT_INDEX, lines));
    if let (Some(record), Some(info)) = (current.as_mut(), unit_info) {
        record.apply_unit_info(info);
    }

    Reconciliation {
        units: vec![previous, current],
        current_index: LOG_ONLY_CURRENT_INDEX,
        status,
        queue_present: false,
    }
}

/// The unit shown after the previous poll; its frames were already counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayedUnit {
    pub identity: UnitIdentity,
    pub download_time: Option<DateTime<Utc>>,
    pub last_frame_id: Option<u32>,
}

impl DisplayedUnit {
    pub fn from_record(record: &UnitRecord) -> Option<Self> {
        Some(Self {
            identity: record.identity?,
            download_time: record.download_time,
            last_frame_id: record.last_frame_id(),
        })
    }

    pub fn is_same_unit(&self, other: &DisplayedUnit) -> bool {
        self.identity == other.identity && same_download(self.download_time, other.download_time)
    }
}

/// Unit-info only describes the active unit, so the same download can come
/// back without a time once it is no longer current.
fn same_download(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub frames_recorded: usize,
    pub units_completed: usize,
}

/// Feeds new frame times into the benchmark store and finished units into
/// the completed-unit history.
pub struct BenchmarkSweep<'a> {
    pub worker: &'a WorkerConfig,
    pub benchmarks: &'a BenchmarkStore,
    pub history: &'a CompletedUnitHistory,
    pub frame_time_method: FrameTimeMethod,
}

impl BenchmarkSweep<'_> {
    /// Walk the units oldest to newest, starting to count at the displayed
    /// unit or at the active slot, whichever comes first.
    pub fn run(
        &self,
        reconciliation: &Reconciliation,
        displayed: Option<&DisplayedUnit>,
        now: DateTime<Utc>,
    ) -> SweepOutcome {
        let units = &reconciliation.units;
        let active = reconciliation.current_index;
        let mut outcome = SweepOutcome::default();
        let mut tracking = false;

        for index in RingIter::oldest_first(units.len(), active) {
            let unit = units[index].as_ref();
            let is_displayed = match (unit, displayed) {
                (Some(unit), Some(shown)) => unit.is_same_unit(shown.identity, shown.download_time),
                _ => false,
            };
            tracking |= index == active || is_displayed;
            if !tracking {
                continue;
            }
            let Some(unit) = unit else { continue };
            let Some(identity) = unit.identity else { continue };

            let already_counted = displayed
                .filter(|_| is_displayed)
                .and_then(|shown| shown.last_frame_id);
            let durations = unit
                .frames
                .values()
                .filter(|frame| already_counted.is_none_or(|last| frame.id > last))
                .map(|frame| frame.duration);
            let key = BenchmarkKey::new(self.worker.name.clone(), &self.worker.path, identity.project);
            outcome.frames_recorded += self.benchmarks.record_frame_times(&key, durations);

            if index != active && unit.frames_complete() && self.record_completed(unit, identity, now)
            {
                outcome.units_completed += 1;
            }
        }

        if outcome.frames_recorded > 0 || outcome.units_completed > 0 {
            debug!(
                worker = %self.worker.name,
                frames = outcome.frames_recorded,
                completed = outcome.units_completed,
                "Benchmark sweep"
            );
        }
        outcome
    }

    fn record_completed(&self, unit: &UnitRecord, identity: UnitIdentity, now: DateTime<Utc>) -> bool {
        self.history.record(CompletedUnit {
            worker_name: self.worker.name.clone(),
            identity,
            download_time: unit.download_time,
            finished_time: unit.finished_time,
            protein_name: unit.protein_name.clone(),
            core_version: unit.core_version.clone(),
            result: unit.result,
            frames_completed: unit.last_frame_id().unwrap_or_default(),
            frame_time_secs: frame_time(&unit.frames, self.frame_time_method).as_secs(),
            recorded_at: now,
        })
    }
}
