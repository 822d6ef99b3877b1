//! Run and work-unit segmentation over classified lines.

use super::line::{LineData, LineType, LogLine};
use foldwatch_common::types::{ClientStatus, UnitResult};
use serde::Serialize;
use tracing::trace;

/// Position in the log where a work unit began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitStart {
    pub line_index: usize,
    /// Queue slot announced for this unit, once seen.
    pub queue_index: Option<usize>,
}

/// One continuous session of the client process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientRun {
    pub start_index: usize,
    pub unit_starts: Vec<UnitStart>,
    /// Units finished during this run.
    pub completed_units: u32,
    /// Units that ended early, unstable or interrupted during this run.
    pub failed_units: u32,
    /// Lifetime total reported by the client.
    pub total_completed_units: Option<u32>,
    pub client_version: Option<String>,
    pub arguments: Option<String>,
    pub user_name: Option<String>,
    pub team: Option<u32>,
    pub user_id: Option<String>,
    pub machine_id: Option<u32>,
    /// Status implied by the last status-bearing line of the run.
    pub status: ClientStatus,
}

impl ClientRun {
    fn new(start_index: usize) -> Self {
        Self {
            start_index,
            ..Self::default()
        }
    }

    fn push_unit_start(&mut self, line_index: usize) {
        self.unit_starts.push(UnitStart {
            line_index,
            queue_index: None,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Idle,
    UnitRunning,
    Paused,
}

/// Classified lines plus the runs found in them.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    pub lines: Vec<LogLine>,
    pub runs: Vec<ClientRun>,
}

impl LogScan {
    /// Segment classified lines into runs and unit boundaries.
    pub fn new(lines: Vec<LogLine>) -> Self {
        let mut runs: Vec<ClientRun> = Vec::new();
        let mut previous: Option<LineType> = None;
        let mut state = ScanState::Idle;

        for line in &lines {
            let line_type = line.line_type;
            if line_type == LineType::Unknown {
                continue;
            }

            match line_type {
                LineType::LogOpen => {
                    runs.push(ClientRun::new(line.index));
                    state = ScanState::Idle;
                }
                LineType::LogHeader => {
                    if !matches!(previous, Some(LineType::LogOpen | LineType::LogHeader)) {
                        runs.push(ClientRun::new(line.index));
                        state = ScanState::Idle;
                    }
                }
                _ => {
                    if runs.is_empty() {
                        runs.push(ClientRun::new(0));
                    }
                }
            }

            let Some(run) = runs.last_mut() else {
                continue;
            };

            match line_type {
                LineType::WorkUnitProcessing => {
                    run.push_unit_start(line.index);
                    state = ScanState::Idle;
                }
                LineType::WorkUnitCoreDownload => {
                    if previous == Some(LineType::WorkUnitProcessing) {
                        let retracted = run.unit_starts.pop();
                        trace!(?retracted, "Core download, unit start retracted");
                    }
                }
                LineType::WorkUnitWorking => {
                    if previous == Some(LineType::WorkUnitPaused) {
                        state = ScanState::UnitRunning;
                    } else {
                        if previous != Some(LineType::WorkUnitProcessing) {
                            run.push_unit_start(line.index);
                        }
                        state = ScanState::Idle;
                    }
                }
                LineType::WorkUnitStart => {
                    if previous != Some(LineType::WorkUnitWorking) {
                        run.push_unit_start(line.index);
                    }
                    state = ScanState::Idle;
                }
                LineType::WorkUnitIndex => {
                    if let (Some(slot), Some(start)) = (line.number(), run.unit_starts.last_mut())
                        && start.queue_index.is_none()
                    {
                        start.queue_index = Some(slot as usize);
                    }
                }
                LineType::WorkUnitRunning | LineType::WorkUnitFrame => {
                    state = ScanState::UnitRunning;
                }
                LineType::WorkUnitPaused => state = ScanState::Paused,
                LineType::WorkUnitCoreShutdown => {
                    if state == ScanState::UnitRunning
                        && let LineData::CoreShutdown(result) = line.data
                    {
                        match result {
                            UnitResult::FinishedUnit => run.completed_units += 1,
                            r if r.is_counted_failure() => run.failed_units += 1,
                            _ => {}
                        }
                    }
                    state = ScanState::Idle;
                }
                LineType::ClientShutdown | LineType::ClientCoreCommunicationsErrorShutdown => {
                    state = ScanState::Idle;
                }
                LineType::ClientVersion => run.client_version = line.text().map(str::to_string),
                LineType::ClientArguments => run.arguments = line.text().map(str::to_string),
                LineType::ClientUserNameTeam => {
                    if let LineData::UserTeam { name, team } = &line.data {
                        run.user_name = Some(name.clone());
                        run.team = Some(*team);
                    }
                }
                LineType::ClientUserId => run.user_id = line.text().map(str::to_string),
                LineType::ClientMachineId => run.machine_id = line.number(),
                LineType::ClientNumberOfUnitsCompleted => {
                    if let Some(total) = line.number() {
                        run.total_completed_units = Some(total);
                    }
                }
                _ => {}
            }

            if let Some(status) = line_type.implied_status() {
                run.status = status;
            }
            if !line_type.is_informational() {
                previous = Some(line_type);
            }
        }

        Self { lines, runs }
    }

    /// Classify and segment raw log text.
    pub fn from_text(text: &str) -> Self {
        Self::new(super::classify::classify_text(text))
    }

    /// The most recent run.
    pub fn current_run(&self) -> Option<&ClientRun> {
        self.runs.last()
    }

    /// Lines between the current run's second-to-last and last unit start.
    pub fn previous_unit_lines(&self) -> Option<&[LogLine]> {
        let starts = &self.current_run()?.unit_starts;
        let [.., previous, last] = starts.as_slice() else {
            return None;
        };
        self.lines.get(previous.line_index..last.line_index)
    }

    /// Lines from the last unit start to the end of the log.
    pub fn current_unit_lines(&self) -> Option<&[LogLine]> {
        let last = self.current_run()?.unit_starts.last()?;
        self.lines.get(last.line_index..)
    }

    /// Lines of the most recent unit in the current run that announced
    /// `queue_index`, up to the next unit start.
    pub fn unit_lines_for_queue_index(&self, queue_index: usize) -> Option<&[LogLine]> {
        let starts = &self.current_run()?.unit_starts;
        let position = starts
            .iter()
            .rposition(|s| s.queue_index == Some(queue_index))?;
        let begin = starts[position].line_index;
        let end = starts
            .get(position + 1)
            .map_or(self.lines.len(), |next| next.line_index);
        self.lines.get(begin..end)
    }

    /// Lines from the start of the current run to the end of the log.
    pub fn current_run_lines(&self) -> Option<&[LogLine]> {
        let run = self.current_run()?;
        self.lines.get(run.start_index..)
    }
}
