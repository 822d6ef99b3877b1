//! Condensing one work unit's log lines into a summary.

use super::line::{LineData, LineType, LogLine};
use chrono::NaiveTime;
use foldwatch_common::types::{ClientStatus, UnitIdentity, UnitResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const DAY_SECS: i64 = 24 * 60 * 60;

/// One completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitFrame {
    pub id: u32,
    pub time_of_day: NaiveTime,
    /// Time since the previous frame; zero when that frame was not logged.
    pub duration: Duration,
}

/// Everything the log says about a single work unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitLog {
    pub identity: Option<UnitIdentity>,
    pub queue_index: Option<usize>,
    pub core_version: Option<String>,
    /// Frames keyed by id. The first line logged for an id wins.
    pub frames: BTreeMap<u32, UnitFrame>,
    pub result: UnitResult,
    pub core_status: Option<u32>,
    /// Time of day of the first stamped line.
    pub unit_start: Option<NaiveTime>,
    pub status: ClientStatus,
}

impl UnitLog {
    pub fn from_lines(lines: &[LogLine]) -> Self {
        let mut unit = Self::default();

        for line in lines {
            if unit.unit_start.is_none() {
                unit.unit_start = line.time_of_day;
            }

            match (&line.data, line.line_type) {
                (LineData::Project(identity), _) => {
                    unit.identity = (identity.project != 0).then_some(*identity);
                }
                (LineData::Number(slot), LineType::WorkUnitIndex) => {
                    unit.queue_index.get_or_insert(*slot as usize);
                }
                (LineData::CoreVersion(version), _) => {
                    unit.core_version = Some(version.clone());
                }
                (LineData::Frame(progress), _) => {
                    if let Some(time_of_day) = line.time_of_day {
                        unit.frames.entry(progress.id).or_insert(UnitFrame {
                            id: progress.id,
                            time_of_day,
                            duration: Duration::ZERO,
                        });
                    }
                }
                (LineData::CoreShutdown(result), _) => unit.result = *result,
                (LineData::CoreStatus(code), _) => unit.core_status = Some(*code),
                _ => {}
            }

            if let Some(status) = line.line_type.implied_status() {
                unit.status = status;
            }
        }

        unit.compute_frame_durations();
        unit
    }

    fn compute_frame_durations(&mut self) {
        let times: BTreeMap<u32, NaiveTime> = self
            .frames
            .iter()
            .map(|(id, frame)| (*id, frame.time_of_day))
            .collect();

        for (id, frame) in self.frames.iter_mut() {
            let Some(previous) = id.checked_sub(1).and_then(|p| times.get(&p)) else {
                continue;
            };
            let mut secs = (frame.time_of_day - *previous).num_seconds();
            if secs < 0 {
                secs += DAY_SECS;
            }
            frame.duration = Duration::from_secs(secs.unsigned_abs());
        }
    }

    /// Highest frame id logged.
    pub fn last_frame(&self) -> Option<&UnitFrame> {
        self.frames.values().next_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::classify::classify_text;

    const UNIT: &str = "\
[22:41:08] + Processing work unit
[22:41:08] Working on queue slot 01 [March 8 22:41:08 UTC]
[22:41:11] Version 2.10 (Sun Aug 30 03:43:28 CEST 2009)
[22:41:11] Project: 2669 (Run 13, Clone 159, Gen 79)
[22:41:12] Entering M.D.
[22:41:40] Completed 0 out of 250000 steps  (0%)
[23:10:12] Completed 2500 out of 250000 steps  (1%)
[23:39:02] Completed 5000 out of 250000 steps  (2%)
[23:39:02] Completed 5000 out of 250000 steps  (2%)
[00:07:31] Completed 7500 out of 250000 steps  (3%)
[00:50:00] Completed 12500 out of 250000 steps  (5%)
";

    #[test]
    fn test_summary_fields() {
        let unit = UnitLog::from_lines(&classify_text(UNIT));
        assert_eq!(unit.identity, Some(UnitIdentity::new(2669, 13, 159, 79)));
        assert_eq!(unit.queue_index, Some(1));
        assert_eq!(unit.core_version.as_deref(), Some("2.10"));
        assert_eq!(unit.unit_start, NaiveTime::from_hms_opt(22, 41, 8));
        assert_eq!(unit.status, ClientStatus::Running);
        assert_eq!(unit.result, UnitResult::Unknown);
        assert_eq!(unit.frames.len(), 5);
        assert_eq!(unit.last_frame().map(|f| f.id), Some(5));
    }

    #[test]
    fn test_frame_durations() {
        let unit = UnitLog::from_lines(&classify_text(UNIT));
        assert_eq!(unit.frames[&0].duration, Duration::ZERO);
        assert_eq!(unit.frames[&1].duration, Duration::from_secs(28 * 60 + 32));
        assert_eq!(unit.frames[&2].duration, Duration::from_secs(28 * 60 + 50));
        // crosses midnight
        assert_eq!(unit.frames[&3].duration, Duration::from_secs(28 * 60 + 29));
        // frame 4 missing, so frame 5 has nothing to measure against
        assert_eq!(unit.frames[&5].duration, Duration::ZERO);
    }

    #[test]
    fn test_result_and_core_status() {
        let text = format!(
            "{UNIT}[01:00:00] Folding@home Core Shutdown: EARLY_UNIT_END\n[01:00:01] CoreStatus = 72 (114)\n"
        );
        let unit = UnitLog::from_lines(&classify_text(&text));
        assert_eq!(unit.result, UnitResult::EarlyUnitEnd);
        assert_eq!(unit.core_status, Some(114));
    }

    #[test]
    fn test_zero_project_is_unknown_identity() {
        let unit = UnitLog::from_lines(&classify_text(
            "[10:00:00] Project: 0 (Run 0, Clone 0, Gen 0)\n",
        ));
        assert_eq!(unit.identity, None);
    }

    #[test]
    fn test_empty_lines() {
        let unit = UnitLog::from_lines(&[]);
        assert_eq!(unit, UnitLog::default());
        assert!(unit.last_frame().is_none());
    }
}
