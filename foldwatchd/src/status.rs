//! Worker status determination.
//!
//! The log reports what the client last said it was doing; this module
//! decides whether that is still true at retrieval time. A worker whose last
//! frame is older than `frame_time × hang multiplier` is hung, unless async
//! running is permitted and some other progress was seen inside the window.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use foldwatch_common::config::FrameTimeMethod;
use foldwatch_common::types::{ClientStatus, WorkerKind};
use foldwatch_parse::UnitFrame;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const DAY_SECS: i64 = 24 * 60 * 60;
const HOUR_SECS: i64 = 60 * 60;

/// Everything [`determine_status`] looks at. Built fresh every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub previous_status: ClientStatus,
    /// Status derived from the log.
    pub returned_status: ClientStatus,
    pub last_retrieval_time: DateTime<Utc>,
    /// Time of day of the last frame in log (UTC) time.
    pub time_of_last_frame: Option<NaiveTime>,
    pub time_of_last_unit_start: Option<DateTime<Utc>>,
    pub time_of_last_frame_progress: Option<DateTime<Utc>>,
    /// How far the worker's clock runs ahead of real time.
    pub client_time_offset: ChronoDuration,
    /// Monitoring host's offset from UTC.
    pub utc_offset: ChronoDuration,
    pub ignore_utc_offset: bool,
    /// Frame time measured from the log; zero when unknown.
    pub frame_time: Duration,
    /// Benchmark average for the current project; zero when unknown.
    pub average_frame_time: Duration,
    pub worker_kind: WorkerKind,
    pub allow_running_async: bool,
}

/// Why a status was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReason {
    /// The log status is trusted as-is.
    PassThrough,
    /// No frame time of day, so no hang test was possible.
    NoFrameTimeOfDay,
    /// Last frame inside the window of the measured frame time.
    FrameWithinWindow,
    /// Last frame inside the window of a benchmark or default frame time.
    EstimatedWithinWindow,
    /// Frames are late but a unit start or frame progress is recent.
    RecentProgress,
    /// Nothing happened inside the window.
    NoProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusDecision {
    pub status: ClientStatus,
    pub reason: StatusReason,
    /// Whether `status` differs from the previous poll's status.
    pub changed: bool,
}

/// Decide the worker's status at retrieval time.
pub fn determine_status(snapshot: &StatusSnapshot) -> StatusDecision {
    let (status, reason) = decide(snapshot);
    StatusDecision {
        status,
        reason,
        changed: status != snapshot.previous_status,
    }
}

fn decide(snapshot: &StatusSnapshot) -> (ClientStatus, StatusReason) {
    if snapshot.returned_status.is_pass_through() {
        return (snapshot.returned_status, StatusReason::PassThrough);
    }

    let Some(time_of_last_frame) = snapshot.time_of_last_frame else {
        return (snapshot.returned_status, StatusReason::NoFrameTimeOfDay);
    };

    if !snapshot.frame_time.is_zero() {
        if frame_is_recent(snapshot, time_of_last_frame, snapshot.frame_time) {
            return (ClientStatus::Running, StatusReason::FrameWithinWindow);
        }
        return check_async(snapshot, snapshot.frame_time);
    }

    let estimated = estimated_frame_time(snapshot);
    if frame_is_recent(snapshot, time_of_last_frame, estimated) {
        return (snapshot.returned_status, StatusReason::EstimatedWithinWindow);
    }
    check_async(snapshot, estimated)
}

/// Benchmark average rounded to whole seconds, else the kind's default.
fn estimated_frame_time(snapshot: &StatusSnapshot) -> Duration {
    let average = Duration::from_secs(snapshot.average_frame_time.as_secs_f64().round() as u64);
    if average.is_zero() {
        snapshot.worker_kind.default_frame_time()
    } else {
        average
    }
}

fn window(snapshot: &StatusSnapshot, frame_time: Duration) -> ChronoDuration {
    ChronoDuration::from_std(frame_time)
        .ok()
        .and_then(|frame_time| {
            frame_time.checked_mul(snapshot.worker_kind.hang_multiplier() as i32)
        })
        .unwrap_or(ChronoDuration::MAX)
}

fn frame_is_recent(
    snapshot: &StatusSnapshot,
    time_of_last_frame: NaiveTime,
    frame_time: Duration,
) -> bool {
    let offset = if snapshot.ignore_utc_offset {
        ChronoDuration::zero()
    } else {
        snapshot.utc_offset
    };

    // Everything below is in the same (local or UTC) frame of reference.
    let retrieval = snapshot.last_retrieval_time.naive_utc() + offset;
    let Some(terminal) = retrieval.checked_sub_signed(window(snapshot, frame_time)) else {
        return true;
    };

    let frame_secs = (time_of_last_frame.num_seconds_from_midnight() as i64
        + offset.num_seconds()
        - snapshot.client_time_offset.num_seconds())
    .rem_euclid(DAY_SECS);
    let retrieval_secs = retrieval.time().num_seconds_from_midnight() as i64;

    let mut frame_moment =
        retrieval.date().and_time(NaiveTime::MIN) + ChronoDuration::seconds(frame_secs);
    // A frame stamped later in the day than "now" happened yesterday.
    if frame_secs > retrieval_secs + HOUR_SECS {
        frame_moment -= ChronoDuration::days(1);
    }

    frame_moment > terminal
}

fn check_async(snapshot: &StatusSnapshot, frame_time: Duration) -> (ClientStatus, StatusReason) {
    if !snapshot.allow_running_async {
        return (ClientStatus::Hung, StatusReason::NoProgress);
    }

    let last_progress = snapshot
        .time_of_last_unit_start
        .max(snapshot.time_of_last_frame_progress);
    let terminal = snapshot
        .last_retrieval_time
        .checked_sub_signed(window(snapshot, frame_time));

    let recent = match (last_progress, terminal) {
        (Some(progress), Some(terminal)) => progress > terminal,
        (Some(_), None) => true,
        (None, _) => false,
    };

    if recent {
        (ClientStatus::RunningAsync, StatusReason::RecentProgress)
    } else {
        (ClientStatus::Hung, StatusReason::NoProgress)
    }
}

/// Frame time estimate: mean duration (whole seconds, rounded down) of the
/// most recent frames with a measured duration.
pub fn frame_time(frames: &BTreeMap<u32, UnitFrame>, method: FrameTimeMethod) -> Duration {
    let take = match method {
        FrameTimeMethod::LastFrame => 1,
        FrameTimeMethod::LastThreeFrames => 3,
        FrameTimeMethod::AllFrames => usize::MAX,
    };

    let (count, total) = frames
        .values()
        .rev()
        .filter(|frame| !frame.duration.is_zero())
        .take(take)
        .fold((0u64, 0u64), |(count, total), frame| {
            (count + 1, total + frame.duration.as_secs())
        });

    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(total / count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use foldwatch_common::testing::init_test_logging;
    use tracing::info;

    fn retrieval() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2009, 3, 9, 12, 0, 0).unwrap()
    }

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            previous_status: ClientStatus::Running,
            returned_status: ClientStatus::Running,
            last_retrieval_time: retrieval(),
            time_of_last_frame: None,
            time_of_last_unit_start: None,
            time_of_last_frame_progress: None,
            client_time_offset: ChronoDuration::zero(),
            utc_offset: ChronoDuration::zero(),
            ignore_utc_offset: false,
            frame_time: Duration::ZERO,
            average_frame_time: Duration::ZERO,
            worker_kind: WorkerKind::Cpu,
            allow_running_async: false,
        }
    }

    fn minutes_before_retrieval(minutes: i64) -> NaiveTime {
        (retrieval() - ChronoDuration::minutes(minutes)).time()
    }

    #[test]
    fn test_pass_through_statuses() {
        for status in [
            ClientStatus::Offline,
            ClientStatus::Stopped,
            ClientStatus::Paused,
            ClientStatus::EuePause,
            ClientStatus::SendingWorkPacket,
            ClientStatus::GettingWorkPacket,
            ClientStatus::Hung,
            ClientStatus::Unknown,
        ] {
            let decision = determine_status(&StatusSnapshot {
                returned_status: status,
                time_of_last_frame: Some(minutes_before_retrieval(600)),
                frame_time: Duration::from_secs(60),
                ..snapshot()
            });
            assert_eq!(decision.status, status);
            assert_eq!(decision.reason, StatusReason::PassThrough);
        }
    }

    #[test]
    fn test_gpu_hang_scenario() {
        init_test_logging();
        info!("TEST START: test_gpu_hang_scenario");
        let hung = StatusSnapshot {
            worker_kind: WorkerKind::Gpu,
            frame_time: Duration::from_secs(300),
            time_of_last_frame: Some(minutes_before_retrieval(40)),
            ..snapshot()
        };
        let decision = determine_status(&hung);
        assert_eq!(decision.status, ClientStatus::Hung);
        assert_eq!(decision.reason, StatusReason::NoProgress);
        assert!(decision.changed);

        let asynchronous = StatusSnapshot {
            allow_running_async: true,
            time_of_last_frame_progress: Some(retrieval() - ChronoDuration::minutes(10)),
            ..hung
        };
        let decision = determine_status(&asynchronous);
        assert_eq!(decision.status, ClientStatus::RunningAsync);
        assert_eq!(decision.reason, StatusReason::RecentProgress);
        info!("TEST PASS: test_gpu_hang_scenario");
    }

    #[test]
    fn test_async_without_recent_progress_is_hung() {
        let decision = determine_status(&StatusSnapshot {
            worker_kind: WorkerKind::Gpu,
            frame_time: Duration::from_secs(300),
            time_of_last_frame: Some(minutes_before_retrieval(40)),
            allow_running_async: true,
            time_of_last_unit_start: Some(retrieval() - ChronoDuration::minutes(36)),
            ..snapshot()
        });
        assert_eq!(decision.status, ClientStatus::Hung);
    }

    #[test]
    fn test_recent_frame_is_running() {
        let decision = determine_status(&StatusSnapshot {
            returned_status: ClientStatus::RunningNoFrameTimes,
            frame_time: Duration::from_secs(1500),
            time_of_last_frame: Some(minutes_before_retrieval(30)),
            ..snapshot()
        });
        assert_eq!(decision.status, ClientStatus::Running);
        assert_eq!(decision.reason, StatusReason::FrameWithinWindow);
        assert!(!decision.changed);
    }

    #[test]
    fn test_no_frame_time_of_day_passes_through() {
        let decision = determine_status(&StatusSnapshot {
            returned_status: ClientStatus::RunningNoFrameTimes,
            ..snapshot()
        });
        assert_eq!(decision.status, ClientStatus::RunningNoFrameTimes);
        assert_eq!(decision.reason, StatusReason::NoFrameTimeOfDay);
    }

    #[test]
    fn test_estimated_frame_time_keeps_returned_status() {
        // CPU default is one hour, so a two hour window
        let recent = StatusSnapshot {
            returned_status: ClientStatus::RunningNoFrameTimes,
            time_of_last_frame: Some(minutes_before_retrieval(90)),
            ..snapshot()
        };
        let decision = determine_status(&recent);
        assert_eq!(decision.status, ClientStatus::RunningNoFrameTimes);
        assert_eq!(decision.reason, StatusReason::EstimatedWithinWindow);

        let stale = StatusSnapshot {
            time_of_last_frame: Some(minutes_before_retrieval(130)),
            ..recent.clone()
        };
        assert_eq!(determine_status(&stale).status, ClientStatus::Hung);

        // a benchmark average overrides the default
        let benchmarked = StatusSnapshot {
            average_frame_time: Duration::from_millis(1_799_600),
            time_of_last_frame: Some(minutes_before_retrieval(61)),
            ..recent
        };
        assert_eq!(determine_status(&benchmarked).status, ClientStatus::Hung);
    }

    #[test]
    fn test_frame_just_before_midnight_counts_as_yesterday() {
        let just_after_midnight = Utc.with_ymd_and_hms(2009, 3, 10, 0, 10, 0).unwrap();
        let decision = determine_status(&StatusSnapshot {
            last_retrieval_time: just_after_midnight,
            frame_time: Duration::from_secs(600),
            time_of_last_frame: NaiveTime::from_hms_opt(23, 55, 0),
            ..snapshot()
        });
        assert_eq!(decision.status, ClientStatus::Running);
    }

    #[test]
    fn test_offsets_are_applied_consistently() {
        // log is UTC; host runs at UTC+2; worker clock is 30 minutes fast
        let base = StatusSnapshot {
            frame_time: Duration::from_secs(600),
            utc_offset: ChronoDuration::hours(2),
            client_time_offset: ChronoDuration::minutes(30),
            time_of_last_frame: Some(minutes_before_retrieval(-15)),
            ..snapshot()
        };
        // frame really happened 15 minutes ago
        assert_eq!(determine_status(&base).status, ClientStatus::Running);

        let ignoring = StatusSnapshot {
            ignore_utc_offset: true,
            ..base.clone()
        };
        assert_eq!(determine_status(&ignoring).status, ClientStatus::Running);

        let no_client_offset = StatusSnapshot {
            client_time_offset: ChronoDuration::zero(),
            time_of_last_frame: Some(minutes_before_retrieval(25)),
            ..base
        };
        assert_eq!(determine_status(&no_client_offset).status, ClientStatus::Hung);
    }

    #[test]
    fn test_monotone_in_retrieval_time() {
        init_test_logging();
        info!("TEST START: test_monotone_in_retrieval_time");
        let base = StatusSnapshot {
            frame_time: Duration::from_secs(600),
            time_of_last_frame: NaiveTime::from_hms_opt(11, 0, 0),
            last_retrieval_time: Utc.with_ymd_and_hms(2009, 3, 9, 11, 5, 0).unwrap(),
            ..snapshot()
        };
        let mut seen_hung = false;
        for minutes in 0..120 {
            let at = StatusSnapshot {
                last_retrieval_time: base.last_retrieval_time + ChronoDuration::minutes(minutes),
                ..base.clone()
            };
            let status = determine_status(&at).status;
            if seen_hung {
                assert_eq!(status, ClientStatus::Hung, "regressed at +{minutes}m");
            }
            seen_hung |= status == ClientStatus::Hung;
        }
        assert!(seen_hung);
        assert_eq!(determine_status(&base).status, ClientStatus::Running);
        info!("TEST PASS: test_monotone_in_retrieval_time");
    }

    fn frames(durations: &[u64]) -> BTreeMap<u32, UnitFrame> {
        durations
            .iter()
            .enumerate()
            .map(|(id, secs)| {
                let id = id as u32;
                (
                    id,
                    UnitFrame {
                        id,
                        time_of_day: NaiveTime::MIN,
                        duration: Duration::from_secs(*secs),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_frame_time_methods() {
        let frames = frames(&[0, 100, 200, 0, 400, 600]);
        assert_eq!(frame_time(&frames, FrameTimeMethod::LastFrame), Duration::from_secs(600));
        assert_eq!(
            frame_time(&frames, FrameTimeMethod::LastThreeFrames),
            Duration::from_secs(400)
        );
        assert_eq!(frame_time(&frames, FrameTimeMethod::AllFrames), Duration::from_secs(325));
        assert_eq!(frame_time(&BTreeMap::new(), FrameTimeMethod::AllFrames), Duration::ZERO);
    }
}
