//! First-match-wins classification of raw log lines.
//!
//! Markers are plain substrings tested in table order with SIMD substring
//! search; payloads are decoded afterwards with a few anchored regexes.

use super::line::{FrameProgress, LineData, LineType, LogLine};
use chrono::NaiveTime;
use foldwatch_common::types::{UnitIdentity, UnitResult};
use memchr::memmem::Finder;
use regex::Regex;
use std::sync::LazyLock;

/// Ordered marker table. Earlier rows win.
const MARKERS: &[(LineType, &str)] = &[
    (LineType::LogOpen, "--- Opening Log file"),
    (LineType::LogHeader, "########################################"),
    (LineType::ClientVersion, "Folding@Home Client Version"),
    (LineType::ClientArguments, "Arguments:"),
    (LineType::ClientUserNameTeam, "] - User name:"),
    (LineType::ClientRegistration, "] + Requesting User ID from server"),
    (LineType::ClientUserId, "- User ID:"),
    (LineType::ClientMachineId, "] - Machine ID:"),
    (LineType::ClientAttemptGetWorkPacket, "] + Attempting to get work packet"),
    (LineType::ClientSendWorkToServer, "] Sending work to server"),
    (LineType::ClientAutosendStart, "] - Autosending finished units..."),
    (LineType::ClientAutosendComplete, "] - Autosend completed"),
    (LineType::ClientSendStart, "] + Attempting to send results"),
    (LineType::ClientSendConnectFailed, "] - Couldn't send HTTP request to server"),
    (LineType::ClientSendFailed, "] - Error: Could not transmit unit"),
    (LineType::ClientSendComplete, "] + Results successfully sent"),
    (
        LineType::ClientCoreCommunicationsErrorShutdown,
        "This is a sign of more serious problems, shutting down",
    ),
    (LineType::ClientCoreCommunicationsError, "] Client-core communications error"),
    (LineType::ClientEuePauseState, "] EUE limit exceeded. Pausing 24 hours."),
    (LineType::ClientShutdown, "] ***** Got a SIGTERM signal"),
    (LineType::ClientShutdown, "Folding@Home Client Shutdown"),
    (LineType::ClientNumberOfUnitsCompleted, "] + Number of Units Completed:"),
    (LineType::WorkUnitProcessing, "] + Processing work unit"),
    (LineType::WorkUnitCoreDownload, "] + Downloading new core"),
    (LineType::WorkUnitIndex, "] Working on queue slot"),
    (LineType::WorkUnitIndex, "] Working on Unit"),
    (LineType::WorkUnitWorking, "] + Working ..."),
    (LineType::WorkUnitStart, "] *------------------------------*"),
    (LineType::WorkUnitCoreVersion, "] Version "),
    (LineType::WorkUnitRunning, "] Preparing to commence simulation"),
    (LineType::WorkUnitRunning, "] Entering M.D."),
    (LineType::WorkUnitProject, "] Project: "),
    (LineType::WorkUnitFrame, "] Completed "),
    (LineType::WorkUnitPaused, "] + Paused"),
    (LineType::WorkUnitCoreShutdown, "] Folding@home Core Shutdown:"),
    (LineType::WorkUnitCoreReturn, "] CoreStatus = "),
];

static FINDERS: LazyLock<Vec<(LineType, Finder<'static>)>> = LazyLock::new(|| {
    MARKERS
        .iter()
        .map(|(line_type, marker)| (*line_type, Finder::new(marker.as_bytes())))
        .collect()
});

static RE_BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").expect("valid regex"));
static RE_CLIENT_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Client Version\s+(\S+)").expect("valid regex"));
static RE_USER_TEAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"User name:\s*(.+?)\s*\(Team\s+(\d+)\)").expect("valid regex"));
static RE_USER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"User ID:\s*(\S+)").expect("valid regex"));
static RE_LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Machine ID:|Units Completed:|queue slot|Unit)\s*(\d+)").expect("valid regex"));
static RE_CORE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\] Version\s+(\S+)").expect("valid regex"));
static RE_PROJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Project:\s*(\d+)\s*\(Run\s+(\d+),\s*Clone\s+(\d+),\s*Gen\s+(\d+)\)")
        .expect("valid regex")
});
static RE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Completed\s+(\d+)\s+out of\s+(\d+)\s+steps\s*(?:\((\d+)%\))?")
        .expect("valid regex")
});
static RE_CORE_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CoreStatus = ([0-9A-Fa-f]+)").expect("valid regex"));

/// Classify one raw line.
pub fn classify_line(index: usize, raw: &str) -> LogLine {
    let line_type = classify_type(raw);
    let data = if line_type == LineType::Unknown {
        LineData::None
    } else {
        decode_payload(line_type, raw)
    };

    LogLine {
        index,
        line_type,
        time_of_day: parse_time_of_day(raw),
        data,
        raw: raw.to_string(),
    }
}

/// Classify every line of a log text.
pub fn classify_text(text: &str) -> Vec<LogLine> {
    text.lines()
        .enumerate()
        .map(|(index, raw)| classify_line(index, raw))
        .collect()
}

fn classify_type(raw: &str) -> LineType {
    let haystack = raw.as_bytes();
    FINDERS
        .iter()
        .find(|(_, finder)| finder.find(haystack).is_some())
        .map(|(line_type, _)| *line_type)
        .unwrap_or(LineType::Unknown)
}

/// Parse a leading `[HH:MM:SS]` stamp.
fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let stamp = raw.strip_prefix('[')?.get(..9)?;
    let stamp = stamp.strip_suffix(']')?;
    NaiveTime::parse_from_str(stamp, "%H:%M:%S").ok()
}

fn decode_payload(line_type: LineType, raw: &str) -> LineData {
    match line_type {
        LineType::LogOpen => RE_BRACKETED
            .captures(raw)
            .map(|c| LineData::Text(c[1].trim().to_string()))
            .unwrap_or(LineData::None),
        LineType::ClientVersion => capture_text(&RE_CLIENT_VERSION, raw, "client version"),
        LineType::ClientArguments => raw
            .split_once("Arguments:")
            .map(|(_, rest)| LineData::Text(rest.trim().to_string()))
            .unwrap_or(LineData::None),
        LineType::ClientUserNameTeam => match RE_USER_TEAM.captures(raw) {
            Some(c) => match c[2].parse() {
                Ok(team) => LineData::UserTeam {
                    name: c[1].to_string(),
                    team,
                },
                Err(_) => LineData::Malformed(format!("team number '{}'", &c[2])),
            },
            None => LineData::Malformed("user name and team".to_string()),
        },
        LineType::ClientUserId => capture_text(&RE_USER_ID, raw, "user id"),
        LineType::ClientMachineId
        | LineType::ClientNumberOfUnitsCompleted
        | LineType::WorkUnitIndex => match RE_LEADING_NUMBER.captures(raw) {
            Some(c) => c[1]
                .parse()
                .map(LineData::Number)
                .unwrap_or_else(|_| LineData::Malformed(format!("number '{}'", &c[1]))),
            None => LineData::Malformed("number".to_string()),
        },
        LineType::WorkUnitCoreVersion => match RE_CORE_VERSION.captures(raw) {
            Some(c) => LineData::CoreVersion(c[1].to_string()),
            None => LineData::Malformed("core version".to_string()),
        },
        LineType::WorkUnitProject => decode_project(raw),
        LineType::WorkUnitFrame => decode_frame(raw),
        LineType::WorkUnitCoreShutdown => raw
            .split_once("Core Shutdown:")
            .map(|(_, rest)| LineData::CoreShutdown(UnitResult::from_core_text(rest)))
            .unwrap_or(LineData::CoreShutdown(UnitResult::Unknown)),
        LineType::WorkUnitCoreReturn => match RE_CORE_STATUS.captures(raw) {
            Some(c) => u32::from_str_radix(&c[1], 16)
                .map(LineData::CoreStatus)
                .unwrap_or_else(|_| LineData::Malformed(format!("core status '{}'", &c[1]))),
            None => LineData::Malformed("core status".to_string()),
        },
        _ => LineData::None,
    }
}

fn capture_text(re: &Regex, raw: &str, what: &str) -> LineData {
    match re.captures(raw) {
        Some(c) => LineData::Text(c[1].to_string()),
        None => LineData::Malformed(what.to_string()),
    }
}

fn decode_project(raw: &str) -> LineData {
    let Some(c) = RE_PROJECT.captures(raw) else {
        return LineData::Malformed("project identity".to_string());
    };
    let parts: Result<Vec<u32>, _> = (1..=4).map(|i| c[i].parse::<u32>()).collect();
    match parts.as_deref() {
        Ok([project, run, clone, generation]) => {
            LineData::Project(UnitIdentity::new(*project, *run, *clone, *generation))
        }
        _ => LineData::Malformed("project identity out of range".to_string()),
    }
}

fn decode_frame(raw: &str) -> LineData {
    let Some(c) = RE_FRAME.captures(raw) else {
        return LineData::Malformed("frame progress".to_string());
    };
    let (Ok(steps), Ok(total)) = (c[1].parse::<u64>(), c[2].parse::<u64>()) else {
        return LineData::Malformed("frame step count".to_string());
    };

    let percent = c.get(3).and_then(|m| m.as_str().parse::<u32>().ok());
    let id = match percent {
        Some(p) => p,
        None if total > 0 => u32::try_from(steps.saturating_mul(100) / total).unwrap_or(u32::MAX),
        None => return LineData::Malformed("frame total is zero".to_string()),
    };

    LineData::Frame(FrameProgress {
        raw: steps,
        total,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldwatch_common::testing::init_test_logging;
    use tracing::info;

    fn classify(raw: &str) -> LogLine {
        classify_line(0, raw)
    }

    #[test]
    fn test_unknown_line() {
        let line = classify("[12:00:00] Nothing interesting here");
        assert_eq!(line.line_type, LineType::Unknown);
        assert_eq!(line.data, LineData::None);
        assert_eq!(line.time_of_day, NaiveTime::from_hms_opt(12, 0, 0));
    }

    #[test]
    fn test_log_open_stamp() {
        let line = classify("--- Opening Log file [March 8 22:41:07 UTC] ");
        assert_eq!(line.line_type, LineType::LogOpen);
        assert_eq!(line.data, LineData::Text("March 8 22:41:07 UTC".to_string()));
        assert_eq!(line.time_of_day, None);
    }

    #[test]
    fn test_banner_lines_are_headers() {
        let line = classify(
            "# Windows SMP Console Edition #################################################",
        );
        assert_eq!(line.line_type, LineType::LogHeader);
        assert_eq!(classify(&"#".repeat(79)).line_type, LineType::LogHeader);
        assert_eq!(classify("# short #####").line_type, LineType::Unknown);
    }

    #[test]
    fn test_client_version_and_arguments() {
        let line = classify("                       Folding@Home Client Version 6.34");
        assert_eq!(line.line_type, LineType::ClientVersion);
        assert_eq!(line.text(), Some("6.34"));

        let line = classify("Arguments: -smp -verbosity 9 ");
        assert_eq!(line.line_type, LineType::ClientArguments);
        assert_eq!(line.text(), Some("-smp -verbosity 9"));
    }

    #[test]
    fn test_user_team() {
        let line = classify("[22:41:07] - User name: harlam357 (Team 32)");
        assert_eq!(
            line.data,
            LineData::UserTeam {
                name: "harlam357".to_string(),
                team: 32
            }
        );
    }

    #[test]
    fn test_user_team_malformed() {
        let line = classify("[22:41:07] - User name: harlam357");
        assert_eq!(line.line_type, LineType::ClientUserNameTeam);
        assert!(matches!(line.data, LineData::Malformed(_)));
    }

    #[test]
    fn test_ids_and_counts() {
        let line = classify("[22:41:07] - User ID: 1E19BD450434A6ED");
        assert_eq!(line.line_type, LineType::ClientUserId);
        assert_eq!(line.text(), Some("1E19BD450434A6ED"));

        let line = classify("[22:41:07] - Machine ID: 2");
        assert_eq!(line.line_type, LineType::ClientMachineId);
        assert_eq!(line.number(), Some(2));

        let line = classify("[01:21:59] + Number of Units Completed: 173");
        assert_eq!(line.line_type, LineType::ClientNumberOfUnitsCompleted);
        assert_eq!(line.number(), Some(173));
    }

    #[test]
    fn test_queue_slot_index() {
        let line = classify("[22:41:08] Working on queue slot 01 [March 8 22:41:08 UTC]");
        assert_eq!(line.line_type, LineType::WorkUnitIndex);
        assert_eq!(line.number(), Some(1));

        let line = classify("[22:41:08] Working on Unit 07 [March 8 22:41:08 UTC]");
        assert_eq!(line.number(), Some(7));
    }

    #[test]
    fn test_project_payload() {
        init_test_logging();
        info!("TEST START: test_project_payload");
        let line = classify("[22:41:11] Project: 2669 (Run 13, Clone 159, Gen 79)");
        assert_eq!(line.line_type, LineType::WorkUnitProject);
        assert_eq!(line.project(), Some(UnitIdentity::new(2669, 13, 159, 79)));
        info!("TEST PASS: test_project_payload");
    }

    #[test]
    fn test_project_malformed() {
        let line = classify("[22:41:11] Project: 2669 (Run x)");
        assert_eq!(line.line_type, LineType::WorkUnitProject);
        assert!(matches!(line.data, LineData::Malformed(_)));
    }

    #[test]
    fn test_frame_with_percent() {
        init_test_logging();
        info!("TEST START: test_frame_with_percent");
        let line = classify("[22:49:38] Completed 2500 out of 250000 steps  (1%)");
        assert_eq!(line.line_type, LineType::WorkUnitFrame);
        assert_eq!(
            line.frame(),
            Some(&FrameProgress {
                raw: 2500,
                total: 250000,
                id: 1
            })
        );
        info!("TEST PASS: test_frame_with_percent");
    }

    #[test]
    fn test_frame_without_percent_uses_ratio() {
        let line = classify("[22:49:38] Completed 75000 out of 250000 steps");
        assert_eq!(line.frame().map(|f| f.id), Some(30));
    }

    #[test]
    fn test_frame_zero_total_is_malformed() {
        let line = classify("[22:49:38] Completed 0 out of 0 steps");
        assert!(matches!(line.data, LineData::Malformed(_)));
    }

    #[test]
    fn test_units_completed_is_not_a_frame() {
        let line = classify("[01:21:59] + Number of Units Completed: 173");
        assert_ne!(line.line_type, LineType::WorkUnitFrame);
    }

    #[test]
    fn test_core_shutdown_results() {
        init_test_logging();
        info!("TEST START: test_core_shutdown_results");
        let line = classify("[23:57:33] Folding@home Core Shutdown: FINISHED_UNIT");
        assert_eq!(line.data, LineData::CoreShutdown(UnitResult::FinishedUnit));

        let line = classify("[23:57:33] Folding@home Core Shutdown: UNSTABLE_MACHINE");
        assert_eq!(line.data, LineData::CoreShutdown(UnitResult::UnstableMachine));

        let line = classify("[23:57:33] Folding@home Core Shutdown: SOMETHING_NEW");
        assert_eq!(line.data, LineData::CoreShutdown(UnitResult::Unknown));
        info!("TEST PASS: test_core_shutdown_results");
    }

    #[test]
    fn test_core_status_hex() {
        let line = classify("[23:57:37] CoreStatus = 64 (100)");
        assert_eq!(line.data, LineData::CoreStatus(100));
    }

    #[test]
    fn test_core_version() {
        let line = classify("[22:41:11] Version 2.10 (Sun Aug 30 03:43:28 CEST 2009)");
        assert_eq!(line.line_type, LineType::WorkUnitCoreVersion);
        assert_eq!(line.data, LineData::CoreVersion("2.10".to_string()));
    }

    #[test]
    fn test_shutdown_markers() {
        assert_eq!(
            classify("[10:00:00] ***** Got a SIGTERM signal (15)").line_type,
            LineType::ClientShutdown
        );
        assert_eq!(
            classify("Folding@Home Client Shutdown at Mon Mar 9 10:00:00 2009").line_type,
            LineType::ClientShutdown
        );
        assert_eq!(
            classify("[10:00:00] EUE limit exceeded. Pausing 24 hours.").line_type,
            LineType::ClientEuePauseState
        );
    }

    #[test]
    fn test_time_of_day_requires_bracketed_stamp() {
        assert_eq!(classify("[25:00:00] x").time_of_day, None);
        assert_eq!(classify("[1:00:00] x").time_of_day, None);
        assert_eq!(classify("").time_of_day, None);
        assert_eq!(
            classify("[09:05:01] x").time_of_day,
            NaiveTime::from_hms_opt(9, 5, 1)
        );
    }

    #[test]
    fn test_classify_text_indexes() {
        init_test_logging();
        info!("TEST START: test_classify_text_indexes");
        let lines = classify_text("a\n[00:00:01] + Processing work unit\nb");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].index, 1);
        assert_eq!(lines[1].line_type, LineType::WorkUnitProcessing);
        info!("TEST PASS: test_classify_text_indexes");
    }

    mod proptest_classify {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_any_text_keeps_index_and_raw(index in 0usize..10_000, raw in ".*") {
                let line = classify_line(index, &raw);
                prop_assert_eq!(line.index, index);
                prop_assert_eq!(&line.raw, &raw);
                if line.line_type == LineType::Unknown {
                    prop_assert_eq!(line.data, LineData::None);
                }
            }

            #[test]
            fn test_frame_line_decodes_its_numbers(
                hour in 0u32..24,
                minute in 0u32..60,
                steps in any::<u32>(),
                total in 1u32..=u32::MAX,
                percent in 0u32..=100,
            ) {
                let raw = format!(
                    "[{hour:02}:{minute:02}:07] Completed {steps} out of {total} steps  ({percent}%)"
                );
                let line = classify_line(0, &raw);
                prop_assert_eq!(line.line_type, LineType::WorkUnitFrame);
                prop_assert_eq!(line.time_of_day, NaiveTime::from_hms_opt(hour, minute, 7));
                prop_assert_eq!(
                    line.frame(),
                    Some(&FrameProgress {
                        raw: u64::from(steps),
                        total: u64::from(total),
                        id: percent,
                    })
                );
            }

            #[test]
            fn test_project_line_decodes_identity(
                project in any::<u16>(),
                run in any::<u16>(),
                clone in any::<u16>(),
                generation in any::<u16>(),
            ) {
                let raw = format!(
                    "[10:00:00] Project: {project} (Run {run}, Clone {clone}, Gen {generation})"
                );
                let expected = UnitIdentity::new(
                    u32::from(project),
                    u32::from(run),
                    u32::from(clone),
                    u32::from(generation),
                );
                prop_assert_eq!(classify_line(0, &raw).data, LineData::Project(expected));
            }
        }
    }
}
