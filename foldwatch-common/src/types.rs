//! Common types used across foldwatch components.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Name of a monitored worker, unique within the configuration.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkerName(pub String);

impl WorkerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health status of a monitored worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Status could not be determined.
    #[default]
    Unknown,
    /// The worker's log could not be retrieved.
    Offline,
    /// The client process shut down.
    Stopped,
    /// Folding was paused by the operator.
    Paused,
    /// Early-unit-end cooldown imposed by the client.
    EuePause,
    /// Uploading finished results.
    SendingWorkPacket,
    /// Downloading a new work unit.
    GettingWorkPacket,
    /// Producing frames on schedule.
    Running,
    /// Working on a unit that has not completed a frame yet.
    RunningNoFrameTimes,
    /// Frames are late but other progress was observed recently.
    RunningAsync,
    /// No progress within the terminal window.
    Hung,
}

impl ClientStatus {
    /// Statuses reported by the log that are trusted as-is.
    pub fn is_pass_through(self) -> bool {
        matches!(
            self,
            Self::Offline
                | Self::Stopped
                | Self::EuePause
                | Self::Hung
                | Self::Paused
                | Self::SendingWorkPacket
                | Self::GettingWorkPacket
                | Self::Unknown
        )
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unknown => "Unknown",
            Self::Offline => "Offline",
            Self::Stopped => "Stopped",
            Self::Paused => "Paused",
            Self::EuePause => "EUE Pause",
            Self::SendingWorkPacket => "Sending Work Packet",
            Self::GettingWorkPacket => "Getting Work Packet",
            Self::Running => "Running",
            Self::RunningNoFrameTimes => "Running (No Frame Times)",
            Self::RunningAsync => "Running (Async)",
            Self::Hung => "Hung",
        };
        f.write_str(label)
    }
}

/// Kind of compute resource a worker drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    #[default]
    Cpu,
    Gpu,
}

impl WorkerKind {
    /// Number of frame times without progress before a worker counts as hung.
    pub fn hang_multiplier(self) -> u32 {
        match self {
            Self::Cpu => 2,
            Self::Gpu => 7,
        }
    }

    /// Frame time assumed when neither the log nor a benchmark provides one.
    pub fn default_frame_time(self) -> Duration {
        match self {
            Self::Cpu => Duration::from_secs(3600),
            Self::Gpu => Duration::from_secs(600),
        }
    }
}

/// Errors from parsing a `P#R#C#G#` tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagParseError {
    #[error("tag is empty")]
    Empty,

    #[error("expected '{expected}' at position {position} in tag '{tag}'")]
    UnexpectedChar {
        tag: String,
        expected: char,
        position: usize,
    },

    #[error("invalid number for '{field}' in tag '{tag}'")]
    InvalidNumber { tag: String, field: char },
}

/// Project/Run/Clone/Gen tuple identifying one work unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitIdentity {
    pub project: u32,
    pub run: u32,
    pub clone: u32,
    pub generation: u32,
}

impl UnitIdentity {
    pub fn new(project: u32, run: u32, clone: u32, generation: u32) -> Self {
        Self {
            project,
            run,
            clone,
            generation,
        }
    }

    /// Build an identity only when it is fully known (project 0 means "no unit").
    pub fn known(project: u32, run: u32, clone: u32, generation: u32) -> Option<Self> {
        (project != 0).then(|| Self::new(project, run, clone, generation))
    }

    /// Render the canonical `P{P}R{R}C{C}G{G}` tag.
    pub fn tag(&self) -> String {
        format!(
            "P{}R{}C{}G{}",
            self.project, self.run, self.clone, self.generation
        )
    }

    /// Parse a `P{P}R{R}C{C}G{G}` tag.
    pub fn from_tag(tag: &str) -> Result<Self, TagParseError> {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            return Err(TagParseError::Empty);
        }

        let mut values = [0u32; 4];
        let mut rest = trimmed;
        let mut position = 0;
        for (slot, field) in ['P', 'R', 'C', 'G'].into_iter().enumerate() {
            let Some(after) = rest.strip_prefix(field) else {
                return Err(TagParseError::UnexpectedChar {
                    tag: trimmed.to_string(),
                    expected: field,
                    position,
                });
            };
            let digits = after
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after.len());
            values[slot] = after[..digits]
                .parse()
                .map_err(|_| TagParseError::InvalidNumber {
                    tag: trimmed.to_string(),
                    field,
                })?;
            position += 1 + digits;
            rest = &after[digits..];
        }

        if !rest.is_empty() {
            return Err(TagParseError::InvalidNumber {
                tag: trimmed.to_string(),
                field: 'G',
            });
        }

        Ok(Self::new(values[0], values[1], values[2], values[3]))
    }
}

impl std::fmt::Display for UnitIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "P{} (R{}, C{}, G{})",
            self.project, self.run, self.clone, self.generation
        )
    }
}

/// How a work unit ended, as reported by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitResult {
    #[default]
    Unknown,
    FinishedUnit,
    EarlyUnitEnd,
    UnstableMachine,
    Interrupted,
    BadWorkUnit,
    CoreOutdated,
}

impl UnitResult {
    /// Map the core shutdown text (e.g. `FINISHED_UNIT`) to a result.
    pub fn from_core_text(text: &str) -> Self {
        match text.trim() {
            "FINISHED_UNIT" => Self::FinishedUnit,
            "EARLY_UNIT_END" => Self::EarlyUnitEnd,
            "UNSTABLE_MACHINE" => Self::UnstableMachine,
            "INTERRUPTED" => Self::Interrupted,
            "BAD_WORK_UNIT" => Self::BadWorkUnit,
            "CORE_OUTDATED" => Self::CoreOutdated,
            _ => Self::Unknown,
        }
    }

    /// Whether this result counts against the run's failed-unit tally.
    pub fn is_counted_failure(self) -> bool {
        matches!(
            self,
            Self::EarlyUnitEnd | Self::UnstableMachine | Self::Interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tag_format() {
        let id = UnitIdentity::new(10504, 124, 2, 1);
        assert_eq!(id.tag(), "P10504R124C2G1");
        assert_eq!(id.to_string(), "P10504 (R124, C2, G1)");
    }

    #[test]
    fn test_from_tag_valid() {
        let id = UnitIdentity::from_tag(" P2669R13C159G79 ").unwrap();
        assert_eq!(id, UnitIdentity::new(2669, 13, 159, 79));
    }

    #[test]
    fn test_from_tag_rejects_garbage() {
        assert_eq!(UnitIdentity::from_tag(""), Err(TagParseError::Empty));
        assert!(matches!(
            UnitIdentity::from_tag("X1R2C3G4"),
            Err(TagParseError::UnexpectedChar { expected: 'P', .. })
        ));
        assert!(matches!(
            UnitIdentity::from_tag("P1R2C3"),
            Err(TagParseError::UnexpectedChar { expected: 'G', .. })
        ));
        assert!(matches!(
            UnitIdentity::from_tag("P1RxC3G4"),
            Err(TagParseError::InvalidNumber { field: 'R', .. })
        ));
        assert!(UnitIdentity::from_tag("P1R2C3G4-extra").is_err());
    }

    #[test]
    fn test_known_requires_project() {
        assert!(UnitIdentity::known(0, 1, 2, 3).is_none());
        assert_eq!(
            UnitIdentity::known(5, 0, 0, 0),
            Some(UnitIdentity::new(5, 0, 0, 0))
        );
    }

    #[test]
    fn test_pass_through_set() {
        assert!(ClientStatus::Paused.is_pass_through());
        assert!(ClientStatus::Unknown.is_pass_through());
        assert!(!ClientStatus::Running.is_pass_through());
        assert!(!ClientStatus::RunningNoFrameTimes.is_pass_through());
        assert!(!ClientStatus::RunningAsync.is_pass_through());
    }

    #[test]
    fn test_worker_kind_defaults() {
        assert_eq!(WorkerKind::Cpu.hang_multiplier(), 2);
        assert_eq!(WorkerKind::Gpu.hang_multiplier(), 7);
        assert_eq!(WorkerKind::Cpu.default_frame_time(), Duration::from_secs(3600));
        assert_eq!(WorkerKind::Gpu.default_frame_time(), Duration::from_secs(600));
    }

    #[test]
    fn test_unit_result_from_core_text() {
        assert_eq!(
            UnitResult::from_core_text("FINISHED_UNIT"),
            UnitResult::FinishedUnit
        );
        assert_eq!(
            UnitResult::from_core_text(" UNSTABLE_MACHINE "),
            UnitResult::UnstableMachine
        );
        assert_eq!(UnitResult::from_core_text("SOMETHING"), UnitResult::Unknown);
        assert!(UnitResult::Interrupted.is_counted_failure());
        assert!(!UnitResult::BadWorkUnit.is_counted_failure());
        assert!(!UnitResult::FinishedUnit.is_counted_failure());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ClientStatus::RunningNoFrameTimes).unwrap();
        assert_eq!(json, "\"running_no_frame_times\"");
    }

    proptest! {
        #[test]
        fn test_tag_round_trip(p in any::<u32>(), r in any::<u32>(), c in any::<u32>(), g in any::<u32>()) {
            let id = UnitIdentity::new(p, r, c, g);
            prop_assert_eq!(UnitIdentity::from_tag(&id.tag()), Ok(id));
        }

        #[test]
        fn test_from_tag_no_panic(s in ".*") {
            let _ = UnitIdentity::from_tag(&s);
        }
    }
}
