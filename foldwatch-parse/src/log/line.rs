//! Classified log lines and their typed payloads.

use chrono::NaiveTime;
use foldwatch_common::types::{ClientStatus, UnitIdentity, UnitResult};
use serde::Serialize;

/// Marker a log line was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Unknown,
    LogOpen,
    LogHeader,
    ClientVersion,
    ClientArguments,
    ClientUserNameTeam,
    ClientRegistration,
    ClientUserId,
    ClientMachineId,
    ClientAttemptGetWorkPacket,
    ClientSendWorkToServer,
    ClientAutosendStart,
    ClientAutosendComplete,
    ClientSendStart,
    ClientSendConnectFailed,
    ClientSendFailed,
    ClientSendComplete,
    ClientCoreCommunicationsErrorShutdown,
    ClientCoreCommunicationsError,
    ClientEuePauseState,
    ClientShutdown,
    ClientNumberOfUnitsCompleted,
    WorkUnitProcessing,
    WorkUnitCoreDownload,
    WorkUnitIndex,
    WorkUnitWorking,
    WorkUnitStart,
    WorkUnitCoreVersion,
    WorkUnitRunning,
    WorkUnitProject,
    WorkUnitFrame,
    WorkUnitPaused,
    WorkUnitCoreShutdown,
    WorkUnitCoreReturn,
}

impl LineType {
    /// Lines that only carry data and do not move the segmentation state
    /// machine. They are skipped when looking at "the previous line".
    pub fn is_informational(self) -> bool {
        matches!(
            self,
            Self::Unknown
                | Self::ClientVersion
                | Self::ClientArguments
                | Self::ClientUserNameTeam
                | Self::ClientRegistration
                | Self::ClientUserId
                | Self::ClientMachineId
                | Self::ClientNumberOfUnitsCompleted
                | Self::WorkUnitIndex
                | Self::WorkUnitCoreVersion
                | Self::WorkUnitProject
                | Self::WorkUnitCoreReturn
        )
    }

    /// Worker status implied by seeing this line, if any.
    ///
    /// Applied in log order; the last implication wins.
    pub fn implied_status(self) -> Option<ClientStatus> {
        match self {
            Self::ClientAttemptGetWorkPacket => Some(ClientStatus::GettingWorkPacket),
            Self::ClientSendStart | Self::ClientAutosendStart | Self::ClientSendWorkToServer => {
                Some(ClientStatus::SendingWorkPacket)
            }
            Self::WorkUnitProcessing
            | Self::WorkUnitWorking
            | Self::WorkUnitStart
            | Self::WorkUnitRunning => Some(ClientStatus::RunningNoFrameTimes),
            Self::WorkUnitFrame => Some(ClientStatus::Running),
            Self::WorkUnitPaused => Some(ClientStatus::Paused),
            Self::ClientEuePauseState => Some(ClientStatus::EuePause),
            Self::ClientShutdown | Self::ClientCoreCommunicationsErrorShutdown => {
                Some(ClientStatus::Stopped)
            }
            _ => None,
        }
    }
}

/// Progress reported by a frame-completion line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameProgress {
    /// Steps completed.
    pub raw: u64,
    /// Total steps in the unit.
    pub total: u64,
    /// Frame number (percent complete).
    pub id: u32,
}

/// Typed payload decoded from a classified line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LineData {
    None,
    Text(String),
    Number(u32),
    UserTeam { name: String, team: u32 },
    Project(UnitIdentity),
    Frame(FrameProgress),
    CoreShutdown(UnitResult),
    CoreStatus(u32),
    CoreVersion(String),
    /// The line matched its marker but the payload could not be decoded.
    Malformed(String),
}

/// One classified log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Zero-based position in the log.
    pub index: usize,
    pub line_type: LineType,
    /// `[HH:MM:SS]` prefix, when present.
    pub time_of_day: Option<NaiveTime>,
    pub data: LineData,
    pub raw: String,
}

impl LogLine {
    pub fn frame(&self) -> Option<&FrameProgress> {
        match &self.data {
            LineData::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn project(&self) -> Option<UnitIdentity> {
        match self.data {
            LineData::Project(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<u32> {
        match self.data {
            LineData::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.data {
            LineData::Text(text) | LineData::CoreVersion(text) => Some(text),
            _ => None,
        }
    }
}
