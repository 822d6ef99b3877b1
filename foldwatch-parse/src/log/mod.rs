//! Client log parsing: line classification, run segmentation and per-unit
//! summaries.

mod classify;
mod line;
mod scan;
mod unit;

pub use classify::{classify_line, classify_text};
pub use line::{FrameProgress, LineData, LineType, LogLine};
pub use scan::{ClientRun, LogScan, UnitStart};
pub use unit::{UnitFrame, UnitLog};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors reading a client log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to read log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read, classify and segment a log file.
///
/// Invalid UTF-8 is replaced rather than rejected; only a missing or
/// unreadable file is an error.
pub fn read_log_file(path: &Path) -> Result<LogScan, LogError> {
    let bytes = std::fs::read(path).map_err(|source| LogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let scan = parse_log_bytes(&bytes);
    debug!(
        path = %path.display(),
        lines = scan.lines.len(),
        runs = scan.runs.len(),
        "Parsed client log"
    );
    Ok(scan)
}

/// Classify and segment log bytes already in memory.
pub fn parse_log_bytes(bytes: &[u8]) -> LogScan {
    LogScan::from_text(&String::from_utf8_lossy(bytes))
}
