//! Completed work-unit history.
//!
//! Ring buffer of units seen finishing, optionally appended to a JSONL file
//! so the history survives restarts. The file is rewritten with the retained
//! units once it holds more lines than the ring's capacity.

use chrono::{DateTime, Utc};
use foldwatch_common::types::{UnitIdentity, UnitResult, WorkerName};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tokio::fs::OpenOptions as AsyncOpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default maximum number of units to retain.
pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One finished unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedUnit {
    pub worker_name: WorkerName,
    pub identity: UnitIdentity,
    pub download_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub protein_name: Option<String>,
    #[serde(default)]
    pub core_version: Option<String>,
    #[serde(default)]
    pub result: UnitResult,
    /// Highest frame id logged.
    pub frames_completed: u32,
    /// Mean frame duration in seconds; zero when unknown.
    pub frame_time_secs: u64,
    pub recorded_at: DateTime<Utc>,
}

type UnitKey = (WorkerName, UnitIdentity, Option<DateTime<Utc>>);

impl CompletedUnit {
    fn key(&self) -> UnitKey {
        (self.worker_name.clone(), self.identity, self.download_time)
    }
}

struct Inner {
    units: VecDeque<CompletedUnit>,
    keys: HashSet<UnitKey>,
    /// Lines in the persistence file, as far as this process knows.
    file_lines: usize,
}

/// One write to the persistence file.
enum FileWrite {
    Append(CompletedUnit),
    Rewrite(Vec<CompletedUnit>),
}

/// Completed-unit ring buffer.
pub struct CompletedUnitHistory {
    inner: RwLock<Inner>,
    capacity: usize,
    persistence_path: Option<PathBuf>,
    /// Last persistence write; each write waits for its predecessor so the
    /// file keeps record order.
    last_write: Mutex<Option<JoinHandle<()>>>,
}

impl CompletedUnitHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                units: VecDeque::with_capacity(capacity),
                keys: HashSet::with_capacity(capacity),
                file_lines: 0,
            }),
            capacity,
            persistence_path: None,
            last_write: Mutex::new(None),
        }
    }

    /// Append every newly recorded unit to `path`.
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    /// Record a unit unless the same worker, identity and download time is
    /// already present. Returns whether it was added.
    pub fn record(&self, unit: CompletedUnit) -> bool {
        let write = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if !inner.keys.insert(unit.key()) {
                return false;
            }
            if inner.units.len() >= self.capacity
                && let Some(evicted) = inner.units.pop_front()
            {
                inner.keys.remove(&evicted.key());
            }
            inner.units.push_back(unit.clone());

            inner.file_lines += 1;
            if inner.file_lines > self.capacity {
                inner.file_lines = inner.units.len();
                FileWrite::Rewrite(inner.units.iter().cloned().collect())
            } else {
                FileWrite::Append(unit.clone())
            }
        };

        debug!(
            worker = %unit.worker_name,
            unit = %unit.identity.tag(),
            result = ?unit.result,
            "Recorded completed unit"
        );

        if let Some(path) = self.persistence_path.clone() {
            self.persist(path, write);
        }
        true
    }

    fn persist(&self, path: PathBuf, write: FileWrite) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut last_write = self.last_write.lock().unwrap_or_else(|e| e.into_inner());
                let previous = last_write.take();
                *last_write = Some(handle.spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    if let Err(e) = write_file_async(&path, &write).await {
                        warn!(path = %path.display(), error = %e, "Failed to persist completed unit");
                    }
                }));
            }
            Err(_) => {
                if let Err(e) = write_file(&path, &write) {
                    warn!(path = %path.display(), error = %e, "Failed to persist completed unit");
                }
            }
        }
    }

    /// Wait for outstanding persistence writes.
    pub async fn flush(&self) {
        let last_write = self
            .last_write
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = last_write {
            let _ = task.await;
        }
    }

    /// Most recent units first.
    pub fn recent(&self, limit: usize) -> Vec<CompletedUnit> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.units.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent units of one worker first.
    pub fn by_worker(&self, worker_name: &WorkerName, limit: usize) -> Vec<CompletedUnit> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .units
            .iter()
            .rev()
            .filter(|u| &u.worker_name == worker_name)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .units
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load history from a JSONL file, keeping the newest `capacity` units.
    /// Invalid lines are skipped.
    pub fn load_from_file(path: &Path, capacity: usize) -> Result<Self, HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);
        let history = Self::new(capacity);

        {
            let mut inner = history.inner.write().unwrap_or_else(|e| e.into_inner());
            for (number, line) in reader.lines().enumerate() {
                let line = line.map_err(io_err)?;
                if line.trim().is_empty() {
                    continue;
                }
                inner.file_lines += 1;
                match serde_json::from_str::<CompletedUnit>(&line) {
                    Ok(unit) => {
                        if !inner.keys.insert(unit.key()) {
                            continue;
                        }
                        if inner.units.len() >= history.capacity
                            && let Some(evicted) = inner.units.pop_front()
                        {
                            inner.keys.remove(&evicted.key());
                        }
                        inner.units.push_back(unit);
                    }
                    Err(e) => warn!(line = number + 1, error = %e, "Skipping invalid history line"),
                }
            }
            debug!(path = %path.display(), count = inner.units.len(), "Loaded completed units");
        }

        Ok(history)
    }
}

impl Default for CompletedUnitHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

async fn write_file_async(path: &Path, write: &FileWrite) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match write {
        FileWrite::Append(unit) => {
            let mut file = AsyncOpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            let mut line = serde_json::to_string(unit)?;
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        FileWrite::Rewrite(units) => {
            let temp_path = path.with_extension("jsonl.tmp");
            tokio::fs::write(&temp_path, to_jsonl(units)?).await?;
            tokio::fs::rename(&temp_path, path).await?;
            debug!(path = %path.display(), units = units.len(), "Compacted completed-unit history");
        }
    }
    Ok(())
}

fn write_file(path: &Path, write: &FileWrite) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match write {
        FileWrite::Append(unit) => {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{}", serde_json::to_string(unit)?)?;
        }
        FileWrite::Rewrite(units) => {
            let temp_path = path.with_extension("jsonl.tmp");
            std::fs::write(&temp_path, to_jsonl(units)?)?;
            std::fs::rename(&temp_path, path)?;
            debug!(path = %path.display(), units = units.len(), "Compacted completed-unit history");
        }
    }
    Ok(())
}

fn to_jsonl(units: &[CompletedUnit]) -> serde_json::Result<String> {
    let mut text = String::new();
    for unit in units {
        text.push_str(&serde_json::to_string(unit)?);
        text.push('\n');
    }
    Ok(text)
}
