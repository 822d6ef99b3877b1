//! Rolling frame-time benchmarks per (worker, project).
//!
//! Each [`Benchmark`] keeps the most recent [`MAX_FRAME_TIMES`] frame
//! durations newest first, plus the smallest duration ever accepted. The
//! [`BenchmarkStore`] shares them between poll tasks and persists them as a
//! JSON document.

use foldwatch_common::types::WorkerName;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Frame durations retained per benchmark.
pub const MAX_FRAME_TIMES: usize = 300;

const FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BenchmarkStoreError {
    #[error("benchmark file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid benchmark file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported benchmark file version {found} in {path}")]
    Version { path: PathBuf, found: u32 },
}

/// Normalize a worker path for benchmark keys: trimmed, forward slashes, no
/// trailing slash, lowercase.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.trim_end_matches('/').to_lowercase()
}

/// Identifies one benchmark. Equality is exact on all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BenchmarkKey {
    pub worker_name: WorkerName,
    pub worker_path: String,
    pub project: u32,
}

impl BenchmarkKey {
    pub fn new(worker_name: WorkerName, worker_path: &str, project: u32) -> Self {
        Self {
            worker_name,
            worker_path: normalize_path(worker_path),
            project,
        }
    }
}

/// Frame-time history for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Benchmark {
    frame_times: VecDeque<Duration>,
    minimum_frame_time: Duration,
}

impl Benchmark {
    /// Record a frame duration. Zero durations are rejected.
    pub fn set_frame_time(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return false;
        }

        if self.minimum_frame_time.is_zero() || duration < self.minimum_frame_time {
            self.minimum_frame_time = duration;
        }

        self.frame_times.push_front(duration);
        self.frame_times.truncate(MAX_FRAME_TIMES);
        true
    }

    /// Mean of the stored durations in whole seconds, rounded down. Zero when
    /// nothing is stored.
    pub fn average_frame_time(&self) -> Duration {
        if self.frame_times.is_empty() {
            return Duration::ZERO;
        }
        let total: u64 = self.frame_times.iter().map(Duration::as_secs).sum();
        Duration::from_secs(total / self.frame_times.len() as u64)
    }

    /// Recompute the minimum from the stored durations.
    pub fn refresh_minimum(&mut self) {
        self.minimum_frame_time = self
            .frame_times
            .iter()
            .copied()
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or_default();
    }

    pub fn minimum_frame_time(&self) -> Duration {
        self.minimum_frame_time
    }

    /// Stored durations, newest first.
    pub fn frame_times(&self) -> &VecDeque<Duration> {
        &self.frame_times
    }

    pub fn len(&self) -> usize {
        self.frame_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_times.is_empty()
    }
}

/// Printable per-key summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchmarkSummary {
    #[serde(flatten)]
    pub key: BenchmarkKey,
    pub samples: usize,
    pub minimum_secs: u64,
    pub average_secs: u64,
}

#[derive(Serialize, Deserialize)]
struct BenchmarkEntry {
    #[serde(flatten)]
    key: BenchmarkKey,
    /// Newest first, in seconds.
    frame_times_secs: Vec<u64>,
    minimum_frame_time_secs: u64,
}

#[derive(Serialize, Deserialize)]
struct BenchmarkFile {
    version: u32,
    benchmarks: Vec<BenchmarkEntry>,
}

/// Benchmarks shared by every poll task.
#[derive(Debug, Default)]
pub struct BenchmarkStore {
    benchmarks: RwLock<HashMap<BenchmarkKey, Benchmark>>,
}

impl BenchmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record durations oldest first, creating the benchmark on first use.
    /// Returns how many were accepted.
    pub fn record_frame_times<I>(&self, key: &BenchmarkKey, durations: I) -> usize
    where
        I: IntoIterator<Item = Duration>,
    {
        let mut durations = durations.into_iter().filter(|d| !d.is_zero()).peekable();
        if durations.peek().is_none() {
            return 0;
        }
        let mut benchmarks = self.benchmarks.write().unwrap_or_else(|e| e.into_inner());
        let benchmark = benchmarks.entry(key.clone()).or_default();
        durations.filter(|d| benchmark.set_frame_time(*d)).count()
    }

    /// Copy of one benchmark, taken under the read lock.
    pub fn snapshot(&self, key: &BenchmarkKey) -> Option<Benchmark> {
        let benchmarks = self.benchmarks.read().unwrap_or_else(|e| e.into_inner());
        benchmarks.get(key).cloned()
    }

    pub fn average_frame_time(&self, key: &BenchmarkKey) -> Duration {
        self.snapshot(key)
            .map(|b| b.average_frame_time())
            .unwrap_or_default()
    }

    /// Drop every benchmark of a worker. Returns how many were removed.
    pub fn remove_worker(&self, worker_name: &WorkerName) -> usize {
        let mut benchmarks = self.benchmarks.write().unwrap_or_else(|e| e.into_inner());
        let before = benchmarks.len();
        benchmarks.retain(|key, _| &key.worker_name != worker_name);
        before - benchmarks.len()
    }

    pub fn len(&self) -> usize {
        self.benchmarks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries sorted by key, optionally limited to one worker.
    pub fn summaries(&self, worker_name: Option<&WorkerName>) -> Vec<BenchmarkSummary> {
        let benchmarks = self.benchmarks.read().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<_> = benchmarks
            .iter()
            .filter(|(key, _)| worker_name.is_none_or(|name| &key.worker_name == name))
            .map(|(key, benchmark)| BenchmarkSummary {
                key: key.clone(),
                samples: benchmark.len(),
                minimum_secs: benchmark.minimum_frame_time.as_secs(),
                average_secs: benchmark.average_frame_time().as_secs(),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Write all benchmarks to `path` (temp file + rename).
    pub fn save_to_file(&self, path: &Path) -> Result<(), BenchmarkStoreError> {
        let io_err = |source| BenchmarkStoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = {
            let benchmarks = self.benchmarks.read().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<_> = benchmarks
                .iter()
                .map(|(key, benchmark)| BenchmarkEntry {
                    key: key.clone(),
                    frame_times_secs: benchmark.frame_times.iter().map(Duration::as_secs).collect(),
                    minimum_frame_time_secs: benchmark.minimum_frame_time.as_secs(),
                })
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            BenchmarkFile {
                version: FILE_VERSION,
                benchmarks: entries,
            }
        };

        let json = serde_json::to_vec_pretty(&file).map_err(|source| BenchmarkStoreError::Format {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let temp_path = path.with_extension("tmp");
        {
            let mut temp = File::create(&temp_path).map_err(io_err)?;
            temp.write_all(&json).map_err(io_err)?;
            temp.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&temp_path, path).map_err(io_err)?;

        debug!(path = %path.display(), count = file.benchmarks.len(), "Saved benchmarks");
        Ok(())
    }

    /// Load benchmarks written by [`save_to_file`](Self::save_to_file).
    /// Minimums are recomputed from the stored durations.
    pub fn load_from_file(path: &Path) -> Result<Self, BenchmarkStoreError> {
        let file = File::open(path).map_err(|source| BenchmarkStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: BenchmarkFile = serde_json::from_reader(BufReader::new(file)).map_err(
            |source| BenchmarkStoreError::Format {
                path: path.to_path_buf(),
                source,
            },
        )?;
        if parsed.version != FILE_VERSION {
            return Err(BenchmarkStoreError::Version {
                path: path.to_path_buf(),
                found: parsed.version,
            });
        }

        let mut benchmarks = HashMap::with_capacity(parsed.benchmarks.len());
        for entry in parsed.benchmarks {
            if entry.frame_times_secs.len() > MAX_FRAME_TIMES {
                warn!(
                    worker = %entry.key.worker_name,
                    project = entry.key.project,
                    count = entry.frame_times_secs.len(),
                    "Truncating oversized benchmark"
                );
            }
            let mut benchmark = Benchmark {
                frame_times: entry
                    .frame_times_secs
                    .into_iter()
                    .filter(|secs| *secs > 0)
                    .take(MAX_FRAME_TIMES)
                    .map(Duration::from_secs)
                    .collect(),
                minimum_frame_time: Duration::from_secs(entry.minimum_frame_time_secs),
            };
            benchmark.refresh_minimum();
            benchmarks.insert(entry.key, benchmark);
        }

        debug!(path = %path.display(), count = benchmarks.len(), "Loaded benchmarks");
        Ok(Self {
            benchmarks: RwLock::new(benchmarks),
        })
    }
}
