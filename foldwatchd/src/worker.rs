//! Monitored workers and the state kept between their polls.

use crate::aggregator::{DisplayedUnit, UnitRecord};
use crate::status::StatusReason;
use chrono::{DateTime, Utc};
use foldwatch_common::config::WorkerConfig;
use foldwatch_common::types::{ClientStatus, WorkerName};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DisplayedUnitsError {
    #[error("displayed units I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid displayed units file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What the daemon currently knows about a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub name: WorkerName,
    pub status: ClientStatus,
    pub reason: Option<StatusReason>,
    pub last_retrieval_time: Option<DateTime<Utc>>,
    pub queue_present: bool,
    pub current_index: usize,
    pub units: Vec<Option<UnitRecord>>,
    /// Unit shown by this view; the next poll's sweep resumes after its
    /// last frame.
    pub displayed: Option<DisplayedUnit>,
    pub progress_percent: Option<u32>,
    pub frame_time_secs: u64,
    pub average_frame_time_secs: u64,
    pub time_of_last_unit_start: Option<DateTime<Utc>>,
    pub time_of_last_frame_progress: Option<DateTime<Utc>>,
    pub completed_units: u32,
    pub failed_units: u32,
    pub total_completed_units: Option<u32>,
    pub client_version: Option<String>,
    /// Last retrieval error, cleared by a successful poll.
    pub error: Option<String>,
    pub polls: u64,
}

impl WorkerView {
    pub fn new(name: WorkerName) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn current_unit(&self) -> Option<&UnitRecord> {
        self.units.get(self.current_index)?.as_ref()
    }
}

/// One configured worker.
#[derive(Debug)]
pub struct WorkerState {
    pub config: WorkerConfig,
    view: RwLock<WorkerView>,
    polling: AtomicBool,
}

impl WorkerState {
    pub fn new(config: WorkerConfig) -> Self {
        let view = WorkerView::new(config.name.clone());
        Self {
            config,
            view: RwLock::new(view),
            polling: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &WorkerName {
        &self.config.name
    }

    /// Copy of the current view.
    pub fn view(&self) -> WorkerView {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_view(&self, view: WorkerView) {
        *self.view.write().unwrap_or_else(|e| e.into_inner()) = view;
    }

    /// Claim the worker for one poll. `None` while another poll is running.
    pub fn try_begin_poll(self: &Arc<Self>) -> Option<PollGuard> {
        self.polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard {
                worker: Arc::clone(self),
            })
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }
}

/// Releases the worker's poll claim when dropped.
#[derive(Debug)]
pub struct PollGuard {
    worker: Arc<WorkerState>,
}

impl PollGuard {
    pub fn worker(&self) -> &Arc<WorkerState> {
        &self.worker
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.worker.polling.store(false, Ordering::Release);
    }
}

/// The displayed unit of every worker, optionally kept in a JSON file so a
/// restarted daemon resumes the benchmark sweep where it stopped.
#[derive(Debug, Default)]
pub struct DisplayedUnits {
    path: Option<PathBuf>,
    units: Mutex<BTreeMap<String, DisplayedUnit>>,
}

impl DisplayedUnits {
    /// Empty, written to `path` on the first change.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            units: Mutex::default(),
        }
    }

    /// Load from `path`; a missing file starts empty. Updates are written back
    /// to `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, DisplayedUnitsError> {
        let path = path.into();
        let units = match File::open(&path) {
            Ok(file) => serde_json::from_reader(BufReader::new(file)).map_err(|source| {
                DisplayedUnitsError::Format {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(DisplayedUnitsError::Io { path, source }),
        };
        Ok(Self {
            path: Some(path),
            units: Mutex::new(units),
        })
    }

    pub fn get(&self, worker_name: &WorkerName) -> Option<DisplayedUnit> {
        let units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.get(worker_name.as_str()).copied()
    }

    /// Remember a worker's displayed unit, writing the file when it changed.
    pub fn update(
        &self,
        worker_name: &WorkerName,
        displayed: Option<DisplayedUnit>,
    ) -> Result<(), DisplayedUnitsError> {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        let previous = match displayed {
            Some(unit) => units.insert(worker_name.as_str().to_string(), unit),
            None => units.remove(worker_name.as_str()),
        };
        if previous == displayed {
            return Ok(());
        }
        match self.path.as_deref() {
            Some(path) => write_json(path, &*units),
            None => Ok(()),
        }
    }
}

fn write_json(
    path: &Path,
    units: &BTreeMap<String, DisplayedUnit>,
) -> Result<(), DisplayedUnitsError> {
    let io_err = |source| DisplayedUnitsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(units).map_err(|source| DisplayedUnitsError::Format {
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
    }
    std::fs::rename(&temp_path, path).map_err(io_err)?;
    debug!(path = %path.display(), workers = units.len(), "Saved displayed units");
    Ok(())
}

/// All enabled workers, in configuration order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<Arc<WorkerState>>,
}

impl WorkerRegistry {
    pub fn from_configs(configs: impl IntoIterator<Item = WorkerConfig>) -> Self {
        Self {
            workers: configs
                .into_iter()
                .filter(|config| config.enabled)
                .map(|config| Arc::new(WorkerState::new(config)))
                .collect(),
        }
    }

    pub fn all(&self) -> &[Arc<WorkerState>] {
        &self.workers
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WorkerState>> {
        self.workers.iter().find(|w| w.name().as_str() == name)
    }

    /// Seed each worker's displayed unit from a previous session.
    pub fn resume(&self, displayed: &DisplayedUnits) {
        for worker in &self.workers {
            if let Some(unit) = displayed.get(worker.name()) {
                let mut view = worker.view();
                view.displayed = Some(unit);
                worker.set_view(view);
            }
        }
    }

    pub fn views(&self) -> Vec<WorkerView> {
        self.workers.iter().map(|w| w.view()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldwatch_common::testing::init_test_logging;
    use foldwatch_common::types::UnitIdentity;
    use tracing::info;

    #[test]
    fn test_registry_skips_disabled_workers() {
        let mut disabled = WorkerConfig::new("rig-2", "/srv/rig-2");
        disabled.enabled = false;
        let registry = WorkerRegistry::from_configs([
            WorkerConfig::new("rig-1", "/srv/rig-1"),
            disabled,
            WorkerConfig::new("rig-3", "/srv/rig-3"),
        ]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("rig-2").is_none());
        assert_eq!(registry.get("rig-3").unwrap().config.path, "/srv/rig-3");
        assert_eq!(registry.views()[0].name, WorkerName::new("rig-1"));
    }

    #[test]
    fn test_poll_guard_is_exclusive_and_released_on_drop() {
        let worker = Arc::new(WorkerState::new(WorkerConfig::new("rig-1", "/srv")));
        let guard = worker.try_begin_poll().unwrap();
        assert!(worker.is_polling());
        assert!(worker.try_begin_poll().is_none());
        drop(guard);
        assert!(!worker.is_polling());
        assert!(worker.try_begin_poll().is_some());
    }

    #[test]
    fn test_displayed_units_survive_reload() {
        init_test_logging();
        info!("TEST START: test_displayed_units_survive_reload");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("displayed.json");
        let unit = DisplayedUnit {
            identity: UnitIdentity::new(2677, 10, 29, 28),
            download_time: None,
            last_frame_id: Some(3),
        };

        let displayed = DisplayedUnits::load(&path).unwrap();
        assert!(displayed.get(&WorkerName::new("rig-1")).is_none());
        displayed.update(&WorkerName::new("rig-1"), Some(unit)).unwrap();
        assert!(path.exists());

        let reloaded = DisplayedUnits::load(&path).unwrap();
        assert_eq!(reloaded.get(&WorkerName::new("rig-1")), Some(unit));

        let registry = WorkerRegistry::from_configs([
            WorkerConfig::new("rig-1", "/srv/rig-1"),
            WorkerConfig::new("rig-2", "/srv/rig-2"),
        ]);
        registry.resume(&reloaded);
        assert_eq!(registry.views()[0].displayed, Some(unit));
        assert_eq!(registry.views()[0].polls, 0);
        assert!(registry.views()[1].displayed.is_none());

        reloaded.update(&WorkerName::new("rig-1"), None).unwrap();
        assert!(DisplayedUnits::load(&path).unwrap().get(&WorkerName::new("rig-1")).is_none());
        info!("TEST PASS: test_displayed_units_survive_reload");
    }

    #[test]
    fn test_corrupt_displayed_units_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("displayed.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            DisplayedUnits::load(&path),
            Err(DisplayedUnitsError::Format { .. })
        ));
    }

    #[test]
    fn test_view_roundtrip() {
        let worker = WorkerState::new(WorkerConfig::new("rig-1", "/srv"));
        assert_eq!(worker.view().status, ClientStatus::Unknown);
        let mut view = worker.view();
        view.status = ClientStatus::Running;
        view.polls = 3;
        worker.set_view(view.clone());
        assert_eq!(worker.view(), view);
        assert!(view.current_unit().is_none());
    }
}
