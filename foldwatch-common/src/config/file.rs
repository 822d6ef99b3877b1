//! TOML configuration file for the daemon and its monitored workers.

use super::env::{EnvError, EnvParser, expand_home};
use crate::types::{WorkerKind, WorkerName};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

/// How the worker's files are retrieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local or mounted directory.
    #[default]
    Path,
    /// HTTP(S) base URL.
    Http,
    /// FTP server (not supported by the bundled fetchers).
    Ftp,
}

/// Which recent frames feed the frame-time estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTimeMethod {
    LastFrame,
    #[default]
    LastThreeFrames,
    AllFrames,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FoldwatchConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for rolling log files; console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Directory holding benchmarks.json and completed.jsonl.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Interval between poll cycles, e.g. "5m".
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: Duration,
    /// Whether late frames may be excused by other recent progress.
    #[serde(default = "default_true")]
    pub allow_running_async: bool,
    /// Frame selection for the frame-time estimate.
    #[serde(default)]
    pub frame_time_method: FrameTimeMethod,
    /// Completed units kept in memory.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            data_dir: None,
            poll_interval: default_poll_interval(),
            allow_running_async: true,
            frame_time_method: FrameTimeMethod::default(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl GeneralConfig {
    /// Data directory, falling back to the platform data dir.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(|| {
            directories::ProjectDirs::from("org", "foldwatch", "foldwatch")
                .map(|dirs| dirs.data_dir().to_path_buf())
        })
    }
}

/// One monitored worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: WorkerName,
    /// Directory path or base URL of the worker's files.
    pub path: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub kind: WorkerKind,
    /// Minutes the worker's clock runs ahead of true time.
    #[serde(default)]
    pub client_time_offset_minutes: i64,
    /// Treat log times as local wall-clock (e.g. worker inside a VM).
    #[serde(default)]
    pub ignore_utc_offset: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_unit_info_file")]
    pub unit_info_file: String,
    #[serde(default = "default_queue_file")]
    pub queue_file: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl WorkerConfig {
    /// A path-transport worker with default file names.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: WorkerName::new(name),
            path: path.into(),
            transport: TransportKind::Path,
            kind: WorkerKind::Cpu,
            client_time_offset_minutes: 0,
            ignore_utc_offset: false,
            username: None,
            password: None,
            log_file: default_log_file(),
            unit_info_file: default_unit_info_file(),
            queue_file: default_queue_file(),
            enabled: true,
        }
    }

    pub fn client_time_offset(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.client_time_offset_minutes)
    }
}

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub severity: Severity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

impl FoldwatchConfig {
    /// Default configuration file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("org", "foldwatch", "foldwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the default configuration;
    /// an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !explicit && !path.exists() {
            info!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&text, &path)?;
        debug!(
            path = %path.display(),
            workers = config.workers.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply `FOLDWATCH_*` overrides, returning any malformed variables.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvError> {
        let mut parser = EnvParser::new();

        let level = parser.get_log_level("LOG_LEVEL", &self.general.log_level);
        if level.is_overridden() {
            self.general.log_level = level.value;
        }

        let interval = parser.get_u64_range(
            "POLL_INTERVAL_SECS",
            self.general.poll_interval.as_secs(),
            1,
            86_400,
        );
        if interval.is_overridden() {
            self.general.poll_interval = Duration::from_secs(interval.value);
        }

        let allow_async = parser.get_bool("ALLOW_RUNNING_ASYNC", self.general.allow_running_async);
        if allow_async.is_overridden() {
            self.general.allow_running_async = allow_async.value;
        }

        let data_dir = parser.get_path("DATA_DIR", "");
        if data_dir.is_overridden() {
            self.general.data_dir = Some(data_dir.value);
        }

        let log_dir = parser.get_optional_string("LOG_DIR");
        if log_dir.is_overridden() {
            self.general.log_dir = log_dir.value.as_deref().map(expand_home);
        }

        parser.take_errors()
    }

    /// Report settings the daemon cannot work with (errors) or that look wrong
    /// (warnings).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.workers.is_empty() {
            issues.push(ConfigIssue::warning("no workers configured"));
        }

        if self.general.poll_interval < Duration::from_secs(10) {
            issues.push(ConfigIssue::warning(format!(
                "poll_interval {} is shorter than 10s",
                humantime::format_duration(self.general.poll_interval)
            )));
        }

        if self.general.history_capacity == 0 {
            issues.push(ConfigIssue::error("history_capacity must be at least 1"));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.name.as_str()) {
                issues.push(ConfigIssue::error(format!(
                    "duplicate worker name '{}'",
                    worker.name
                )));
            }
            if worker.path.trim().is_empty() {
                issues.push(ConfigIssue::error(format!(
                    "worker '{}' has an empty path",
                    worker.name
                )));
            }
            match worker.transport {
                TransportKind::Http
                    if !(worker.path.starts_with("http://")
                        || worker.path.starts_with("https://")) =>
                {
                    issues.push(ConfigIssue::error(format!(
                        "worker '{}' uses http transport but path is not a URL",
                        worker.name
                    )));
                }
                TransportKind::Ftp => issues.push(ConfigIssue::warning(format!(
                    "worker '{}' uses ftp transport, which is not supported",
                    worker.name
                ))),
                _ => {}
            }
            if worker.client_time_offset_minutes.abs() > 12 * 60 {
                issues.push(ConfigIssue::warning(format!(
                    "worker '{}' client time offset exceeds 12 hours",
                    worker.name
                )));
            }
        }

        issues
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_history_capacity() -> usize {
    500
}

fn default_log_file() -> String {
    "FAHlog.txt".to_string()
}

fn default_unit_info_file() -> String {
    "unitinfo.txt".to_string()
}

fn default_queue_file() -> String {
    "queue.dat".to_string()
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
log_level = "debug"
poll_interval = "2m 30s"
allow_running_async = false
frame_time_method = "all_frames"

[[workers]]
name = "rig-01"
path = "/srv/fah/rig-01"
kind = "gpu"
client_time_offset_minutes = -5

[[workers]]
name = "rig-02"
path = "http://rig-02.lan/fah"
transport = "http"
username = "monitor"
password = "secret"
"#;

    #[test]
    fn test_parse_sample() {
        let config = FoldwatchConfig::from_toml(SAMPLE, Path::new("sample.toml")).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.poll_interval, Duration::from_secs(150));
        assert!(!config.general.allow_running_async);
        assert_eq!(config.general.frame_time_method, FrameTimeMethod::AllFrames);
        assert_eq!(config.general.history_capacity, 500);

        assert_eq!(config.workers.len(), 2);
        let rig1 = &config.workers[0];
        assert_eq!(rig1.kind, WorkerKind::Gpu);
        assert_eq!(rig1.transport, TransportKind::Path);
        assert_eq!(rig1.client_time_offset(), chrono::Duration::minutes(-5));
        assert_eq!(rig1.log_file, "FAHlog.txt");
        assert_eq!(rig1.queue_file, "queue.dat");
        assert!(rig1.enabled);

        let rig2 = &config.workers[1];
        assert_eq!(rig2.transport, TransportKind::Http);
        assert_eq!(rig2.username.as_deref(), Some("monitor"));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = FoldwatchConfig::from_toml("", Path::new("empty.toml")).unwrap();
        assert_eq!(config.general.poll_interval, Duration::from_secs(300));
        assert!(config.general.allow_running_async);
        assert_eq!(
            config.general.frame_time_method,
            FrameTimeMethod::LastThreeFrames
        );
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = FoldwatchConfig::from_toml(
            "[general]\npoll_interval = \"soon\"\n",
            Path::new("bad.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_catches_errors() {
        let mut config = FoldwatchConfig::default();
        config.workers.push(WorkerConfig::new("a", "/x"));
        config.workers.push(WorkerConfig::new("a", ""));
        let mut http = WorkerConfig::new("b", "/not/a/url");
        http.transport = TransportKind::Http;
        config.workers.push(http);

        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == Severity::Error)
            .collect();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FoldwatchConfig::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = FoldwatchConfig::load(Some(&path)).unwrap();
        assert_eq!(config.workers.len(), 2);
    }

    #[test]
    fn test_round_trip_serialization_keeps_interval() {
        let config = FoldwatchConfig::from_toml(SAMPLE, Path::new("sample.toml")).unwrap();
        let text = toml::to_string(&config).unwrap();
        let back = FoldwatchConfig::from_toml(&text, Path::new("back.toml")).unwrap();
        assert_eq!(back.general.poll_interval, config.general.poll_interval);
    }
}
