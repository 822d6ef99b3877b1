//! Retrieval of a worker's log, unit-info and queue files.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use foldwatch_common::config::{TransportKind, WorkerConfig, expand_home};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Upper bound for one downloaded file.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("GET {url} returned status {code}")]
    Status { url: String, code: u16 },

    #[error("GET {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("{transport:?} transport is not supported")]
    Unsupported { transport: TransportKind },
}

/// Where and how a worker's files are retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSource {
    pub transport: TransportKind,
    /// Directory or base URL.
    pub location: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl WorkerSource {
    pub fn from_config(worker: &WorkerConfig) -> Self {
        Self {
            transport: worker.transport,
            location: worker.path.clone(),
            username: worker.username.clone(),
            password: worker.password.clone(),
        }
    }
}

/// Retrieves one named file from a worker.
pub trait FileFetcher: Send + Sync {
    fn fetch(&self, source: &WorkerSource, file_name: &str) -> Result<Vec<u8>, FetchError>;
}

/// Reads files from a local or mounted directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathFetcher;

impl FileFetcher for PathFetcher {
    fn fetch(&self, source: &WorkerSource, file_name: &str) -> Result<Vec<u8>, FetchError> {
        let path = expand_home(source.location.trim()).join(file_name);
        std::fs::read(&path).map_err(|source| FetchError::Io { path, source })
    }
}

/// Downloads files below a base URL.
#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_HTTP_TIMEOUT)
    }
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

fn join_url(base: &str, file_name: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), file_name)
}

fn basic_auth(username: &str, password: Option<&str>) -> String {
    let credentials = format!("{username}:{}", password.unwrap_or_default());
    format!("Basic {}", STANDARD.encode(credentials))
}

impl FileFetcher for HttpFetcher {
    fn fetch(&self, source: &WorkerSource, file_name: &str) -> Result<Vec<u8>, FetchError> {
        let url = join_url(&source.location, file_name);
        let mut request = self.agent.get(&url);
        if let Some(username) = source.username.as_deref() {
            request = request.header(
                "Authorization",
                basic_auth(username, source.password.as_deref()),
            );
        }

        let mut response = request.call().map_err(|e| match e {
            ureq::Error::StatusCode(code) => FetchError::Status {
                url: url.clone(),
                code,
            },
            other => FetchError::Http {
                url: url.clone(),
                message: other.to_string(),
            },
        })?;

        response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_vec()
            .map_err(|e| FetchError::Http {
                url,
                message: e.to_string(),
            })
    }
}

/// Dispatches on the source's transport.
#[derive(Clone, Default)]
pub struct TransportFetcher {
    path: PathFetcher,
    http: HttpFetcher,
}

impl TransportFetcher {
    pub fn new(http_timeout: Duration) -> Self {
        Self {
            path: PathFetcher,
            http: HttpFetcher::new(http_timeout),
        }
    }
}

impl FileFetcher for TransportFetcher {
    fn fetch(&self, source: &WorkerSource, file_name: &str) -> Result<Vec<u8>, FetchError> {
        match source.transport {
            TransportKind::Path => self.path.fetch(source, file_name),
            TransportKind::Http => self.http.fetch(source, file_name),
            TransportKind::Ftp => Err(FetchError::Unsupported {
                transport: TransportKind::Ftp,
            }),
        }
    }
}

/// Raw files of one poll.
#[derive(Debug, Clone)]
pub struct WorkerFiles {
    pub log: Vec<u8>,
    pub unit_info: Option<Vec<u8>>,
    pub queue: Option<Vec<u8>>,
}

/// Retrieve a worker's files. The log is required; unit-info and queue are
/// fetched independently and missing ones are `None`.
pub fn fetch_files(
    fetcher: &dyn FileFetcher,
    worker: &WorkerConfig,
) -> Result<WorkerFiles, FetchError> {
    let source = WorkerSource::from_config(worker);
    let log = fetcher.fetch(&source, &worker.log_file)?;

    let optional = |file_name: &str| match fetcher.fetch(&source, file_name) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(worker = %worker.name, file = file_name, error = %e, "Optional file unavailable");
            None
        }
    };

    Ok(WorkerFiles {
        log,
        unit_info: optional(&worker.unit_info_file),
        queue: optional(&worker.queue_file),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldwatch_common::testing::init_test_logging;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tracing::info;

    #[test]
    fn test_path_fetcher_reads_optional_files_independently() {
        init_test_logging();
        info!("TEST START: test_path_fetcher_reads_optional_files_independently");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("FAHlog.txt"), "[10:00:00] hello\n").unwrap();
        std::fs::write(dir.path().join("queue.dat"), [0u8; 16]).unwrap();

        let worker = WorkerConfig::new("rig-1", dir.path().to_string_lossy());
        let files = fetch_files(&PathFetcher, &worker).unwrap();
        assert_eq!(files.log, b"[10:00:00] hello\n");
        assert!(files.unit_info.is_none());
        assert_eq!(files.queue.as_deref(), Some(&[0u8; 16][..]));
        info!("TEST PASS: test_path_fetcher_reads_optional_files_independently");
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unitinfo.txt"), "Name: x\n").unwrap();
        let worker = WorkerConfig::new("rig-1", dir.path().to_string_lossy());
        let err = fetch_files(&PathFetcher, &worker).unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[test]
    fn test_ftp_is_unsupported() {
        let mut worker = WorkerConfig::new("rig-1", "ftp.example.org/fah");
        worker.transport = TransportKind::Ftp;
        let err = fetch_files(&TransportFetcher::default(), &worker).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Unsupported {
                transport: TransportKind::Ftp
            }
        ));
    }

    #[test]
    fn test_join_url_and_basic_auth() {
        assert_eq!(
            join_url("http://host/fah/ ", "queue.dat"),
            "http://host/fah/queue.dat"
        );
        assert_eq!(join_url("http://host/fah", "FAHlog.txt"), "http://host/fah/FAHlog.txt");
        assert_eq!(basic_auth("Aladdin", Some("open sesame")), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert_eq!(basic_auth("user", None), "Basic dXNlcjo=");
    }

    struct RecordingFetcher {
        files: HashMap<&'static str, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl FileFetcher for RecordingFetcher {
        fn fetch(&self, _source: &WorkerSource, file_name: &str) -> Result<Vec<u8>, FetchError> {
            self.requested.lock().unwrap().push(file_name.to_string());
            self.files
                .get(file_name)
                .cloned()
                .ok_or_else(|| FetchError::Status {
                    url: file_name.to_string(),
                    code: 404,
                })
        }
    }

    #[test]
    fn test_custom_file_names_and_skip_after_log_failure() {
        let fetcher = RecordingFetcher {
            files: HashMap::from([("client.log", b"log".to_vec()), ("q.dat", b"q".to_vec())]),
            requested: Mutex::new(Vec::new()),
        };
        let mut worker = WorkerConfig::new("rig-1", "http://host");
        worker.log_file = "client.log".into();
        worker.queue_file = "q.dat".into();

        let files = fetch_files(&fetcher, &worker).unwrap();
        assert_eq!(files.log, b"log");
        assert!(files.unit_info.is_none());
        assert_eq!(files.queue.as_deref(), Some(&b"q"[..]));

        worker.log_file = "missing.log".into();
        fetcher.requested.lock().unwrap().clear();
        assert!(fetch_files(&fetcher, &worker).is_err());
        assert_eq!(*fetcher.requested.lock().unwrap(), vec!["missing.log".to_string()]);
    }
}
