//! Test logging shared by the foldwatch crates' test suites.
//!
//! ```ignore
//! use foldwatch_common::testing::init_test_logging;
//!
//! #[test]
//! fn test_example() {
//!     init_test_logging();
//!     tracing::info!("TEST START: test_example");
//! }
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

/// Install a test subscriber once per process.
///
/// Human-readable output goes through the libtest writer so it is captured
/// per test. When `FOLDWATCH_TEST_LOG_FILE` is set, every event is also
/// appended there as JSON lines. `FOLDWATCH_TEST_LOG_LEVEL` sets the filter
/// (default `info`).
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("FOLDWATCH_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".into());
        let filter = tracing_subscriber::EnvFilter::try_new(&level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let file_layer = std::env::var_os("FOLDWATCH_TEST_LOG_FILE")
            .map(PathBuf::from)
            .and_then(|path| {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                OpenOptions::new().create(true).append(true).open(path).ok()
            })
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_thread_ids(true)
            });

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer)
            .try_init();
    });
}
