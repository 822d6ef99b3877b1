//! Configuration: TOML file, `FOLDWATCH_*` environment overrides and value
//! source tracking.

pub mod env;
pub mod file;
pub mod source;

pub use env::{EnvError, EnvParser, expand_home};
pub use file::{
    ConfigError, ConfigIssue, FoldwatchConfig, FrameTimeMethod, GeneralConfig, Severity,
    TransportKind, WorkerConfig,
};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
