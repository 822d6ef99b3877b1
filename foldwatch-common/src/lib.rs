//! Shared types, configuration and logging for foldwatch.

pub mod config;
pub mod logging;
pub mod ring;
pub mod testing;
pub mod types;

pub use config::{FoldwatchConfig, FrameTimeMethod, TransportKind, WorkerConfig};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use ring::RingIter;
pub use types::{ClientStatus, UnitIdentity, UnitResult, WorkerKind, WorkerName};
