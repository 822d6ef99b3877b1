//! Shared helpers for foldwatchd integration tests.

#![allow(dead_code)]

pub use foldwatch_common::testing::init_test_logging;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const FAH_LOG: &str = include_str!("../fixtures/FAHlog.txt");
pub const UNIT_INFO: &str = include_str!("../fixtures/unitinfo.txt");

/// A temporary config, data directory and one worker directory.
pub struct Sandbox {
    pub root: TempDir,
    pub config: PathBuf,
    pub data_dir: PathBuf,
    pub worker_dir: PathBuf,
}

impl Sandbox {
    /// Worker `rig-1` with the fixture log and unit-info, no queue file.
    pub fn new() -> Self {
        Self::with_general("")
    }

    /// Like [`Sandbox::new`], with extra `[general]` lines.
    pub fn with_general(extra: &str) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let data_dir = root.path().join("data");
        let worker_dir = root.path().join("rig-1");
        std::fs::create_dir_all(&worker_dir).expect("worker dir");
        std::fs::write(worker_dir.join("FAHlog.txt"), FAH_LOG).expect("log fixture");
        std::fs::write(worker_dir.join("unitinfo.txt"), UNIT_INFO).expect("unitinfo fixture");

        let config = root.path().join("config.toml");
        std::fs::write(
            &config,
            format!(
                "[general]\n\
                 data_dir = '{}'\n\
                 poll_interval = \"5m\"\n\
                 {extra}\n\
                 \n\
                 [[workers]]\n\
                 name = \"rig-1\"\n\
                 path = '{}'\n\
                 kind = \"cpu\"\n",
                data_dir.display(),
                worker_dir.display(),
            ),
        )
        .expect("config");

        Self {
            root,
            config,
            data_dir,
            worker_dir,
        }
    }

    /// Run foldwatchd with this sandbox's config.
    pub fn run(&self, args: &[&str]) -> Output {
        foldwatchd(Some(&self.config), args)
    }
}

/// Run the daemon binary with a clean environment for foldwatch variables.
pub fn foldwatchd(config: Option<&Path>, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_foldwatchd"));
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("FOLDWATCH_") {
            command.env_remove(key);
        }
    }
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }
    command
        .args(args)
        .output()
        .expect("failed to run foldwatchd")
}
