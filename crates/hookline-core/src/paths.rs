//! Locations of everything hookline keeps on disk.

use std::path::{Path, PathBuf};

use crate::queue::Partition;

/// All paths under one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub spool_dir: PathBuf,
    pub journal: PathBuf,
    pub store_lock: PathBuf,
    pub worker_lock: PathBuf,
    pub log_dir: PathBuf,
    pub user_config: PathBuf,
}

impl DataPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            spool_dir: root.join("spool"),
            journal: root.join("store.journal"),
            store_lock: root.join("store.lock"),
            worker_lock: root.join("worker.lock"),
            log_dir: root.join("logs"),
            user_config: root.join("config.json"),
        }
    }

    /// `$HOME/.hookline`, falling back to the current directory.
    pub fn default_root() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hookline")
    }

    pub fn partition(&self, partition: Partition) -> PathBuf {
        self.root.join(partition.file_name())
    }
}
