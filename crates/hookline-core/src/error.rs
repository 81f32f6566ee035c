use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::domain::EventId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out after {waited:?} waiting for {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("lock {} is held by someone else now", .path.display())]
    LockLost { path: PathBuf },

    #[error("event {0} is not in processing")]
    NotClaimed(EventId),

    #[error("background store task failed: {0}")]
    Background(String),
}

impl StoreError {
    /// Failures that may clear up if the same call is made again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Io { .. } | StoreError::LockTimeout { .. } | StoreError::Background(_)
        )
    }

    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn encode(what: impl Into<String>) -> impl FnOnce(serde_json::Error) -> StoreError {
        let what = what.into();
        move |source| StoreError::Encode { what, source }
    }
}

/// Rejected or failed capture. Only ever logged on the host-facing path.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid capture input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot locate worker executable: {0}")]
    Executable(#[source] io::Error),
}

/// A configuration source that could not be used. The resolver logs and
/// skips it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Why a worker run stopped early.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot build backend client: {0}")]
    Backend(#[from] crate::domain::DeliveryError),
}
