use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter directives come from this variable, `info` when unset.
pub const LOG_ENV: &str = "HOOKLINE_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Nothing left for a worker to do (failed records only move by hand).
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Install the global subscriber writing to `log_dir/file_name`.
///
/// Hooks run with the host's stdout and stderr, so all output goes to the
/// file. Keep the returned guard alive until exit so buffered lines are
/// flushed. Returns `None` when logging could not be set up; callers carry on
/// without it.
pub fn init_tracing(log_dir: &Path, file_name: &str) -> Option<WorkerGuard> {
    std::fs::create_dir_all(log_dir).ok()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok()?;

    Some(guard)
}
