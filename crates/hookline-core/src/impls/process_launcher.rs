//! Starts the worker as a detached child process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::LaunchError;
use crate::ports::{LaunchOutcome, WorkerLauncher};
use crate::queue::LockFile;

/// Runs `program args...` with null stdio in its own process group, unless
/// `worker_lock` shows a live worker.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    worker_lock: LockFile,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, worker_lock: LockFile) -> Self {
        Self {
            program: program.into(),
            args,
            worker_lock,
        }
    }

    /// Re-run the current executable with `args` (normally `worker --data-dir ...`).
    pub fn current_exe(args: Vec<OsString>, worker_lock: LockFile) -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::Executable)?;
        Ok(Self::new(program, args, worker_lock))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn ensure_running(&self) -> Result<LaunchOutcome, LaunchError> {
        if self.worker_lock.is_held_fresh() {
            debug!(lock = %self.worker_lock.path().display(), "worker already running");
            return Ok(LaunchOutcome::AlreadyRunning);
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // survive the host killing the hook's process group
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, "spawned detached worker");

        // not waited on: the worker outlives this process
        drop(child);
        Ok(LaunchOutcome::Spawned { pid })
    }
}
