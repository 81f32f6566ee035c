//! Advisory lock files with a heartbeat.
//!
//! A lock is a file created with `create_new` holding `{pid, token, heartbeat}`.
//! A holder that stops refreshing its heartbeat for longer than `stale_after`
//! is presumed dead and its lock may be broken.
//!
//! Used for `store.lock` (held for one mutation) and `worker.lock` (held for
//! the life of the worker).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use super::jsonl;
use crate::error::StoreError;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub token: String,
    pub heartbeat: DateTime<Utc>,
}

impl LockHolder {
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        crate::queue::record::add_duration(self.heartbeat, stale_after) < now
    }
}

#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    stale_after: Duration,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current holder, if the file exists and is readable.
    pub fn holder(&self) -> Option<LockHolder> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Is somebody holding this lock with a fresh heartbeat?
    pub fn is_held_fresh(&self) -> bool {
        self.path.exists() && self.read_stale(&self.path).is_none()
    }

    /// Take the lock if nobody fresh holds it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, StoreError> {
        // second round only after breaking a stale lock
        for _ in 0..2 {
            let holder = LockHolder {
                pid: std::process::id(),
                token: Ulid::new().to_string(),
                heartbeat: Utc::now(),
            };

            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let bytes = serde_json::to_vec(&holder)
                        .map_err(StoreError::encode("lock holder"))?;
                    file.write_all(&bytes)
                        .and_then(|()| file.sync_all())
                        .map_err(StoreError::io(&self.path))?;
                    return Ok(Some(LockGuard {
                        path: self.path.clone(),
                        token: holder.token,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !self.break_if_stale()? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(StoreError::io(&self.path)(e)),
            }
        }
        Ok(None)
    }

    /// Take the lock, retrying until `wait` has elapsed.
    pub fn acquire(&self, wait: Duration) -> Result<LockGuard, StoreError> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if started.elapsed() >= wait {
                return Err(StoreError::LockTimeout {
                    path: self.path.clone(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Returns true when the caller may try again.
    fn break_if_stale(&self) -> Result<bool, StoreError> {
        match self.read_stale(&self.path) {
            Some(seen) => self.break_stale(&seen),
            None => Ok(false),
        }
    }

    /// Move the lock file aside and delete it only if it still holds the
    /// stale contents `seen`. Anything else was written by a live holder
    /// after we looked and is put back.
    fn break_stale(&self, seen: &[u8]) -> Result<bool, StoreError> {
        let tombstone = self.path.with_extension(format!("stale-{}", Ulid::new()));
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            // another contender got there first
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(StoreError::io(&self.path)(e)),
        }

        if self.read_stale(&tombstone).as_deref() == Some(seen) {
            warn!(path = %self.path.display(), "breaking stale lock");
            jsonl::remove_if_exists(&tombstone)?;
            return Ok(true);
        }

        // hard_link never replaces a lock created in the meantime
        if let Err(e) = fs::hard_link(&tombstone, &self.path) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "could not restore a live lock moved aside"
            );
        }
        jsonl::remove_if_exists(&tombstone)?;
        Ok(false)
    }

    /// Raw contents of the lock file at `path` when its holder looks dead.
    fn read_stale(&self, path: &Path) -> Option<Vec<u8>> {
        let bytes = fs::read(path).ok()?;
        let stale = match serde_json::from_slice::<LockHolder>(&bytes) {
            Ok(holder) => holder.is_stale(Utc::now(), self.stale_after),
            // being written right now, or garbage left by a crash
            Err(_) => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > self.stale_after),
        };
        stale.then_some(bytes)
    }
}

/// Proof of holding a lock. The file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    /// Refresh the heartbeat so others keep treating the lock as live.
    ///
    /// Fails with [`StoreError::LockLost`] once the file no longer carries
    /// our token: the lock was judged stale and someone else may hold it.
    pub fn heartbeat(&self) -> Result<(), StoreError> {
        let ours = match fs::read(&self.path) {
            Ok(bytes) => self.owns(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(&self.path)(e)),
        };
        if !ours {
            return Err(StoreError::LockLost {
                path: self.path.clone(),
            });
        }

        let holder = LockHolder {
            pid: std::process::id(),
            token: self.token.clone(),
            heartbeat: Utc::now(),
        };
        let bytes = serde_json::to_vec(&holder).map_err(StoreError::encode("lock holder"))?;
        jsonl::write_atomic(&self.path, &bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn owns(&self, bytes: &[u8]) -> bool {
        serde_json::from_slice::<LockHolder>(bytes).is_ok_and(|holder| holder.token == self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // someone may have broken our lock and taken it over
        let ours = fs::read(&self.path).is_ok_and(|bytes| self.owns(&bytes));
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}
