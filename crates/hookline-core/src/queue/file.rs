//! File-backed event store.
//!
//! Layout under the data directory:
//! - `pending.jsonl`, `processing.jsonl`, `failed.jsonl`: the partitions
//! - `spool/<id>.json`: appended records not yet folded into `pending.jsonl`
//! - `store.journal`: commit journal (see [`super::journal`])
//! - `store.lock`: held for the duration of each mutation
//!
//! `append` only ever writes a new spool file, so capture never waits for the
//! worker. Everything else runs under `store.lock`: replay a leftover
//! journal, load all partitions plus the spool, apply the change in memory,
//! commit through the journal.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::journal::{self, Journal};
use super::lock::LockFile;
use super::{EventRecord, Partition, Snapshot, jsonl};
use crate::domain::{EventId, Resolution};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::paths::DataPaths;
use crate::ports::{Clock, EventStore};

/// A `store.lock` whose holder has not finished within this time is dead.
pub const STORE_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long a mutation waits for `store.lock`.
pub const STORE_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Spool temp files older than this were left by a crashed capture.
const ABANDONED_TMP_AGE: Duration = Duration::from_secs(3600);

pub struct FileEventStore {
    paths: DataPaths,
    clock: Arc<dyn Clock>,
    lock: LockFile,
    lock_wait: Duration,
}

/// Snapshot as read from disk, before any change.
struct Loaded {
    snapshot: Snapshot,
    consumed_spool: Vec<String>,

    /// Loading itself changed something (spool folded, line quarantined,
    /// duplicate dropped) and is worth committing.
    dirty: bool,
}

impl FileEventStore {
    /// Open (creating directories as needed) the store under `paths.root`.
    pub fn open(paths: DataPaths, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        fs::create_dir_all(&paths.spool_dir).map_err(StoreError::io(&paths.spool_dir))?;
        let lock = LockFile::new(paths.store_lock.clone(), STORE_LOCK_STALE_AFTER);
        Ok(Self {
            paths,
            clock,
            lock,
            lock_wait: STORE_LOCK_WAIT,
        })
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// Run `op` on the current snapshot under the store lock and commit the
    /// result if anything changed.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut Snapshot, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.acquire(self.lock_wait)?;
        journal::replay(&self.paths)?;

        let now = self.clock.now();
        let loaded = self.load(now)?;
        let mut snapshot = loaded.snapshot.clone();
        let out = op(&mut snapshot, now)?;

        if loaded.dirty || snapshot != loaded.snapshot {
            Journal {
                snapshot,
                consumed_spool: loaded.consumed_spool,
            }
            .commit(&self.paths)?;
        }
        Ok(out)
    }

    fn load(&self, now: DateTime<Utc>) -> Result<Loaded, StoreError> {
        let mut snapshot = Snapshot::default();
        let mut quarantined = Vec::new();

        for partition in Partition::ALL {
            let (records, bad) = jsonl::read_records(&self.paths.partition(partition), now)?;
            quarantined.extend(bad);
            match partition {
                Partition::Pending => snapshot.pending = records,
                Partition::Processing => snapshot.processing = records,
                Partition::Failed => snapshot.failed = records,
            }
        }

        let (spooled, bad, consumed_spool) = self.read_spool(now)?;
        snapshot.pending.extend(spooled);
        quarantined.extend(bad);

        let had_quarantine = !quarantined.is_empty();
        snapshot.failed.extend(quarantined);
        let duplicates = snapshot.dedup();
        if duplicates > 0 {
            debug!(duplicates, "dropped duplicate records while loading");
        }

        Ok(Loaded {
            dirty: had_quarantine || duplicates > 0 || !consumed_spool.is_empty(),
            snapshot,
            consumed_spool,
        })
    }

    /// Spool records in id order, plus quarantined unreadable ones, plus the
    /// file names read.
    fn read_spool(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<EventRecord>, Vec<EventRecord>, Vec<String>), StoreError> {
        let dir = &self.paths.spool_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((Vec::new(), Vec::new(), Vec::new()));
            }
            Err(e) => return Err(StoreError::io(dir)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StoreError::io(dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                // capture in progress, or abandoned by one that crashed
                remove_if_abandoned(&entry);
                continue;
            }
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        // ULID file names sort by creation time
        names.sort();

        let mut records = Vec::new();
        let mut quarantined = Vec::new();
        for name in &names {
            let path = dir.join(name);
            let text = fs::read_to_string(&path).map_err(StoreError::io(&path))?;
            match serde_json::from_str::<EventRecord>(&text) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let origin = format!("spool/{name}");
                    warn!(origin = %origin, error = %e, "quarantining unreadable spool file");
                    quarantined.push(EventRecord::quarantined(&text, &origin, &e.to_string(), now));
                }
            }
        }
        Ok((records, quarantined, names))
    }
}

fn remove_if_abandoned(entry: &fs::DirEntry) {
    let age = entry
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok());
    if age.is_some_and(|age| age > ABANDONED_TMP_AGE) {
        debug!(path = %entry.path().display(), "removing abandoned spool temp file");
        let _ = fs::remove_file(entry.path());
    }
}

impl EventStore for FileEventStore {
    fn append(&self, record: &EventRecord) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(record).map_err(StoreError::encode(format!("record {}", record.id)))?;
        let path = self.paths.spool_dir.join(record.id.spool_file_name());
        jsonl::write_atomic(&path, &bytes)
    }

    fn claim_pending(&self, limit: Option<usize>) -> Result<Vec<EventRecord>, StoreError> {
        self.mutate(|snapshot, now| Ok(snapshot.claim(now, limit)))
    }

    fn resolve(&self, id: EventId, resolution: &Resolution) -> Result<(), StoreError> {
        self.mutate(|snapshot, now| snapshot.resolve(id, resolution, now))
    }

    fn sweep_orphans(&self, processing_timeout: Duration) -> Result<Vec<EventId>, StoreError> {
        self.mutate(|snapshot, now| Ok(snapshot.sweep_orphans(now, processing_timeout)))
    }

    fn fail_exhausted(&self, max_retry_count: u32) -> Result<Vec<EventId>, StoreError> {
        self.mutate(|snapshot, _| Ok(snapshot.fail_exhausted(max_retry_count)))
    }

    fn list_failed(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.mutate(|snapshot, _| Ok(snapshot.failed.clone()))
    }

    fn reset_failed(&self, ids: Option<&[EventId]>) -> Result<Vec<EventId>, StoreError> {
        self.mutate(|snapshot, now| Ok(snapshot.reset_failed(ids, now)))
    }

    fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.mutate(|snapshot, _| {
            Ok(QueueCounts {
                pending: snapshot.pending.len(),
                processing: snapshot.processing.len(),
                failed: snapshot.failed.len(),
            })
        })
    }

    fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.mutate(|snapshot, _| Ok(snapshot.next_eligible_at()))
    }
}
