//! Transition journal: makes a commit that touches several files atomic.
//!
//! Commit protocol:
//! 1. write the complete post-mutation snapshot to `store.journal` (atomic)
//! 2. replace each partition file (atomic, one by one)
//! 3. delete the spool files folded into the snapshot
//! 4. delete the journal
//!
//! A crash before 1 completes leaves the old state. A crash after it leaves a
//! journal, and replaying steps 2 to 4 yields the new state. Replay is
//! idempotent.

use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Partition, Snapshot, jsonl};
use crate::error::StoreError;
use crate::paths::DataPaths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Journal {
    pub snapshot: Snapshot,

    /// Spool file names (not paths) already folded into `snapshot`.
    #[serde(default)]
    pub consumed_spool: Vec<String>,
}

impl Journal {
    pub fn write(&self, paths: &DataPaths) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(self).map_err(StoreError::encode("journal"))?;
        jsonl::write_atomic(&paths.journal, &bytes)
    }

    /// Leftover journal from an interrupted commit, if any.
    ///
    /// An unreadable journal is moved aside so it cannot wedge the store.
    pub fn read(paths: &DataPaths) -> Result<Option<Journal>, StoreError> {
        let bytes = match fs::read(&paths.journal) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&paths.journal)(e)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(journal) => Ok(Some(journal)),
            Err(e) => {
                let aside = paths.journal.with_extension("journal.corrupt");
                warn!(error = %e, aside = %aside.display(), "discarding unreadable journal");
                fs::rename(&paths.journal, &aside).map_err(StoreError::io(&paths.journal))?;
                Ok(None)
            }
        }
    }

    /// Steps 2 to 4 of the commit protocol.
    pub fn apply(&self, paths: &DataPaths) -> Result<(), StoreError> {
        for partition in Partition::ALL {
            let bytes = jsonl::encode_records(self.snapshot.partition(partition))?;
            jsonl::write_atomic(&paths.partition(partition), &bytes)?;
        }
        for name in &self.consumed_spool {
            jsonl::remove_if_exists(&paths.spool_dir.join(name))?;
        }
        jsonl::remove_if_exists(&paths.journal)
    }

    /// Full commit: steps 1 to 4.
    pub fn commit(&self, paths: &DataPaths) -> Result<(), StoreError> {
        self.write(paths)?;
        self.apply(paths)
    }
}

/// Finish an interrupted commit, if there is one.
pub(crate) fn replay(paths: &DataPaths) -> Result<bool, StoreError> {
    match Journal::read(paths)? {
        Some(journal) => {
            info!(
                pending = journal.snapshot.pending.len(),
                processing = journal.snapshot.processing.len(),
                failed = journal.snapshot.failed.len(),
                "replaying store journal"
            );
            journal.apply(paths)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, EventKind};
    use crate::queue::EventRecord;

    fn record() -> EventRecord {
        EventRecord::new(
            EventId::from_ulid(ulid::Ulid::new()),
            EventKind::UserMessage,
            "s",
            serde_json::json!({"content": "x"}),
            chrono::Utc::now(),
        )
    }

    fn setup() -> (tempfile::TempDir, DataPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        fs::create_dir_all(&paths.spool_dir).unwrap();
        (dir, paths)
    }

    #[test]
    fn replay_finishes_interrupted_commit() {
        let (_dir, paths) = setup();
        let r = record();
        let spool_name = r.id.spool_file_name();
        fs::write(paths.spool_dir.join(&spool_name), "{}").unwrap();

        let journal = Journal {
            snapshot: Snapshot {
                processing: vec![r.clone()],
                ..Default::default()
            },
            consumed_spool: vec![spool_name.clone()],
        };
        // crash right after step 1
        journal.write(&paths).unwrap();

        assert!(replay(&paths).unwrap());
        assert!(!paths.journal.exists());
        assert!(!paths.spool_dir.join(&spool_name).exists());

        let (processing, _) =
            jsonl::read_records(&paths.partition(Partition::Processing), chrono::Utc::now()).unwrap();
        assert_eq!(processing, vec![r]);

        // nothing left to do
        assert!(!replay(&paths).unwrap());
    }

    #[test]
    fn replay_is_idempotent() {
        let (_dir, paths) = setup();
        let journal = Journal {
            snapshot: Snapshot {
                pending: vec![record()],
                ..Default::default()
            },
            consumed_spool: vec!["gone.json".into()],
        };
        journal.write(&paths).unwrap();
        journal.apply(&paths).unwrap();
        // crashed before the journal was removed the first time
        journal.write(&paths).unwrap();
        journal.apply(&paths).unwrap();

        let (pending, _) =
            jsonl::read_records(&paths.partition(Partition::Pending), chrono::Utc::now()).unwrap();
        assert_eq!(pending, journal.snapshot.pending);
    }

    #[test]
    fn corrupt_journal_is_moved_aside() {
        let (_dir, paths) = setup();
        fs::write(&paths.journal, "{\"snapshot\":").unwrap();

        assert!(!replay(&paths).unwrap());
        assert!(!paths.journal.exists());
        assert!(paths.journal.with_extension("journal.corrupt").exists());
    }
}
