//! JSON-lines partition files and atomic file replacement.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::EventRecord;
use crate::error::StoreError;

/// Read every record of a partition file.
///
/// A missing file is an empty partition. Lines that do not parse come back in
/// the second vector as quarantined records; the rest of the file is kept.
pub(crate) fn read_records(
    path: &Path,
    now: DateTime<Utc>,
) -> Result<(Vec<EventRecord>, Vec<EventRecord>), StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
        Err(e) => return Err(StoreError::io(path)(e)),
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut records = Vec::new();
    let mut quarantined = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                let origin = format!("{name} line {}", index + 1);
                warn!(origin = %origin, error = %e, "quarantining unreadable record");
                quarantined.push(EventRecord::quarantined(line, &origin, &e.to_string(), now));
            }
        }
    }
    Ok((records, quarantined))
}

pub(crate) fn encode_records(records: &[EventRecord]) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::with_capacity(records.len() * 256);
    for record in records {
        serde_json::to_writer(&mut out, record)
            .map_err(StoreError::encode(format!("record {}", record.id)))?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Replace `path` with `bytes` so that readers see either the old or the new
/// content, never a mix: write a sibling temp file, fsync, rename over.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    let result = (|| -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_parent(path);
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(StoreError::io(path))
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path)(e)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

/// Best effort: persist the rename itself.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(dir) = path.parent().and_then(|dir| File::open(dir).ok()) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
