// Upspin cacheserver.
//! The directory cache's on-disk log (spec 3, spec 4.3): an append-only
//! file of length-prefixed, versioned records, replayed into an empty LRU
//! at startup and periodically compacted by rewriting only the records
//! that still matter.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::{Error, Result};

use super::record::{LogRecord, LOG_RECORD_VERSION};

/// Read every complete record from `path`. A truncated or corrupt trailing
/// record is discarded rather than failing the whole replay (spec 7: "a
/// startup whose log file is partially corrupt discards the corrupt tail
/// and continues").
pub fn replay(path: &Path) -> Result<Vec<LogRecord>> {
    let mut bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut records = Vec::new();
    let mut cursor = 0usize;
    loop {
        if cursor + 4 > bytes.len() {
            if cursor != bytes.len() {
                warn!(path = ?path, discarded = bytes.len() - cursor, "truncating incomplete trailing log length prefix");
            }
            break;
        }
        let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        let start = cursor + 4;
        let end = start + len;
        if end > bytes.len() {
            warn!(path = ?path, "truncating incomplete trailing log record");
            break;
        }
        match serde_json::from_slice::<LogRecord>(&bytes[start..end]) {
            Ok(record) => {
                records.push(record);
                cursor = end;
            }
            Err(err) => {
                warn!(path = ?path, ?err, "discarding corrupt trailing log record");
                break;
            }
        }
    }
    bytes.truncate(cursor);
    Ok(records)
}

/// An append-only handle on the live log file, tracking how many bytes
/// have been written so the owner can decide when to compact (spec 4.3:
/// "sized against a budget... when exceeded, a live compaction is
/// triggered").
pub struct LogFile {
    path: PathBuf,
    file: File,
    bytes_written: u64,
    max_bytes: u64,
}

impl LogFile {
    /// Open (creating if necessary) the log at `path` for appending,
    /// having already replayed whatever was readable from it.
    pub fn open_for_append(path: PathBuf, max_bytes: u64) -> Result<LogFile> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::WriteCacheFile { path: path.clone(), source })?;
        let bytes_written = file
            .metadata()
            .map_err(|source| Error::WriteCacheFile { path: path.clone(), source })?
            .len();
        Ok(LogFile { path, file, bytes_written, max_bytes })
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let payload = serde_json::to_vec(record).map_err(|source| Error::SerializeLogRecord { source })?;
        let len = (payload.len() as u32).to_le_bytes();
        self.file
            .write_all(&len)
            .and_then(|_| self.file.write_all(&payload))
            .and_then(|_| self.file.sync_data())
            .map_err(|source| Error::WriteCacheFile { path: self.path.clone(), source })?;
        self.bytes_written += (len.len() + payload.len()) as u64;
        Ok(())
    }

    pub fn should_compact(&self) -> bool {
        self.bytes_written > self.max_bytes
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Rewrite the log from scratch containing exactly `records`,
    /// discarding anything superseded or deleted, then reopen for
    /// appending (spec 4.3: "rewrite only the surviving records").
    pub fn compact(&mut self, records: &[LogRecord]) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|source| Error::WriteCacheFile { path: tmp_path.clone(), source })?;
            let mut bytes_written = 0u64;
            for record in records {
                let payload = serde_json::to_vec(record).map_err(|source| Error::SerializeLogRecord { source })?;
                let len = (payload.len() as u32).to_le_bytes();
                tmp.write_all(&len)
                    .and_then(|_| tmp.write_all(&payload))
                    .map_err(|source| Error::WriteCacheFile { path: tmp_path.clone(), source })?;
                bytes_written += (len.len() + payload.len()) as u64;
            }
            tmp.sync_all().map_err(|source| Error::WriteCacheFile { path: tmp_path.clone(), source })?;
            self.bytes_written = bytes_written;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|source| Error::WriteCacheFile { path: self.path.clone(), source })?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| Error::WriteCacheFile { path: self.path.clone(), source })?;
        Ok(())
    }
}

pub fn new_record(
    endpoint: crate::endpoint::Endpoint,
    name: crate::path::PathName,
    body: super::record::LogRecordBody,
) -> LogRecord {
    LogRecord {
        version: LOG_RECORD_VERSION,
        endpoint,
        name,
        body,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirent::Attr;
    use crate::endpoint::Endpoint;
    use crate::path::{PathName, UserName};
    use crate::dircache::record::{LogRecordBody, LookupOutcome};
    use tempfile::TempDir;

    fn name(s: &str) -> PathName {
        PathName::parse(s).unwrap()
    }

    #[test]
    fn replay_empty_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        assert!(replay(&path).unwrap().is_empty());
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = LogFile::open_for_append(path.clone(), 1 << 20).unwrap();
        let rec = new_record(
            Endpoint::remote("s:1"),
            name("alice@x.com/f"),
            LogRecordBody::Lookup { outcome: LookupOutcome::NotExist },
        );
        log.append(&rec).unwrap();
        drop(log);
        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].name, name("alice@x.com/f"));
    }

    #[test]
    fn truncated_trailing_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = LogFile::open_for_append(path.clone(), 1 << 20).unwrap();
        let rec = new_record(
            Endpoint::remote("s:1"),
            name("alice@x.com/f"),
            LogRecordBody::Lookup { outcome: LookupOutcome::NotExist },
        );
        log.append(&rec).unwrap();
        drop(log);
        // Corrupt by appending a partial length prefix.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        drop(f);
        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn compaction_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut log = LogFile::open_for_append(path.clone(), 1 << 20).unwrap();
        let recs: Vec<LogRecord> = (0..5)
            .map(|i| {
                new_record(
                    Endpoint::remote("s:1"),
                    name(&format!("alice@x.com/f{i}")),
                    LogRecordBody::Lookup { outcome: LookupOutcome::NotExist },
                )
            })
            .collect();
        for r in &recs {
            log.append(r).unwrap();
        }
        log.compact(&recs).unwrap();
        let first_pass = replay(&path).unwrap();
        log.compact(&first_pass).unwrap();
        let second_pass = replay(&path).unwrap();
        assert_eq!(first_pass.len(), second_pass.len());
        for (a, b) in first_pass.iter().zip(second_pass.iter()) {
            assert_eq!(a.name, b.name);
        }
        let _ = Attr::None;
    }
}
