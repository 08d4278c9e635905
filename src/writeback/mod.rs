// Upspin cacheserver.
//! The writeback queue (spec 4.2): a durable, per-user FIFO of blocks
//! awaiting upload to upstream StoreServers, used only in writeback mode.
//!
//! Entries are persisted as marker files named like block cache files
//! (`D/U/storewritebackqueue/<hex32>`) so the queue survives a crash: on
//! restart the directory is rescanned and every marker becomes a ready
//! entry again (spec 8, "writeback durability").

mod backoff;
mod worker;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::endpoint::{Endpoint, Location, Reference};
use crate::errors::{Error, Result};
use crate::monitor::{Counter, Monitor};
use crate::upstream::UpstreamDirectory;

pub use backoff::backoff_with_jitter;
pub use worker::WORKER_POOL_SIZE;

/// On-disk representation of one writeback marker file, persisted next to
/// `storewritebackqueue/<hex32>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Marker {
    endpoint: Endpoint,
    reference: Reference,
    local_path: PathBuf,
    enqueued_unix_ms: i64,
}

#[derive(Clone, Debug)]
struct QueueEntry {
    marker: Marker,
    marker_path: PathBuf,
    attempt: u32,
    next_attempt_at: Instant,
    /// Set while a worker holds this entry, cleared if the lease expires
    /// without an ack so another worker may retry it.
    leased_until: Option<Instant>,
}

impl QueueEntry {
    fn is_ready(&self, now: Instant) -> bool {
        self.next_attempt_at <= now && self.leased_until.map_or(true, |until| now > until)
    }
}

struct Shared {
    queue_dir: PathBuf,
    quarantine_dir: PathBuf,
    entries: Mutex<HashMap<String, QueueEntry>>,
    upstream: Arc<dyn UpstreamDirectory>,
    monitor: Arc<dyn Monitor>,
    dirty_tracker: Option<Arc<dyn crate::storecache::DirtyTracker>>,
    /// Signalled whenever an entry becomes ready, to wake idle workers.
    wake: (Sender<()>, Receiver<()>),
}

/// A durable, per-user FIFO of pending block uploads and a pool of workers
/// draining it.
pub struct WritebackQueue {
    shared: Arc<Shared>,
    quarantined: Mutex<Vec<(String, Error)>>,
}

fn entry_key(endpoint: &Endpoint, reference: &Reference) -> String {
    crate::storecache::layout::block_file_name(&Location::new(endpoint.clone(), reference.clone()))
}

impl WritebackQueue {
    /// Recover any markers left over from a prior run and start the worker
    /// pool. `queue_dir` and `quarantine_dir` must already exist.
    pub fn open(
        queue_dir: PathBuf,
        quarantine_dir: PathBuf,
        upstream: Arc<dyn UpstreamDirectory>,
        monitor: Arc<dyn Monitor>,
        dirty_tracker: Option<Arc<dyn crate::storecache::DirtyTracker>>,
    ) -> Result<Arc<WritebackQueue>> {
        fs::create_dir_all(&queue_dir)?;
        fs::create_dir_all(&quarantine_dir)?;
        let mut entries = HashMap::new();
        for dirent in fs::read_dir(&queue_dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            let name = dirent.file_name().to_string_lossy().to_string();
            if crate::storecache::layout::is_tmp_file(&name) {
                continue;
            }
            match fs::read(&path).and_then(|bytes| {
                serde_json::from_slice::<Marker>(&bytes)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }) {
                Ok(marker) => {
                    if let Some(tracker) = &dirty_tracker {
                        tracker.mark_dirty(&marker.endpoint, &marker.reference);
                    }
                    entries.insert(
                        name,
                        QueueEntry {
                            marker,
                            marker_path: path,
                            attempt: 0,
                            next_attempt_at: Instant::now(),
                            leased_until: None,
                        },
                    );
                }
                Err(err) => warn!(?path, ?err, "discarding unreadable writeback marker"),
            }
        }
        info!(recovered = entries.len(), "recovered writeback queue");
        let shared = Arc::new(Shared {
            queue_dir,
            quarantine_dir,
            entries: Mutex::new(entries),
            upstream,
            monitor,
            dirty_tracker,
            wake: bounded(WORKER_POOL_SIZE),
        });
        let queue = Arc::new(WritebackQueue {
            shared: shared.clone(),
            quarantined: Mutex::new(Vec::new()),
        });
        worker::spawn_pool(shared, queue.clone());
        Ok(queue)
    }

    /// Idempotent on `(endpoint, reference)`: re-enqueuing the same block
    /// while it is already pending is a no-op.
    pub fn enqueue(&self, endpoint: &Endpoint, reference: &Reference, local_path: &Path) -> Result<()> {
        let key = entry_key(endpoint, reference);
        let mut entries = self.shared.entries.lock().expect("lock writeback entries");
        if entries.contains_key(&key) {
            return Ok(());
        }
        let marker = Marker {
            endpoint: endpoint.clone(),
            reference: reference.clone(),
            local_path: local_path.to_path_buf(),
            enqueued_unix_ms: chrono::Utc::now().timestamp_millis(),
        };
        let marker_path = self.shared.queue_dir.join(&key);
        let bytes = serde_json::to_vec(&marker).map_err(|source| Error::SerializeLogRecord { source })?;
        crate::storecache::layout::write_atomic(&marker_path, &bytes)?;
        entries.insert(
            key,
            QueueEntry {
                marker,
                marker_path,
                attempt: 0,
                next_attempt_at: Instant::now(),
                leased_until: None,
            },
        );
        self.shared.monitor.count(Counter::WritebackEnqueued, 1);
        let _ = self.shared.wake.0.try_send(());
        Ok(())
    }

    /// If a put for `(endpoint, reference)` is still pending, drop it and
    /// report success: a delete of a block that was never actually
    /// uploaded is simply a cancellation (spec 4.2, "a put followed by a
    /// delete of the same reference becomes a no-op").
    pub fn try_cancel_pending(&self, endpoint: &Endpoint, reference: &Reference) -> bool {
        let key = entry_key(endpoint, reference);
        let mut entries = self.shared.entries.lock().expect("lock writeback entries");
        if let Some(entry) = entries.remove(&key) {
            let _ = fs::remove_file(&entry.marker_path);
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, endpoint: &Endpoint, reference: &Reference) -> bool {
        let key = entry_key(endpoint, reference);
        self.shared
            .entries
            .lock()
            .expect("lock writeback entries")
            .contains_key(&key)
    }

    /// Block until the queue drains, or return the first permanent failure
    /// observed since the last flush. Exposed to clients as the
    /// `FlushWritebacksMetadata` synthetic reference (spec 6).
    pub fn flush(&self) -> Result<()> {
        loop {
            {
                let quarantined = self.quarantined.lock().expect("lock quarantine");
                if let Some((_, err)) = quarantined.first() {
                    return Err(Error::Internal(format!("writeback quarantined: {err}")));
                }
            }
            if self.shared.entries.lock().expect("lock writeback entries").is_empty() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn record_quarantine(&self, key: String, err: Error) {
        self.quarantined.lock().expect("lock quarantine").push((key, err));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::upstream::{DirServer, StoreGetOutcome, StoreServer, WatchHandle};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FlakyStore {
        fail_times: AtomicUsize,
    }
    impl StoreServer for FlakyStore {
        fn get(&self, _reference: &str) -> Result<StoreGetOutcome> {
            unimplemented!()
        }
        fn put(&self, _data: Bytes) -> Result<String> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(Error::Unavailable {
                    endpoint: Endpoint::remote("s:1"),
                    reason: "flaky".to_string(),
                })
            } else {
                Ok("ref".to_string())
            }
        }
        fn delete(&self, _reference: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Directory(Arc<FlakyStore>);
    impl UpstreamDirectory for Directory {
        fn dir_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
            unimplemented!()
        }
        fn store_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn enqueue_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore { fail_times: AtomicUsize::new(1000) });
        let upstream = Arc::new(Directory(store));
        let q = WritebackQueue::open(
            dir.path().join("q"),
            dir.path().join("quarantine"),
            upstream,
            Arc::new(crate::monitor::NullMonitor),
            None,
        )
        .unwrap();
        let endpoint = Endpoint::remote("s:1");
        let reference = Reference::from("abc");
        let local = dir.path().join("block");
        std::fs::write(&local, b"data").unwrap();
        q.enqueue(&endpoint, &reference, &local).unwrap();
        q.enqueue(&endpoint, &reference, &local).unwrap();
        assert_eq!(q.shared.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_pending_drops_entry() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore { fail_times: AtomicUsize::new(1000) });
        let upstream = Arc::new(Directory(store));
        let q = WritebackQueue::open(
            dir.path().join("q"),
            dir.path().join("quarantine"),
            upstream,
            Arc::new(crate::monitor::NullMonitor),
            None,
        )
        .unwrap();
        let endpoint = Endpoint::remote("s:1");
        let reference = Reference::from("abc");
        let local = dir.path().join("block");
        std::fs::write(&local, b"data").unwrap();
        q.enqueue(&endpoint, &reference, &local).unwrap();
        assert!(q.try_cancel_pending(&endpoint, &reference));
        assert!(!q.is_pending(&endpoint, &reference));
        assert!(!q.try_cancel_pending(&endpoint, &reference));
    }

    #[test]
    fn recovers_markers_from_disk_on_restart() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore { fail_times: AtomicUsize::new(1000) });
        let upstream: Arc<dyn UpstreamDirectory> = Arc::new(Directory(store));
        let queue_dir = dir.path().join("q");
        let quarantine_dir = dir.path().join("quarantine");
        let local = dir.path().join("block");
        std::fs::write(&local, b"data").unwrap();
        {
            let q = WritebackQueue::open(
                queue_dir.clone(),
                quarantine_dir.clone(),
                upstream.clone(),
                Arc::new(crate::monitor::NullMonitor),
                None,
            )
            .unwrap();
            q.enqueue(&Endpoint::remote("s:1"), &Reference::from("abc"), &local)
                .unwrap();
        }
        let q2 = WritebackQueue::open(
            queue_dir,
            quarantine_dir,
            upstream,
            Arc::new(crate::monitor::NullMonitor),
            None,
        )
        .unwrap();
        assert!(q2.is_pending(&Endpoint::remote("s:1"), &Reference::from("abc")));
    }
}
