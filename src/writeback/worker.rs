// Upspin cacheserver.
//! The writeback worker pool: a fixed number of threads that repeatedly
//! dequeue a ready entry, upload it, and either delete the marker
//! (success), reschedule it with backoff (transient failure), or move it
//! to quarantine (permanent failure) -- spec 4.2.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::errors::{Error, ErrorKind};
use crate::monitor::Counter;

use super::{backoff_with_jitter, Shared, WritebackQueue};

/// Default worker pool size (spec 4.2: "a fixed-size worker pool (default:
/// small, e.g. 10)").
pub const WORKER_POOL_SIZE: usize = 10;

/// How long a worker may hold an entry before another worker may reclaim
/// it, guarding against a worker that hangs without acking.
const LEASE_DURATION: Duration = Duration::from_secs(60);

const IDLE_POLL: Duration = Duration::from_millis(500);

pub fn spawn_pool(shared: Arc<Shared>, queue: Arc<WritebackQueue>) {
    for worker_id in 0..WORKER_POOL_SIZE {
        let shared = shared.clone();
        let queue = queue.clone();
        thread::Builder::new()
            .name(format!("writeback-{worker_id}"))
            .spawn(move || worker_loop(shared, &queue))
            .expect("spawn writeback worker");
    }
}

fn worker_loop(shared: Arc<Shared>, queue: &WritebackQueue) {
    loop {
        match dequeue_ready(&shared) {
            Some(key) => process_entry(&shared, queue, key),
            None => {
                let _ = shared.wake.1.recv_timeout(IDLE_POLL);
            }
        }
    }
}

/// Atomically find one ready, unleased entry and lease it to this worker.
fn dequeue_ready(shared: &Shared) -> Option<String> {
    let now = Instant::now();
    let mut entries = shared.entries.lock().expect("lock writeback entries");
    let key = entries
        .iter()
        .find(|(_, entry)| entry.is_ready(now))
        .map(|(key, _)| key.clone())?;
    if let Some(entry) = entries.get_mut(&key) {
        entry.leased_until = Some(now + LEASE_DURATION);
    }
    Some(key)
}

fn process_entry(shared: &Shared, queue: &WritebackQueue, key: String) {
    let (endpoint, reference, local_path, attempt) = {
        let entries = shared.entries.lock().expect("lock writeback entries");
        let entry = match entries.get(&key) {
            Some(entry) => entry,
            None => return, // cancelled out from under us
        };
        (
            entry.marker.endpoint.clone(),
            entry.marker.reference.clone(),
            entry.marker.local_path.clone(),
            entry.attempt,
        )
    };

    let data = match fs::read(&local_path) {
        Ok(bytes) => bytes::Bytes::from(bytes),
        Err(err) => {
            warn!(?local_path, ?err, "writeback source file missing, quarantining");
            quarantine(shared, queue, key, Error::Io { source: err });
            return;
        }
    };

    let store = match shared.upstream.store_server(&endpoint) {
        Ok(store) => store,
        Err(err) => {
            reschedule(shared, &key, attempt, err);
            return;
        }
    };

    match store.put(data) {
        Ok(_uploaded_reference) => {
            ack_success(shared, &key, &endpoint, &reference);
        }
        Err(err) if is_permanent(&err) => {
            quarantine(shared, queue, key, err);
        }
        Err(err) => {
            reschedule(shared, &key, attempt, err);
        }
    }
}

/// Permission and validity failures will never succeed on retry; anything
/// else (timeouts, dial failures) is assumed transient.
fn is_permanent(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Permission | ErrorKind::Private | ErrorKind::Invalid | ErrorKind::Exist
    )
}

fn ack_success(shared: &Shared, key: &str, endpoint: &crate::endpoint::Endpoint, reference: &crate::endpoint::Reference) {
    let marker_path = {
        let mut entries = shared.entries.lock().expect("lock writeback entries");
        entries.remove(key).map(|e| e.marker_path)
    };
    if let Some(path) = marker_path {
        let _ = fs::remove_file(path);
    }
    if let Some(tracker) = &shared.dirty_tracker {
        tracker.clear_dirty(endpoint, reference);
    }
    shared.monitor.count(Counter::WritebackSucceeded, 1);
}

fn reschedule(shared: &Shared, key: &str, attempt: u32, err: Error) {
    let mut entries = shared.entries.lock().expect("lock writeback entries");
    if let Some(entry) = entries.get_mut(key) {
        entry.attempt = attempt + 1;
        entry.next_attempt_at = Instant::now() + backoff_with_jitter(entry.attempt);
        entry.leased_until = None;
    }
    drop(entries);
    shared.monitor.count(Counter::WritebackFailed, 1);
    warn!(?key, ?err, attempt, "writeback attempt failed, rescheduling");
}

fn quarantine(shared: &Shared, queue: &WritebackQueue, key: String, err: Error) {
    let entry = shared.entries.lock().expect("lock writeback entries").remove(&key);
    if let Some(entry) = entry {
        let quarantine_path = shared.quarantine_dir.join(&key);
        if let Err(move_err) = fs::rename(&entry.marker_path, &quarantine_path) {
            warn!(?move_err, "failed to move writeback marker to quarantine");
        }
    }
    shared.monitor.count(Counter::WritebackQuarantined, 1);
    info!(?key, ?err, "writeback entry permanently failed, quarantined");
    queue.record_quarantine(key, err);
}
