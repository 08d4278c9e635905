// Upspin cacheserver.
//! The block cache (spec 4.1): a local, bounded, content-addressed cache of
//! packed blocks keyed by `(endpoint, reference)`, with at-most-once
//! concurrent fetch per key and LRU eviction that never touches a
//! writeback-dirty entry.
//!
//! One mutex around an `lru::LruCache`, a stats struct of plain atomics, and
//! a `Monitor` for caller-visible counters. Entries are bounded by *bytes*,
//! not by count, because spec 4.1 specifies a byte budget; and entries can
//! be dirty (writeback-pending), which excludes them from eviction.

pub mod layout;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::dirent::BlockPackdata;
use crate::endpoint::{Endpoint, Location, Reference};
use crate::errors::{CachedError, Error, ErrorKind, Result};
use crate::monitor::{BlockCacheStats, Counter, Monitor};
use crate::upstream::{StoreGetOutcome, UpstreamDirectory};
use crate::writeback::WritebackQueue;

/// The two write policies of spec 4.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// `Put` returns only once upstream has confirmed the write.
    Writethrough,
    /// `Put` returns as soon as the local file is durable; a background
    /// queue drains writes to upstream.
    Writeback,
}

/// The outcome of a `Get`: either the block's bytes, or a set of locations
/// to retry at, because the block moved (spec 4.1: "the cache records
/// them but does not recurse").
#[derive(Clone, Debug)]
pub enum GetOutcome {
    Data(Bytes),
    Redirect(Vec<Location>),
}

#[derive(Clone, Debug)]
struct CacheEntry {
    size: u64,
    /// True while a writeback upload for this block is still pending.
    /// Dirty entries are never evicted (spec 4.1, spec 8 "eviction
    /// respects dirtiness").
    dirty: bool,
    /// The file's actual path on disk. Stored rather than re-derived from
    /// the key on every access: a recovered entry's key is synthetic (we
    /// don't know the `(endpoint, reference)` that produced the file, only
    /// its name), so hashing the key back into a path would not find the
    /// file that's actually there.
    path: PathBuf,
}

/// Coordination point for in-flight coalescing: one per reference currently
/// being fetched from upstream. The owner publishes the (possibly failed)
/// result and wakes every waiter; waiters never contact upstream
/// themselves (spec 8, "at-most-once upstream fetch").
struct Inflight {
    result: Mutex<Option<std::result::Result<GetOutcome, CachedError>>>,
    cond: Condvar,
}

/// A local, bounded, content-addressed cache of packed blocks.
pub struct BlockCache {
    storecache_dir: PathBuf,
    budget_bytes: u64,
    mode: WriteMode,
    lru: Mutex<LruCache<Location, CacheEntry>>,
    inflight: Mutex<HashMap<Location, Arc<Inflight>>>,
    upstream: Arc<dyn UpstreamDirectory>,
    writeback: Mutex<Option<Arc<WritebackQueue>>>,
    pub stats: BlockCacheStats,
    monitor: Arc<dyn Monitor>,
}

/// Lets the writeback queue report back to the block cache that owns the
/// underlying files, without the cache depending on the queue's internals.
/// Breaks what would otherwise be a circular `Arc` between the two: the
/// cache is constructed first, the queue is handed a reference to it, and
/// the cache is told about the queue afterwards via
/// [`BlockCache::set_writeback_queue`].
pub trait DirtyTracker: Send + Sync {
    /// A marker recovered at startup still references this block.
    fn mark_dirty(&self, endpoint: &Endpoint, reference: &Reference);
    /// The writeback upload for this block has completed; it may now be
    /// evicted like any other clean entry.
    fn clear_dirty(&self, endpoint: &Endpoint, reference: &Reference);
}

impl DirtyTracker for BlockCache {
    fn mark_dirty(&self, endpoint: &Endpoint, reference: &Reference) {
        BlockCache::mark_dirty(self, endpoint, reference);
    }

    fn clear_dirty(&self, endpoint: &Endpoint, reference: &Reference) {
        let location = Location::new(endpoint.clone(), reference.clone());
        if let Some(entry) = self.lru.lock().expect("lock lru").peek_mut(&location) {
            entry.dirty = false;
        }
    }
}

impl BlockCache {
    /// Open (or create) the block cache rooted at `storecache_dir`,
    /// recovering its LRU order from the files already on disk.
    ///
    /// `budget_bytes` is the caller's byte budget for block data; spec 4.1
    /// reserves 9/10 of the configured `cachesize` for this cache and 1/10
    /// for the directory cache's log, but the split is a caller concern
    /// (spec 9, open question) -- this type just enforces whatever budget
    /// it is given.
    pub fn open(
        storecache_dir: PathBuf,
        budget_bytes: u64,
        mode: WriteMode,
        upstream: Arc<dyn UpstreamDirectory>,
        writeback: Option<Arc<WritebackQueue>>,
        monitor: Arc<dyn Monitor>,
    ) -> Result<BlockCache> {
        std::fs::create_dir_all(&storecache_dir)?;
        let lru = LruCache::unbounded();
        let cache = BlockCache {
            storecache_dir,
            budget_bytes,
            mode,
            lru: Mutex::new(lru),
            inflight: Mutex::new(HashMap::new()),
            upstream,
            writeback: Mutex::new(writeback),
            stats: BlockCacheStats::default(),
            monitor,
        };
        cache.recover()?;
        Ok(cache)
    }

    /// Attach a writeback queue constructed after this cache, resolving the
    /// chicken-and-egg dependency described on [`DirtyTracker`].
    pub fn set_writeback_queue(&self, queue: Arc<WritebackQueue>) {
        *self.writeback.lock().expect("lock writeback handle") = Some(queue);
    }

    /// Rebuild the LRU from whatever files already exist on disk, ordered
    /// oldest-modified first (least recently used).
    fn recover(&self) -> Result<()> {
        let mut dirents: Vec<(Location, PathBuf, u64, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&self.storecache_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if layout::is_tmp_file(&name) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            // We only know the hashed file name, not the (endpoint, reference)
            // that produced it; we recover a synthetic location keyed by the
            // file name itself so lookups by the real key still miss until
            // re-fetched. Eviction accounting and file cleanup still work
            // because the entry carries the file's real path, not a path
            // re-derived by hashing the synthetic key.
            let location = Location::new(Endpoint::unassigned(), Reference::from(name.clone()));
            dirents.push((location, entry.path(), meta.len(), modified));
        }
        dirents.sort_by_key(|(_, _, _, modified)| *modified);
        let mut lru = self.lru.lock().expect("lock lru");
        for (location, path, len, _modified) in dirents {
            lru.put(location, CacheEntry { size: len, dirty: false, path });
            self.stats.admit(len as usize);
        }
        Ok(())
    }

    /// Mark a recovered entry dirty because a writeback marker still
    /// references it. Called once at startup after both this cache and the
    /// writeback queue have recovered their on-disk state.
    pub fn mark_dirty(&self, endpoint: &Endpoint, reference: &Reference) {
        let location = Location::new(endpoint.clone(), reference.clone());
        let mut lru = self.lru.lock().expect("lock lru");
        if let Some(entry) = lru.peek_mut(&location) {
            entry.dirty = true;
        }
    }

    fn path_for(&self, location: &Location) -> PathBuf {
        layout::block_path(&self.storecache_dir, location)
    }

    fn verify_integrity(&self, location: &Location, bytes: &[u8], expected: &BlockPackdata) -> Result<()> {
        if let BlockPackdata::Sha256(want) = expected {
            let got = Sha256::digest(bytes);
            if got.as_slice() != want {
                self.monitor.count(Counter::BlockIntegrityFailures, 1);
                self.evict_location(location);
                return Err(Error::Integrity {
                    endpoint: location.endpoint.clone(),
                    reference: location.reference.0.clone(),
                });
            }
        }
        Ok(())
    }

    /// Remove a location from the LRU and disk, regardless of dirtiness.
    /// Used for integrity failures and upstream not-exist (spec 7).
    fn evict_location(&self, location: &Location) {
        let removed = self.lru.lock().expect("lock lru").pop(location);
        let path = match removed {
            Some(entry) => {
                self.stats.evict(entry.size as usize);
                entry.path
            }
            None => self.path_for(location),
        };
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?path, ?err, "failed to remove evicted block file");
            }
        }
    }

    /// Evict least-recently-used *clean* entries until `incoming_len` more
    /// bytes would fit under the budget. Dirty entries are skipped; if only
    /// dirty entries remain and the budget still can't be met, the caller
    /// must back off (spec 4.1, spec 8).
    fn evict_to_fit(&self, incoming_len: u64) -> Result<()> {
        loop {
            let resident = self.stats.bytes_resident.load(std::sync::atomic::Ordering::Relaxed) as u64;
            if resident + incoming_len <= self.budget_bytes {
                return Ok(());
            }
            let victim = {
                let lru = self.lru.lock().expect("lock lru");
                // lru::LruCache::iter() walks most-recently-used first; the
                // true LRU tail is at the end of that order.
                lru.iter()
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .find(|(_, entry)| !entry.dirty)
                    .map(|(key, _)| key.clone())
            };
            match victim {
                Some(location) => {
                    self.evict_location(&location);
                    self.monitor.count(Counter::BlockEvictions, 1);
                }
                None => return Err(Error::ResourceExhausted),
            }
        }
    }

    fn try_read_cached(&self, location: &Location) -> Result<Option<Bytes>> {
        let mut lru = self.lru.lock().expect("lock lru");
        if let Some(entry) = lru.get(location) {
            let path = entry.path.clone();
            drop(lru);
            match layout::read_file(&path) {
                Ok(bytes) => Ok(Some(Bytes::from(bytes))),
                Err(err) => {
                    // The file vanished out from under us (e.g. a concurrent
                    // eviction); treat it as a miss rather than a hard error.
                    warn!(?location, ?err, "cached block file missing, refetching");
                    self.lru.lock().expect("lock lru").pop(location);
                    Ok(None)
                }
            }
        } else {
            Ok(None)
        }
    }

    fn claim_inflight(&self, location: &Location) -> (bool, Arc<Inflight>) {
        let mut map = self.inflight.lock().expect("lock inflight map");
        if let Some(existing) = map.get(location) {
            (false, existing.clone())
        } else {
            let inflight = Arc::new(Inflight {
                result: Mutex::new(None),
                cond: Condvar::new(),
            });
            map.insert(location.clone(), inflight.clone());
            (true, inflight)
        }
    }

    fn finish_inflight(&self, location: &Location, inflight: &Inflight, result: &Result<GetOutcome>) {
        {
            let mut guard = inflight.result.lock().expect("lock inflight result");
            *guard = Some(match result {
                Ok(outcome) => Ok(outcome.clone()),
                Err(err) => Err(CachedError::from(err)),
            });
        }
        inflight.cond.notify_all();
        self.inflight.lock().expect("lock inflight map").remove(location);
    }

    fn wait_inflight(&self, inflight: &Inflight) -> Result<GetOutcome> {
        let mut guard = inflight.result.lock().expect("lock inflight result");
        while guard.is_none() {
            guard = inflight.cond.wait(guard).expect("wait on inflight condvar");
        }
        match guard.clone().expect("inflight result set") {
            Ok(outcome) => Ok(outcome),
            Err(cached) => Err(cached.into_error()),
        }
    }

    fn fetch_from_upstream(&self, location: &Location, expected: &BlockPackdata) -> Result<GetOutcome> {
        let store = self.upstream.store_server(&location.endpoint)?;
        match store.get(&location.reference.0) {
            Ok(StoreGetOutcome::Redirect(locations)) => Ok(GetOutcome::Redirect(locations)),
            Ok(StoreGetOutcome::Data(bytes)) => {
                self.verify_integrity(location, &bytes, expected)?;
                self.evict_to_fit(bytes.len() as u64)?;
                let path = self.path_for(location);
                layout::write_atomic(&path, &bytes)?;
                let replaced = self.lru.lock().expect("lock lru").put(
                    location.clone(),
                    CacheEntry {
                        size: bytes.len() as u64,
                        dirty: false,
                        path: path.clone(),
                    },
                );
                if let Some(old) = replaced {
                    self.stats.evict(old.size as usize);
                }
                self.stats.admit(bytes.len());
                Ok(GetOutcome::Data(bytes))
            }
            Err(err) if err.kind() == ErrorKind::NotExist => {
                self.evict_location(location);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch a block, serving from cache when possible and otherwise
    /// performing exactly one upstream fetch per cold `(endpoint,
    /// reference)` even under concurrent callers (spec 8).
    #[instrument(skip(self, expected), fields(endpoint = %endpoint, reference = %reference))]
    pub fn get(&self, endpoint: &Endpoint, reference: &Reference, expected: &BlockPackdata) -> Result<GetOutcome> {
        let location = Location::new(endpoint.clone(), reference.clone());
        if let Some(bytes) = self.try_read_cached(&location)? {
            if let Err(err) = self.verify_integrity(&location, &bytes, expected) {
                return Err(err);
            }
            self.monitor.count(Counter::BlockContentCacheHit, 1);
            return Ok(GetOutcome::Data(bytes));
        }
        self.monitor.count(Counter::BlockContentCacheMiss, 1);
        let (owner, inflight) = self.claim_inflight(&location);
        if owner {
            let result = self.fetch_from_upstream(&location, expected);
            self.finish_inflight(&location, &inflight, &result);
            result
        } else {
            self.monitor.count(Counter::BlockInFlightCoalesced, 1);
            self.wait_inflight(&inflight)
        }
    }

    /// Store already-packed bytes, returning the reference the cache
    /// assigns. In writeback mode this returns once the local file is
    /// durable and the writeback marker exists; in writethrough mode it
    /// returns only once upstream confirms the write.
    #[instrument(skip(self, packed), fields(endpoint = %endpoint, len = packed.len()))]
    pub fn put(&self, endpoint: &Endpoint, packed: Bytes) -> Result<Reference> {
        let digest = Sha256::digest(&packed);
        let reference = Reference::from(hex::encode(digest));
        let location = Location::new(endpoint.clone(), reference.clone());
        self.evict_to_fit(packed.len() as u64)?;
        let path = self.path_for(&location);
        layout::write_atomic(&path, &packed)?;
        let dirty = self.mode == WriteMode::Writeback;
        let replaced = self.lru.lock().expect("lock lru").put(
            location.clone(),
            CacheEntry {
                size: packed.len() as u64,
                dirty,
                path: path.clone(),
            },
        );
        if let Some(old) = replaced {
            self.stats.evict(old.size as usize);
        }
        self.stats.admit(packed.len());
        self.monitor.count(Counter::BlockWrites, 1);
        match self.mode {
            WriteMode::Writeback => {
                if let Some(writeback) = self.writeback.lock().expect("lock writeback handle").clone() {
                    writeback.enqueue(endpoint, &reference, &path)?;
                }
                Ok(reference)
            }
            WriteMode::Writethrough => {
                let store = self.upstream.store_server(endpoint)?;
                store.put(packed)?;
                Ok(reference)
            }
        }
    }

    /// Best-effort local removal plus an upstream delete (writethrough) or
    /// a queued/coalesced delete (writeback, spec 4.2).
    pub fn delete(&self, endpoint: &Endpoint, reference: &Reference) -> Result<()> {
        let location = Location::new(endpoint.clone(), reference.clone());
        self.evict_location(&location);
        match self.mode {
            WriteMode::Writeback => {
                if let Some(writeback) = self.writeback.lock().expect("lock writeback handle").clone() {
                    if writeback.try_cancel_pending(endpoint, reference) {
                        // The put never actually reached upstream; the
                        // delete is simply a cancellation (spec 4.2).
                        return Ok(());
                    }
                }
                if let Ok(store) = self.upstream.store_server(endpoint) {
                    let _ = store.delete(&reference.0);
                }
                Ok(())
            }
            WriteMode::Writethrough => {
                let store = self.upstream.store_server(endpoint)?;
                store.delete(&reference.0)
            }
        }
    }

    /// Block until every writeback-pending block has been confirmed
    /// upstream, or report the first permanent failure. Exposed via the
    /// `FlushWritebacksMetadata` synthetic reference (spec 6).
    pub fn flush_writebacks(&self) -> Result<()> {
        match self.writeback.lock().expect("lock writeback handle").clone() {
            Some(writeback) => writeback.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::upstream::{DirServer, StoreServer, WatchHandle};
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use tempfile::TempDir;

    struct CountingStore {
        gets: AtomicUsize,
        data: Bytes,
    }

    impl StoreServer for CountingStore {
        fn get(&self, _reference: &str) -> Result<StoreGetOutcome> {
            self.gets.fetch_add(1, SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(StoreGetOutcome::Data(self.data.clone()))
        }
        fn put(&self, _data: Bytes) -> Result<String> {
            Ok("ref".to_string())
        }
        fn delete(&self, _reference: &str) -> Result<()> {
            Ok(())
        }
    }

    struct OneStore(Arc<CountingStore>);
    impl UpstreamDirectory for OneStore {
        fn dir_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
            unimplemented!()
        }
        fn store_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
            Ok(self.0.clone())
        }
    }

    fn cache(dir: &TempDir, budget: u64, mode: WriteMode, store: Arc<CountingStore>) -> BlockCache {
        BlockCache::open(
            dir.path().join("storecache"),
            budget,
            mode,
            Arc::new(OneStore(store)),
            None,
            Arc::new(crate::monitor::NullMonitor),
        )
        .unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CountingStore { gets: AtomicUsize::new(0), data: Bytes::from("unused") });
        let bc = cache(&dir, 1 << 20, WriteMode::Writethrough, store);
        let endpoint = Endpoint::remote("s:1");
        let reference = bc.put(&endpoint, Bytes::from("hello")).unwrap();
        let outcome = bc.get(&endpoint, &reference, &BlockPackdata::None).unwrap();
        match outcome {
            GetOutcome::Data(bytes) => assert_eq!(bytes, Bytes::from("hello")),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn integrity_mismatch_removes_file_and_refetches() {
        let dir = TempDir::new().unwrap();
        let good = Bytes::from("good-bytes");
        let store = Arc::new(CountingStore { gets: AtomicUsize::new(0), data: good.clone() });
        let bc = cache(&dir, 1 << 20, WriteMode::Writethrough, store.clone());
        let endpoint = Endpoint::remote("s:1");
        let reference = Reference::from("deadbeef");
        let wrong_hash = BlockPackdata::Sha256([0u8; 32]);
        let location = Location::new(endpoint.clone(), reference.clone());
        let path = bc.path_for(&location);
        layout::write_atomic(&path, b"corrupted").unwrap();
        bc.lru.lock().unwrap().put(location.clone(), CacheEntry { size: 9, dirty: false, path: path.clone() });
        let err = bc.get(&endpoint, &reference, &wrong_hash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!path.exists());
        // Next get refetches from upstream and succeeds.
        let actual_hash = Sha256::digest(&good);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&actual_hash);
        let outcome = bc.get(&endpoint, &reference, &BlockPackdata::Sha256(arr)).unwrap();
        match outcome {
            GetOutcome::Data(bytes) => assert_eq!(bytes, good),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn concurrent_gets_coalesce_to_one_upstream_fetch() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CountingStore { gets: AtomicUsize::new(0), data: Bytes::from("block") });
        let bc = Arc::new(cache(&dir, 1 << 20, WriteMode::Writethrough, store.clone()));
        let endpoint = Endpoint::remote("s:1");
        let reference = Reference::from("cold-ref");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bc = bc.clone();
                let endpoint = endpoint.clone();
                let reference = reference.clone();
                std::thread::spawn(move || bc.get(&endpoint, &reference, &BlockPackdata::None).unwrap())
            })
            .collect();
        for h in handles {
            match h.join().unwrap() {
                GetOutcome::Data(bytes) => assert_eq!(bytes, Bytes::from("block")),
                _ => panic!("expected data"),
            }
        }
        assert_eq!(store.gets.load(SeqCst), 1);
    }

    #[test]
    fn eviction_skips_dirty_entries_and_exhausts_resources() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CountingStore { gets: AtomicUsize::new(0), data: Bytes::from("x") });
        let bc = cache(&dir, 10, WriteMode::Writeback, store);
        let endpoint = Endpoint::remote("s:1");
        // No writeback queue wired, so every put is immediately "dirty" in
        // bookkeeping but never drained -- simulating saturation by dirty
        // blocks.
        let r1 = bc.put(&endpoint, Bytes::from("01234")).unwrap();
        let result = bc.put(&endpoint, Bytes::from("567890123"));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
        // The first block is still present because it was never evicted.
        let outcome = bc.get(&endpoint, &r1, &BlockPackdata::None).unwrap();
        match outcome {
            GetOutcome::Data(bytes) => assert_eq!(bytes, Bytes::from("01234")),
            _ => panic!("expected data"),
        }
    }
}
