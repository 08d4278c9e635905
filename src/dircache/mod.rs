// Upspin cacheserver.
//! The directory cache (spec 4.3): local, eventually-consistent answers for
//! `Lookup`/`Glob`/`WhichAccess`, and synchronous upstream-backed mutations.
//!
//! Deliberately a flat LRU of per-name records rather than a tree (spec 9):
//! trees make invalidation across links and Access files complex, while a
//! flat LRU plus prefix scans for the rare Access invalidation trades a
//! small cost for much simpler invariants.

pub mod log;
mod refresher;
pub mod record;
mod watcher;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;
use tracing::instrument;

use crate::dirent::DirEntry;
use crate::endpoint::Endpoint;
use crate::errors::{Error, ErrorKind, Result};
use crate::monitor::{Counter, Monitor};
use crate::path::{CacheableGlob, PathName};
use crate::upstream::UpstreamDirectory;

use log::LogFile;
use record::{AccessRuling, CacheRecord, GlobRecord, LogRecord, LogRecordBody, LookupOutcome, LookupRecord, RecordKey};

pub use refresher::spawn as spawn_refresher;
pub use watcher::{Event, Subscription, WatcherMultiplexer};

/// Default bound on the number of cached records (spec 4.3).
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Number of per-name mutex shards used to serialize a name's
/// check-cache/call-upstream/update-cache sequence without holding the LRU
/// lock across the upstream RPC (spec 5).
const NAME_LOCK_SHARDS: usize = 64;

fn shard_index(endpoint: &Endpoint, name: &PathName) -> usize {
    let mut hasher = DefaultHasher::new();
    endpoint.hash(&mut hasher);
    name.parent().unwrap_or_else(|| name.clone()).hash(&mut hasher);
    (hasher.finish() as usize) % NAME_LOCK_SHARDS
}

/// Directory cache: a bounded in-memory LRU of directory operations plus a
/// durable append-only log file on disk.
pub struct DirCache {
    lru: Mutex<LruCache<RecordKey, CacheRecord>>,
    log: Mutex<LogFile>,
    name_locks: Vec<Mutex<()>>,
    upstream: Arc<dyn UpstreamDirectory>,
    monitor: Arc<dyn Monitor>,
    watcher: WatcherMultiplexer,
}

impl DirCache {
    /// Open the cache, replaying `log_path` into a fresh LRU and compacting
    /// away anything superseded (spec 4.3: "replayed into an empty LRU...
    /// written back to a fresh log").
    pub fn open(
        log_path: PathBuf,
        max_entries: usize,
        max_log_bytes: u64,
        upstream: Arc<dyn UpstreamDirectory>,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Arc<DirCache>> {
        let records = log::replay(&log_path)?;
        let mut lru = LruCache::new(std::num::NonZeroUsize::new(max_entries.max(1)).unwrap());
        for record in &records {
            apply_replayed(&mut lru, record);
        }
        let mut log_file = LogFile::open_for_append(log_path, max_log_bytes)?;
        let surviving = snapshot_as_records(&lru);
        log_file.compact(&surviving)?;

        let name_locks = (0..NAME_LOCK_SHARDS).map(|_| Mutex::new(())).collect();
        let cache = Arc::new(DirCache {
            lru: Mutex::new(lru),
            log: Mutex::new(log_file),
            name_locks,
            upstream,
            monitor,
            watcher: WatcherMultiplexer::new(),
        });
        Ok(cache)
    }

    fn lock_name(&self, endpoint: &Endpoint, name: &PathName) -> std::sync::MutexGuard<'_, ()> {
        self.name_locks[shard_index(endpoint, name)].lock().expect("lock dircache name shard")
    }

    fn append(&self, endpoint: &Endpoint, name: &PathName, body: LogRecordBody) -> Result<()> {
        let record = log::new_record(endpoint.clone(), name.clone(), body);
        let mut log = self.log.lock().expect("lock dircache log");
        log.append(&record)?;
        if log.should_compact() {
            drop(log);
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrite the log from the current LRU contents (spec 4.3).
    pub fn compact(&self) -> Result<()> {
        let records = {
            let lru = self.lru.lock().expect("lock dircache lru");
            snapshot_as_records(&lru)
        };
        self.log.lock().expect("lock dircache log").compact(&records)?;
        self.monitor.count(Counter::DirCompactions, 1);
        Ok(())
    }

    fn get_lookup(&self, endpoint: &Endpoint, name: &PathName) -> Option<LookupOutcome> {
        let mut lru = self.lru.lock().expect("lock dircache lru");
        match lru.get(&RecordKey::Lookup(endpoint.clone(), name.clone())) {
            Some(CacheRecord::Lookup(r)) => Some(r.outcome.clone()),
            _ => None,
        }
    }

    fn get_glob(&self, endpoint: &Endpoint, dir: &PathName) -> Option<GlobRecord> {
        let mut lru = self.lru.lock().expect("lock dircache lru");
        match lru.get(&RecordKey::Glob(endpoint.clone(), dir.clone())) {
            Some(CacheRecord::Glob(r)) => Some(r.clone()),
            _ => None,
        }
    }

    fn put_lookup(&self, endpoint: &Endpoint, name: &PathName, outcome: LookupOutcome) {
        let now = Instant::now();
        let mut lru = self.lru.lock().expect("lock dircache lru");
        lru.put(
            RecordKey::Lookup(endpoint.clone(), name.clone()),
            CacheRecord::Lookup(LookupRecord { outcome, changed: now, refreshed: now }),
        );
    }

    fn put_glob(&self, endpoint: &Endpoint, dir: &PathName, record: GlobRecord) {
        let mut lru = self.lru.lock().expect("lock dircache lru");
        lru.put(RecordKey::Glob(endpoint.clone(), dir.clone()), CacheRecord::Glob(record));
    }

    /// Record a cacheable lookup outcome in both the LRU and the durable
    /// log (spec 7: "follow-link and not-exist are cacheable outcomes").
    fn record_lookup_result(&self, endpoint: &Endpoint, name: &PathName, outcome: LookupOutcome) -> Result<()> {
        self.put_lookup(endpoint, name, outcome.clone());
        self.append(endpoint, name, LogRecordBody::Lookup { outcome })
    }

    /// Lookup algorithm (spec 4.3).
    #[instrument(skip(self), fields(%endpoint, %name))]
    pub fn lookup(&self, endpoint: &Endpoint, name: &PathName) -> Result<DirEntry> {
        if let Some(outcome) = self.get_lookup(endpoint, name) {
            self.monitor.count(Counter::DirLookupHit, 1);
            return outcome_to_result(name, outcome);
        }

        // Follow-link inheritance: any ancestor already recorded as the
        // root of a link makes every descendant return the same error
        // without consulting upstream (spec 4.3, spec 8).
        let mut cursor = name.parent();
        while let Some(dir) = cursor {
            if let Some(LookupOutcome::FollowLink) = self.get_lookup(endpoint, &dir) {
                self.monitor.count(Counter::DirFollowLinkHit, 1);
                return Err(Error::FollowLink { name: name.clone(), link: dir });
            }
            cursor = dir.parent();
        }

        // A complete glob record for the parent that doesn't list this name
        // settles the question without going upstream.
        if let Some(parent) = name.parent() {
            if let Some(base) = name.base() {
                if let Some(glob) = self.get_glob(endpoint, &parent) {
                    if glob.complete && !glob.children.contains(base) {
                        self.monitor.count(Counter::DirLookupHit, 1);
                        return Err(Error::NotExist { name: name.clone() });
                    }
                }
            }
        }

        self.monitor.count(Counter::DirLookupMiss, 1);
        let _guard = self.lock_name(endpoint, name);
        // Re-check now that we hold the name lock: another caller may have
        // just filled this exact record while we waited.
        if let Some(outcome) = self.get_lookup(endpoint, name) {
            return outcome_to_result(name, outcome);
        }
        let dir_server = self.upstream.dir_server(endpoint)?;
        match dir_server.lookup(name) {
            Ok(entry) => {
                self.record_lookup_result(endpoint, name, LookupOutcome::Found(entry.clone()))?;
                Ok(entry)
            }
            Err(err) if err.kind() == ErrorKind::NotExist => {
                self.record_lookup_result(endpoint, name, LookupOutcome::NotExist)?;
                Err(err)
            }
            Err(Error::FollowLink { name: n, link }) => {
                self.record_lookup_result(endpoint, &link, LookupOutcome::FollowLink)?;
                Err(Error::FollowLink { name: n, link })
            }
            Err(err) => Err(err),
        }
    }

    /// Glob algorithm (spec 4.3). Only `dir/*` is cacheable; anything else
    /// always falls through without touching the cache.
    #[instrument(skip(self), fields(%endpoint))]
    pub fn glob(&self, endpoint: &Endpoint, pattern: &str) -> Result<Vec<DirEntry>> {
        let cacheable = match CacheableGlob::parse(pattern) {
            Some(g) => g,
            None => {
                let dir_server = self.upstream.dir_server(endpoint)?;
                return dir_server.glob(&PathName::parse(pattern.trim_end_matches('*'))?);
            }
        };
        let dir = &cacheable.dir;

        if let Some(glob) = self.get_glob(endpoint, dir) {
            if glob.complete {
                let mut hit = true;
                let mut entries = Vec::with_capacity(glob.children.len());
                for child in &glob.children {
                    match self.get_lookup(endpoint, &dir.join(child)) {
                        Some(LookupOutcome::Found(entry)) => entries.push(entry),
                        _ => {
                            hit = false;
                            break;
                        }
                    }
                }
                if hit {
                    self.monitor.count(Counter::DirGlobHit, 1);
                    return Ok(entries);
                }
            }
        }

        self.monitor.count(Counter::DirGlobMiss, 1);
        let _guard = self.lock_name(endpoint, dir);
        let dir_server = self.upstream.dir_server(endpoint)?;
        let entries = dir_server.glob(dir)?;
        let mut children = std::collections::BTreeSet::new();
        for entry in &entries {
            if let Some(base) = entry.name.base() {
                children.insert(base.to_string());
            }
            self.put_lookup(endpoint, &entry.name, LookupOutcome::Found(entry.clone()));
            self.append(endpoint, &entry.name, LogRecordBody::Lookup { outcome: LookupOutcome::Found(entry.clone()) })?;
        }
        let access = self.get_glob(endpoint, dir).map(|g| g.access).unwrap_or_default();
        let now = Instant::now();
        self.put_glob(
            endpoint,
            dir,
            GlobRecord { children: children.clone(), complete: true, access: access.clone(), changed: now, refreshed: now },
        );
        self.append(
            endpoint,
            dir,
            LogRecordBody::Glob { children: children.into_iter().collect(), complete: true, access },
        )?;
        Ok(entries)
    }

    /// Ruling Access file for `dir` (spec 4.3).
    #[instrument(skip(self), fields(%endpoint, %dir))]
    pub fn which_access(&self, endpoint: &Endpoint, dir: &PathName) -> Result<Option<DirEntry>> {
        if let Some(glob) = self.get_glob(endpoint, dir) {
            match glob.access {
                AccessRuling::NoAccessFile => return Ok(None),
                AccessRuling::RuledBy(path) => return self.lookup(endpoint, &path).map(Some),
                AccessRuling::Unknown => {}
            }
        }
        let dir_server = self.upstream.dir_server(endpoint)?;
        let ruling = dir_server.which_access(dir)?;
        let access = match &ruling {
            Some(entry) => AccessRuling::RuledBy(entry.name.clone()),
            None => AccessRuling::NoAccessFile,
        };
        let mut record = self.get_glob(endpoint, dir).unwrap_or_else(|| GlobRecord {
            children: Default::default(),
            complete: false,
            access: AccessRuling::Unknown,
            changed: Instant::now(),
            refreshed: Instant::now(),
        });
        record.access = access.clone();
        self.append(
            endpoint,
            dir,
            LogRecordBody::Glob { children: record.children.iter().cloned().collect(), complete: record.complete, access },
        )?;
        self.put_glob(endpoint, dir, record);
        Ok(ruling)
    }

    /// Write `entry` through to upstream, updating the cache only on
    /// success (spec 4.3 "Mutations").
    #[instrument(skip(self, entry), fields(%endpoint, name = %entry.name))]
    pub fn put(&self, endpoint: &Endpoint, entry: &DirEntry) -> Result<DirEntry> {
        entry.validate()?;
        let _guard = self.lock_name(endpoint, &entry.name);
        let dir_server = self.upstream.dir_server(endpoint)?;
        let stored = dir_server.put(entry)?;
        self.put_lookup(endpoint, &entry.name, LookupOutcome::Found(stored.clone()));
        self.append(endpoint, &entry.name, LogRecordBody::Lookup { outcome: LookupOutcome::Found(stored.clone()) })?;
        self.add_child(endpoint, &entry.name)?;
        if entry.name.is_access_file() {
            self.invalidate_access(endpoint, &entry.name)?;
        }
        Ok(stored)
    }

    /// `MakeDirectory`: on success, synthesize a complete, empty glob
    /// record for the new directory -- the one place the cache anticipates
    /// upstream state (spec 4.3).
    #[instrument(skip(self), fields(%endpoint, %name))]
    pub fn make_directory(&self, endpoint: &Endpoint, name: &PathName) -> Result<DirEntry> {
        let _guard = self.lock_name(endpoint, name);
        let dir_server = self.upstream.dir_server(endpoint)?;
        let entry = dir_server.make_directory(name)?;
        self.put_lookup(endpoint, name, LookupOutcome::Found(entry.clone()));
        self.append(endpoint, name, LogRecordBody::Lookup { outcome: LookupOutcome::Found(entry.clone()) })?;
        self.put_glob(endpoint, name, GlobRecord::empty_complete());
        self.append(endpoint, name, LogRecordBody::Glob { children: vec![], complete: true, access: AccessRuling::Unknown })?;
        self.add_child(endpoint, name)?;
        Ok(entry)
    }

    /// `Delete`: removes the name's lookup record and drops it from the
    /// parent's glob children set (spec 4.3).
    #[instrument(skip(self), fields(%endpoint, %name))]
    pub fn delete(&self, endpoint: &Endpoint, name: &PathName) -> Result<()> {
        let _guard = self.lock_name(endpoint, name);
        let dir_server = self.upstream.dir_server(endpoint)?;
        dir_server.delete(name)?;
        {
            let mut lru = self.lru.lock().expect("lock dircache lru");
            lru.pop(&RecordKey::Lookup(endpoint.clone(), name.clone()));
            lru.pop(&RecordKey::Glob(endpoint.clone(), name.clone()));
        }
        self.append(endpoint, name, LogRecordBody::Delete)?;
        self.remove_child(endpoint, name)?;
        if name.is_access_file() {
            self.invalidate_access(endpoint, name)?;
        }
        Ok(())
    }

    fn add_child(&self, endpoint: &Endpoint, name: &PathName) -> Result<()> {
        let parent = match name.parent() {
            Some(p) => p,
            None => return Ok(()),
        };
        let base = match name.base() {
            Some(b) => b.to_string(),
            None => return Ok(()),
        };
        if let Some(mut glob) = self.get_glob(endpoint, &parent) {
            glob.children.insert(base);
            let body = LogRecordBody::Glob {
                children: glob.children.iter().cloned().collect(),
                complete: glob.complete,
                access: glob.access.clone(),
            };
            self.put_glob(endpoint, &parent, glob);
            self.append(endpoint, &parent, body)?;
        }
        Ok(())
    }

    fn remove_child(&self, endpoint: &Endpoint, name: &PathName) -> Result<()> {
        let parent = match name.parent() {
            Some(p) => p,
            None => return Ok(()),
        };
        let base = match name.base() {
            Some(b) => b.to_string(),
            None => return Ok(()),
        };
        if let Some(mut glob) = self.get_glob(endpoint, &parent) {
            glob.children.remove(&base);
            let body = LogRecordBody::Glob {
                children: glob.children.iter().cloned().collect(),
                complete: glob.complete,
                access: glob.access.clone(),
            };
            self.put_glob(endpoint, &parent, glob);
            self.append(endpoint, &parent, body)?;
        }
        Ok(())
    }

    /// Invalidate the ruling Access field on every descendant glob record
    /// of the directory holding `access_file_name` (spec 4.3, spec 8
    /// "WhichAccess invalidation"): found by a prefix scan of the LRU.
    fn invalidate_access(&self, endpoint: &Endpoint, access_file_name: &PathName) -> Result<()> {
        let dir = match access_file_name.parent() {
            Some(d) => d,
            None => return Ok(()),
        };
        let stale: Vec<PathName> = {
            let lru = self.lru.lock().expect("lock dircache lru");
            lru.iter()
                .filter_map(|(key, _)| match key {
                    RecordKey::Glob(e, n) if e == endpoint && n.is_descendant_of(&dir) => Some(n.clone()),
                    _ => None,
                })
                .collect()
        };
        for name in stale {
            if let Some(mut glob) = self.get_glob(endpoint, &name) {
                glob.access = AccessRuling::Unknown;
                let body = LogRecordBody::Glob {
                    children: glob.children.iter().cloned().collect(),
                    complete: glob.complete,
                    access: AccessRuling::Unknown,
                };
                self.put_glob(endpoint, &name, glob);
                self.append(endpoint, &name, body)?;
            }
        }
        self.monitor.count(Counter::DirWhichAccessInvalidated, 1);
        Ok(())
    }

    /// Subscribe to upstream events for `name`'s subtree, multiplexing one
    /// upstream watcher per `(endpoint, subtree-root)` across all local
    /// subscribers (spec 4.3).
    pub fn watch(self: &Arc<Self>, endpoint: &Endpoint, name: &PathName, since_sequence: u64) -> Result<Subscription> {
        self.watcher.subscribe(self.clone(), self.upstream.clone(), endpoint.clone(), name.clone(), since_sequence)
    }

    /// Apply one delivered watch event to the cache: insert or delete the
    /// relevant record, flushing descendant Access fields if the event
    /// concerns an Access file (spec 4.3).
    pub(crate) fn apply_event(&self, endpoint: &Endpoint, event: &crate::upstream::Event) {
        if event.delete {
            let mut lru = self.lru.lock().expect("lock dircache lru");
            lru.pop(&RecordKey::Lookup(endpoint.clone(), event.name.clone()));
        } else if let Some(entry) = &event.entry {
            self.put_lookup(endpoint, &event.name, LookupOutcome::Found(entry.clone()));
        }
        if event.name.is_access_file() {
            let _ = self.invalidate_access(endpoint, &event.name);
        }
    }

    /// Drive one round of the refresher (spec 4.3 "Refresher").
    pub fn refresh_round(&self, max_records: usize) {
        refresher::run_round(self, max_records);
    }

    fn stale_candidates(&self, now: Instant, max: usize) -> Vec<RecordKey> {
        let lru = self.lru.lock().expect("lock dircache lru");
        refresher::select_stale(lru.iter().map(|(k, v)| (k.clone(), v.clone())), now, max)
    }

    fn refresh_one(&self, endpoint: &Endpoint, name: &PathName, is_glob: bool) {
        if is_glob {
            let pattern = format!("{name}/*");
            let _ = self.glob_force_refresh(endpoint, name, &pattern);
        } else {
            let _ = self.lookup_force_refresh(endpoint, name);
        }
    }

    fn lookup_force_refresh(&self, endpoint: &Endpoint, name: &PathName) -> Result<()> {
        let dir_server = self.upstream.dir_server(endpoint)?;
        match dir_server.lookup(name) {
            Ok(entry) => self.record_lookup_result(endpoint, name, LookupOutcome::Found(entry))?,
            Err(err) if err.kind() == ErrorKind::NotExist => {
                self.record_lookup_result(endpoint, name, LookupOutcome::NotExist)?
            }
            Err(_) => return Ok(()), // skipped for the remainder of this round by the caller
        }
        self.touch_refreshed(&RecordKey::Lookup(endpoint.clone(), name.clone()));
        self.monitor.count(Counter::DirRefreshed, 1);
        Ok(())
    }

    fn glob_force_refresh(&self, endpoint: &Endpoint, dir: &PathName, _pattern: &str) -> Result<()> {
        let dir_server = self.upstream.dir_server(endpoint)?;
        let entries = dir_server.glob(dir)?;
        let mut children = std::collections::BTreeSet::new();
        for entry in &entries {
            if let Some(base) = entry.name.base() {
                children.insert(base.to_string());
            }
            self.put_lookup(endpoint, &entry.name, LookupOutcome::Found(entry.clone()));
        }
        let access = self.get_glob(endpoint, dir).map(|g| g.access).unwrap_or_default();
        let now = Instant::now();
        self.put_glob(endpoint, dir, GlobRecord { children, complete: true, access, changed: now, refreshed: now });
        self.touch_refreshed(&RecordKey::Glob(endpoint.clone(), dir.clone()));
        self.monitor.count(Counter::DirRefreshed, 1);
        Ok(())
    }

    fn touch_refreshed(&self, key: &RecordKey) {
        let mut lru = self.lru.lock().expect("lock dircache lru");
        if let Some(record) = lru.peek_mut(key) {
            record.touch_refreshed(Instant::now());
        }
    }
}

fn outcome_to_result(name: &PathName, outcome: LookupOutcome) -> Result<DirEntry> {
    match outcome {
        LookupOutcome::Found(entry) => Ok(entry),
        LookupOutcome::NotExist => Err(Error::NotExist { name: name.clone() }),
        LookupOutcome::FollowLink => Err(Error::FollowLink { name: name.clone(), link: name.clone() }),
    }
}

fn apply_replayed(lru: &mut LruCache<RecordKey, CacheRecord>, record: &LogRecord) {
    let now = Instant::now();
    match &record.body {
        LogRecordBody::Lookup { outcome } => {
            lru.put(
                RecordKey::Lookup(record.endpoint.clone(), record.name.clone()),
                CacheRecord::Lookup(LookupRecord { outcome: outcome.clone(), changed: now, refreshed: now }),
            );
        }
        LogRecordBody::Glob { children, complete, access } => {
            lru.put(
                RecordKey::Glob(record.endpoint.clone(), record.name.clone()),
                CacheRecord::Glob(GlobRecord {
                    children: children.iter().cloned().collect(),
                    complete: *complete,
                    access: access.clone(),
                    changed: now,
                    refreshed: now,
                }),
            );
        }
        LogRecordBody::Delete => {
            lru.pop(&RecordKey::Lookup(record.endpoint.clone(), record.name.clone()));
            lru.pop(&RecordKey::Glob(record.endpoint.clone(), record.name.clone()));
        }
    }
}

fn snapshot_as_records(lru: &LruCache<RecordKey, CacheRecord>) -> Vec<LogRecord> {
    lru.iter()
        .map(|(key, record)| {
            let body = match record {
                CacheRecord::Lookup(r) => LogRecordBody::Lookup { outcome: r.outcome.clone() },
                CacheRecord::Glob(r) => LogRecordBody::Glob {
                    children: r.children.iter().cloned().collect(),
                    complete: r.complete,
                    access: r.access.clone(),
                },
            };
            log::new_record(key.endpoint().clone(), key.name().clone(), body)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirent::Attr;
    use crate::path::UserName;
    use crate::upstream::{DirServer, StoreGetOutcome, StoreServer, WatchHandle};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use tempfile::TempDir;

    fn name(s: &str) -> PathName {
        PathName::parse(s).unwrap()
    }

    fn entry(n: &str) -> DirEntry {
        let p = name(n);
        DirEntry {
            name: p.clone(),
            signed_name: p,
            writer: UserName::new("alice@example.com"),
            packing: 0,
            time: 0,
            sequence: 1,
            attr: Attr::None,
            link_target: None,
            blocks: vec![],
            packdata: vec![],
        }
    }

    struct FakeDir {
        entries: Mutex<HashMap<String, DirEntry>>,
        lookups: AtomicUsize,
    }

    impl DirServer for FakeDir {
        fn lookup(&self, name: &PathName) -> Result<DirEntry> {
            self.lookups.fetch_add(1, SeqCst);
            self.entries
                .lock()
                .unwrap()
                .get(&name.to_string())
                .cloned()
                .ok_or(Error::NotExist { name: name.clone() })
        }
        fn glob(&self, dir: &PathName) -> Result<Vec<DirEntry>> {
            let prefix = format!("{dir}/");
            Ok(self
                .entries
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.name.to_string().starts_with(&prefix) && e.name.parent().as_ref() == Some(dir))
                .cloned()
                .collect())
        }
        fn which_access(&self, _name: &PathName) -> Result<Option<DirEntry>> {
            Ok(None)
        }
        fn put(&self, entry: &DirEntry) -> Result<DirEntry> {
            self.entries.lock().unwrap().insert(entry.name.to_string(), entry.clone());
            Ok(entry.clone())
        }
        fn make_directory(&self, name: &PathName) -> Result<DirEntry> {
            let mut e = entry(&name.to_string());
            e.attr = Attr::Directory;
            self.entries.lock().unwrap().insert(name.to_string(), e.clone());
            Ok(e)
        }
        fn delete(&self, name: &PathName) -> Result<()> {
            self.entries.lock().unwrap().remove(&name.to_string());
            Ok(())
        }
        fn watch(&self, _name: &PathName, _since: u64) -> Result<Box<dyn WatchHandle>> {
            unimplemented!()
        }
    }

    struct FakeUpstream(Arc<FakeDir>);
    impl UpstreamDirectory for FakeUpstream {
        fn dir_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
            Ok(self.0.clone())
        }
        fn store_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
            unimplemented!()
        }
    }

    fn cache(dir: &TempDir, upstream: Arc<FakeDir>) -> Arc<DirCache> {
        DirCache::open(
            dir.path().join("log"),
            DEFAULT_MAX_ENTRIES,
            1 << 20,
            Arc::new(FakeUpstream(upstream)),
            Arc::new(crate::monitor::NullMonitor),
        )
        .unwrap()
    }

    #[test]
    fn put_then_lookup_then_delete() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(FakeDir { entries: Mutex::new(HashMap::new()), lookups: AtomicUsize::new(0) });
        let dc = cache(&dir, upstream.clone());
        let endpoint = Endpoint::remote("s:1");
        dc.make_directory(&endpoint, &name("alice@x/d")).unwrap();
        dc.put(&endpoint, &entry("alice@x/d/f")).unwrap();
        let got = dc.lookup(&endpoint, &name("alice@x/d/f")).unwrap();
        assert_eq!(got.name, name("alice@x/d/f"));
        dc.delete(&endpoint, &name("alice@x/d/f")).unwrap();
        let err = dc.lookup(&endpoint, &name("alice@x/d/f")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
    }

    #[test]
    fn not_exist_cached_by_complete_glob() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(FakeDir { entries: Mutex::new(HashMap::new()), lookups: AtomicUsize::new(0) });
        let dc = cache(&dir, upstream.clone());
        let endpoint = Endpoint::remote("s:1");
        dc.glob(&endpoint, "alice@x/d/*").unwrap();
        let before = upstream.lookups.load(SeqCst);
        let err = dc.lookup(&endpoint, &name("alice@x/d/nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
        assert_eq!(upstream.lookups.load(SeqCst), before, "should not have consulted upstream");
    }

    #[test]
    fn follow_link_propagates_to_descendants() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(FakeDir { entries: Mutex::new(HashMap::new()), lookups: AtomicUsize::new(0) });
        let dc = cache(&dir, upstream);
        let endpoint = Endpoint::remote("s:1");
        dc.record_lookup_result(&endpoint, &name("alice@x/link"), LookupOutcome::FollowLink).unwrap();
        let err = dc.lookup(&endpoint, &name("alice@x/link/a/b")).unwrap_err();
        match err {
            Error::FollowLink { link, .. } => assert_eq!(link, name("alice@x/link")),
            other => panic!("expected FollowLink, got {other:?}"),
        }
    }

    #[test]
    fn access_invalidation_clears_descendant_rulings() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(FakeDir { entries: Mutex::new(HashMap::new()), lookups: AtomicUsize::new(0) });
        let dc = cache(&dir, upstream);
        let endpoint = Endpoint::remote("s:1");
        dc.make_directory(&endpoint, &name("alice@x/a")).unwrap();
        dc.put_glob(
            &endpoint,
            &name("alice@x/a"),
            GlobRecord { children: Default::default(), complete: true, access: AccessRuling::RuledBy(name("alice@x/a/Access")), changed: Instant::now(), refreshed: Instant::now() },
        );
        dc.put(&endpoint, &entry("alice@x/a/Access")).unwrap();
        let glob = dc.get_glob(&endpoint, &name("alice@x/a")).unwrap();
        assert_eq!(glob.access, AccessRuling::Unknown);
    }

    #[test]
    fn compaction_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let upstream = Arc::new(FakeDir { entries: Mutex::new(HashMap::new()), lookups: AtomicUsize::new(0) });
        {
            let dc = cache(&dir, upstream.clone());
            let endpoint = Endpoint::remote("s:1");
            dc.put(&endpoint, &entry("alice@x/f")).unwrap();
        }
        let dc2 = cache(&dir, upstream);
        let endpoint = Endpoint::remote("s:1");
        let got = dc2.lookup(&endpoint, &name("alice@x/f")).unwrap();
        assert_eq!(got.name, name("alice@x/f"));
    }
}
