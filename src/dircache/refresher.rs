// Upspin cacheserver.
//! Background refresher (spec 4.3): walks the cache in two passes -- globs
//! first, then plain lookups -- and re-fetches records whose age since
//! their last successful refresh exceeds a threshold that grows with the
//! record's stability, so it cannot starve live traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::record::{CacheRecord, RecordKey};
use super::DirCache;

/// A record that has not changed for `T` is refreshed at intervals
/// approaching `T/2`, capped at one hour (spec 4.3).
const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// At most this many records are refreshed per round (spec 4.3).
pub const MAX_PER_ROUND: usize = 50;

/// The round pauses between iterations so the refresher cannot starve live
/// traffic (spec 4.3, spec 5).
const PAUSE_BETWEEN_ROUNDS: Duration = Duration::from_millis(200);

fn due_interval(stable_for: Duration) -> Duration {
    (stable_for / 2).min(MAX_INTERVAL)
}

fn is_due(changed: Instant, refreshed: Instant, now: Instant) -> bool {
    let stable_for = refreshed.saturating_duration_since(changed);
    now.saturating_duration_since(refreshed) >= due_interval(stable_for)
}

/// Select up to `max` stale keys, with glob records ordered before plain
/// lookups (spec 4.3: "walks the LRU in two passes, globs first").
pub fn select_stale(
    records: impl Iterator<Item = (RecordKey, CacheRecord)>,
    now: Instant,
    max: usize,
) -> Vec<RecordKey> {
    let mut globs = Vec::new();
    let mut lookups = Vec::new();
    for (key, record) in records {
        if is_due(record.changed(), record.refreshed(), now) {
            match &key {
                RecordKey::Glob(..) => globs.push(key),
                RecordKey::Lookup(..) => lookups.push(key),
            }
        }
    }
    globs.truncate(max);
    let remaining = max.saturating_sub(globs.len());
    lookups.truncate(remaining);
    globs.extend(lookups);
    globs
}

/// Run one round against `cache`, re-fetching up to `max_records` stale
/// entries. An endpoint that fails a refresh is simply skipped; the next
/// round will try again (spec 4.3: "endpoints that fail a refresh are
/// skipped for the remainder of the round").
pub fn run_round(cache: &DirCache, max_records: usize) {
    let now = Instant::now();
    for key in cache.stale_candidates(now, max_records) {
        let is_glob = matches!(key, RecordKey::Glob(..));
        cache.refresh_one(key.endpoint(), key.name(), is_glob);
    }
}

/// Spawn the background refresher loop.
pub fn spawn(cache: Arc<DirCache>) {
    std::thread::Builder::new()
        .name("dircache-refresher".to_string())
        .spawn(move || loop {
            cache.refresh_round(MAX_PER_ROUND);
            std::thread::sleep(PAUSE_BETWEEN_ROUNDS);
        })
        .expect("spawn refresher thread");
}

#[cfg(test)]
mod test {
    use super::super::record::{GlobRecord, LookupOutcome, LookupRecord};
    use super::*;

    #[test]
    fn freshly_changed_record_is_not_due() {
        let now = Instant::now();
        assert!(!is_due(now, now, now));
    }

    #[test]
    fn long_stable_record_refresh_interval_is_capped() {
        assert_eq!(due_interval(Duration::from_secs(100_000)), MAX_INTERVAL);
    }

    #[test]
    fn globs_are_selected_before_lookups() {
        use crate::endpoint::Endpoint;
        use crate::path::PathName;

        let old = Instant::now() - Duration::from_secs(10_000);
        let lookup_key = RecordKey::Lookup(Endpoint::remote("s:1"), PathName::parse("a@b/f").unwrap());
        let glob_key = RecordKey::Glob(Endpoint::remote("s:1"), PathName::parse("a@b").unwrap());
        let lookup_rec = CacheRecord::Lookup(LookupRecord { outcome: LookupOutcome::NotExist, changed: old, refreshed: old });
        let glob_rec = CacheRecord::Glob(GlobRecord {
            children: Default::default(),
            complete: true,
            access: Default::default(),
            changed: old,
            refreshed: old,
        });
        let selected = select_stale(
            vec![(lookup_key.clone(), lookup_rec), (glob_key.clone(), glob_rec)].into_iter(),
            Instant::now(),
            1,
        );
        assert_eq!(selected, vec![glob_key]);
    }
}
