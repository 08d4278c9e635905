// Upspin cacheserver.
//! The unit of both the in-memory LRU and the on-disk log: a `clogEntry`
//! (spec 3, spec 4.3).

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::dirent::DirEntry;
use crate::endpoint::Endpoint;
use crate::path::PathName;

/// Identifies one cached record: either what we know about looking up an
/// exact name, or what we know about listing a directory's children.
/// These are deliberately distinct key spaces -- a directory has both a
/// lookup record (its own `DirEntry`) and, separately, a glob record (its
/// children) -- per spec 9's "flat LRU of per-name records".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Lookup(Endpoint, PathName),
    Glob(Endpoint, PathName),
}

impl RecordKey {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            RecordKey::Lookup(e, _) | RecordKey::Glob(e, _) => e,
        }
    }

    pub fn name(&self) -> &PathName {
        match self {
            RecordKey::Lookup(_, n) | RecordKey::Glob(_, n) => n,
        }
    }
}

/// The terminal outcome of a cached lookup. Only `NotExist` and
/// `FollowLink` are cacheable error outcomes (spec 7); a successful lookup
/// caches the `DirEntry` itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupOutcome {
    Found(DirEntry),
    NotExist,
    /// The link is rooted at this record's own name; descendants inherit
    /// this outcome without consulting upstream (spec 4.3, spec 8).
    FollowLink,
}

/// Who rules over Access decisions for a directory, cached on that
/// directory's glob record (spec 4.3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessRuling {
    #[default]
    Unknown,
    NoAccessFile,
    RuledBy(PathName),
}

#[derive(Clone, Debug)]
pub struct LookupRecord {
    pub outcome: LookupOutcome,
    pub changed: Instant,
    pub refreshed: Instant,
}

#[derive(Clone, Debug)]
pub struct GlobRecord {
    pub children: BTreeSet<String>,
    /// True when this set is known to be exhaustive (spec 3: "Complete
    /// glob"): produced by a successful `Glob(dir/*)` or by our own
    /// `MakeDirectory` of an empty directory.
    pub complete: bool,
    pub access: AccessRuling,
    pub changed: Instant,
    pub refreshed: Instant,
}

impl GlobRecord {
    pub fn empty_complete() -> GlobRecord {
        let now = Instant::now();
        GlobRecord {
            children: BTreeSet::new(),
            complete: true,
            access: AccessRuling::Unknown,
            changed: now,
            refreshed: now,
        }
    }
}

#[derive(Clone, Debug)]
pub enum CacheRecord {
    Lookup(LookupRecord),
    Glob(GlobRecord),
}

impl CacheRecord {
    pub fn changed(&self) -> Instant {
        match self {
            CacheRecord::Lookup(r) => r.changed,
            CacheRecord::Glob(r) => r.changed,
        }
    }

    pub fn refreshed(&self) -> Instant {
        match self {
            CacheRecord::Lookup(r) => r.refreshed,
            CacheRecord::Glob(r) => r.refreshed,
        }
    }

    pub fn touch_refreshed(&mut self, at: Instant) {
        match self {
            CacheRecord::Lookup(r) => r.refreshed = at,
            CacheRecord::Glob(r) => r.refreshed = at,
        }
    }
}

/// On-disk, versioned representation of one log record (spec 3, spec 4.3
/// "On-disk log"). `Instant` has no meaningful serialized form, so changed
/// and refreshed times are not persisted; a replayed record is considered
/// just-changed and due for refresh on its own schedule from that point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub version: u8,
    pub endpoint: Endpoint,
    pub name: PathName,
    pub body: LogRecordBody,
}

pub const LOG_RECORD_VERSION: u8 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogRecordBody {
    Lookup { outcome: LookupOutcome },
    Glob { children: Vec<String>, complete: bool, access: AccessRuling },
    Delete,
}
