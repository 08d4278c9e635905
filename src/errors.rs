// Upspin cacheserver.
//! Cacheserver error types.
//!
//! Every error carries a [`ErrorKind`] so that callers -- in particular the
//! directory cache's caching policy -- can decide whether an outcome is
//! cacheable without matching on the full variant set.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::path::PathName;

/// The error kinds the cache distinguishes.
///
/// `NotExist` and `FollowLink` are the only cacheable outcomes; every other
/// kind must never be written into the directory cache's log or LRU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotExist,
    Exist,
    Permission,
    Private,
    IsDirectory,
    NotDirectory,
    FollowLink,
    Invalid,
    Integrity,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// True for the two outcomes the directory cache is allowed to record.
    pub fn cacheable(self) -> bool {
        matches!(self, ErrorKind::NotExist | ErrorKind::FollowLink)
    }
}

/// Cacheserver specific error.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("{name} does not exist")]
    NotExist { name: PathName },

    #[error("{name} already exists")]
    Exist { name: PathName },

    #[error("permission denied for {name}")]
    Permission { name: PathName },

    #[error("{name} is private")]
    Private { name: PathName },

    #[error("{name} is a directory")]
    IsDirectory { name: PathName },

    #[error("{name} is not a directory")]
    NotDirectory { name: PathName },

    #[error("{name} traverses a link rooted at {link}")]
    FollowLink { name: PathName, link: PathName },

    #[error("invalid directory entry for {name}: {reason}")]
    InvalidEntry { name: PathName, reason: String },

    #[error("block {reference} at {endpoint:?} failed integrity check")]
    Integrity {
        endpoint: Endpoint,
        reference: String,
    },

    #[error("upstream {endpoint:?} unavailable: {reason}")]
    Unavailable { endpoint: Endpoint, reason: String },

    #[error("cache is saturated with dirty blocks, cannot admit a new block")]
    ResourceExhausted,

    #[error("internal cacheserver error: {0}")]
    Internal(String),

    #[error("failed to write cache file {path:?}")]
    WriteCacheFile { path: PathBuf, source: io::Error },

    #[error("failed to read cache file {path:?}")]
    ReadCacheFile { path: PathBuf, source: io::Error },

    #[error("failed to serialize directory cache record")]
    SerializeLogRecord {
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize directory cache record at {path:?}")]
    DeserializeLogRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another cacheserver instance holds the lock at {path:?}")]
    AlreadyLocked { path: PathBuf },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A replay of an error already observed by another caller, e.g. a
    /// waiter on a coalesced in-flight fetch (spec 8, "at-most-once
    /// upstream fetch"). Carries only the originating [`ErrorKind`] and a
    /// message, since the concrete variant's fields may not be
    /// reconstructable from a second call site.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    /// Generic IO error, for cases with no more specific variant.
    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            NotExist { .. } => ErrorKind::NotExist,
            Exist { .. } => ErrorKind::Exist,
            Permission { .. } => ErrorKind::Permission,
            Private { .. } => ErrorKind::Private,
            IsDirectory { .. } => ErrorKind::IsDirectory,
            NotDirectory { .. } => ErrorKind::NotDirectory,
            FollowLink { .. } => ErrorKind::FollowLink,
            InvalidEntry { .. } => ErrorKind::Invalid,
            Integrity { .. } => ErrorKind::Integrity,
            Unavailable { .. } => ErrorKind::Unavailable,
            ResourceExhausted => ErrorKind::Internal,
            Internal(_) => ErrorKind::Internal,
            Remote { kind, .. } => *kind,
            WriteCacheFile { .. }
            | ReadCacheFile { .. }
            | SerializeLogRecord { .. }
            | DeserializeLogRecord { .. }
            | AlreadyLocked { .. }
            | Configuration(_)
            | Io { .. } => ErrorKind::Internal,
        }
    }

    /// True if this outcome may be written into the directory cache.
    pub fn cacheable(&self) -> bool {
        self.kind().cacheable()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A cheaply cloneable snapshot of an [`Error`], used to replay a single
/// upstream outcome to every waiter on a coalesced operation (block cache
/// in-flight fetches, directory cache watcher multiplexing).
#[derive(Clone, Debug)]
pub struct CachedError {
    kind: ErrorKind,
    message: String,
}

impl From<&Error> for CachedError {
    fn from(err: &Error) -> CachedError {
        CachedError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl CachedError {
    pub fn into_error(self) -> Error {
        Error::Remote {
            kind: self.kind,
            message: self.message,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}
