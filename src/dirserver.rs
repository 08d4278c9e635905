// Upspin cacheserver.
//! The Dir RPC front (spec 4.5): terminates the Dir protocol and delegates
//! every call to the directory cache. Mutations always go through to
//! upstream; `Lookup`/`Glob`/`WhichAccess` consult the cache first.

use std::sync::Arc;

use crate::dircache::DirCache;
use crate::dirent::DirEntry;
use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::path::PathName;

/// Terminates the Dir wire protocol for one cacheserver client, backed by a
/// single directory cache (spec 4.5).
pub struct DirFront {
    cache: Arc<DirCache>,
}

impl DirFront {
    pub fn new(cache: Arc<DirCache>) -> DirFront {
        DirFront { cache }
    }

    pub fn lookup(&self, endpoint: &Endpoint, name: &PathName) -> Result<DirEntry> {
        self.cache.lookup(endpoint, name)
    }

    pub fn glob(&self, endpoint: &Endpoint, pattern: &str) -> Result<Vec<DirEntry>> {
        self.cache.glob(endpoint, pattern)
    }

    pub fn which_access(&self, endpoint: &Endpoint, dir: &PathName) -> Result<Option<DirEntry>> {
        self.cache.which_access(endpoint, dir)
    }

    /// Every mutation goes *through* to upstream under the writer's
    /// authenticated identity; failures propagate verbatim (spec 4.5).
    pub fn put(&self, endpoint: &Endpoint, entry: &DirEntry) -> Result<DirEntry> {
        self.cache.put(endpoint, entry)
    }

    pub fn make_directory(&self, endpoint: &Endpoint, name: &PathName) -> Result<DirEntry> {
        self.cache.make_directory(endpoint, name)
    }

    pub fn delete(&self, endpoint: &Endpoint, name: &PathName) -> Result<()> {
        self.cache.delete(endpoint, name)
    }

    /// Installs a subscriber on the multiplexed watcher for `name`'s
    /// subtree (spec 4.5).
    pub fn watch(&self, endpoint: &Endpoint, name: &PathName, since_sequence: u64) -> Result<crate::dircache::Subscription> {
        self.cache.watch(endpoint, name, since_sequence)
    }
}
