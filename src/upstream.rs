// Upspin cacheserver.
//! The upstream RPC client contract (spec 6).
//!
//! TLS transport, authenticated-RPC framing, and the KeyServer lookup that
//! resolves a user name to these endpoints are all out of scope for this
//! repository. The cacheserver core talks to upstream exclusively through
//! these two traits, which model a pre-authenticated client already bound
//! to one endpoint and one writer identity.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::dirent::DirEntry;
use crate::errors::Result;
use crate::path::PathName;

/// An event delivered by an upstream `Watch` stream, or multiplexed to a
/// local subscriber by the directory cache's watcher (spec 4.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub name: PathName,
    pub entry: Option<DirEntry>,
    pub delete: bool,
    pub error: Option<crate::errors::ErrorKind>,
    /// Monotonically increasing order within one watch stream.
    pub order: u64,
}

/// A handle to a live upstream watch. Dropping it (or closing the paired
/// cancel mechanism) must promptly stop upstream event delivery.
pub trait WatchHandle: Send {
    fn events(&self) -> &Receiver<Event>;
}

/// The upstream DirServer contract consumed by the directory cache and by
/// the Dir RPC front on a cache miss.
///
/// Every method corresponds 1:1 to a wire call in spec 6. Implementations
/// are expected to already carry the authenticated client identity and to
/// apply their own per-operation timeout; on timeout they must return
/// `Error::Unavailable` rather than blocking indefinitely (spec 5).
pub trait DirServer: Send + Sync {
    fn lookup(&self, name: &PathName) -> Result<DirEntry>;

    /// List the direct children of `dir`. Upstream is the source of truth
    /// for completeness; the cache decides cacheability separately (spec 4.3).
    fn glob(&self, dir: &PathName) -> Result<Vec<DirEntry>>;

    fn which_access(&self, name: &PathName) -> Result<Option<DirEntry>>;

    /// Write `entry`, which must be signed and packed by the caller.
    /// Mutations are always synchronous against upstream (spec 4.5).
    fn put(&self, entry: &DirEntry) -> Result<DirEntry>;

    fn make_directory(&self, name: &PathName) -> Result<DirEntry>;

    fn delete(&self, name: &PathName) -> Result<()>;

    /// Open a streaming watch on `name`'s subtree, replaying from
    /// `since_sequence` if upstream supports it.
    fn watch(&self, name: &PathName, since_sequence: u64) -> Result<Box<dyn WatchHandle>>;
}

/// The outcome of an upstream `Store.Get`: either the block's bytes, or a
/// set of locations to retry at (the block moved).
#[derive(Clone, Debug)]
pub enum StoreGetOutcome {
    Data(Bytes),
    Redirect(Vec<crate::endpoint::Location>),
}

/// The upstream StoreServer contract consumed by the block cache.
pub trait StoreServer: Send + Sync {
    fn get(&self, reference: &str) -> Result<StoreGetOutcome>;

    /// Store already-packed bytes upstream, returning the reference
    /// upstream assigns. For content-addressed packings this must equal
    /// the reference the caller already computed locally.
    fn put(&self, data: Bytes) -> Result<String>;

    fn delete(&self, reference: &str) -> Result<()>;
}

/// A per-endpoint directory of upstream clients, so the dircache and
/// storecache can resolve "the DirServer/StoreServer for this endpoint"
/// without knowing how clients are constructed (that's the KeyServer
/// lookup's job, out of scope here).
pub trait UpstreamDirectory: Send + Sync {
    fn dir_server(&self, endpoint: &crate::endpoint::Endpoint) -> Result<Arc<dyn DirServer>>;
    fn store_server(&self, endpoint: &crate::endpoint::Endpoint) -> Result<Arc<dyn StoreServer>>;
}
