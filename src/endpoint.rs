// Upspin cacheserver.
//! Endpoints, references and locations -- the addressing scheme for blocks
//! and the servers that hold them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The transport half of an [`Endpoint`].
///
/// Only the two transports the cacheserver core cares about are modeled:
/// `Remote` dials an upstream server over the pre-authenticated RPC client
/// (spec 6); `Unassigned` is the cache-recursion guard described in spec 3 --
/// a cacheserver's own configured cache endpoint is rewritten to
/// `Unassigned` before it builds its own upstream client stack, so a
/// cacheserver can never dial itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Remote,
    Unassigned,
}

/// `(transport, network-address)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub transport: Transport,
    pub net_addr: String,
}

impl Endpoint {
    pub fn remote(net_addr: impl Into<String>) -> Endpoint {
        Endpoint {
            transport: Transport::Remote,
            net_addr: net_addr.into(),
        }
    }

    pub fn unassigned() -> Endpoint {
        Endpoint {
            transport: Transport::Unassigned,
            net_addr: String::new(),
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.transport == Transport::Unassigned
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Remote => write!(f, "remote,{}", self.net_addr),
            Transport::Unassigned => write!(f, "unassigned"),
        }
    }
}

/// An opaque reference produced by an upstream StoreServer.
///
/// For content-addressed packings this is the content hash, but the cache
/// never interprets it -- it only uses it as a cache key alongside the
/// endpoint it came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference(pub String);

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Reference {
    fn from(s: String) -> Self {
        Reference(s)
    }
}

impl From<&str> for Reference {
    fn from(s: &str) -> Self {
        Reference(s.to_string())
    }
}

/// The synthetic reference that `Store.Get` treats as a liveness probe.
pub const HEALTH_METADATA: &str = "HealthMetadata";

/// The synthetic reference that `Store.Get` treats as "block until the
/// writeback queue for this endpoint has drained".
pub const FLUSH_WRITEBACKS_METADATA: &str = "FlushWritebacksMetadata";

/// `(endpoint, reference)`. Identifies a block.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub endpoint: Endpoint,
    pub reference: Reference,
}

impl Location {
    pub fn new(endpoint: Endpoint, reference: impl Into<Reference>) -> Location {
        Location {
            endpoint,
            reference: reference.into(),
        }
    }

    /// A stable cache-key string combining endpoint and reference, used to
    /// derive on-disk file names (spec 3: "a stable hash of
    /// `(endpoint, reference)`").
    pub fn cache_key(&self) -> String {
        format!("{}\u{0}{}", self.endpoint, self.reference)
    }
}
