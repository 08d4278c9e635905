// Upspin cacheserver.
//! The Store RPC front (spec 4.4): terminates the Store protocol locally
//! and routes each call to the block cache, intercepting the two synthetic
//! references that never reach upstream.

use bytes::Bytes;

use crate::dirent::BlockPackdata;
use crate::endpoint::{Endpoint, Reference, FLUSH_WRITEBACKS_METADATA, HEALTH_METADATA};
use crate::errors::Result;
use crate::storecache::{BlockCache, GetOutcome};

/// Returned for `Get(HealthMetadata)`: a liveness probe used by the
/// `cacheserver` spawn/ping protocol (spec 6).
pub const HEALTH_RESPONSE: &[u8] = b"cacheserver alive";

/// Returned for `Get(FlushWritebacksMetadata)` once the writeback queue for
/// the calling endpoint has drained (spec 6).
pub const FLUSH_RESPONSE: &[u8] = b"cache flushed";

/// Terminates the Store wire protocol for one cacheserver client, backed by
/// a single block cache (spec 4.4).
pub struct StoreFront {
    block_cache: std::sync::Arc<BlockCache>,
}

impl StoreFront {
    pub fn new(block_cache: std::sync::Arc<BlockCache>) -> StoreFront {
        StoreFront { block_cache }
    }

    /// `Get(ref)`. `expected` is the per-block packdata the caller already
    /// knows from the `DirEntry` this reference came from, carried along so
    /// the block cache can verify integrity without re-deriving it.
    pub fn get(&self, endpoint: &Endpoint, reference: &str, expected: &BlockPackdata) -> Result<GetOutcome> {
        if reference == HEALTH_METADATA {
            return Ok(GetOutcome::Data(Bytes::from_static(HEALTH_RESPONSE)));
        }
        if reference == FLUSH_WRITEBACKS_METADATA {
            self.block_cache.flush_writebacks()?;
            return Ok(GetOutcome::Data(Bytes::from_static(FLUSH_RESPONSE)));
        }
        self.block_cache.get(endpoint, &Reference::from(reference), expected)
    }

    /// `Put(bytes)`. In writeback mode this returns as soon as the local
    /// file is fsynced and the queue entry is durable (spec 4.4).
    pub fn put(&self, endpoint: &Endpoint, data: Bytes) -> Result<Reference> {
        self.block_cache.put(endpoint, data)
    }

    /// `Delete(ref)`.
    pub fn delete(&self, endpoint: &Endpoint, reference: &str) -> Result<()> {
        self.block_cache.delete(endpoint, &Reference::from(reference))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::monitor::NullMonitor;
    use crate::storecache::WriteMode;
    use crate::upstream::{DirServer, StoreGetOutcome, StoreServer, UpstreamDirectory, WatchHandle};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct DummyStore;
    impl StoreServer for DummyStore {
        fn get(&self, _reference: &str) -> Result<StoreGetOutcome> {
            Ok(StoreGetOutcome::Data(Bytes::from("upstream-bytes")))
        }
        fn put(&self, _data: Bytes) -> Result<String> {
            Ok("ref".to_string())
        }
        fn delete(&self, _reference: &str) -> Result<()> {
            Ok(())
        }
    }

    struct DummyUpstream;
    impl UpstreamDirectory for DummyUpstream {
        fn dir_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
            unimplemented!()
        }
        fn store_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
            Ok(Arc::new(DummyStore))
        }
    }

    fn front(dir: &TempDir) -> StoreFront {
        let bc = BlockCache::open(
            dir.path().join("storecache"),
            1 << 20,
            WriteMode::Writethrough,
            Arc::new(DummyUpstream),
            None,
            Arc::new(NullMonitor),
        )
        .unwrap();
        StoreFront::new(Arc::new(bc))
    }

    #[test]
    fn health_metadata_short_circuits_the_block_cache() {
        let dir = TempDir::new().unwrap();
        let sf = front(&dir);
        let endpoint = Endpoint::remote("s:1");
        match sf.get(&endpoint, HEALTH_METADATA, &BlockPackdata::None).unwrap() {
            GetOutcome::Data(bytes) => assert_eq!(bytes, Bytes::from_static(HEALTH_RESPONSE)),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn flush_writebacks_metadata_returns_flushed_constant() {
        let dir = TempDir::new().unwrap();
        let sf = front(&dir);
        let endpoint = Endpoint::remote("s:1");
        match sf.get(&endpoint, FLUSH_WRITEBACKS_METADATA, &BlockPackdata::None).unwrap() {
            GetOutcome::Data(bytes) => assert_eq!(bytes, Bytes::from_static(FLUSH_RESPONSE)),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn ordinary_reference_falls_through_to_block_cache() {
        let dir = TempDir::new().unwrap();
        let sf = front(&dir);
        let endpoint = Endpoint::remote("s:1");
        let reference = sf.put(&endpoint, Bytes::from("hello")).unwrap();
        match sf.get(&endpoint, &reference.0, &BlockPackdata::None).unwrap() {
            GetOutcome::Data(bytes) => assert_eq!(bytes, Bytes::from("hello")),
            _ => panic!("expected data"),
        }
    }
}
