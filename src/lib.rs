// Upspin cacheserver.
//! A client-side cache for the Upspin global file namespace: a local
//! process that sits between an Upspin client and its configured Dir/Store
//! endpoints, interposing a content-addressed block cache, a directory
//! metadata cache, and a durable writeback queue.
//!
//! The five components (block cache, writeback queue, directory cache,
//! Store RPC front, Dir RPC front) are plain library types; [`rpc`] wires
//! them to a length-prefixed wire protocol over a plain socket. Dialing a
//! real upstream -- TLS, authenticated RPC framing, KeyServer lookup -- is
//! the `cacheserver` binary's job (`src/bin/cacheserver`), kept out of this
//! crate so the caching policy itself can be exercised without any
//! networking.

pub mod config;
pub mod dircache;
pub mod dirent;
pub mod dirserver;
pub mod endpoint;
pub mod errors;
pub mod monitor;
pub mod packer;
pub mod path;
pub mod rpc;
pub mod startup;
pub mod storecache;
pub mod storeserver;
pub mod upstream;
pub mod writeback;

#[cfg(test)]
pub mod test_fixtures;

pub use errors::{Error, ErrorKind, Result};
