// Upspin cacheserver.
//! The packer contract.
//!
//! Packer implementations (plain, integrity-only, end-to-end encrypted) are
//! out of scope for this repository (spec 1); the cache invokes them only
//! through this trait, treating packed bytes and signatures as opaque.

use bytes::Bytes;

use crate::dirent::DirEntry;
use crate::errors::Result;

/// External collaborator: converts cleartext to a packed, signed byte
/// stream and back, and computes worst-case buffer sizes.
///
/// The cacheserver core never implements a packer; it is handed one
/// (already configured with the relevant user's keys) by its caller.
pub trait Packer: Send + Sync {
    /// Pack `cleartext` for `entry`, returning the bytes to store in a
    /// block and populating `entry.packdata` with the whole-entry
    /// signature material.
    fn pack(&self, entry: &mut DirEntry, cleartext: &[u8]) -> Result<Bytes>;

    /// Unpack and verify `ciphertext` against `entry`, returning cleartext.
    ///
    /// A signature mismatch is a caller bug or a tampered upstream; the
    /// packer reports it as an error, it is never silently ignored.
    fn unpack(&self, entry: &DirEntry, ciphertext: &[u8]) -> Result<Bytes>;

    /// Upper bound on packed length for `cleartext_len` bytes of input.
    fn pack_len(&self, cleartext_len: u64) -> u64;

    /// Upper bound on unpacked length for `packed_len` bytes of input.
    fn unpack_len(&self, packed_len: u64) -> u64;
}
