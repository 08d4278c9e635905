// Upspin cacheserver.
//! On-disk layout and atomic file primitives for the block cache.
//!
//! Given a configured cache directory `D` and user `U` (spec 6):
//!
//! - `D/U/storecache/<hex32>`          -- cached block files
//! - `D/U/storewritebackqueue/<hex32>` -- writeback markers

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::endpoint::Location;
use crate::errors::{Error, Result};

/// Prefix for temporary files written before an atomic rename, so a crash
/// mid-write never leaves a partial file at the final path.
pub const TMP_PREFIX: &str = ".tmp-";

/// Derive the on-disk file name for a block cache entry from its key.
///
/// Spec 3: "a path ... derived from a stable hash of `(endpoint, reference)`".
pub fn block_file_name(location: &Location) -> String {
    let mut hasher = Sha256::new();
    hasher.update(location.cache_key().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn block_path(storecache_dir: &Path, location: &Location) -> PathBuf {
    storecache_dir.join(block_file_name(location))
}

/// Write `content` to `path` atomically: write to a sibling temp file, then
/// rename into place. The rename is atomic on POSIX filesystems within the
/// same directory.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().expect("block path has a parent");
    fs::create_dir_all(dir).map_err(|source| Error::WriteCacheFile {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp_name = format!(
        "{TMP_PREFIX}{}-{}",
        path.file_name().unwrap().to_string_lossy(),
        std::process::id()
    );
    let tmp_path = dir.join(tmp_name);
    {
        let mut f = fs::File::create(&tmp_path).map_err(|source| Error::WriteCacheFile {
            path: tmp_path.clone(),
            source,
        })?;
        f.write_all(content).map_err(|source| Error::WriteCacheFile {
            path: tmp_path.clone(),
            source,
        })?;
        f.sync_all().map_err(|source| Error::WriteCacheFile {
            path: tmp_path.clone(),
            source,
        })?;
    }
    fs::rename(&tmp_path, path).map_err(|source| Error::WriteCacheFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::ReadCacheFile {
        path: path.to_path_buf(),
        source,
    })
}

/// True if `name` under a cache directory is one of our own temp files,
/// and so should never be treated as block content or enumerated.
pub fn is_tmp_file(name: &str) -> bool {
    name.starts_with(TMP_PREFIX)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::endpoint::Endpoint;
    use tempfile::TempDir;

    #[test]
    fn block_file_name_is_stable_and_distinct() {
        let a = Location::new(Endpoint::remote("s:1"), "ref-a");
        let b = Location::new(Endpoint::remote("s:1"), "ref-b");
        assert_eq!(block_file_name(&a), block_file_name(&a));
        assert_ne!(block_file_name(&a), block_file_name(&b));
        assert_eq!(block_file_name(&a).len(), 64);
    }

    #[test]
    fn write_atomic_leaves_no_temp_file_on_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(read_file(&path).unwrap(), b"hello");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| is_tmp_file(n))
            .collect();
        assert!(leftovers.is_empty());
    }
}
