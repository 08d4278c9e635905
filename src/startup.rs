// Upspin cacheserver.
//! Process startup sequencing that spec.md leaves implicit: taking the
//! exclusive per-user lock, migrating a legacy flat cache layout into the
//! `D/U/...` layout (spec 6), tagging the cache root so backup tools skip
//! it, and a plain liveness probe against an already-running cacheserver.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Layout;
use crate::endpoint::{Endpoint, HEALTH_METADATA};
use crate::errors::{Error, Result};
use crate::storeserver::HEALTH_RESPONSE;
use crate::upstream::UpstreamDirectory;

/// Holds the exclusive lock at `D/U/lock` (spec 6) for as long as it lives.
/// A second cacheserver instance for the same user fails to start rather
/// than corrupting the first instance's on-disk state.
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn acquire(layout: &Layout) -> Result<LockGuard> {
        let path = layout.lock_file();
        let file = File::options().create(true).write(true).open(&path)?;
        platform::try_lock_exclusive(&file).map_err(|_| Error::AlreadyLocked { path: path.clone() })?;
        Ok(LockGuard { _file: file, path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // The fd closing on drop releases the flock automatically; this is
        // only here so the lifetime of the lock is visible at the call site.
        let _ = &self.path;
    }
}

#[cfg(unix)]
mod platform {
    use super::File;
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> std::result::Result<(), ()> {
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| ())
    }
}

#[cfg(not(unix))]
mod platform {
    use super::File;

    pub fn try_lock_exclusive(_file: &File) -> std::result::Result<(), ()> {
        Ok(())
    }
}

/// One-time migration of a legacy flat cache layout (files directly under
/// `D/<hex32>`) into `D/U/storecache/<hex32>`, by hard link only (spec 6,
/// spec 9). Hard-linking, rather than moving, lets an already-running
/// legacy instance keep serving from the old paths until it restarts.
///
/// `copy_fallback` covers filesystems that reject cross-directory hard
/// links (spec 9's open question): when set, a link failure falls back to
/// a copy instead of being skipped.
pub fn migrate_legacy_layout(legacy_root: &Path, layout: &Layout, copy_fallback: bool) -> Result<usize> {
    if !legacy_root.is_dir() {
        return Ok(0);
    }
    layout.ensure_dirs()?;
    let mut migrated = 0;
    for dirent in std::fs::read_dir(legacy_root)? {
        let dirent = match dirent {
            Ok(d) => d,
            Err(err) => {
                warn!(?err, "could not read legacy cache entry, skipping");
                continue;
            }
        };
        let path = dirent.path();
        if !path.is_file() || !is_legacy_block_name(&dirent.file_name().to_string_lossy()) {
            continue;
        }
        let dest = layout.storecache_dir().join(dirent.file_name());
        if dest.exists() {
            continue;
        }
        match std::fs::hard_link(&path, &dest) {
            Ok(()) => migrated += 1,
            Err(err) if copy_fallback => {
                if let Err(copy_err) = std::fs::copy(&path, &dest) {
                    warn!(?path, ?copy_err, "legacy migration copy fallback failed, skipping");
                } else {
                    migrated += 1;
                }
                let _ = err;
            }
            Err(err) => {
                warn!(?path, ?err, "could not hard-link legacy cache file, skipping (non-fatal)");
            }
        }
    }
    if migrated > 0 {
        info!(migrated, "migrated legacy cache entries into per-user layout");
    }
    Ok(migrated)
}

fn is_legacy_block_name(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Writes a `CACHEDIR.TAG` (per the de-facto convention respected by `tar`,
/// rsync and backup tools) at the top of the configured cache directory, so
/// the whole tree is skipped by tools that honor it. Best-effort: failures
/// are logged, never fatal to startup.
pub fn tag_cache_root(cachedir: &Path) {
    match cachedir::ensure_tag(cachedir) {
        Ok(_) => {}
        Err(err) => warn!(?cachedir, ?err, "could not write CACHEDIR.TAG"),
    }
}

/// Pings an already-configured upstream Store endpoint with the
/// `HealthMetadata` synthetic reference (spec 6) and checks the expected
/// constant comes back. Used both by operators and by the supervisor that
/// decides whether to spawn a fresh cacheserver (spec 3).
pub fn health_check(upstream: &dyn UpstreamDirectory, endpoint: &Endpoint) -> Result<bool> {
    use crate::upstream::StoreGetOutcome;
    let store = upstream.store_server(endpoint)?;
    match store.get(HEALTH_METADATA)? {
        StoreGetOutcome::Data(bytes) => Ok(bytes.as_ref() == HEALTH_RESPONSE),
        StoreGetOutcome::Redirect(_) => Ok(false),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::path::UserName;
    use tempfile::TempDir;

    #[test]
    fn second_lock_attempt_fails_while_first_is_held() {
        let dir = TempDir::new().unwrap();
        let user = UserName::new("alice@example.com");
        let layout = Layout::new(dir.path(), &user);
        layout.ensure_dirs().unwrap();
        let _first = LockGuard::acquire(&layout).unwrap();
        let second = LockGuard::acquire(&layout);
        assert!(second.is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let user = UserName::new("alice@example.com");
        let layout = Layout::new(dir.path(), &user);
        layout.ensure_dirs().unwrap();
        {
            let _first = LockGuard::acquire(&layout).unwrap();
        }
        let second = LockGuard::acquire(&layout);
        assert!(second.is_ok());
    }

    #[test]
    fn migration_hard_links_legacy_block_files() {
        let dir = TempDir::new().unwrap();
        let legacy_root = dir.path().join("legacy");
        std::fs::create_dir_all(&legacy_root).unwrap();
        let name = "a".repeat(32);
        std::fs::write(legacy_root.join(&name), b"data").unwrap();
        std::fs::write(legacy_root.join("not-a-block-name.txt"), b"ignored").unwrap();

        let user = UserName::new("alice@example.com");
        let layout = Layout::new(dir.path().join("new"), &user);
        let migrated = migrate_legacy_layout(&legacy_root, &layout, false).unwrap();
        assert_eq!(migrated, 1);
        assert!(layout.storecache_dir().join(&name).exists());
        assert!(!layout.storecache_dir().join("not-a-block-name.txt").exists());
    }

    #[test]
    fn migration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let legacy_root = dir.path().join("legacy");
        std::fs::create_dir_all(&legacy_root).unwrap();
        let name = "b".repeat(32);
        std::fs::write(legacy_root.join(&name), b"data").unwrap();

        let user = UserName::new("alice@example.com");
        let layout = Layout::new(dir.path().join("new"), &user);
        migrate_legacy_layout(&legacy_root, &layout, false).unwrap();
        let migrated_again = migrate_legacy_layout(&legacy_root, &layout, false).unwrap();
        assert_eq!(migrated_again, 0);
    }
}
