// Upspin cacheserver.
//! Shared test scaffolding: a scratch cache directory laid out the way a
//! real instance would find it, deleted when it goes out of scope.

use std::ops::Deref;
use std::path::Path;

use tempfile::TempDir;

use crate::config::Layout;
use crate::path::UserName;

/// A temporary `D/U/...` cache layout (spec 6) for one user, rooted in a
/// fresh temporary directory. Derefs to [`Layout`] so tests can call its
/// path helpers directly.
pub struct ScratchCacheDir {
    _tempdir: TempDir, // held only for cleanup
    layout: Layout,
}

impl ScratchCacheDir {
    pub fn new(user: &str) -> ScratchCacheDir {
        let tempdir = TempDir::new().unwrap();
        let layout = Layout::new(tempdir.path(), &UserName::new(user));
        layout.ensure_dirs().unwrap();
        ScratchCacheDir { _tempdir: tempdir, layout }
    }

    pub fn cachedir(&self) -> &Path {
        self._tempdir.path()
    }
}

impl Deref for ScratchCacheDir {
    type Target = Layout;

    fn deref(&self) -> &Layout {
        &self.layout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scratch_dir_creates_the_full_layout() {
        let scratch = ScratchCacheDir::new("alice@example.com");
        assert!(scratch.storecache_dir().is_dir());
        assert!(scratch.writeback_queue_dir().is_dir());
        assert!(scratch.dircache_dir().is_dir());
    }
}
