// Upspin cacheserver.
//! Flags and configuration file layering (spec 6): a single `Args` struct
//! parsed once by the binary, optionally overlaid on a `CacheConfig` read
//! from `-config=FILE`. Flags always win over file values.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// `-cachesize` default: 5e9 bytes (spec 6).
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 5_000_000_000;

/// Fraction of the byte budget reserved for packed block data; the
/// remainder is reserved for the directory cache's log (spec 4.1).
const BLOCK_BUDGET_NUMERATOR: u64 = 9;
const BLOCK_BUDGET_DENOMINATOR: u64 = 10;

#[derive(Debug, Parser)]
#[command(author, about, version)]
pub struct Args {
    /// Root of the per-user cache directories.
    #[arg(long)]
    pub cachedir: Option<PathBuf>,

    /// Total byte budget for one user's cache (default 5e9).
    #[arg(long)]
    pub cachesize: Option<u64>,

    /// Use the writethrough write policy instead of writeback.
    #[arg(long)]
    pub writethrough: bool,

    /// Local listen address for the Store/Dir RPC fronts.
    #[arg(long)]
    pub addr: Option<String>,

    /// Path to a CacheConfig file (TOML or JSON); flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// The `user@domain` this instance caches for. Required, since the
    /// per-user layout (spec 6) is keyed on it; the KeyServer-backed
    /// resolution of "the current user" a full client performs is out of
    /// scope here.
    #[arg(long)]
    pub user: Option<String>,

    /// A legacy flat cache directory to migrate into the per-user layout on
    /// startup (spec 6, spec 9).
    #[arg(long)]
    pub legacy_cachedir: Option<PathBuf>,

    /// On filesystems that cannot hard-link across the legacy flat layout
    /// and the new per-user layout, copy instead of failing the migration
    /// (spec 9, open question).
    #[arg(long)]
    pub migrate_copy_fallback: bool,

    /// Show debug trace to stdout.
    #[arg(long, short = 'D')]
    pub debug: bool,

    /// Don't show log timestamps and levels for the terminal output.
    #[arg(long, short = 'R')]
    pub log_raw: bool,

    /// Set the log level explicitly.
    #[arg(long, short = 'L')]
    pub log_level: Option<tracing::Level>,

    /// Path to the output log file.
    #[arg(long, short = 'F')]
    pub log_file: Option<PathBuf>,
}

/// Layered configuration for one cacheserver instance, after folding a
/// `-config=FILE` (if given) under the CLI flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cachedir: PathBuf,
    pub cachesize: u64,
    pub writethrough: bool,
    pub addr: Option<String>,
    pub user: Option<String>,
    pub legacy_cachedir: Option<PathBuf>,
    #[serde(default)]
    pub migrate_copy_fallback: bool,
}

impl CacheConfig {
    /// Parse `-config=FILE` (TOML, falling back to JSON) and apply `args`
    /// on top of it. Unset flags keep the file's value; unset everything
    /// falls back to built-in defaults.
    pub fn from_args(args: &Args) -> Result<CacheConfig> {
        let mut base = match &args.config {
            Some(path) => read_config_file(path)?,
            None => CacheConfig {
                cachedir: default_cachedir(),
                cachesize: DEFAULT_CACHE_SIZE_BYTES,
                writethrough: false,
                addr: None,
                user: None,
                legacy_cachedir: None,
                migrate_copy_fallback: false,
            },
        };
        if let Some(cachedir) = &args.cachedir {
            base.cachedir = cachedir.clone();
        }
        if let Some(cachesize) = args.cachesize {
            base.cachesize = cachesize;
        }
        if args.writethrough {
            base.writethrough = true;
        }
        if let Some(addr) = &args.addr {
            base.addr = Some(addr.clone());
        }
        if let Some(user) = &args.user {
            base.user = Some(user.clone());
        }
        if let Some(legacy_cachedir) = &args.legacy_cachedir {
            base.legacy_cachedir = Some(legacy_cachedir.clone());
        }
        if args.migrate_copy_fallback {
            base.migrate_copy_fallback = true;
        }
        Ok(base)
    }

    /// The user this instance caches for.
    pub fn user_name(&self) -> Result<crate::path::UserName> {
        match &self.user {
            Some(user) => Ok(crate::path::UserName::new(user.clone())),
            None => Err(Error::Configuration("no user configured: pass -user=user@domain".to_string())),
        }
    }

    /// Byte budget handed to the block cache: 9/10 of the total (spec 4.1).
    pub fn block_cache_budget(&self) -> u64 {
        self.cachesize * BLOCK_BUDGET_NUMERATOR / BLOCK_BUDGET_DENOMINATOR
    }

    /// Byte budget handed to the directory cache's log before it compacts:
    /// the remaining tenth (spec 4.1).
    pub fn dircache_log_budget(&self) -> u64 {
        self.cachesize - self.block_cache_budget()
    }
}

fn default_cachedir() -> PathBuf {
    dirs_cache_root().join("upspin")
}

#[cfg(unix)]
fn dirs_cache_root() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(not(unix))]
fn dirs_cache_root() -> PathBuf {
    std::env::temp_dir()
}

fn read_config_file(path: &Path) -> Result<CacheConfig> {
    let text = std::fs::read_to_string(path)?;
    if let Ok(config) = toml::from_str::<CacheConfig>(&text) {
        return Ok(config);
    }
    serde_json::from_str::<CacheConfig>(&text)
        .map_err(|err| Error::Configuration(format!("could not parse {path:?} as TOML or JSON: {err}")))
}

/// Filesystem layout rooted at one user's cache directory (spec 6
/// "Filesystem layout"): `D/U/...`.
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(cachedir: &Path, user: &crate::path::UserName) -> Layout {
        Layout { root: cachedir.join(user.dir_name()) }
    }

    pub fn user_root(&self) -> &Path {
        &self.root
    }

    pub fn storecache_dir(&self) -> PathBuf {
        self.root.join("storecache")
    }

    pub fn writeback_queue_dir(&self) -> PathBuf {
        self.root.join("storewritebackqueue")
    }

    pub fn writeback_quarantine_dir(&self) -> PathBuf {
        self.root.join("storewritebackquarantine")
    }

    pub fn dircache_dir(&self) -> PathBuf {
        self.root.join("dircache")
    }

    pub fn dircache_log(&self) -> PathBuf {
        self.dircache_dir().join("log")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Create every directory this layout names.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.storecache_dir())?;
        std::fs::create_dir_all(self.writeback_queue_dir())?;
        std::fs::create_dir_all(self.writeback_quarantine_dir())?;
        std::fs::create_dir_all(self.dircache_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_budget_is_nine_tenths() {
        let config = CacheConfig {
            cachedir: PathBuf::from("/tmp/x"),
            cachesize: 1000,
            writethrough: false,
            addr: None,
            user: None,
            legacy_cachedir: None,
            migrate_copy_fallback: false,
        };
        assert_eq!(config.block_cache_budget(), 900);
        assert_eq!(config.dircache_log_budget(), 100);
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("cache.toml");
        std::fs::write(&config_path, "cachedir = \"/from/file\"\ncachesize = 111\nwritethrough = false\n").unwrap();
        let args = Args {
            cachedir: None,
            cachesize: Some(222),
            writethrough: true,
            addr: None,
            config: Some(config_path),
            user: Some("alice@example.com".to_string()),
            legacy_cachedir: None,
            migrate_copy_fallback: false,
            debug: false,
            log_raw: false,
            log_level: None,
            log_file: None,
        };
        let config = CacheConfig::from_args(&args).unwrap();
        assert_eq!(config.cachedir, PathBuf::from("/from/file"));
        assert_eq!(config.cachesize, 222);
        assert!(config.writethrough);
        assert_eq!(config.user_name().unwrap().as_str(), "alice@example.com");
    }

    #[test]
    fn layout_paths_follow_d_u_convention() {
        let user = crate::path::UserName::new("alice@example.com");
        let layout = Layout::new(Path::new("/cache"), &user);
        assert_eq!(layout.storecache_dir(), PathBuf::from("/cache/alice_at_example.com/storecache"));
        assert_eq!(layout.lock_file(), PathBuf::from("/cache/alice_at_example.com/lock"));
    }
}
