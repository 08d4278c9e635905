// Upspin cacheserver.
//! Command-line entry point for the Upspin cacheserver daemon.
//!
//! Parses flags, lays out the per-user cache directory, recovers any state
//! left by a prior run, wires the block cache, writeback queue and
//! directory cache together, and serves Store/Dir RPCs until asked to stop
//! (spec 5, spec 6).

use std::process::{ExitCode, Termination};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, trace, warn, Level};

use log::{LogGuard, LoggingOptions};

use upspin_cacheserver::config::{Args, CacheConfig, Layout};
use upspin_cacheserver::dircache::DirCache;
use upspin_cacheserver::dirserver::DirFront;
use upspin_cacheserver::endpoint::Endpoint;
use upspin_cacheserver::errors::{Error, Result};
use upspin_cacheserver::monitor::{CountingMonitor, Monitor};
use upspin_cacheserver::path::PathName;
use upspin_cacheserver::rpc;
use upspin_cacheserver::startup::{migrate_legacy_layout, tag_cache_root, LockGuard};
use upspin_cacheserver::storecache::{BlockCache, WriteMode};
use upspin_cacheserver::storeserver::StoreFront;
use upspin_cacheserver::upstream::{DirServer, StoreServer, UpstreamDirectory, WatchHandle};
use upspin_cacheserver::writeback::WritebackQueue;

mod log;

/// Default local listen address when `-addr` is not given, matching the
/// loopback-only posture spec 1 assumes for the RPC fronts.
const DEFAULT_ADDR: &str = "127.0.0.1:8341";

/// How long shutdown waits for the writeback queue to drain before giving
/// up and exiting anyway (spec 5 "a bounded grace period").
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[repr(u8)]
enum ProcessExitCode {
    Ok = 0,
    Failed = 1,
}

impl Termination for ProcessExitCode {
    fn report(self) -> ExitCode {
        ExitCode::from(self as u8)
    }
}

/// Stands in for the authenticated upstream RPC client: every call fails
/// with `Error::Unavailable`, so the cacheserver runs entirely off its local
/// cache until wired to a real transport. Dialing upstream -- TLS, the
/// authenticated-RPC framing, and the KeyServer lookup that resolves a
/// `user@domain` to its servers -- is out of scope here (spec 1); this is
/// the seam a surrounding Upspin client implementation plugs into.
struct UnresolvedUpstream;

impl DirServer for UnresolvedUpstream {
    fn lookup(&self, name: &PathName) -> Result<upspin_cacheserver::dirent::DirEntry> {
        Err(unavailable(name))
    }
    fn glob(&self, dir: &PathName) -> Result<Vec<upspin_cacheserver::dirent::DirEntry>> {
        Err(unavailable(dir))
    }
    fn which_access(&self, name: &PathName) -> Result<Option<upspin_cacheserver::dirent::DirEntry>> {
        Err(unavailable(name))
    }
    fn put(&self, entry: &upspin_cacheserver::dirent::DirEntry) -> Result<upspin_cacheserver::dirent::DirEntry> {
        Err(unavailable(&entry.name))
    }
    fn make_directory(&self, name: &PathName) -> Result<upspin_cacheserver::dirent::DirEntry> {
        Err(unavailable(name))
    }
    fn delete(&self, name: &PathName) -> Result<()> {
        Err(unavailable(name))
    }
    fn watch(&self, name: &PathName, _since_sequence: u64) -> Result<Box<dyn WatchHandle>> {
        Err(unavailable(name))
    }
}

impl StoreServer for UnresolvedUpstream {
    fn get(&self, reference: &str) -> Result<upspin_cacheserver::upstream::StoreGetOutcome> {
        Err(Error::Unavailable { endpoint: Endpoint::unassigned(), reason: format!("no upstream client configured for {reference}") })
    }
    fn put(&self, _data: bytes::Bytes) -> Result<String> {
        Err(Error::Unavailable { endpoint: Endpoint::unassigned(), reason: "no upstream client configured".to_string() })
    }
    fn delete(&self, reference: &str) -> Result<()> {
        Err(Error::Unavailable { endpoint: Endpoint::unassigned(), reason: format!("no upstream client configured for {reference}") })
    }
}

fn unavailable(name: &PathName) -> Error {
    Error::Unavailable { endpoint: Endpoint::unassigned(), reason: format!("no upstream client configured for {name}") }
}

impl UpstreamDirectory for UnresolvedUpstream {
    fn dir_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
        Ok(Arc::new(UnresolvedUpstream))
    }
    fn store_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
        Ok(Arc::new(UnresolvedUpstream))
    }
}

fn initialize_log(args: &Args) -> std::result::Result<LogGuard, String> {
    let file = args.log_file.clone();

    let level = args.log_level.unwrap_or(if args.debug { Level::TRACE } else { Level::INFO });

    let guard = log::init(LoggingOptions { file, level, terminal_raw: args.log_raw })?;

    trace!("tracing enabled");
    Ok(guard)
}

/// Blocks until `queue` drains, the first permanent failure surfaces, or
/// `grace_period` elapses, whichever comes first.
fn flush_with_grace_period(queue: &Arc<WritebackQueue>, grace_period: Duration) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let queue = queue.clone();
    std::thread::spawn(move || {
        let _ = tx.send(queue.flush());
    });
    match rx.recv_timeout(grace_period) {
        Ok(Ok(())) => info!("writeback queue drained cleanly"),
        Ok(Err(err)) => warn!(?err, "writeback queue flush reported a failure"),
        Err(_) => warn!(?grace_period, "writeback queue did not drain within the shutdown grace period"),
    }
}

#[cfg(unix)]
mod shutdown_signal {
    use super::*;
    use nix::sys::signal::{signal, SigHandler, Signal};

    static REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handle(_signum: i32) {
        REQUESTED.store(true, Relaxed);
    }

    /// Installs SIGINT/SIGTERM handlers and spawns a thread that copies the
    /// signal flag into `shutdown` once observed, so the accept loop (which
    /// only polls a plain `AtomicBool`) notices without itself touching
    /// signal-unsafe state.
    pub fn install(shutdown: Arc<AtomicBool>) {
        unsafe {
            let _ = signal(Signal::SIGINT, SigHandler::Handler(handle));
            let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle));
        }
        std::thread::Builder::new()
            .name("cacheserver-shutdown-watch".to_string())
            .spawn(move || loop {
                if REQUESTED.load(Relaxed) {
                    shutdown.store(true, Relaxed);
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            })
            .expect("spawn shutdown watch thread");
    }
}

#[cfg(not(unix))]
mod shutdown_signal {
    use super::*;

    pub fn install(_shutdown: Arc<AtomicBool>) {}
}

fn run(args: &Args) -> Result<()> {
    let config = CacheConfig::from_args(args)?;
    let user = config.user_name()?;
    let layout = Layout::new(&config.cachedir, &user);
    layout.ensure_dirs()?;
    let _lock = LockGuard::acquire(&layout)?;
    tag_cache_root(&config.cachedir);

    if let Some(legacy_root) = &config.legacy_cachedir {
        migrate_legacy_layout(legacy_root, &layout, config.migrate_copy_fallback)?;
    }

    let upstream: Arc<dyn UpstreamDirectory> = Arc::new(UnresolvedUpstream);
    let monitor: Arc<dyn Monitor> = Arc::new(CountingMonitor::default());
    let mode = if args.writethrough { WriteMode::Writethrough } else { WriteMode::Writeback };

    let block_cache = Arc::new(BlockCache::open(
        layout.storecache_dir(),
        config.block_cache_budget(),
        mode,
        upstream.clone(),
        None,
        monitor.clone(),
    )?);

    let writeback_queue = match mode {
        WriteMode::Writeback => {
            let queue = WritebackQueue::open(
                layout.writeback_queue_dir(),
                layout.writeback_quarantine_dir(),
                upstream.clone(),
                monitor.clone(),
                Some(block_cache.clone() as Arc<dyn upspin_cacheserver::storecache::DirtyTracker>),
            )?;
            block_cache.set_writeback_queue(queue.clone());
            Some(queue)
        }
        WriteMode::Writethrough => None,
    };

    let dir_cache = DirCache::open(
        layout.dircache_log(),
        upspin_cacheserver::dircache::DEFAULT_MAX_ENTRIES,
        config.dircache_log_budget(),
        upstream.clone(),
        monitor,
    )?;
    upspin_cacheserver::dircache::spawn_refresher(dir_cache.clone());

    let store_front = Arc::new(StoreFront::new(block_cache));
    let dir_front = Arc::new(DirFront::new(dir_cache));

    let addr = config.addr.clone().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let shutdown = Arc::new(AtomicBool::new(false));
    shutdown_signal::install(shutdown.clone());

    info!(user = %user, %addr, mode = ?mode, "cacheserver ready");
    rpc::serve(&addr, store_front, dir_front, shutdown)?;

    info!("shutdown requested, draining writeback queue");
    if let Some(queue) = writeback_queue {
        flush_with_grace_period(&queue, SHUTDOWN_GRACE_PERIOD);
    }
    Ok(())
}

fn main() -> ProcessExitCode {
    let args = Args::parse();
    let _log_guard = match initialize_log(&args) {
        Ok(guard) => guard,
        Err(message) => {
            eprintln!("Failed to initialize log system:");
            eprintln!("{message}");
            return ProcessExitCode::Failed;
        }
    };

    match run(&args) {
        Ok(()) => ProcessExitCode::Ok,
        Err(err) => {
            error!("{}", err.to_string());
            ProcessExitCode::Failed
        }
    }
}

#[test]
fn verify_clap() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
