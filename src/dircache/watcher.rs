// Upspin cacheserver.
//! Watch multiplexing (spec 4.3, spec 5): at most one upstream watcher per
//! `(endpoint, subtree-root)`, fanned out to every local subscriber. The
//! upstream watcher is torn down only when the last local subscriber for
//! that subtree goes away (spec 5 "Cancellation").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};

use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::path::PathName;
use crate::upstream::UpstreamDirectory;

pub use crate::upstream::Event;

use super::DirCache;

struct Subscriber {
    id: u64,
    sender: Sender<Event>,
}

struct SubtreeWatch {
    subscribers: Mutex<Vec<Subscriber>>,
    stop: Sender<()>,
}

struct MultiplexerInner {
    subtrees: Mutex<HashMap<(Endpoint, PathName), Arc<SubtreeWatch>>>,
    next_id: AtomicU64,
}

impl MultiplexerInner {
    fn unsubscribe(&self, key: &(Endpoint, PathName), id: u64) {
        let mut subtrees = self.subtrees.lock().expect("lock watcher subtrees");
        let now_empty = match subtrees.get(key) {
            Some(watch) => {
                let mut subs = watch.subscribers.lock().expect("lock subtree subscribers");
                subs.retain(|s| s.id != id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(watch) = subtrees.remove(key) {
                let _ = watch.stop.send(());
            }
        }
    }
}

/// One subscription a caller holds on a directory subtree's events.
/// Dropping it promptly detaches the subscriber (spec 5).
pub struct Subscription {
    pub events: Receiver<Event>,
    multiplexer: Arc<MultiplexerInner>,
    key: (Endpoint, PathName),
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.multiplexer.unsubscribe(&self.key, self.id);
    }
}

/// Owns the set of live upstream watchers and fans their events out to
/// every local subscriber of the same subtree.
pub struct WatcherMultiplexer {
    inner: Arc<MultiplexerInner>,
}

impl WatcherMultiplexer {
    pub fn new() -> WatcherMultiplexer {
        WatcherMultiplexer {
            inner: Arc::new(MultiplexerInner { subtrees: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }),
        }
    }

    pub fn subscribe(
        &self,
        cache: Arc<DirCache>,
        upstream: Arc<dyn UpstreamDirectory>,
        endpoint: Endpoint,
        name: PathName,
        since_sequence: u64,
    ) -> Result<Subscription> {
        let key = (endpoint.clone(), name.clone());
        let mut subtrees = self.inner.subtrees.lock().expect("lock watcher subtrees");
        let watch = match subtrees.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                let dir_server = upstream.dir_server(&endpoint)?;
                let handle = dir_server.watch(&name, since_sequence)?;
                let (stop_tx, stop_rx) = unbounded();
                let watch = Arc::new(SubtreeWatch { subscribers: Mutex::new(Vec::new()), stop: stop_tx });
                subtrees.insert(key.clone(), watch.clone());
                spawn_pump(cache, endpoint.clone(), handle, watch.clone(), stop_rx);
                watch
            }
        };
        drop(subtrees);
        let id = self.inner.next_id.fetch_add(1, Relaxed);
        let (tx, rx) = unbounded();
        watch.subscribers.lock().expect("lock subtree subscribers").push(Subscriber { id, sender: tx });
        Ok(Subscription { events: rx, multiplexer: self.inner.clone(), key, id })
    }
}

impl Default for WatcherMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_pump(
    cache: Arc<DirCache>,
    endpoint: Endpoint,
    handle: Box<dyn crate::upstream::WatchHandle>,
    watch: Arc<SubtreeWatch>,
    stop_rx: Receiver<()>,
) {
    std::thread::Builder::new()
        .name("dircache-watch-pump".to_string())
        .spawn(move || loop {
            let mut select = Select::new();
            let event_idx = select.recv(handle.events());
            let stop_idx = select.recv(&stop_rx);
            let oper = select.select();
            let stop = match oper.index() {
                i if i == event_idx => match oper.recv(handle.events()) {
                    Ok(event) => {
                        cache.apply_event(&endpoint, &event);
                        let subs = watch.subscribers.lock().expect("lock subtree subscribers");
                        for subscriber in subs.iter() {
                            let _ = subscriber.sender.send(event.clone());
                        }
                        false
                    }
                    Err(_) => true, // upstream closed the stream
                },
                i if i == stop_idx => {
                    let _ = oper.recv(&stop_rx);
                    true
                }
                _ => unreachable!(),
            };
            if stop {
                break;
            }
        })
        .expect("spawn watch pump thread");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dirent::DirEntry;
    use crate::errors::Error;
    use crate::upstream::{DirServer, StoreServer, WatchHandle};
    use std::time::Duration;

    struct FixedWatch {
        rx: Receiver<Event>,
    }
    impl WatchHandle for FixedWatch {
        fn events(&self) -> &Receiver<Event> {
            &self.rx
        }
    }

    struct OneShotDir {
        rx: Mutex<Option<Receiver<Event>>>,
    }
    impl DirServer for OneShotDir {
        fn lookup(&self, name: &PathName) -> Result<DirEntry> {
            Err(Error::NotExist { name: name.clone() })
        }
        fn glob(&self, _dir: &PathName) -> Result<Vec<DirEntry>> {
            Ok(vec![])
        }
        fn which_access(&self, _name: &PathName) -> Result<Option<DirEntry>> {
            Ok(None)
        }
        fn put(&self, entry: &DirEntry) -> Result<DirEntry> {
            Ok(entry.clone())
        }
        fn make_directory(&self, name: &PathName) -> Result<DirEntry> {
            Err(Error::NotExist { name: name.clone() })
        }
        fn delete(&self, _name: &PathName) -> Result<()> {
            Ok(())
        }
        fn watch(&self, _name: &PathName, _since: u64) -> Result<Box<dyn WatchHandle>> {
            let rx = self.rx.lock().unwrap().take().expect("watch called once");
            Ok(Box::new(FixedWatch { rx }))
        }
    }

    #[test]
    fn events_fan_out_to_subscriber() {
        let (tx, rx) = unbounded();
        let dir = Arc::new(OneShotDir { rx: Mutex::new(Some(rx)) });
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = DirCache::open(
            tmp.path().join("log"),
            super::super::DEFAULT_MAX_ENTRIES,
            1 << 20,
            Arc::new(PassthroughUpstream(dir.clone())),
            Arc::new(crate::monitor::NullMonitor),
        )
        .unwrap();
        let name = PathName::parse("alice@x/d").unwrap();
        let sub = cache.watch(&Endpoint::remote("s:1"), &name, 0).unwrap();
        let sent = Event { name: name.clone(), entry: None, delete: true, error: None, order: 1 };
        tx.send(sent.clone()).unwrap();
        let got = sub.events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.name, sent.name);
    }

    struct PassthroughUpstream(Arc<OneShotDir>);
    impl UpstreamDirectory for PassthroughUpstream {
        fn dir_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
            Ok(self.0.clone())
        }
        fn store_server(&self, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
            unimplemented!()
        }
    }
}
