// Upspin cacheserver.
//! The wire-level Store/Dir RPC service (spec 6): length-prefixed JSON
//! messages over an already-accepted, already-authenticated connection.
//!
//! The TLS handshake and the authenticated-RPC framing a real deployment
//! wraps this in are out of scope (spec 1); this module starts from a plain
//! `TcpStream` and implements only the message framing and dispatch spec 6
//! names. Every request gets exactly one response, except `DirWatch`, which
//! opens a stream of `WatchEvent` messages that runs until the client sends
//! `WatchCancel`, upstream closes the watch, or the connection drops.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Select};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::dirent::{BlockPackdata, DirEntry};
use crate::dirserver::DirFront;
use crate::endpoint::Endpoint;
use crate::errors::{Error, ErrorKind, Result};
use crate::path::PathName;
use crate::storecache::GetOutcome;
use crate::storeserver::StoreFront;
use crate::upstream::Event;

const MAX_FRAME_BYTES: u32 = 64 << 20;

/// One request frame (spec 6: "length-prefixed binary messages").
///
/// `Configure` binds the connection to an endpoint; every later request on
/// the same connection is served against it, mirroring the real Upspin RPC
/// convention of configuring a client once per endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Configure { endpoint: Endpoint },
    Endpoint,
    Ping,
    StoreGet { reference: String, expected: BlockPackdata },
    StorePut { data: Vec<u8> },
    StoreDelete { reference: String },
    DirLookup { name: PathName },
    DirGlob { pattern: String },
    DirWhichAccess { dir: PathName },
    DirPut { entry: DirEntry },
    DirMakeDirectory { name: PathName },
    DirDelete { name: PathName },
    DirWatch { name: PathName, since_sequence: u64 },
    WatchCancel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Configured,
    Endpoint { endpoint: Option<Endpoint> },
    Pong,
    StoreData { data: Vec<u8> },
    StoreRedirect { locations: Vec<crate::endpoint::Location> },
    StoreRef { reference: String },
    Ack,
    DirEntry { entry: DirEntry },
    DirEntries { entries: Vec<DirEntry> },
    DirWhichAccess { entry: Option<DirEntry> },
    WatchEvent { event: Event },
    WatchClosed,
    Err { kind: ErrorKind, message: String },
}

impl From<Error> for Response {
    fn from(err: Error) -> Response {
        Response::Err { kind: err.kind(), message: err.to_string() }
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum size"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

fn write_frame(writer: &mut impl Write, body: &[u8]) -> io::Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

fn read_request(reader: &mut impl Read) -> Result<Option<Request>> {
    match read_frame(reader)? {
        None => Ok(None),
        Some(body) => Ok(Some(serde_json::from_slice(&body).map_err(|err| {
            Error::Configuration(format!("malformed request frame: {err}"))
        })?)),
    }
}

fn write_response(writer: &mut impl Write, response: &Response) -> Result<()> {
    let body = serde_json::to_vec(response).expect("Response always serializes");
    write_frame(writer, &body).map_err(Error::from)
}

/// Serves Store/Dir RPCs on `addr` until `shutdown` is set, then returns
/// once the listener has stopped accepting new connections.
///
/// Already-open connections are left to finish their in-flight request;
/// full connection draining on shutdown is the caller's job (spec 5).
pub fn serve(addr: &str, store: Arc<StoreFront>, dir: Arc<DirFront>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!(%addr, "cacheserver RPC front listening");
    while !shutdown.load(Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let store = store.clone();
                let dir = dir.clone();
                thread::Builder::new()
                    .name("cacheserver-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &store, &dir) {
                            warn!(?peer, ?err, "connection ended with an error");
                        }
                    })
                    .expect("spawn connection thread");
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(Error::from(err)),
        }
    }
    Ok(())
}

#[instrument(skip(stream, store, dir))]
fn handle_connection(stream: TcpStream, store: &StoreFront, dir: &DirFront) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = stream.try_clone()?;
    let mut writer = stream;
    let mut endpoint: Option<Endpoint> = None;
    loop {
        let request = match read_request(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                let _ = write_response(&mut writer, &err.into());
                return Ok(());
            }
        };
        match request {
            Request::Configure { endpoint: ep } => {
                endpoint = Some(ep);
                write_response(&mut writer, &Response::Configured)?;
            }
            Request::Endpoint => {
                write_response(&mut writer, &Response::Endpoint { endpoint: endpoint.clone() })?;
            }
            Request::Ping => {
                write_response(&mut writer, &Response::Pong)?;
            }
            Request::DirWatch { name, since_sequence } => {
                let endpoint = match require_endpoint(&endpoint) {
                    Ok(ep) => ep,
                    Err(err) => {
                        write_response(&mut writer, &err.into())?;
                        continue;
                    }
                };
                run_watch(dir, &endpoint, &name, since_sequence, &mut reader, &mut writer)?;
            }
            Request::WatchCancel => {
                let err = Error::Configuration("WatchCancel received outside an active watch".to_string());
                write_response(&mut writer, &err.into())?;
            }
            other => {
                let response = dispatch(store, dir, &endpoint, other);
                write_response(&mut writer, &response)?;
            }
        }
    }
}

fn require_endpoint(endpoint: &Option<Endpoint>) -> Result<Endpoint> {
    endpoint.clone().ok_or_else(|| Error::Configuration("Configure must be called before any other RPC".to_string()))
}

fn dispatch(store: &StoreFront, dir: &DirFront, endpoint: &Option<Endpoint>, request: Request) -> Response {
    let outcome = (|| -> Result<Response> {
        let endpoint = require_endpoint(endpoint)?;
        Ok(match request {
            Request::StoreGet { reference, expected } => match store.get(&endpoint, &reference, &expected)? {
                GetOutcome::Data(bytes) => Response::StoreData { data: bytes.to_vec() },
                GetOutcome::Redirect(locations) => Response::StoreRedirect { locations },
            },
            Request::StorePut { data } => {
                let reference = store.put(&endpoint, bytes::Bytes::from(data))?;
                Response::StoreRef { reference: reference.0 }
            }
            Request::StoreDelete { reference } => {
                store.delete(&endpoint, &reference)?;
                Response::Ack
            }
            Request::DirLookup { name } => Response::DirEntry { entry: dir.lookup(&endpoint, &name)? },
            Request::DirGlob { pattern } => Response::DirEntries { entries: dir.glob(&endpoint, &pattern)? },
            Request::DirWhichAccess { dir: d } => Response::DirWhichAccess { entry: dir.which_access(&endpoint, &d)? },
            Request::DirPut { entry } => Response::DirEntry { entry: dir.put(&endpoint, &entry)? },
            Request::DirMakeDirectory { name } => Response::DirEntry { entry: dir.make_directory(&endpoint, &name)? },
            Request::DirDelete { name } => {
                dir.delete(&endpoint, &name)?;
                Response::Ack
            }
            Request::Configure { .. } | Request::Endpoint | Request::Ping | Request::DirWatch { .. } | Request::WatchCancel => {
                unreachable!("handled before dispatch")
            }
        })
    })();
    outcome.unwrap_or_else(Response::from)
}

/// Runs the `DirWatch` sub-protocol: forwards multiplexed events to the
/// client until upstream closes the watch, the client sends `WatchCancel`,
/// or the connection drops. A dedicated reader thread watches for the
/// cancel frame so the main loop can block on events without starving it.
fn run_watch(
    dir: &DirFront,
    endpoint: &Endpoint,
    name: &PathName,
    since_sequence: u64,
    reader: &mut TcpStream,
    writer: &mut TcpStream,
) -> Result<()> {
    let subscription = match dir.watch(endpoint, name, since_sequence) {
        Ok(subscription) => subscription,
        Err(err) => return write_response(writer, &err.into()),
    };
    let (cancel_tx, cancel_rx) = bounded(1);
    let mut cancel_reader = reader.try_clone()?;
    let cancel_thread = thread::Builder::new()
        .name("cacheserver-watch-cancel".to_string())
        .spawn(move || {
            loop {
                match read_request(&mut cancel_reader) {
                    Ok(Some(Request::WatchCancel)) | Ok(None) | Err(_) => {
                        let _ = cancel_tx.send(());
                        return;
                    }
                    Ok(Some(_)) => continue, // protocol violation while watching; ignore
                }
            }
        })
        .expect("spawn watch cancel thread");

    loop {
        let mut select = Select::new();
        let event_idx = select.recv(&subscription.events);
        let cancel_idx = select.recv(&cancel_rx);
        let oper = select.select();
        let done = match oper.index() {
            i if i == event_idx => match oper.recv(&subscription.events) {
                Ok(event) => {
                    write_response(writer, &Response::WatchEvent { event })?;
                    false
                }
                Err(_) => {
                    write_response(writer, &Response::WatchClosed)?;
                    true
                }
            },
            i if i == cancel_idx => {
                let _ = oper.recv(&cancel_rx);
                write_response(writer, &Response::WatchClosed)?;
                true
            }
            _ => unreachable!(),
        };
        if done {
            break;
        }
    }
    drop(subscription);
    let _ = cancel_thread.join();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trips_through_a_byte_buffer() {
        let request = Request::DirLookup { name: PathName::parse("alice@example.com/f").unwrap() };
        let body = serde_json::to_vec(&request).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &body).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_request(&mut cursor).unwrap().unwrap();
        match got {
            Request::DirLookup { name } => assert_eq!(name.to_string(), "alice@example.com/f"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn truncated_stream_reads_as_clean_close() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_request(&mut cursor).is_err());
    }
}
