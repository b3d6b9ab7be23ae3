//! Asset stream server.
//!
//! Serves manifest lookups and chunk reads to the remote FUSE driver over
//! an SSH-forwarded loopback port. Every operation is stateless and
//! idempotent: a request captures the root pointer at most once, and
//! refcounts keep the blobs of recently replaced manifests readable until
//! the next sweep, so calls racing a manifest swap still succeed.

use std::io::ErrorKind as IoKind;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use cdcsync_core::{
    ContentHash, Error, ErrorKind, ManifestStore, MessagePump, Node, Result, RootHandle,
};

use crate::session::Heartbeat;

/// Frame types of the asset-stream protocol. Requests and replies share a
/// type; failures travel as [`frame_type::ERROR`](cdcsync_core::frame_type).
pub mod asset_frame {
    pub const GET_MANIFEST_ROOT: u16 = 20;
    pub const LOOKUP: u16 = 21;
    pub const READ_DIR: u16 = 22;
    pub const READ_CHUNK: u16 = 23;
    pub const PREFETCH_CHUNKS: u16 = 24;
    pub const HEARTBEAT: u16 = 25;
}

/// Worker pool size
fn pool_size() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()).min(8)
}

/// Running asset-stream server for one session
pub struct AssetServer {
    shutdown: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<TcpStream>>>,
    threads: Vec<JoinHandle<()>>,
    port: u16,
}

impl AssetServer {
    /// Start serving on `listener` with a pool of `min(8, cores)` workers.
    ///
    /// # Errors
    /// Returns an error if the listener cannot be inspected
    pub fn start(
        listener: TcpListener,
        store: ManifestStore,
        root: RootHandle,
        heartbeat: Arc<Heartbeat>,
    ) -> Result<Self> {
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let conns: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel::<TcpStream>();
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::new();
        for _ in 0..pool_size() {
            let rx = Arc::clone(&rx);
            let store = store.clone();
            let root = root.clone();
            let heartbeat = Arc::clone(&heartbeat);
            threads.push(std::thread::spawn(move || {
                worker_loop(&rx, &store, &root, &heartbeat);
            }));
        }
        threads.push(std::thread::spawn({
            let shutdown = Arc::clone(&shutdown);
            let conns = Arc::clone(&conns);
            move || accept_loop(&listener, &tx, &shutdown, &conns)
        }));

        Ok(Self {
            shutdown,
            conns,
            threads,
            port,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, unblock in-flight reads by closing their sockets, and
    /// join the pool.
    pub fn stop(mut self) {
        self.signal_shutdown();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for conn in self.conns.lock().unwrap().drain(..) {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for AssetServer {
    fn drop(&mut self) {
        // A dropped server (e.g. session start failed later on) must not
        // keep its accept loop alive; joining is left to `stop`.
        self.signal_shutdown();
    }
}

fn accept_loop(
    listener: &TcpListener,
    tx: &Sender<TcpStream>,
    shutdown: &AtomicBool,
    conns: &Mutex<Vec<TcpStream>>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("asset connection from {peer}");
                if let Ok(clone) = stream.try_clone() {
                    conns.lock().unwrap().push(clone);
                }
                let _ = stream.set_nonblocking(false);
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == IoKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                warn!("accept failed: {err}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<TcpStream>>,
    store: &ManifestStore,
    root: &RootHandle,
    heartbeat: &Heartbeat,
) {
    loop {
        let stream = match rx.lock().unwrap().recv() {
            Ok(stream) => stream,
            Err(_) => return,
        };
        if let Err(err) = serve_connection(stream, store, root, heartbeat) {
            // Peer hangups are routine; anything else is worth a line.
            if err.kind() != ErrorKind::Aborted && err.kind() != ErrorKind::Unavailable {
                warn!("asset connection error: {err}");
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    store: &ManifestStore,
    root: &RootHandle,
    heartbeat: &Heartbeat,
) -> Result<()> {
    let mut pump = MessagePump::new(stream);
    loop {
        let frame = match pump.recv() {
            Ok(frame) => frame,
            Err(err) if err.kind() == ErrorKind::Aborted => return Ok(()), // EOF
            Err(err) => return Err(err),
        };
        match handle_request(frame.ty, &frame.payload, store, root, heartbeat) {
            Ok(reply) => pump.send(frame.ty, &reply)?,
            Err(err) => pump.send_error(&err)?,
        }
    }
}

fn handle_request(
    ty: u16,
    payload: &[u8],
    store: &ManifestStore,
    root: &RootHandle,
    heartbeat: &Heartbeat,
) -> Result<Vec<u8>> {
    match ty {
        asset_frame::GET_MANIFEST_ROOT => Ok(root.get().as_bytes().to_vec()),

        asset_frame::LOOKUP => {
            let (parent, name) = decode_lookup(payload)?;
            let Node::Dir(dir) = store.get_node(&parent)? else {
                return Err(Error::invalid_argument("lookup parent is not a directory"));
            };
            let entry = dir
                .find(&name)
                .ok_or_else(|| Error::not_found(format!("no entry {name:?}")))?;
            let mut reply = vec![entry.kind.to_wire()];
            reply.extend_from_slice(entry.hash.as_bytes());
            Ok(reply)
        }

        asset_frame::READ_DIR => {
            let hash = decode_hash(payload)?;
            let Node::Dir(dir) = store.get_node(&hash)? else {
                return Err(Error::invalid_argument("read_dir target is not a directory"));
            };
            let mut reply = Vec::new();
            reply.extend_from_slice(&(dir.entries.len() as u32).to_be_bytes());
            for entry in &dir.entries {
                reply.extend_from_slice(&(entry.name.len() as u16).to_be_bytes());
                reply.extend_from_slice(entry.name.as_bytes());
                reply.push(entry.kind.to_wire());
                reply.extend_from_slice(entry.hash.as_bytes());
                reply.extend_from_slice(&entry.size.to_be_bytes());
                reply.extend_from_slice(&entry.mode.to_be_bytes());
                reply.extend_from_slice(&entry.mtime.to_be_bytes());
            }
            Ok(reply)
        }

        asset_frame::READ_CHUNK => {
            let (hash, offset, len) = decode_read_chunk(payload)?;
            let blob = store
                .cas()
                .get(&hash)?
                .ok_or_else(|| Error::not_found(format!("no chunk {hash}")))?;
            // Partial ranges are allowed; clamp to the blob.
            let start = (offset as usize).min(blob.len());
            let end = start.saturating_add(len as usize).min(blob.len());
            Ok(blob[start..end].to_vec())
        }

        asset_frame::PREFETCH_CHUNKS => {
            // Best effort: touching each blob warms its access time and the
            // OS page cache. Missing chunks are not an error here.
            for hash in decode_hash_list(payload)? {
                let _ = store.cas().get(&hash);
            }
            Ok(Vec::new())
        }

        asset_frame::HEARTBEAT => {
            heartbeat.beat();
            Ok(Vec::new())
        }

        other => Err(Error::invalid_argument(format!(
            "unknown asset request type {other}"
        ))),
    }
}

fn decode_hash(payload: &[u8]) -> Result<ContentHash> {
    let raw: [u8; 32] = payload
        .try_into()
        .map_err(|_| Error::invalid_argument("expected a 32-byte hash"))?;
    Ok(ContentHash::from_raw(raw))
}

fn decode_lookup(payload: &[u8]) -> Result<(ContentHash, String)> {
    if payload.len() < 32 {
        return Err(Error::invalid_argument("short lookup request"));
    }
    let hash = decode_hash(&payload[..32])?;
    let name = String::from_utf8(payload[32..].to_vec())
        .map_err(|e| Error::invalid_argument("non-utf8 name").with_source(e))?;
    Ok((hash, name))
}

fn decode_read_chunk(payload: &[u8]) -> Result<(ContentHash, u64, u32)> {
    if payload.len() != 32 + 8 + 4 {
        return Err(Error::invalid_argument("short read_chunk request"));
    }
    let hash = decode_hash(&payload[..32])?;
    let offset = u64::from_be_bytes(payload[32..40].try_into().unwrap());
    let len = u32::from_be_bytes(payload[40..44].try_into().unwrap());
    Ok((hash, offset, len))
}

fn decode_hash_list(payload: &[u8]) -> Result<Vec<ContentHash>> {
    if payload.len() < 4 {
        return Err(Error::invalid_argument("short hash list"));
    }
    let count = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
    if payload.len() != 4 + count * 32 {
        return Err(Error::invalid_argument("hash list length mismatch"));
    }
    Ok(payload[4..]
        .chunks_exact(32)
        .map(|raw| ContentHash::from_raw(raw.try_into().unwrap()))
        .collect())
}

/// Client-side helpers for the asset protocol, used by the remote FUSE and
/// by tests.
pub mod client {
    use super::*;

    pub struct AssetClient {
        pump: MessagePump<TcpStream>,
    }

    impl AssetClient {
        /// Connect to a server's loopback port
        ///
        /// # Errors
        /// Returns `Unavailable` when the connection is refused
        pub fn connect(port: u16) -> Result<Self> {
            let stream = TcpStream::connect(("127.0.0.1", port))?;
            Ok(Self {
                pump: MessagePump::new(stream),
            })
        }

        /// # Errors
        /// Propagates transport errors
        pub fn get_manifest_root(&mut self) -> Result<ContentHash> {
            self.pump.send(asset_frame::GET_MANIFEST_ROOT, &[])?;
            decode_hash(&self.pump.expect(asset_frame::GET_MANIFEST_ROOT)?)
        }

        /// # Errors
        /// `NotFound` when the entry does not exist
        pub fn lookup(&mut self, parent: &ContentHash, name: &str) -> Result<ContentHash> {
            let mut payload = parent.as_bytes().to_vec();
            payload.extend_from_slice(name.as_bytes());
            self.pump.send(asset_frame::LOOKUP, &payload)?;
            let reply = self.pump.expect(asset_frame::LOOKUP)?;
            if reply.len() != 33 {
                return Err(Error::internal("short lookup reply"));
            }
            decode_hash(&reply[1..])
        }

        /// # Errors
        /// Propagates transport errors
        pub fn read_chunk(&mut self, hash: &ContentHash, offset: u64, len: u32) -> Result<Vec<u8>> {
            let mut payload = hash.as_bytes().to_vec();
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(&len.to_be_bytes());
            self.pump.send(asset_frame::READ_CHUNK, &payload)?;
            self.pump.expect(asset_frame::READ_CHUNK)
        }

        /// # Errors
        /// Propagates transport errors
        pub fn prefetch(&mut self, hashes: &[ContentHash]) -> Result<()> {
            let mut payload = (hashes.len() as u32).to_be_bytes().to_vec();
            for hash in hashes {
                payload.extend_from_slice(hash.as_bytes());
            }
            self.pump.send(asset_frame::PREFETCH_CHUNKS, &payload)?;
            self.pump.expect(asset_frame::PREFETCH_CHUNKS).map(|_| ())
        }

        /// # Errors
        /// Propagates transport errors
        pub fn heartbeat(&mut self) -> Result<()> {
            self.pump.send(asset_frame::HEARTBEAT, &[])?;
            self.pump.expect(asset_frame::HEARTBEAT).map(|_| ())
        }
    }
}
