//! Management RPC: the local loopback endpoint driving the session manager.
//!
//! Pump-framed, JSON payloads. `GetStatus` can stream periodic snapshots
//! until the client hangs up.

use std::io::ErrorKind as IoKind;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cdcsync_core::{Error, ErrorKind, MessagePump, Result};

use crate::manager::SessionManager;
use crate::session::{SessionKey, SessionRequest, SessionStatus};

/// Frame types of the management protocol
pub mod mgmt_frame {
    pub const START_SESSION: u16 = 40;
    pub const STOP_SESSION: u16 = 41;
    pub const GET_STATUS: u16 = 42;
    pub const STATUS_SNAPSHOT: u16 = 43;
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusQuery {
    /// Keep streaming snapshots until the client disconnects
    follow: bool,
    interval_ms: u64,
}

/// Running management endpoint
pub struct MgmtServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    port: u16,
}

impl MgmtServer {
    /// Serve the management protocol on a loopback listener.
    ///
    /// # Errors
    /// Returns an error if the listener cannot be inspected
    pub fn start(listener: TcpListener, manager: Arc<SessionManager>) -> Result<Self> {
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = std::thread::spawn({
            let shutdown = Arc::clone(&shutdown);
            move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!("management connection from {peer}");
                            let _ = stream.set_nonblocking(false);
                            // One thread per connection: a streaming status
                            // watcher must not block other clients.
                            let manager = Arc::clone(&manager);
                            std::thread::spawn(move || {
                                if let Err(err) = serve_connection(stream, &manager) {
                                    if err.kind() != ErrorKind::Aborted {
                                        warn!("management connection: {err}");
                                    }
                                }
                            });
                        }
                        Err(err) if err.kind() == IoKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Err(err) => {
                            warn!("management accept: {err}");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            }
        });

        Ok(Self {
            shutdown,
            thread: Some(thread),
            port,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_connection(stream: TcpStream, manager: &SessionManager) -> Result<()> {
    let mut pump = MessagePump::new(stream);
    loop {
        let frame = match pump.recv() {
            Ok(frame) => frame,
            Err(err) if err.kind() == ErrorKind::Aborted => return Ok(()),
            Err(err) => return Err(err),
        };
        match frame.ty {
            mgmt_frame::START_SESSION => {
                let reply = decode_json::<SessionRequest>(&frame.payload)
                    .and_then(|request| manager.start_session(&request));
                send_result(&mut pump, mgmt_frame::START_SESSION, reply)?;
            }
            mgmt_frame::STOP_SESSION => {
                let reply = decode_json::<SessionKey>(&frame.payload)
                    .and_then(|key| manager.stop_session(&key));
                send_result(&mut pump, mgmt_frame::STOP_SESSION, reply)?;
            }
            mgmt_frame::GET_STATUS => {
                let query: StatusQuery = decode_json(&frame.payload)?;
                loop {
                    let snapshot = manager.statuses();
                    let payload = serde_json::to_vec(&snapshot)
                        .map_err(|e| Error::internal("status encode").with_source(e))?;
                    if pump.send(mgmt_frame::STATUS_SNAPSHOT, &payload).is_err() {
                        return Ok(());
                    }
                    if !query.follow {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(query.interval_ms.max(100)));
                }
            }
            other => {
                pump.send_error(&Error::invalid_argument(format!(
                    "unknown management request {other}"
                )))?;
            }
        }
    }
}

fn send_result(
    pump: &mut MessagePump<TcpStream>,
    ty: u16,
    result: Result<SessionStatus>,
) -> Result<()> {
    match result {
        Ok(status) => {
            let payload = serde_json::to_vec(&status)
                .map_err(|e| Error::internal("status encode").with_source(e))?;
            pump.send(ty, &payload)
        }
        Err(err) => pump.send_error(&err),
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::invalid_argument("malformed request payload").with_source(e))
}

/// Client side of the management protocol, used by the CLI
pub struct MgmtClient {
    pump: MessagePump<TcpStream>,
}

impl MgmtClient {
    /// Connect to a daemon's loopback management port.
    ///
    /// # Errors
    /// `Unavailable` when no daemon is listening
    pub fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).map_err(|e| {
            Error::unavailable(format!("no manager on port {port}")).with_source(e)
        })?;
        Ok(Self {
            pump: MessagePump::new(stream),
        })
    }

    /// # Errors
    /// Forwards the manager's error (e.g. `AlreadyExists`)
    pub fn start_session(&mut self, request: &SessionRequest) -> Result<SessionStatus> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| Error::internal("request encode").with_source(e))?;
        self.pump.send(mgmt_frame::START_SESSION, &payload)?;
        decode_json(&self.pump.expect(mgmt_frame::START_SESSION)?)
    }

    /// # Errors
    /// Forwards the manager's error (e.g. `NotFound`)
    pub fn stop_session(&mut self, key: &SessionKey) -> Result<SessionStatus> {
        let payload =
            serde_json::to_vec(key).map_err(|e| Error::internal("request encode").with_source(e))?;
        self.pump.send(mgmt_frame::STOP_SESSION, &payload)?;
        decode_json(&self.pump.expect(mgmt_frame::STOP_SESSION)?)
    }

    /// Fetch one status snapshot, or stream them into `visit` until the
    /// server goes away when `follow` is set.
    ///
    /// # Errors
    /// Propagates transport errors
    pub fn status(
        &mut self,
        follow: bool,
        interval: Duration,
        mut visit: impl FnMut(Vec<SessionStatus>),
    ) -> Result<()> {
        let query = StatusQuery {
            follow,
            interval_ms: interval.as_millis() as u64,
        };
        let payload = serde_json::to_vec(&query)
            .map_err(|e| Error::internal("request encode").with_source(e))?;
        self.pump.send(mgmt_frame::GET_STATUS, &payload)?;
        loop {
            match self.pump.expect(mgmt_frame::STATUS_SNAPSHOT) {
                Ok(snapshot) => visit(decode_json(&snapshot)?),
                Err(err) if follow && err.kind() == ErrorKind::Aborted => return Ok(()),
                Err(err) => return Err(err),
            }
            if !follow {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::ports::PortRange;
    use crate::session::SessionState;
    use crate::supervisor::{ChildHandle, CommandOutput, ProcessFactory};
    use cdcsync_core::Cas;

    struct FakeFactory;
    struct FakeChild;

    impl ChildHandle for FakeChild {
        fn try_wait(&mut self) -> Result<Option<i32>> {
            Ok(None)
        }
        fn kill(&mut self) -> Result<()> {
            Ok(())
        }
        fn pid(&self) -> Option<u32> {
            None
        }
    }

    impl ProcessFactory for FakeFactory {
        fn run(&self, _command: &str, _timeout: Duration) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        fn spawn(&self, _command: &str) -> Result<Box<dyn ChildHandle>> {
            Ok(Box::new(FakeChild))
        }
    }

    fn start_endpoint(tag: &str, first_port: u16) -> (MgmtServer, Arc<SessionManager>, tempfile::TempDir) {
        let cas_dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(Cas::open(cas_dir.path()).unwrap());
        let config = ManagerConfig {
            port_range: PortRange {
                first: first_port,
                last: first_port + 9,
            },
            segment_name: format!("cdcsync-rpc-{tag}-{}", std::process::id()),
            fuse_binary: None,
            timeouts: crate::config::TimeoutConfig {
                stop_timeout_secs: 1,
                ..crate::config::TimeoutConfig::default()
            },
        };
        let manager = Arc::new(SessionManager::new(cas, Arc::new(FakeFactory), config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = MgmtServer::start(listener, Arc::clone(&manager)).unwrap();
        (server, manager, cas_dir)
    }

    #[test]
    fn test_start_status_stop_over_rpc() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), "x").unwrap();
        let (server, manager, _cas_dir) = start_endpoint("roundtrip", 49660);

        let mut client = MgmtClient::connect(server.port()).unwrap();
        let request = SessionRequest {
            src_dir: src.path().to_path_buf(),
            user_host: "dev@box".to_string(),
            ssh_port: 22,
            mount_dir: "/mnt/assets".to_string(),
            ssh_cmd: "ssh dev@box".to_string(),
            scp_cmd: "scp".to_string(),
        };
        let started = client.start_session(&request).unwrap();
        assert_eq!(started.state, SessionState::Starting);

        // Duplicate start surfaces the manager's AlreadyExists over the wire.
        let mut second = MgmtClient::connect(server.port()).unwrap();
        let err = second.start_session(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let mut seen = Vec::new();
        second
            .status(false, Duration::from_millis(100), |s| seen = s)
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].mount_dir, "/mnt/assets");

        let stopped = second
            .stop_session(&SessionKey {
                user_host: "dev@box".to_string(),
                mount_dir: "/mnt/assets".to_string(),
            })
            .unwrap();
        assert_eq!(stopped.state, SessionState::Stopped);

        server.stop();
        manager.stop_all();
    }
}
