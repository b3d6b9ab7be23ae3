//! Session manager: lifecycle of N concurrent streaming sessions.
//!
//! Each session owns a quartet: watcher thread, updater thread, asset-server
//! pool, and FUSE supervisor thread. The CAS and port bitmap are process-wide
//! and shared. The sessions map is never held across blocking work: a
//! starting session is inserted as a placeholder first, so a racing
//! `StartSession` with the same key fails fast with `AlreadyExists`.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use cdcsync_core::{Cas, ContentHash, Error, ManifestStore, ManifestUpdater, Result, RootHandle, UpdaterConfig};

use crate::config::{SweepConfig, TimeoutConfig};
use crate::ports::{PortManager, PortRange, RemoteProbe};
use crate::server::AssetServer;
use crate::session::{
    Heartbeat, SessionKey, SessionRequest, SessionShared, SessionState, SessionStatus,
};
use crate::supervisor::{
    FuseSupervisor, ProcessFactory, SupervisorConfig, deploy_fuse, quote_posix,
};
use crate::watcher::Watcher;

/// Process-wide manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub port_range: PortRange,
    /// Shared-memory segment name for cross-process port reservation
    pub segment_name: String,
    /// FUSE binary to deploy; `None` assumes the instance already has one
    pub fuse_binary: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange {
                first: 45810,
                last: 45909,
            },
            segment_name: "cdcsync".to_string(),
            fuse_binary: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    root: Option<RootHandle>,
    shutdown: Arc<AtomicBool>,
    watcher: Option<Watcher>,
    updater_thread: Option<JoinHandle<()>>,
    supervisor_thread: Option<JoinHandle<()>>,
    server: Option<AssetServer>,
}

/// Owns the concurrent session map and the shared port manager
pub struct SessionManager {
    cas: Arc<Cas>,
    factory: Arc<dyn ProcessFactory>,
    config: ManagerConfig,
    ports: Mutex<PortManager>,
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
}

impl SessionManager {
    /// # Errors
    /// Returns an error when the port bitmap cannot be created
    pub fn new(
        cas: Arc<Cas>,
        factory: Arc<dyn ProcessFactory>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let ports = PortManager::new(&config.segment_name, config.port_range)?;
        Ok(Self {
            cas,
            factory,
            config,
            ports: Mutex::new(ports),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Start a streaming session. Rejects a second session for the same
    /// `(user_host, mount_dir)`.
    ///
    /// # Errors
    /// `AlreadyExists` for a duplicate key, `ResourceExhausted`/
    /// `DeadlineExceeded` from port reservation, anything the initial scan
    /// or deployment raises
    pub fn start_session(&self, request: &SessionRequest) -> Result<SessionStatus> {
        let key = request.key();

        // Reserve ports before claiming the key so the placeholder is cheap.
        let (local_port, remote_port) = {
            let mut ports = self.ports.lock().unwrap();
            let local = ports.reserve(None)?;
            let probe = RemoteProbe {
                factory: self.factory.as_ref(),
                ssh_cmd: &request.ssh_cmd,
                ip: "127.0.0.1",
                timeout: Duration::from_secs(self.config.timeouts.remote_probe_timeout_secs),
            };
            let remote = match ports.reserve(Some(&probe)) {
                Ok(port) => port,
                Err(err) => {
                    let _ = ports.release(local);
                    return Err(err);
                }
            };
            (local, remote)
        };

        let shared = Arc::new(SessionShared {
            key: key.clone(),
            src_dir: request.src_dir.clone(),
            state: Mutex::new(SessionState::Starting),
            heartbeat: Arc::new(Heartbeat::default()),
            fuse_pid: Mutex::new(None),
            local_port,
            remote_port,
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        // Claim the key with a placeholder; the slow work happens unlocked.
        {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&key) {
                self.release_ports(local_port, remote_port);
                return Err(Error::already_exists(format!("session {key} already exists")));
            }
            sessions.insert(
                key.clone(),
                SessionHandle {
                    shared: Arc::clone(&shared),
                    root: None,
                    shutdown: Arc::clone(&shutdown),
                    watcher: None,
                    updater_thread: None,
                    supervisor_thread: None,
                    server: None,
                },
            );
        }

        match self.build_session(request, &shared, &shutdown) {
            Ok(handle) => {
                let status = shared.status(
                    handle
                        .root
                        .as_ref()
                        .map_or_else(|| ContentHash::from_bytes(b""), RootHandle::get),
                );
                self.sessions.lock().unwrap().insert(key, handle);
                Ok(status)
            }
            Err(err) => {
                // Any quartet members that did come up see the flag and exit.
                shutdown.store(true, Ordering::Relaxed);
                self.sessions.lock().unwrap().remove(&key);
                self.release_ports(local_port, remote_port);
                Err(err)
            }
        }
    }

    /// The slow part of session start: initial manifest, quartet spawn,
    /// deployment, launch.
    fn build_session(
        &self,
        request: &SessionRequest,
        shared: &Arc<SessionShared>,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<SessionHandle> {
        let store = ManifestStore::new(Arc::clone(&self.cas));
        let mut updater =
            ManifestUpdater::new(&request.src_dir, store.clone(), UpdaterConfig::default())?;
        let root = updater.root_handle();

        let (event_tx, event_rx) = mpsc::channel();
        let watcher = Watcher::start(&request.src_dir, event_tx)?;
        let updater_shutdown = Arc::clone(shutdown);
        let updater_thread = std::thread::spawn(move || {
            updater.run(&event_rx, &updater_shutdown);
        });

        let listener = TcpListener::bind(("127.0.0.1", shared.local_port))?;
        let server = AssetServer::start(
            listener,
            store,
            root.clone(),
            Arc::clone(&shared.heartbeat),
        )?;

        let fuse_path = match &self.config.fuse_binary {
            Some(binary) => deploy_fuse(
                self.factory.as_ref(),
                &request.ssh_cmd,
                &request.scp_cmd,
                &request.user_host,
                binary,
                Duration::from_secs(self.config.timeouts.remote_probe_timeout_secs),
            )?,
            None => "cdcsync-fuse".to_string(),
        };

        let mount = quote_posix(&request.mount_dir);
        let launch_cmd = format!(
            "{} -R {}:127.0.0.1:{} {} --mount {} --port {}",
            request.ssh_cmd,
            shared.remote_port,
            shared.local_port,
            fuse_path,
            mount,
            shared.remote_port,
        );
        let unmount_cmd = format!("{} fusermount -u {}", request.ssh_cmd, mount);

        let supervisor = FuseSupervisor {
            factory: Arc::clone(&self.factory),
            launch_cmd,
            unmount_cmd,
            shared: Arc::clone(shared),
            shutdown: Arc::clone(shutdown),
            config: SupervisorConfig {
                start_timeout: self.config.timeouts.start_timeout(),
                stop_timeout: self.config.timeouts.stop_timeout(),
                heartbeat_timeout: self.config.timeouts.heartbeat_timeout(),
                restart_cooldown: self.config.timeouts.restart_cooldown(),
            },
        };
        let supervisor_thread = std::thread::spawn(move || supervisor.run());

        info!(
            "session {} started (local {}, remote {})",
            shared.key, shared.local_port, shared.remote_port
        );
        Ok(SessionHandle {
            shared: Arc::clone(shared),
            root: Some(root),
            shutdown: Arc::clone(shutdown),
            watcher: Some(watcher),
            updater_thread: Some(updater_thread),
            supervisor_thread: Some(supervisor_thread),
            server: Some(server),
        })
    }

    /// Stop a session and purge its state.
    ///
    /// # Errors
    /// `NotFound` when no session matches the key
    pub fn stop_session(&self, key: &SessionKey) -> Result<SessionStatus> {
        let mut handle = self
            .sessions
            .lock()
            .unwrap()
            .remove(key)
            .ok_or_else(|| Error::not_found(format!("no session {key}")))?;

        handle.shared.set_state(SessionState::Stopping);
        handle.shutdown.store(true, Ordering::Relaxed);

        // Dropping the watcher closes the event channel; the updater drains
        // and exits.
        handle.watcher.take();
        if let Some(thread) = handle.supervisor_thread.take() {
            let _ = thread.join();
        }
        if let Some(server) = handle.server.take() {
            server.stop();
        }
        if let Some(thread) = handle.updater_thread.take() {
            let _ = thread.join();
        }

        // Release the last published manifest.
        let last_root = handle.root.as_ref().map(RootHandle::get);
        if let Some(root) = last_root {
            let store = ManifestStore::new(Arc::clone(&self.cas));
            if let Err(err) = store.decref_closure(&root) {
                warn!("releasing manifest {root}: {err}");
            }
        }

        self.release_ports(handle.shared.local_port, handle.shared.remote_port);
        handle.shared.set_state(SessionState::Stopped);
        info!("session {key} stopped");
        Ok(handle
            .shared
            .status(last_root.unwrap_or_else(|| ContentHash::from_bytes(b""))))
    }

    /// Snapshot of every live session
    #[must_use]
    pub fn statuses(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock().unwrap();
        let mut statuses: Vec<SessionStatus> = sessions
            .values()
            .map(|handle| {
                handle.shared.status(
                    handle
                        .root
                        .as_ref()
                        .map_or_else(|| ContentHash::from_bytes(b""), RootHandle::get),
                )
            })
            .collect();
        statuses.sort_by(|a, b| (&a.user_host, &a.mount_dir).cmp(&(&b.user_host, &b.mount_dir)));
        statuses
    }

    /// Stop every session, for daemon shutdown
    pub fn stop_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.lock().unwrap().keys().cloned().collect();
        for key in keys {
            if let Err(err) = self.stop_session(&key) {
                warn!("stopping {key}: {err}");
            }
        }
    }

    #[must_use]
    pub fn cas(&self) -> &Arc<Cas> {
        &self.cas
    }

    /// Repair this process's bits in the shared port bitmap; driven by the
    /// daemon's reconciliation thread.
    pub fn reconcile_ports(&self) {
        if let Err(err) = self.ports.lock().unwrap().reconcile() {
            warn!("port reconciliation: {err}");
        }
    }

    fn release_ports(&self, local: u16, remote: u16) {
        let mut ports = self.ports.lock().unwrap();
        for port in [local, remote] {
            if let Err(err) = ports.release(port) {
                warn!("releasing port {port}: {err}");
            }
        }
    }
}

/// Spawn the process-wide CAS maintenance thread: periodic low-water sweeps.
pub fn spawn_cas_maintenance(
    cas: Arc<Cas>,
    config: SweepConfig,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let interval = Duration::from_secs(config.interval_secs.max(1));
        while !shutdown.load(Ordering::Relaxed) {
            match cas.maintain(config.low_water_bytes, config.target_bytes) {
                Ok(0) => {}
                Ok(freed) => info!("cas sweep freed {freed} bytes"),
                Err(err) => warn!("cas maintenance: {err}"),
            }
            // Sleep in short slices so shutdown stays responsive.
            let deadline = std::time::Instant::now() + interval;
            while std::time::Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    })
}
