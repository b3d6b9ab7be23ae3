//! Session model: one live (user@host, mount-dir) binding.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use cdcsync_core::ContentHash;

/// Identity of a session; at most one session exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_host: String,
    pub mount_dir: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_host, self.mount_dir)
    }
}

/// Lifecycle states. `Stopped` is terminal: all session-scoped state is
/// purged on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Everything needed to start a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub src_dir: PathBuf,
    pub user_host: String,
    pub ssh_port: u16,
    pub mount_dir: String,
    /// Pre-templated remote-execution command prefix (opaque to us)
    pub ssh_cmd: String,
    /// Pre-templated copy command prefix (opaque to us)
    pub scp_cmd: String,
}

impl SessionRequest {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey {
            user_host: self.user_host.clone(),
            mount_dir: self.mount_dir.clone(),
        }
    }
}

/// Point-in-time session snapshot, as reported over the management RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub user_host: String,
    pub mount_dir: String,
    pub src_dir: PathBuf,
    pub state: SessionState,
    pub manifest_root: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub fuse_pid: Option<u32>,
    /// Seconds since the last heartbeat, if one arrived
    pub heartbeat_age_secs: Option<u64>,
}

/// Heartbeat clock shared between the asset server (writer) and the FUSE
/// supervisor (reader).
#[derive(Default)]
pub struct Heartbeat {
    last: Mutex<Option<Instant>>,
}

impl Heartbeat {
    /// Record a heartbeat now
    pub fn beat(&self) {
        *self.last.lock().unwrap() = Some(Instant::now());
    }

    /// Time since the last heartbeat; `None` before the first one
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.last.lock().unwrap().map(|t| t.elapsed())
    }
}

/// State shared between the manager, the asset server, and the supervisor
pub struct SessionShared {
    pub key: SessionKey,
    pub src_dir: PathBuf,
    pub state: Mutex<SessionState>,
    pub heartbeat: std::sync::Arc<Heartbeat>,
    pub fuse_pid: Mutex<Option<u32>>,
    pub local_port: u16,
    pub remote_port: u16,
}

impl SessionShared {
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Build a status snapshot
    #[must_use]
    pub fn status(&self, manifest_root: ContentHash) -> SessionStatus {
        SessionStatus {
            user_host: self.key.user_host.clone(),
            mount_dir: self.key.mount_dir.clone(),
            src_dir: self.src_dir.clone(),
            state: self.state(),
            manifest_root: manifest_root.to_hex(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            fuse_pid: *self.fuse_pid.lock().unwrap(),
            heartbeat_age_secs: self.heartbeat.age().map(|d| d.as_secs()),
        }
    }
}
