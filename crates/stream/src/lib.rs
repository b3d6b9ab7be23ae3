//! cdcsync-stream: Streaming session manager
//!
//! Watches a source directory, keeps a content-addressed manifest current,
//! and serves it to remote FUSE consumers. Owns session lifecycle, port
//! reservation, and the management RPC endpoint.

pub mod config;
pub mod manager;
pub mod ports;
pub mod rpc;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod watcher;

pub use config::DaemonConfig;
pub use manager::{ManagerConfig, SessionManager, spawn_cas_maintenance};
pub use ports::{PortManager, PortRange, RemoteProbe};
pub use rpc::{MgmtClient, MgmtServer};
pub use server::AssetServer;
pub use session::{SessionKey, SessionRequest, SessionState, SessionStatus};
pub use supervisor::{ProcessFactory, SystemProcessFactory, quote_posix};
pub use watcher::Watcher;
