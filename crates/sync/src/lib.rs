//! cdcsync-sync: One-shot directory synchronization
//!
//! The classic signature/delta/patch protocol over the framed message pump:
//! client walks and sends, server diffs and reconstructs.

pub mod client;
pub mod messages;
pub mod server;

pub use client::{SyncClient, SyncReport};
pub use messages::{FileStats, Summary, SyncOptions};
pub use server::SyncServer;

/// Small filesystem helpers shared by both halves
pub(crate) mod util {
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use cdcsync_core::Result;

    #[cfg(unix)]
    pub fn mode_bits(meta: &std::fs::Metadata) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }

    #[cfg(not(unix))]
    pub fn mode_bits(meta: &std::fs::Metadata) -> u32 {
        if meta.permissions().readonly() { 0o444 } else { 0o644 }
    }

    pub fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64)
    }

    /// Wire form of a relative path: forward slashes, lossy UTF-8
    pub fn wire_path(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// Set mode bits and, when given, the modification time
    pub fn apply_metadata(path: &Path, mode: u32, mtime: Option<i64>) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        if let Some(secs) = mtime {
            let when = SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64);
            let file = std::fs::File::options().write(true).open(path)?;
            file.set_modified(when)?;
        }
        Ok(())
    }
}
