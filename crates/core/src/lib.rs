//! cdcsync-core: Core sync engine
//!
//! Content-defined chunking, the content-addressed store, manifest trees and
//! their incremental updater, the rolling-checksum delta engine, path
//! filters, and the framed message pump.

pub mod cas;
pub mod chunker;
pub mod delta;
pub mod error;
pub mod filter;
pub mod hash;
pub mod manifest;
pub mod pump;
pub mod updater;

pub use cas::{Cas, PutOutcome};
pub use chunker::{Chunk, ChunkConfig, chunk_data, chunk_reader};
pub use error::{Error, ErrorKind, Result, retry_twice};
pub use filter::{FilterRule, PathFilter, RuleAction};
pub use hash::{ContentHash, RollingSum};
pub use manifest::{ChunkRef, DirEntry, DirNode, FileNode, ManifestStore, Node, NodeKind};
pub use pump::{Frame, MessagePump, frame_type};
pub use updater::{ChangeEvent, ManifestUpdater, RootHandle, UpdaterConfig};
