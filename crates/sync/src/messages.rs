//! Wire encoding of the one-shot sync protocol.
//!
//! Frame types come from the shared registry in
//! [`cdcsync_core::frame_type`]; this module owns the payload layouts (all
//! integers big-endian, strings length-prefixed).

use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};

use cdcsync_core::delta::{BlockSignature, STRONG_LEN, Signature};
use cdcsync_core::{ContentHash, Error, FilterRule, Result, RuleAction};

/// Protocol version; both sides must agree
pub const PROTOCOL_VERSION: u32 = 1;

mod flags {
    pub const RECURSIVE: u16 = 1 << 0;
    pub const WHOLE_FILE: u16 = 1 << 1;
    pub const RELATIVE: u16 = 1 << 2;
    pub const COMPRESS: u16 = 1 << 3;
    pub const CHECKSUM: u16 = 1 << 4;
    pub const DRY_RUN: u16 = 1 << 5;
    pub const DELETE: u16 = 1 << 6;
    pub const EXISTING: u16 = 1 << 7;
}

/// Options negotiated in the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub recursive: bool,
    pub whole_file: bool,
    pub relative: bool,
    pub compress: bool,
    pub compress_level: i32,
    pub checksum: bool,
    pub dry_run: bool,
    pub delete: bool,
    pub existing: bool,
    pub copy_dest: Option<String>,
    /// Destination subpath under the server's export root; empty means the
    /// root itself
    pub dest: String,
    pub rules: Vec<FilterRule>,
}

impl SyncOptions {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        let mut bits = 0u16;
        for (flag, set) in [
            (flags::RECURSIVE, self.recursive),
            (flags::WHOLE_FILE, self.whole_file),
            (flags::RELATIVE, self.relative),
            (flags::COMPRESS, self.compress),
            (flags::CHECKSUM, self.checksum),
            (flags::DRY_RUN, self.dry_run),
            (flags::DELETE, self.delete),
            (flags::EXISTING, self.existing),
        ] {
            if set {
                bits |= flag;
            }
        }
        buf.extend_from_slice(&bits.to_be_bytes());
        buf.extend_from_slice(&self.compress_level.to_be_bytes());
        write_str(&mut buf, self.copy_dest.as_deref().unwrap_or(""));
        write_str(&mut buf, &self.dest);
        buf.extend_from_slice(&(self.rules.len() as u32).to_be_bytes());
        for rule in &self.rules {
            buf.push(match rule.action {
                RuleAction::Include => 0,
                RuleAction::Exclude => 1,
            });
            write_str(&mut buf, &rule.pattern);
        }
        buf
    }

    /// # Errors
    /// `Aborted` on a malformed or version-mismatched handshake
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let version = read_u32(&mut cursor)?;
        if version != PROTOCOL_VERSION {
            return Err(Error::failed_precondition(format!(
                "protocol version mismatch: ours {PROTOCOL_VERSION}, theirs {version}"
            )));
        }
        let bits = read_u16(&mut cursor)?;
        let compress_level = read_i32(&mut cursor)?;
        let copy_dest = read_str(&mut cursor)?;
        let dest = read_str(&mut cursor)?;
        let rule_count = read_u32(&mut cursor)? as usize;
        let mut rules = Vec::with_capacity(rule_count);
        for _ in 0..rule_count {
            let action = match read_u8(&mut cursor)? {
                0 => RuleAction::Include,
                _ => RuleAction::Exclude,
            };
            let pattern = read_str(&mut cursor)?;
            rules.push(FilterRule { action, pattern });
        }
        Ok(Self {
            recursive: bits & flags::RECURSIVE != 0,
            whole_file: bits & flags::WHOLE_FILE != 0,
            relative: bits & flags::RELATIVE != 0,
            compress: bits & flags::COMPRESS != 0,
            compress_level,
            checksum: bits & flags::CHECKSUM != 0,
            dry_run: bits & flags::DRY_RUN != 0,
            delete: bits & flags::DELETE != 0,
            existing: bits & flags::EXISTING != 0,
            copy_dest: (!copy_dest.is_empty()).then_some(copy_dest),
            dest,
            rules,
        })
    }
}

/// One file as enumerated by the sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Destination-relative path (always `/`-separated on the wire)
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    /// Whole-file hash, present under `--checksum`
    pub checksum: Option<ContentHash>,
}

impl FileInfo {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_str(&mut buf, &self.path);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.mtime.to_be_bytes());
        buf.extend_from_slice(&self.mode.to_be_bytes());
        match &self.checksum {
            Some(hash) => {
                buf.push(1);
                buf.extend_from_slice(hash.as_bytes());
            }
            None => buf.push(0),
        }
        buf
    }

    /// # Errors
    /// `Aborted` on malformed input
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let path = read_str(&mut cursor)?;
        let size = read_u64(&mut cursor)?;
        let mtime = read_i64(&mut cursor)?;
        let mode = read_u32(&mut cursor)?;
        let checksum = match read_u8(&mut cursor)? {
            0 => None,
            _ => Some(read_hash(&mut cursor)?),
        };
        Ok(Self {
            path,
            size,
            mtime,
            mode,
            checksum,
        })
    }
}

/// One directory as enumerated by the sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    pub path: String,
    pub mode: u32,
}

impl DirInfo {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_str(&mut buf, &self.path);
        buf.extend_from_slice(&self.mode.to_be_bytes());
        buf
    }

    /// # Errors
    /// `Aborted` on malformed input
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let path = read_str(&mut cursor)?;
        let mode = read_u32(&mut cursor)?;
        Ok(Self { path, mode })
    }
}

/// Receiver's partition of the enumerated files
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStats {
    pub missing: u32,
    pub changed: u32,
    pub unchanged: u32,
    pub extraneous: u32,
}

impl FileStats {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for value in [self.missing, self.changed, self.unchanged, self.extraneous] {
            buf.extend_from_slice(&value.to_be_bytes());
        }
        buf
    }

    /// # Errors
    /// `Aborted` on malformed input
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        Ok(Self {
            missing: read_u32(&mut cursor)?,
            changed: read_u32(&mut cursor)?,
            unchanged: read_u32(&mut cursor)?,
            extraneous: read_u32(&mut cursor)?,
        })
    }
}

/// Encode a path list (DeletedPaths)
#[must_use]
pub fn encode_paths(paths: &[String]) -> Vec<u8> {
    let mut buf = (paths.len() as u32).to_be_bytes().to_vec();
    for path in paths {
        write_str(&mut buf, path);
    }
    buf
}

/// # Errors
/// `Aborted` on malformed input
pub fn decode_paths(payload: &[u8]) -> Result<Vec<String>> {
    let mut cursor = Cursor::new(payload);
    let count = read_u32(&mut cursor)? as usize;
    let mut paths = Vec::with_capacity(count);
    for _ in 0..count {
        paths.push(read_str(&mut cursor)?);
    }
    Ok(paths)
}

/// Encode an index list (MissingIndices / ChangedIndices)
#[must_use]
pub fn encode_indices(indices: &[u32]) -> Vec<u8> {
    let mut buf = (indices.len() as u32).to_be_bytes().to_vec();
    for index in indices {
        buf.extend_from_slice(&index.to_be_bytes());
    }
    buf
}

/// # Errors
/// `Aborted` on malformed input
pub fn decode_indices(payload: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = Cursor::new(payload);
    let count = read_u32(&mut cursor)? as usize;
    let mut indices = Vec::with_capacity(count);
    for _ in 0..count {
        indices.push(read_u32(&mut cursor)?);
    }
    Ok(indices)
}

/// Per-file signature frame (receiver -> sender)
#[must_use]
pub fn encode_signature(index: u32, signature: &Signature) -> Vec<u8> {
    let mut buf = index.to_be_bytes().to_vec();
    buf.extend_from_slice(&signature.block_size.to_be_bytes());
    buf.extend_from_slice(&signature.file_size.to_be_bytes());
    buf.extend_from_slice(&(signature.blocks.len() as u32).to_be_bytes());
    for block in &signature.blocks {
        buf.extend_from_slice(&block.weak.to_be_bytes());
        buf.extend_from_slice(&block.strong);
    }
    buf
}

/// # Errors
/// `Aborted` on malformed input
pub fn decode_signature(payload: &[u8]) -> Result<(u32, Signature)> {
    let mut cursor = Cursor::new(payload);
    let index = read_u32(&mut cursor)?;
    let block_size = read_u32(&mut cursor)?;
    let file_size = read_u64(&mut cursor)?;
    let count = read_u32(&mut cursor)? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let weak = read_u32(&mut cursor)?;
        let mut strong = [0u8; STRONG_LEN];
        cursor.read_exact(&mut strong)?;
        blocks.push(BlockSignature { weak, strong });
    }
    Ok((
        index,
        Signature {
            block_size,
            file_size,
            blocks,
        },
    ))
}

/// A batch of delta instructions (sender -> receiver)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    Copy { index: u32 },
    Literal { data: bytes::Bytes },
}

#[must_use]
pub fn encode_ops(ops: &[WireOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    for op in ops {
        match op {
            WireOp::Copy { index } => {
                buf.push(0);
                buf.extend_from_slice(&index.to_be_bytes());
            }
            WireOp::Literal { data } => {
                buf.push(1);
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
            }
        }
    }
    buf
}

/// # Errors
/// `Aborted` on malformed input
pub fn decode_ops(payload: &[u8]) -> Result<Vec<WireOp>> {
    let mut cursor = Cursor::new(payload);
    let mut ops = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        match read_u8(&mut cursor)? {
            0 => ops.push(WireOp::Copy {
                index: read_u32(&mut cursor)?,
            }),
            1 => {
                let len = read_u32(&mut cursor)? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data)?;
                ops.push(WireOp::Literal { data: data.into() });
            }
            other => return Err(Error::aborted(format!("unknown delta op tag {other}"))),
        }
    }
    Ok(ops)
}

/// End-of-file marker closing a FileData or Delta stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndFile {
    /// The sender hit an error and the receiver must discard the file
    pub skipped: bool,
    pub file_hash: ContentHash,
    pub file_size: u64,
}

impl EndFile {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![u8::from(self.skipped)];
        buf.extend_from_slice(self.file_hash.as_bytes());
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf
    }

    /// # Errors
    /// `Aborted` on malformed input
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let skipped = read_u8(&mut cursor)? != 0;
        let file_hash = read_hash(&mut cursor)?;
        let file_size = read_u64(&mut cursor)?;
        Ok(Self {
            skipped,
            file_hash,
            file_size,
        })
    }
}

/// Final accounting, exchanged in both directions at the end of a sync
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub files_total: u64,
    pub files_missing: u64,
    pub files_changed: u64,
    pub files_unchanged: u64,
    pub files_deleted: u64,
    /// Bytes shipped as whole-file data (phase 4)
    pub data_bytes: u64,
    /// Bytes shipped as delta literals (phase 5)
    pub literal_bytes: u64,
    /// Bytes reused from receiver blocks
    pub matched_bytes: u64,
    pub dry_run: bool,
}

impl Summary {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// # Errors
    /// `Aborted` on malformed input
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::aborted("malformed summary").with_source(e))
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut b = [0u8; 1];
    cursor.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut b = [0u8; 2];
    cursor.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b)?;
    Ok(i32::from_be_bytes(b))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b)?;
    Ok(i64::from_be_bytes(b))
}

fn read_hash(cursor: &mut Cursor<&[u8]>) -> Result<ContentHash> {
    let mut b = [0u8; 32];
    cursor.read_exact(&mut b)?;
    Ok(ContentHash::from_raw(b))
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u16(cursor)? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| Error::aborted("non-utf8 string").with_source(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_roundtrip() {
        let options = SyncOptions {
            recursive: true,
            compress: true,
            compress_level: 9,
            delete: true,
            copy_dest: Some("/srv/base".to_string()),
            dest: "drop/zone".to_string(),
            rules: vec![
                FilterRule::include("*.txt"),
                FilterRule::exclude("*.dat"),
            ],
            ..SyncOptions::default()
        };
        assert_eq!(SyncOptions::decode(&options.encode()).unwrap(), options);
    }

    #[test]
    fn test_options_version_check() {
        let mut payload = SyncOptions::default().encode();
        payload[..4].copy_from_slice(&99u32.to_be_bytes());
        assert!(SyncOptions::decode(&payload).is_err());
    }

    #[test]
    fn test_file_info_roundtrip() {
        let info = FileInfo {
            path: "sub/data file.bin".to_string(),
            size: 123_456,
            mtime: 1_700_000_000,
            mode: 0o644,
            checksum: Some(ContentHash::from_bytes(b"contents")),
        };
        assert_eq!(FileInfo::decode(&info.encode()).unwrap(), info);

        let bare = FileInfo {
            checksum: None,
            ..info
        };
        assert_eq!(FileInfo::decode(&bare.encode()).unwrap(), bare);
    }

    #[test]
    fn test_signature_roundtrip() {
        let signature = Signature {
            block_size: 2048,
            file_size: 5000,
            blocks: vec![
                BlockSignature {
                    weak: 0xdead_beef,
                    strong: [7; STRONG_LEN],
                },
                BlockSignature {
                    weak: 1,
                    strong: [9; STRONG_LEN],
                },
            ],
        };
        let (index, decoded) = decode_signature(&encode_signature(3, &signature)).unwrap();
        assert_eq!(index, 3);
        assert_eq!(decoded, signature);
    }

    #[test]
    fn test_ops_roundtrip() {
        let ops = vec![
            WireOp::Copy { index: 7 },
            WireOp::Literal {
                data: bytes::Bytes::from_static(b"raw bytes"),
            },
            WireOp::Copy { index: 8 },
        ];
        assert_eq!(decode_ops(&encode_ops(&ops)).unwrap(), ops);
    }

    #[test]
    fn test_indices_and_paths_roundtrip() {
        let indices = vec![0u32, 5, 42];
        assert_eq!(decode_indices(&encode_indices(&indices)).unwrap(), indices);

        let paths = vec!["gone.txt".to_string(), "old/dir/x".to_string()];
        assert_eq!(decode_paths(&encode_paths(&paths)).unwrap(), paths);
    }

    #[test]
    fn test_summary_roundtrip() {
        let summary = Summary {
            files_total: 10,
            files_missing: 2,
            literal_bytes: 4096,
            dry_run: true,
            ..Summary::default()
        };
        assert_eq!(Summary::decode(&summary.encode()).unwrap(), summary);
    }
}
