//! Manifest model: a Merkle tree of directory, file, and symlink nodes.
//!
//! Each node serializes to a length-prefixed record of fixed-order fields
//! (all integers big-endian); directory entries are sorted by name, so the
//! serialized form, and therefore the node hash, is canonical. A directory
//! stores only the hashes of its children, which makes re-hashing an
//! unchanged subtree O(1).

use std::io::{Cursor, Read};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cas::Cas;
use crate::error::{Error, Result};
use crate::hash::ContentHash;

/// Node kind tag, also used in wire replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

impl NodeKind {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
            Self::Symlink => 3,
        }
    }

    /// # Errors
    /// Returns `Internal` on an unknown tag
    pub fn from_wire(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::File),
            2 => Ok(Self::Dir),
            3 => Ok(Self::Symlink),
            other => Err(Error::internal(format!("unknown node kind {other}"))),
        }
    }
}

/// Reference to one chunk of a file's content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub hash: ContentHash,
    /// Redundant with a CAS lookup, but kept for streaming decisions
    pub len: u32,
}

/// Regular file: ordered chunk list plus POSIX mode bits, mtime, size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub mode: u32,
    pub mtime: i64,
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
}

impl FileNode {
    /// Invariant: chunk lengths must add up to the file size
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.chunks.iter().map(|c| u64::from(c.len)).sum::<u64>() == self.size
    }

    /// Distinct chunk hashes, for reference counting
    pub fn distinct_chunks(&self) -> impl Iterator<Item = ContentHash> + '_ {
        let mut seen = std::collections::HashSet::new();
        self.chunks.iter().filter_map(move |c| seen.insert(c.hash).then_some(c.hash))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    pub mode: u32,
    pub target: String,
}

/// A directory's view of one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub hash: ContentHash,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

/// Directory node: child entries sorted by name, names unique
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirNode {
    pub mode: u32,
    pub entries: Vec<DirEntry>,
}

impl DirNode {
    #[must_use]
    pub fn empty(mode: u32) -> Self {
        Self {
            mode,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Insert or replace the entry with the same name, keeping sort order.
    /// Returns the replaced entry, if any.
    pub fn upsert(&mut self, entry: DirEntry) -> Option<DirEntry> {
        match self
            .entries
            .binary_search_by(|e| e.name.as_str().cmp(&entry.name))
        {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i], entry)),
            Err(i) => {
                self.entries.insert(i, entry);
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| self.entries.remove(i))
    }
}

/// Any manifest node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Dir(DirNode),
    Symlink(SymlinkNode),
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::File(_) => NodeKind::File,
            Self::Dir(_) => NodeKind::Dir,
            Self::Symlink(_) => NodeKind::Symlink,
        }
    }

    /// Canonical serialized form
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.kind().to_wire());
        match self {
            Self::File(file) => {
                buf.extend_from_slice(&file.mode.to_be_bytes());
                buf.extend_from_slice(&file.mtime.to_be_bytes());
                buf.extend_from_slice(&file.size.to_be_bytes());
                buf.extend_from_slice(&(file.chunks.len() as u32).to_be_bytes());
                for chunk in &file.chunks {
                    buf.extend_from_slice(chunk.hash.as_bytes());
                    buf.extend_from_slice(&chunk.len.to_be_bytes());
                }
            }
            Self::Dir(dir) => {
                debug_assert!(dir.entries.is_sorted_by(|a, b| a.name < b.name));
                buf.extend_from_slice(&dir.mode.to_be_bytes());
                buf.extend_from_slice(&(dir.entries.len() as u32).to_be_bytes());
                for entry in &dir.entries {
                    encode_str(&mut buf, &entry.name);
                    buf.push(entry.kind.to_wire());
                    buf.extend_from_slice(entry.hash.as_bytes());
                    buf.extend_from_slice(&entry.size.to_be_bytes());
                    buf.extend_from_slice(&entry.mode.to_be_bytes());
                    buf.extend_from_slice(&entry.mtime.to_be_bytes());
                }
            }
            Self::Symlink(link) => {
                buf.extend_from_slice(&link.mode.to_be_bytes());
                encode_str(&mut buf, &link.target);
            }
        }
        buf
    }

    /// Decode a serialized node
    ///
    /// # Errors
    /// Returns `Internal` on malformed input
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let kind = NodeKind::from_wire(read_u8(&mut cursor)?)?;
        let node = match kind {
            NodeKind::File => {
                let mode = read_u32(&mut cursor)?;
                let mtime = read_i64(&mut cursor)?;
                let size = read_u64(&mut cursor)?;
                let count = read_u32(&mut cursor)? as usize;
                let mut chunks = Vec::with_capacity(count);
                for _ in 0..count {
                    let hash = read_hash(&mut cursor)?;
                    let len = read_u32(&mut cursor)?;
                    chunks.push(ChunkRef { hash, len });
                }
                Self::File(FileNode {
                    mode,
                    mtime,
                    size,
                    chunks,
                })
            }
            NodeKind::Dir => {
                let mode = read_u32(&mut cursor)?;
                let count = read_u32(&mut cursor)? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = read_str(&mut cursor)?;
                    let kind = NodeKind::from_wire(read_u8(&mut cursor)?)?;
                    let hash = read_hash(&mut cursor)?;
                    let size = read_u64(&mut cursor)?;
                    let mode = read_u32(&mut cursor)?;
                    let mtime = read_i64(&mut cursor)?;
                    entries.push(DirEntry {
                        name,
                        kind,
                        hash,
                        size,
                        mode,
                        mtime,
                    });
                }
                Self::Dir(DirNode { mode, entries })
            }
            NodeKind::Symlink => {
                let mode = read_u32(&mut cursor)?;
                let target = read_str(&mut cursor)?;
                Self::Symlink(SymlinkNode { mode, target })
            }
        };
        Ok(node)
    }

    /// Identity of this node: the hash of its canonical serialization
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::from_bytes(&self.encode())
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut b = [0u8; 1];
    cursor.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
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
    let mut len_buf = [0u8; 2];
    cursor.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| Error::internal("non-utf8 string").with_source(e))
}

/// Manifest node storage over the shared CAS.
///
/// Node blobs live next to chunk blobs; reference counts follow parent
/// references, so the closure of a published root stays pinned while any
/// live manifest reaches it.
#[derive(Clone)]
pub struct ManifestStore {
    cas: Arc<Cas>,
}

impl ManifestStore {
    #[must_use]
    pub fn new(cas: Arc<Cas>) -> Self {
        Self { cas }
    }

    #[must_use]
    pub fn cas(&self) -> &Arc<Cas> {
        &self.cas
    }

    /// Serialize and store a node, returning its hash. Idempotent.
    ///
    /// # Errors
    /// Propagates CAS write failures
    pub fn put_node(&self, node: &Node) -> Result<ContentHash> {
        let encoded = node.encode();
        let hash = ContentHash::from_bytes(&encoded);
        crate::error::retry_twice(|| self.cas.put(&hash, &encoded).map(|_| ()))?;
        Ok(hash)
    }

    /// Fetch and decode a node
    ///
    /// # Errors
    /// Returns `NotFound` if the blob is absent
    pub fn get_node(&self, hash: &ContentHash) -> Result<Node> {
        let blob = crate::error::retry_twice(|| self.cas.get(hash))?
            .ok_or_else(|| Error::not_found(format!("no manifest node {hash}")))?;
        Node::decode(&blob)
    }

    /// Take a reference on every node blob and chunk reachable from `root`,
    /// counting one reference per parent link (chunks deduplicated within a
    /// single file version).
    ///
    /// # Errors
    /// Propagates CAS failures; a missing node aborts the walk
    pub fn incref_closure(&self, root: &ContentHash) -> Result<()> {
        self.walk_refs(root, &mut |hash| self.cas.incref(hash).map(|_| ()))
    }

    /// Release the references taken by [`incref_closure`](Self::incref_closure)
    ///
    /// # Errors
    /// Propagates CAS failures
    pub fn decref_closure(&self, root: &ContentHash) -> Result<()> {
        self.walk_refs(root, &mut |hash| self.cas.decref(hash).map(|_| ()))
    }

    fn walk_refs(
        &self,
        hash: &ContentHash,
        apply: &mut impl FnMut(&ContentHash) -> Result<()>,
    ) -> Result<()> {
        let node = self.get_node(hash)?;
        match &node {
            Node::File(file) => {
                for chunk in file.distinct_chunks() {
                    apply(&chunk)?;
                }
            }
            Node::Dir(dir) => {
                for entry in &dir.entries {
                    self.walk_refs(&entry.hash, apply)?;
                }
            }
            Node::Symlink(_) => {}
        }
        apply(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(content_seed: &[u8]) -> FileNode {
        let hash = ContentHash::from_bytes(content_seed);
        FileNode {
            mode: 0o644,
            mtime: 1_700_000_000,
            size: content_seed.len() as u64,
            chunks: vec![ChunkRef {
                hash,
                len: content_seed.len() as u32,
            }],
        }
    }

    #[test]
    fn test_node_roundtrip() {
        let file = Node::File(sample_file(b"hello"));
        assert_eq!(Node::decode(&file.encode()).unwrap(), file);

        let link = Node::Symlink(SymlinkNode {
            mode: 0o777,
            target: "../elsewhere".to_string(),
        });
        assert_eq!(Node::decode(&link.encode()).unwrap(), link);

        let mut dir = DirNode::empty(0o755);
        dir.upsert(DirEntry {
            name: "a.txt".to_string(),
            kind: NodeKind::File,
            hash: file.hash(),
            size: 5,
            mode: 0o644,
            mtime: 1_700_000_000,
        });
        let dir = Node::Dir(dir);
        assert_eq!(Node::decode(&dir.encode()).unwrap(), dir);
    }

    #[test]
    fn test_dir_entries_stay_sorted() {
        let mut dir = DirNode::empty(0o755);
        for name in ["zeta", "alpha", "mid"] {
            dir.upsert(DirEntry {
                name: name.to_string(),
                kind: NodeKind::Dir,
                hash: ContentHash::from_bytes(name.as_bytes()),
                size: 0,
                mode: 0o755,
                mtime: 0,
            });
        }
        let names: Vec<_> = dir.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);

        assert!(dir.find("mid").is_some());
        assert!(dir.remove("mid").is_some());
        assert!(dir.find("mid").is_none());
    }

    #[test]
    fn test_upsert_replaces_same_name() {
        let mut dir = DirNode::empty(0o755);
        let entry = |hash: &[u8]| DirEntry {
            name: "x".to_string(),
            kind: NodeKind::File,
            hash: ContentHash::from_bytes(hash),
            size: 0,
            mode: 0o644,
            mtime: 0,
        };
        assert!(dir.upsert(entry(b"one")).is_none());
        let replaced = dir.upsert(entry(b"two")).unwrap();
        assert_eq!(replaced.hash, ContentHash::from_bytes(b"one"));
        assert_eq!(dir.entries.len(), 1);
    }

    #[test]
    fn test_root_hash_deterministic() {
        let build = || {
            let mut sub = DirNode::empty(0o755);
            sub.upsert(DirEntry {
                name: "b.txt".to_string(),
                kind: NodeKind::File,
                hash: Node::File(sample_file(b"world")).hash(),
                size: 5,
                mode: 0o644,
                mtime: 1_700_000_000,
            });
            let sub = Node::Dir(sub);

            let mut root = DirNode::empty(0o755);
            root.upsert(DirEntry {
                name: "a.txt".to_string(),
                kind: NodeKind::File,
                hash: Node::File(sample_file(b"hello")).hash(),
                size: 5,
                mode: 0o644,
                mtime: 1_700_000_000,
            });
            root.upsert(DirEntry {
                name: "sub".to_string(),
                kind: NodeKind::Dir,
                hash: sub.hash(),
                size: 0,
                mode: 0o755,
                mtime: 1_700_000_000,
            });
            Node::Dir(root).hash()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_leaf_change_propagates_only_along_path() {
        // root { a.txt, sub { b.txt } }: changing b.txt must change sub and
        // the root but leave a.txt's hash alone.
        let a = Node::File(sample_file(b"hello"));
        let make_sub = |content: &[u8]| {
            let b = Node::File(sample_file(content));
            let mut sub = DirNode::empty(0o755);
            sub.upsert(DirEntry {
                name: "b.txt".to_string(),
                kind: NodeKind::File,
                hash: b.hash(),
                size: content.len() as u64,
                mode: 0o644,
                mtime: 1_700_000_000,
            });
            Node::Dir(sub)
        };
        let make_root = |sub: &Node| {
            let mut root = DirNode::empty(0o755);
            root.upsert(DirEntry {
                name: "a.txt".to_string(),
                kind: NodeKind::File,
                hash: a.hash(),
                size: 5,
                mode: 0o644,
                mtime: 1_700_000_000,
            });
            root.upsert(DirEntry {
                name: "sub".to_string(),
                kind: NodeKind::Dir,
                hash: sub.hash(),
                size: 0,
                mode: 0o755,
                mtime: 1_700_000_000,
            });
            Node::Dir(root)
        };

        let sub1 = make_sub(b"world");
        let sub2 = make_sub(b"world!");
        assert_ne!(sub1.hash(), sub2.hash());
        assert_ne!(make_root(&sub1).hash(), make_root(&sub2).hash());
    }

    #[test]
    fn test_store_roundtrip_and_closure_refs() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(Cas::open(dir.path()).unwrap());
        let store = ManifestStore::new(Arc::clone(&cas));

        let content = b"file body";
        let chunk_hash = ContentHash::from_bytes(content);
        cas.put(&chunk_hash, content).unwrap();

        let file = Node::File(FileNode {
            mode: 0o644,
            mtime: 0,
            size: content.len() as u64,
            chunks: vec![ChunkRef {
                hash: chunk_hash,
                len: content.len() as u32,
            }],
        });
        let file_hash = store.put_node(&file).unwrap();

        let mut root = DirNode::empty(0o755);
        root.upsert(DirEntry {
            name: "f".to_string(),
            kind: NodeKind::File,
            hash: file_hash,
            size: content.len() as u64,
            mode: 0o644,
            mtime: 0,
        });
        let root_hash = store.put_node(&Node::Dir(root)).unwrap();

        store.incref_closure(&root_hash).unwrap();
        assert_eq!(cas.refcount(&chunk_hash), Some(1));
        assert_eq!(cas.refcount(&file_hash), Some(1));
        assert_eq!(cas.refcount(&root_hash), Some(1));

        store.decref_closure(&root_hash).unwrap();
        assert_eq!(cas.refcount(&chunk_hash), Some(0));
        assert_eq!(cas.refcount(&file_hash), Some(0));
        assert_eq!(cas.refcount(&root_hash), Some(0));

        assert_eq!(store.get_node(&file_hash).unwrap(), file);
    }
}
