//! Incremental manifest reconciliation.
//!
//! The updater owns the current manifest for one source directory. It
//! consumes coalesced filesystem change events, re-chunks only what changed,
//! re-serializes the directories along the changed paths, and publishes the
//! new root with a single pointer swap. Events are advisory: every dirty
//! path is re-stat'ed, so stale or duplicated events converge to the on-disk
//! state.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::chunker::{ChunkConfig, chunk_reader};
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::{ChunkRef, DirEntry, DirNode, FileNode, ManifestStore, Node, NodeKind, SymlinkNode};

/// Filesystem change event, as delivered by a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    /// The watcher lost events (kernel queue overflow); a full rescan is due
    Overflow,
}

/// Tuning for the coalescing window and rescan fallback
#[derive(Debug, Clone, Copy)]
pub struct UpdaterConfig {
    /// Quiet time after the last event before a batch is resolved
    pub coalesce_ms: u64,
    /// Upper bound on how long a batch may keep accumulating
    pub max_window_ms: u64,
    /// Dirty-set size beyond which the updater falls back to a full rescan
    pub dirty_max: usize,
    pub chunk: ChunkConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            coalesce_ms: 100,
            max_window_ms: 1000,
            dirty_max: 100_000,
            chunk: ChunkConfig::default(),
        }
    }
}

/// Shared, atomically swappable pointer to the current manifest root.
///
/// Only the updater publishes; any number of readers capture a root and keep
/// reading a consistent snapshot (refcounts hold the closure alive).
#[derive(Clone)]
pub struct RootHandle {
    inner: Arc<RwLock<ContentHash>>,
}

impl RootHandle {
    #[must_use]
    pub fn new(initial: ContentHash) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Capture the current root
    #[must_use]
    pub fn get(&self) -> ContentHash {
        *self.inner.read().unwrap()
    }

    fn publish(&self, root: ContentHash) {
        *self.inner.write().unwrap() = root;
    }
}

/// Per-directory pending entry changes gathered while resolving a batch:
/// `name -> Some(entry)` to upsert, `name -> None` to remove.
type PendingDirs = HashMap<PathBuf, HashMap<String, Option<DirEntry>>>;

pub struct ManifestUpdater {
    src_dir: PathBuf,
    store: ManifestStore,
    config: UpdaterConfig,
    root: RootHandle,
    /// Relative path (empty for the root) -> node hash of the current tree
    nodes: HashMap<PathBuf, ContentHash>,
}

impl ManifestUpdater {
    /// Build the initial manifest from disk and publish it.
    ///
    /// # Errors
    /// Returns an error if the source directory cannot be scanned
    pub fn new(src_dir: impl Into<PathBuf>, store: ManifestStore, config: UpdaterConfig) -> Result<Self> {
        config.chunk.validate()?;
        let src_dir = src_dir.into();
        let mut nodes = HashMap::new();
        let root_hash = build_subtree(&src_dir, Path::new(""), &store, &config.chunk, &mut nodes)?
            .ok_or_else(|| Error::not_found(format!("source dir {} missing", src_dir.display())))?
            .hash;
        store.incref_closure(&root_hash)?;
        info!("initial manifest {root_hash} for {}", src_dir.display());
        Ok(Self {
            src_dir,
            store,
            config,
            root: RootHandle::new(root_hash),
            nodes,
        })
    }

    /// Handle to the published root pointer
    #[must_use]
    pub fn root_handle(&self) -> RootHandle {
        self.root.clone()
    }

    /// Consume events until the channel closes or `shutdown` is set.
    ///
    /// Batches are resolved when `coalesce_ms` passes without a new event or
    /// a batch has been open for `max_window_ms`.
    pub fn run(&mut self, events: &Receiver<ChangeEvent>, shutdown: &AtomicBool) {
        let mut batch: Vec<ChangeEvent> = Vec::new();
        let mut window_opened: Option<Instant> = None;
        let coalesce = Duration::from_millis(self.config.coalesce_ms);
        let max_window = Duration::from_millis(self.config.max_window_ms);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let timeout = match window_opened {
                None => Duration::from_millis(200),
                Some(opened) => coalesce.min(max_window.saturating_sub(opened.elapsed())),
            };
            match events.recv_timeout(timeout) {
                Ok(event) => {
                    window_opened.get_or_insert_with(Instant::now);
                    batch.push(event);
                    if window_opened.is_some_and(|o| o.elapsed() >= max_window) {
                        self.flush(&mut batch);
                        window_opened = None;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !batch.is_empty() {
                        self.flush(&mut batch);
                    }
                    window_opened = None;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush(&mut batch);
                    break;
                }
            }
        }
    }

    fn flush(&mut self, batch: &mut Vec<ChangeEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        if let Err(err) = self.process_batch(events) {
            warn!("batch resolution failed: {err}");
        }
    }

    /// Resolve one batch of events against the filesystem and publish the
    /// resulting root. Exposed for synchronous use in tests and rescans.
    ///
    /// # Errors
    /// Returns an error if the store rejects writes; individual files that
    /// vanish or fail to chunk are skipped, not fatal
    pub fn process_batch(&mut self, events: Vec<ChangeEvent>) -> Result<()> {
        let mut dirty: BTreeSet<PathBuf> = BTreeSet::new();
        for event in events {
            match event {
                ChangeEvent::Overflow => {
                    warn!("watcher overflow, full rescan");
                    return self.full_rescan();
                }
                ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => {
                    if let Some(rel) = self.relativize(&p) {
                        dirty.insert(rel);
                    }
                }
                ChangeEvent::Renamed { from, to } => {
                    // A rename is a delete at the source and a create at the
                    // destination; re-stat makes the ordering safe.
                    if let Some(rel) = self.relativize(&from) {
                        dirty.insert(rel);
                    }
                    if let Some(rel) = self.relativize(&to) {
                        dirty.insert(rel);
                    }
                }
            }
        }
        if dirty.is_empty() {
            return Ok(());
        }
        if dirty.len() > self.config.dirty_max {
            debug!("dirty set {} exceeds cap, full rescan", dirty.len());
            return self.full_rescan();
        }
        self.resolve(dirty)
    }

    /// Walk the whole source tree, diff nothing, publish the result as one
    /// batch. Used for the initial build, watcher overflow, and oversized
    /// dirty sets.
    ///
    /// # Errors
    /// Returns an error if the walk or store writes fail
    pub fn full_rescan(&mut self) -> Result<()> {
        let mut nodes = HashMap::new();
        let built = build_subtree(
            &self.src_dir,
            Path::new(""),
            &self.store,
            &self.config.chunk,
            &mut nodes,
        )?
        .ok_or_else(|| Error::not_found(format!("source dir {} missing", self.src_dir.display())))?;

        let old_root = self.root.get();
        if built.hash == old_root {
            self.nodes = nodes;
            return Ok(());
        }
        self.store.incref_closure(&built.hash)?;
        self.root.publish(built.hash);
        self.store.decref_closure(&old_root)?;
        self.nodes = nodes;
        info!("rescan published {}", built.hash);
        Ok(())
    }

    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.src_dir).ok().map(Path::to_path_buf)
    }

    /// Resolve a dirty set bottom-up: apply per-path changes, then rebuild
    /// every affected directory from the deepest up to the root.
    fn resolve(&mut self, dirty: BTreeSet<PathBuf>) -> Result<()> {
        let mut pending: PendingDirs = HashMap::new();

        for rel in &dirty {
            if rel.as_os_str().is_empty() {
                continue;
            }
            // Skip paths whose dirty ancestor will rebuild them anyway.
            if rel
                .ancestors()
                .skip(1)
                .any(|a| !a.as_os_str().is_empty() && dirty.contains(a))
            {
                continue;
            }
            if let Err(err) = self.apply_path(rel, &mut pending) {
                warn!("skipping {}: {err}", rel.display());
            }
        }

        if pending.is_empty() {
            return Ok(());
        }
        self.rebuild_dirs(pending)
    }

    /// Re-stat one path and record the entry change for its parent.
    fn apply_path(&mut self, rel: &Path, pending: &mut PendingDirs) -> Result<()> {
        let abs = self.src_dir.join(rel);
        let parent = rel.parent().unwrap_or(Path::new("")).to_path_buf();
        let name = rel
            .file_name()
            .ok_or_else(|| Error::invalid_argument("dirty path without a file name"))?
            .to_string_lossy()
            .into_owned();

        let old_hash = self.nodes.get(rel).copied();
        match std::fs::symlink_metadata(&abs) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if old_hash.is_some() {
                    self.drop_subtree(rel)?;
                    pending.entry(parent).or_default().insert(name, None);
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
            Ok(meta) => {
                let entry = if meta.is_dir() {
                    // A directory appearing (or moving in) is rebuilt whole:
                    // its contents may never get events of their own.
                    let mut nodes = HashMap::new();
                    let built = build_subtree(&self.src_dir, rel, &self.store, &self.config.chunk, &mut nodes)?
                        .ok_or_else(|| Error::not_found("directory vanished mid-scan"))?;
                    self.store.incref_closure(&built.hash)?;
                    if old_hash.is_some() {
                        self.drop_subtree(rel)?;
                    }
                    self.nodes.extend(nodes);
                    built.entry(NodeKind::Dir, 0, mode_bits(&meta), mtime_secs(&meta))
                } else {
                    let entry = build_leaf(&abs, &name, &meta, &self.store, &self.config.chunk)?;
                    self.store.incref_closure(&entry.hash)?;
                    if old_hash.is_some() {
                        self.drop_subtree(rel)?;
                    }
                    self.nodes.insert(rel.to_path_buf(), entry.hash);
                    entry
                };
                pending
                    .entry(parent)
                    .or_default()
                    .insert(entry.name.clone(), Some(entry));
                Ok(())
            }
        }
    }

    /// Remove a subtree from the path map and release its references
    fn drop_subtree(&mut self, rel: &Path) -> Result<()> {
        let Some(hash) = self.nodes.remove(rel) else {
            return Ok(());
        };
        self.nodes.retain(|p, _| !p.starts_with(rel) || p == rel);
        self.store.decref_closure(&hash)
    }

    /// Rebuild the changed directories deepest-first, then publish the root
    fn rebuild_dirs(&mut self, mut pending: PendingDirs) -> Result<()> {
        let old_root = self.root.get();
        loop {
            let Some(dir_rel) = pending
                .keys()
                .max_by_key(|p| p.components().count())
                .cloned()
            else {
                break;
            };
            let changes = pending.remove(&dir_rel).unwrap();

            let old_hash = self.nodes.get(&dir_rel).copied();
            let mut dir = match old_hash {
                Some(hash) => match self.store.get_node(&hash)? {
                    Node::Dir(dir) => dir,
                    _ => DirNode::empty(0o755),
                },
                None => DirNode::empty(dir_mode(&self.src_dir.join(&dir_rel))),
            };
            for (name, change) in changes {
                match change {
                    Some(entry) => {
                        dir.upsert(entry);
                    }
                    None => {
                        dir.remove(&name);
                    }
                }
            }

            let node = Node::Dir(dir);
            let new_hash = self.store.put_node(&node)?;
            if Some(new_hash) == old_hash {
                continue;
            }
            self.store.cas().incref(&new_hash)?;
            self.nodes.insert(dir_rel.clone(), new_hash);

            if dir_rel.as_os_str().is_empty() {
                // Root: swap the published pointer, then release the old pin.
                self.root.publish(new_hash);
                if let Some(old) = old_hash {
                    self.store.cas().decref(&old)?;
                }
            } else {
                if let Some(old) = old_hash {
                    self.store.cas().decref(&old)?;
                }
                let abs = self.src_dir.join(&dir_rel);
                let parent = dir_rel.parent().unwrap_or(Path::new("")).to_path_buf();
                let name = dir_rel.file_name().unwrap().to_string_lossy().into_owned();
                let meta = std::fs::symlink_metadata(&abs).ok();
                let entry = DirEntry {
                    name: name.clone(),
                    kind: NodeKind::Dir,
                    hash: new_hash,
                    size: 0,
                    mode: meta.as_ref().map_or(0o755, mode_bits),
                    mtime: meta.as_ref().map_or(0, mtime_secs),
                };
                pending.entry(parent).or_default().insert(name, Some(entry));
            }
        }

        let new_root = self.root.get();
        if new_root != old_root {
            debug!("published {new_root}");
        }
        Ok(())
    }
}

/// Entry metadata for a freshly built node
struct Built {
    name: String,
    hash: ContentHash,
}

impl Built {
    fn entry(&self, kind: NodeKind, size: u64, mode: u32, mtime: i64) -> DirEntry {
        DirEntry {
            name: self.name.clone(),
            kind,
            hash: self.hash,
            size,
            mode,
            mtime,
        }
    }
}

/// Build a file or symlink node from disk, storing chunks as a side effect.
/// Does not take references; callers incref the closure.
fn build_leaf(
    abs: &Path,
    name: &str,
    meta: &std::fs::Metadata,
    store: &ManifestStore,
    chunk_config: &ChunkConfig,
) -> Result<DirEntry> {
    if meta.is_symlink() {
        let target = std::fs::read_link(abs)?.to_string_lossy().into_owned();
        let node = Node::Symlink(SymlinkNode {
            mode: mode_bits(meta),
            target,
        });
        let hash = store.put_node(&node)?;
        return Ok(DirEntry {
            name: name.to_string(),
            kind: NodeKind::Symlink,
            hash,
            size: 0,
            mode: mode_bits(meta),
            mtime: mtime_secs(meta),
        });
    }

    let file = std::fs::File::open(abs)?;
    let cas = store.cas();
    let chunks = chunk_reader(file, chunk_config, |chunk, bytes| {
        let outcome = cas.put(&chunk.hash, bytes);
        if let Err(err) = &outcome {
            if err.kind() == crate::ErrorKind::ResourceExhausted {
                cas.sweep(u64::from(chunk.length))?;
                cas.put(&chunk.hash, bytes)?;
                return Ok(());
            }
        }
        outcome.map(|_| ())
    })?;

    let size: u64 = chunks.iter().map(|c| u64::from(c.length)).sum();
    let node = Node::File(FileNode {
        mode: mode_bits(meta),
        mtime: mtime_secs(meta),
        size,
        chunks: chunks
            .iter()
            .map(|c| ChunkRef {
                hash: c.hash,
                len: c.length,
            })
            .collect(),
    });
    let hash = store.put_node(&node)?;
    Ok(DirEntry {
        name: name.to_string(),
        kind: NodeKind::File,
        hash,
        size,
        mode: mode_bits(meta),
        mtime: mtime_secs(meta),
    })
}

/// Recursively build the subtree rooted at `src_dir/rel`. Stores every node
/// and chunk (refcounts untouched) and fills `nodes` with path -> hash.
/// Returns `None` when the path vanished between listing and stat.
fn build_subtree(
    src_dir: &Path,
    rel: &Path,
    store: &ManifestStore,
    chunk_config: &ChunkConfig,
    nodes: &mut HashMap<PathBuf, ContentHash>,
) -> Result<Option<Built>> {
    let abs = src_dir.join(rel);
    let meta = match std::fs::symlink_metadata(&abs) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let name = rel
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());

    if !meta.is_dir() {
        match build_leaf(&abs, &name, &meta, store, chunk_config) {
            Ok(entry) => {
                nodes.insert(rel.to_path_buf(), entry.hash);
                return Ok(Some(Built {
                    name,
                    hash: entry.hash,
                }));
            }
            Err(err) if err.kind() == crate::ErrorKind::NotFound => {
                warn!("{} vanished while chunking, skipped", abs.display());
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }

    let mut child_names: Vec<std::ffi::OsString> = std::fs::read_dir(&abs)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    child_names.sort();

    let mut dir = DirNode::empty(mode_bits(&meta));
    for child_name in child_names {
        let child_rel = rel.join(&child_name);
        let child_abs = src_dir.join(&child_rel);
        let Ok(child_meta) = std::fs::symlink_metadata(&child_abs) else {
            continue;
        };
        let Some(built) = build_subtree(src_dir, &child_rel, store, chunk_config, nodes)? else {
            continue;
        };
        let entry = if child_meta.is_dir() {
            built.entry(NodeKind::Dir, 0, mode_bits(&child_meta), mtime_secs(&child_meta))
        } else if child_meta.is_symlink() {
            built.entry(NodeKind::Symlink, 0, mode_bits(&child_meta), mtime_secs(&child_meta))
        } else {
            built.entry(
                NodeKind::File,
                child_meta.len(),
                mode_bits(&child_meta),
                mtime_secs(&child_meta),
            )
        };
        dir.upsert(entry);
    }

    let node = Node::Dir(dir);
    let hash = store.put_node(&node)?;
    nodes.insert(rel.to_path_buf(), hash);
    Ok(Some(Built { name, hash }))
}

fn dir_mode(abs: &Path) -> u32 {
    std::fs::symlink_metadata(abs).map_or(0o755, |m| mode_bits(&m))
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::Cas;
    use std::fs;

    fn updater_for(dir: &Path) -> (ManifestUpdater, Arc<Cas>, tempfile::TempDir) {
        let cas_dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(Cas::open(cas_dir.path()).unwrap());
        let store = ManifestStore::new(Arc::clone(&cas));
        let config = UpdaterConfig {
            chunk: ChunkConfig {
                min_size: 64,
                avg_size: 256,
                max_size: 1024,
            },
            ..UpdaterConfig::default()
        };
        (ManifestUpdater::new(dir, store, config).unwrap(), cas, cas_dir)
    }

    /// Root hash of a pristine scan into a throwaway store
    fn reference_root(dir: &Path) -> ContentHash {
        let cas_dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(Cas::open(cas_dir.path()).unwrap());
        let store = ManifestStore::new(cas);
        let config = ChunkConfig {
            min_size: 64,
            avg_size: 256,
            max_size: 1024,
        };
        let mut nodes = HashMap::new();
        build_subtree(dir, Path::new(""), &store, &config, &mut nodes)
            .unwrap()
            .unwrap()
            .hash
    }

    #[test]
    fn test_initial_manifest_matches_reference() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b.txt"), "world").unwrap();

        let (updater, _cas, _cas_dir) = updater_for(src.path());
        assert_eq!(updater.root_handle().get(), reference_root(src.path()));
    }

    #[test]
    fn test_create_modify_converges() {
        let src = tempfile::tempdir().unwrap();
        let (mut updater, _cas, _cas_dir) = updater_for(src.path());

        fs::write(src.path().join("f"), vec![7u8; 10 * 1024]).unwrap();
        updater
            .process_batch(vec![ChangeEvent::Created(src.path().join("f"))])
            .unwrap();
        assert_eq!(updater.root_handle().get(), reference_root(src.path()));

        let mut grown = vec![7u8; 10 * 1024];
        grown.extend_from_slice(&[9u8; 100]);
        fs::write(src.path().join("f"), grown).unwrap();
        updater
            .process_batch(vec![ChangeEvent::Modified(src.path().join("f"))])
            .unwrap();
        assert_eq!(updater.root_handle().get(), reference_root(src.path()));
    }

    #[test]
    fn test_delete_returns_to_empty_and_zeroes_refcounts() {
        let src = tempfile::tempdir().unwrap();
        let (mut updater, cas, _cas_dir) = updater_for(src.path());
        let empty_root = updater.root_handle().get();

        let body = vec![3u8; 10 * 1024];
        fs::write(src.path().join("f"), &body).unwrap();
        updater
            .process_batch(vec![ChangeEvent::Created(src.path().join("f"))])
            .unwrap();

        // Capture the chunk hashes of f's content.
        let root = updater.root_handle().get();
        let store = ManifestStore::new(Arc::clone(&cas));
        let Node::Dir(dir) = store.get_node(&root).unwrap() else {
            panic!("root is not a dir");
        };
        let f_entry = dir.find("f").unwrap().clone();
        let Node::File(file) = store.get_node(&f_entry.hash).unwrap() else {
            panic!("f is not a file");
        };
        let chunk_hashes: Vec<_> = file.distinct_chunks().collect();
        assert!(!chunk_hashes.is_empty());

        fs::remove_file(src.path().join("f")).unwrap();
        updater
            .process_batch(vec![ChangeEvent::Deleted(src.path().join("f"))])
            .unwrap();

        assert_eq!(updater.root_handle().get(), empty_root);
        for hash in chunk_hashes {
            assert_eq!(cas.refcount(&hash), Some(0), "chunk {hash} still pinned");
        }
        assert_eq!(cas.refcount(&f_entry.hash), Some(0));
    }

    #[test]
    fn test_rename_as_replace() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("old"), "payload").unwrap();
        let (mut updater, _cas, _cas_dir) = updater_for(src.path());

        fs::rename(src.path().join("old"), src.path().join("new")).unwrap();
        updater
            .process_batch(vec![ChangeEvent::Renamed {
                from: src.path().join("old"),
                to: src.path().join("new"),
            }])
            .unwrap();
        assert_eq!(updater.root_handle().get(), reference_root(src.path()));
    }

    #[test]
    fn test_directory_move_in_rebuilds_subtree() {
        let src = tempfile::tempdir().unwrap();
        let (mut updater, _cas, _cas_dir) = updater_for(src.path());

        // Simulate `mv` of a populated directory into the watched tree: one
        // Created event for the top, none for the contents.
        let incoming = src.path().join("pkg");
        fs::create_dir_all(incoming.join("nested")).unwrap();
        fs::write(incoming.join("nested/data"), "abc").unwrap();
        updater
            .process_batch(vec![ChangeEvent::Created(incoming.clone())])
            .unwrap();
        assert_eq!(updater.root_handle().get(), reference_root(src.path()));
    }

    #[test]
    fn test_overflow_triggers_rescan() {
        let src = tempfile::tempdir().unwrap();
        let (mut updater, _cas, _cas_dir) = updater_for(src.path());

        fs::write(src.path().join("quiet"), "never announced").unwrap();
        updater.process_batch(vec![ChangeEvent::Overflow]).unwrap();
        assert_eq!(updater.root_handle().get(), reference_root(src.path()));
    }

    #[test]
    fn test_vanished_event_path_is_ignored() {
        let src = tempfile::tempdir().unwrap();
        let (mut updater, _cas, _cas_dir) = updater_for(src.path());
        let before = updater.root_handle().get();

        updater
            .process_batch(vec![ChangeEvent::Created(src.path().join("ghost"))])
            .unwrap();
        assert_eq!(updater.root_handle().get(), before);
    }

    #[test]
    fn test_unchanged_sibling_hash_preserved() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("stable"), "unchanged").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/hot"), "v1").unwrap();
        let (mut updater, cas, _cas_dir) = updater_for(src.path());

        let store = ManifestStore::new(Arc::clone(&cas));
        let root1 = updater.root_handle().get();
        let Node::Dir(dir1) = store.get_node(&root1).unwrap() else {
            panic!()
        };
        let stable1 = dir1.find("stable").unwrap().hash;

        fs::write(src.path().join("sub/hot"), "v2").unwrap();
        updater
            .process_batch(vec![ChangeEvent::Modified(src.path().join("sub/hot"))])
            .unwrap();

        let root2 = updater.root_handle().get();
        assert_ne!(root1, root2);
        let Node::Dir(dir2) = store.get_node(&root2).unwrap() else {
            panic!()
        };
        assert_eq!(dir2.find("stable").unwrap().hash, stable1);
        assert_ne!(dir2.find("sub").unwrap().hash, dir1.find("sub").unwrap().hash);
    }
}
