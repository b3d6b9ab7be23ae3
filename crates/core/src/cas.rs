//! Content-addressed chunk store.
//!
//! Blobs live under `<root>/<xx>/<hex>` where `xx` is the first hash byte,
//! so no directory ever holds more than 1/256th of the store. Writes go
//! through a temp file and rename, which makes `put` idempotent and safe
//! from multiple writers. Refcount changes are journaled to a sidecar so a
//! crash never loses track of which blobs a live manifest still needs.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::ContentHash;

const JOURNAL_FILE: &str = "journal.log";
const TMP_DIR: &str = "tmp";

/// Outcome of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Exists,
}

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    len: u64,
    refcount: u32,
    last_access: u64,
}

/// One journal record. `Put` introduces an entry at refcount 0; `Ref` and
/// `Unref` adjust it. On open the journal is replayed and compacted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine {
    Put { hash: String, len: u64 },
    Ref { hash: String },
    Unref { hash: String },
}

struct Shard {
    entries: HashMap<ContentHash, EntryMeta>,
}

/// Process-wide content-addressed store, shared across sessions.
pub struct Cas {
    root: PathBuf,
    shards: Vec<Mutex<Shard>>,
    journal: Mutex<BufWriter<File>>,
    access_clock: AtomicU64,
    /// Hashes the journal claims are live but whose blobs are gone.
    invalid: Mutex<Vec<ContentHash>>,
}

impl Cas {
    /// Open or create a store at `root`, replaying the refcount journal and
    /// reconciling it against the blobs actually on disk.
    ///
    /// # Errors
    /// Returns an error if the directory layout cannot be created or the
    /// journal cannot be read
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR))?;

        let mut replayed: HashMap<ContentHash, EntryMeta> = HashMap::new();
        let journal_path = root.join(JOURNAL_FILE);
        if journal_path.exists() {
            let reader = BufReader::new(File::open(&journal_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<JournalLine>(&line) else {
                    warn!("skipping corrupt journal line");
                    continue;
                };
                match record {
                    JournalLine::Put { hash, len } => {
                        if let Some(hash) = parse_hex_hash(&hash) {
                            replayed.entry(hash).or_insert(EntryMeta {
                                len,
                                refcount: 0,
                                last_access: 0,
                            });
                        }
                    }
                    JournalLine::Ref { hash } => {
                        if let Some(hash) = parse_hex_hash(&hash) {
                            if let Some(meta) = replayed.get_mut(&hash) {
                                meta.refcount += 1;
                            }
                        }
                    }
                    JournalLine::Unref { hash } => {
                        if let Some(hash) = parse_hex_hash(&hash) {
                            if let Some(meta) = replayed.get_mut(&hash) {
                                meta.refcount = meta.refcount.saturating_sub(1);
                            }
                        }
                    }
                }
            }
        }

        // Reconcile against the blobs on disk: orphans become refcount-0
        // entries, journaled-but-missing blobs invalidate their manifests.
        let mut invalid = Vec::new();
        let mut on_disk: HashMap<ContentHash, u64> = HashMap::new();
        for shard_no in 0u16..256 {
            let dir = root.join(format!("{shard_no:02x}"));
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(hash) = name.to_str().and_then(parse_hex_hash) else {
                    continue;
                };
                on_disk.insert(hash, entry.metadata()?.len());
            }
        }
        for (hash, meta) in &replayed {
            if meta.refcount > 0 && !on_disk.contains_key(hash) {
                warn!("blob {hash} referenced by a live manifest is missing");
                invalid.push(*hash);
            }
        }

        let mut shards: Vec<Shard> = (0..256)
            .map(|_| Shard {
                entries: HashMap::new(),
            })
            .collect();
        for (hash, len) in on_disk {
            let refcount = replayed.get(&hash).map_or(0, |m| m.refcount);
            shards[shard_index(&hash)].entries.insert(
                hash,
                EntryMeta {
                    len,
                    refcount,
                    last_access: 0,
                },
            );
        }

        // Compact: rewrite the journal from the reconciled state.
        let compact_path = root.join(format!("{JOURNAL_FILE}.tmp"));
        {
            let mut writer = BufWriter::new(File::create(&compact_path)?);
            for shard in &shards {
                for (hash, meta) in &shard.entries {
                    write_journal_line(
                        &mut writer,
                        &JournalLine::Put {
                            hash: hash.to_hex(),
                            len: meta.len,
                        },
                    )?;
                    for _ in 0..meta.refcount {
                        write_journal_line(
                            &mut writer,
                            &JournalLine::Ref {
                                hash: hash.to_hex(),
                            },
                        )?;
                    }
                }
            }
            writer.flush()?;
        }
        fs::rename(&compact_path, &journal_path)?;

        let journal = BufWriter::new(OpenOptions::new().append(true).open(&journal_path)?);

        Ok(Self {
            root,
            shards: shards.into_iter().map(Mutex::new).collect(),
            journal: Mutex::new(journal),
            access_clock: AtomicU64::new(1),
            invalid: Mutex::new(invalid),
        })
    }

    /// Hashes the journal references that have no backing blob. Manifests
    /// that reach any of these must be treated as invalid.
    #[must_use]
    pub fn invalid(&self) -> Vec<ContentHash> {
        self.invalid.lock().unwrap().clone()
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Store a blob. Idempotent: storing the same hash twice reports
    /// `Exists` and leaves the first copy in place.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when the disk is full; callers may
    /// `sweep` and retry once
    pub fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<PutOutcome> {
        let shard = &self.shards[shard_index(hash)];
        {
            let guard = shard.lock().unwrap();
            if guard.entries.contains_key(hash) {
                return Ok(PutOutcome::Exists);
            }
        }

        let final_path = self.blob_path(hash);
        fs::create_dir_all(final_path.parent().unwrap())?;

        // Temp-file-and-rename keeps concurrent writers of the same hash
        // safe: last rename wins and both wrote identical bytes.
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{}", hash.to_hex(), std::process::id()));
        let write_result: Result<()> = (|| {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_data()?;
            Ok(())
        })();
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, &final_path)?;

        let mut guard = shard.lock().unwrap();
        let was_new = guard
            .entries
            .insert(
                *hash,
                EntryMeta {
                    len: data.len() as u64,
                    refcount: 0,
                    last_access: self.access_clock.fetch_add(1, Ordering::Relaxed),
                },
            )
            .is_none();
        drop(guard);

        if was_new {
            self.append_journal(&JournalLine::Put {
                hash: hash.to_hex(),
                len: data.len() as u64,
            })?;
            Ok(PutOutcome::Stored)
        } else {
            Ok(PutOutcome::Exists)
        }
    }

    /// Fetch a blob. `Ok(None)` means missing, which is non-fatal to
    /// callers.
    ///
    /// # Errors
    /// Returns an error only for real I/O failures
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        match fs::read(self.blob_path(hash)) {
            Ok(data) => {
                let shard = &self.shards[shard_index(hash)];
                if let Some(meta) = shard.lock().unwrap().entries.get_mut(hash) {
                    meta.last_access = self.access_clock.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Some(Bytes::from(data)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a blob is present
    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.shards[shard_index(hash)]
            .lock()
            .unwrap()
            .entries
            .contains_key(hash)
    }

    /// Take a reference on a blob for a live manifest
    ///
    /// # Errors
    /// Returns `NotFound` if the blob is not stored
    pub fn incref(&self, hash: &ContentHash) -> Result<u32> {
        let count = {
            let mut guard = self.shards[shard_index(hash)].lock().unwrap();
            let meta = guard
                .entries
                .get_mut(hash)
                .ok_or_else(|| Error::not_found(format!("no blob {hash}")))?;
            meta.refcount += 1;
            meta.refcount
        };
        self.append_journal(&JournalLine::Ref {
            hash: hash.to_hex(),
        })?;
        Ok(count)
    }

    /// Drop a reference. Entries at refcount 0 become sweep-eligible.
    ///
    /// # Errors
    /// Returns `NotFound` if the blob is not stored
    pub fn decref(&self, hash: &ContentHash) -> Result<u32> {
        let count = {
            let mut guard = self.shards[shard_index(hash)].lock().unwrap();
            let meta = guard
                .entries
                .get_mut(hash)
                .ok_or_else(|| Error::not_found(format!("no blob {hash}")))?;
            if meta.refcount == 0 {
                warn!("decref below zero for {hash}");
            }
            meta.refcount = meta.refcount.saturating_sub(1);
            meta.refcount
        };
        self.append_journal(&JournalLine::Unref {
            hash: hash.to_hex(),
        })?;
        Ok(count)
    }

    /// Current refcount, if stored
    #[must_use]
    pub fn refcount(&self, hash: &ContentHash) -> Option<u32> {
        self.shards[shard_index(hash)]
            .lock()
            .unwrap()
            .entries
            .get(hash)
            .map(|m| m.refcount)
    }

    /// Total bytes stored
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().entries.values().map(|m| m.len).sum::<u64>())
            .sum()
    }

    /// Evict refcount-0 entries, least recently accessed first, until at
    /// least `target_bytes` have been freed or no candidates remain.
    ///
    /// # Errors
    /// Returns an error if a blob file cannot be removed
    pub fn sweep(&self, target_bytes: u64) -> Result<u64> {
        let mut candidates: Vec<(u64, ContentHash, u64)> = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap();
            for (hash, meta) in &guard.entries {
                if meta.refcount == 0 {
                    candidates.push((meta.last_access, *hash, meta.len));
                }
            }
        }
        candidates.sort_unstable_by_key(|(access, ..)| *access);

        let mut freed = 0u64;
        for (_, hash, len) in candidates {
            if freed >= target_bytes {
                break;
            }
            let mut guard = self.shards[shard_index(&hash)].lock().unwrap();
            // Re-check under the lock: the entry may have been re-referenced.
            // The unlink happens under the same lock so a concurrent put of
            // the same hash cannot land between map removal and deletion.
            match guard.entries.get(&hash) {
                Some(meta) if meta.refcount == 0 => {
                    guard.entries.remove(&hash);
                }
                _ => continue,
            }
            match fs::remove_file(self.blob_path(&hash)) {
                Ok(()) => freed += len,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => freed += len,
                Err(err) => return Err(err.into()),
            }
            drop(guard);
            debug!("evicted {hash} ({len} bytes)");
        }
        Ok(freed)
    }

    /// Low-water-mark maintenance: when free space under the store drops
    /// below `low_water_bytes`, sweep until `target_bytes` are freed.
    ///
    /// # Errors
    /// Returns an error if the free-space query or the sweep fails
    pub fn maintain(&self, low_water_bytes: u64, target_bytes: u64) -> Result<u64> {
        let free = fs2::available_space(&self.root)?;
        if free >= low_water_bytes {
            return Ok(0);
        }
        debug!("free space {free} below low water {low_water_bytes}, sweeping");
        self.sweep(target_bytes)
    }

    fn append_journal(&self, line: &JournalLine) -> Result<()> {
        let mut journal = self.journal.lock().unwrap();
        write_journal_line(&mut *journal, line)?;
        journal.flush()?;
        Ok(())
    }
}

fn write_journal_line(writer: &mut impl Write, line: &JournalLine) -> Result<()> {
    let json = serde_json::to_string(line)
        .map_err(|e| Error::internal("journal encode").with_source(e))?;
    writer.write_all(json.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn shard_index(hash: &ContentHash) -> usize {
    hash.as_bytes()[0] as usize
}

fn parse_hex_hash(hex_str: &str) -> Option<ContentHash> {
    let bytes = hex::decode(hex_str).ok()?;
    let raw: [u8; 32] = bytes.try_into().ok()?;
    Some(ContentHash::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();

        let data = b"chunk payload";
        let hash = ContentHash::from_bytes(data);

        assert!(!cas.contains(&hash));
        assert_eq!(cas.put(&hash, data).unwrap(), PutOutcome::Stored);
        assert!(cas.contains(&hash));
        assert_eq!(&cas.get(&hash).unwrap().unwrap()[..], data);

        // Idempotent
        assert_eq!(cas.put(&hash, data).unwrap(), PutOutcome::Exists);
    }

    #[test]
    fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        let hash = ContentHash::from_bytes(b"never stored");
        assert!(cas.get(&hash).unwrap().is_none());
    }

    #[test]
    fn test_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();

        let hash = ContentHash::from_bytes(b"counted");
        cas.put(&hash, b"counted").unwrap();
        assert_eq!(cas.refcount(&hash), Some(0));

        assert_eq!(cas.incref(&hash).unwrap(), 1);
        assert_eq!(cas.incref(&hash).unwrap(), 2);
        assert_eq!(cas.decref(&hash).unwrap(), 1);
        assert_eq!(cas.decref(&hash).unwrap(), 0);
    }

    #[test]
    fn test_sweep_only_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();

        let kept = ContentHash::from_bytes(b"kept");
        let evicted = ContentHash::from_bytes(b"evicted");
        cas.put(&kept, b"kept").unwrap();
        cas.put(&evicted, b"evicted").unwrap();
        cas.incref(&kept).unwrap();

        let freed = cas.sweep(u64::MAX).unwrap();
        assert_eq!(freed, "evicted".len() as u64);
        assert!(cas.contains(&kept));
        assert!(!cas.contains(&evicted));
        assert!(cas.get(&evicted).unwrap().is_none());
    }

    #[test]
    fn test_sweep_lru_order() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();

        let older = ContentHash::from_bytes(b"older");
        let newer = ContentHash::from_bytes(b"newer");
        cas.put(&older, b"older").unwrap();
        cas.put(&newer, b"newer").unwrap();
        // Touch `older` so `newer` becomes the eviction candidate
        cas.get(&older).unwrap();

        cas.sweep(1).unwrap();
        assert!(cas.contains(&older));
        assert!(!cas.contains(&newer));
    }

    #[test]
    fn test_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash = ContentHash::from_bytes(b"durable");
        {
            let cas = Cas::open(dir.path()).unwrap();
            cas.put(&hash, b"durable").unwrap();
            cas.incref(&hash).unwrap();
            cas.incref(&hash).unwrap();
            cas.decref(&hash).unwrap();
        }
        let cas = Cas::open(dir.path()).unwrap();
        assert_eq!(cas.refcount(&hash), Some(1));
        assert_eq!(&cas.get(&hash).unwrap().unwrap()[..], b"durable");
    }

    #[test]
    fn test_orphan_blob_becomes_refcount_zero() {
        let dir = tempfile::tempdir().unwrap();
        let hash = ContentHash::from_bytes(b"orphan");
        {
            let cas = Cas::open(dir.path()).unwrap();
            cas.put(&hash, b"orphan").unwrap();
        }
        // Wipe the journal; the blob stays behind.
        std::fs::remove_file(dir.path().join(JOURNAL_FILE)).unwrap();

        let cas = Cas::open(dir.path()).unwrap();
        assert_eq!(cas.refcount(&hash), Some(0));
        assert!(cas.invalid().is_empty());
    }

    #[test]
    fn test_missing_live_blob_flagged_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let hash = ContentHash::from_bytes(b"vanishes");
        let blob_path;
        {
            let cas = Cas::open(dir.path()).unwrap();
            cas.put(&hash, b"vanishes").unwrap();
            cas.incref(&hash).unwrap();
            blob_path = cas.blob_path(&hash);
        }
        std::fs::remove_file(blob_path).unwrap();

        let cas = Cas::open(dir.path()).unwrap();
        assert_eq!(cas.invalid(), vec![hash]);
    }

    #[test]
    fn test_usage() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::open(dir.path()).unwrap();
        cas.put(&ContentHash::from_bytes(b"12345"), b"12345").unwrap();
        cas.put(&ContentHash::from_bytes(b"abc"), b"abc").unwrap();
        assert_eq!(cas.usage(), 8);
    }
}
