//! Client half of the one-shot synchronizer.
//!
//! Walks the sources, streams the enumeration to the server, ships missing
//! files whole, and answers signatures of changed files with deltas. The
//! whole conversation runs over one framed stream; with `-z` the bulk phases
//! travel inside a compression window.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cdcsync_core::delta::compute_delta;
use cdcsync_core::pump::frame_type;
use cdcsync_core::{ContentHash, Error, MessagePump, PathFilter, Result};

use crate::messages::{
    DirInfo, EndFile, FileInfo, FileStats, Summary, SyncOptions, WireOp, decode_indices,
    decode_paths, decode_signature, encode_ops,
};
use crate::util::{mode_bits, mtime_secs, wire_path};

/// Bytes per FileData frame in phase 4
const DATA_FRAME_LEN: usize = 64 * 1024;
/// Literal bytes per Delta frame in phase 5
const OPS_FRAME_BUDGET: usize = 128 * 1024;

/// One enumerated source file
struct LocalFile {
    abs: PathBuf,
    info: FileInfo,
}

/// Result of a finished sync, as printed by the CLI
#[derive(Debug, Clone, Copy)]
pub struct SyncReport {
    pub summary: Summary,
    pub stats: FileStats,
}

pub struct SyncClient {
    options: SyncOptions,
    filter: PathFilter,
    sources: Vec<PathBuf>,
    /// Paths become destination-relative to this base (`--files-from` mode)
    base: Option<PathBuf>,
}

impl SyncClient {
    /// # Errors
    /// `InvalidArgument` for a bad filter pattern
    pub fn new(options: SyncOptions, sources: Vec<PathBuf>) -> Result<Self> {
        let filter = PathFilter::new(options.rules.clone())?;
        Ok(Self {
            options,
            filter,
            sources,
            base: None,
        })
    }

    /// Resolve wire paths relative to `base` instead of per-source rules
    #[must_use]
    pub fn with_base(mut self, base: PathBuf) -> Self {
        self.base = Some(base);
        self
    }

    /// Run the whole protocol over a connected stream.
    ///
    /// # Errors
    /// Any transport failure aborts the sync; the server leaves no partial
    /// destination files behind
    pub fn run<S: Read + Write>(&self, stream: S) -> Result<SyncReport> {
        let mut pump = MessagePump::new(stream);

        pump.send(frame_type::HANDSHAKE, &self.options.encode())?;
        let _server_options = SyncOptions::decode(&pump.expect(frame_type::HANDSHAKE)?)?;

        let (dirs, files) = self.enumerate()?;
        info!("enumerated {} files, {} dirs", files.len(), dirs.len());
        for dir in &dirs {
            pump.send(frame_type::DIR_INFO, &dir.encode())?;
        }
        for file in &files {
            pump.send(frame_type::FILE_INFO, &file.info.encode())?;
        }
        pump.send(frame_type::DONE_ENUM, &[])?;

        let stats = FileStats::decode(&pump.expect(frame_type::FILE_STATS)?)?;
        let deleted = if self.options.delete {
            decode_paths(&pump.expect(frame_type::DELETED_PATHS)?)?
        } else {
            Vec::new()
        };
        for path in &deleted {
            info!("deleting {path}");
        }
        let missing = decode_indices(&pump.expect(frame_type::MISSING_INDICES)?)?;
        let changed = decode_indices(&pump.expect(frame_type::CHANGED_INDICES)?)?;
        debug!("{} missing, {} changed", missing.len(), changed.len());

        let mut summary = Summary {
            files_total: files.len() as u64,
            files_missing: missing.len() as u64,
            files_changed: changed.len() as u64,
            files_unchanged: u64::from(stats.unchanged),
            files_deleted: deleted.len() as u64,
            dry_run: self.options.dry_run,
            ..Summary::default()
        };

        if self.options.dry_run {
            pump.send(frame_type::SUMMARY, &summary.encode())?;
            let _ack = Summary::decode(&pump.expect(frame_type::SUMMARY)?)?;
            return Ok(SyncReport { summary, stats });
        }

        if self.options.compress {
            pump.start_compression(self.options.compress_level)?;
        }

        for &index in &missing {
            summary.data_bytes += self.send_whole_file(&mut pump, &files[index as usize])?;
        }

        for &expected_index in &changed {
            let (index, signature) = decode_signature(&pump.expect(frame_type::SIGNATURES)?)?;
            if index != expected_index {
                return Err(Error::aborted(format!(
                    "signature for file {index}, expected {expected_index}"
                )));
            }
            let (literal, matched) = self.send_delta(&mut pump, &files[index as usize], &signature)?;
            summary.literal_bytes += literal;
            summary.matched_bytes += matched;
        }

        if self.options.compress {
            pump.stop_compression()?;
        }

        pump.send(frame_type::SUMMARY, &summary.encode())?;
        let _ack = Summary::decode(&pump.expect(frame_type::SUMMARY)?)?;
        Ok(SyncReport { summary, stats })
    }

    /// Phase 4: stream one file's content. Returns bytes sent; a file that
    /// vanished since enumeration is marked skipped, not fatal.
    fn send_whole_file<S: Read + Write>(
        &self,
        pump: &mut MessagePump<S>,
        file: &LocalFile,
    ) -> Result<u64> {
        let mut reader = match std::fs::File::open(&file.abs) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("{} vanished ({err}), skipping", file.abs.display());
                let end = EndFile {
                    skipped: true,
                    file_hash: ContentHash::from_bytes(b""),
                    file_size: 0,
                };
                pump.send(frame_type::END_FILE, &end.encode())?;
                return Ok(0);
            }
        };

        let mut hasher = blake3::Hasher::new();
        let mut sent = 0u64;
        let mut buf = vec![0u8; DATA_FRAME_LEN];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            pump.send(frame_type::FILE_DATA, &buf[..n])?;
            sent += n as u64;
        }
        let end = EndFile {
            skipped: false,
            file_hash: ContentHash::from_raw(*hasher.finalize().as_bytes()),
            file_size: sent,
        };
        pump.send(frame_type::END_FILE, &end.encode())?;
        Ok(sent)
    }

    /// Phase 5: answer one signature with delta instructions. Returns
    /// (literal bytes, matched bytes).
    fn send_delta<S: Read + Write>(
        &self,
        pump: &mut MessagePump<S>,
        file: &LocalFile,
        signature: &cdcsync_core::delta::Signature,
    ) -> Result<(u64, u64)> {
        let data = match std::fs::read(&file.abs) {
            Ok(data) => data,
            Err(err) => {
                warn!("{} vanished ({err}), skipping", file.abs.display());
                let end = EndFile {
                    skipped: true,
                    file_hash: ContentHash::from_bytes(b""),
                    file_size: 0,
                };
                pump.send(frame_type::END_FILE, &end.encode())?;
                return Ok((0, 0));
            }
        };

        let delta = compute_delta(&data, signature);
        let mut batch: Vec<WireOp> = Vec::new();
        let mut budget = 0usize;
        for op in &delta.ops {
            match op {
                cdcsync_core::delta::DeltaOp::Copy { index } => {
                    batch.push(WireOp::Copy { index: *index });
                }
                cdcsync_core::delta::DeltaOp::Literal { data } => {
                    budget += data.len();
                    batch.push(WireOp::Literal { data: data.clone() });
                }
            }
            if budget >= OPS_FRAME_BUDGET {
                pump.send(frame_type::DELTA, &encode_ops(&batch))?;
                batch.clear();
                budget = 0;
            }
        }
        if !batch.is_empty() {
            pump.send(frame_type::DELTA, &encode_ops(&batch))?;
        }

        let end = EndFile {
            skipped: false,
            file_hash: delta.file_hash,
            file_size: delta.file_size,
        };
        pump.send(frame_type::END_FILE, &end.encode())?;
        Ok((
            delta.literal_bytes(),
            delta.matched_bytes(signature.block_size),
        ))
    }

    /// Walk every source, apply filters, and assign wire paths.
    fn enumerate(&self) -> Result<(Vec<DirInfo>, Vec<LocalFile>)> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();

        for source in &self.sources {
            let meta = std::fs::symlink_metadata(source).map_err(|err| {
                Error::invalid_argument(format!("source {}: {err}", source.display()))
            })?;

            if meta.is_file() {
                let rel = self.file_rel_path(source);
                if self.filter.allows(&rel) {
                    self.push_file(&mut files, source.clone(), &rel, &meta)?;
                }
                continue;
            }
            if !meta.is_dir() {
                warn!("skipping non-regular source {}", source.display());
                continue;
            }
            if !self.options.recursive {
                warn!("skipping directory {} (no -r)", source.display());
                continue;
            }

            let prefix = self.dir_prefix(source);
            if !prefix.as_os_str().is_empty() {
                dirs.push(DirInfo {
                    path: wire_path(&prefix),
                    mode: mode_bits(&meta),
                });
            }
            for entry in walkdir::WalkDir::new(source).min_depth(1).sort_by_file_name() {
                let entry =
                    entry.map_err(|e| Error::internal("walk failed").with_source(e))?;
                let rel = prefix.join(entry.path().strip_prefix(source).unwrap());
                if !self.filter.allows(&rel) {
                    continue;
                }
                let entry_meta = entry.metadata().map_err(|e| {
                    Error::internal(format!("stat {}", entry.path().display())).with_source(e)
                })?;
                if entry_meta.is_dir() {
                    dirs.push(DirInfo {
                        path: wire_path(&rel),
                        mode: mode_bits(&entry_meta),
                    });
                } else if entry_meta.is_file() {
                    self.push_file(&mut files, entry.path().to_path_buf(), &rel, &entry_meta)?;
                }
                // Symlinks and specials are not transferred by the one-shot tool.
            }
        }
        Ok((dirs, files))
    }

    fn push_file(
        &self,
        files: &mut Vec<LocalFile>,
        abs: PathBuf,
        rel: &Path,
        meta: &std::fs::Metadata,
    ) -> Result<()> {
        let checksum = if self.options.checksum {
            Some(ContentHash::from_file(&abs)?)
        } else {
            None
        };
        files.push(LocalFile {
            info: FileInfo {
                path: wire_path(rel),
                size: meta.len(),
                mtime: mtime_secs(meta),
                mode: mode_bits(meta),
                checksum,
            },
            abs,
        });
        Ok(())
    }

    /// Destination-relative path for a single-file source
    fn file_rel_path(&self, source: &Path) -> PathBuf {
        if let Some(base) = &self.base {
            return source.strip_prefix(base).unwrap_or(source).to_path_buf();
        }
        if self.options.relative {
            relative_form(source)
        } else {
            PathBuf::from(source.file_name().unwrap_or_default())
        }
    }

    /// Destination-relative prefix for a directory source. A trailing slash
    /// sends the directory's contents; otherwise the directory itself.
    fn dir_prefix(&self, source: &Path) -> PathBuf {
        if let Some(base) = &self.base {
            return source.strip_prefix(base).unwrap_or(source).to_path_buf();
        }
        if self.options.relative {
            return relative_form(source);
        }
        let given = source.to_string_lossy();
        if given.ends_with('/') || given.ends_with("/.") {
            PathBuf::new()
        } else {
            PathBuf::from(source.file_name().unwrap_or_default())
        }
    }
}

/// `-R` form: the source path as given, without a leading `/` or `./`
fn relative_form(source: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in source.components() {
        if let std::path::Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_form_strips_root_and_dots() {
        assert_eq!(
            relative_form(Path::new("/var/data/assets")),
            PathBuf::from("var/data/assets")
        );
        assert_eq!(relative_form(Path::new("./a/b")), PathBuf::from("a/b"));
    }

    #[test]
    fn test_dir_prefix_trailing_slash() {
        let client = SyncClient::new(
            SyncOptions {
                recursive: true,
                ..SyncOptions::default()
            },
            vec![],
        )
        .unwrap();
        assert_eq!(client.dir_prefix(Path::new("/src/tree/")), PathBuf::new());
        assert_eq!(
            client.dir_prefix(Path::new("/src/tree")),
            PathBuf::from("tree")
        );
    }

    #[test]
    fn test_enumerate_applies_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.dat"), "b").unwrap();
        std::fs::write(dir.path().join("c.exe"), "c").unwrap();
        std::fs::write(dir.path().join("d.md"), "d").unwrap();

        let client = SyncClient::new(
            SyncOptions {
                recursive: true,
                rules: vec![
                    cdcsync_core::FilterRule::include("*.txt"),
                    cdcsync_core::FilterRule::exclude("*.dat"),
                    cdcsync_core::FilterRule::include("*.exe"),
                ],
                ..SyncOptions::default()
            },
            vec![dir.path().to_path_buf()],
        )
        .unwrap();

        let (_dirs, files) = client.enumerate().unwrap();
        let mut paths: Vec<&str> = files.iter().map(|f| f.info.path.as_str()).collect();
        paths.sort_unstable();
        let expected: Vec<String> = ["a.txt", "c.exe"]
            .iter()
            .map(|n| format!("{}/{n}", dir.path().file_name().unwrap().to_str().unwrap()))
            .collect();
        let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
        assert_eq!(paths, expected);
    }
}
