//! Server half of the one-shot synchronizer.
//!
//! Receives the enumeration, diffs it against the destination tree,
//! requests missing files whole and changed files as deltas against its own
//! blocks, and applies everything through sidecar temp files so an aborted
//! transfer never leaves a partial destination file in place.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use cdcsync_core::delta::{Signature, block_size_for};
use cdcsync_core::pump::frame_type;
use cdcsync_core::{ContentHash, Error, Frame, MessagePump, PathFilter, Result};

use crate::messages::{
    DirInfo, EndFile, FileInfo, FileStats, Summary, SyncOptions, WireOp, decode_ops,
    encode_indices, encode_paths, encode_signature,
};
use crate::util::{apply_metadata, mtime_secs, wire_path};

pub struct SyncServer {
    dest_root: PathBuf,
}

/// How one enumerated file will be handled
enum Disposition {
    Missing,
    /// Missing but `--existing` forbids creating it
    MissingSkipped,
    Changed { basis: PathBuf },
    Unchanged,
    /// Identical copy available under `--copy-dest`; clone it locally
    CopyFromBasis { basis: PathBuf },
}

impl SyncServer {
    #[must_use]
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        Self {
            dest_root: dest_root.into(),
        }
    }

    /// Serve one sync conversation.
    ///
    /// # Errors
    /// Transport failures abort the sync; the error is also reported to the
    /// peer when the stream still works
    pub fn serve<S: Read + Write>(&self, stream: S) -> Result<Summary> {
        let mut pump = MessagePump::new(stream);
        match self.serve_inner(&mut pump) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                let _ = pump.send_error(&err);
                Err(err)
            }
        }
    }

    fn serve_inner<S: Read + Write>(&self, pump: &mut MessagePump<S>) -> Result<Summary> {
        let options = SyncOptions::decode(&pump.expect(frame_type::HANDSHAKE)?)?;
        pump.send(frame_type::HANDSHAKE, &options.encode())?;
        let filter = PathFilter::new(options.rules.clone())?;

        // The client may aim below our export root.
        let server = if options.dest.is_empty() {
            Self::new(&self.dest_root)
        } else {
            Self::new(self.dest_root.join(sanitize(&options.dest)?))
        };
        let server = &server;

        // Phase 2: receive the enumeration.
        let mut dirs: Vec<DirInfo> = Vec::new();
        let mut files: Vec<FileInfo> = Vec::new();
        loop {
            let frame = pump.recv()?;
            match frame.ty {
                frame_type::DIR_INFO => dirs.push(DirInfo::decode(&frame.payload)?),
                frame_type::FILE_INFO => files.push(FileInfo::decode(&frame.payload)?),
                frame_type::DONE_ENUM => break,
                other => {
                    return Err(Error::aborted(format!(
                        "unexpected frame {other} during enumeration"
                    )));
                }
            }
        }
        info!("received {} files, {} dirs", files.len(), dirs.len());

        // Phase 3: diff against the destination tree.
        let mut dispositions = Vec::with_capacity(files.len());
        let mut stats = FileStats::default();
        let mut missing_indices = Vec::new();
        let mut changed_indices = Vec::new();
        for (index, info) in files.iter().enumerate() {
            let disposition = server.classify(info, &options)?;
            match &disposition {
                Disposition::Missing => {
                    stats.missing += 1;
                    missing_indices.push(index as u32);
                }
                Disposition::MissingSkipped => stats.missing += 1,
                Disposition::Changed { .. } => {
                    stats.changed += 1;
                    changed_indices.push(index as u32);
                }
                Disposition::Unchanged | Disposition::CopyFromBasis { .. } => stats.unchanged += 1,
            }
            dispositions.push(disposition);
        }

        let (extraneous_files, extraneous_dirs) = if options.delete && options.recursive {
            server.find_extraneous(&files, &dirs, &filter)?
        } else {
            (Vec::new(), Vec::new())
        };
        stats.extraneous = (extraneous_files.len() + extraneous_dirs.len()) as u32;

        pump.send(frame_type::FILE_STATS, &stats.encode())?;
        if options.delete {
            let mut all_deleted: Vec<String> = extraneous_files
                .iter()
                .chain(extraneous_dirs.iter())
                .map(|p| wire_path(p))
                .collect();
            all_deleted.sort_unstable();
            pump.send(frame_type::DELETED_PATHS, &encode_paths(&all_deleted))?;
        }
        pump.send(frame_type::MISSING_INDICES, &encode_indices(&missing_indices))?;
        pump.send(frame_type::CHANGED_INDICES, &encode_indices(&changed_indices))?;

        let mut summary = Summary {
            files_total: files.len() as u64,
            files_missing: missing_indices.len() as u64,
            files_changed: changed_indices.len() as u64,
            files_unchanged: u64::from(stats.unchanged),
            files_deleted: (extraneous_files.len() + extraneous_dirs.len()) as u64,
            dry_run: options.dry_run,
            ..Summary::default()
        };

        if options.dry_run {
            // Report only; the destination is untouched.
            let _client_summary = Summary::decode(&pump.expect(frame_type::SUMMARY)?)?;
            pump.send(frame_type::SUMMARY, &summary.encode())?;
            return Ok(summary);
        }

        // Apply structure changes before any content flows.
        std::fs::create_dir_all(&server.dest_root)?;
        for dir in &dirs {
            let rel = sanitize(&dir.path)?;
            let path = server.dest_root.join(rel);
            std::fs::create_dir_all(&path)?;
            apply_metadata(&path, dir.mode, None)?;
        }
        for rel in &extraneous_files {
            let path = server.dest_root.join(rel);
            debug!("deleting {}", path.display());
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let mut dirs_deepest_first = extraneous_dirs.clone();
        dirs_deepest_first.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for rel in &dirs_deepest_first {
            // Non-empty directories survive (they still hold wanted files).
            let _ = std::fs::remove_dir(server.dest_root.join(rel));
        }
        for (index, disposition) in dispositions.iter().enumerate() {
            if let Disposition::CopyFromBasis { basis } = disposition {
                server.clone_from_basis(basis, &files[index])?;
            }
        }

        // Phase 4: missing files arrive whole.
        for &index in &missing_indices {
            let info = &files[index as usize];
            summary.data_bytes += server.receive_whole_file(pump, info)?;
        }

        // Phase 5: changed files arrive as deltas against our blocks.
        for &index in &changed_indices {
            let info = &files[index as usize];
            let Disposition::Changed { basis } = &dispositions[index as usize] else {
                return Err(Error::internal("changed index without basis"));
            };
            let (literal, matched) = server.receive_delta(pump, index, info, basis)?;
            summary.literal_bytes += literal;
            summary.matched_bytes += matched;
        }

        let _client_summary = Summary::decode(&pump.expect(frame_type::SUMMARY)?)?;
        pump.send(frame_type::SUMMARY, &summary.encode())?;
        Ok(summary)
    }

    /// Decide how one file will be brought up to date
    fn classify(&self, info: &FileInfo, options: &SyncOptions) -> Result<Disposition> {
        let rel = sanitize(&info.path)?;
        let dest = self.dest_root.join(&rel);

        if let Ok(meta) = std::fs::symlink_metadata(&dest) {
            if meta.is_file() {
                if self.matches(info, &dest, &meta, options)? {
                    return Ok(Disposition::Unchanged);
                }
                return Ok(if options.whole_file {
                    Disposition::Missing
                } else {
                    Disposition::Changed { basis: dest }
                });
            }
            // A directory or symlink is squatting on the path: replace it
            // wholesale.
            return Ok(Disposition::Missing);
        }

        if let Some(copy_dest) = &options.copy_dest {
            let basis = Path::new(copy_dest).join(&rel);
            if let Ok(meta) = std::fs::symlink_metadata(&basis) {
                if meta.is_file() {
                    if self.matches(info, &basis, &meta, options)? {
                        return Ok(Disposition::CopyFromBasis { basis });
                    }
                    if !options.whole_file {
                        return Ok(Disposition::Changed { basis });
                    }
                }
            }
        }

        if options.existing {
            return Ok(Disposition::MissingSkipped);
        }
        Ok(Disposition::Missing)
    }

    /// Sizes first; equal sizes fall back to mtime, or to content under
    /// `--checksum`.
    fn matches(
        &self,
        info: &FileInfo,
        path: &Path,
        meta: &std::fs::Metadata,
        options: &SyncOptions,
    ) -> Result<bool> {
        if meta.len() != info.size {
            return Ok(false);
        }
        if options.checksum {
            let Some(expected) = info.checksum else {
                return Ok(false);
            };
            return Ok(ContentHash::from_file(path)? == expected);
        }
        Ok(mtime_secs(meta) == info.mtime)
    }

    /// Destination files and directories the sender no longer has
    fn find_extraneous(
        &self,
        files: &[FileInfo],
        dirs: &[DirInfo],
        filter: &PathFilter,
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        if !self.dest_root.is_dir() {
            return Ok((Vec::new(), Vec::new()));
        }
        let wanted_files: HashSet<PathBuf> = files
            .iter()
            .filter_map(|f| sanitize(&f.path).ok())
            .collect();
        let wanted_dirs: HashSet<PathBuf> = dirs
            .iter()
            .filter_map(|d| sanitize(&d.path).ok())
            .flat_map(|p| {
                p.ancestors()
                    .map(Path::to_path_buf)
                    .collect::<Vec<_>>()
            })
            .chain(wanted_files.iter().filter_map(|f| {
                f.parent().map(|p| {
                    p.ancestors().map(Path::to_path_buf).collect::<Vec<_>>()
                })
            }).flatten())
            .collect();

        let mut extraneous_files = Vec::new();
        let mut extraneous_dirs = Vec::new();
        for entry in walkdir::WalkDir::new(&self.dest_root).min_depth(1) {
            let entry = entry.map_err(|e| Error::internal("dest walk").with_source(e))?;
            let rel = entry
                .path()
                .strip_prefix(&self.dest_root)
                .unwrap()
                .to_path_buf();
            if !filter.allows(&rel) {
                continue;
            }
            if entry.file_type().is_dir() {
                if !wanted_dirs.contains(&rel) {
                    extraneous_dirs.push(rel);
                }
            } else if !wanted_files.contains(&rel) {
                extraneous_files.push(rel);
            }
        }
        Ok((extraneous_files, extraneous_dirs))
    }

    /// `--copy-dest` hit: clone the identical basis file into place locally
    fn clone_from_basis(&self, basis: &Path, info: &FileInfo) -> Result<()> {
        let rel = sanitize(&info.path)?;
        let dest = self.dest_root.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(&dest);
        std::fs::copy(basis, &tmp)?;
        apply_metadata(&tmp, info.mode, Some(info.mtime))?;
        std::fs::rename(&tmp, &dest)?;
        debug!("cloned {} from copy-dest", dest.display());
        Ok(())
    }

    /// Phase-4 receive loop for one file
    fn receive_whole_file<S: Read + Write>(
        &self,
        pump: &mut MessagePump<S>,
        info: &FileInfo,
    ) -> Result<u64> {
        let rel = sanitize(&info.path)?;
        let dest = self.dest_root.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(&dest);
        let guard = TempGuard::new(tmp.clone());

        let mut file = std::fs::File::create(&tmp)?;
        let mut hasher = blake3::Hasher::new();
        let mut received = 0u64;
        let end = loop {
            let frame = next_frame(pump)?;
            match frame.ty {
                frame_type::FILE_DATA => {
                    hasher.update(&frame.payload);
                    file.write_all(&frame.payload)?;
                    received += frame.payload.len() as u64;
                }
                frame_type::END_FILE => break EndFile::decode(&frame.payload)?,
                other => {
                    return Err(Error::aborted(format!(
                        "unexpected frame {other} in file data"
                    )));
                }
            }
        };

        if end.skipped {
            warn!("{} skipped by sender", info.path);
            return Ok(0);
        }
        let actual = ContentHash::from_raw(*hasher.finalize().as_bytes());
        if actual != end.file_hash || received != end.file_size {
            return Err(Error::aborted(format!(
                "file {} corrupted in transit",
                info.path
            )));
        }
        file.sync_data()?;
        drop(file);
        apply_metadata(&tmp, info.mode, Some(info.mtime))?;
        std::fs::rename(&tmp, &dest)?;
        guard.defuse();
        Ok(received)
    }

    /// Phase-5: send our signature, rebuild from the delta
    fn receive_delta<S: Read + Write>(
        &self,
        pump: &mut MessagePump<S>,
        index: u32,
        info: &FileInfo,
        basis_path: &Path,
    ) -> Result<(u64, u64)> {
        let basis = std::fs::read(basis_path).unwrap_or_default();
        let block_size = block_size_for(basis.len() as u64);
        let signature = Signature::compute(&basis, block_size);
        pump.send(frame_type::SIGNATURES, &encode_signature(index, &signature))?;

        let rel = sanitize(&info.path)?;
        let dest = self.dest_root.join(&rel);
        let tmp = temp_path(&dest);
        let guard = TempGuard::new(tmp.clone());

        let mut file = std::fs::File::create(&tmp)?;
        let mut hasher = blake3::Hasher::new();
        let mut literal = 0u64;
        let mut matched = 0u64;
        let mut written = 0u64;
        let end = loop {
            let frame = next_frame(pump)?;
            match frame.ty {
                frame_type::DELTA => {
                    for op in decode_ops(&frame.payload)? {
                        match op {
                            WireOp::Copy { index } => {
                                let start = index as usize * block_size as usize;
                                let end = (start + block_size as usize).min(basis.len());
                                let block = basis.get(start..end).filter(|b| !b.is_empty())
                                    .ok_or_else(|| {
                                        Error::aborted(format!("copy index {index} out of range"))
                                    })?;
                                hasher.update(block);
                                file.write_all(block)?;
                                matched += block.len() as u64;
                                written += block.len() as u64;
                            }
                            WireOp::Literal { data } => {
                                hasher.update(&data);
                                file.write_all(&data)?;
                                literal += data.len() as u64;
                                written += data.len() as u64;
                            }
                        }
                    }
                }
                frame_type::END_FILE => break EndFile::decode(&frame.payload)?,
                other => {
                    return Err(Error::aborted(format!(
                        "unexpected frame {other} in delta stream"
                    )));
                }
            }
        };

        if end.skipped {
            warn!("{} skipped by sender", info.path);
            return Ok((0, 0));
        }
        let actual = ContentHash::from_raw(*hasher.finalize().as_bytes());
        if actual != end.file_hash || written != end.file_size {
            return Err(Error::aborted(format!(
                "file {} failed reconstruction",
                info.path
            )));
        }
        file.sync_data()?;
        drop(file);
        apply_metadata(&tmp, info.mode, Some(info.mtime))?;
        std::fs::rename(&tmp, &dest)?;
        guard.defuse();
        Ok((literal, matched))
    }

}

/// Skip compression-window control frames, which the pump surfaces
fn next_frame<S: Read + Write>(pump: &mut MessagePump<S>) -> Result<Frame> {
    loop {
        let frame = pump.recv()?;
        if frame.ty == frame_type::START_COMPRESSION || frame.ty == frame_type::STOP_COMPRESSION {
            continue;
        }
        if frame.ty == frame_type::ERROR {
            return Err(cdcsync_core::pump::decode_error(&frame.payload));
        }
        return Ok(frame);
    }
}

/// Sidecar temp path next to the final destination
fn temp_path(dest: &Path) -> PathBuf {
    let name = dest.file_name().map_or_else(
        || ".cdcsync-tmp".to_string(),
        |n| format!(".{}.cdcsync-tmp", n.to_string_lossy()),
    );
    dest.with_file_name(name)
}

/// Removes the temp file unless defused
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Reject wire paths that could escape the destination root
fn sanitize(wire: &str) -> Result<PathBuf> {
    if wire.is_empty() || wire.starts_with('/') {
        return Err(Error::invalid_argument(format!("bad path {wire:?}")));
    }
    let path = PathBuf::from(wire);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return Err(Error::invalid_argument(format!("bad path {wire:?}"))),
        }
    }
    Ok(path)
}
