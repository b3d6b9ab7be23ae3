//! End-to-end client/server sync over a loopback socket.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};

use cdcsync_core::FilterRule;
use cdcsync_sync::{Summary, SyncClient, SyncOptions, SyncReport, SyncServer};

fn random_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Run one sync conversation over a real socket pair
fn run_sync(options: SyncOptions, sources: Vec<PathBuf>, dest: &Path) -> (SyncReport, Summary) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let dest = dest.to_path_buf();

    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        SyncServer::new(dest).serve(stream).unwrap()
    });

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let client = SyncClient::new(options, sources).unwrap();
    let report = client.run(stream).unwrap();
    let server_summary = server_thread.join().unwrap();
    (report, server_summary)
}

/// Source path with contents semantics (trailing slash)
fn contents_of(dir: &Path) -> PathBuf {
    PathBuf::from(format!("{}/", dir.display()))
}

/// Push a file's mtime into the past so the quick check sees it as stale
fn set_old_mtime(path: &Path) {
    let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(old)
        .unwrap();
}

fn assert_file_eq(a: &Path, b: &Path) {
    assert_eq!(
        std::fs::read(a).unwrap(),
        std::fs::read(b).unwrap(),
        "{} != {}",
        a.display(),
        b.display()
    );
}

#[test]
fn fresh_sync_copies_tree() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("top.txt"), "top").unwrap();
    std::fs::create_dir_all(src.path().join("sub/deep")).unwrap();
    std::fs::write(src.path().join("sub/mid.bin"), random_bytes(10_000, 1)).unwrap();
    std::fs::write(src.path().join("sub/deep/leaf"), "leaf").unwrap();

    let options = SyncOptions {
        recursive: true,
        ..SyncOptions::default()
    };
    let (report, server_summary) = run_sync(options, vec![contents_of(src.path())], dst.path());

    assert_eq!(report.summary.files_missing, 3);
    assert_eq!(server_summary.files_missing, 3);
    for rel in ["top.txt", "sub/mid.bin", "sub/deep/leaf"] {
        assert_file_eq(&src.path().join(rel), &dst.path().join(rel));
    }
}

#[test]
fn delta_sync_sends_few_literals() {
    // A 3 MiB file with a 100-byte damaged window: literal traffic stays
    // within the damage plus one block either side.
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let content = random_bytes(3 * 1024 * 1024, 7);
    std::fs::write(src.path().join("x"), &content).unwrap();

    let mut stale = content.clone();
    for byte in &mut stale[1_000_000..1_000_100] {
        *byte = 0;
    }
    std::fs::write(dst.path().join("x"), &stale).unwrap();
    set_old_mtime(&dst.path().join("x"));

    let (report, _server) = run_sync(
        SyncOptions::default(),
        vec![src.path().join("x")],
        dst.path(),
    );

    assert_eq!(report.summary.files_changed, 1);
    let block_size =
        u64::from(cdcsync_core::delta::block_size_for(content.len() as u64));
    assert!(
        report.summary.literal_bytes <= 100 + 2 * block_size,
        "sent {} literal bytes",
        report.summary.literal_bytes
    );
    assert_file_eq(&src.path().join("x"), &dst.path().join("x"));
}

#[test]
fn second_sync_is_all_unchanged() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), "alpha").unwrap();
    std::fs::write(src.path().join("b"), random_bytes(5000, 2)).unwrap();

    let options = SyncOptions {
        recursive: true,
        ..SyncOptions::default()
    };
    run_sync(options.clone(), vec![contents_of(src.path())], dst.path());
    let (report, _server) = run_sync(options, vec![contents_of(src.path())], dst.path());

    assert_eq!(report.summary.files_missing, 0);
    assert_eq!(report.summary.files_changed, 0);
    assert_eq!(report.summary.files_unchanged, 2);
}

#[test]
fn dry_run_reports_without_touching_destination() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("new.txt"), "would copy").unwrap();

    let options = SyncOptions {
        recursive: true,
        dry_run: true,
        ..SyncOptions::default()
    };
    let (report, server_summary) = run_sync(options, vec![contents_of(src.path())], dst.path());

    assert!(report.summary.dry_run);
    assert_eq!(report.summary.files_missing, 1);
    assert!(server_summary.dry_run);
    assert!(!dst.path().join("new.txt").exists());
    assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
}

#[test]
fn delete_removes_extraneous() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("keep"), "keep").unwrap();
    std::fs::write(dst.path().join("keep"), "keep-stale").unwrap();
    std::fs::write(dst.path().join("stray"), "stray").unwrap();
    std::fs::create_dir(dst.path().join("dead-dir")).unwrap();
    std::fs::write(dst.path().join("dead-dir/inner"), "x").unwrap();

    let options = SyncOptions {
        recursive: true,
        delete: true,
        ..SyncOptions::default()
    };
    let (report, _server) = run_sync(options, vec![contents_of(src.path())], dst.path());

    assert!(report.summary.files_deleted >= 2);
    assert!(dst.path().join("keep").exists());
    assert!(!dst.path().join("stray").exists());
    assert!(!dst.path().join("dead-dir").exists());
    assert_file_eq(&src.path().join("keep"), &dst.path().join("keep"));
}

#[test]
fn filter_rules_apply_in_order() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.dat", "c.exe", "d.md"] {
        std::fs::write(src.path().join(name), name).unwrap();
    }

    let options = SyncOptions {
        recursive: true,
        rules: vec![
            FilterRule::include("*.txt"),
            FilterRule::exclude("*.dat"),
            FilterRule::include("*.exe"),
        ],
        ..SyncOptions::default()
    };
    run_sync(options, vec![contents_of(src.path())], dst.path());

    assert!(dst.path().join("a.txt").exists());
    assert!(dst.path().join("c.exe").exists());
    assert!(!dst.path().join("b.dat").exists());
    assert!(!dst.path().join("d.md").exists());
}

#[test]
fn compressed_sync_matches_plain() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("bulk"), b"pattern ".repeat(100_000)).unwrap();
    std::fs::write(src.path().join("rand"), random_bytes(200_000, 3)).unwrap();

    let options = SyncOptions {
        recursive: true,
        compress: true,
        compress_level: 6,
        ..SyncOptions::default()
    };
    run_sync(options, vec![contents_of(src.path())], dst.path());

    assert_file_eq(&src.path().join("bulk"), &dst.path().join("bulk"));
    assert_file_eq(&src.path().join("rand"), &dst.path().join("rand"));
}

#[test]
fn checksum_catches_silent_content_change() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), "new contents!").unwrap();
    std::fs::write(dst.path().join("f"), "old contents!").unwrap();
    // Same size; align mtimes so the quick check would call them equal.
    let mtime = std::fs::metadata(src.path().join("f")).unwrap().modified().unwrap();
    std::fs::File::options()
        .write(true)
        .open(dst.path().join("f"))
        .unwrap()
        .set_modified(mtime)
        .unwrap();

    let quick = SyncOptions {
        recursive: true,
        ..SyncOptions::default()
    };
    let (report, _server) = run_sync(quick, vec![contents_of(src.path())], dst.path());
    assert_eq!(report.summary.files_unchanged, 1, "quick check is fooled");

    let thorough = SyncOptions {
        recursive: true,
        checksum: true,
        ..SyncOptions::default()
    };
    let (report, _server) = run_sync(thorough, vec![contents_of(src.path())], dst.path());
    assert_eq!(report.summary.files_changed, 1);
    assert_file_eq(&src.path().join("f"), &dst.path().join("f"));
}

#[test]
fn whole_file_skips_delta() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let content = random_bytes(100_000, 11);
    std::fs::write(src.path().join("f"), &content).unwrap();
    let mut stale = content.clone();
    stale[50] ^= 0xff;
    std::fs::write(dst.path().join("f"), &stale).unwrap();
    set_old_mtime(&dst.path().join("f"));

    let options = SyncOptions {
        whole_file: true,
        ..SyncOptions::default()
    };
    let (report, _server) = run_sync(options, vec![src.path().join("f")], dst.path());

    // The changed file travelled whole, not as a delta.
    assert_eq!(report.summary.files_missing, 1);
    assert_eq!(report.summary.literal_bytes, 0);
    assert_eq!(report.summary.data_bytes, content.len() as u64);
    assert_file_eq(&src.path().join("f"), &dst.path().join("f"));
}

#[test]
fn existing_only_updates() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("present"), "fresh").unwrap();
    std::fs::write(src.path().join("absent"), "never lands").unwrap();
    std::fs::write(dst.path().join("present"), "stale!").unwrap();

    let options = SyncOptions {
        recursive: true,
        existing: true,
        ..SyncOptions::default()
    };
    run_sync(options, vec![contents_of(src.path())], dst.path());

    assert_file_eq(&src.path().join("present"), &dst.path().join("present"));
    assert!(!dst.path().join("absent").exists());
}

#[test]
fn copy_dest_avoids_retransfer() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let base = tempfile::tempdir().unwrap();
    let content = random_bytes(50_000, 13);
    std::fs::write(src.path().join("big"), &content).unwrap();
    std::fs::write(base.path().join("big"), &content).unwrap();
    let mtime = std::fs::metadata(src.path().join("big")).unwrap().modified().unwrap();
    std::fs::File::options()
        .write(true)
        .open(base.path().join("big"))
        .unwrap()
        .set_modified(mtime)
        .unwrap();

    let options = SyncOptions {
        recursive: true,
        copy_dest: Some(base.path().to_string_lossy().into_owned()),
        ..SyncOptions::default()
    };
    let (report, _server) = run_sync(options, vec![contents_of(src.path())], dst.path());

    // Nothing travelled; the server cloned from the alternate basis.
    assert_eq!(report.summary.data_bytes, 0);
    assert_eq!(report.summary.files_unchanged, 1);
    assert_file_eq(&src.path().join("big"), &dst.path().join("big"));
}

#[test]
fn aborted_transfer_leaves_no_partial_files() {
    // Connect, send a handshake and enumeration, then drop the socket mid
    // phase 4. The destination must contain no temp or partial files.
    use cdcsync_core::pump::frame_type;
    use cdcsync_core::MessagePump;

    let dst = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let dest = dst.path().to_path_buf();
    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        SyncServer::new(dest).serve(stream)
    });

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut pump = MessagePump::new(stream);
    let options = SyncOptions::default();
    pump.send(frame_type::HANDSHAKE, &options.encode()).unwrap();
    pump.expect(frame_type::HANDSHAKE).unwrap();
    let info = cdcsync_sync::messages::FileInfo {
        path: "victim".to_string(),
        size: 1_000_000,
        mtime: 0,
        mode: 0o644,
        checksum: None,
    };
    pump.send(frame_type::FILE_INFO, &info.encode()).unwrap();
    pump.send(frame_type::DONE_ENUM, &[]).unwrap();
    pump.expect(frame_type::FILE_STATS).unwrap();
    pump.expect(frame_type::MISSING_INDICES).unwrap();
    pump.expect(frame_type::CHANGED_INDICES).unwrap();
    // First slice of data, then hang up.
    pump.send(frame_type::FILE_DATA, &[0u8; 4096]).unwrap();
    drop(pump);

    assert!(server_thread.join().unwrap().is_err());
    assert!(!dst.path().join("victim").exists());
    assert_eq!(
        std::fs::read_dir(dst.path()).unwrap().count(),
        0,
        "temp files left behind"
    );
}
