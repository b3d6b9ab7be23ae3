//! Recursive filesystem watcher feeding the manifest updater.
//!
//! Events are advisory; the updater re-stats everything. Bursts on the same
//! path are coalesced by the debouncer (20 ms), and a kernel-queue overflow
//! turns into a single `Overflow` event so the updater can fall back to a
//! full rescan.

use std::path::Path;
use std::sync::mpsc::Sender;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tracing::{debug, warn};

use cdcsync_core::{ChangeEvent, Error, Result};

/// Same-path coalescing window
const DEBOUNCE: Duration = Duration::from_millis(20);

/// Owns the OS watcher; dropping it stops the event flow.
pub struct Watcher {
    // Kept alive for its Drop side effect
    _debouncer: notify_debouncer_full::Debouncer<
        notify::RecommendedWatcher,
        notify_debouncer_full::RecommendedCache,
    >,
}

impl Watcher {
    /// Watch `src_dir` recursively, translating debounced notifications into
    /// [`ChangeEvent`]s on `tx`.
    ///
    /// # Errors
    /// Returns `FailedPrecondition` when the OS watcher cannot be installed
    pub fn start(src_dir: &Path, tx: Sender<ChangeEvent>) -> Result<Self> {
        let event_tx = tx.clone();
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        for change in translate(&event.event) {
                            if event_tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    warn!("watcher errors: {errors:?}");
                    let _ = event_tx.send(ChangeEvent::Overflow);
                }
            }
        })
        .map_err(|e| Error::failed_precondition("cannot create watcher").with_source(e))?;

        debouncer
            .watch(src_dir, RecursiveMode::Recursive)
            .map_err(|e| {
                Error::failed_precondition(format!("cannot watch {}", src_dir.display()))
                    .with_source(e)
            })?;
        debug!("watching {}", src_dir.display());

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Map a notify event onto our change vocabulary
fn translate(event: &notify::Event) -> Vec<ChangeEvent> {
    use notify::EventKind;
    use notify::event::{ModifyKind, RenameMode};

    if event.need_rescan() {
        return vec![ChangeEvent::Overflow];
    }

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Created(p.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Deleted(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![ChangeEvent::Renamed {
                from: event.paths[0].clone(),
                to: event.paths[1].clone(),
            }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Deleted(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Created(p.clone()))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Modified(p.clone()))
            .collect(),
        EventKind::Access(_) => Vec::new(),
        _ => event
            .paths
            .iter()
            .map(|p| ChangeEvent::Modified(p.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn event(kind: notify::EventKind, paths: &[&str]) -> notify::Event {
        let mut ev = notify::Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    #[test]
    fn test_translate_create_and_remove() {
        use notify::event::{CreateKind, RemoveKind};
        let created = translate(&event(
            notify::EventKind::Create(CreateKind::File),
            &["/src/a"],
        ));
        assert_eq!(created, vec![ChangeEvent::Created(PathBuf::from("/src/a"))]);

        let removed = translate(&event(
            notify::EventKind::Remove(RemoveKind::File),
            &["/src/a"],
        ));
        assert_eq!(removed, vec![ChangeEvent::Deleted(PathBuf::from("/src/a"))]);
    }

    #[test]
    fn test_translate_rename_pair() {
        use notify::event::{ModifyKind, RenameMode};
        let renamed = translate(&event(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/src/old", "/src/new"],
        ));
        assert_eq!(
            renamed,
            vec![ChangeEvent::Renamed {
                from: PathBuf::from("/src/old"),
                to: PathBuf::from("/src/new"),
            }]
        );
    }

    #[test]
    fn test_translate_access_is_noise() {
        use notify::event::AccessKind;
        let none = translate(&event(
            notify::EventKind::Access(AccessKind::Read),
            &["/src/a"],
        ));
        assert!(none.is_empty());
    }

    #[test]
    fn test_rescan_flag_becomes_overflow() {
        use notify::event::Flag;
        let ev = notify::Event::new(notify::EventKind::Any).set_flag(Flag::Rescan);
        assert_eq!(translate(&ev), vec![ChangeEvent::Overflow]);
    }

    #[test]
    fn test_watch_delivers_events() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let _watcher = Watcher::start(dir.path(), tx).unwrap();

        std::fs::write(dir.path().join("born"), "x").unwrap();

        // The debouncer flushes after its window; allow generous slack.
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let path = match event {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) => p,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(path.ends_with("born"));
    }
}
