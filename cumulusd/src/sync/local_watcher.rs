use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Fast cadence while notifications are flowing, idle cadence otherwise. A
/// held moved-from entry is resolved as a delete when a full cycle passes
/// without its pair arriving.
const FAST_CYCLE: Duration = Duration::from_millis(100);
const IDLE_CYCLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Added { path: PathBuf, is_dir: bool },
    Modified { path: PathBuf },
    Deleted { path: PathBuf, is_dir: bool },
    Moved { from: PathBuf, to: PathBuf, is_dir: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Created,
    CloseWrite,
    Removed,
    RenameFrom,
    RenameTo,
}

/// One kernel notification, decoded but not yet coalesced. `is_dir` is
/// unknown for renames until the pump resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawNote {
    kind: RawKind,
    path: PathBuf,
    is_dir: Option<bool>,
    token: Option<usize>,
}

#[derive(Debug)]
struct PendingMove {
    from: PathBuf,
    is_dir: bool,
    token: Option<usize>,
}

/// Pairs moved-from/moved-to notifications by correlation token. A rename
/// arrives as two notifications; only an immediately following moved-to
/// with the same token completes the pair.
#[derive(Debug, Default)]
struct RenamePairer {
    pending: Option<PendingMove>,
}

impl RenamePairer {
    fn feed(&mut self, kind: RawKind, path: PathBuf, is_dir: bool, token: Option<usize>) -> Vec<LocalEvent> {
        let mut out = Vec::new();
        if let Some(pending) = self.pending.take() {
            let paired =
                kind == RawKind::RenameTo && token.is_some() && pending.token == token;
            if paired {
                out.push(LocalEvent::Moved {
                    from: pending.from,
                    to: path,
                    is_dir,
                });
                return out;
            }
            // Any other notification first: the held path left the tree.
            out.push(LocalEvent::Deleted {
                path: pending.from,
                is_dir: pending.is_dir,
            });
        }
        match kind {
            RawKind::RenameFrom => {
                self.pending = Some(PendingMove {
                    from: path,
                    is_dir,
                    token,
                });
            }
            // An unpaired moved-to is an arrival from outside the tree.
            RawKind::RenameTo | RawKind::Created => {
                out.push(LocalEvent::Added { path, is_dir });
            }
            RawKind::CloseWrite => out.push(LocalEvent::Modified { path }),
            RawKind::Removed => out.push(LocalEvent::Deleted { path, is_dir }),
        }
        out
    }

    /// Cycle elapsed without the pair; the held entry becomes a delete.
    fn flush(&mut self) -> Option<LocalEvent> {
        self.pending.take().map(|pending| LocalEvent::Deleted {
            path: pending.from,
            is_dir: pending.is_dir,
        })
    }

    fn is_holding(&self) -> bool {
        self.pending.is_some()
    }
}

/// Recursive watcher over the sync root. Construction fails soft: a missing
/// root or an exhausted watch-descriptor budget is logged and the watcher
/// stays inert rather than stopping the daemon.
pub struct LocalWatcher {
    watcher: Option<Arc<Mutex<RecommendedWatcher>>>,
    pump: Option<JoinHandle<()>>,
}

impl LocalWatcher {
    pub fn start(root: &Path) -> (Self, mpsc::UnboundedReceiver<LocalEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let root = root.to_path_buf();

        let watcher = match notify::recommended_watcher(move |outcome: notify::Result<notify::Event>| {
            if let Ok(event) = outcome {
                for note in map_notification(event) {
                    let _ = raw_tx.send(note);
                }
            }
        }) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                eprintln!("[cumulusd] warning: failed to create local watcher: {err}");
                None
            }
        };
        let watcher = watcher.map(|mut watcher| {
            if !root.exists() {
                eprintln!(
                    "[cumulusd] warning: sync root {} does not exist, local watcher is inert",
                    root.display()
                );
            } else if let Err(err) = watcher.watch(&root, RecursiveMode::Recursive) {
                log_watch_failure(&root, &err);
            }
            Arc::new(Mutex::new(watcher))
        });

        let pump = tokio::spawn(pump_notifications(
            root,
            raw_rx,
            event_tx,
            watcher.clone(),
        ));
        (
            Self {
                watcher,
                pump: Some(pump),
            },
            event_rx,
        )
    }

    /// Terminates the watch loop; held moved-from state is discarded
    /// without emitting.
    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.watcher = None;
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump_notifications(
    root: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<RawNote>,
    event_tx: mpsc::UnboundedSender<LocalEvent>,
    watcher: Option<Arc<Mutex<RecommendedWatcher>>>,
) {
    let mut pairer = RenamePairer::default();
    let mut known_dirs = seed_known_dirs(&root);
    let mut cycle = IDLE_CYCLE;
    loop {
        match timeout(cycle, raw_rx.recv()).await {
            Ok(Some(note)) => {
                cycle = FAST_CYCLE;
                let is_dir = note.is_dir.unwrap_or_else(|| {
                    known_dirs.contains(&note.path)
                        || std::fs::metadata(&note.path)
                            .map(|meta| meta.is_dir())
                            .unwrap_or(false)
                });
                for event in pairer.feed(note.kind, note.path, is_dir, note.token) {
                    deliver(event, &mut known_dirs, &watcher, &event_tx);
                }
            }
            Ok(None) => break,
            Err(_) => {
                // Cycle elapsed with no notifications.
                if let Some(event) = pairer.flush() {
                    deliver(event, &mut known_dirs, &watcher, &event_tx);
                }
                if !pairer.is_holding() {
                    cycle = IDLE_CYCLE;
                }
            }
        }
    }
}

fn deliver(
    event: LocalEvent,
    known_dirs: &mut HashSet<PathBuf>,
    watcher: &Option<Arc<Mutex<RecommendedWatcher>>>,
    event_tx: &mpsc::UnboundedSender<LocalEvent>,
) {
    match &event {
        // A new subtree is watched before the event goes out, so children
        // created in the same instant are not missed.
        LocalEvent::Added { path, is_dir: true } => {
            known_dirs.insert(path.clone());
            watch_subtree(watcher, path);
        }
        LocalEvent::Moved {
            from,
            to,
            is_dir: true,
        } => {
            let moved: Vec<PathBuf> = known_dirs
                .iter()
                .filter(|dir| dir.starts_with(from))
                .cloned()
                .collect();
            for dir in moved {
                known_dirs.remove(&dir);
                if let Ok(rest) = dir.strip_prefix(from) {
                    known_dirs.insert(to.join(rest));
                }
            }
            known_dirs.insert(to.clone());
            watch_subtree(watcher, to);
        }
        LocalEvent::Deleted { path, is_dir: true } => {
            known_dirs.retain(|dir| !dir.starts_with(path));
        }
        _ => {}
    }
    let _ = event_tx.send(event);
}

fn watch_subtree(watcher: &Option<Arc<Mutex<RecommendedWatcher>>>, path: &Path) {
    let Some(watcher) = watcher else {
        return;
    };
    if let Ok(mut guard) = watcher.lock() {
        if let Err(err) = guard.watch(path, RecursiveMode::Recursive) {
            log_watch_failure(path, &err);
        }
    }
}

fn log_watch_failure(path: &Path, err: &notify::Error) {
    if matches!(err.kind, notify::ErrorKind::MaxFilesWatch) {
        // Capacity failure: the subtree stays unmonitored until restart.
        eprintln!(
            "[cumulusd] warning: watch limit reached, {} is unmonitored",
            path.display()
        );
    } else {
        eprintln!(
            "[cumulusd] warning: failed to watch {}: {err}",
            path.display()
        );
    }
}

/// Directories currently in the tree; rename-from notifications arrive
/// after the entry is gone, so directory-ness is remembered up front.
fn seed_known_dirs(root: &Path) -> HashSet<PathBuf> {
    let mut dirs = HashSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() && !file_type.is_symlink() {
                let path = entry.path();
                dirs.insert(path.clone());
                stack.push(path);
            }
        }
    }
    dirs
}

fn map_notification(event: notify::Event) -> Vec<RawNote> {
    let token = event.attrs.tracker();
    match event.kind {
        EventKind::Create(create) => {
            let is_dir = match create {
                CreateKind::Folder => Some(true),
                CreateKind::File => Some(false),
                _ => None,
            };
            note_per_path(event.paths, RawKind::Created, is_dir, token)
        }
        EventKind::Remove(remove) => {
            let is_dir = match remove {
                RemoveKind::Folder => Some(true),
                RemoveKind::File => Some(false),
                _ => None,
            };
            note_per_path(event.paths, RawKind::Removed, is_dir, token)
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            note_per_path(event.paths, RawKind::CloseWrite, Some(false), token)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            note_per_path(event.paths, RawKind::RenameFrom, None, token)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            note_per_path(event.paths, RawKind::RenameTo, None, token)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut out = Vec::new();
            if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                out.push(RawNote {
                    kind: RawKind::RenameFrom,
                    path: from,
                    is_dir: None,
                    token,
                });
                out.push(RawNote {
                    kind: RawKind::RenameTo,
                    path: to,
                    is_dir: None,
                    token,
                });
            }
            out
        }
        _ => Vec::new(),
    }
}

fn note_per_path(
    paths: Vec<PathBuf>,
    kind: RawKind,
    is_dir: Option<bool>,
    token: Option<usize>,
) -> Vec<RawNote> {
    paths
        .into_iter()
        .map(|path| RawNote {
            kind,
            path,
            is_dir,
            token,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold_move_from(pairer: &mut RenamePairer, path: &str, is_dir: bool, token: usize) {
        let held = pairer.feed(RawKind::RenameFrom, PathBuf::from(path), is_dir, Some(token));
        assert!(held.is_empty());
    }

    #[test]
    fn paired_rename_yields_a_single_move() {
        let mut pairer = RenamePairer::default();
        hold_move_from(&mut pairer, "/root/A", false, 7);

        let events = pairer.feed(RawKind::RenameTo, PathBuf::from("/root/B"), false, Some(7));
        assert_eq!(
            events,
            vec![LocalEvent::Moved {
                from: PathBuf::from("/root/A"),
                to: PathBuf::from("/root/B"),
                is_dir: false,
            }]
        );
        assert!(!pairer.is_holding());
    }

    #[test]
    fn interleaved_event_resolves_hold_as_delete() {
        let mut pairer = RenamePairer::default();
        hold_move_from(&mut pairer, "/root/A", false, 7);

        let events = pairer.feed(RawKind::Created, PathBuf::from("/root/C"), false, None);
        assert_eq!(
            events,
            vec![
                LocalEvent::Deleted {
                    path: PathBuf::from("/root/A"),
                    is_dir: false,
                },
                LocalEvent::Added {
                    path: PathBuf::from("/root/C"),
                    is_dir: false,
                },
            ]
        );
    }

    #[test]
    fn mismatched_token_does_not_pair() {
        let mut pairer = RenamePairer::default();
        hold_move_from(&mut pairer, "/root/A", false, 7);

        let events = pairer.feed(RawKind::RenameTo, PathBuf::from("/root/B"), false, Some(9));
        assert_eq!(
            events,
            vec![
                LocalEvent::Deleted {
                    path: PathBuf::from("/root/A"),
                    is_dir: false,
                },
                LocalEvent::Added {
                    path: PathBuf::from("/root/B"),
                    is_dir: false,
                },
            ]
        );
    }

    #[test]
    fn cycle_timeout_resolves_hold_as_delete() {
        let mut pairer = RenamePairer::default();
        hold_move_from(&mut pairer, "/root/dir", true, 3);

        assert_eq!(
            pairer.flush(),
            Some(LocalEvent::Deleted {
                path: PathBuf::from("/root/dir"),
                is_dir: true,
            })
        );
        assert_eq!(pairer.flush(), None);
    }

    #[test]
    fn unpaired_moved_to_is_an_arrival() {
        let mut pairer = RenamePairer::default();
        let events = pairer.feed(RawKind::RenameTo, PathBuf::from("/root/new"), true, Some(4));
        assert_eq!(
            events,
            vec![LocalEvent::Added {
                path: PathBuf::from("/root/new"),
                is_dir: true,
            }]
        );
    }

    #[test]
    fn close_write_maps_to_modified() {
        let mut pairer = RenamePairer::default();
        let events = pairer.feed(
            RawKind::CloseWrite,
            PathBuf::from("/root/a.txt"),
            false,
            None,
        );
        assert_eq!(
            events,
            vec![LocalEvent::Modified {
                path: PathBuf::from("/root/a.txt"),
            }]
        );
    }

    #[test]
    fn rename_both_decodes_into_a_pair() {
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/root/A"), PathBuf::from("/root/B")],
            attrs: Default::default(),
        };
        let notes = map_notification(event);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].kind, RawKind::RenameFrom);
        assert_eq!(notes[1].kind, RawKind::RenameTo);
    }
}
