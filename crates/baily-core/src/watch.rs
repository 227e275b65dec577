//! File watcher feeding the HMR engine.
//!
//! Subscribes to add/change/unlink events across the project root and any
//! configured extra roots, filters ignored paths, and coalesces bursts
//! within a short window so one editor save produces one propagation.

use crate::error::{Error, Result};
use crate::hmr::{FileEventKind, HmrEngine};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Event coalescing window. Mid-range of what rapid and slow editors need.
const COALESCE_WINDOW_MS: u64 = 50;

/// Directories no project ever wants watched.
const DEFAULT_IGNORES: &[&str] = &[
    "/node_modules/",
    "/.git/",
    "/.baily/",
    "/dist/",
    "/target/",
];

/// One filtered, kind-mapped watcher event.
#[derive(Debug, Clone)]
struct WatchEvent {
    paths: Vec<PathBuf>,
    kind: FileEventKind,
}

/// Running watcher; dropping it stops both the OS watcher and the
/// processing task.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
        info!("file watcher stopped");
    }
}

/// Start watching `roots` recursively, driving `engine` with coalesced
/// events.
///
/// # Errors
/// Fails when a root is invalid or the OS watcher cannot be created.
pub fn start_watcher(
    roots: &[PathBuf],
    extra_ignores: Vec<String>,
    engine: Arc<HmrEngine>,
) -> Result<WatcherHandle> {
    for root in roots {
        if !root.is_dir() {
            return Err(Error::other(format!(
                "invalid watch root: {}",
                root.display()
            )));
        }
    }

    let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();
    let ignores = extra_ignores;

    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                let Some(kind) = map_event_kind(&event.kind) else {
                    return;
                };
                let paths: Vec<PathBuf> = event
                    .paths
                    .iter()
                    .filter(|p| !should_ignore(p, &ignores))
                    .cloned()
                    .collect();
                if paths.is_empty() {
                    return;
                }
                let _ = tx.send(WatchEvent { paths, kind });
            }
            Err(e) => {
                // Watcher glitches are warnings, never fatal.
                error!(error = %e, "watch error");
            }
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::other(format!("failed to create watcher: {e}")))?;

    for root in roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::other(format!("failed to watch {}: {e}", root.display())))?;
        info!(root = %root.display(), "watching directory");
    }

    let task = tokio::spawn(async move {
        process_events(rx, move |path, kind| {
            engine.on_file_event(path, kind);
        })
        .await;
    });

    Ok(WatcherHandle {
        _watcher: watcher,
        task,
    })
}

/// Drain the event channel, merging events inside the coalescing window
/// and dispatching each unique path once per quiet period.
async fn process_events(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    on_event: impl Fn(&Path, FileEventKind),
) {
    let mut pending: HashMap<PathBuf, FileEventKind> = HashMap::new();

    loop {
        let next =
            tokio::time::timeout(Duration::from_millis(COALESCE_WINDOW_MS), rx.recv()).await;

        match next {
            Ok(Some(event)) => {
                for path in event.paths {
                    // Within one window the strongest event wins: a remove
                    // supersedes edits, a create supersedes a remove seen
                    // earlier in the same save (editor rename dance).
                    pending
                        .entry(path)
                        .and_modify(|existing| {
                            *existing = merge_kinds(*existing, event.kind);
                        })
                        .or_insert(event.kind);
                }
            }
            Ok(None) => {
                debug!("watch event channel closed");
                break;
            }
            Err(_) => {
                if pending.is_empty() {
                    continue;
                }
                let batch: Vec<(PathBuf, FileEventKind)> = pending.drain().collect();
                debug!(count = batch.len(), "processing coalesced file events");
                for (path, kind) in batch {
                    on_event(&path, kind);
                }
            }
        }
    }
}

/// Later events in one window generally describe the file's final state.
fn merge_kinds(earlier: FileEventKind, later: FileEventKind) -> FileEventKind {
    match (earlier, later) {
        // A file created then edited in one window is still "new".
        (FileEventKind::Add, FileEventKind::Change) => FileEventKind::Add,
        _ => later,
    }
}

fn map_event_kind(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(CreateKind::File) => Some(FileEventKind::Add),
        EventKind::Modify(ModifyKind::Data(_)) => Some(FileEventKind::Change),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FileEventKind::Add),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FileEventKind::Unlink),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some(FileEventKind::Change),
        EventKind::Remove(RemoveKind::File) => Some(FileEventKind::Unlink),
        _ => None,
    }
}

/// Filter for paths the watcher never reports.
fn should_ignore(path: &Path, extra: &[String]) -> bool {
    let path_str = path.to_string_lossy();

    if DEFAULT_IGNORES.iter().any(|d| path_str.contains(d)) {
        return true;
    }
    if extra.iter().any(|d| path_str.contains(d.as_str())) {
        return true;
    }

    // Hidden files (editor swap files, lock files).
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_should_ignore_defaults() {
        assert!(should_ignore(
            Path::new("/p/node_modules/react/index.js"),
            &[]
        ));
        assert!(should_ignore(Path::new("/p/.git/HEAD"), &[]));
        assert!(should_ignore(Path::new("/p/.baily/deps/react.js"), &[]));
        assert!(should_ignore(Path::new("/p/src/.main.js.swp"), &[]));
        assert!(!should_ignore(Path::new("/p/src/main.js"), &[]));
    }

    #[test]
    fn test_should_ignore_extra_patterns() {
        let extra = vec!["/generated/".to_string()];
        assert!(should_ignore(Path::new("/p/generated/api.js"), &extra));
        assert!(!should_ignore(Path::new("/p/src/api.js"), &extra));
    }

    #[test]
    fn test_map_event_kind() {
        assert_eq!(
            map_event_kind(&EventKind::Create(CreateKind::File)),
            Some(FileEventKind::Add)
        );
        assert_eq!(
            map_event_kind(&EventKind::Remove(RemoveKind::File)),
            Some(FileEventKind::Unlink)
        );
        assert_eq!(map_event_kind(&EventKind::Other), None);
    }

    #[test]
    fn test_merge_kinds() {
        assert_eq!(
            merge_kinds(FileEventKind::Add, FileEventKind::Change),
            FileEventKind::Add
        );
        assert_eq!(
            merge_kinds(FileEventKind::Change, FileEventKind::Unlink),
            FileEventKind::Unlink
        );
        assert_eq!(
            merge_kinds(FileEventKind::Unlink, FileEventKind::Add),
            FileEventKind::Add
        );
    }

    #[tokio::test]
    async fn test_rapid_events_coalesce_into_one_dispatch() {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();

        let task = tokio::spawn(async move {
            process_events(rx, move |path, _| {
                calls_clone.lock().unwrap().push(path.to_path_buf());
            })
            .await;
        });

        // A rapid editor: three writes to the same file inside one window.
        for _ in 0..3 {
            tx.send(WatchEvent {
                paths: vec![PathBuf::from("/p/src/a.js")],
                kind: FileEventKind::Change,
            })
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(COALESCE_WINDOW_MS * 4)).await;
        assert_eq!(calls.lock().unwrap().len(), 1);

        // A slow editor: a second save after the window closes dispatches
        // again.
        tx.send(WatchEvent {
            paths: vec![PathBuf::from("/p/src/a.js")],
            kind: FileEventKind::Change,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(COALESCE_WINDOW_MS * 4)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);

        drop(tx);
        let _ = task.await;
    }
}
