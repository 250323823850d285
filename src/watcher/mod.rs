// File system watcher feeding the incremental indexer
//
// notify events are filtered by supported extension and ignore globs,
// debounced into batches, and handed to `IncrementalIndexer`. The watcher
// owns a worker thread; dropping it stops the loop.

pub mod events;

use crate::config::Config;
use crate::errors::{CodexLensError, Result};
use crate::index::IncrementalIndexer;
use events::{ChangeType, FileEvent};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(400);

pub struct IndexWatcher {
    stop_flag: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
    // Kept alive for the watcher's lifetime; dropping unregisters paths.
    _watcher: notify::RecommendedWatcher,
}

impl IndexWatcher {
    /// Watch `root` recursively and stream batches into `indexer`.
    pub fn start(
        root: &Path,
        config: &Config,
        indexer: Arc<IncrementalIndexer>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Event>();

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!("Watch error: {e}"),
            })
            .map_err(|e| CodexLensError::storage(format!("watcher init failed: {e}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| CodexLensError::storage(format!("watch failed: {e}")))?;

        let supported: HashSet<String> = config.supported_languages.keys().cloned().collect();
        let ignore_patterns = ignore_globs(root);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = stop_flag.clone();

        let worker = std::thread::spawn(move || {
            debounce_loop(&rx, &stop, &supported, &ignore_patterns, &indexer);
        });

        info!("Watching {} for changes", root.display());
        Ok(Self {
            stop_flag,
            worker: Some(worker),
            _watcher: watcher,
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for IndexWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ignore_globs(root: &Path) -> Vec<glob::Pattern> {
    crate::index::tree_builder::IGNORE_DIRS
        .iter()
        .filter_map(|dir| {
            glob::Pattern::new(&format!("{}/**/{dir}/**", root.to_string_lossy())).ok()
        })
        .collect()
}

fn debounce_loop(
    rx: &mpsc::Receiver<Event>,
    stop: &AtomicBool,
    supported: &HashSet<String>,
    ignore_patterns: &[glob::Pattern],
    indexer: &IncrementalIndexer,
) {
    let mut pending: Vec<FileEvent> = Vec::new();

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match rx.recv_timeout(DEBOUNCE_WINDOW) {
            Ok(event) => {
                collect_events(&event, supported, ignore_patterns, &mut pending);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if !pending.is_empty() {
                    let batch = dedupe_batch(std::mem::take(&mut pending));
                    debug!("Processing {} debounced file events", batch.len());
                    let result = indexer.process_changes(&batch);
                    for error in &result.errors {
                        warn!("Incremental index error: {error}");
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn collect_events(
    event: &Event,
    supported: &HashSet<String>,
    ignore_patterns: &[glob::Pattern],
    pending: &mut Vec<FileEvent>,
) {
    let change_type = match event.kind {
        EventKind::Create(_) => ChangeType::Created,
        EventKind::Modify(_) => ChangeType::Modified,
        EventKind::Remove(_) => ChangeType::Deleted,
        _ => return,
    };

    for path in &event.paths {
        if !should_track(path, change_type, supported, ignore_patterns) {
            continue;
        }
        pending.push(FileEvent::new(path.clone(), change_type));
    }
}

fn should_track(
    path: &PathBuf,
    change_type: ChangeType,
    supported: &HashSet<String>,
    ignore_patterns: &[glob::Pattern],
) -> bool {
    // Deleted paths no longer exist; everything else must be a file.
    if change_type != ChangeType::Deleted && !path.is_file() {
        return false;
    }

    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !supported.contains(&ext.to_ascii_lowercase()) {
        return false;
    }

    let path_str = path.to_string_lossy();
    !ignore_patterns.iter().any(|p| p.matches(&path_str))
}

/// Keep the last event per path: a create followed by modifies collapses
/// into one upsert, and a delete wins over anything before it.
fn dedupe_batch(batch: Vec<FileEvent>) -> Vec<FileEvent> {
    let mut latest: Vec<FileEvent> = Vec::new();
    for event in batch {
        latest.retain(|existing| existing.path != event.path);
        latest.push(event);
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_dedupe_keeps_the_last_event_per_path() {
        let batch = vec![
            FileEvent::new("/src/a.py", ChangeType::Created),
            FileEvent::new("/src/a.py", ChangeType::Modified),
            FileEvent::new("/src/b.py", ChangeType::Modified),
            FileEvent::new("/src/a.py", ChangeType::Deleted),
        ];

        let deduped = dedupe_batch(batch);
        assert_eq!(deduped.len(), 2);

        let a = deduped.iter().find(|e| e.path.ends_with("a.py")).unwrap();
        assert_eq!(a.change_type, ChangeType::Deleted);
    }

    #[test]
    fn unsupported_extensions_are_ignored() {
        let supported: HashSet<String> = ["py".to_string()].into_iter().collect();
        assert!(!should_track(
            &PathBuf::from("/src/readme.txt"),
            ChangeType::Deleted,
            &supported,
            &[],
        ));
        assert!(should_track(
            &PathBuf::from("/src/gone.py"),
            ChangeType::Deleted,
            &supported,
            &[],
        ));
    }
}
