//! C10 Watcher: bridges filesystem change notifications into
//! [`crate::coordinator::WatchEvent`]s for incremental re-indexing. New
//! module — the teacher re-scans the whole tree on every search instead of
//! watching. Built on `notify` + `notify-debouncer-mini`, the combination
//! attested across the pack's file-watching crates.

use crate::coordinator::WatchEvent;
use crate::error::CoreError;
use crossbeam_channel::{Receiver, Sender};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent, DebouncedEventKind};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self { debounce: Duration::from_millis(200) }
    }
}

/// Owns the OS-level watch subscription and its debouncer. Dropping this
/// struct stops the watch. `subscribe` must succeed within a caller-enforced
/// deadline (spec.md §4.10) — a failed subscription is surfaced immediately
/// rather than silently degrading to no watching at all.
pub struct Watcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    events: Receiver<WatchEvent>,
}

impl Watcher {
    pub fn subscribe(root: &Path, options: WatcherOptions) -> Result<Self, CoreError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let root_owned = root.to_path_buf();

        let mut debouncer = new_debouncer(options.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => emit(&root_owned, events, &tx),
                Err(e) => tracing::warn!(error = ?e, "filesystem watch error"),
            }
        })
        .map_err(|e| CoreError::InvalidInput(format!("failed to start filesystem watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)
            .map_err(|e| CoreError::InvalidInput(format!("failed to subscribe to {}: {e}", root.display())))?;

        Ok(Self { _debouncer: debouncer, events: rx })
    }

    /// The channel the Coordinator (or server loop) drains to pick up
    /// debounced change events.
    pub fn events(&self) -> &Receiver<WatchEvent> {
        &self.events
    }
}

fn emit(root: &Path, events: Vec<DebouncedEvent>, tx: &Sender<WatchEvent>) {
    for event in events {
        let Some(relative) = relativize(root, &event.path) else { continue };
        let watch_event = match event.kind {
            DebouncedEventKind::Any if event.path.exists() => {
                if is_new(&event.path) {
                    WatchEvent::Created(relative)
                } else {
                    WatchEvent::Modified(relative)
                }
            }
            DebouncedEventKind::Any => WatchEvent::Removed(relative),
            DebouncedEventKind::AnyContinuous => WatchEvent::Modified(relative),
            _ => WatchEvent::Modified(relative),
        };
        let _ = tx.send(watch_event);
    }
}

fn relativize(root: &Path, path: &Path) -> Option<String> {
    pathdiff::diff_paths(path, root).map(|p| p.to_string_lossy().replace('\\', "/"))
}

/// Heuristic: a file whose metadata creation time is within the debounce
/// window of "now" is treated as newly created rather than modified. Both
/// paths converge on the same Coordinator handling anyway, so this only
/// affects log/telemetry framing, never correctness.
fn is_new(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.created())
        .ok()
        .and_then(|created| created.elapsed().ok())
        .map(|elapsed| elapsed < Duration::from_secs(2))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    #[test]
    fn subscribe_then_create_file_emits_event() {
        let dir = tempdir().unwrap();
        let watcher = Watcher::subscribe(dir.path(), WatcherOptions { debounce: StdDuration::from_millis(50) }).unwrap();

        std::fs::write(dir.path().join("new_file.rs"), "fn a() {}").unwrap();

        let event = watcher.events().recv_timeout(StdDuration::from_secs(5));
        assert!(event.is_ok());
    }

    #[test]
    fn relativize_normalizes_path_separators() {
        let root = Path::new("/tmp/project");
        let path = Path::new("/tmp/project/src/main.rs");
        assert_eq!(relativize(root, path), Some("src/main.rs".to_string()));
    }
}
