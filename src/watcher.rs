/// Debounced watcher over the two compared files.
///
/// Filesystem notifications arrive in bursts: editors write several times,
/// and atomic-save patterns delete and recreate the file. Both watched paths
/// feed one shared debounce timer, so any burst of events collapses to a
/// single callback fired once the files have been quiet for the debounce
/// interval.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Debounce timer resolution.
const TICK: Duration = Duration::from_millis(25);

/// Errors raised when setting up the watch.
#[derive(Debug)]
pub enum WatchError {
    /// The containing directory of a watched path cannot be resolved.
    Config { path: PathBuf, message: String },
    /// The underlying filesystem watcher failed.
    Notify { source: notify::Error },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Config { path, message } => {
                write!(f, "cannot watch {}: {}", path.display(), message)
            }
            WatchError::Notify { source } => write!(f, "file watcher failed: {source}"),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Config { .. } => None,
            WatchError::Notify { source } => Some(source),
        }
    }
}

/// Watches two files and fires one debounced callback per burst of changes.
pub struct ChangeWatcher {
    watcher: Option<RecommendedWatcher>,
    stop: Arc<AtomicBool>,
    debounce_thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching both paths. `on_changed` fires on a background thread
    /// `debounce` after the last event of each burst; it must be cheap and
    /// non-blocking (the session passes a flag setter).
    pub fn start(
        path1: &Path,
        path2: &Path,
        debounce: Duration,
        on_changed: impl Fn() + Send + 'static,
    ) -> Result<Self, WatchError> {
        let mut targets = Vec::new();
        let mut directories = Vec::new();
        for path in [path1, path2] {
            let (directory, target) = resolve_watch_target(path)?;
            if !directories.contains(&directory) {
                directories.push(directory);
            }
            targets.push(target);
        }

        let last_event: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        // notify delivers events on its own thread; the handler only stamps
        // the shared debounce slot.
        let slot = Arc::clone(&last_event);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if is_relevant(&event, &targets) {
                        *slot.lock().unwrap() = Some(Instant::now());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| WatchError::Notify { source: e })?;

        for directory in &directories {
            watcher
                .watch(directory, RecursiveMode::NonRecursive)
                .map_err(|e| WatchError::Notify { source: e })?;
            tracing::debug!(directory = %directory.display(), "watching directory");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let debounce_thread = std::thread::spawn(move || {
            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let fire = {
                    let mut slot = last_event.lock().unwrap();
                    match *slot {
                        Some(stamped) if stamped.elapsed() >= debounce => {
                            *slot = None;
                            true
                        }
                        _ => false,
                    }
                };
                if fire {
                    tracing::debug!("debounced file change");
                    on_changed();
                }
                std::thread::sleep(TICK);
            }
        });

        Ok(Self {
            watcher: Some(watcher),
            stop,
            debounce_thread: Some(debounce_thread),
        })
    }

    /// Stop watching. No callback fires after this returns: the filesystem
    /// watcher is dropped first, then the debounce thread is joined.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.watcher.take());
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.debounce_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve a watched path to (canonical containing directory, canonical file
/// path). Watching the directory rather than the file keeps delete+recreate
/// and rename-over save patterns visible.
fn resolve_watch_target(path: &Path) -> Result<(PathBuf, PathBuf), WatchError> {
    let file_name = path.file_name().ok_or_else(|| WatchError::Config {
        path: path.to_path_buf(),
        message: "path has no file name".to_string(),
    })?;
    let parent = match path.parent() {
        None => {
            return Err(WatchError::Config {
                path: path.to_path_buf(),
                message: "containing directory cannot be resolved".to_string(),
            })
        }
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
    };
    let directory = parent.canonicalize().map_err(|e| WatchError::Config {
        path: path.to_path_buf(),
        message: format!("containing directory cannot be resolved: {e}"),
    })?;
    let target = directory.join(file_name);
    Ok((directory, target))
}

/// Writes, metadata updates, renames onto the file, and deletions all count
/// as changes; reads do not.
fn is_relevant(event: &Event, targets: &[PathBuf]) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| targets.iter().any(|t| t == p))
}
