/// Comparison session lifecycle: launch the viewer through the engine,
/// recover and guard its process, then supervise until it exits, refreshing
/// the comparison whenever the watched files change.
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::discovery;
use crate::engine::{CompareEngine, CompareOptions, EngineError, SourceVisibility};
use crate::guard::ProcessGuard;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::watcher::{ChangeWatcher, WatchError, DEFAULT_DEBOUNCE};

/// How often the supervision loop checks for process exit and pending
/// changes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub path1: PathBuf,
    pub path2: PathBuf,
    /// Hide the source documents in the comparison view.
    pub quiet: bool,
    /// Refresh the comparison when either file changes.
    pub watch: bool,
    /// A viewer process that exits within this window right after launch is
    /// taken for a launcher handing off to an already running instance, not
    /// for the user closing the comparison.
    pub handoff_window: Duration,
}

impl SessionOptions {
    pub fn new(path1: impl Into<PathBuf>, path2: impl Into<PathBuf>) -> Self {
        Self {
            path1: path1.into(),
            path2: path2.into(),
            quiet: false,
            watch: false,
            handoff_window: Duration::from_secs(2),
        }
    }
}

/// Errors that end a session with a non-zero exit. Everything else degrades
/// and is logged.
#[derive(Debug)]
pub enum SessionError {
    /// The external viewer is not installed.
    DependencyMissing { source: EngineError },
    /// The initial comparison could not be built or displayed.
    Launch { message: String },
    /// Watch mode was requested but the watch could not be established.
    Watch { source: WatchError },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::DependencyMissing { source } => write!(f, "{source}"),
            SessionError::Launch { message } => write!(f, "failed to launch: {message}"),
            SessionError::Watch { source } => write!(f, "cannot watch for changes: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::DependencyMissing { source } => Some(source),
            SessionError::Launch { .. } => None,
            SessionError::Watch { source } => Some(source),
        }
    }
}

/// One end-to-end comparison session. Owns the engine, the guard, and the
/// current-artifact slot; everything is released in `teardown` on every
/// exit path.
pub struct ComparisonSession {
    options: SessionOptions,
    engine: Box<dyn CompareEngine>,
    guard: Box<dyn ProcessGuard>,
    coordinator: RefreshCoordinator,
    host_pid: Option<u32>,
    watcher: Option<ChangeWatcher>,
}

impl ComparisonSession {
    pub fn new(
        options: SessionOptions,
        engine: Box<dyn CompareEngine>,
        guard: Box<dyn ProcessGuard>,
    ) -> Self {
        Self {
            options,
            engine,
            guard,
            coordinator: RefreshCoordinator::new(),
            host_pid: None,
            watcher: None,
        }
    }

    /// Run the session to completion. Returns once the viewer exits (or,
    /// degraded, once there is nothing left to supervise).
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let result = self.launch_and_supervise().await;
        self.teardown();
        result
    }

    async fn launch_and_supervise(&mut self) -> Result<(), SessionError> {
        self.engine
            .ensure_available()
            .map_err(|e| SessionError::DependencyMissing { source: e })?;

        let visibility = if self.options.quiet {
            SourceVisibility::None
        } else {
            SourceVisibility::Both
        };
        let compare_options = CompareOptions::default();

        // Snapshot before anything is spawned, so the new viewer instance
        // can be told apart from pre-existing ones.
        let existing = discovery::snapshot(self.engine.executable_name());
        tracing::debug!(
            executable = self.engine.executable_name(),
            instances = existing.len(),
            "pre-launch process snapshot"
        );

        let outcome = self.coordinator.refresh(
            self.engine.as_mut(),
            &self.options.path1,
            &self.options.path2,
            &compare_options,
            visibility,
        );
        if outcome == RefreshOutcome::Failed {
            return Err(SessionError::Launch {
                message: "could not build the initial comparison".to_string(),
            });
        }

        self.resolve_host(&existing);
        if let Some(artifact) = self.coordinator.current() {
            self.engine.bring_to_foreground(artifact);
        }

        let pending = Arc::new(AtomicBool::new(false));
        if self.options.watch {
            let flag = Arc::clone(&pending);
            let watcher = ChangeWatcher::start(
                &self.options.path1,
                &self.options.path2,
                DEFAULT_DEBOUNCE,
                // Runs on the watcher's thread: only flag the change, the
                // poll loop performs the refresh.
                move || flag.store(true, Ordering::SeqCst),
            )
            .map_err(|e| SessionError::Watch { source: e })?;
            self.watcher = Some(watcher);
            tracing::info!("watching source files for changes");
        }

        self.supervise(&pending, &compare_options, visibility).await;
        Ok(())
    }

    /// Correlate the freshly spawned viewer instance and put it under the
    /// guard. Failure here degrades the session, it never aborts it.
    fn resolve_host(&mut self, existing: &HashSet<u32>) {
        let executable = self.engine.executable_name().to_string();
        let mut pid = discovery::find_new(
            &executable,
            existing,
            discovery::DEFAULT_TIMEOUT,
            discovery::DEFAULT_POLL_INTERVAL,
        );
        if pid.is_none() {
            tracing::warn!(executable = %executable, "viewer process not found in time, trying the window handle");
            pid = match self.coordinator.current() {
                Some(artifact) => self.engine.host_pid(artifact),
                None => None,
            };
        }
        match pid {
            Some(pid) => {
                if !self.guard.assign(pid) {
                    tracing::warn!(pid, "viewer could not be placed under the process guard");
                }
                self.host_pid = Some(pid);
                tracing::info!(pid, "supervising viewer process");
            }
            None => {
                tracing::warn!("viewer process unresolved, continuing without process supervision")
            }
        }
    }

    /// Poll loop reconciling the two concurrent facts of a session: "has
    /// the viewer exited" and "is a debounced change pending". Refreshes run
    /// here, on the supervising task, one at a time.
    async fn supervise(
        &mut self,
        pending: &AtomicBool,
        compare_options: &CompareOptions,
        visibility: SourceVisibility,
    ) {
        let started = Instant::now();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            match self.host_pid {
                Some(pid) if !discovery::is_running(pid) => {
                    if started.elapsed() < self.options.handoff_window {
                        tracing::warn!(
                            pid,
                            "viewer exited right after launch, assuming hand-off to an existing instance"
                        );
                        self.host_pid = None;
                        if !self.options.watch {
                            break;
                        }
                    } else {
                        tracing::info!(pid, "viewer exited");
                        break;
                    }
                }
                // Nothing to supervise and nothing to refresh.
                None if !self.options.watch => break,
                _ => {}
            }

            if pending.swap(false, Ordering::SeqCst) {
                tracing::info!("source files changed, rebuilding comparison");
                match self.coordinator.refresh(
                    self.engine.as_mut(),
                    &self.options.path1,
                    &self.options.path2,
                    compare_options,
                    visibility,
                ) {
                    RefreshOutcome::Refreshed => tracing::info!("comparison refreshed"),
                    // Already logged; the old artifact is still displayed.
                    RefreshOutcome::Failed => {}
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = &mut ctrl_c => {
                    tracing::info!("interrupted, shutting down");
                    break;
                }
            }
        }
    }

    /// Runs on every exit path. Each step is best effort; a teardown failure
    /// never masks the session result.
    fn teardown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(artifact) = self.coordinator.take_current() {
            self.engine.close(artifact);
        }
        self.engine.quit();
        self.guard.release();
        tracing::debug!("session torn down");
    }
}
