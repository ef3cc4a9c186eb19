/// Failure-safe refresh protocol.
///
/// A refresh never tears down the comparison the user is looking at before
/// its replacement exists: build the new artifact first, swap it in, and
/// only then release the old one. If the build fails, the old artifact stays
/// current and the UI is left alone. The same protocol runs at startup,
/// where there is simply no old artifact to retire.
use std::path::Path;

use crate::engine::{Artifact, CompareEngine, CompareOptions, SourceVisibility};

/// Phases of one refresh pass. `Failed` is held until the next pass starts,
/// so callers can observe that the last refresh did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Building,
    Swapping,
    Failed,
}

/// What a refresh pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The new artifact is current; any previous one was released.
    Refreshed,
    /// The build or swap failed; the previous artifact (if any) is still
    /// current and untouched.
    Failed,
}

/// Owns the "current artifact" slot and runs the build-then-swap protocol.
///
/// At most one artifact is current at a time, and only one refresh runs at a
/// time; the session's poll loop serializes calls.
pub struct RefreshCoordinator {
    state: RefreshState,
    current: Option<Artifact>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            state: RefreshState::Idle,
            current: None,
        }
    }

    /// Last observed machine state. Diagnostic only.
    #[allow(dead_code)]
    pub fn state(&self) -> RefreshState {
        self.state
    }

    pub fn current(&self) -> Option<&Artifact> {
        self.current.as_ref()
    }

    /// Hand the current artifact back for release at session teardown.
    pub fn take_current(&mut self) -> Option<Artifact> {
        self.current.take()
    }

    /// Run one refresh pass: build a new comparison of the two files, swap
    /// it in for the current one, and release the old artifact.
    pub fn refresh(
        &mut self,
        engine: &mut dyn CompareEngine,
        path1: &Path,
        path2: &Path,
        options: &CompareOptions,
        visibility: SourceVisibility,
    ) -> RefreshOutcome {
        if self.state == RefreshState::Failed {
            tracing::debug!("retrying after failed refresh");
            self.state = RefreshState::Idle;
        }
        debug_assert_eq!(self.state, RefreshState::Idle);

        self.state = RefreshState::Building;
        tracing::debug!("building new comparison");
        let new_artifact = match engine.open_comparison(path1, path2, options) {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::warn!(error = %e, "comparison build failed, keeping previous artifact");
                self.state = RefreshState::Failed;
                return RefreshOutcome::Failed;
            }
        };

        self.state = RefreshState::Swapping;
        // The old artifact stays fully usable until the new one is visible.
        let view_state = self
            .current
            .as_ref()
            .map(|artifact| engine.capture_view_state(artifact));

        if let Err(e) = engine.display(&new_artifact) {
            tracing::warn!(error = %e, "could not display new comparison, keeping previous artifact");
            engine.close(new_artifact);
            self.state = RefreshState::Failed;
            return RefreshOutcome::Failed;
        }

        engine.set_source_visibility(&new_artifact, visibility);
        if let Some(view_state) = view_state {
            engine.apply_view_state(&new_artifact, view_state);
        }

        let superseded = self.current.replace(new_artifact);
        if let Some(old) = superseded {
            tracing::debug!(artifact = old.id(), "releasing superseded comparison");
            engine.close(old);
        }

        self.state = RefreshState::Idle;
        RefreshOutcome::Refreshed
    }
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;
    use crate::engine::ViewState;
    use std::path::PathBuf;

    fn paths() -> (PathBuf, PathBuf) {
        (PathBuf::from("/tmp/a.txt"), PathBuf::from("/tmp/b.txt"))
    }

    fn run(
        coordinator: &mut RefreshCoordinator,
        engine: &mut MockEngine,
        visibility: SourceVisibility,
    ) -> RefreshOutcome {
        let (path1, path2) = paths();
        coordinator.refresh(
            engine,
            &path1,
            &path2,
            &CompareOptions::default(),
            visibility,
        )
    }

    #[test]
    fn test_initial_build_displays_and_sets_visibility() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        let mut coordinator = RefreshCoordinator::new();

        let outcome = run(&mut coordinator, &mut engine, SourceVisibility::Both);

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.current().map(|a| a.id()), Some(0));
        let log = log.lock().unwrap();
        assert_eq!(log.displayed, vec![0]);
        assert_eq!(log.visibility, vec![(0, SourceVisibility::Both)]);
        assert!(log.closed.is_empty());
        // No previous artifact means no view state to carry over.
        assert!(log.applied_view.is_empty());
    }

    #[test]
    fn test_refresh_swaps_and_releases_old_after_new_is_displayed() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        let mut coordinator = RefreshCoordinator::new();

        run(&mut coordinator, &mut engine, SourceVisibility::None);
        let outcome = run(&mut coordinator, &mut engine, SourceVisibility::None);

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(coordinator.current().map(|a| a.id()), Some(1));
        let log = log.lock().unwrap();
        assert_eq!(log.closed, vec![0]);
        // Build-before-destroy: the old artifact is released only after the
        // replacement is on screen.
        let display_new = log.timeline.iter().position(|e| e == "display 1").unwrap();
        let close_old = log.timeline.iter().position(|e| e == "close 0").unwrap();
        assert!(display_new < close_old);
        // Exactly the new artifact remains open.
        assert_eq!(log.open.len(), 1);
        assert!(log.open.contains(&1));
    }

    #[test]
    fn test_view_state_is_captured_from_old_and_applied_to_new() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        let state = ViewState {
            scroll_position: 0.37,
            zoom_percent: 140,
        };
        log.lock().unwrap().view_state = state;
        let mut coordinator = RefreshCoordinator::new();

        run(&mut coordinator, &mut engine, SourceVisibility::Both);
        run(&mut coordinator, &mut engine, SourceVisibility::Both);

        let log = log.lock().unwrap();
        assert_eq!(log.applied_view, vec![(1, state)]);
    }

    #[test]
    fn test_failed_build_keeps_previous_artifact_current() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        let mut coordinator = RefreshCoordinator::new();

        run(&mut coordinator, &mut engine, SourceVisibility::Both);
        log.lock().unwrap().fail_builds = 1;
        let outcome = run(&mut coordinator, &mut engine, SourceVisibility::Both);

        assert_eq!(outcome, RefreshOutcome::Failed);
        assert_eq!(coordinator.state(), RefreshState::Failed);
        // Same artifact as before the call: nothing leaked, nothing lost.
        assert_eq!(coordinator.current().map(|a| a.id()), Some(0));
        let log = log.lock().unwrap();
        assert!(log.closed.is_empty());
        assert_eq!(log.open.len(), 1);
        assert!(log.open.contains(&0));
        assert_eq!(log.displayed, vec![0]);
    }

    #[test]
    fn test_refresh_recovers_after_a_failure() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        let mut coordinator = RefreshCoordinator::new();

        run(&mut coordinator, &mut engine, SourceVisibility::Both);
        log.lock().unwrap().fail_builds = 1;
        assert_eq!(
            run(&mut coordinator, &mut engine, SourceVisibility::Both),
            RefreshOutcome::Failed
        );

        let outcome = run(&mut coordinator, &mut engine, SourceVisibility::Both);
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.current().map(|a| a.id()), Some(1));
    }

    #[test]
    fn test_failed_initial_build_leaves_nothing_current() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        log.lock().unwrap().fail_builds = 1;
        let mut coordinator = RefreshCoordinator::new();

        let outcome = run(&mut coordinator, &mut engine, SourceVisibility::Both);

        assert_eq!(outcome, RefreshOutcome::Failed);
        assert!(coordinator.current().is_none());
        assert!(log.lock().unwrap().open.is_empty());
    }

    #[test]
    fn test_failed_display_releases_half_built_artifact() {
        let mut engine = MockEngine::new();
        let log = engine.log_handle();
        let mut coordinator = RefreshCoordinator::new();

        run(&mut coordinator, &mut engine, SourceVisibility::Both);
        log.lock().unwrap().fail_displays = 1;
        let outcome = run(&mut coordinator, &mut engine, SourceVisibility::Both);

        assert_eq!(outcome, RefreshOutcome::Failed);
        assert_eq!(coordinator.current().map(|a| a.id()), Some(0));
        let log = log.lock().unwrap();
        // The half-built replacement was released, the original was not.
        assert_eq!(log.closed, vec![1]);
        assert_eq!(log.open.len(), 1);
        assert!(log.open.contains(&0));
    }

    #[test]
    fn test_take_current_empties_the_slot() {
        let mut engine = MockEngine::new();
        let mut coordinator = RefreshCoordinator::new();

        run(&mut coordinator, &mut engine, SourceVisibility::Both);
        let artifact = coordinator.take_current().unwrap();
        assert_eq!(artifact.id(), 0);
        assert!(coordinator.current().is_none());
        engine.close(artifact);
    }
}
