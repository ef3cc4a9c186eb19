/// Comparison engine capability seam.
///
/// The session core never talks to a concrete document viewer directly; it
/// drives whatever implements `CompareEngine`. The engine owns everything
/// presentation-specific (rendering, the viewer application, window state)
/// while the core owns supervision and the refresh protocol.
use std::path::Path;

/// Opaque handle to one comparison result.
///
/// Deliberately not `Clone`: at most one artifact is current at a time, and
/// passing ownership back to the engine via `close` is the only way to
/// release one.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Artifact {
    id: u64,
}

impl Artifact {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Whether the compared source documents are shown alongside the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceVisibility {
    /// Show only the merged comparison ("quiet" mode).
    None,
    /// Show the comparison together with both source documents.
    Both,
}

/// Transient presentation state captured before a refresh and reapplied
/// after, so a rebuilt comparison lands where the user was looking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub scroll_position: f64,
    pub zoom_percent: u32,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            scroll_position: 0.0,
            zoom_percent: 100,
        }
    }
}

/// Full option set of the comparison call.
///
/// Engines honor the subset that is meaningful to them and ignore the rest.
#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub formatting: bool,
    pub case_changes: bool,
    pub whitespace: bool,
    pub tables: bool,
    pub headers: bool,
    pub footnotes: bool,
    pub textboxes: bool,
    pub fields: bool,
    pub comments: bool,
    pub moves: bool,
    pub revised_author: String,
    pub ignore_warnings: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            formatting: true,
            case_changes: true,
            whitespace: true,
            tables: true,
            headers: true,
            footnotes: true,
            textboxes: true,
            fields: true,
            comments: true,
            moves: true,
            revised_author: String::new(),
            ignore_warnings: true,
        }
    }
}

/// Errors produced by engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// The viewer application (or another hard requirement) is not installed.
    DependencyMissing { name: String },
    /// Building the comparison failed.
    Build { message: String },
    /// Failed to spawn the viewer process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// I/O failure on a source or artifact file.
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::DependencyMissing { name } => {
                write!(f, "required application is not installed: {name}")
            }
            EngineError::Build { message } => write!(f, "comparison build failed: {message}"),
            EngineError::Spawn { command, source } => {
                write!(f, "failed to spawn viewer {command}: {source}")
            }
            EngineError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Spawn { source, .. } => Some(source),
            EngineError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl EngineError {
    /// True for the non-retryable "not installed" case, which callers
    /// surface to the user instead of degrading.
    #[allow(dead_code)]
    pub fn is_dependency_missing(&self) -> bool {
        matches!(self, EngineError::DependencyMissing { .. })
    }
}

/// The interface the session core calls on a document-comparison engine.
///
/// Artifact lifecycle: `open_comparison` builds a new artifact without
/// touching any existing one, `display` publishes it (spawning the viewer on
/// first use), `close` releases it. Everything between is presentation
/// plumbing the core invokes best-effort.
pub trait CompareEngine: Send {
    /// Verify the external viewer is usable before anything is spawned.
    fn ensure_available(&self) -> Result<(), EngineError>;

    /// Base name of the viewer executable, used to correlate the spawned
    /// process among pre-existing instances.
    fn executable_name(&self) -> &str;

    /// Build a brand-new comparison artifact from the two files. Must not
    /// disturb previously built artifacts.
    fn open_comparison(
        &mut self,
        path1: &Path,
        path2: &Path,
        options: &CompareOptions,
    ) -> Result<Artifact, EngineError>;

    /// Publish the artifact to the user. The first call spawns the viewer;
    /// later calls replace whatever was displayed before.
    fn display(&mut self, artifact: &Artifact) -> Result<(), EngineError>;

    /// Apply the source-document visibility mode. Best effort.
    fn set_source_visibility(&mut self, artifact: &Artifact, visibility: SourceVisibility);

    /// Snapshot the presentation state of a displayed artifact.
    fn capture_view_state(&self, artifact: &Artifact) -> ViewState;

    /// Reapply a previously captured presentation state. Best effort.
    fn apply_view_state(&mut self, artifact: &Artifact, state: ViewState);

    /// Best-effort process id of the window hosting the artifact, for when
    /// discovery by executable name fails.
    fn host_pid(&mut self, artifact: &Artifact) -> Option<u32>;

    /// Raise the viewer window. Best effort.
    fn bring_to_foreground(&mut self, artifact: &Artifact);

    /// Release one artifact. Consumes the handle.
    fn close(&mut self, artifact: Artifact);

    /// Graceful engine shutdown at session end. Must not kill the user's
    /// viewer; errors are logged and swallowed by implementations.
    fn quit(&mut self);
}
