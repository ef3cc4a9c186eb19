/// HTML comparison engine.
///
/// Renders the two documents into a single self-refreshing HTML page (a
/// side-by-side view plus a changes-only view, toggled by the visibility
/// mode) and hands it to the user's viewer. The page lives at a stable path
/// in a per-session temp directory; publishing a rebuilt comparison is a
/// rename onto that path, so the viewer never observes a partial file.
///
/// The viewer is launched detached (it may itself hand off to an already
/// running instance), which is why no process handle comes back from here
/// and the session recovers one by discovery instead.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::engine::{
    Artifact, CompareEngine, CompareOptions, EngineError, SourceVisibility, ViewState,
};

const DEFAULT_VIEWER: &str = "xdg-open";

/// Environment override for the viewer command.
pub const VIEWER_ENV: &str = "DOCDIFF_VIEWER";

/// Placeholder patched with the visibility class at publish time, so a
/// visibility change does not force a re-render.
const VISIBILITY_SLOT: &str = "__VISIBILITY__";

pub struct HtmlDiffEngine {
    viewer: String,
    executable: String,
    work_dir: Option<TempDir>,
    published: PathBuf,
    artifacts: HashMap<u64, PathBuf>,
    next_id: u64,
    displayed: Option<u64>,
    launched: bool,
    visibility: SourceVisibility,
    view_state: ViewState,
}

impl HtmlDiffEngine {
    /// Engine using `$DOCDIFF_VIEWER`, or `xdg-open` when unset.
    pub fn new() -> Result<Self, EngineError> {
        let viewer =
            std::env::var(VIEWER_ENV).unwrap_or_else(|_| DEFAULT_VIEWER.to_string());
        Self::with_viewer(&viewer)
    }

    pub fn with_viewer(viewer: &str) -> Result<Self, EngineError> {
        let work_dir = tempfile::Builder::new()
            .prefix("docdiff-")
            .tempdir()
            .map_err(|e| EngineError::Io {
                path: std::env::temp_dir(),
                source: e,
            })?;
        let published = work_dir.path().join("comparison.html");
        let executable = Path::new(viewer)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| viewer.to_string());
        Ok(Self {
            viewer: viewer.to_string(),
            executable,
            work_dir: Some(work_dir),
            published,
            artifacts: HashMap::new(),
            next_id: 0,
            displayed: None,
            launched: false,
            visibility: SourceVisibility::Both,
            view_state: ViewState::default(),
        })
    }

    /// Path the viewer is pointed at.
    #[allow(dead_code)]
    pub fn published_path(&self) -> &Path {
        &self.published
    }

    /// Patch the visibility class into the artifact's page and rename it
    /// onto the published path.
    fn publish(&mut self, id: u64) -> Result<(), EngineError> {
        let artifact_path = self.artifacts.get(&id).cloned().ok_or(EngineError::Build {
            message: format!("unknown artifact {id}"),
        })?;
        let page = std::fs::read_to_string(&artifact_path).map_err(|e| EngineError::Io {
            path: artifact_path.clone(),
            source: e,
        })?;
        let class = match self.visibility {
            SourceVisibility::Both => "vis-both",
            SourceVisibility::None => "vis-none",
        };
        let page = page.replace(VISIBILITY_SLOT, class);
        let staging = self.published.with_extension("html.tmp");
        std::fs::write(&staging, page).map_err(|e| EngineError::Io {
            path: staging.clone(),
            source: e,
        })?;
        std::fs::rename(&staging, &self.published).map_err(|e| EngineError::Io {
            path: self.published.clone(),
            source: e,
        })?;
        self.displayed = Some(id);
        Ok(())
    }

    fn launch_viewer(&mut self) -> Result<(), EngineError> {
        // Detach through a shell so a launcher or single-instance viewer
        // does not leave a zombie behind; the real window process is found
        // later by discovery.
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(r#""$0" "$1" >/dev/null 2>&1 &"#)
            .arg(&self.viewer)
            .arg(&self.published)
            .status()
            .map_err(|e| EngineError::Spawn {
                command: self.viewer.clone(),
                source: e,
            })?;
        if !status.success() {
            return Err(EngineError::Spawn {
                command: self.viewer.clone(),
                source: std::io::Error::other(format!("launcher exited with {status}")),
            });
        }
        tracing::info!(viewer = %self.viewer, page = %self.published.display(), "viewer launched");
        self.launched = true;
        Ok(())
    }
}

impl CompareEngine for HtmlDiffEngine {
    fn ensure_available(&self) -> Result<(), EngineError> {
        which::which(&self.viewer)
            .map(|_| ())
            .map_err(|_| EngineError::DependencyMissing {
                name: self.viewer.clone(),
            })
    }

    fn executable_name(&self) -> &str {
        &self.executable
    }

    fn open_comparison(
        &mut self,
        path1: &Path,
        path2: &Path,
        options: &CompareOptions,
    ) -> Result<Artifact, EngineError> {
        let left = read_document(path1)?;
        let right = read_document(path2)?;
        let page = render_page(path1, path2, &left, &right, options);

        let id = self.next_id;
        self.next_id += 1;
        let Some(work_dir) = self.work_dir.as_ref() else {
            return Err(EngineError::Build {
                message: "engine already shut down".to_string(),
            });
        };
        let artifact_path = work_dir.path().join(format!("artifact-{id}.html"));
        std::fs::write(&artifact_path, page).map_err(|e| EngineError::Io {
            path: artifact_path.clone(),
            source: e,
        })?;
        self.artifacts.insert(id, artifact_path);
        tracing::debug!(artifact = id, "comparison rendered");
        Ok(Artifact::new(id))
    }

    fn display(&mut self, artifact: &Artifact) -> Result<(), EngineError> {
        self.publish(artifact.id())?;
        if !self.launched {
            self.launch_viewer()?;
        }
        Ok(())
    }

    fn set_source_visibility(&mut self, artifact: &Artifact, visibility: SourceVisibility) {
        self.visibility = visibility;
        if self.displayed == Some(artifact.id()) {
            if let Err(e) = self.publish(artifact.id()) {
                tracing::warn!(error = %e, "failed to republish after visibility change");
            }
        }
    }

    fn capture_view_state(&self, _artifact: &Artifact) -> ViewState {
        self.view_state
    }

    fn apply_view_state(&mut self, _artifact: &Artifact, state: ViewState) {
        // Scroll restoration across reloads happens in the page itself; the
        // engine just remembers the last state it was handed.
        self.view_state = state;
    }

    fn host_pid(&mut self, _artifact: &Artifact) -> Option<u32> {
        // The viewer is detached; there is no handle to recover here.
        None
    }

    fn bring_to_foreground(&mut self, _artifact: &Artifact) {
        tracing::debug!("viewer raises its own window on open");
    }

    fn close(&mut self, artifact: Artifact) {
        if let Some(path) = self.artifacts.remove(&artifact.id()) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "artifact file already gone");
            }
        }
        if self.displayed == Some(artifact.id()) {
            self.displayed = None;
        }
    }

    fn quit(&mut self) {
        if self.launched {
            // The viewer may still have the page open; leave the directory
            // behind for the OS tempdir cleanup instead of yanking it away.
            if let Some(work_dir) = self.work_dir.take() {
                tracing::debug!(path = %work_dir.path().display(), "leaving comparison page for the viewer");
                std::mem::forget(work_dir);
            }
        }
    }
}

fn read_document(path: &Path) -> Result<String, EngineError> {
    let bytes = std::fs::read(path).map_err(|e| EngineError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Normalize a line for comparison according to the options. Display always
/// uses the original text; only equality is affected.
fn comparison_key(line: &str, options: &CompareOptions) -> String {
    let mut key = line.to_string();
    if !options.case_changes {
        key = key.to_lowercase();
    }
    if !options.whitespace {
        key = key.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    key
}

fn render_page(
    path1: &Path,
    path2: &Path,
    left: &str,
    right: &str,
    options: &CompareOptions,
) -> String {
    let left_lines: Vec<&str> = left.lines().collect();
    let right_lines: Vec<&str> = right.lines().collect();
    let left_keys: Vec<String> = left_lines
        .iter()
        .map(|l| comparison_key(l, options))
        .collect();
    let right_keys: Vec<String> = right_lines
        .iter()
        .map(|l| comparison_key(l, options))
        .collect();
    let left_normalized = left_keys.join("\n");
    let right_normalized = right_keys.join("\n");

    let diff = similar::TextDiff::from_lines(&left_normalized, &right_normalized);

    let mut side_rows = String::new();
    let mut change_rows = String::new();
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Equal => {
                let text = change
                    .old_index()
                    .and_then(|i| left_lines.get(i))
                    .copied()
                    .unwrap_or("");
                let cell = escape(text);
                side_rows.push_str(&format!(
                    "<tr><td class=\"line\">{cell}</td><td class=\"line\">{cell}</td></tr>\n"
                ));
            }
            similar::ChangeTag::Delete => {
                let text = change
                    .old_index()
                    .and_then(|i| left_lines.get(i))
                    .copied()
                    .unwrap_or("");
                let cell = escape(text);
                side_rows.push_str(&format!(
                    "<tr><td class=\"line line-del\">{cell}</td><td class=\"line\"></td></tr>\n"
                ));
                change_rows.push_str(&format!("<div class=\"line line-del\">- {cell}</div>\n"));
            }
            similar::ChangeTag::Insert => {
                let text = change
                    .new_index()
                    .and_then(|i| right_lines.get(i))
                    .copied()
                    .unwrap_or("");
                let cell = escape(text);
                side_rows.push_str(&format!(
                    "<tr><td class=\"line\"></td><td class=\"line line-ins\">{cell}</td></tr>\n"
                ));
                change_rows.push_str(&format!("<div class=\"line line-ins\">+ {cell}</div>\n"));
            }
        }
    }
    if change_rows.is_empty() {
        change_rows.push_str("<div class=\"line\">No differences.</div>\n");
    }

    let author = if options.revised_author.is_empty() {
        String::new()
    } else {
        format!(" &middot; revised by {}", escape(&options.revised_author))
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="2">
<title>{title1} vs {title2}</title>
<style>
body {{ font-family: monospace; margin: 0; }}
header {{ padding: 0.5em 1em; background: #f0f0f0; position: sticky; top: 0; }}
table {{ width: 100%; border-collapse: collapse; table-layout: fixed; }}
.line {{ white-space: pre-wrap; padding: 0 0.5em; vertical-align: top; }}
.line-del {{ background: #ffd7d5; }}
.line-ins {{ background: #d4f8d4; }}
body.vis-none .side-by-side {{ display: none; }}
body.vis-both .changes-only {{ display: none; }}
</style>
</head>
<body class="{VISIBILITY_SLOT}">
<header>{title1} &harr; {title2}{author}</header>
<section class="side-by-side"><table>
{side_rows}</table></section>
<section class="changes-only">
{change_rows}</section>
<script>
addEventListener("scroll", () => sessionStorage.setItem("docdiff-scroll", String(scrollY)));
addEventListener("DOMContentLoaded", () => scrollTo(0, Number(sessionStorage.getItem("docdiff-scroll") || "0")));
</script>
</body>
</html>
"#,
        title1 = escape(&path1.display().to_string()),
        title2 = escape(&path2.display().to_string()),
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, left: &str, right: &str) -> (PathBuf, PathBuf) {
        let path1 = dir.join("left.txt");
        let path2 = dir.join("right.txt");
        std::fs::write(&path1, left).unwrap();
        std::fs::write(&path2, right).unwrap();
        (path1, path2)
    }

    /// Engine whose "viewer" exits immediately; fine for tests that display.
    fn test_engine() -> HtmlDiffEngine {
        HtmlDiffEngine::with_viewer("true").unwrap()
    }

    #[test]
    fn test_executable_name_is_the_viewer_base_name() {
        let engine = HtmlDiffEngine::with_viewer("/usr/local/bin/some-viewer").unwrap();
        assert_eq!(engine.executable_name(), "some-viewer");
    }

    #[test]
    fn test_ensure_available_detects_missing_viewer() {
        let engine = HtmlDiffEngine::with_viewer("no-such-viewer-binary-xyz").unwrap();
        let err = engine.ensure_available().unwrap_err();
        assert!(err.is_dependency_missing());

        let engine = HtmlDiffEngine::with_viewer("sh").unwrap();
        assert!(engine.ensure_available().is_ok());
    }

    #[test]
    fn test_open_comparison_renders_escaped_content() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "a < b\n", "a > b\n");
        let mut engine = test_engine();

        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        let page =
            std::fs::read_to_string(engine.artifacts.get(&artifact.id()).unwrap()).unwrap();
        assert!(page.contains("a &lt; b"));
        assert!(page.contains("a &gt; b"));
        assert!(page.contains("line-del"));
        assert!(page.contains("line-ins"));
        engine.close(artifact);
    }

    #[test]
    fn test_identical_files_have_no_change_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "same\ntext\n", "same\ntext\n");
        let mut engine = test_engine();

        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        let page =
            std::fs::read_to_string(engine.artifacts.get(&artifact.id()).unwrap()).unwrap();
        assert!(!page.contains("line-del"));
        assert!(!page.contains("line-ins"));
        assert!(page.contains("No differences."));
        engine.close(artifact);
    }

    #[test]
    fn test_whitespace_option_ignores_spacing_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "a b\n", "a    b\n");
        let mut engine = test_engine();

        let lax = CompareOptions {
            whitespace: false,
            ..CompareOptions::default()
        };
        let artifact = engine.open_comparison(&path1, &path2, &lax).unwrap();
        let page =
            std::fs::read_to_string(engine.artifacts.get(&artifact.id()).unwrap()).unwrap();
        assert!(!page.contains("line-del"));
        engine.close(artifact);

        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        let page =
            std::fs::read_to_string(engine.artifacts.get(&artifact.id()).unwrap()).unwrap();
        assert!(page.contains("line-del"));
        engine.close(artifact);
    }

    #[test]
    fn test_case_option_ignores_case_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "Hello\n", "hello\n");
        let mut engine = test_engine();

        let lax = CompareOptions {
            case_changes: false,
            ..CompareOptions::default()
        };
        let artifact = engine.open_comparison(&path1, &path2, &lax).unwrap();
        let page =
            std::fs::read_to_string(engine.artifacts.get(&artifact.id()).unwrap()).unwrap();
        assert!(!page.contains("line-del"));
        engine.close(artifact);
    }

    #[test]
    fn test_missing_source_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, _) = write_pair(dir.path(), "x\n", "y\n");
        let mut engine = test_engine();

        let err = engine
            .open_comparison(
                &path1,
                &dir.path().join("gone.txt"),
                &CompareOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }

    #[test]
    fn test_display_publishes_with_current_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "x\n", "y\n");
        let mut engine = test_engine();

        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        engine.display(&artifact).unwrap();

        let page = std::fs::read_to_string(engine.published_path()).unwrap();
        assert!(page.contains(r#"<body class="vis-both">"#));

        engine.set_source_visibility(&artifact, SourceVisibility::None);
        let page = std::fs::read_to_string(engine.published_path()).unwrap();
        assert!(page.contains(r#"<body class="vis-none">"#));
        engine.close(artifact);
    }

    #[test]
    fn test_superseding_display_replaces_published_page() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "one\n", "two\n");
        let mut engine = test_engine();

        let first = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        engine.display(&first).unwrap();

        std::fs::write(&path2, "three\n").unwrap();
        let second = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        // Old page still published while the new artifact exists unpublished.
        let page = std::fs::read_to_string(engine.published_path()).unwrap();
        assert!(page.contains("two"));

        engine.display(&second).unwrap();
        let page = std::fs::read_to_string(engine.published_path()).unwrap();
        assert!(page.contains("three"));

        engine.close(first);
        engine.close(second);
    }

    #[test]
    fn test_close_removes_the_artifact_file() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "x\n", "y\n");
        let mut engine = test_engine();

        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        let artifact_path = engine.artifacts.get(&artifact.id()).unwrap().clone();
        assert!(artifact_path.exists());
        engine.close(artifact);
        assert!(!artifact_path.exists());
    }

    #[test]
    fn test_view_state_roundtrips_through_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "x\n", "y\n");
        let mut engine = test_engine();
        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();

        let state = ViewState {
            scroll_position: 12.5,
            zoom_percent: 80,
        };
        engine.apply_view_state(&artifact, state);
        assert_eq!(engine.capture_view_state(&artifact), state);
        engine.close(artifact);
    }

    #[test]
    fn test_host_pid_is_unknown_for_detached_viewer() {
        let dir = tempfile::tempdir().unwrap();
        let (path1, path2) = write_pair(dir.path(), "x\n", "y\n");
        let mut engine = test_engine();
        let artifact = engine
            .open_comparison(&path1, &path2, &CompareOptions::default())
            .unwrap();
        assert_eq!(engine.host_pid(&artifact), None);
        engine.close(artifact);
    }
}
