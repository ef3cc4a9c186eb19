/// Persisted user preferences.
///
/// A single small JSON object under the per-user configuration directory.
/// Reading is forgiving: a missing or unreadable file falls back to
/// defaults so a broken settings file can never keep a comparison from
/// launching.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hide the source documents in the comparison view by default.
    pub quiet: bool,
}

/// Reads and writes the settings file at a fixed path.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<config_dir>/docdiff/settings.json`.
    pub fn from_default_location() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("docdiff").join("settings.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults if the file is missing,
    /// unreadable, or malformed.
    pub fn load(&self) -> Settings {
        if !self.path.exists() {
            return Settings::default();
        }
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read settings, using defaults");
                return Settings::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "malformed settings file, using defaults");
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, json)
    }

    /// Persist a new default for the quiet option.
    pub fn set_quiet(&self, value: bool) -> std::io::Result<Settings> {
        let mut settings = self.load();
        settings.quiet = value;
        self.save(&settings)?;
        Ok(settings)
    }
}
