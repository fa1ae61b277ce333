//! User settings for dockyard.
//!
//! Settings live in `~/.dockyard/settings.toml`:
//!
//! ```toml
//! # "false" turns off file sync for every `dockyard start`
//! sync = "false"
//! # where cached app environments are kept
//! state_dir = "/home/me/.dockyard"
//! ```
//!
//! Layering is file → environment (`DOCKYARD_SYNC`, `DOCKYARD_STATE_DIR`) →
//! CLI flags. The loaded value is passed explicitly to the orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const SETTINGS_DIR: &str = ".dockyard";
pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// Raw sync toggle; only the value `false` disables sync.
    pub sync: Option<String>,
    pub state_dir: Option<PathBuf>,
}

/// Raw TOML structure for `settings.toml`
#[derive(Debug, Deserialize)]
struct SettingsToml {
    sync: Option<toml::Value>,
    state_dir: Option<PathBuf>,
}

impl Settings {
    /// Path of the settings file in the user's home directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(SETTINGS_DIR).join(SETTINGS_FILE))
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let settings = match Self::default_path() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        Ok(settings.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Load settings from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw: SettingsToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let sync = match raw.sync {
            None => None,
            Some(toml::Value::String(s)) => Some(s),
            Some(toml::Value::Boolean(b)) => Some(b.to_string()),
            Some(other) => anyhow::bail!(
                "Failed to parse {}: `sync` must be a string or boolean, got {}",
                path.display(),
                other.type_str()
            ),
        };

        Ok(Self {
            sync,
            state_dir: raw.state_dir,
        })
    }

    /// Apply `DOCKYARD_SYNC` / `DOCKYARD_STATE_DIR` from `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(sync) = lookup("DOCKYARD_SYNC") {
            self.sync = Some(sync);
        }
        if let Some(dir) = lookup("DOCKYARD_STATE_DIR").filter(|d| !d.is_empty()) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn sync_disabled(&self) -> bool {
        self.sync
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("false"))
    }

    /// Directory for dockyard's own state (cached environments).
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(SETTINGS_DIR))
                .unwrap_or_else(|| PathBuf::from(SETTINGS_DIR))
        })
    }
}
