//! Configuration file support.
//!
//! User preferences are kept in a process-wide [`AppConfig`] behind a thin
//! [`ConfigStore`] with `load_at_init` / `flush_on_change` semantics, so the
//! engine itself never touches the filesystem for settings and can be driven
//! from an in-memory store in tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BRUSH_RADIUS, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP_THRESHOLD, UNDO_DEPTH};
use crate::propagate::{PropagatedKind, PropagationPolicy};

/// Log level setting for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Show only errors
    Error,
    /// Show errors and warnings
    Warn,
    /// Show errors, warnings, and info messages
    #[default]
    Info,
    /// Show debug-level logging
    Debug,
    /// Show all log messages including trace
    Trace,
}

impl LogLevel {
    /// Get the display name for this log level.
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "Error",
            LogLevel::Warn => "Warn",
            LogLevel::Info => "Info",
            LogLevel::Debug => "Debug",
            LogLevel::Trace => "Trace",
        }
    }

    /// Parse a level name case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|level| level.name().eq_ignore_ascii_case(name))
    }

    /// Get all log levels in order from least to most verbose.
    pub fn all() -> &'static [LogLevel] {
        &[
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ]
    }

    /// Convert to log crate's LevelFilter.
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Current configuration file format version.
/// Increment this when making breaking changes to the config format.
pub const CONFIG_VERSION: u32 = 1;

/// Tracker used after edits and on first visit of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerChoice {
    /// Built-in overlap tracker
    #[default]
    Overlap,
    /// A tracker registered under this name at runtime
    Plugin(String),
}

/// Autosave section of the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutosaveConfig {
    /// Whether edits are written to the recovery directory
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period after the last edit before a recovery write (milliseconds)
    #[serde(default)]
    pub debounce_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 0,
        }
    }
}

/// Remembered propagation choice per operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationDefaults {
    /// Delete ID
    #[serde(default)]
    pub delete_id: PropagationPolicy,
    /// Edit ID
    #[serde(default = "default_edit_id_policy")]
    pub edit_id: PropagationPolicy,
    /// Exclude from analysis
    #[serde(default)]
    pub bin: PropagationPolicy,
    /// Mark as dead
    #[serde(default)]
    pub rip: PropagationPolicy,
    /// Keep only selected IDs
    #[serde(default)]
    pub keep: PropagationPolicy,
}

fn default_edit_id_policy() -> PropagationPolicy {
    PropagationPolicy::TrackingOnly
}

impl Default for PropagationDefaults {
    fn default() -> Self {
        Self {
            delete_id: PropagationPolicy::default(),
            edit_id: default_edit_id_policy(),
            bin: PropagationPolicy::default(),
            rip: PropagationPolicy::default(),
            keep: PropagationPolicy::default(),
        }
    }
}

impl PropagationDefaults {
    /// Policy remembered for an operation kind.
    pub fn get(&self, kind: PropagatedKind) -> PropagationPolicy {
        match kind {
            PropagatedKind::DeleteId => self.delete_id,
            PropagatedKind::EditId => self.edit_id,
            PropagatedKind::Bin => self.bin,
            PropagatedKind::Rip => self.rip,
            PropagatedKind::Keep => self.keep,
        }
    }

    /// Remember a policy for an operation kind.
    pub fn set(&mut self, kind: PropagatedKind, policy: PropagationPolicy) {
        match kind {
            PropagatedKind::DeleteId => self.delete_id = policy,
            PropagatedKind::EditId => self.edit_id = policy,
            PropagatedKind::Bin => self.bin = policy,
            PropagatedKind::Rip => self.rip = policy,
            PropagatedKind::Keep => self.keep = policy,
        }
    }
}

/// Application configuration persisted between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Version of the configuration file format
    pub version: u32,

    /// Log verbosity level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Brush and eraser radius in pixels
    #[serde(default = "default_brush_radius")]
    pub brush_radius: f64,

    /// Fill holes of objects touched by a brush stroke on release
    #[serde(default = "default_true")]
    pub auto_fill_holes: bool,

    /// Tracker used for real-time tracking
    #[serde(default)]
    pub tracker: TrackerChoice,

    /// Minimum intersection-over-area for the overlap tracker
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f64,

    /// Maximum undo snapshots per frame
    #[serde(default = "default_undo_depth")]
    pub undo_depth: usize,

    /// Autosave settings
    #[serde(default)]
    pub autosave: AutosaveConfig,

    /// Remembered propagation choices
    #[serde(default)]
    pub propagation: PropagationDefaults,

    /// Whether to compute measurements on save (`None` asks once per session)
    #[serde(default)]
    pub save_measurements: Option<bool>,

    /// Frames per chunk of the lazy segmentation loader
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_brush_radius() -> f64 {
    DEFAULT_BRUSH_RADIUS
}

fn default_overlap_threshold() -> f64 {
    DEFAULT_OVERLAP_THRESHOLD
}

fn default_undo_depth() -> usize {
    UNDO_DEPTH
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl AppConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self {
            version: CONFIG_VERSION,
            log_level: LogLevel::default(),
            brush_radius: default_brush_radius(),
            auto_fill_holes: true,
            tracker: TrackerChoice::default(),
            overlap_threshold: default_overlap_threshold(),
            undo_depth: default_undo_depth(),
            autosave: AutosaveConfig::default(),
            propagation: PropagationDefaults::default(),
            save_measurements: None,
            chunk_size: default_chunk_size(),
        }
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;

        // Validate version compatibility
        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                file_version: config.version,
                supported_version: CONFIG_VERSION,
            });
        }

        Ok(config)
    }

    /// Get the default filename for the settings file.
    pub fn default_filename() -> &'static str {
        "settings.json"
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        // Try to use XDG config directory, fall back to home directory
        if let Some(config_dir) = dirs::config_dir() {
            Some(config_dir.join("acdc").join(Self::default_filename()))
        } else {
            dirs::home_dir().map(|home_dir| {
                home_dir
                    .join(".config")
                    .join("acdc")
                    .join(Self::default_filename())
            })
        }
    }

    /// Try to load configuration from a path.
    /// Returns None if the file doesn't exist or can't be read.
    pub fn load_from(path: &Path) -> Option<Self> {
        if !path.exists() {
            log::debug!("No config file found at {:?}", path);
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(json) => match Self::from_json(&json) {
                Ok(config) => {
                    log::info!("Loaded configuration from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse config file {:?}: {}", path, e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read config file {:?}: {}", path, e);
                None
            }
        }
    }

    /// Save configuration to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = self.to_json()?;
        std::fs::write(path, json)?;
        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide settings with load-at-init / flush-on-change semantics.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    /// Backing file; `None` keeps everything in memory
    path: Option<PathBuf>,
    /// Live configuration
    config: AppConfig,
    /// Copy as of the last load or flush
    flushed: AppConfig,
}

impl ConfigStore {
    /// Load the settings file from the default location.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load_at_init() -> Self {
        match AppConfig::default_path() {
            Some(path) => Self::load_at(path),
            None => {
                log::warn!("Could not determine config directory, settings will not persist");
                Self::in_memory(AppConfig::default())
            }
        }
    }

    /// Load the settings file from an explicit path.
    pub fn load_at(path: PathBuf) -> Self {
        let config = AppConfig::load_from(&path).unwrap_or_default();
        Self {
            path: Some(path),
            flushed: config.clone(),
            config,
        }
    }

    /// Store that never touches the filesystem.
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            path: None,
            flushed: config.clone(),
            config,
        }
    }

    /// Current settings.
    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    /// Mutable access; call [`ConfigStore::flush_on_change`] afterwards.
    pub fn get_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// Whether the live settings differ from the last flushed copy.
    pub fn is_dirty(&self) -> bool {
        self.config != self.flushed
    }

    /// Write the settings when they changed since the last flush.
    ///
    /// Returns whether a write happened.
    pub fn flush_on_change(&mut self) -> Result<bool, ConfigError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            self.config.save_to(path)?;
        }
        self.flushed = self.config.clone();
        Ok(self.path.is_some())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Configuration version is newer than supported
    #[error(
        "Configuration file version {file_version} is newer than supported version {supported_version}"
    )]
    VersionTooNew {
        /// Version found in the file
        file_version: u32,
        /// Newest version this build understands
        supported_version: u32,
    },

    /// I/O error when reading/writing config
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let mut config = AppConfig::new();
        config.brush_radius = 7.5;
        config.tracker = TrackerChoice::Plugin("trackpy".to_string());
        config
            .propagation
            .set(PropagatedKind::Keep, PropagationPolicy::ApplyAllFuture);

        let json = config.to_json().unwrap();
        let loaded = AppConfig::from_json(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let loaded = AppConfig::from_json(r#"{"version": 1}"#).unwrap();
        assert_eq!(loaded.undo_depth, UNDO_DEPTH);
        assert!(loaded.auto_fill_holes);
        assert_eq!(loaded.propagation.edit_id, PropagationPolicy::TrackingOnly);
    }

    #[test]
    fn test_version_too_new() {
        let result = AppConfig::from_json(r#"{"version": 99}"#);
        assert!(matches!(result, Err(ConfigError::VersionTooNew { .. })));
    }

    #[test]
    fn test_log_level_from_name() {
        assert_eq!(LogLevel::from_name("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_name("loud"), None);
    }

    #[test]
    fn test_flush_on_change_writes_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acdc").join("settings.json");
        let mut store = ConfigStore::load_at(path.clone());
        assert_eq!(store.get(), &AppConfig::default());
        assert!(!store.flush_on_change().unwrap());
        assert!(!path.exists());

        store.get_mut().brush_radius = 2.0;
        assert!(store.flush_on_change().unwrap());
        assert!(path.exists());

        let reloaded = ConfigStore::load_at(path);
        assert_eq!(reloaded.get().brush_radius, 2.0);
    }

    #[test]
    fn test_in_memory_store_never_writes() {
        let mut store = ConfigStore::in_memory(AppConfig::default());
        store.get_mut().chunk_size = 3;
        assert!(store.is_dirty());
        assert!(!store.flush_on_change().unwrap());
        assert!(!store.is_dirty());
    }
}
