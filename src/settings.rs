use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

pub const DEFAULT_MAX_ACTIONS: usize = 20;
pub const DEFAULT_CACHE_DB_NAME: &str = "trackchain";
pub const DEFAULT_CACHE_STORE_NAME: &str = "track_chain";

const LOG_ENV_VAR: &str = "TRACKCHAIN_LOG";

/// Error sources the error collector may listen to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Script,
    Promise,
    Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackOptions {
    /// Emit the `[step]: message` diagnostic trace.
    pub log: bool,
    pub max_actions: usize,
    /// Reserved; nothing consumes it yet.
    pub track_resources: bool,
    pub track_errors: Vec<ErrorSource>,
    pub enable_cache: bool,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            log: false,
            max_actions: DEFAULT_MAX_ACTIONS,
            track_resources: false,
            track_errors: vec![ErrorSource::Script, ErrorSource::Promise],
            enable_cache: true,
        }
    }
}

/// Partial options as accepted by `Tracker::initialize`. Present fields win.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackOptionsPatch {
    pub log: Option<bool>,
    pub max_actions: Option<usize>,
    pub track_resources: Option<bool>,
    pub track_errors: Option<Vec<ErrorSource>>,
    pub enable_cache: Option<bool>,
}

impl TrackOptions {
    /// Reads options from a JSON file, falling back to defaults when the file
    /// is missing or unparsable.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tracking options from {}", path.display()))?;
        let patch: TrackOptionsPatch = serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!("Ignoring malformed tracking options {}: {err}", path.display());
            TrackOptionsPatch::default()
        });
        Ok(Self::default().merged(patch))
    }

    pub fn merged(mut self, patch: TrackOptionsPatch) -> Self {
        if let Some(log) = patch.log {
            self.log = log;
        }
        if let Some(max_actions) = patch.max_actions {
            self.max_actions = max_actions;
        }
        if let Some(track_resources) = patch.track_resources {
            self.track_resources = track_resources;
        }
        if let Some(track_errors) = patch.track_errors {
            self.track_errors = track_errors;
        }
        if let Some(enable_cache) = patch.enable_cache {
            self.enable_cache = enable_cache;
        }
        self
    }

    /// `TRACKCHAIN_LOG=1|true` forces the diagnostic trace on.
    pub fn with_env_overrides(mut self) -> Self {
        let forced = std::env::var(LOG_ENV_VAR)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if forced {
            self.log = true;
        }
        self
    }

    /// Chain capacity. A zero capacity still keeps the newest record.
    pub fn capacity(&self) -> usize {
        self.max_actions.max(1)
    }

    pub fn tracks_error(&self, source: ErrorSource) -> bool {
        self.track_errors.contains(&source)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// Relational store backed by SQLite.
    Sqlite,
    /// Flat key/value JSON file.
    Json,
    /// Process memory; nothing survives a restart.
    Memory,
}

impl StorageDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriver::Sqlite => "sqlite",
            StorageDriver::Json => "json",
            StorageDriver::Memory => "memory",
        }
    }
}

/// Where and how the cache mirror persists the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    pub directory: PathBuf,
    pub name: String,
    pub store_name: String,
    /// Engines tried in order until one opens.
    pub drivers: Vec<StorageDriver>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join(DEFAULT_CACHE_DB_NAME),
            name: DEFAULT_CACHE_DB_NAME.into(),
            store_name: DEFAULT_CACHE_STORE_NAME.into(),
            drivers: vec![StorageDriver::Sqlite, StorageDriver::Json, StorageDriver::Memory],
        }
    }
}

impl StorageSettings {
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = TrackOptions::default();
        assert!(!options.log);
        assert_eq!(options.max_actions, 20);
        assert!(!options.track_resources);
        assert_eq!(
            options.track_errors,
            vec![ErrorSource::Script, ErrorSource::Promise]
        );
        assert!(options.enable_cache);
    }

    #[test]
    fn patch_overrides_only_present_fields() {
        let patch: TrackOptionsPatch =
            serde_json::from_str(r#"{"maxActions": 5, "trackErrors": ["resource"]}"#).unwrap();
        let options = TrackOptions::default().merged(patch);

        assert_eq!(options.max_actions, 5);
        assert_eq!(options.track_errors, vec![ErrorSource::Resource]);
        assert!(options.enable_cache);
        assert!(!options.log);
    }

    #[test]
    fn zero_capacity_keeps_one_record() {
        let options = TrackOptions {
            max_actions: 0,
            ..TrackOptions::default()
        };
        assert_eq!(options.capacity(), 1);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let missing = TrackOptions::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(missing, TrackOptions::default());

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert_eq!(TrackOptions::load(&broken).unwrap(), TrackOptions::default());

        let valid = dir.path().join("options.json");
        fs::write(&valid, r#"{"log": true, "enableCache": false}"#).unwrap();
        let loaded = TrackOptions::load(&valid).unwrap();
        assert!(loaded.log);
        assert!(!loaded.enable_cache);
    }
}
