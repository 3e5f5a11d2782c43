//! Configuration for convostore.
//!
//! Settings come from a TOML file, by default `~/.convostore/config.toml`,
//! which is written with default values the first time it is looked for.
//! Environment variables override the file:
//!
//! | Variable | Effect |
//! |---|---|
//! | `CONVOSTORE_CONFIG` | path of the config file |
//! | `CONVOSTORE_STORAGE_MODE` | `default_storage_mode` |
//! | `CONVOSTORE_DB_HOST` | `db_host` |
//!
//! ```toml
//! db_host = "~/.convostore/db"
//! data_dir = "~/.convostore/saved-corpora"
//! default_storage_mode = "mem"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::BackendKind;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CONVOSTORE_CONFIG";
/// Environment variable overriding the default storage mode.
pub const STORAGE_MODE_ENV: &str = "CONVOSTORE_STORAGE_MODE";
/// Environment variable overriding the database location.
pub const DB_HOST_ENV: &str = "CONVOSTORE_DB_HOST";

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mem" | "memory" => Ok(Self::Memory),
            "db" | "persistent" => Ok(Self::Persistent),
            _ => Err(ConfigError::UnknownBackend {
                value: s.to_string(),
            }),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of the document database.
    pub db_host: String,
    /// Directory for exported registry snapshots.
    pub data_dir: String,
    /// Backend used when none is requested: `mem` or `db`.
    pub default_storage_mode: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_host: "~/.convostore/db".to_string(),
            data_dir: "~/.convostore/saved-corpora".to_string(),
            default_storage_mode: BackendKind::Memory.as_str().to_string(),
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    /// Parses and validates TOML.
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// The config file location: `CONVOSTORE_CONFIG` or
    /// `~/.convostore/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }
        dirs::home_dir()
            .map(|home| home.join(".convostore").join("config.toml"))
            .ok_or(ConfigError::NoHomeDirectory)
    }

    /// Loads settings from the default location with environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path()?)?.with_overrides(|key| std::env::var(key).ok())
    }

    /// Loads settings from `path`, writing the defaults there first if the
    /// file does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            Self::default().write_to(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
        }
        Self::from_file(path)
    }

    /// Applies `CONVOSTORE_STORAGE_MODE` and `CONVOSTORE_DB_HOST` as
    /// resolved by `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(STORAGE_MODE_ENV) {
            self.default_storage_mode = mode;
        }
        if let Some(host) = lookup(DB_HOST_ENV) {
            self.db_host = host;
        }
        self.validate()?;
        Ok(self)
    }

    /// Writes the settings as TOML, creating parent directories.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, self.to_toml()?).map_err(write_err)
    }

    /// Renders the settings as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage_mode()?;
        if self.db_host.trim().is_empty() {
            return Err(ConfigError::Invalid("db_host must not be empty".to_string()));
        }
        if self.data_dir.trim().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// The default backend.
    pub fn storage_mode(&self) -> Result<BackendKind, ConfigError> {
        self.default_storage_mode.parse()
    }

    /// `db_host` with `~` expanded.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_host).as_ref())
    }

    /// `data_dir` with `~` expanded.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.storage_mode().unwrap(), BackendKind::Memory);
        assert!(settings.validate().is_ok());
        assert!(!settings.db_path().starts_with("~"));
    }

    #[test]
    fn test_parse_partial_file() {
        let settings: Settings = r#"default_storage_mode = "db""#.parse().unwrap();
        assert_eq!(settings.storage_mode().unwrap(), BackendKind::Persistent);
        assert_eq!(settings.db_host, Settings::default().db_host);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = r#"default_storage_mode = "redis""#.parse::<Settings>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }

    #[test]
    fn test_malformed_toml() {
        let err = "db_host = ".parse::<Settings>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_backend_aliases() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!(" DB ".parse::<BackendKind>().unwrap(), BackendKind::Persistent);
        assert_eq!("persistent".parse::<BackendKind>().unwrap(), BackendKind::Persistent);
    }

    #[test]
    fn test_load_from_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let settings = Settings::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings, Settings::default());

        let written = Settings::from_file(&path).unwrap();
        assert_eq!(written, settings);
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::default()
            .with_overrides(|key| match key {
                STORAGE_MODE_ENV => Some("db".to_string()),
                DB_HOST_ENV => Some("/tmp/convostore-db".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(settings.storage_mode().unwrap(), BackendKind::Persistent);
        assert_eq!(settings.db_path(), PathBuf::from("/tmp/convostore-db"));

        let err = Settings::default()
            .with_overrides(|key| (key == STORAGE_MODE_ENV).then(|| "cloud".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = Settings::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
