//! Loading and saving `config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::app_config::AppConfig;

const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "pixcache";
const APP_NAME: &str = "pixcache";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No per-user config directory exists on this platform.
    #[error("no config directory available for this user")]
    ConfigDirNotFound,
    /// Reading or writing the config file failed.
    #[error("config file io error: {0}")]
    Io(#[from] std::io::Error),
    /// The config could not be rendered as TOML.
    #[error("failed to serialize config: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// The config file is not valid TOML.
    #[error("failed to parse config: {0}")]
    TomlDe(#[from] toml::de::Error),
    /// Memory share outside `0.01..=0.8`.
    #[error("memory cache percent must be between 0.01 and 0.8 (inclusive), got {0}")]
    InvalidMemoryPercent(f32),
    /// Compression quality above 100.
    #[error("compress quality must be between 0 and 100, got {0}")]
    InvalidQuality(u8),
}

/// Owns the directory holding `config.toml`.
pub struct StorageManager {
    config_dir: PathBuf,
}

impl StorageManager {
    /// Resolves the per-user pixcache config directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigDirNotFound` if the platform has no such directory.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .ok_or(ConfigError::ConfigDirNotFound)?;
        Ok(Self::with_dir(dirs.config_dir().to_path_buf()))
    }

    /// Uses `path` as the config directory.
    #[must_use]
    pub fn with_dir(path: PathBuf) -> Self {
        Self { config_dir: path }
    }

    /// Config directory in use.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Path of `config.toml`, or `path_override` when given.
    #[must_use]
    pub fn config_path(&self, path_override: Option<&Path>) -> PathBuf {
        path_override.map_or_else(|| self.config_dir.join(CONFIG_FILE_NAME), Path::to_path_buf)
    }

    /// Creates the config directory if it is missing.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the directory cannot be created.
    pub fn ensure_config_dir(&self) -> Result<(), ConfigError> {
        if !self.config_dir.exists() {
            info!(dir = %self.config_dir.display(), "Creating config directory");
            fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }

    /// Reads the cache configuration.
    ///
    /// A missing file is created with defaults. A file that fails to parse is
    /// left untouched and defaults are returned.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read or the defaults
    /// cannot be written.
    pub fn load_config(&self, path_override: Option<&Path>) -> Result<AppConfig, ConfigError> {
        self.ensure_config_dir()?;
        let path = self.config_path(path_override);

        if !path.exists() {
            info!(path = %path.display(), "No config file, writing defaults");
            let config = AppConfig::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomically(&path, &config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        toml::from_str::<AppConfig>(&content).or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring unparsable config file");
            Ok(AppConfig::default())
        })
    }

    /// Writes `config` to `config.toml` in the config directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the config cannot be serialized or written.
    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.ensure_config_dir()?;
        let path = self.config_path(None);
        write_atomically(&path, config)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }
}

/// Serializes `data` next to `path` and renames it into place.
fn write_atomically<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(data)?;
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("config path has no parent directory"))?;

    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    staged.write_all(content.as_bytes())?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("pixcache");
        let manager = StorageManager::with_dir(nested.clone());

        manager.ensure_config_dir().unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::with_dir(dir.path().to_path_buf());

        let config = manager.load_config(None).unwrap();

        assert!(config.cache.memory_cache_enabled);
        assert!(manager.config_path(None).exists());
    }

    #[test]
    fn test_unparsable_file_yields_defaults_and_is_kept() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::with_dir(dir.path().to_path_buf());
        let path = manager.config_path(None);
        fs::write(&path, "invalid_toml = [").unwrap();

        let config = manager.load_config(None).unwrap();

        assert_eq!(config.cache.compress_quality, 70);
        assert_eq!(fs::read_to_string(&path).unwrap(), "invalid_toml = [");
    }

    #[test]
    fn test_saved_cache_settings_are_loaded_back() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::with_dir(dir.path().to_path_buf());

        let mut config = AppConfig::default();
        config.cache.memory_cache_size_kb = 777;
        config.cache.disk_cache_dir = Some(dir.path().join("images"));
        manager.save_config(&config).unwrap();

        let loaded = manager.load_config(None).unwrap();
        assert_eq!(loaded.cache.memory_cache_size_kb, 777);
        assert_eq!(loaded.cache.disk_cache_dir, Some(dir.path().join("images")));
    }

    #[test]
    fn test_override_path_is_used_instead_of_config_dir() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::with_dir(dir.path().join("default"));
        let custom = dir.path().join("custom").join("cache.toml");

        manager.load_config(Some(&custom)).unwrap();

        assert!(custom.exists());
        assert!(!manager.config_path(None).exists());
    }
}
