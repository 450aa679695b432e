//! Configuration management for barotrack.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handler::{is_valid_name_format, DEFAULT_NAME_FORMAT};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "barotrack";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "tracks.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `BAROTRACK_`, sections split on `__`)
/// 2. TOML config file at `~/.config/barotrack/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Sensor configuration.
    pub sensors: SensorsConfig,
    /// Service configuration.
    pub service: ServiceConfig,
    /// Recording configuration.
    pub recording: RecordingConfig,
    /// GPX export configuration.
    pub export: ExportConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/barotrack/tracks.db`
    pub database_path: Option<PathBuf>,
}

/// Sensor-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// Use the barometer for altitude when one is present.
    pub barometer_enabled: bool,
    /// Capacity of the reading queue between sensors and the handler.
    pub reading_buffer: usize,
}

/// Service-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Capacity of the client command queue.
    pub command_buffer: usize,
}

/// Recording-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// `strftime` pattern for unnamed recordings, in local time.
    pub name_format: String,
}

/// GPX export configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Value of the GPX `creator` attribute.
    pub creator: String,
    /// Directory for exported files.
    /// Defaults to the current directory.
    pub output_dir: Option<PathBuf>,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            barometer_enabled: true,
            reading_buffer: 256,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { command_buffer: 32 }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            name_format: DEFAULT_NAME_FORMAT.to_string(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            creator: "barotrack".to_string(),
            output_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("BAROTRACK_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sensors.reading_buffer == 0 {
            return Err(Error::ConfigValidation {
                message: "sensors.reading_buffer must be greater than 0".to_string(),
            });
        }

        if self.service.command_buffer == 0 {
            return Err(Error::ConfigValidation {
                message: "service.command_buffer must be greater than 0".to_string(),
            });
        }

        if self.export.creator.trim().is_empty() {
            return Err(Error::ConfigValidation {
                message: "export.creator cannot be empty".to_string(),
            });
        }

        if !is_valid_name_format(&self.recording.name_format) {
            return Err(Error::ConfigValidation {
                message: format!(
                    "invalid recording.name_format: {}",
                    self.recording.name_format
                ),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the export directory, falling back to the current directory.
    #[must_use]
    pub fn export_dir(&self) -> PathBuf {
        self.export
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.sensors.barometer_enabled);
        assert_eq!(config.sensors.reading_buffer, 256);
        assert_eq!(config.service.command_buffer, 32);
        assert_eq!(config.recording.name_format, DEFAULT_NAME_FORMAT);
        assert_eq!(config.export.creator, "barotrack");
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_reading_buffer() {
        let mut config = Config::default();
        config.sensors.reading_buffer = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("reading_buffer"));
    }

    #[test]
    fn test_validate_zero_command_buffer() {
        let mut config = Config::default();
        config.service.command_buffer = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("command_buffer"));
    }

    #[test]
    fn test_validate_empty_creator() {
        let mut config = Config::default();
        config.export.creator = "  ".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("creator"));
    }

    #[test]
    fn test_validate_bad_name_format() {
        let mut config = Config::default();
        config.recording.name_format = "flight %Q".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("name_format"));
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        let path = config.database_path();

        assert!(path.to_string_lossy().contains("tracks.db"));
        assert!(path.to_string_lossy().contains("barotrack"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_export_dir_default() {
        assert_eq!(Config::default().export_dir(), PathBuf::from("."));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("barotrack"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[sensors]
barometer_enabled = false

[export]
creator = "test-suite"
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(path)).unwrap();
        assert!(!config.sensors.barometer_enabled);
        assert_eq!(config.sensors.reading_buffer, 256);
        assert_eq!(config.export.creator, "test-suite");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[service]\ncommand_buffer = 0\n").unwrap();

        let err = Config::load_from(Some(path)).unwrap_err();
        assert!(err.to_string().contains("command_buffer"));
    }

    #[test]
    fn test_sensors_config_deserialize() {
        let json = r#"{"reading_buffer": 16}"#;
        let sensors: SensorsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(sensors.reading_buffer, 16);
        assert!(sensors.barometer_enabled);
    }

    #[test]
    fn test_config_serialize() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("name_format"));
        assert!(json.contains("command_buffer"));
    }
}
