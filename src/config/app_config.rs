use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bluetooth::ScanSettings;
use crate::distance::DistanceModel;
use crate::error::ConfigError;
use crate::location::LocationRequest;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite file holding the sighting history
    pub database_path: PathBuf,

    /// Distance model calibration and clamp bounds
    pub distance: DistanceModel,

    /// Radio scan settings
    pub scan: ScanSettings,

    /// Location update cadence and fix freshness
    pub location: LocationRequest,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Optional log file in addition to stderr
    pub log_file: Option<PathBuf>,
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            distance: DistanceModel::default(),
            scan: ScanSettings::default(),
            location: LocationRequest::default(),
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default settings path, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = default_settings_path();
        if !path.exists() {
            log::info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Check settings that would otherwise fail later at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.distance.validate()?;
        if self.scan.event_buffer == 0 {
            return Err(ConfigError::Invalid("scan.event_buffer must be positive".into()));
        }
        if self.location.fastest_interval > self.location.interval {
            return Err(ConfigError::Invalid(
                "location.fastest_interval must not exceed location.interval".into(),
            ));
        }
        Ok(())
    }
}

/// Get the default settings path
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .map(|config_dir| config_dir.join("blescout").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|data_dir| data_dir.join("blescout").join("sightings.db"))
        .unwrap_or_else(|| PathBuf::from("sightings.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.distance.reference_power, -59);
        assert_eq!(config.distance.environmental_factor, 2.0);
        assert_eq!(config.location.interval, Duration::from_secs(10));
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.database_path.ends_with("sightings.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut config = AppConfig::default();
        config.distance.reference_power = -65;
        config.log_level = LogLevel::Debug;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "log_level": "Warn" }"#).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.log_level, LogLevel::Warn);
        assert_eq!(loaded.distance, DistanceModel::default());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "distance": { "min_distance": 10.0, "max_distance": 1.0 } }"#,
        )
        .unwrap();

        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_garbage_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
