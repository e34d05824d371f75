//! Session settings and configuration management
//!
//! Tunables for the action queue, the connect delay and LE scanning, with
//! JSON (de)serialization and validation.

use crate::gatt::action::{DEFAULT_MAX_RETRIES, DEFAULT_STUCK_ACTION_TIMEOUT};
use crate::transport::ScanMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound accepted for `max_retries`
pub const MAX_RETRIES_LIMIT: u8 = 10;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// LE scan tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub mode: ScanMode,
    /// Deliver each peripheral at most once per scan
    pub deduplicate: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mode: ScanMode::LowLatency,
            deduplicate: true,
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Re-dispatches of a failed action before it is dropped
    pub max_retries: u8,

    /// Age after which the in-flight action counts as stuck
    pub stuck_action_timeout_secs: u64,

    /// Delay between cancelling adapter discovery and connecting
    pub connect_delay_ms: u64,

    pub scan: ScanSettings,

    /// Report actions dropped after exhausting their retries
    pub notify_action_failures: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            stuck_action_timeout_secs: DEFAULT_STUCK_ACTION_TIMEOUT.as_secs(),
            connect_delay_ms: 500,
            scan: ScanSettings::default(),
            notify_action_failures: true,
        }
    }
}

impl SessionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stuck_action_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_action_timeout_secs)
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.stuck_action_timeout_secs == 0 {
            return Err(SettingsError::ConfigError(
                "stuck_action_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(SettingsError::ConfigError(format!(
                "max_retries cannot exceed {}",
                MAX_RETRIES_LIMIT
            )));
        }

        Ok(())
    }

    /// Load settings from JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save settings to JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let json = self.to_json()?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Convert to pretty JSON string
    pub fn to_json(&self) -> Result<String, SettingsError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Create from JSON string
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: SessionSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SessionSettings::default();
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.stuck_action_timeout(), Duration::from_secs(60));
        assert_eq!(settings.connect_delay(), Duration::from_millis(500));
        assert_eq!(settings.scan.mode, ScanMode::LowLatency);
        assert!(settings.scan.deduplicate);
        assert!(settings.notify_action_failures);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let settings = SessionSettings {
            stuck_action_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::ConfigError(_))
        ));
    }

    #[test]
    fn test_retry_limit_enforced() {
        let mut settings = SessionSettings::default();
        settings.max_retries = MAX_RETRIES_LIMIT;
        assert!(settings.validate().is_ok());

        settings.max_retries = MAX_RETRIES_LIMIT + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings =
            SessionSettings::from_json(r#"{"max_retries": 0, "scan": {"mode": "balanced"}}"#)
                .unwrap();
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.scan.mode, ScanMode::Balanced);
        assert!(settings.scan.deduplicate);
        assert_eq!(settings.connect_delay_ms, 500);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            SessionSettings::from_json("{not json"),
            Err(SettingsError::JsonError(_))
        ));
        assert!(matches!(
            SessionSettings::from_json(r#"{"stuck_action_timeout_secs": 0}"#),
            Err(SettingsError::ConfigError(_))
        ));
    }

    #[test]
    fn test_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = SessionSettings {
            connect_delay_ms: 0,
            notify_action_failures: false,
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let loaded = SessionSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SessionSettings::load(dir.path().join("absent.json")),
            Err(SettingsError::IoError(_))
        ));
    }
}
