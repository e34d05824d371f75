// Settings file management for the gattlink CLI
//
// Cross-platform settings stored in:
// - Linux: ~/.config/gattlink/settings.json
// - macOS: ~/Library/Application Support/gattlink/settings.json
// - Windows: %APPDATA%\gattlink\settings.json

use anyhow::{Context, Result};
use gattlink_core::{ScanMode, SessionSettings};
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("gattlink");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

/// Get the settings file path
pub fn settings_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("settings.json"))
}

/// Load settings from `path`, writing defaults if the file does not exist
pub fn load_or_init(path: &Path) -> Result<SessionSettings> {
    if path.exists() {
        SessionSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))
    } else {
        let settings = SessionSettings::default();
        save(&settings, path)?;
        Ok(settings)
    }
}

pub fn save(settings: &SessionSettings, path: &Path) -> Result<()> {
    settings
        .save(path)
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}

fn parse_scan_mode(value: &str) -> Result<ScanMode> {
    match value {
        "low_power" => Ok(ScanMode::LowPower),
        "balanced" => Ok(ScanMode::Balanced),
        "low_latency" => Ok(ScanMode::LowLatency),
        other => anyhow::bail!("Invalid scan mode: {} (low_power|balanced|low_latency)", other),
    }
}

fn scan_mode_name(mode: ScanMode) -> &'static str {
    match mode {
        ScanMode::LowPower => "low_power",
        ScanMode::Balanced => "balanced",
        ScanMode::LowLatency => "low_latency",
    }
}

/// Set a settings value; the result is validated before it is returned
pub fn set(settings: &mut SessionSettings, key: &str, value: &str) -> Result<()> {
    let mut updated = settings.clone();
    match key {
        "max_retries" => {
            updated.max_retries = value.parse().context("Invalid number")?;
        }
        "stuck_action_timeout_secs" => {
            updated.stuck_action_timeout_secs = value.parse().context("Invalid number")?;
        }
        "connect_delay_ms" => {
            updated.connect_delay_ms = value.parse().context("Invalid number")?;
        }
        "scan.mode" => {
            updated.scan.mode = parse_scan_mode(value)?;
        }
        "scan.deduplicate" => {
            updated.scan.deduplicate = value.parse().context("Invalid boolean value")?;
        }
        "notify_action_failures" => {
            updated.notify_action_failures = value.parse().context("Invalid boolean value")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    updated.validate()?;
    *settings = updated;
    Ok(())
}

/// Get a settings value
pub fn get(settings: &SessionSettings, key: &str) -> Option<String> {
    match key {
        "max_retries" => Some(settings.max_retries.to_string()),
        "stuck_action_timeout_secs" => Some(settings.stuck_action_timeout_secs.to_string()),
        "connect_delay_ms" => Some(settings.connect_delay_ms.to_string()),
        "scan.mode" => Some(scan_mode_name(settings.scan.mode).to_string()),
        "scan.deduplicate" => Some(settings.scan.deduplicate.to_string()),
        "notify_action_failures" => Some(settings.notify_action_failures.to_string()),
        _ => None,
    }
}

/// List all settings values
pub fn list(settings: &SessionSettings) -> Vec<(String, String)> {
    [
        "max_retries",
        "stuck_action_timeout_secs",
        "connect_delay_ms",
        "scan.mode",
        "scan.deduplicate",
        "notify_action_failures",
    ]
    .iter()
    .filter_map(|key| get(settings, key).map(|value| (key.to_string(), value)))
    .collect()
}
