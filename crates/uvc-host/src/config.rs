//! Monitor configuration

use anyhow::{Context, Result, anyhow};
use hostusb::{DeviceFilter, FilterResources};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing and discovery settings for the device monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Discovery poll interval in milliseconds
    #[serde(default = "MonitorConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay before the first poll tick after registering
    #[serde(default = "MonitorConfig::default_initial_poll_delay_ms")]
    pub initial_poll_delay_ms: u64,
    /// Default log level when RUST_LOG is unset
    #[serde(default = "MonitorConfig::default_log_level")]
    pub log_level: String,
    /// Optional `[[usb-device]]` filter list applied by the discovery
    /// poll
    #[serde(default)]
    pub filter_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            initial_poll_delay_ms: Self::default_initial_poll_delay_ms(),
            log_level: Self::default_log_level(),
            filter_file: None,
        }
    }
}

impl MonitorConfig {
    fn default_poll_interval_ms() -> u64 {
        2000
    }

    fn default_initial_poll_delay_ms() -> u64 {
        1000
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn initial_poll_delay(&self) -> Duration {
        Duration::from_millis(self.initial_poll_delay_ms)
    }

    /// Load configuration from the specified path, or from the default
    /// location when none is given.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let candidate = Self::default_path();
                if !candidate.exists() {
                    return Err(anyhow!("no configuration file found"));
                }
                candidate
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        tracing::info!("saved configuration to: {}", path.display());
        Ok(())
    }

    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("uvc-host").join("monitor.toml")
        } else {
            PathBuf::from(".config/uvc-host/monitor.toml")
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.poll_interval_ms < 100 {
            return Err(anyhow!(
                "poll interval {} ms is too small, minimum is 100 ms",
                self.poll_interval_ms
            ));
        }

        Ok(())
    }

    /// Load the discovery filter list named by `filter_file`, empty
    /// when no file is configured.
    pub fn load_filters(&self, resources: &FilterResources) -> Result<Vec<DeviceFilter>> {
        let Some(path) = &self.filter_file else {
            return Ok(Vec::new());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file: {}", path.display()))?;
        DeviceFilter::load_list(&content, resources)
            .with_context(|| format!("failed to parse filter file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.initial_poll_delay_ms, 1000);
        assert_eq!(config.log_level, "info");
        assert!(config.filter_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MonitorConfig::default();
        config.log_level = "chatty".to_string();
        assert!(config.validate().is_err());

        config.log_level = "debug".to_string();
        config.poll_interval_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        let mut config = MonitorConfig::default();
        config.poll_interval_ms = 500;
        config.save(&path).unwrap();

        let loaded = MonitorConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.poll_interval_ms, 500);
        assert_eq!(loaded.log_level, "info");
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: MonitorConfig = toml::from_str("poll_interval_ms = 250").unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.initial_poll_delay_ms, 1000);
    }

    #[test]
    fn test_load_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filters.toml");
        fs::write(&path, "[[usb-device]]\nvendor-id = \"0x1234\"\n").unwrap();

        let mut config = MonitorConfig::default();
        assert!(config.load_filters(&FilterResources::new()).unwrap().is_empty());

        config.filter_file = Some(path);
        let filters = config.load_filters(&FilterResources::new()).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].vendor_id, Some(0x1234));
    }
}
