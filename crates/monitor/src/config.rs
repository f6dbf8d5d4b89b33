//! Monitor configuration management
//!
//! ```toml
//! [monitor]
//! poll_interval_ms = 2000
//! initial_poll_delay_ms = 100
//! key_mode = "precise"
//! auto_request_permission = false
//! log_level = "info"
//! filters = ["0x8801:*"]
//!
//! [[rules]]
//! vendor_id = 0x8801
//! product_id = 0x0002
//! exclude = true
//! ```
//!
//! `filters` holds `VID:PID` shorthands; `rules` holds full
//! [`DeviceFilter`]s. Both end up in one filter list, shorthands first.

use crate::monitor::MonitorSettings;
use anyhow::{Context, Result, anyhow};
use common::LOG_LEVELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usb_types::{DeviceFilter, KeyMode};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub monitor: MonitorSection,
    /// Detailed filter rules
    #[serde(default)]
    pub rules: Vec<DeviceFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "MonitorSection::default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "MonitorSection::default_initial_poll_delay")]
    pub initial_poll_delay_ms: u64,
    #[serde(default)]
    pub key_mode: KeyMode,
    /// Request permission for every device as soon as it is announced
    #[serde(default)]
    pub auto_request_permission: bool,
    #[serde(default = "MonitorSection::default_log_level")]
    pub log_level: String,
    /// `VID:PID` filter shorthands
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
            initial_poll_delay_ms: Self::default_initial_poll_delay(),
            key_mode: KeyMode::default(),
            auto_request_permission: false,
            log_level: Self::default_log_level(),
            filters: Vec::new(),
        }
    }
}

impl MonitorSection {
    fn default_poll_interval() -> u64 {
        2000
    }

    fn default_initial_poll_delay() -> u64 {
        100
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl MonitorConfig {
    /// Load configuration from file
    ///
    /// Without an explicit path, the user config directory is tried first,
    /// then `/etc/usb-monitor/monitor.toml`. A leading `~` is expanded.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => {
                let candidates = [Self::default_path(), PathBuf::from("/etc/usb-monitor/monitor.toml")];
                candidates
                    .into_iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| anyhow!("No configuration file found"))?
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_path(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        fs::write(&path, content).with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-monitor").join("monitor.toml")
        } else {
            PathBuf::from(".config/usb-monitor/monitor.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        for pattern in &self.monitor.filters {
            pattern.parse::<DeviceFilter>()?;
        }

        Ok(())
    }

    /// Monitor tuning derived from the `[monitor]` section
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(self.monitor.poll_interval_ms),
            initial_poll_delay: Duration::from_millis(self.monitor.initial_poll_delay_ms),
            key_mode: self.monitor.key_mode,
        }
    }

    /// Shorthand filters followed by detailed rules
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        let mut filters = Vec::with_capacity(self.monitor.filters.len() + self.rules.len());
        for pattern in &self.monitor.filters {
            filters.push(
                pattern
                    .parse::<DeviceFilter>()
                    .with_context(|| format!("Invalid filter '{}'", pattern))?,
            );
        }
        filters.extend(self.rules.iter().cloned());
        Ok(filters)
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
