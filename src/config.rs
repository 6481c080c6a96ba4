//! Operator configuration
//!
//! Stored in ~/.relaymesh/config.json; a missing file means defaults.

use anyhow::{Context, Result};
use relaymesh_control::{AllocatorConfig, AutopilotConfig};
use relaymesh_engines::{ReconnectPolicy, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);

fn relaymesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relaymesh")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaymeshConfig {
    /// Registry database (SQLite or PostgreSQL URL)
    pub database_url: String,
    /// Directory for rendered engine configs
    pub work_dir: PathBuf,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub max_retries: u32,
    pub reconnect_backoff_secs: u64,
    pub settle_delay_ms: u64,
    pub autopilot_interval_secs: u64,
    pub sample_retention_hours: u64,
}

impl Default for RelaymeshConfig {
    fn default() -> Self {
        let home = relaymesh_home();
        Self {
            database_url: format!("sqlite://{}?mode=rwc", home.join("relaymesh.db").display()),
            work_dir: home.join("run"),
            port_range_start: 10000,
            port_range_end: 65000,
            max_retries: 10,
            reconnect_backoff_secs: 30,
            settle_delay_ms: 3000,
            autopilot_interval_secs: 60,
            sample_retention_hours: 168,
        }
    }
}

impl RelaymeshConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::fixed(
            self.max_retries,
            Duration::from_secs(self.reconnect_backoff_secs),
        )
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            work_dir: self.work_dir.clone(),
            policy: self.reconnect_policy(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            stop_grace: STOP_GRACE,
        }
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig::new(self.port_range_start, self.port_range_end)
    }

    pub fn autopilot_config(&self) -> AutopilotConfig {
        AutopilotConfig {
            retention: Duration::from_secs(self.sample_retention_hours * 3600),
            ..Default::default()
        }
    }

    pub fn autopilot_interval(&self) -> Duration {
        Duration::from_secs(self.autopilot_interval_secs.max(1))
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".relaymesh").join("config.json"))
    }

    /// Load the configuration from disk
    pub fn load() -> Result<RelaymeshConfig> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<RelaymeshConfig> {
        if !path.exists() {
            return Ok(RelaymeshConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", path))
    }

    /// Save the configuration to disk
    pub fn save(config: &RelaymeshConfig) -> Result<()> {
        Self::save_to(&Self::config_path()?, config)
    }

    pub fn save_to(path: &Path, config: &RelaymeshConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    pub fn set_database_url(url: String) -> Result<()> {
        let mut config = Self::load()?;
        config.database_url = url;
        Self::save(&config)
    }
}
