//! Application paths and the JSON configuration file
//!
//! Lookup priority for the config directory:
//! 1. CLI `--config-dir`
//! 2. `ANIMCACHE_CONFIG_DIR` environment variable
//! 3. Platform config directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/animcache/{name}
//! - macOS: ~/Library/Application Support/animcache/{name}
//! - Windows: %APPDATA%\animcache\{name}

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::populator::PopulatorConfig;

pub const APP_NAME: &str = "animcache";
pub const CONFIG_FILE: &str = "animcache.json";
pub const LOG_FILE: &str = "animcache.log";
const CONFIG_DIR_ENV: &str = "ANIMCACHE_CONFIG_DIR";

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    dirs_next::config_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    dirs_next::data_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Path to a configuration file
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Path to a data file (logs)
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Create config and data directories if missing
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

/// Persistent application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub populator: PopulatorConfig,
    /// Threads for color conversion (0 = half the CPUs)
    pub conversion_threads: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            populator: PopulatorConfig::default(),
            conversion_threads: 0,
        }
    }
}

impl AppConfig {
    /// Effective worker count, never zero
    pub fn worker_threads(&self) -> usize {
        if self.conversion_threads > 0 {
            self.conversion_threads
        } else {
            (num_cpus::get() / 2).max(1)
        }
    }

    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))?;
        info!("Saved config to {}", path.display());
        Ok(())
    }
}
