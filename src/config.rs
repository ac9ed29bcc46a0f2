//! Application configuration management.
//!
//! This module handles loading and saving the client configuration:
//! the backend URL, the last used username, and every engine timing
//! (staleness and gc defaults, retry backoff, probe cadence, restore
//! bound). Values are stored as milliseconds and exposed as `Duration`.
//!
//! Configuration is stored at `~/.config/shopsync/config.json`, with
//! `SHOPSYNC_*` environment variables applied on top at load time.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::SessionVault;
use crate::cache::QueryOptions;
use crate::net::NetworkConfig;

/// Application name used for config/data directory paths
const APP_NAME: &str = "shopsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "https://api.shopsync.app";

// Engine timing defaults, all in milliseconds. stale_time defaults to 0:
// queries are always revalidated unless they opt into a window.
const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 300_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RESTORE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub last_username: Option<String>,
    pub stale_time_ms: u64,
    pub gc_time_ms: u64,
    pub retry_backoff_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub restore_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            last_username: None,
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            restore_timeout_ms: DEFAULT_RESTORE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the sealed session file
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Session vault in the data directory, sealing key from the OS keychain
    pub fn session_vault(&self) -> Result<SessionVault> {
        let dir = Self::data_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        SessionVault::from_keyring(dir)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SHOPSYNC_API_URL") {
            self.api_url = url;
        }
        apply_ms_override("SHOPSYNC_STALE_TIME_MS", &mut self.stale_time_ms);
        apply_ms_override("SHOPSYNC_GC_TIME_MS", &mut self.gc_time_ms);
        apply_ms_override("SHOPSYNC_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms);
        apply_ms_override("SHOPSYNC_PROBE_INTERVAL_MS", &mut self.probe_interval_ms);
        apply_ms_override("SHOPSYNC_PROBE_TIMEOUT_MS", &mut self.probe_timeout_ms);
        apply_ms_override("SHOPSYNC_RESTORE_TIMEOUT_MS", &mut self.restore_timeout_ms);
        apply_ms_override("SHOPSYNC_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
    }

    // ===== Engine views =====

    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Liveness probe target, served unauthenticated by the backend
    pub fn probe_url(&self) -> String {
        format!("{}/health", self.api_url.trim_end_matches('/'))
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    /// Baseline options for queries that do not override their own timings
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions::default()
            .with_stale_time(self.stale_time())
            .with_gc_time(self.gc_time())
    }
}

fn apply_ms_override(name: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(ms) => *slot = ms,
            Err(_) => warn!(variable = name, value = %raw, "ignoring non-numeric override"),
        }
    }
}
