//! Configuration loading and persistence.
//!
//! Reads and writes the hubwire configuration file (`config.json`) and
//! applies `HUBWIRE_*` environment overrides on top of it. The auth token is
//! never written to disk; it comes from `HUBWIRE_TOKEN` or the command line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::constants::{
    HANDSHAKE_TIMEOUT, INITIAL_BACKOFF, MAX_BACKOFF, PING_INTERVAL, SEND_QUEUE_CAPACITY,
};
use crate::hub::{Backoff, HubClientBuilder};

/// File name inside [`Config::config_dir`].
const CONFIG_FILE: &str = "config.json";

/// Header selecting the backend node that serves the hub.
pub const NODE_HEADER: &str = "X-Server-Select";

/// Configuration for the hubwire client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the service.
    pub server_url: String,
    /// Path of the hub below `server_url`.
    pub hub_path: String,
    /// Backend node to route to, sent as `X-Server-Select`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Auth token - NOT serialized to disk.
    #[serde(skip)]
    pub token: String,
    /// Seconds between liveness pings; 0 disables them.
    pub ping_interval_secs: u64,
    /// First reconnection delay in milliseconds.
    pub backoff_initial_ms: u64,
    /// Largest reconnection delay in milliseconds.
    pub backoff_max_ms: u64,
    /// Seconds to wait for the handshake acknowledgment.
    pub handshake_timeout_secs: u64,
    /// Outbound records buffered per connection.
    pub send_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://app.valour.gg".to_string(),
            hub_path: "hubs/core".to_string(),
            node: None,
            token: String::new(),
            ping_interval_secs: PING_INTERVAL.as_secs(),
            backoff_initial_ms: u64::try_from(INITIAL_BACKOFF.as_millis()).unwrap_or(u64::MAX),
            backoff_max_ms: u64::try_from(MAX_BACKOFF.as_millis()).unwrap_or(u64::MAX),
            handshake_timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            send_queue_capacity: SEND_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `HUBWIRE_CONFIG_DIR` overrides the platform config directory
    /// (macOS: ~/Library/Application Support/hubwire).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("HUBWIRE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("hubwire")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads the configuration file, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?.join(CONFIG_FILE))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Applies `HUBWIRE_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("HUBWIRE_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(hub_path) = lookup("HUBWIRE_HUB_PATH") {
            self.hub_path = hub_path;
        }

        if let Some(node) = lookup("HUBWIRE_NODE") {
            self.node = (!node.is_empty()).then_some(node);
        }

        // Token from env var (for CI/CD)
        if let Some(token) = lookup("HUBWIRE_TOKEN") {
            self.token = token;
        }

        if let Some(ping_interval) = lookup("HUBWIRE_PING_INTERVAL") {
            match ping_interval.parse::<u64>() {
                Ok(secs) => self.ping_interval_secs = secs,
                Err(_) => log::warn!("Ignoring invalid HUBWIRE_PING_INTERVAL={ping_interval}"),
            }
        }
    }

    /// Persists the configuration to the config directory.
    /// Note: the token is NOT saved.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Persists the configuration to `path` (owner read/write only).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Check if an auth token is configured.
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Full hub URL: `server_url` joined with `hub_path`.
    pub fn hub_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let path = self.hub_path.trim_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    /// A [`HubClientBuilder`] carrying this configuration.
    ///
    /// Adds `X-Server-Select` when a node is set and `Authorization` when a
    /// token is present.
    pub fn client_builder(&self) -> HubClientBuilder {
        let ping_interval =
            (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs));

        let mut builder = HubClientBuilder::new(self.hub_url())
            .backoff(Backoff::new(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_millis(self.backoff_max_ms),
            ))
            .ping_interval(ping_interval)
            .handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .send_queue_capacity(self.send_queue_capacity);

        if let Some(node) = &self.node {
            builder = builder.header(NODE_HEADER, node.as_str());
        }
        if self.has_token() {
            builder = builder.header("Authorization", self.token.as_str());
        }
        builder
    }
}
