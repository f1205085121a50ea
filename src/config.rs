// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading role settings from `config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::client;
use crate::bluetooth::ClientOptions;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peripheral settings.
    pub server: ServerConfig,

    /// Central settings.
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used for the adapter alias and in advertisements.
    pub device_name: String,

    /// Period between notifications to a subscribed central, in milliseconds.
    pub notify_period_ms: u64,
}

impl ServerConfig {
    pub fn notify_period(&self) -> Duration {
        Duration::from_millis(self.notify_period_ms.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device_name: "CTS Server".to_string(),
            notify_period_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Adapter alias, also the name used when self-advertising.
    pub device_name: String,

    /// Give up scanning after this many seconds.
    pub scan_timeout_secs: u64,

    /// Advertise the client as well. Has no effect on the time exchange.
    pub self_advertise: bool,

    /// Stop after this many reads. Unset reads until the link drops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reads: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: "CTS Client".to_string(),
            scan_timeout_secs: client::DEFAULT_SCAN_TIMEOUT.as_secs(),
            self_advertise: false,
            max_reads: None,
        }
    }
}

impl ClientConfig {
    /// Options for one client run.
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            max_reads: self.max_reads,
            self_advertise: self.self_advertise.then(|| self.device_name.clone()),
            ..Default::default()
        }
    }
}

impl Config {
    /// Default location, `<config dir>/cts-link/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cts-link")
            .join("config.toml")
    }

    /// Load configuration from the default location or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
