// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use pact_core::FeeRate;
use pact_net::{default_relays, RelayEndpoint, RelayPriority, TransportConfig};

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

fn default_priority() -> RelayPriority {
    RelayPriority::Medium
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayEntry {
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: RelayPriority,
}

fn deserialize_relays<'de, D>(deserializer: D) -> std::result::Result<Vec<RelayEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let relays: Vec<RelayEntry> = Vec::deserialize(deserializer)?;
    for relay in &relays {
        if !relay.url.starts_with("wss://") && !relay.url.starts_with("ws://") {
            return Err(serde::de::Error::custom(format!(
                "Invalid relay URL: '{}'. Must start with wss:// or ws://",
                relay.url
            )));
        }
    }
    Ok(relays)
}

fn deserialize_timeout<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<u64>::deserialize(deserializer)?;
    if opt == Some(0) {
        return Err(serde::de::Error::custom("timeout must be greater than 0"));
    }
    Ok(opt)
}

fn deserialize_fee_rate<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<f64>::deserialize(deserializer)?;
    if opt.is_some_and(|r| !r.is_finite() || r <= 0.0) {
        return Err(serde::de::Error::custom("fee_rate must be a positive number"));
    }
    Ok(opt)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, deserialize_with = "deserialize_relays")]
    pub relays: Vec<RelayEntry>,
    /// Seconds to wait for the initial relay connections.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Option<u64>,
    /// sat/vB used when building transactions.
    #[serde(default, deserialize_with = "deserialize_fee_rate")]
    pub fee_rate: Option<f64>,
    /// Accept `ws://` and private-network relays, for local development.
    #[serde(default)]
    pub allow_internal_relays: bool,
}

impl Config {
    /// Reads `path`, or the default location; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        const MAX_CONFIG_SIZE: u64 = 1024 * 1024;
        let metadata = std::fs::metadata(path).map_err(|e| {
            CliError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(CliError::Config("Config file too large".into()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CliError::Config(format!("Invalid config: {}", e)))
    }

    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("pact").join("config.toml"))
            .ok_or(CliError::HomeNotFound)
    }

    /// Configured relays, or the built-in list when none are configured.
    pub fn endpoints(&self) -> Result<Vec<RelayEndpoint>> {
        if self.relays.is_empty() {
            return Ok(default_relays());
        }
        self.relays
            .iter()
            .map(|r| {
                let endpoint = if self.allow_internal_relays {
                    RelayEndpoint::allow_internal(&r.url, r.priority)
                } else {
                    RelayEndpoint::new(&r.url, r.priority)
                };
                endpoint.map_err(CliError::from)
            })
            .collect()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(10)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.timeout_secs()),
            ..TransportConfig::default()
        }
    }

    pub fn fee_rate(&self) -> FeeRate {
        self.fee_rate.map(FeeRate).unwrap_or_default()
    }
}
