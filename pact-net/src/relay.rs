// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Maximum length of a relay URL.
pub const MAX_RELAY_URL_LENGTH: usize = 256;

/// Static tier used only to order initial connection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPriority {
    High,
    Medium,
    Low,
}

impl std::str::FromStr for RelayPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(RelayPriority::High),
            "medium" => Ok(RelayPriority::Medium),
            "low" => Ok(RelayPriority::Low),
            other => Err(format!("unknown relay priority '{other}'")),
        }
    }
}

impl std::fmt::Display for RelayPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelayPriority::High => "high",
            RelayPriority::Medium => "medium",
            RelayPriority::Low => "low",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelayState::Connecting => "connecting",
            RelayState::Connected => "connected",
            RelayState::Disconnected => "disconnected",
            RelayState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A configured relay address and its priority tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    pub priority: RelayPriority,
}

impl RelayEndpoint {
    /// A public `wss://` relay.
    pub fn new(url: &str, priority: RelayPriority) -> Result<Self> {
        validate_relay_url(url).map_err(|reason| NetError::InvalidRelay {
            url: url.to_string(),
            reason,
        })?;
        Ok(Self {
            url: url.to_string(),
            priority,
        })
    }

    /// Accepts `ws://` and internal hosts, for local relays during development.
    pub fn allow_internal(url: &str, priority: RelayPriority) -> Result<Self> {
        validate_relay_url_allow_internal(url).map_err(|reason| NetError::InvalidRelay {
            url: url.to_string(),
            reason,
        })?;
        Ok(Self {
            url: url.to_string(),
            priority,
        })
    }
}

/// Point-in-time view of one relay connection.
#[derive(Clone, Debug)]
pub struct RelayStatus {
    pub url: String,
    pub priority: RelayPriority,
    pub state: RelayState,
    pub last_message_age: Option<Duration>,
    pub sent: u64,
    pub received: u64,
    pub subscriptions: usize,
    pub consecutive_failures: u32,
    pub queued: usize,
}

/// Built-in relay list, highest priority first.
pub fn default_relays() -> Vec<RelayEndpoint> {
    [
        ("wss://relay.damus.io", RelayPriority::High),
        ("wss://nos.lol", RelayPriority::High),
        ("wss://relay.primal.net", RelayPriority::Medium),
        ("wss://relay.nostr.band", RelayPriority::Low),
    ]
    .into_iter()
    .map(|(url, priority)| RelayEndpoint {
        url: url.to_string(),
        priority,
    })
    .collect()
}

/// Validate a relay URL.
///
/// Returns Ok(()) if the URL is a valid wss:// URL pointing to a public host.
pub fn validate_relay_url(url: &str) -> std::result::Result<(), String> {
    let rest = url
        .strip_prefix("wss://")
        .ok_or("Must use wss:// protocol")?;
    let host = parse_host(url, rest)?;
    if is_internal_host(host) {
        return Err("Internal addresses not allowed".into());
    }
    Ok(())
}

/// Like [`validate_relay_url`] but also accepts `ws://` and internal hosts.
pub fn validate_relay_url_allow_internal(url: &str) -> std::result::Result<(), String> {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .ok_or("Must use ws:// or wss:// protocol")?;
    parse_host(url, rest).map(|_| ())
}

fn parse_host<'a>(url: &str, rest: &'a str) -> std::result::Result<&'a str, String> {
    if url.len() > MAX_RELAY_URL_LENGTH {
        return Err("URL too long".into());
    }
    if rest.is_empty() {
        return Err("Missing host".into());
    }

    let host_port = rest.split('/').next().unwrap_or(rest);
    let host = match host_port.rfind(':') {
        Some(colon_pos) if !host_port.ends_with(']') => {
            let port_str = &host_port[colon_pos + 1..];
            match port_str.parse::<u16>() {
                Ok(0) | Err(_) => return Err("Invalid port".into()),
                Ok(_) => {}
            }
            &host_port[..colon_pos]
        }
        _ => host_port,
    };

    if host.is_empty() {
        return Err("Missing host".into());
    }

    if !host.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '[' || c == ']' || c == ':'
    }) {
        return Err("Invalid host characters".into());
    }
    Ok(host)
}

fn is_internal_host(host: &str) -> bool {
    let host = host.to_lowercase();

    const FORBIDDEN: &[&str] = &[
        "localhost",
        "127.0.0.1",
        "0.0.0.0",
        "::1",
        "[::1]",
        "169.254.169.254",
    ];

    FORBIDDEN.contains(&host.as_str())
        || host.ends_with(".local")
        || host.ends_with(".localhost")
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("169.254.")
        || is_private_172(host.as_str())
}

fn is_private_172(host: &str) -> bool {
    host.strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|s| s.parse::<u8>().ok())
        .is_some_and(|octet| (16..=31).contains(&octet))
}
