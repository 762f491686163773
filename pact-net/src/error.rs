// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use pact_core::{PactError, WalletError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error(transparent)]
    Core(#[from] PactError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid relay URL {url}: {reason}")]
    InvalidRelay { url: String, reason: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Nostr error: {0}")]
    Nostr(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<WalletError> for NetError {
    fn from(e: WalletError) -> Self {
        NetError::Core(PactError::Wallet(e))
    }
}

impl NetError {
    /// The core error, if this wraps one.
    pub fn core(&self) -> Option<&PactError> {
        match self {
            NetError::Core(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
