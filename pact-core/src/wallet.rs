// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pluggable wallet backend.
//!
//! PSBT construction, signing, combination and broadcast live outside the
//! coordination core. Implementations may be hardware-bound and slow.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

pub type WalletResult<T> = std::result::Result<T, WalletError>;

/// Fee rate in sat/vB.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeeRate(pub f64);

impl Default for FeeRate {
    fn default() -> Self {
        FeeRate(2.0)
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sat/vB", self.0)
    }
}

/// Opaque reference to the local signing key, resolved by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle(pub String);

impl KeyHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait WalletBackend: Send + Sync {
    async fn build_unsigned_transaction(
        &self,
        destination: &str,
        amount_sats: u64,
        fee_rate: FeeRate,
        descriptor: &str,
    ) -> WalletResult<Vec<u8>>;

    async fn partial_sign(&self, unsigned_tx: &[u8], key: &KeyHandle) -> WalletResult<Vec<u8>>;

    async fn combine(&self, unsigned_tx: &[u8], partial_sigs: &[Vec<u8>]) -> WalletResult<Vec<u8>>;

    /// Returns the transaction id.
    async fn broadcast(&self, final_tx: &[u8]) -> WalletResult<String>;

    /// Builds the group's multisig descriptor from the threshold and sorted xpubs.
    async fn build_descriptor(&self, threshold: u8, xpubs: &[String]) -> WalletResult<String>;
}
