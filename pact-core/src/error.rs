// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PactError {
    #[error("Decryption failed - wrong key or corrupted envelope")]
    DecryptionFailed,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Malformed envelope: {0}")]
    Envelope(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Member {0} already signed this proposal")]
    AlreadySigned(String),

    #[error("Not enough signatures: need {needed}, have {have}")]
    InsufficientSignatures { needed: usize, have: usize },

    #[error("Not enough signers with a contributed key: need {needed}, have {available}")]
    InsufficientSigners { needed: usize, available: usize },

    #[error("Invalid proposal state: {0}")]
    InvalidState(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a wallet backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// The backend refused the operation permanently (bad PSBT, policy, mempool rejection).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The backend or its network was unreachable; the call may succeed later.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The signer declined to produce a signature.
    #[error("signing refused: {0}")]
    SigningRefused(String),
}

impl WalletError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::Unavailable(_))
    }
}

impl From<redb::DatabaseError> for PactError {
    fn from(e: redb::DatabaseError) -> Self {
        PactError::Database(e.to_string())
    }
}

impl From<redb::TransactionError> for PactError {
    fn from(e: redb::TransactionError) -> Self {
        PactError::Database(e.to_string())
    }
}

impl From<redb::TableError> for PactError {
    fn from(e: redb::TableError) -> Self {
        PactError::Database(e.to_string())
    }
}

impl From<redb::StorageError> for PactError {
    fn from(e: redb::StorageError) -> Self {
        PactError::Database(e.to_string())
    }
}

impl From<redb::CommitError> for PactError {
    fn from(e: redb::CommitError) -> Self {
        PactError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PactError>;
