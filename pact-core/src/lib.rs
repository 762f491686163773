// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pact Core - custody group model and encryption for multisig coordination
//!
//! This crate provides the network-free half of pact:
//! - Context-derived keys (HKDF-SHA256) and sealed envelopes (ChaCha20-Poly1305)
//! - Custody groups, members and roles
//! - Transaction proposals and signature collection
//! - Encrypted blob storage and the wallet backend interface

#![forbid(unsafe_code)]

pub mod crypto;
pub mod error;
pub mod group;
pub mod proposal;
pub mod storage;
pub mod wallet;

pub use crypto::{KeyContext, RootSecret, SealedEnvelope};
pub use error::{PactError, Result, WalletError};
pub use group::{CustodyGroup, Member, Role};
pub use proposal::{Proposal, ProposalDraft, ProposalStatus, Purpose, Signature};
pub use storage::{EncryptedStore, MemoryStore, RedbStore};
pub use wallet::{FeeRate, KeyHandle, WalletBackend};
