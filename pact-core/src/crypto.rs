// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

//! Context-derived authenticated encryption.
//!
//! Every application key is derived with HKDF-SHA256 from one of two roots:
//! the personal root, which never leaves this device, or a custody group's
//! shared root. The derivation info is `"<context>:<identifier>"`, so keys for
//! different purposes under one root are unrelated. Envelopes are sealed with
//! ChaCha20-Poly1305 under a fresh random 96-bit nonce on every call.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{PactError, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const ENVELOPE_VERSION: u8 = 1;
pub const ENVELOPE_OVERHEAD: usize = 1 + NONCE_SIZE + TAG_SIZE;

const HKDF_SALT: &[u8] = b"pact-kdf-v1";
const TOPIC_DOMAIN: &[u8] = b"pact-group-topic-v1";

/// Purpose tag mixed into every key derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyContext {
    PersonalMessages,
    PersonalVault,
    GroupXpubs,
    GroupBalances,
    GroupGoals,
    GroupProposals,
    GroupTopic,
}

impl KeyContext {
    pub fn label(&self) -> &'static str {
        match self {
            KeyContext::PersonalMessages => "personal_messages",
            KeyContext::PersonalVault => "personal_vault",
            KeyContext::GroupXpubs => "group_xpubs",
            KeyContext::GroupBalances => "group_balances",
            KeyContext::GroupGoals => "group_goals",
            KeyContext::GroupProposals => "group_proposals",
            KeyContext::GroupTopic => "group_topic",
        }
    }

    pub fn is_personal(&self) -> bool {
        matches!(
            self,
            KeyContext::PersonalMessages | KeyContext::PersonalVault
        )
    }
}

/// A long-lived root from which purpose keys are derived. Never used to encrypt directly.
#[derive(Clone)]
pub struct RootSecret(Zeroizing<[u8; KEY_SIZE]>);

impl RootSecret {
    pub fn generate() -> Self {
        Self(Zeroizing::new(random_bytes::<KEY_SIZE>()))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| PactError::KeyDerivation(e.to_string()))?,
        );
        if bytes.len() != KEY_SIZE {
            return Err(PactError::KeyDerivation(format!(
                "root secret must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Self::from_bytes(out))
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.0[..]))
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for RootSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for RootSecret {}

impl std::fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootSecret([REDACTED])")
    }
}

impl Serialize for RootSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RootSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        RootSecret::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A purpose key derived from a [`RootSecret`].
pub struct DerivedKey(Zeroizing<[u8; KEY_SIZE]>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

pub fn derive_key(
    root: &RootSecret,
    context: KeyContext,
    identifier: Option<&str>,
) -> Result<DerivedKey> {
    let info = format!("{}:{}", context.label(), identifier.unwrap_or(""));
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), root.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(info.as_bytes(), &mut okm[..])
        .map_err(|e| PactError::KeyDerivation(e.to_string()))?;
    Ok(DerivedKey(okm))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub version: u8,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl SealedEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_OVERHEAD {
            return Err(PactError::Envelope("envelope too short".into()));
        }
        let version = bytes[0];
        if version != ENVELOPE_VERSION {
            return Err(PactError::Envelope(format!(
                "unsupported envelope version {version}"
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[1..1 + NONCE_SIZE]);
        let tag_start = bytes.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[tag_start..]);

        Ok(Self {
            version,
            nonce,
            ciphertext: bytes[1 + NONCE_SIZE..tag_start].to_vec(),
            tag,
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| PactError::Envelope(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

pub fn seal(plaintext: &[u8], key: &DerivedKey) -> Result<SealedEnvelope> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce: [u8; NONCE_SIZE] = random_bytes();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[ENVELOPE_VERSION], &mut buffer)
        .map_err(|_| PactError::Encryption("AEAD encryption failed".into()))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedEnvelope {
        version: ENVELOPE_VERSION,
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

pub fn open(envelope: &SealedEnvelope, key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(PactError::DecryptionFailed);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut buffer = Zeroizing::new(envelope.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.nonce),
            &[envelope.version],
            &mut buffer[..],
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| PactError::DecryptionFailed)?;

    Ok(buffer)
}

pub fn seal_with(
    root: &RootSecret,
    context: KeyContext,
    identifier: Option<&str>,
    plaintext: &[u8],
) -> Result<SealedEnvelope> {
    let key = derive_key(root, context, identifier)?;
    seal(plaintext, &key)
}

pub fn open_with(
    root: &RootSecret,
    context: KeyContext,
    identifier: Option<&str>,
    envelope: &SealedEnvelope,
) -> Result<Zeroizing<Vec<u8>>> {
    let key = derive_key(root, context, identifier)?;
    open(envelope, &key)
}

/// Opaque relay-visible topic for a custody group. Reveals nothing about the group id.
pub fn group_topic(root: &RootSecret) -> Result<String> {
    let key = derive_key(root, KeyContext::GroupTopic, None)?;
    let mut hasher = Sha256::new();
    hasher.update(TOPIC_DOMAIN);
    hasher.update(key.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
