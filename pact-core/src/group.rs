// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::crypto::RootSecret;
use crate::error::{PactError, Result};

/// Maximum number of signers in one custody group.
pub const MAX_SIGNERS: u8 = 15;

pub const MAX_NAME_LENGTH: usize = 64;
pub const MAX_XPUB_LENGTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Creator,
    Admin,
    Member,
    Observer,
}

impl Role {
    pub fn can_sign(&self) -> bool {
        match self {
            Role::Creator | Role::Admin | Role::Member => true,
            Role::Observer => false,
        }
    }

    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Creator | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Creator => "creator",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Observer => "observer",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    /// x-only relay key the member signs its messages with.
    #[serde(with = "hex::serde")]
    pub pubkey: [u8; 32],
    pub xpub: Option<String>,
    pub active: bool,
    pub role: Role,
    pub joined_at: u64,
}

impl Member {
    pub fn new(id: &str, name: &str, pubkey: [u8; 32], role: Role) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            pubkey,
            xpub: None,
            active: true,
            role,
            joined_at: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }

    pub fn with_xpub(mut self, xpub: &str) -> Self {
        self.xpub = Some(xpub.to_string());
        self
    }

    /// Active, allowed to sign, and has contributed a key.
    pub fn is_eligible_signer(&self) -> bool {
        self.active && self.role.can_sign() && self.xpub.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustodyGroup {
    pub id: String,
    pub name: String,
    pub threshold: u8,
    pub total_signers: u8,
    pub members: Vec<Member>,
    pub root_secret: RootSecret,
    pub balance_sats: u64,
    pub goal_sats: Option<u64>,
    pub descriptor: Option<String>,
    pub created_at: u64,
}

impl CustodyGroup {
    pub fn new(
        id: &str,
        name: &str,
        threshold: u8,
        total_signers: u8,
        creator: Member,
        root_secret: RootSecret,
    ) -> Result<Self> {
        validate_quorum(threshold, total_signers)?;
        if id.is_empty() {
            return Err(PactError::InvalidGroup("group id must not be empty".into()));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(PactError::InvalidGroup("group name too long".into()));
        }

        let mut creator = creator;
        creator.role = Role::Creator;
        creator.active = true;

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            threshold,
            total_signers,
            members: vec![creator],
            root_secret,
            balance_sats: 0,
            goal_sats: None,
            descriptor: None,
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
        })
    }

    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == member_id)
    }

    pub fn member_by_pubkey(&self, pubkey: &[u8; 32]) -> Option<&Member> {
        self.members.iter().find(|m| &m.pubkey == pubkey)
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.active)
    }

    pub fn eligible_signers(&self) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|m| m.is_eligible_signer())
            .collect()
    }

    pub fn signing_members(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.active && m.role.can_sign())
            .count()
    }

    pub fn is_sealed(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Fails unless `member_id` is an active member whose role may create and sign.
    pub fn require_signer(&self, member_id: &str) -> Result<&Member> {
        let member = self
            .member(member_id)
            .ok_or_else(|| PactError::PermissionDenied(format!("{member_id} is not a member")))?;
        if !member.active {
            return Err(PactError::PermissionDenied(format!(
                "{member_id} is no longer active"
            )));
        }
        if !member.role.can_sign() {
            return Err(PactError::PermissionDenied(format!(
                "{member_id} has role {} and cannot sign",
                member.role
            )));
        }
        Ok(member)
    }

    /// Adds a member before the wallet descriptor exists. Returns `false` if already present.
    pub fn join(&mut self, member: Member) -> Result<bool> {
        if self.member(&member.id).is_some() {
            return Ok(false);
        }
        if self.is_sealed() {
            return Err(PactError::InvalidGroup(
                "wallet descriptor already generated; membership is frozen".into(),
            ));
        }
        if member.name.len() > MAX_NAME_LENGTH {
            return Err(PactError::InvalidGroup("member name too long".into()));
        }
        if self.member_by_pubkey(&member.pubkey).is_some() {
            return Err(PactError::InvalidGroup(
                "relay key already registered to another member".into(),
            ));
        }

        if member.role.can_sign() && self.signing_members() + 1 > self.total_signers as usize {
            if self.total_signers >= MAX_SIGNERS {
                return Err(PactError::InvalidGroup(format!(
                    "group already has {MAX_SIGNERS} signers"
                )));
            }
            self.total_signers += 1;
        }

        self.members.push(member);
        Ok(true)
    }

    /// Records a member's extended public key. Returns `false` if the same key was already recorded.
    pub fn contribute_key(&mut self, member_id: &str, xpub: &str) -> Result<bool> {
        if xpub.is_empty() || xpub.len() > MAX_XPUB_LENGTH {
            return Err(PactError::InvalidGroup("invalid xpub length".into()));
        }
        let sealed = self.is_sealed();
        let member = self
            .members
            .iter_mut()
            .find(|m| m.id == member_id)
            .ok_or_else(|| PactError::MemberNotFound(member_id.to_string()))?;

        match &member.xpub {
            Some(existing) if existing == xpub => return Ok(false),
            Some(_) if sealed => {
                return Err(PactError::InvalidGroup(
                    "cannot replace a key after descriptor generation".into(),
                ))
            }
            None if sealed => {
                return Err(PactError::InvalidGroup(
                    "cannot contribute a key after descriptor generation".into(),
                ))
            }
            _ => {}
        }
        member.xpub = Some(xpub.to_string());
        Ok(true)
    }

    pub fn remove_member(&mut self, member_id: &str) -> Result<()> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.id == member_id)
            .ok_or_else(|| PactError::MemberNotFound(member_id.to_string()))?;
        member.active = false;
        Ok(())
    }

    /// Contributed xpubs of eligible signers, sorted so every member derives the same descriptor.
    pub fn contributed_xpubs(&self) -> Vec<String> {
        let mut xpubs: Vec<String> = self
            .eligible_signers()
            .into_iter()
            .filter_map(|m| m.xpub.clone())
            .collect();
        xpubs.sort();
        xpubs
    }

    /// Freezes the threshold and membership.
    pub fn seal_descriptor(&mut self, descriptor: &str) -> Result<()> {
        if let Some(existing) = &self.descriptor {
            if existing == descriptor {
                return Ok(());
            }
            return Err(PactError::InvalidGroup(
                "a different wallet descriptor is already set".into(),
            ));
        }
        let contributed = self.contributed_xpubs().len();
        if contributed < self.threshold as usize {
            return Err(PactError::InsufficientSigners {
                needed: self.threshold as usize,
                available: contributed,
            });
        }
        self.descriptor = Some(descriptor.to_string());
        Ok(())
    }

    pub fn set_balance(&mut self, balance_sats: u64, goal_sats: Option<u64>) {
        self.balance_sats = balance_sats;
        if goal_sats.is_some() {
            self.goal_sats = goal_sats;
        }
    }
}

fn validate_quorum(threshold: u8, total: u8) -> Result<()> {
    if threshold == 0 {
        return Err(PactError::InvalidGroup("threshold must be at least 1".into()));
    }
    if threshold > total {
        return Err(PactError::InvalidGroup(format!(
            "threshold {threshold} exceeds signer count {total}"
        )));
    }
    if total > MAX_SIGNERS {
        return Err(PactError::InvalidGroup(format!(
            "at most {MAX_SIGNERS} signers are supported"
        )));
    }
    Ok(())
}
