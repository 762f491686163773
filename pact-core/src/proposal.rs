// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PactError, Result};
use crate::group::MAX_SIGNERS;

pub const MAX_NOTE_LENGTH: usize = 512;
pub const MAX_DESTINATION_LENGTH: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    GoalWithdrawal,
    Emergency,
    Partial,
    Rebalance,
    Test,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Purpose::GoalWithdrawal => "goal withdrawal",
            Purpose::Emergency => "emergency",
            Purpose::Partial => "partial withdrawal",
            Purpose::Rebalance => "rebalance",
            Purpose::Test => "test",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    PendingSignatures,
    ReadyToBroadcast,
    Broadcasted,
    Confirmed,
    Failed,
    Cancelled,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Confirmed | ProposalStatus::Failed | ProposalStatus::Cancelled
        )
    }

    pub fn accepts_signatures(&self) -> bool {
        matches!(
            self,
            ProposalStatus::PendingSignatures | ProposalStatus::ReadyToBroadcast
        )
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProposalStatus::PendingSignatures => "pending_signatures",
            ProposalStatus::ReadyToBroadcast => "ready_to_broadcast",
            ProposalStatus::Broadcasted => "broadcasted",
            ProposalStatus::Confirmed => "confirmed",
            ProposalStatus::Failed => "failed",
            ProposalStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signer_id: String,
    pub signer_name: String,
    pub signed_at: u64,
    #[serde(with = "hex::serde")]
    pub partial_sig: Vec<u8>,
}

impl Signature {
    pub fn new(signer_id: &str, signer_name: &str, partial_sig: Vec<u8>) -> Self {
        Self {
            signer_id: signer_id.to_string(),
            signer_name: signer_name.to_string(),
            signed_at: now_secs(),
            partial_sig,
        }
    }
}

/// Everything needed to create a [`Proposal`].
#[derive(Clone, Debug)]
pub struct ProposalDraft {
    pub group_id: String,
    pub destination: String,
    pub amount_sats: u64,
    pub purpose: Purpose,
    pub creator_id: String,
    pub note: Option<String>,
    pub required_signatures: u8,
}

impl ProposalDraft {
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(PactError::InvalidProposal("group id must not be empty".into()));
        }
        if self.destination.is_empty() || self.destination.len() > MAX_DESTINATION_LENGTH {
            return Err(PactError::InvalidProposal("invalid destination".into()));
        }
        if self.amount_sats == 0 {
            return Err(PactError::InvalidProposal("amount must be positive".into()));
        }
        if self.required_signatures == 0 || self.required_signatures > MAX_SIGNERS {
            return Err(PactError::InvalidProposal(format!(
                "required signatures must be within 1..={MAX_SIGNERS}"
            )));
        }
        if self
            .note
            .as_ref()
            .is_some_and(|n| n.len() > MAX_NOTE_LENGTH)
        {
            return Err(PactError::InvalidProposal("note too long".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub group_id: String,
    #[serde(with = "hex::serde")]
    pub unsigned_tx: Vec<u8>,
    pub destination: String,
    pub amount_sats: u64,
    pub purpose: Purpose,
    pub creator_id: String,
    pub note: Option<String>,
    /// Copied from the group at creation; later threshold changes do not apply.
    pub required_signatures: u8,
    pub signatures: BTreeMap<String, Signature>,
    pub status: ProposalStatus,
    pub txid: Option<String>,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Proposal {
    pub fn new(id: &str, draft: ProposalDraft, unsigned_tx: Vec<u8>) -> Result<Self> {
        draft.validate()?;
        if id.is_empty() {
            return Err(PactError::InvalidProposal("proposal id must not be empty".into()));
        }
        if unsigned_tx.is_empty() {
            return Err(PactError::InvalidProposal("unsigned transaction is empty".into()));
        }
        let now = now_secs();
        Ok(Self {
            id: id.to_string(),
            group_id: draft.group_id,
            unsigned_tx,
            destination: draft.destination,
            amount_sats: draft.amount_sats,
            purpose: draft.purpose,
            creator_id: draft.creator_id,
            note: draft.note,
            required_signatures: draft.required_signatures,
            signatures: BTreeMap::new(),
            status: ProposalStatus::PendingSignatures,
            txid: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn has_signed(&self, member_id: &str) -> bool {
        self.signatures.contains_key(member_id)
    }

    pub fn has_quorum(&self) -> bool {
        self.signatures.len() >= self.required_signatures as usize
    }

    /// Awaiting this member's signature.
    pub fn awaits(&self, member_id: &str) -> bool {
        self.status == ProposalStatus::PendingSignatures && !self.has_signed(member_id)
    }

    /// Records a signature from a signer not yet present.
    ///
    /// Returns `true` only on the call that moves the proposal from
    /// `PendingSignatures` to `ReadyToBroadcast`; the caller owns finalization.
    pub fn add_signature(&mut self, signature: Signature) -> Result<bool> {
        if self.has_signed(&signature.signer_id) {
            return Err(PactError::AlreadySigned(signature.signer_id));
        }
        if !self.status.accepts_signatures() {
            return Err(PactError::InvalidState(format!(
                "proposal is {}, not collecting signatures",
                self.status
            )));
        }

        self.signatures
            .insert(signature.signer_id.clone(), signature);
        self.touch();

        if self.status == ProposalStatus::PendingSignatures && self.has_quorum() {
            self.status = ProposalStatus::ReadyToBroadcast;
            return Ok(true);
        }
        Ok(false)
    }

    /// Partial signatures in signer-id order.
    pub fn partial_signatures(&self) -> Vec<Vec<u8>> {
        self.signatures
            .values()
            .map(|s| s.partial_sig.clone())
            .collect()
    }

    pub fn require_ready(&self) -> Result<()> {
        match self.status {
            ProposalStatus::ReadyToBroadcast => Ok(()),
            ProposalStatus::PendingSignatures => Err(PactError::InsufficientSignatures {
                needed: self.required_signatures as usize,
                have: self.signatures.len(),
            }),
            other => Err(PactError::InvalidState(format!(
                "cannot finalize a proposal that is {other}"
            ))),
        }
    }

    /// Moves a failed proposal that still holds a quorum back to `ReadyToBroadcast`.
    pub fn reopen(&mut self) -> Result<()> {
        if self.status != ProposalStatus::Failed {
            return Err(PactError::InvalidState(format!(
                "only failed proposals can be reopened, this one is {}",
                self.status
            )));
        }
        if !self.has_quorum() {
            return Err(PactError::InsufficientSignatures {
                needed: self.required_signatures as usize,
                have: self.signatures.len(),
            });
        }
        self.status = ProposalStatus::ReadyToBroadcast;
        self.error = None;
        self.touch();
        Ok(())
    }

    pub fn mark_broadcasted(&mut self, txid: &str) -> Result<()> {
        self.require_ready()?;
        self.status = ProposalStatus::Broadcasted;
        self.txid = Some(txid.to_string());
        self.error = None;
        self.touch();
        Ok(())
    }

    pub fn mark_confirmed(&mut self) -> Result<()> {
        if self.status != ProposalStatus::Broadcasted {
            return Err(PactError::InvalidState(format!(
                "only broadcasted proposals can confirm, this one is {}",
                self.status
            )));
        }
        self.status = ProposalStatus::Confirmed;
        self.touch();
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &str) -> Result<()> {
        match self.status {
            ProposalStatus::PendingSignatures | ProposalStatus::ReadyToBroadcast => {
                self.status = ProposalStatus::Failed;
                self.error = Some(error.to_string());
                self.touch();
                Ok(())
            }
            other => Err(PactError::InvalidState(format!(
                "cannot fail a proposal that is {other}"
            ))),
        }
    }

    pub fn cancel(&mut self) -> Result<()> {
        match self.status {
            ProposalStatus::PendingSignatures | ProposalStatus::ReadyToBroadcast => {
                self.status = ProposalStatus::Cancelled;
                self.touch();
                Ok(())
            }
            other => Err(PactError::InvalidState(format!(
                "cannot cancel a proposal that is {other}"
            ))),
        }
    }

    /// Applies a peer's finalization announcement, overriding local collection progress.
    ///
    /// Returns `true` if anything changed. A confirmed proposal stays confirmed.
    pub fn apply_finalization(&mut self, txid: &str) -> bool {
        if self.status == ProposalStatus::Confirmed {
            if self.txid.is_none() {
                self.txid = Some(txid.to_string());
                self.touch();
                return true;
            }
            return false;
        }
        if self.status == ProposalStatus::Broadcasted && self.txid.as_deref() == Some(txid) {
            return false;
        }
        self.status = ProposalStatus::Broadcasted;
        self.txid = Some(txid.to_string());
        self.error = None;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

pub fn new_proposal_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
