// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use pact_core::group::{MAX_NAME_LENGTH, MAX_SIGNERS, MAX_XPUB_LENGTH};
use pact_core::proposal::{MAX_DESTINATION_LENGTH, MAX_NOTE_LENGTH};
use pact_core::{KeyContext, Purpose};
use serde::{Deserialize, Serialize};

pub const PACT_EVENT_KIND: u16 = 7474;
pub const PACT_VERSION: u8 = 1;

/// Upper bound on a decoded message, before encryption overhead.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
pub const MAX_ID_LENGTH: usize = 64;
pub const MAX_PARTIAL_SIG_SIZE: usize = 64 * 1024;
pub const MAX_DESCRIPTOR_LENGTH: usize = 4096;
pub const MAX_SUMMARY_LENGTH: usize = 512;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PactMessage {
    ProposalAnnouncement(ProposalAnnouncement),
    SignatureAnnouncement(SignatureAnnouncement),
    FinalizationAnnouncement(FinalizationAnnouncement),
    ProposalCancelled(CancellationPayload),
    KeyContribution(KeyContributionPayload),
    DescriptorReady(DescriptorReadyPayload),
    BalanceUpdate(BalanceUpdatePayload),
    GoalUpdate(GoalUpdatePayload),
    Notification(NotificationPayload),
}

impl PactMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            PactMessage::ProposalAnnouncement(_) => "proposal_announcement",
            PactMessage::SignatureAnnouncement(_) => "signature_announcement",
            PactMessage::FinalizationAnnouncement(_) => "finalization_announcement",
            PactMessage::ProposalCancelled(_) => "proposal_cancelled",
            PactMessage::KeyContribution(_) => "key_contribution",
            PactMessage::DescriptorReady(_) => "descriptor_ready",
            PactMessage::BalanceUpdate(_) => "balance_update",
            PactMessage::GoalUpdate(_) => "goal_update",
            PactMessage::Notification(_) => "notification",
        }
    }

    pub fn group_id(&self) -> &str {
        match self {
            PactMessage::ProposalAnnouncement(p) => &p.group_id,
            PactMessage::SignatureAnnouncement(p) => &p.group_id,
            PactMessage::FinalizationAnnouncement(p) => &p.group_id,
            PactMessage::ProposalCancelled(p) => &p.group_id,
            PactMessage::KeyContribution(p) => &p.group_id,
            PactMessage::DescriptorReady(p) => &p.group_id,
            PactMessage::BalanceUpdate(p) => &p.group_id,
            PactMessage::GoalUpdate(p) => &p.group_id,
            PactMessage::Notification(p) => &p.group_id,
        }
    }

    pub fn proposal_id(&self) -> Option<&str> {
        match self {
            PactMessage::ProposalAnnouncement(p) => Some(&p.proposal_id),
            PactMessage::SignatureAnnouncement(p) => Some(&p.proposal_id),
            PactMessage::FinalizationAnnouncement(p) => Some(&p.proposal_id),
            PactMessage::ProposalCancelled(p) => Some(&p.proposal_id),
            PactMessage::Notification(p) => p.proposal_id.as_deref(),
            _ => None,
        }
    }

    /// Group key context a message of this type is sealed under. `None` for direct notifications.
    pub fn context_for(message_type: &str) -> Option<KeyContext> {
        match message_type {
            "proposal_announcement"
            | "signature_announcement"
            | "finalization_announcement"
            | "proposal_cancelled" => Some(KeyContext::GroupProposals),
            "key_contribution" | "descriptor_ready" => Some(KeyContext::GroupXpubs),
            "balance_update" => Some(KeyContext::GroupBalances),
            "goal_update" => Some(KeyContext::GroupGoals),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<KeyContext> {
        Self::context_for(self.message_type())
    }

    /// Derivation identifier; also carried in the `s` tag.
    pub fn subject(&self) -> Option<&str> {
        match self {
            PactMessage::Notification(_) => None,
            other => other.proposal_id(),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        let group_id = self.group_id();
        if group_id.is_empty() || group_id.len() > MAX_ID_LENGTH {
            return Err("invalid group id");
        }
        if let Some(id) = self.proposal_id() {
            if id.is_empty() || id.len() > MAX_ID_LENGTH {
                return Err("invalid proposal id");
            }
        }

        match self {
            PactMessage::ProposalAnnouncement(p) => {
                validate_member_id(&p.creator_id)?;
                if p.destination.is_empty() || p.destination.len() > MAX_DESTINATION_LENGTH {
                    return Err("invalid destination");
                }
                if p.amount_sats == 0 {
                    return Err("amount must be positive");
                }
                if p.required_signatures == 0 || p.required_signatures > MAX_SIGNERS {
                    return Err("required signatures out of range");
                }
                if p.unsigned_tx.is_empty() {
                    return Err("empty unsigned transaction");
                }
                if p.note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LENGTH) {
                    return Err("note too long");
                }
            }
            PactMessage::SignatureAnnouncement(p) => {
                validate_member_id(&p.signer_id)?;
                if p.signer_name.len() > MAX_NAME_LENGTH {
                    return Err("signer name too long");
                }
                if p.partial_sig.is_empty() || p.partial_sig.len() > MAX_PARTIAL_SIG_SIZE {
                    return Err("invalid partial signature size");
                }
            }
            PactMessage::FinalizationAnnouncement(p) => {
                validate_member_id(&p.finalized_by)?;
                if p.txid.is_empty() || p.txid.len() > MAX_ID_LENGTH * 2 {
                    return Err("invalid txid");
                }
                if p.amount_sats == 0 {
                    return Err("amount must be positive");
                }
            }
            PactMessage::ProposalCancelled(p) => validate_member_id(&p.cancelled_by)?,
            PactMessage::KeyContribution(p) => {
                validate_member_id(&p.member_id)?;
                if p.member_name.len() > MAX_NAME_LENGTH {
                    return Err("member name too long");
                }
                if p.xpub.is_empty() || p.xpub.len() > MAX_XPUB_LENGTH {
                    return Err("invalid xpub");
                }
            }
            PactMessage::DescriptorReady(p) => {
                validate_member_id(&p.generated_by)?;
                if p.descriptor.is_empty() || p.descriptor.len() > MAX_DESCRIPTOR_LENGTH {
                    return Err("invalid descriptor");
                }
                if p.threshold == 0 || p.threshold > MAX_SIGNERS {
                    return Err("threshold out of range");
                }
                if p.keys.len() > MAX_SIGNERS as usize || p.keys.len() < p.threshold as usize {
                    return Err("key set does not match threshold");
                }
                if p.keys.values().any(|x| x.is_empty() || x.len() > MAX_XPUB_LENGTH) {
                    return Err("invalid xpub");
                }
            }
            PactMessage::BalanceUpdate(p) => validate_member_id(&p.updated_by)?,
            PactMessage::GoalUpdate(p) => validate_member_id(&p.updated_by)?,
            PactMessage::Notification(p) => {
                validate_member_id(&p.from_member)?;
                if p.summary.is_empty() || p.summary.len() > MAX_SUMMARY_LENGTH {
                    return Err("invalid summary");
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn validate_member_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return Err("invalid member id");
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProposalAnnouncement {
    pub proposal_id: String,
    pub group_id: String,
    pub destination: String,
    pub amount_sats: u64,
    pub purpose: Purpose,
    pub required_signatures: u8,
    pub creator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(with = "hex::serde")]
    pub unsigned_tx: Vec<u8>,
    pub created_at: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SignatureAnnouncement {
    pub proposal_id: String,
    pub group_id: String,
    pub signer_id: String,
    pub signer_name: String,
    pub signed_at: u64,
    #[serde(with = "hex::serde")]
    pub partial_sig: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FinalizationAnnouncement {
    pub proposal_id: String,
    pub group_id: String,
    pub txid: String,
    pub amount_sats: u64,
    pub destination: String,
    pub purpose: Purpose,
    pub finalized_by: String,
    pub finalized_at: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CancellationPayload {
    pub proposal_id: String,
    pub group_id: String,
    pub cancelled_by: String,
    pub cancelled_at: u64,
}

/// A member publishing its extended public key; an unknown sender joins the group.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyContributionPayload {
    pub group_id: String,
    pub member_id: String,
    pub member_name: String,
    pub xpub: String,
    pub contributed_at: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DescriptorReadyPayload {
    pub group_id: String,
    pub descriptor: String,
    pub threshold: u8,
    /// Member id to xpub for every key in the descriptor.
    pub keys: BTreeMap<String, String>,
    pub generated_by: String,
    pub generated_at: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BalanceUpdatePayload {
    pub group_id: String,
    pub balance_sats: u64,
    pub updated_by: String,
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GoalUpdatePayload {
    pub group_id: String,
    pub goal_sats: u64,
    pub updated_by: String,
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NotificationPayload {
    pub group_id: String,
    pub from_member: String,
    pub proposal_id: Option<String>,
    pub summary: String,
    pub sent_at: u64,
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
