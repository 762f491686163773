// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use pact_core::{CustodyGroup, Member, PactError, Proposal, ProposalDraft, Role, Signature};

use super::{Coordinator, CoordinatorEvent, MAX_INBOX};
use crate::error::{NetError, Result};
use crate::event::PactEventBuilder;
use crate::protocol::*;

/// Resolves the member an announcement claims to come from and checks the
/// event was signed with that member's relay key.
fn authenticate<'g>(
    group: &'g CustodyGroup,
    member_id: &str,
    sender: &[u8; 32],
) -> std::result::Result<&'g Member, PactError> {
    let member = group
        .member(member_id)
        .ok_or_else(|| PactError::PermissionDenied(format!("{member_id} is not a member")))?;
    if &member.pubkey != sender {
        return Err(PactError::PermissionDenied(format!(
            "event was not signed by {member_id}"
        )));
    }
    if !member.active {
        return Err(PactError::PermissionDenied(format!(
            "{member_id} is no longer active"
        )));
    }
    Ok(member)
}

impl Coordinator {
    pub(super) fn handle_event(&self, event: &Event) -> Result<()> {
        let me = self.identity.keys.public_key();
        if event.pubkey == me || event.kind != Kind::Custom(PACT_EVENT_KIND) {
            return Ok(());
        }

        let msg_type = PactEventBuilder::get_message_type(event);
        debug!(msg_type = ?msg_type, from = %event.pubkey, "Received event");

        if PactEventBuilder::is_addressed_to(event, &me) {
            let payload = PactEventBuilder::open_notification(&self.identity.keys, event)?;
            return self.on_notification(&event.pubkey.to_bytes(), payload);
        }

        let Some(topic) = PactEventBuilder::get_group_topic(event) else {
            trace!(event_id = %event.id, "event without group topic");
            return Ok(());
        };
        let group_id = self.topics.read().get(&topic).cloned();
        let Some(group_id) = group_id else {
            trace!(event_id = %event.id, "event for an unknown group");
            return Ok(());
        };

        let group = self.group(&group_id)?;
        let msg = PactEventBuilder::open_group_message(&group, event)?;
        self.apply_message(&group_id, event.pubkey.to_bytes(), msg)
    }

    fn apply_message(&self, group_id: &str, sender: [u8; 32], msg: PactMessage) -> Result<()> {
        match msg {
            PactMessage::ProposalAnnouncement(p) => self.on_proposal(group_id, &sender, p),
            PactMessage::SignatureAnnouncement(p) => self.on_signature(group_id, sender, p),
            PactMessage::FinalizationAnnouncement(p) => self.on_finalization(group_id, sender, p),
            PactMessage::ProposalCancelled(p) => self.on_cancelled(group_id, sender, p),
            PactMessage::KeyContribution(p) => self.on_key_contribution(group_id, &sender, p),
            PactMessage::DescriptorReady(p) => self.on_descriptor_ready(group_id, &sender, p),
            PactMessage::BalanceUpdate(p) => {
                self.on_balance(group_id, &sender, &p.updated_by, Some(p.balance_sats), None)
            }
            PactMessage::GoalUpdate(p) => {
                self.on_balance(group_id, &sender, &p.updated_by, None, Some(p.goal_sats))
            }
            PactMessage::Notification(_) => Err(NetError::Protocol(
                "notifications must be addressed to a member".into(),
            )),
        }
    }

    fn on_proposal(&self, group_id: &str, sender: &[u8; 32], p: ProposalAnnouncement) -> Result<()> {
        let group = self.group(group_id)?;
        let creator = authenticate(&group, &p.creator_id, sender)?;
        if !creator.role.can_sign() {
            return Err(PactError::PermissionDenied(format!(
                "{} cannot create proposals",
                creator.id
            ))
            .into());
        }
        if self.proposals.read().contains_key(&p.proposal_id) {
            trace!(proposal_id = %p.proposal_id, "proposal already known");
            return Ok(());
        }
        // Same preconditions as a local proposal: the quorum is the group threshold.
        if !group.is_sealed() {
            return Err(PactError::InvalidProposal(
                "group wallet descriptor has not been generated".into(),
            )
            .into());
        }
        if p.required_signatures != group.threshold {
            return Err(PactError::InvalidProposal(format!(
                "requires {} signatures but the group threshold is {}",
                p.required_signatures, group.threshold
            ))
            .into());
        }

        let draft = ProposalDraft {
            group_id: group_id.to_string(),
            destination: p.destination,
            amount_sats: p.amount_sats,
            purpose: p.purpose,
            creator_id: p.creator_id,
            note: p.note,
            required_signatures: p.required_signatures,
        };
        let mut proposal = Proposal::new(&p.proposal_id, draft, p.unsigned_tx)?;
        proposal.created_at = p.created_at;
        let snapshot = proposal.clone();

        {
            let mut map = self.proposals.write();
            if map.contains_key(&snapshot.id) {
                return Ok(());
            }
            map.insert(snapshot.id.clone(), Arc::new(Mutex::new(proposal)));
        }
        self.persist_proposals(group_id)?;

        info!(
            proposal_id = %snapshot.id,
            group_id,
            creator = %snapshot.creator_id,
            amount_sats = snapshot.amount_sats,
            "new proposal"
        );
        self.emit_proposal(&snapshot);

        let orphans = self.orphans.lock().take(&snapshot.id);
        for orphan in orphans {
            if let Err(e) = self.apply_message(&orphan.group_id, orphan.sender, orphan.message) {
                debug!(proposal_id = %snapshot.id, error = %e, "buffered announcement rejected");
            }
        }
        Ok(())
    }

    fn on_signature(&self, group_id: &str, sender: [u8; 32], p: SignatureAnnouncement) -> Result<()> {
        let group = self.group(group_id)?;
        let signer = authenticate(&group, &p.signer_id, &sender)?;
        if !signer.role.can_sign() {
            return Err(PactError::PermissionDenied(format!("{} cannot sign", signer.id)).into());
        }

        let cell = self.proposals.read().get(&p.proposal_id).cloned();
        let Some(cell) = cell else {
            self.buffer_orphan(group_id, sender, PactMessage::SignatureAnnouncement(p));
            return Ok(());
        };

        let signature = Signature {
            signer_id: signer.id.clone(),
            signer_name: signer.name.clone(),
            signed_at: p.signed_at,
            partial_sig: p.partial_sig,
        };
        let applied = {
            let mut proposal = cell.lock();
            if proposal.group_id != group_id {
                return Err(NetError::Protocol("proposal belongs to another group".into()));
            }
            match proposal.add_signature(signature) {
                Ok(reached) => Some((reached, proposal.clone())),
                Err(PactError::AlreadySigned(signer)) => {
                    trace!(proposal_id = %p.proposal_id, %signer, "duplicate signature");
                    None
                }
                Err(PactError::InvalidState(reason)) => {
                    debug!(proposal_id = %p.proposal_id, %reason, "late signature ignored");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        };
        let Some((reached, snapshot)) = applied else {
            return Ok(());
        };
        self.persist_proposals(group_id)?;

        if reached {
            info!(
                proposal_id = %snapshot.id,
                signatures = snapshot.signature_count(),
                "quorum reached; ready to broadcast"
            );
        } else {
            debug!(
                proposal_id = %snapshot.id,
                signer = %p.signer_id,
                signatures = snapshot.signature_count(),
                required = snapshot.required_signatures,
                "signature recorded"
            );
        }
        self.emit_proposal(&snapshot);
        Ok(())
    }

    fn on_finalization(
        &self,
        group_id: &str,
        sender: [u8; 32],
        p: FinalizationAnnouncement,
    ) -> Result<()> {
        let group = self.group(group_id)?;
        let finalizer = authenticate(&group, &p.finalized_by, &sender)?;
        if !finalizer.role.can_sign() {
            return Err(PactError::PermissionDenied(format!(
                "{} cannot finalize proposals",
                finalizer.id
            ))
            .into());
        }

        let cell = self.proposals.read().get(&p.proposal_id).cloned();
        let Some(cell) = cell else {
            self.buffer_orphan(group_id, sender, PactMessage::FinalizationAnnouncement(p));
            return Ok(());
        };

        let snapshot = {
            let mut proposal = cell.lock();
            if proposal.group_id != group_id {
                return Err(NetError::Protocol("proposal belongs to another group".into()));
            }
            if !proposal.apply_finalization(&p.txid) {
                return Ok(());
            }
            proposal.clone()
        };
        self.persist_proposals(group_id)?;

        info!(proposal_id = %snapshot.id, txid = %p.txid, by = %p.finalized_by, "proposal finalized by peer");
        self.emit_proposal(&snapshot);
        Ok(())
    }

    fn on_cancelled(&self, group_id: &str, sender: [u8; 32], p: CancellationPayload) -> Result<()> {
        let group = self.group(group_id)?;
        let canceller = authenticate(&group, &p.cancelled_by, &sender)?;

        let cell = self.proposals.read().get(&p.proposal_id).cloned();
        let Some(cell) = cell else {
            self.buffer_orphan(group_id, sender, PactMessage::ProposalCancelled(p));
            return Ok(());
        };

        let snapshot = {
            let mut proposal = cell.lock();
            if proposal.group_id != group_id {
                return Err(NetError::Protocol("proposal belongs to another group".into()));
            }
            if proposal.creator_id != canceller.id && !canceller.role.can_manage() {
                return Err(PactError::PermissionDenied(format!(
                    "{} cannot cancel this proposal",
                    canceller.id
                ))
                .into());
            }
            if let Err(e) = proposal.cancel() {
                debug!(proposal_id = %p.proposal_id, error = %e, "cancellation ignored");
                return Ok(());
            }
            proposal.clone()
        };
        self.persist_proposals(group_id)?;

        info!(proposal_id = %snapshot.id, by = %p.cancelled_by, "proposal cancelled by peer");
        self.emit_proposal(&snapshot);
        Ok(())
    }

    fn on_key_contribution(
        &self,
        group_id: &str,
        sender: &[u8; 32],
        p: KeyContributionPayload,
    ) -> Result<()> {
        let (joined, contributed) = {
            let mut groups = self.groups.write();
            let mut group = groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
            let joined = if group.member(&p.member_id).is_some() {
                authenticate(&group, &p.member_id, sender)?;
                false
            } else {
                group.join(Member::new(&p.member_id, &p.member_name, *sender, Role::Member))?
            };
            let contributed = group.contribute_key(&p.member_id, &p.xpub)?;
            if joined || contributed {
                groups.insert(group_id.to_string(), group);
            }
            (joined, contributed)
        };
        if !joined && !contributed {
            return Ok(());
        }
        self.persist_groups()?;

        if joined {
            info!(group_id, member = %p.member_id, "member joined");
            self.emit(CoordinatorEvent::MemberJoined {
                group_id: group_id.to_string(),
                member_id: p.member_id.clone(),
                name: p.member_name.clone(),
            });
        }
        if contributed {
            debug!(group_id, member = %p.member_id, "member contributed key");
            self.emit(CoordinatorEvent::KeyContributed {
                group_id: group_id.to_string(),
                member_id: p.member_id,
            });
        }
        Ok(())
    }

    fn on_descriptor_ready(
        &self,
        group_id: &str,
        sender: &[u8; 32],
        p: DescriptorReadyPayload,
    ) -> Result<()> {
        {
            let mut groups = self.groups.write();
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
            if !authenticate(group, &p.generated_by, sender)?.role.can_manage() {
                return Err(PactError::PermissionDenied(format!(
                    "{} cannot set the wallet descriptor",
                    p.generated_by
                ))
                .into());
            }
            if group.descriptor.as_deref() == Some(p.descriptor.as_str()) {
                return Ok(());
            }
            if p.threshold != group.threshold {
                return Err(PactError::InvalidGroup(format!(
                    "descriptor threshold {} does not match group threshold {}",
                    p.threshold, group.threshold
                ))
                .into());
            }
            for (member_id, xpub) in &p.keys {
                group.contribute_key(member_id, xpub)?;
            }
            group.seal_descriptor(&p.descriptor)?;
        }
        self.persist_groups()?;

        info!(group_id, by = %p.generated_by, "wallet descriptor received");
        self.emit(CoordinatorEvent::DescriptorReady {
            group_id: group_id.to_string(),
            descriptor: p.descriptor,
        });
        Ok(())
    }

    fn on_balance(
        &self,
        group_id: &str,
        sender: &[u8; 32],
        updated_by: &str,
        balance_sats: Option<u64>,
        goal_sats: Option<u64>,
    ) -> Result<()> {
        let (balance, goal) = {
            let mut groups = self.groups.write();
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
            authenticate(group, updated_by, sender)?;
            let balance = balance_sats.unwrap_or(group.balance_sats);
            group.set_balance(balance, goal_sats);
            (group.balance_sats, group.goal_sats)
        };
        self.persist_groups()?;

        debug!(group_id, balance_sats = balance, goal_sats = ?goal, by = updated_by, "balance updated");
        self.emit(CoordinatorEvent::BalanceUpdated {
            group_id: group_id.to_string(),
            balance_sats: balance,
            goal_sats: goal,
        });
        Ok(())
    }

    fn on_notification(&self, sender: &[u8; 32], payload: NotificationPayload) -> Result<()> {
        let group = self.group(&payload.group_id)?;
        authenticate(&group, &payload.from_member, sender)?;

        {
            let mut inbox = self.inbox.lock();
            inbox.push(payload.clone());
            if inbox.len() > MAX_INBOX {
                let excess = inbox.len() - MAX_INBOX;
                inbox.drain(..excess);
            }
        }
        self.persist_inbox()?;

        debug!(group_id = %payload.group_id, from = %payload.from_member, "notification received");
        self.emit(CoordinatorEvent::Notification(payload));
        Ok(())
    }

    fn buffer_orphan(&self, group_id: &str, sender: [u8; 32], msg: PactMessage) {
        debug!(
            msg_type = msg.message_type(),
            proposal_id = ?msg.proposal_id(),
            "announcement arrived before its proposal; buffering"
        );
        self.orphans.lock().push(group_id, sender, msg);
    }
}
