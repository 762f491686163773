// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use pact_core::proposal::new_proposal_id;
use pact_core::{
    CustodyGroup, PactError, Proposal, ProposalDraft, ProposalStatus, Purpose, Signature,
    WalletError,
};

use super::{Coordinator, InFlight, ProposalCell};
use crate::error::Result;
use crate::event::PactEventBuilder;
use crate::protocol::*;

impl Coordinator {
    /// Builds an unsigned transaction and announces it to the group.
    ///
    /// The proposal's required signature count is frozen at the group's
    /// current threshold.
    pub async fn create_proposal(
        &self,
        group_id: &str,
        destination: &str,
        amount_sats: u64,
        purpose: Purpose,
        note: Option<String>,
    ) -> Result<Proposal> {
        let group = self.group(group_id)?;
        let me = group.require_signer(&self.identity.member_id)?.clone();

        let eligible = group.eligible_signers().len();
        if eligible < group.threshold as usize {
            return Err(PactError::InsufficientSigners {
                needed: group.threshold as usize,
                available: eligible,
            }
            .into());
        }
        let descriptor = group.descriptor.clone().ok_or_else(|| {
            PactError::InvalidState("group wallet descriptor has not been generated".into())
        })?;

        let draft = ProposalDraft {
            group_id: group_id.to_string(),
            destination: destination.to_string(),
            amount_sats,
            purpose,
            creator_id: me.id.clone(),
            note,
            required_signatures: group.threshold,
        };
        draft.validate()?;

        let unsigned_tx = self
            .wallet
            .build_unsigned_transaction(destination, amount_sats, self.config.fee_rate, &descriptor)
            .await?;
        let proposal = Proposal::new(&new_proposal_id(), draft, unsigned_tx)?;

        self.proposals
            .write()
            .insert(proposal.id.clone(), Arc::new(Mutex::new(proposal.clone())));
        self.persist_proposals(group_id)?;

        let announcement = PactMessage::ProposalAnnouncement(ProposalAnnouncement {
            proposal_id: proposal.id.clone(),
            group_id: group_id.to_string(),
            destination: proposal.destination.clone(),
            amount_sats,
            purpose,
            required_signatures: proposal.required_signatures,
            creator_id: me.id.clone(),
            note: proposal.note.clone(),
            unsigned_tx: proposal.unsigned_tx.clone(),
            created_at: proposal.created_at,
        });
        self.publish_group(&group, &announcement)?;
        self.notify_members(
            &group,
            Some(&proposal.id),
            format!(
                "{} proposed sending {} sats to {} ({})",
                me.name, amount_sats, proposal.destination, purpose
            ),
        );

        info!(
            proposal_id = %proposal.id,
            group_id,
            amount_sats,
            required = proposal.required_signatures,
            "proposal created"
        );
        self.emit_proposal(&proposal);
        Ok(proposal)
    }

    /// Produces and announces this party's partial signature.
    ///
    /// Returns `true` once the proposal holds enough signatures. When this
    /// signature completes the quorum the proposal is finalized right away; a
    /// failed finalization leaves the proposal `Failed` but the signature stands.
    pub async fn submit_signature(&self, proposal_id: &str) -> Result<bool> {
        let me = self.identity.member_id.clone();
        let cell = self.cell(proposal_id)?;
        let (group_id, unsigned_tx) = {
            let p = cell.lock();
            (p.group_id.clone(), p.unsigned_tx.clone())
        };
        let group = self.group(&group_id)?;
        let member = group.require_signer(&me)?.clone();

        {
            let p = cell.lock();
            if p.has_signed(&me) || self.signing_log.lock().contains(proposal_id) {
                return Err(PactError::AlreadySigned(me).into());
            }
            if !p.status.accepts_signatures() {
                return Err(PactError::InvalidState(format!(
                    "proposal is {}, not collecting signatures",
                    p.status
                ))
                .into());
            }
        }

        let guard = InFlight::acquire(&self.in_flight, format!("sign:{proposal_id}"))
            .ok_or_else(|| PactError::InvalidState("already signing this proposal".into()))?;

        let partial_sig = match self
            .wallet
            .partial_sign(&unsigned_tx, &self.identity.key_handle)
            .await
        {
            Ok(sig) => sig,
            Err(e) => {
                if !e.is_transient() {
                    self.fail_proposal(&cell, &format!("signing failed: {e}"));
                }
                return Err(e.into());
            }
        };

        let signature = Signature::new(&me, &member.name, partial_sig);
        let (reached, snapshot) = {
            let mut p = cell.lock();
            let reached = p.add_signature(signature.clone())?;
            (reached, p.clone())
        };

        self.signing_log.lock().insert(proposal_id.to_string());
        self.persist_signing_log()?;
        self.persist_proposals(&group_id)?;

        let announcement = PactMessage::SignatureAnnouncement(SignatureAnnouncement {
            proposal_id: proposal_id.to_string(),
            group_id: group_id.clone(),
            signer_id: signature.signer_id,
            signer_name: signature.signer_name,
            signed_at: signature.signed_at,
            partial_sig: signature.partial_sig,
        });
        self.publish_group(&group, &announcement)?;

        info!(
            proposal_id,
            signatures = snapshot.signature_count(),
            required = snapshot.required_signatures,
            "signature submitted"
        );
        self.emit_proposal(&snapshot);

        if reached {
            drop(guard);
            if let Err(e) = self.finalize(&group, &cell).await {
                warn!(proposal_id, error = %e, "automatic finalization failed");
            }
        }
        Ok(snapshot.has_quorum())
    }

    /// Combines the partial signatures and broadcasts the transaction.
    ///
    /// Any active signer may call this for a proposal that reached quorum,
    /// including one whose earlier broadcast failed.
    pub async fn broadcast(&self, proposal_id: &str) -> Result<String> {
        let cell = self.cell(proposal_id)?;
        let group_id = cell.lock().group_id.clone();
        let group = self.group(&group_id)?;
        group.require_signer(&self.identity.member_id)?;
        self.finalize(&group, &cell).await
    }

    pub fn cancel_proposal(&self, proposal_id: &str) -> Result<()> {
        let cell = self.cell(proposal_id)?;
        let group_id = cell.lock().group_id.clone();
        let group = self.group(&group_id)?;
        let me = group
            .member(&self.identity.member_id)
            .filter(|m| m.active)
            .ok_or_else(|| {
                PactError::PermissionDenied(format!("{} is not a member", self.identity.member_id))
            })?;

        let snapshot = {
            let mut p = cell.lock();
            if p.creator_id != me.id && !me.role.can_manage() {
                return Err(PactError::PermissionDenied(
                    "only the creator or a manager can cancel a proposal".into(),
                )
                .into());
            }
            p.cancel()?;
            p.clone()
        };
        self.persist_proposals(&group_id)?;

        let msg = PactMessage::ProposalCancelled(CancellationPayload {
            proposal_id: proposal_id.to_string(),
            group_id: group_id.clone(),
            cancelled_by: me.id.clone(),
            cancelled_at: now_secs(),
        });
        self.publish_group(&group, &msg)?;
        info!(proposal_id, group_id, "proposal cancelled");
        self.emit_proposal(&snapshot);
        Ok(())
    }

    /// Records on-chain confirmation observed by the wallet layer.
    pub fn mark_confirmed(&self, proposal_id: &str) -> Result<()> {
        let cell = self.cell(proposal_id)?;
        let snapshot = {
            let mut p = cell.lock();
            p.mark_confirmed()?;
            p.clone()
        };
        self.persist_proposals(&snapshot.group_id)?;
        info!(proposal_id, txid = ?snapshot.txid, "proposal confirmed");
        self.emit_proposal(&snapshot);
        Ok(())
    }

    pub(super) async fn finalize(&self, group: &CustodyGroup, cell: &ProposalCell) -> Result<String> {
        let proposal_id = cell.lock().id.clone();
        let _guard = InFlight::acquire(&self.in_flight, format!("finalize:{proposal_id}"))
            .ok_or_else(|| PactError::InvalidState("finalization already in progress".into()))?;

        let (unsigned_tx, partial_sigs) = {
            let mut p = cell.lock();
            if p.status == ProposalStatus::Failed {
                p.reopen()?;
                debug!(proposal_id = %p.id, "retrying failed proposal");
            }
            p.require_ready()?;
            (p.unsigned_tx.clone(), p.partial_signatures())
        };

        let final_tx = match self.wallet.combine(&unsigned_tx, &partial_sigs).await {
            Ok(tx) => tx,
            Err(e) => {
                self.fail_proposal(cell, &format!("combine failed: {e}"));
                return Err(e.into());
            }
        };
        let txid = match self.broadcast_with_retry(&final_tx).await {
            Ok(txid) => txid,
            Err(e) => {
                self.fail_proposal(cell, &format!("broadcast failed: {e}"));
                return Err(e.into());
            }
        };

        let snapshot = {
            let mut p = cell.lock();
            p.apply_finalization(&txid);
            p.clone()
        };
        self.persist_proposals(&group.id)?;

        let msg = PactMessage::FinalizationAnnouncement(FinalizationAnnouncement {
            proposal_id: snapshot.id.clone(),
            group_id: group.id.clone(),
            txid: txid.clone(),
            amount_sats: snapshot.amount_sats,
            destination: snapshot.destination.clone(),
            purpose: snapshot.purpose,
            finalized_by: self.identity.member_id.clone(),
            finalized_at: now_secs(),
        });
        self.publish_group(group, &msg)?;
        self.notify_members(
            group,
            Some(&snapshot.id),
            format!(
                "Sent {} sats to {} (txid {})",
                snapshot.amount_sats, snapshot.destination, txid
            ),
        );

        info!(proposal_id = %snapshot.id, txid = %txid, "transaction broadcast");
        self.emit_proposal(&snapshot);
        Ok(txid)
    }

    async fn broadcast_with_retry(&self, final_tx: &[u8]) -> std::result::Result<String, WalletError> {
        let attempts = self.config.broadcast_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.wallet.broadcast(final_tx).await {
                Ok(txid) => return Ok(txid),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "broadcast unavailable; retrying");
                    tokio::time::sleep(self.config.broadcast_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Records a terminal wallet failure locally. Peers are not told.
    fn fail_proposal(&self, cell: &ProposalCell, reason: &str) {
        let snapshot = {
            let mut p = cell.lock();
            if let Err(e) = p.mark_failed(reason) {
                debug!(proposal_id = %p.id, error = %e, "proposal already settled");
                return;
            }
            p.clone()
        };
        error!(proposal_id = %snapshot.id, reason, "proposal failed");
        if let Err(e) = self.persist_proposals(&snapshot.group_id) {
            warn!(proposal_id = %snapshot.id, error = %e, "failed to persist proposal");
        }
        self.emit_proposal(&snapshot);
    }

    /// Sends a NIP-44 notification to every other active member. Best effort.
    fn notify_members(&self, group: &CustodyGroup, proposal_id: Option<&str>, summary: String) {
        let mut summary = summary;
        if summary.len() > MAX_SUMMARY_LENGTH {
            let mut end = MAX_SUMMARY_LENGTH;
            while !summary.is_char_boundary(end) {
                end -= 1;
            }
            summary.truncate(end);
        }

        let me = &self.identity.member_id;
        for member in group.active_members().filter(|m| &m.id != me) {
            let recipient = match PublicKey::from_slice(&member.pubkey) {
                Ok(pk) => pk,
                Err(e) => {
                    debug!(member = %member.id, error = %e, "member has no usable relay key");
                    continue;
                }
            };
            let payload = NotificationPayload {
                group_id: group.id.clone(),
                from_member: me.clone(),
                proposal_id: proposal_id.map(str::to_string),
                summary: summary.clone(),
                sent_at: now_secs(),
            };
            match PactEventBuilder::direct_notification(&self.identity.keys, &recipient, payload) {
                Ok(event) => {
                    self.transport.publish(&event);
                }
                Err(e) => warn!(member = %member.id, error = %e, "failed to build notification"),
            }
        }
    }
}
