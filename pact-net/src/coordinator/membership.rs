// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use pact_core::crypto;
use pact_core::storage::{self, PROPOSALS};
use pact_core::{CustodyGroup, KeyContext, PactError, Proposal, Role};

use super::{group_filter, group_subscription_id, Coordinator, CoordinatorEvent};
use crate::error::Result;
use crate::protocol::*;

impl Coordinator {
    /// Starts tracking a group: loads its proposals and subscribes to its topic.
    ///
    /// Re-adding a known group replaces its record. The local party does not
    /// need to be listed yet; it joins by contributing a key.
    pub fn add_group(&self, group: CustodyGroup) -> Result<()> {
        let topic = crypto::group_topic(&group.root_secret)?;
        {
            let groups = self.groups.read();
            if let Some(other) = groups
                .values()
                .find(|g| g.id != group.id && g.root_secret == group.root_secret)
            {
                return Err(PactError::InvalidGroup(format!(
                    "root secret already belongs to group {}",
                    other.id
                ))
                .into());
            }
        }

        let persisted: Vec<Proposal> = storage::load_sealed(
            self.store.as_ref(),
            &group.root_secret,
            KeyContext::GroupProposals,
            &group.id,
            PROPOSALS,
        )?
        .unwrap_or_default();

        let group_id = group.id.clone();
        self.groups.write().insert(group_id.clone(), group);
        self.topics.write().insert(topic.clone(), group_id.clone());
        let loaded = {
            let mut map = self.proposals.write();
            let mut loaded = 0;
            for proposal in persisted.into_iter().filter(|p| p.group_id == group_id) {
                map.entry(proposal.id.clone()).or_insert_with(|| {
                    loaded += 1;
                    Arc::new(Mutex::new(proposal))
                });
            }
            loaded
        };
        self.persist_groups()?;

        self.transport
            .subscribe(&group_subscription_id(&topic), vec![group_filter(&topic)])?;
        info!(group_id = %group_id, proposals = loaded, "tracking group");
        Ok(())
    }

    /// Publishes this party's xpub, joining the group as a member if not yet listed.
    pub fn contribute_key(&self, group_id: &str, xpub: &str) -> Result<()> {
        let me = self.identity.member_id.clone();
        let (group, joined) = {
            let mut groups = self.groups.write();
            // Changes land on a copy so a rejected key leaves the roster untouched.
            let mut group = groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
            let joined = group.join(self.identity.as_member(Role::Member))?;
            if let Some(member) = group.member(&me) {
                if !member.active {
                    return Err(PactError::PermissionDenied(format!("{me} is no longer active")).into());
                }
            }
            group.contribute_key(&me, xpub)?;
            groups.insert(group_id.to_string(), group.clone());
            (group, joined)
        };
        self.persist_groups()?;

        let msg = PactMessage::KeyContribution(KeyContributionPayload {
            group_id: group_id.to_string(),
            member_id: me.clone(),
            member_name: self.identity.name.clone(),
            xpub: xpub.to_string(),
            contributed_at: now_secs(),
        });
        self.publish_group(&group, &msg)?;

        if joined {
            self.emit(CoordinatorEvent::MemberJoined {
                group_id: group_id.to_string(),
                member_id: me.clone(),
                name: self.identity.name.clone(),
            });
        }
        info!(group_id, member = %me, "key contributed");
        self.emit(CoordinatorEvent::KeyContributed {
            group_id: group_id.to_string(),
            member_id: me,
        });
        Ok(())
    }

    /// Builds the multisig descriptor from every contributed key and freezes membership.
    pub async fn generate_descriptor(&self, group_id: &str) -> Result<String> {
        let group = self.group(group_id)?;
        let me = group
            .member(&self.identity.member_id)
            .filter(|m| m.active && m.role.can_manage())
            .ok_or_else(|| {
                PactError::PermissionDenied("only a group manager can generate the descriptor".into())
            })?
            .id
            .clone();
        if let Some(existing) = &group.descriptor {
            return Err(PactError::InvalidState(format!(
                "descriptor already generated: {existing}"
            ))
            .into());
        }

        let xpubs = group.contributed_xpubs();
        if xpubs.len() < group.threshold as usize {
            return Err(PactError::InsufficientSigners {
                needed: group.threshold as usize,
                available: xpubs.len(),
            }
            .into());
        }
        let keys: BTreeMap<String, String> = group
            .eligible_signers()
            .into_iter()
            .filter_map(|m| m.xpub.clone().map(|x| (m.id.clone(), x)))
            .collect();

        let descriptor = self.wallet.build_descriptor(group.threshold, &xpubs).await?;

        let sealed = {
            let mut groups = self.groups.write();
            let current = groups
                .get_mut(group_id)
                .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
            current.seal_descriptor(&descriptor)?;
            current.clone()
        };
        self.persist_groups()?;

        let msg = PactMessage::DescriptorReady(DescriptorReadyPayload {
            group_id: group_id.to_string(),
            descriptor: descriptor.clone(),
            threshold: sealed.threshold,
            keys,
            generated_by: me,
            generated_at: now_secs(),
        });
        self.publish_group(&sealed, &msg)?;

        info!(group_id, keys = xpubs.len(), "wallet descriptor generated");
        self.emit(CoordinatorEvent::DescriptorReady {
            group_id: group_id.to_string(),
            descriptor: descriptor.clone(),
        });
        Ok(descriptor)
    }

    /// Shares the group balance and, when given, a new savings goal.
    pub fn update_balance(&self, group_id: &str, balance_sats: u64, goal_sats: Option<u64>) -> Result<()> {
        let me = self.identity.member_id.clone();
        let group = {
            let mut groups = self.groups.write();
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
            if !group.member(&me).is_some_and(|m| m.active) {
                return Err(PactError::PermissionDenied(format!("{me} is not a member")).into());
            }
            group.set_balance(balance_sats, goal_sats);
            group.clone()
        };
        self.persist_groups()?;

        let updated_at = now_secs();
        self.publish_group(
            &group,
            &PactMessage::BalanceUpdate(BalanceUpdatePayload {
                group_id: group_id.to_string(),
                balance_sats,
                updated_by: me.clone(),
                updated_at,
            }),
        )?;
        if let Some(goal_sats) = goal_sats {
            self.publish_group(
                &group,
                &PactMessage::GoalUpdate(GoalUpdatePayload {
                    group_id: group_id.to_string(),
                    goal_sats,
                    updated_by: me,
                    updated_at,
                }),
            )?;
        }

        debug!(group_id, balance_sats, ?goal_sats, "balance shared");
        self.emit(CoordinatorEvent::BalanceUpdated {
            group_id: group_id.to_string(),
            balance_sats: group.balance_sats,
            goal_sats: group.goal_sats,
        });
        Ok(())
    }
}
