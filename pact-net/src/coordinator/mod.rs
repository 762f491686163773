// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Proposal coordination over the relay transport.
//!
//! A [`Coordinator`] owns the local party's view of its groups and their
//! proposals. Local operations validate, persist, then announce; inbound
//! announcements are authenticated against the group roster and applied
//! idempotently, so every member converges on the same proposal state
//! regardless of delivery order or duplication.

mod inbound;
mod membership;
mod orphans;
mod proposals;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use pact_core::storage::{self, EncryptedStore, GROUPS, LOCAL_SCOPE, NOTIFICATIONS, PROPOSALS};
use pact_core::{
    CustodyGroup, FeeRate, KeyContext, KeyHandle, Member, PactError, Proposal, ProposalStatus,
    Role, RootSecret, WalletBackend,
};

use crate::error::{NetError, Result};
use crate::event::PactEventBuilder;
use crate::protocol::{NotificationPayload, PactMessage, PACT_EVENT_KIND};
use crate::transport::Transport;

use orphans::OrphanBuffer;

const DIRECT_SUBSCRIPTION: &str = "pact-direct";
const MAX_INBOX: usize = 500;

/// The local party: its member id, relay keys and personal storage root.
pub struct LocalIdentity {
    pub member_id: String,
    pub name: String,
    pub keys: Keys,
    /// Handed to the wallet backend when producing partial signatures.
    pub key_handle: KeyHandle,
    /// Seals records that belong to this party alone.
    pub personal_root: RootSecret,
}

impl LocalIdentity {
    pub fn new(
        member_id: &str,
        name: &str,
        keys: Keys,
        key_handle: KeyHandle,
        personal_root: RootSecret,
    ) -> Self {
        Self {
            member_id: member_id.to_string(),
            name: name.to_string(),
            keys,
            key_handle,
            personal_root,
        }
    }

    pub fn pubkey_bytes(&self) -> [u8; 32] {
        self.keys.public_key().to_bytes()
    }

    pub fn as_member(&self, role: Role) -> Member {
        Member::new(&self.member_id, &self.name, self.pubkey_bytes(), role)
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub fee_rate: FeeRate,
    /// Broadcast attempts on transient wallet errors before the proposal fails.
    pub broadcast_attempts: u32,
    pub broadcast_retry_delay: Duration,
    /// Announcements buffered while their proposal is unknown.
    pub orphan_limit: usize,
    pub orphan_ttl: Duration,
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fee_rate: FeeRate::default(),
            broadcast_attempts: 3,
            broadcast_retry_delay: Duration::from_secs(2),
            orphan_limit: 256,
            orphan_ttl: Duration::from_secs(600),
            event_buffer: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CoordinatorEvent {
    ProposalChanged {
        group_id: String,
        proposal_id: String,
        status: ProposalStatus,
        signatures: usize,
        required: u8,
        txid: Option<String>,
        error: Option<String>,
    },
    Notification(NotificationPayload),
    MemberJoined {
        group_id: String,
        member_id: String,
        name: String,
    },
    KeyContributed {
        group_id: String,
        member_id: String,
    },
    DescriptorReady {
        group_id: String,
        descriptor: String,
    },
    BalanceUpdated {
        group_id: String,
        balance_sats: u64,
        goal_sats: Option<u64>,
    },
}

type ProposalCell = Arc<Mutex<Proposal>>;

pub struct Coordinator {
    identity: LocalIdentity,
    transport: Transport,
    wallet: Arc<dyn WalletBackend>,
    store: Arc<dyn EncryptedStore>,
    config: CoordinatorConfig,
    groups: RwLock<HashMap<String, CustodyGroup>>,
    /// Opaque relay topic to group id.
    topics: RwLock<HashMap<String, String>>,
    proposals: RwLock<HashMap<String, ProposalCell>>,
    orphans: Mutex<OrphanBuffer>,
    /// Proposal ids this party has produced a partial signature for.
    signing_log: Mutex<BTreeSet<String>>,
    inbox: Mutex<Vec<NotificationPayload>>,
    in_flight: Mutex<HashSet<String>>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    inbound: Mutex<Option<broadcast::Receiver<Event>>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: TokioMutex<Option<mpsc::Receiver<()>>>,
}

impl Coordinator {
    /// Loads persisted groups and proposals and subscribes to their topics.
    ///
    /// Relay events are buffered from this point on, so nothing is lost
    /// between construction and [`Coordinator::run`].
    pub fn new(
        identity: LocalIdentity,
        transport: Transport,
        wallet: Arc<dyn WalletBackend>,
        store: Arc<dyn EncryptedStore>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let inbound = transport.events();

        let signing_log: BTreeSet<String> = storage::load_sealed(
            store.as_ref(),
            &identity.personal_root,
            KeyContext::PersonalVault,
            LOCAL_SCOPE,
            storage::SIGNING_LOG,
        )?
        .unwrap_or_default();
        let inbox: Vec<NotificationPayload> = storage::load_sealed(
            store.as_ref(),
            &identity.personal_root,
            KeyContext::PersonalMessages,
            LOCAL_SCOPE,
            NOTIFICATIONS,
        )?
        .unwrap_or_default();
        let groups: Vec<CustodyGroup> = storage::load_sealed(
            store.as_ref(),
            &identity.personal_root,
            KeyContext::PersonalVault,
            LOCAL_SCOPE,
            GROUPS,
        )?
        .unwrap_or_default();

        let coordinator = Self {
            orphans: Mutex::new(OrphanBuffer::new(config.orphan_limit, config.orphan_ttl)),
            signing_log: Mutex::new(signing_log),
            inbox: Mutex::new(inbox),
            groups: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            proposals: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            inbound: Mutex::new(Some(inbound)),
            shutdown_rx: TokioMutex::new(Some(shutdown_rx)),
            shutdown_tx,
            event_tx,
            identity,
            transport,
            wallet,
            store,
            config,
        };

        let direct = Filter::new()
            .kind(Kind::Custom(PACT_EVENT_KIND))
            .pubkey(coordinator.identity.keys.public_key());
        coordinator
            .transport
            .subscribe(DIRECT_SUBSCRIPTION, vec![direct])?;

        let count = groups.len();
        for group in groups {
            coordinator.add_group(group)?;
        }
        debug!(groups = count, member = %coordinator.identity.member_id, "coordinator ready");
        Ok(coordinator)
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    pub fn group(&self, group_id: &str) -> Result<CustodyGroup> {
        self.groups
            .read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()).into())
    }

    pub fn groups(&self) -> Vec<CustodyGroup> {
        let mut groups: Vec<CustodyGroup> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        groups
    }

    pub fn proposal(&self, proposal_id: &str) -> Result<Proposal> {
        Ok(self.cell(proposal_id)?.lock().clone())
    }

    /// Every proposal of a group, oldest first.
    pub fn list_proposals(&self, group_id: &str) -> Result<Vec<Proposal>> {
        if !self.groups.read().contains_key(group_id) {
            return Err(PactError::GroupNotFound(group_id.to_string()).into());
        }
        let mut list: Vec<Proposal> = {
            let map = self.proposals.read();
            map.values()
                .filter_map(|cell| {
                    let p = cell.lock();
                    (p.group_id == group_id).then(|| p.clone())
                })
                .collect()
        };
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    /// Pending proposals still waiting on this party's signature.
    pub fn pending_for_me(&self, group_id: &str) -> Result<Vec<Proposal>> {
        let group = self.group(group_id)?;
        let me = &self.identity.member_id;
        if group.require_signer(me).is_err() {
            return Ok(Vec::new());
        }
        let signed = self.signing_log.lock().clone();
        Ok(self
            .list_proposals(group_id)?
            .into_iter()
            .filter(|p| p.awaits(me) && !signed.contains(&p.id))
            .collect())
    }

    pub fn notifications(&self) -> Vec<NotificationPayload> {
        self.inbox.lock().clone()
    }

    /// Processes relay events until shutdown or until the transport goes away.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| NetError::Protocol("run() has already been started".into()))?;
        let mut events = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| NetError::Protocol("run() has already been started".into()))?;

        let mut cleanup_interval = tokio::time::interval(Duration::from_secs(60));
        cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = cleanup_interval.tick() => {
                    let expired = self.orphans.lock().expire();
                    if expired > 0 {
                        debug!(expired, "dropped orphaned announcements");
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(&event) {
                                warn!(event_id = %event.id, error = %e, "Failed to handle event");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "coordinator fell behind relay events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("relay event stream closed");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    fn cell(&self, proposal_id: &str) -> Result<ProposalCell> {
        self.proposals
            .read()
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| PactError::ProposalNotFound(proposal_id.to_string()).into())
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_proposal(&self, p: &Proposal) {
        self.emit(CoordinatorEvent::ProposalChanged {
            group_id: p.group_id.clone(),
            proposal_id: p.id.clone(),
            status: p.status,
            signatures: p.signature_count(),
            required: p.required_signatures,
            txid: p.txid.clone(),
            error: p.error.clone(),
        });
    }

    /// Seals and publishes a group message. Unreachable relays are not an error.
    fn publish_group(&self, group: &CustodyGroup, msg: &PactMessage) -> Result<usize> {
        let event = PactEventBuilder::group_message(&self.identity.keys, group, msg)?;
        let relays = self.transport.publish(&event);
        debug!(
            group_id = %group.id,
            msg_type = msg.message_type(),
            relays,
            "announced"
        );
        Ok(relays)
    }

    fn persist_proposals(&self, group_id: &str) -> Result<()> {
        let root = self
            .groups
            .read()
            .get(group_id)
            .map(|g| g.root_secret.clone())
            .ok_or_else(|| PactError::GroupNotFound(group_id.to_string()))?;
        let snapshot: Vec<Proposal> = {
            let map = self.proposals.read();
            map.values()
                .filter_map(|cell| {
                    let p = cell.lock();
                    (p.group_id == group_id).then(|| p.clone())
                })
                .collect()
        };
        storage::save_sealed(
            self.store.as_ref(),
            &root,
            KeyContext::GroupProposals,
            group_id,
            PROPOSALS,
            &snapshot,
        )?;
        Ok(())
    }

    fn persist_groups(&self) -> Result<()> {
        let snapshot: Vec<CustodyGroup> = self.groups.read().values().cloned().collect();
        storage::save_sealed(
            self.store.as_ref(),
            &self.identity.personal_root,
            KeyContext::PersonalVault,
            LOCAL_SCOPE,
            GROUPS,
            &snapshot,
        )?;
        Ok(())
    }

    fn persist_signing_log(&self) -> Result<()> {
        let snapshot = self.signing_log.lock().clone();
        storage::save_sealed(
            self.store.as_ref(),
            &self.identity.personal_root,
            KeyContext::PersonalVault,
            LOCAL_SCOPE,
            storage::SIGNING_LOG,
            &snapshot,
        )?;
        Ok(())
    }

    fn persist_inbox(&self) -> Result<()> {
        let snapshot = self.inbox.lock().clone();
        storage::save_sealed(
            self.store.as_ref(),
            &self.identity.personal_root,
            KeyContext::PersonalMessages,
            LOCAL_SCOPE,
            NOTIFICATIONS,
            &snapshot,
        )?;
        Ok(())
    }
}

/// Marks an operation as running until dropped; a second acquire fails.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, key: String) -> Option<Self> {
        if !set.lock().insert(key.clone()) {
            return None;
        }
        Some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

fn group_subscription_id(topic: &str) -> String {
    format!("pact-{}", &topic[..topic.len().min(16)])
}

fn group_filter(topic: &str) -> Filter {
    Filter::new()
        .kind(Kind::Custom(PACT_EVENT_KIND))
        .custom_tag(SingleLetterTag::lowercase(Alphabet::G), topic)
}
