// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::task::JoinHandle;

use pact_core::{
    CustodyGroup, EncryptedStore, KeyHandle, Member, MemoryStore, PactError, ProposalStatus,
    Purpose, RedbStore, Role, RootSecret,
};
use pact_net::{
    Coordinator, CoordinatorConfig, CoordinatorEvent, LocalIdentity, NetError, PactEventBuilder,
    PactMessage, ProposalAnnouncement, SignatureAnnouncement, Transport,
};

use common::{endpoints, eventually, fast_config, txid_of, FakeWallet, MemoryRelayHub};

const RELAYS: [&str; 2] = ["ws://relay-a.test", "ws://relay-b.test"];
const DESCRIPTOR: &str = "wsh(sortedmulti(2,xpubA,xpubB,xpubC))";

struct Party {
    coordinator: Arc<Coordinator>,
    wallet: Arc<FakeWallet>,
    task: JoinHandle<()>,
}

impl Party {
    async fn start(
        hub: &Arc<MemoryRelayHub>,
        member_id: &str,
        keys: &Keys,
        personal_root: &RootSecret,
        store: Arc<dyn EncryptedStore>,
        groups: &[CustodyGroup],
    ) -> Self {
        let transport = Transport::with_connector(endpoints(&RELAYS), fast_config(), hub.clone());
        transport.connect().await;

        let identity = LocalIdentity::new(
            member_id,
            &capitalize(member_id),
            keys.clone(),
            KeyHandle::new(member_id),
            personal_root.clone(),
        );
        let wallet = Arc::new(FakeWallet::default());
        let config = CoordinatorConfig {
            broadcast_retry_delay: Duration::from_millis(10),
            ..CoordinatorConfig::default()
        };
        let coordinator = Arc::new(
            Coordinator::new(identity, transport, wallet.clone(), store, config)
                .expect("coordinator"),
        );
        for group in groups {
            coordinator.add_group(group.clone()).expect("add group");
        }

        let runner = coordinator.clone();
        let task = tokio::spawn(async move {
            let _ = runner.run().await;
        });
        Self {
            coordinator,
            wallet,
            task,
        }
    }

    fn status(&self, proposal_id: &str) -> Option<(ProposalStatus, usize)> {
        self.coordinator
            .proposal(proposal_id)
            .ok()
            .map(|p| (p.status, p.signature_count()))
    }

    async fn stop(self) {
        self.coordinator.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
        self.coordinator.transport().shutdown();
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars
        .next()
        .map(|c| c.to_uppercase().collect::<String>() + chars.as_str())
        .unwrap_or_default()
}

fn member(id: &str, keys: &Keys, role: Role) -> Member {
    Member::new(id, &capitalize(id), keys.public_key().to_bytes(), role)
}

struct Keyring {
    alice: Keys,
    bob: Keys,
    carol: Keys,
    dave: Keys,
}

impl Keyring {
    fn new() -> Self {
        Self {
            alice: Keys::generate(),
            bob: Keys::generate(),
            carol: Keys::generate(),
            dave: Keys::generate(),
        }
    }
}

/// Two-of-three group with every key contributed and the descriptor set.
fn sealed_group(keys: &Keyring) -> CustodyGroup {
    let mut group = CustodyGroup::new(
        "family",
        "Family Savings",
        2,
        3,
        member("alice", &keys.alice, Role::Creator),
        RootSecret::generate(),
    )
    .unwrap();
    group.join(member("bob", &keys.bob, Role::Member)).unwrap();
    group.join(member("carol", &keys.carol, Role::Member)).unwrap();
    for (id, xpub) in [("alice", "xpubA"), ("bob", "xpubB"), ("carol", "xpubC")] {
        group.contribute_key(id, xpub).unwrap();
    }
    group.seal_descriptor(DESCRIPTOR).unwrap();
    group
}

fn store() -> Arc<dyn EncryptedStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn test_two_of_three_proposal_lifecycle() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let group = sealed_group(&keys);
    let groups = [group.clone()];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &groups).await;
    let carol = Party::start(&hub, "carol", &keys.carol, &RootSecret::generate(), store(), &groups).await;
    let dave = Party::start(&hub, "dave", &keys.dave, &RootSecret::generate(), store(), &groups).await;

    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 10_000, Purpose::GoalWithdrawal, None)
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::PendingSignatures);
    assert_eq!(proposal.required_signatures, 2);
    let id = proposal.id.clone();

    for party in [&bob, &carol, &dave] {
        eventually("proposal announced", || party.status(&id).is_some()).await;
    }
    assert_eq!(bob.coordinator.pending_for_me("family").unwrap().len(), 1);
    assert!(dave.coordinator.pending_for_me("family").unwrap().is_empty());

    let ready = bob.coordinator.submit_signature(&id).await.unwrap();
    assert!(!ready);
    assert_eq!(bob.status(&id), Some((ProposalStatus::PendingSignatures, 1)));
    assert!(bob.coordinator.pending_for_me("family").unwrap().is_empty());

    let denied = dave.coordinator.submit_signature(&id).await.unwrap_err();
    assert!(matches!(
        denied,
        NetError::Core(PactError::PermissionDenied(_))
    ));

    for party in [&alice, &carol] {
        eventually("bob's signature", || {
            party.status(&id) == Some((ProposalStatus::PendingSignatures, 1))
        })
        .await;
    }

    let ready = carol.coordinator.submit_signature(&id).await.unwrap();
    assert!(ready);
    let finalized = carol.coordinator.proposal(&id).unwrap();
    assert_eq!(finalized.status, ProposalStatus::Broadcasted);
    assert_eq!(finalized.signature_count(), 2);
    let txid = finalized.txid.clone().expect("txid");
    assert_eq!(carol.wallet.broadcasts.lock().len(), 1);
    assert_eq!(txid, txid_of(&carol.wallet.broadcasts.lock()[0]));

    for party in [&alice, &bob, &dave] {
        eventually("finalization", || {
            party
                .coordinator
                .proposal(&id)
                .is_ok_and(|p| p.status == ProposalStatus::Broadcasted && p.txid.as_deref() == Some(txid.as_str()))
        })
        .await;
    }
    assert!(alice.wallet.broadcasts.lock().is_empty());
    assert!(bob.wallet.broadcasts.lock().is_empty());

    alice.coordinator.mark_confirmed(&id).unwrap();
    assert_eq!(alice.status(&id).unwrap().0, ProposalStatus::Confirmed);

    for party in [alice, bob, carol, dave] {
        party.stop().await;
    }
}

#[tokio::test]
async fn test_double_sign_rejected() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 5_000, Purpose::Test, Some("fees".into()))
        .await
        .unwrap();

    assert!(!alice.coordinator.submit_signature(&proposal.id).await.unwrap());
    let err = alice.coordinator.submit_signature(&proposal.id).await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::AlreadySigned(ref who)) if who == "alice"));
    assert_eq!(alice.status(&proposal.id), Some((ProposalStatus::PendingSignatures, 1)));

    alice.stop().await;
}

#[tokio::test]
async fn test_forged_signature_ignored() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let group = sealed_group(&keys);
    let groups = [group.clone()];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 7_500, Purpose::Emergency, None)
        .await
        .unwrap();

    // Dave holds the group root but signs with his own relay key while claiming to be bob.
    let forged = PactMessage::SignatureAnnouncement(SignatureAnnouncement {
        proposal_id: proposal.id.clone(),
        group_id: "family".into(),
        signer_id: "bob".into(),
        signer_name: "Bob".into(),
        signed_at: 0,
        partial_sig: b"forged".to_vec(),
    });
    let event = PactEventBuilder::group_message(&keys.dave, &group, &forged).unwrap();
    let dave_transport = Transport::with_connector(endpoints(&RELAYS), fast_config(), hub.clone());
    dave_transport.connect().await;
    assert_eq!(dave_transport.publish(&event), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.status(&proposal.id), Some((ProposalStatus::PendingSignatures, 0)));

    dave_transport.shutdown();
    alice.stop().await;
}

#[tokio::test]
async fn test_signature_before_proposal_is_applied_on_arrival() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let group = sealed_group(&keys);

    let carol = Party::start(&hub, "carol", &keys.carol, &RootSecret::generate(), store(), &[group.clone()]).await;

    let announcement = PactMessage::ProposalAnnouncement(ProposalAnnouncement {
        proposal_id: "p-early".into(),
        group_id: "family".into(),
        destination: "bc1qdestination".into(),
        amount_sats: 20_000,
        purpose: Purpose::Partial,
        required_signatures: 2,
        creator_id: "alice".into(),
        note: None,
        unsigned_tx: b"psbt".to_vec(),
        created_at: 1_700_000_000,
    });
    let signature = PactMessage::SignatureAnnouncement(SignatureAnnouncement {
        proposal_id: "p-early".into(),
        group_id: "family".into(),
        signer_id: "bob".into(),
        signer_name: "Bob".into(),
        signed_at: 1_700_000_100,
        partial_sig: b"sig:bob".to_vec(),
    });
    let sig_event = PactEventBuilder::group_message(&keys.bob, &group, &signature).unwrap();
    let proposal_event = PactEventBuilder::group_message(&keys.alice, &group, &announcement).unwrap();

    let relay = Transport::with_connector(endpoints(&RELAYS), fast_config(), hub.clone());
    relay.connect().await;
    relay.publish(&sig_event);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(carol.status("p-early").is_none());

    relay.publish(&proposal_event);
    eventually("buffered signature applied", || {
        carol.status("p-early") == Some((ProposalStatus::PendingSignatures, 1))
    })
    .await;

    relay.shutdown();
    carol.stop().await;
}

#[tokio::test]
async fn test_failed_broadcast_can_be_retried() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &groups).await;

    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 12_000, Purpose::Rebalance, None)
        .await
        .unwrap();
    let id = proposal.id.clone();
    alice.coordinator.submit_signature(&id).await.unwrap();
    eventually("alice's signature reaches bob", || {
        bob.status(&id) == Some((ProposalStatus::PendingSignatures, 1))
    })
    .await;

    bob.wallet.refuse_broadcast.store(true, Ordering::SeqCst);
    assert!(bob.coordinator.submit_signature(&id).await.unwrap());
    let failed = bob.coordinator.proposal(&id).unwrap();
    assert_eq!(failed.status, ProposalStatus::Failed);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("broadcast")));

    bob.wallet.refuse_broadcast.store(false, Ordering::SeqCst);
    bob.wallet.unavailable_broadcasts.store(1, Ordering::SeqCst);
    let txid = bob.coordinator.broadcast(&id).await.unwrap();
    assert_eq!(bob.status(&id).unwrap().0, ProposalStatus::Broadcasted);

    eventually("alice learns the txid", || {
        alice
            .coordinator
            .proposal(&id)
            .is_ok_and(|p| p.txid.as_deref() == Some(txid.as_str()))
    })
    .await;

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_broadcast_before_quorum_rejected() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 1_000, Purpose::Test, None)
        .await
        .unwrap();
    alice.coordinator.submit_signature(&proposal.id).await.unwrap();

    let err = alice.coordinator.broadcast(&proposal.id).await.unwrap_err();
    assert!(matches!(
        err,
        NetError::Core(PactError::InsufficientSignatures { needed: 2, have: 1 })
    ));
    assert!(alice.wallet.broadcasts.lock().is_empty());

    alice.stop().await;
}

#[tokio::test]
async fn test_insufficient_eligible_signers() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let mut group = sealed_group(&keys);
    group.remove_member("bob").unwrap();
    group.remove_member("carol").unwrap();

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &[group]).await;
    let err = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 1_000, Purpose::Test, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NetError::Core(PactError::InsufficientSigners { needed: 2, available: 1 })
    ));
    assert!(alice.coordinator.list_proposals("family").unwrap().is_empty());

    alice.stop().await;
}

#[tokio::test]
async fn test_cancellation_converges() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &groups).await;

    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 3_000, Purpose::Test, None)
        .await
        .unwrap();
    let id = proposal.id.clone();
    eventually("bob sees proposal", || bob.status(&id).is_some()).await;

    let err = bob.coordinator.cancel_proposal(&id).unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::PermissionDenied(_))));

    alice.coordinator.cancel_proposal(&id).unwrap();
    eventually("bob sees cancellation", || {
        bob.status(&id).is_some_and(|(s, _)| s == ProposalStatus::Cancelled)
    })
    .await;

    let err = bob.coordinator.submit_signature(&id).await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::InvalidState(_))));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_members_receive_direct_notification() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &groups).await;
    let mut bob_events = bob.coordinator.subscribe();

    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 42_000, Purpose::GoalWithdrawal, None)
        .await
        .unwrap();

    eventually("notification delivered", || !bob.coordinator.notifications().is_empty()).await;
    let note = &bob.coordinator.notifications()[0];
    assert_eq!(note.from_member, "alice");
    assert_eq!(note.proposal_id.as_deref(), Some(proposal.id.as_str()));
    assert!(note.summary.contains("42000"));

    let mut saw_notification = false;
    while let Ok(ev) = bob_events.try_recv() {
        if matches!(ev, CoordinatorEvent::Notification(_)) {
            saw_notification = true;
        }
    }
    assert!(saw_notification);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_key_contribution_and_descriptor() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let mut group = CustodyGroup::new(
        "trip",
        "Summer Trip",
        2,
        2,
        member("alice", &keys.alice, Role::Creator),
        RootSecret::generate(),
    )
    .unwrap();
    group.contribute_key("alice", "xpubA").unwrap();

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &[group.clone()]).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &[group]).await;

    bob.coordinator.contribute_key("trip", "xpubB").unwrap();
    eventually("alice sees bob join", || {
        alice
            .coordinator
            .group("trip")
            .is_ok_and(|g| g.member("bob").and_then(|m| m.xpub.as_deref()) == Some("xpubB"))
    })
    .await;

    let err = bob.coordinator.generate_descriptor("trip").await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::PermissionDenied(_))));

    let descriptor = alice.coordinator.generate_descriptor("trip").await.unwrap();
    assert_eq!(descriptor, "wsh(sortedmulti(2,xpubA,xpubB))");
    eventually("bob receives descriptor", || {
        bob.coordinator
            .group("trip")
            .is_ok_and(|g| g.descriptor.as_deref() == Some(descriptor.as_str()))
    })
    .await;

    let proposal = bob
        .coordinator
        .create_proposal("trip", "bc1qhotel", 50_000, Purpose::GoalWithdrawal, None)
        .await
        .unwrap();
    assert_eq!(proposal.required_signatures, 2);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_balance_and_goal_shared() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &groups).await;

    alice
        .coordinator
        .update_balance("family", 250_000, Some(1_000_000))
        .unwrap();
    eventually("bob sees balance and goal", || {
        bob.coordinator
            .group("family")
            .is_ok_and(|g| g.balance_sats == 250_000 && g.goal_sats == Some(1_000_000))
    })
    .await;

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];
    let dir = tempfile::tempdir().unwrap();
    let bob_store: Arc<dyn EncryptedStore> =
        Arc::new(RedbStore::open(&dir.path().join("bob.redb")).unwrap());
    let bob_root = RootSecret::generate();

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &bob_root, bob_store.clone(), &groups).await;

    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 9_000, Purpose::Test, None)
        .await
        .unwrap();
    let id = proposal.id.clone();
    eventually("bob sees proposal", || bob.status(&id).is_some()).await;
    bob.coordinator.submit_signature(&id).await.unwrap();
    bob.stop().await;

    let bob = Party::start(&hub, "bob", &keys.bob, &bob_root, bob_store, &[]).await;
    assert_eq!(bob.coordinator.groups().len(), 1);
    assert_eq!(bob.status(&id), Some((ProposalStatus::PendingSignatures, 1)));
    let err = bob.coordinator.submit_signature(&id).await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::AlreadySigned(_))));

    alice.stop().await;
    bob.stop().await;
}

fn announcement(proposal_id: &str, group_id: &str, creator: &str, required: u8) -> PactMessage {
    PactMessage::ProposalAnnouncement(ProposalAnnouncement {
        proposal_id: proposal_id.into(),
        group_id: group_id.into(),
        destination: "bc1qdestination".into(),
        amount_sats: 30_000,
        purpose: Purpose::Emergency,
        required_signatures: required,
        creator_id: creator.into(),
        note: None,
        unsigned_tx: b"psbt".to_vec(),
        created_at: 1_700_000_000,
    })
}

fn signature_by(proposal_id: &str, group_id: &str, signer: &str) -> PactMessage {
    PactMessage::SignatureAnnouncement(SignatureAnnouncement {
        proposal_id: proposal_id.into(),
        group_id: group_id.into(),
        signer_id: signer.into(),
        signer_name: capitalize(signer),
        signed_at: 1_700_000_100,
        partial_sig: format!("sig:{signer}").into_bytes(),
    })
}

#[tokio::test]
async fn test_announced_quorum_must_match_threshold() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let family = sealed_group(&keys);
    let mut draft = CustodyGroup::new(
        "draft",
        "Not Yet Funded",
        2,
        3,
        member("alice", &keys.alice, Role::Creator),
        RootSecret::generate(),
    )
    .unwrap();
    draft.join(member("bob", &keys.bob, Role::Member)).unwrap();
    draft.join(member("carol", &keys.carol, Role::Member)).unwrap();

    let carol = Party::start(
        &hub,
        "carol",
        &keys.carol,
        &RootSecret::generate(),
        store(),
        &[family.clone(), draft.clone()],
    )
    .await;

    let seal = |group: &CustodyGroup, msg: &PactMessage| {
        PactEventBuilder::group_message(&keys.bob, group, msg).unwrap()
    };
    let lowered = seal(&family, &announcement("p-lowered", "family", "bob", 1));
    let lowered_sig = seal(&family, &signature_by("p-lowered", "family", "bob"));
    let unfunded = seal(&draft, &announcement("p-unfunded", "draft", "bob", 2));
    let honest = seal(&family, &announcement("p-honest", "family", "bob", 2));

    let relay = Transport::with_connector(endpoints(&RELAYS), fast_config(), hub.clone());
    relay.connect().await;
    for event in [&lowered, &lowered_sig, &unfunded, &honest] {
        relay.publish(event);
    }

    // Relays keep per-connection order, so the honest proposal lands last.
    eventually("honest proposal", || carol.status("p-honest").is_some()).await;
    assert_eq!(
        carol.status("p-honest"),
        Some((ProposalStatus::PendingSignatures, 0))
    );
    assert!(carol.status("p-lowered").is_none());
    assert!(carol.status("p-unfunded").is_none());
    assert!(carol.coordinator.list_proposals("draft").unwrap().is_empty());

    let err = carol.coordinator.broadcast("p-lowered").await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::ProposalNotFound(_))));
    assert!(carol.wallet.broadcasts.lock().is_empty());

    relay.shutdown();
    carol.stop().await;
}

#[tokio::test]
async fn test_concurrent_submissions_record_one_signature() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let groups = [sealed_group(&keys)];

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &groups).await;
    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &groups).await;
    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 4_000, Purpose::Test, None)
        .await
        .unwrap();
    let id = proposal.id.clone();

    alice.wallet.sign_delay_ms.store(100, Ordering::SeqCst);
    let (first, second) = tokio::join!(
        alice.coordinator.submit_signature(&id),
        alice.coordinator.submit_signature(&id),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(NetError::Core(PactError::InvalidState(_) | PactError::AlreadySigned(_)))
    )));
    assert_eq!(alice.status(&id), Some((ProposalStatus::PendingSignatures, 1)));

    eventually("bob sees one signature", || {
        bob.status(&id) == Some((ProposalStatus::PendingSignatures, 1))
    })
    .await;
    let err = alice.coordinator.submit_signature(&id).await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::AlreadySigned(_))));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_local_signature_racing_inbound_finalizes_once() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let group = sealed_group(&keys);

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &[group.clone()]).await;
    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 8_000, Purpose::Partial, None)
        .await
        .unwrap();
    let id = proposal.id.clone();

    alice.wallet.sign_delay_ms.store(300, Ordering::SeqCst);
    let signer = alice.coordinator.clone();
    let local = tokio::spawn({
        let id = id.clone();
        async move { signer.submit_signature(&id).await }
    });

    let bob_sig = PactEventBuilder::group_message(&keys.bob, &group, &signature_by(&id, "family", "bob"))
        .unwrap();
    let relay = Transport::with_connector(endpoints(&RELAYS), fast_config(), hub.clone());
    relay.connect().await;
    relay.publish(&bob_sig);
    eventually("bob's signature applied while alice signs", || {
        alice.status(&id) == Some((ProposalStatus::PendingSignatures, 1))
    })
    .await;

    assert!(local.await.unwrap().unwrap());
    let done = alice.coordinator.proposal(&id).unwrap();
    assert_eq!(done.status, ProposalStatus::Broadcasted);
    assert_eq!(done.signature_count(), 2);
    assert_eq!(alice.wallet.broadcasts.lock().len(), 1);

    let err = alice.coordinator.broadcast(&id).await.unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::InvalidState(_))));
    assert_eq!(alice.wallet.broadcasts.lock().len(), 1);

    relay.shutdown();
    alice.stop().await;
}

#[tokio::test]
async fn test_inbound_quorum_then_racing_broadcasts() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let group = sealed_group(&keys);

    let alice = Party::start(&hub, "alice", &keys.alice, &RootSecret::generate(), store(), &[group.clone()]).await;
    let proposal = alice
        .coordinator
        .create_proposal("family", "bc1qdestination", 6_000, Purpose::Rebalance, None)
        .await
        .unwrap();
    let id = proposal.id.clone();
    assert!(!alice.coordinator.submit_signature(&id).await.unwrap());

    let relay = Transport::with_connector(endpoints(&RELAYS), fast_config(), hub.clone());
    relay.connect().await;
    let bob_sig = PactEventBuilder::group_message(&keys.bob, &group, &signature_by(&id, "family", "bob"))
        .unwrap();
    relay.publish(&bob_sig);
    eventually("quorum from inbound signature", || {
        alice.status(&id) == Some((ProposalStatus::ReadyToBroadcast, 2))
    })
    .await;
    assert!(alice.wallet.broadcasts.lock().is_empty());

    alice.wallet.broadcast_delay_ms.store(100, Ordering::SeqCst);
    let (first, second) = tokio::join!(
        alice.coordinator.broadcast(&id),
        alice.coordinator.broadcast(&id),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(NetError::Core(PactError::InvalidState(_))))));
    assert_eq!(alice.wallet.broadcasts.lock().len(), 1);
    assert_eq!(alice.status(&id).unwrap().0, ProposalStatus::Broadcasted);

    relay.shutdown();
    alice.stop().await;
}

#[tokio::test]
async fn test_rejected_key_leaves_roster_unchanged() {
    let hub = MemoryRelayHub::new(&RELAYS);
    let keys = Keyring::new();
    let group = CustodyGroup::new(
        "trip",
        "Summer Trip",
        2,
        2,
        member("alice", &keys.alice, Role::Creator),
        RootSecret::generate(),
    )
    .unwrap();

    let bob = Party::start(&hub, "bob", &keys.bob, &RootSecret::generate(), store(), &[group]).await;

    let oversized = "x".repeat(pact_core::group::MAX_XPUB_LENGTH + 1);
    let err = bob.coordinator.contribute_key("trip", &oversized).unwrap_err();
    assert!(matches!(err, NetError::Core(PactError::InvalidGroup(_))));
    let roster = bob.coordinator.group("trip").unwrap();
    assert!(roster.member("bob").is_none());
    assert_eq!(roster.total_signers, 2);
    assert_eq!(roster.members.len(), 1);

    bob.coordinator.contribute_key("trip", "xpubB").unwrap();
    let roster = bob.coordinator.group("trip").unwrap();
    assert_eq!(
        roster.member("bob").and_then(|m| m.xpub.as_deref()),
        Some("xpubB")
    );

    bob.stop().await;
}
