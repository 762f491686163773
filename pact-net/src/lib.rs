// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pact Net - relay transport and proposal coordination
//!
//! Group members exchange sealed announcements over a redundant pool of
//! Nostr relays. Relays only ever see an opaque group topic, a message type
//! and ciphertext.

#![forbid(unsafe_code)]

mod backoff;
mod connector;
mod coordinator;
mod dedup;
mod error;
mod event;
mod health;
mod message;
mod protocol;
mod relay;
mod transport;

pub use backoff::Backoff;
pub use connector::{RelayConnector, RelayLink, WsConnector};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorEvent, LocalIdentity};
pub use error::{NetError, Result};
pub use event::PactEventBuilder;
pub use health::HealthTier;
pub use protocol::{
    BalanceUpdatePayload, CancellationPayload, DescriptorReadyPayload, FinalizationAnnouncement,
    GoalUpdatePayload, KeyContributionPayload, NotificationPayload, PactMessage,
    ProposalAnnouncement, SignatureAnnouncement, MAX_MESSAGE_SIZE, PACT_EVENT_KIND, PACT_VERSION,
};
pub use relay::{
    default_relays, validate_relay_url, validate_relay_url_allow_internal, RelayEndpoint,
    RelayPriority, RelayState, RelayStatus,
};
pub use transport::{Transport, TransportConfig, TransportEvent};

/// Installs the ring TLS provider for `wss://` relays. Safe to call more than once.
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
