// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Redundant relay pool.
//!
//! Every configured relay gets one supervisor task that connects, reads until
//! the link closes or goes stale, then waits out the backoff and tries again.
//! A relay therefore never has two connection attempts in flight. Publishes
//! go to every connected relay and are queued for the others; subscriptions
//! are replayed to a relay each time it reconnects.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::connector::{RelayConnector, RelayLink, WsConnector};
use crate::dedup::SeenCache;
use crate::error::Result;
use crate::health::HealthTier;
use crate::message;
use crate::relay::{RelayEndpoint, RelayState, RelayStatus};

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// How long `connect` waits for first attempts before classifying health.
    pub connect_timeout: Duration,
    /// Per-relay websocket handshake timeout.
    pub handshake_timeout: Duration,
    pub backoff: Backoff,
    /// A relay silent for this long is reconnected even if the socket looks open.
    pub stale_after: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    /// Frames kept per disconnected relay; the oldest is dropped beyond this.
    pub queue_limit: usize,
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(8),
            backoff: Backoff::default(),
            stale_after: Duration::from_secs(60),
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(3600),
            queue_limit: 256,
            event_buffer: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    RelayConnected { url: String },
    RelayDisconnected { url: String, reason: String },
    HealthChanged(HealthTier),
}

struct RelaySlot {
    endpoint: RelayEndpoint,
    state: RelayState,
    outbound: Option<mpsc::Sender<String>>,
    queue: VecDeque<String>,
    last_message_at: Option<Instant>,
    sent: u64,
    received: u64,
    consecutive_failures: u32,
}

impl RelaySlot {
    fn new(endpoint: RelayEndpoint) -> Self {
        Self {
            endpoint,
            state: RelayState::Disconnected,
            outbound: None,
            queue: VecDeque::new(),
            last_message_at: None,
            sent: 0,
            received: 0,
            consecutive_failures: 0,
        }
    }

    /// Hands the frame back if the relay cannot take it right now.
    fn try_send(&mut self, frame: String) -> std::result::Result<(), String> {
        if self.state != RelayState::Connected {
            return Err(frame);
        }
        let Some(tx) = &self.outbound else {
            return Err(frame);
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.sent += 1;
                Ok(())
            }
            Err(TrySendError::Full(frame)) | Err(TrySendError::Closed(frame)) => Err(frame),
        }
    }

    fn enqueue(&mut self, frame: String, limit: usize) {
        if self.queue.len() >= limit {
            self.queue.pop_front();
            debug!(relay = %self.endpoint.url, "outbound queue full; dropped oldest frame");
        }
        self.queue.push_back(frame);
    }
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn RelayConnector>,
    relays: RwLock<Vec<RelaySlot>>,
    subscriptions: RwLock<BTreeMap<String, Vec<Filter>>>,
    seen: Mutex<SeenCache<EventId>>,
    event_tx: broadcast::Sender<Event>,
    status_tx: broadcast::Sender<TransportEvent>,
    last_health: Mutex<Option<HealthTier>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    settled: watch::Sender<usize>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// Handle to the relay pool. Clones share the same connections.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(endpoints: Vec<RelayEndpoint>, config: TransportConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.handshake_timeout));
        Self::with_connector(endpoints, config, connector)
    }

    pub fn with_connector(
        mut endpoints: Vec<RelayEndpoint>,
        config: TransportConfig,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        let mut urls = HashSet::new();
        endpoints.retain(|e| urls.insert(e.url.clone()));
        endpoints.sort_by_key(|e| e.priority);

        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (status_tx, _) = broadcast::channel(64);
        let (settled, _) = watch::channel(0usize);
        let seen = SeenCache::new(config.dedup_capacity, config.dedup_ttl);

        Self {
            inner: Arc::new(Inner {
                relays: RwLock::new(endpoints.into_iter().map(RelaySlot::new).collect()),
                subscriptions: RwLock::new(BTreeMap::new()),
                seen: Mutex::new(seen),
                event_tx,
                status_tx,
                last_health: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                settled,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                connector,
                config,
            }),
        }
    }

    /// Starts connecting to every relay in priority order.
    ///
    /// Waits until each relay has finished its first attempt or the connect
    /// timeout elapses, then returns the health tier. Never fails: a degraded
    /// pool keeps retrying in the background. Later calls return immediately.
    pub async fn connect(&self) -> HealthTier {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return self.health();
        }

        let total = self.inner.relays.read().len();
        let mut settled = self.inner.settled.subscribe();
        {
            let mut tasks = self.inner.tasks.lock();
            for idx in 0..total {
                let this = self.clone();
                tasks.push(tokio::spawn(this.run_relay(idx)));
            }
        }

        let all_settled = timeout(
            self.inner.config.connect_timeout,
            settled.wait_for(|n| *n >= total),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        if !all_settled {
            debug!("connect timeout elapsed before every relay answered");
        }

        let tier = self.refresh_health();
        let connected = self.connected_count();
        if tier.is_degraded() {
            warn!(connected, total, health = %tier, "relay connectivity degraded");
        } else {
            info!(connected, total, health = %tier, "connected to relays");
        }
        tier
    }

    /// Sends `event` to every connected relay and queues it for the rest.
    ///
    /// Returns the number of relays it was handed to. Zero is logged, not an error.
    pub fn publish(&self, event: &Event) -> usize {
        let frame = match message::event_frame(event) {
            Ok(frame) => frame,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "failed to encode event");
                return 0;
            }
        };
        self.inner.seen.lock().insert(event.id);

        let limit = self.inner.config.queue_limit;
        let mut delivered = 0;
        {
            let mut relays = self.inner.relays.write();
            for slot in relays.iter_mut() {
                match slot.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(frame) => slot.enqueue(frame, limit),
                }
            }
        }

        if delivered == 0 {
            warn!(event_id = %event.id, "no relay connected; event queued until reconnect");
        } else {
            debug!(event_id = %event.id, relays = delivered, "published event");
        }
        delivered
    }

    pub fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        let frame = message::req_frame(subscription_id, &filters)?;
        self.inner
            .subscriptions
            .write()
            .insert(subscription_id.to_string(), filters);

        let limit = self.inner.config.queue_limit;
        let mut relays = self.inner.relays.write();
        for slot in relays.iter_mut() {
            let connected = slot.state == RelayState::Connected;
            if let Err(frame) = slot.try_send(frame.clone()) {
                if connected {
                    slot.enqueue(frame, limit);
                }
            }
        }
        debug!(subscription = subscription_id, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        if self
            .inner
            .subscriptions
            .write()
            .remove(subscription_id)
            .is_none()
        {
            return;
        }
        let frame = match message::close_frame(subscription_id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(subscription = subscription_id, error = %e, "failed to encode CLOSE");
                return;
            }
        };
        let mut relays = self.inner.relays.write();
        for slot in relays.iter_mut() {
            let _ = slot.try_send(frame.clone());
        }
        debug!(subscription = subscription_id, "unsubscribed");
    }

    /// Deduplicated, signature-checked events from every relay.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    pub fn transport_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn health(&self) -> HealthTier {
        let relays = self.inner.relays.read();
        let connected = relays
            .iter()
            .filter(|s| s.state == RelayState::Connected)
            .count();
        HealthTier::classify(connected, relays.len())
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .relays
            .read()
            .iter()
            .filter(|s| s.state == RelayState::Connected)
            .count()
    }

    pub fn relay_status(&self) -> Vec<RelayStatus> {
        let subscriptions = self.inner.subscriptions.read().len();
        self.inner
            .relays
            .read()
            .iter()
            .map(|slot| RelayStatus {
                url: slot.endpoint.url.clone(),
                priority: slot.endpoint.priority,
                state: slot.state,
                last_message_age: slot.last_message_at.map(|at| at.elapsed()),
                sent: slot.sent,
                received: slot.received,
                subscriptions,
                consecutive_failures: slot.consecutive_failures,
                queued: slot.queue.len(),
            })
            .collect()
    }

    /// Stops reconnecting and closes every link.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        {
            let mut relays = self.inner.relays.write();
            for slot in relays.iter_mut() {
                slot.outbound = None;
                slot.state = RelayState::Disconnected;
            }
        }
        self.refresh_health();
        info!("transport shut down");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn run_relay(self, idx: usize) {
        let url = self.inner.relays.read()[idx].endpoint.url.clone();
        let mut first_attempt = true;

        loop {
            if self.is_closed() {
                break;
            }
            self.set_state(idx, RelayState::Connecting);

            match self.inner.connector.connect(&url).await {
                Ok(RelayLink {
                    outbound,
                    mut inbound,
                }) => {
                    self.on_connected(idx, outbound);
                    if std::mem::take(&mut first_attempt) {
                        self.inner.settled.send_modify(|n| *n += 1);
                    }
                    let reason = self.read_until_closed(idx, &mut inbound).await;
                    drop(inbound);
                    self.on_disconnected(idx, reason);
                }
                Err(e) => {
                    self.on_failed(idx, &e.to_string());
                    if std::mem::take(&mut first_attempt) {
                        self.inner.settled.send_modify(|n| *n += 1);
                    }
                }
            }

            if self.is_closed() {
                break;
            }
            let delay = self.next_delay(idx);
            debug!(relay = %url, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
        trace!(relay = %url, "relay supervisor stopped");
    }

    async fn read_until_closed(
        &self,
        idx: usize,
        inbound: &mut mpsc::Receiver<String>,
    ) -> &'static str {
        let stale_after = self.inner.config.stale_after;
        loop {
            match timeout(stale_after, inbound.recv()).await {
                Ok(Some(text)) => self.handle_frame(idx, &text),
                Ok(None) => return "connection closed",
                Err(_) => {
                    warn!(
                        relay = %self.url(idx),
                        silent_secs = stale_after.as_secs(),
                        "relay went silent; forcing reconnect"
                    );
                    return "stale";
                }
            }
        }
    }

    fn handle_frame(&self, idx: usize, text: &str) {
        let url = {
            let mut relays = self.inner.relays.write();
            let slot = &mut relays[idx];
            slot.received += 1;
            slot.last_message_at = Some(Instant::now());
            slot.endpoint.url.clone()
        };

        match message::parse_relay_message(text) {
            Ok(RelayMessage::Event {
                subscription_id,
                event,
            }) => {
                if event.verify().is_err() {
                    warn!(relay = %url, event_id = %event.id, "dropping event with invalid signature");
                    return;
                }
                if !self.inner.seen.lock().insert(event.id) {
                    trace!(relay = %url, event_id = %event.id, "duplicate event");
                    return;
                }
                trace!(relay = %url, subscription = %subscription_id, event_id = %event.id, "event");
                let _ = self.inner.event_tx.send(event.into_owned());
            }
            Ok(RelayMessage::Ok {
                event_id,
                status: false,
                message,
            }) => {
                warn!(relay = %url, event_id = %event_id, message = %message, "relay rejected event");
            }
            Ok(RelayMessage::Ok { .. }) => {}
            Ok(RelayMessage::EndOfStoredEvents(subscription_id)) => {
                debug!(relay = %url, subscription = %subscription_id, "end of stored events");
            }
            Ok(RelayMessage::Notice(notice)) => {
                info!(relay = %url, notice = %notice, "relay notice");
            }
            Ok(RelayMessage::Closed {
                subscription_id,
                message,
            }) => {
                warn!(relay = %url, subscription = %subscription_id, message = %message, "relay closed subscription");
            }
            Ok(other) => {
                trace!(relay = %url, message = ?other, "unhandled relay message");
            }
            Err(e) => {
                debug!(relay = %url, error = %e, "ignoring unparseable relay message");
            }
        }
    }

    fn on_connected(&self, idx: usize, outbound: mpsc::Sender<String>) {
        let subscription_frames: Vec<String> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter_map(|(id, filters)| message::req_frame(id, filters).ok())
            .collect();
        let limit = self.inner.config.queue_limit;

        let (url, flushed) = {
            let mut relays = self.inner.relays.write();
            let slot = &mut relays[idx];
            slot.state = RelayState::Connected;
            slot.consecutive_failures = 0;
            slot.last_message_at = Some(Instant::now());
            slot.outbound = Some(outbound);

            let pending: Vec<String> = slot.queue.drain(..).collect();
            let flushed = pending.len();
            let mut blocked = false;
            for frame in pending.into_iter().chain(subscription_frames) {
                if blocked {
                    slot.enqueue(frame, limit);
                    continue;
                }
                if let Err(frame) = slot.try_send(frame) {
                    blocked = true;
                    slot.enqueue(frame, limit);
                }
            }
            (slot.endpoint.url.clone(), flushed)
        };

        info!(relay = %url, flushed, "relay connected");
        let _ = self
            .inner
            .status_tx
            .send(TransportEvent::RelayConnected { url });
        self.refresh_health();
    }

    fn on_disconnected(&self, idx: usize, reason: &str) {
        let url = {
            let mut relays = self.inner.relays.write();
            let slot = &mut relays[idx];
            slot.outbound = None;
            slot.state = RelayState::Disconnected;
            slot.endpoint.url.clone()
        };
        if self.is_closed() {
            return;
        }
        warn!(relay = %url, reason, "relay disconnected");
        let _ = self.inner.status_tx.send(TransportEvent::RelayDisconnected {
            url,
            reason: reason.to_string(),
        });
        self.refresh_health();
    }

    fn on_failed(&self, idx: usize, error: &str) {
        let (url, failures) = {
            let mut relays = self.inner.relays.write();
            let slot = &mut relays[idx];
            slot.outbound = None;
            slot.state = RelayState::Error;
            (slot.endpoint.url.clone(), slot.consecutive_failures)
        };
        warn!(relay = %url, failures, error, "relay connection failed");
        self.refresh_health();
    }

    /// Backoff for the relay's current failure streak, then extends the streak.
    fn next_delay(&self, idx: usize) -> Duration {
        let mut relays = self.inner.relays.write();
        let slot = &mut relays[idx];
        let delay = self.inner.config.backoff.delay(slot.consecutive_failures);
        slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
        delay
    }

    fn set_state(&self, idx: usize, state: RelayState) {
        self.inner.relays.write()[idx].state = state;
    }

    fn url(&self, idx: usize) -> String {
        self.inner.relays.read()[idx].endpoint.url.clone()
    }

    fn refresh_health(&self) -> HealthTier {
        let tier = self.health();
        let changed = {
            let mut last = self.inner.last_health.lock();
            let changed = *last != Some(tier);
            *last = Some(tier);
            changed
        };
        if changed {
            debug!(health = %tier, "relay health changed");
            let _ = self.inner.status_tx.send(TransportEvent::HealthChanged(tier));
        }
        tier
    }
}
