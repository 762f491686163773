// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![allow(dead_code)]

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use pact_core::wallet::WalletResult;
use pact_core::{FeeRate, KeyHandle, WalletBackend, WalletError};
use pact_net::{
    Backoff, NetError, RelayConnector, RelayEndpoint, RelayLink, RelayPriority, TransportConfig,
};

struct HubClient {
    id: u64,
    to_client: mpsc::Sender<String>,
    subscriptions: HashMap<String, Vec<Value>>,
}

#[derive(Default)]
struct HubRelay {
    online: AtomicBool,
    events: Mutex<Vec<Value>>,
    clients: Mutex<Vec<HubClient>>,
    connections: AtomicU64,
}

/// In-process stand-in for a set of relays that can be taken on and offline.
#[derive(Default)]
pub struct MemoryRelayHub {
    relays: Mutex<HashMap<String, Arc<HubRelay>>>,
    next_client: AtomicU64,
}

impl MemoryRelayHub {
    pub fn new(urls: &[&str]) -> Arc<Self> {
        let hub = Arc::new(Self::default());
        for url in urls {
            hub.relay(url).online.store(true, Ordering::SeqCst);
        }
        hub
    }

    fn relay(&self, url: &str) -> Arc<HubRelay> {
        self.relays
            .lock()
            .entry(url.to_string())
            .or_default()
            .clone()
    }

    /// Going offline drops every open connection.
    pub fn set_online(&self, url: &str, online: bool) {
        let relay = self.relay(url);
        relay.online.store(online, Ordering::SeqCst);
        if !online {
            relay.clients.lock().clear();
        }
    }

    pub fn stored(&self, url: &str) -> usize {
        self.relay(url).events.lock().len()
    }

    pub fn connections(&self, url: &str) -> u64 {
        self.relay(url).connections.load(Ordering::SeqCst)
    }

    pub fn subscription_ids(&self, url: &str) -> Vec<String> {
        self.relay(url)
            .clients
            .lock()
            .iter()
            .flat_map(|c| c.subscriptions.keys().cloned())
            .collect()
    }

    fn handle_frame(relay: &HubRelay, client_id: u64, text: &str) {
        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) else {
            return;
        };
        match items.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let Some(event) = items.get(1).cloned() else {
                    return;
                };
                let id = event["id"].as_str().unwrap_or_default().to_string();
                relay.events.lock().push(event.clone());

                let clients = relay.clients.lock();
                for client in clients.iter() {
                    if client.id == client_id {
                        let _ = client.to_client.try_send(json!(["OK", id, true, ""]).to_string());
                    }
                    for (sub_id, filters) in &client.subscriptions {
                        if filters.iter().any(|f| matches_filter(f, &event)) {
                            let _ = client
                                .to_client
                                .try_send(json!(["EVENT", sub_id, event]).to_string());
                        }
                    }
                }
            }
            Some("REQ") => {
                let Some(sub_id) = items.get(1).and_then(Value::as_str) else {
                    return;
                };
                let filters: Vec<Value> = items[2..].to_vec();
                let stored: Vec<Value> = relay
                    .events
                    .lock()
                    .iter()
                    .filter(|e| filters.iter().any(|f| matches_filter(f, e)))
                    .cloned()
                    .collect();

                let mut clients = relay.clients.lock();
                let Some(client) = clients.iter_mut().find(|c| c.id == client_id) else {
                    return;
                };
                for event in stored {
                    let _ = client
                        .to_client
                        .try_send(json!(["EVENT", sub_id, event]).to_string());
                }
                let _ = client.to_client.try_send(json!(["EOSE", sub_id]).to_string());
                client.subscriptions.insert(sub_id.to_string(), filters);
            }
            Some("CLOSE") => {
                if let Some(sub_id) = items.get(1).and_then(Value::as_str) {
                    let mut clients = relay.clients.lock();
                    if let Some(client) = clients.iter_mut().find(|c| c.id == client_id) {
                        client.subscriptions.remove(sub_id);
                    }
                }
            }
            _ => {}
        }
    }
}

fn matches_filter(filter: &Value, event: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return false;
    };
    for (key, wanted) in filter {
        let Some(wanted) = wanted.as_array() else {
            continue;
        };
        let ok = match key.as_str() {
            "kinds" => wanted.contains(&event["kind"]),
            "authors" => wanted.contains(&event["pubkey"]),
            "ids" => wanted.contains(&event["id"]),
            tag if tag.starts_with('#') => {
                let name = &tag[1..];
                event["tags"].as_array().is_some_and(|tags| {
                    tags.iter().any(|t| {
                        t.get(0).and_then(Value::as_str) == Some(name)
                            && t.get(1).is_some_and(|v| wanted.contains(v))
                    })
                })
            }
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

#[async_trait]
impl RelayConnector for MemoryRelayHub {
    async fn connect(&self, url: &str) -> pact_net::Result<RelayLink> {
        let relay = self.relay(url);
        if !relay.online.load(Ordering::SeqCst) {
            return Err(NetError::Transport(format!("{url} is offline")));
        }
        relay.connections.fetch_add(1, Ordering::SeqCst);

        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (to_relay_tx, mut to_relay_rx) = mpsc::channel::<String>(1024);
        let (to_client_tx, to_client_rx) = mpsc::channel::<String>(1024);
        relay.clients.lock().push(HubClient {
            id,
            to_client: to_client_tx,
            subscriptions: HashMap::new(),
        });

        tokio::spawn(async move {
            while let Some(text) = to_relay_rx.recv().await {
                if !relay.online.load(Ordering::SeqCst) {
                    break;
                }
                MemoryRelayHub::handle_frame(&relay, id, &text);
            }
            relay.clients.lock().retain(|c| c.id != id);
        });

        Ok(RelayLink {
            outbound: to_relay_tx,
            inbound: to_client_rx,
        })
    }
}

pub fn endpoints(urls: &[&str]) -> Vec<RelayEndpoint> {
    urls.iter()
        .map(|u| RelayEndpoint::allow_internal(u, RelayPriority::High).unwrap())
        .collect()
}

pub fn fast_config() -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_secs(2),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
        ..TransportConfig::default()
    }
}

/// Deterministic wallet: every party derives the same transaction and txid.
#[derive(Default)]
pub struct FakeWallet {
    pub refuse_broadcast: AtomicBool,
    pub unavailable_broadcasts: AtomicU32,
    /// Milliseconds `partial_sign` and `broadcast` wait before answering.
    pub sign_delay_ms: AtomicU64,
    pub broadcast_delay_ms: AtomicU64,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
}

async fn pause(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl WalletBackend for FakeWallet {
    async fn build_unsigned_transaction(
        &self,
        destination: &str,
        amount_sats: u64,
        _fee_rate: FeeRate,
        descriptor: &str,
    ) -> WalletResult<Vec<u8>> {
        Ok(format!("psbt:{descriptor}:{destination}:{amount_sats}").into_bytes())
    }

    async fn partial_sign(&self, unsigned_tx: &[u8], key: &KeyHandle) -> WalletResult<Vec<u8>> {
        pause(&self.sign_delay_ms).await;
        let mut sig = format!("sig:{}:", key.as_str()).into_bytes();
        sig.extend_from_slice(&unsigned_tx[..unsigned_tx.len().min(8)]);
        Ok(sig)
    }

    async fn combine(&self, unsigned_tx: &[u8], partial_sigs: &[Vec<u8>]) -> WalletResult<Vec<u8>> {
        let mut tx = unsigned_tx.to_vec();
        for sig in partial_sigs {
            tx.push(b'|');
            tx.extend_from_slice(sig);
        }
        Ok(tx)
    }

    async fn broadcast(&self, final_tx: &[u8]) -> WalletResult<String> {
        pause(&self.broadcast_delay_ms).await;
        if self.refuse_broadcast.load(Ordering::SeqCst) {
            return Err(WalletError::Rejected("mempool rejected transaction".into()));
        }
        if self
            .unavailable_broadcasts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(WalletError::Unavailable("node unreachable".into()));
        }
        self.broadcasts.lock().push(final_tx.to_vec());
        Ok(txid_of(final_tx))
    }

    async fn build_descriptor(&self, threshold: u8, xpubs: &[String]) -> WalletResult<String> {
        Ok(format!("wsh(sortedmulti({threshold},{}))", xpubs.join(",")))
    }
}

pub fn txid_of(tx: &[u8]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tx.hash(&mut hasher);
    format!("{:016x}", hasher.finish()).repeat(4)
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
