// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use pact_core::wallet::WalletResult;
use pact_core::{FeeRate, KeyHandle, MemoryStore, RootSecret, WalletBackend, WalletError};
use pact_net::{Coordinator, CoordinatorConfig, CoordinatorEvent, LocalIdentity, Transport};

use crate::config::Config;
use crate::error::{CliError, Result};
use crate::output::Output;

use super::group::read_group;
use super::runtime;

/// Wallet for a party that follows a group without holding keys.
pub(crate) struct WatchOnlyWallet;

#[async_trait]
impl WalletBackend for WatchOnlyWallet {
    async fn build_unsigned_transaction(
        &self,
        _destination: &str,
        _amount_sats: u64,
        _fee_rate: FeeRate,
        _descriptor: &str,
    ) -> WalletResult<Vec<u8>> {
        Err(WalletError::SigningRefused("watch-only wallet".into()))
    }

    async fn partial_sign(&self, _unsigned_tx: &[u8], _key: &KeyHandle) -> WalletResult<Vec<u8>> {
        Err(WalletError::SigningRefused("watch-only wallet".into()))
    }

    async fn combine(&self, _unsigned_tx: &[u8], _partial_sigs: &[Vec<u8>]) -> WalletResult<Vec<u8>> {
        Err(WalletError::SigningRefused("watch-only wallet".into()))
    }

    async fn broadcast(&self, _final_tx: &[u8]) -> WalletResult<String> {
        Err(WalletError::SigningRefused("watch-only wallet".into()))
    }

    async fn build_descriptor(&self, _threshold: u8, _xpubs: &[String]) -> WalletResult<String> {
        Err(WalletError::SigningRefused("watch-only wallet".into()))
    }
}

fn describe(event: &CoordinatorEvent) -> String {
    match event {
        CoordinatorEvent::ProposalChanged {
            proposal_id,
            status,
            signatures,
            required,
            txid,
            error,
            ..
        } => {
            let mut line = format!("proposal {proposal_id}: {status} ({signatures}/{required})");
            if let Some(txid) = txid {
                line.push_str(&format!(" txid {txid}"));
            }
            if let Some(error) = error {
                line.push_str(&format!(" error: {error}"));
            }
            line
        }
        CoordinatorEvent::Notification(n) => format!("notice from {}: {}", n.from_member, n.summary),
        CoordinatorEvent::MemberJoined { member_id, name, .. } => {
            format!("member joined: {name} ({member_id})")
        }
        CoordinatorEvent::KeyContributed { member_id, .. } => format!("key contributed by {member_id}"),
        CoordinatorEvent::DescriptorReady { descriptor, .. } => {
            format!("wallet descriptor ready: {descriptor}")
        }
        CoordinatorEvent::BalanceUpdated {
            balance_sats,
            goal_sats,
            ..
        } => match goal_sats {
            Some(goal) => format!("balance {balance_sats} sats, goal {goal} sats"),
            None => format!("balance {balance_sats} sats"),
        },
    }
}

#[tracing::instrument(skip(out, cfg, group_path), fields(group = %group_path.display()))]
pub fn cmd_watch(out: &Output, cfg: &Config, group_path: &Path) -> Result<()> {
    let group = read_group(group_path)?;
    let endpoints = cfg.endpoints()?;

    out.newline();
    out.header("Watching Custody Group");
    out.field("Name", &group.name);
    out.field("Id", &group.id);
    out.field(
        "Quorum",
        &format!("{}-of-{}", group.threshold, group.total_signers),
    );
    out.field("Relays", &endpoints.len().to_string());

    let rt = runtime()?;
    rt.block_on(async {
        let transport = Transport::new(endpoints, cfg.transport_config());
        let spinner = out.spinner("Connecting to relays...");
        let health = transport.connect().await;
        spinner.finish();
        if health.is_degraded() {
            out.warn(&format!("Relay health is {health}; events may be delayed"));
        }

        let identity = LocalIdentity::new(
            "observer",
            "Observer",
            Keys::generate(),
            KeyHandle::new("watch-only"),
            RootSecret::generate(),
        );
        let config = CoordinatorConfig {
            fee_rate: cfg.fee_rate(),
            ..CoordinatorConfig::default()
        };
        let coordinator = Arc::new(Coordinator::new(
            identity,
            transport,
            Arc::new(WatchOnlyWallet),
            Arc::new(MemoryStore::new()),
            config,
        )?);
        coordinator.add_group(group)?;

        let mut events = coordinator.subscribe();
        let runner = coordinator.clone();
        let run_task = tokio::spawn(async move { runner.run().await });

        out.info("Listening for group activity... (Ctrl+C to stop)");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        debug!(?event, "coordinator event");
                        out.info(&describe(&event));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event display fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        coordinator.shutdown();
        match run_task.await {
            Ok(result) => result?,
            Err(e) => return Err(CliError::Runtime(e.to_string())),
        }
        coordinator.transport().shutdown();
        Ok::<_, CliError>(())
    })?;

    out.success("Stopped watching");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pact_core::ProposalStatus;

    #[tokio::test]
    async fn test_watch_only_wallet_refuses() {
        let wallet = WatchOnlyWallet;
        let err = wallet
            .partial_sign(b"tx", &KeyHandle::new("any"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(wallet.broadcast(b"tx").await.is_err());
    }

    #[test]
    fn test_describe_proposal() {
        let line = describe(&CoordinatorEvent::ProposalChanged {
            group_id: "g".into(),
            proposal_id: "p1".into(),
            status: ProposalStatus::Broadcasted,
            signatures: 2,
            required: 2,
            txid: Some("abcd".into()),
            error: None,
        });
        assert!(line.starts_with("proposal p1:"));
        assert!(line.contains("(2/2)"));
        assert!(line.ends_with("txid abcd"));
    }
}
