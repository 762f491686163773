// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::protocol::PactMessage;

/// An authenticated message whose proposal has not arrived yet.
pub(crate) struct Orphan {
    pub group_id: String,
    pub sender: [u8; 32],
    pub message: PactMessage,
    received_at: Instant,
}

pub(crate) struct OrphanBuffer {
    entries: VecDeque<Orphan>,
    limit: usize,
    ttl: Duration,
}

impl OrphanBuffer {
    pub fn new(limit: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            ttl,
        }
    }

    pub fn push(&mut self, group_id: &str, sender: [u8; 32], message: PactMessage) {
        self.expire();
        if self.entries.len() >= self.limit {
            if let Some(dropped) = self.entries.pop_front() {
                warn!(
                    msg_type = dropped.message.message_type(),
                    "orphan buffer full; dropped oldest message"
                );
            }
        }
        self.entries.push_back(Orphan {
            group_id: group_id.to_string(),
            sender,
            message,
            received_at: Instant::now(),
        });
    }

    /// Removes and returns every buffered message for `proposal_id`, oldest first.
    pub fn take(&mut self, proposal_id: &str) -> Vec<Orphan> {
        self.expire();
        let (matching, rest): (VecDeque<Orphan>, VecDeque<Orphan>) = self
            .entries
            .drain(..)
            .partition(|o| o.message.proposal_id() == Some(proposal_id));
        self.entries = rest;
        matching.into()
    }

    /// Drops expired entries and returns how many were removed.
    pub fn expire(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|o| o.received_at.elapsed() < ttl);
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
