// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Relay wire frames (NIP-01 JSON arrays).

#![forbid(unsafe_code)]

use std::borrow::Cow;

use nostr_sdk::prelude::*;

use crate::error::{NetError, Result};

fn encode(msg: &ClientMessage<'_>) -> Result<String> {
    msg.try_as_json()
        .map_err(|e| NetError::Protocol(format!("failed to encode client message: {e}")))
}

pub fn event_frame(event: &Event) -> Result<String> {
    encode(&ClientMessage::Event(Cow::Borrowed(event)))
}

/// One filter goes out as a plain `REQ`; several use the multi-filter form.
pub fn req_frame(subscription_id: &str, filters: &[Filter]) -> Result<String> {
    let subscription_id = Cow::Owned(SubscriptionId::new(subscription_id));
    let msg = match filters {
        [filter] => ClientMessage::Req {
            subscription_id,
            filter: Cow::Borrowed(filter),
        },
        _ => ClientMessage::ReqMultiFilter {
            subscription_id,
            filters: filters.to_vec(),
        },
    };
    encode(&msg)
}

pub fn close_frame(subscription_id: &str) -> Result<String> {
    encode(&ClientMessage::close(SubscriptionId::new(subscription_id)))
}

/// Parses a relay frame. Event signatures are not checked here.
pub fn parse_relay_message(text: &str) -> Result<RelayMessage<'static>> {
    RelayMessage::from_json(text)
        .map_err(|e| NetError::Protocol(format!("malformed relay message: {e}")))
}
