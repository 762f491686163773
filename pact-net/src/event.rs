// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use nostr_sdk::prelude::*;

use pact_core::crypto::{self, SealedEnvelope};
use pact_core::CustodyGroup;

use crate::error::{NetError, Result};
use crate::protocol::*;

pub(crate) const TIMESTAMP_TWEAK_RANGE: std::ops::Range<u64> = 0..5;

pub struct PactEventBuilder;

impl PactEventBuilder {
    /// Seals `msg` under the group root and tags it with the group's opaque topic.
    pub fn group_message(keys: &Keys, group: &CustodyGroup, msg: &PactMessage) -> Result<Event> {
        msg.validate().map_err(|e| NetError::Protocol(e.into()))?;
        if msg.group_id() != group.id {
            return Err(NetError::Protocol("message belongs to another group".into()));
        }
        let context = msg
            .context()
            .ok_or_else(|| NetError::Protocol(format!("{} is not a group message", msg.message_type())))?;

        let content = msg.to_json()?;
        let envelope = crypto::seal_with(
            &group.root_secret,
            context,
            msg.subject(),
            content.as_bytes(),
        )?;
        let topic = crypto::group_topic(&group.root_secret)?;

        let mut builder = EventBuilder::new(Kind::Custom(PACT_EVENT_KIND), envelope.to_base64())
            .custom_created_at(Timestamp::tweaked(TIMESTAMP_TWEAK_RANGE))
            .tag(Tag::custom(TagKind::custom("g"), [topic]))
            .tag(Tag::custom(TagKind::custom("t"), [msg.message_type()]));

        if let Some(subject) = msg.subject() {
            builder = builder.tag(Tag::custom(TagKind::custom("s"), [subject]));
        }

        builder
            .sign_with_keys(keys)
            .map_err(|e| NetError::Nostr(e.to_string()))
    }

    /// NIP-44 encrypted notification addressed to one member's relay key.
    pub fn direct_notification(
        keys: &Keys,
        recipient: &PublicKey,
        payload: NotificationPayload,
    ) -> Result<Event> {
        let msg = PactMessage::Notification(payload);
        msg.validate().map_err(|e| NetError::Protocol(e.into()))?;
        let content = msg.to_json()?;

        let encrypted = nip44::encrypt(keys.secret_key(), recipient, &content, nip44::Version::V2)
            .map_err(|e| NetError::Crypto(e.to_string()))?;

        EventBuilder::new(Kind::Custom(PACT_EVENT_KIND), encrypted)
            .custom_created_at(Timestamp::tweaked(TIMESTAMP_TWEAK_RANGE))
            .tag(Tag::public_key(*recipient))
            .tag(Tag::custom(TagKind::custom("t"), ["notification"]))
            .sign_with_keys(keys)
            .map_err(|e| NetError::Nostr(e.to_string()))
    }

    /// Opens a group message. Fails closed on any mismatch between tags, key and payload.
    pub fn open_group_message(group: &CustodyGroup, event: &Event) -> Result<PactMessage> {
        const MAX_SEALED_CONTENT_SIZE: usize = MAX_MESSAGE_SIZE * 2;
        if event.content.len() > MAX_SEALED_CONTENT_SIZE {
            return Err(NetError::Protocol("content exceeds maximum size".into()));
        }

        let message_type = Self::get_message_type(event)
            .ok_or_else(|| NetError::Protocol("missing message type tag".into()))?;
        let context = PactMessage::context_for(&message_type)
            .ok_or_else(|| NetError::Protocol(format!("{message_type} is not a group message")))?;
        let subject = Self::get_subject(event);

        let envelope = SealedEnvelope::from_base64(&event.content)?;
        let plaintext =
            crypto::open_with(&group.root_secret, context, subject.as_deref(), &envelope)?;
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::Protocol("decrypted content exceeds maximum size".into()));
        }

        let json = std::str::from_utf8(&plaintext)
            .map_err(|_| NetError::Protocol("payload is not UTF-8".into()))?;
        let msg = PactMessage::from_json(json)?;

        if msg.message_type() != message_type {
            return Err(NetError::Protocol(format!(
                "tag says {message_type}, payload is {}",
                msg.message_type()
            )));
        }
        if msg.subject() != subject.as_deref() {
            return Err(NetError::Protocol("subject tag does not match payload".into()));
        }
        if msg.group_id() != group.id {
            return Err(NetError::Protocol("payload names another group".into()));
        }
        msg.validate().map_err(|e| NetError::Protocol(e.into()))?;
        Ok(msg)
    }

    pub fn open_notification(keys: &Keys, event: &Event) -> Result<NotificationPayload> {
        const MAX_ENCRYPTED_CONTENT_SIZE: usize = MAX_MESSAGE_SIZE * 2;
        if event.content.len() > MAX_ENCRYPTED_CONTENT_SIZE {
            return Err(NetError::Protocol("content exceeds maximum size".into()));
        }
        if !Self::is_addressed_to(event, &keys.public_key()) {
            return Err(NetError::Protocol("notification is not addressed to us".into()));
        }

        let content = nip44::decrypt(keys.secret_key(), &event.pubkey, &event.content)
            .map_err(|e| NetError::Crypto(format!("Decryption failed: {e}")))?;
        if content.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::Protocol("decrypted content exceeds maximum size".into()));
        }

        match PactMessage::from_json(&content)? {
            PactMessage::Notification(payload) => {
                PactMessage::Notification(payload.clone())
                    .validate()
                    .map_err(|e| NetError::Protocol(e.into()))?;
                Ok(payload)
            }
            other => Err(NetError::Protocol(format!(
                "expected notification, got {}",
                other.message_type()
            ))),
        }
    }

    pub fn is_addressed_to(event: &Event, pubkey: &PublicKey) -> bool {
        let hex = pubkey.to_hex();
        event.tags.iter().any(|t| {
            let parts = t.as_slice();
            parts.first().map(String::as_str) == Some("p") && parts.get(1) == Some(&hex)
        })
    }

    pub fn get_message_type(event: &Event) -> Option<String> {
        Self::tag_value(event, "t")
    }

    pub fn get_group_topic(event: &Event) -> Option<String> {
        Self::tag_value(event, "g")
    }

    pub fn get_subject(event: &Event) -> Option<String> {
        Self::tag_value(event, "s")
    }

    fn tag_value(event: &Event, name: &str) -> Option<String> {
        event
            .tags
            .find(TagKind::custom(name))
            .and_then(|t| t.as_slice().get(1).map(|s| s.to_string()))
    }
}
