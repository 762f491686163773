// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Opaque encrypted blob storage keyed by (group, data type).
//!
//! Stores never see plaintext: callers seal records before `put` and open
//! them after `get`. [`save_sealed`] and [`load_sealed`] do both steps.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::Path;

use bincode::Options;
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::crypto::{self, KeyContext, RootSecret, SealedEnvelope};
use crate::error::Result;

/// Data type for a group's proposal set, sealed under the group root.
pub const PROPOSALS: &str = "proposals";
/// Data type for the local party's group records, sealed under the personal root.
pub const GROUPS: &str = "groups";
/// Data type for the local party's signing ledger, sealed under the personal root.
pub const SIGNING_LOG: &str = "signing_log";
/// Data type for received direct notifications, sealed under the personal root.
pub const NOTIFICATIONS: &str = "notifications";
/// Group id used for records that belong to the local party rather than a group.
pub const LOCAL_SCOPE: &str = "local";

const MAX_RECORD_SIZE: u64 = 4 * 1024 * 1024;

const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sealed_blobs");

pub trait EncryptedStore: Send + Sync {
    fn put(&self, group_id: &str, data_type: &str, sealed: &[u8]) -> Result<()>;
    fn get(&self, group_id: &str, data_type: &str) -> Result<Option<Vec<u8>>>;
}

fn blob_key(group_id: &str, data_type: &str) -> String {
    format!("{group_id}/{data_type}")
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl EncryptedStore for MemoryStore {
    fn put(&self, group_id: &str, data_type: &str, sealed: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .insert(blob_key(group_id, data_type), sealed.to_vec());
        Ok(())
    }

    fn get(&self, group_id: &str, data_type: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(&blob_key(group_id, data_type)).cloned())
    }
}

/// Single-file store backed by redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;
        {
            let wtxn = db.begin_write()?;
            let _ = wtxn.open_table(BLOBS_TABLE)?;
            wtxn.commit()?;
        }
        debug!(path = %path.display(), "opened sealed blob store");
        Ok(Self { db })
    }
}

impl EncryptedStore for RedbStore {
    fn put(&self, group_id: &str, data_type: &str, sealed: &[u8]) -> Result<()> {
        let key = blob_key(group_id, data_type);
        let wtxn = self.db.begin_write()?;
        wtxn.open_table(BLOBS_TABLE)?.insert(key.as_str(), sealed)?;
        wtxn.commit()?;
        trace!(key = %key, len = sealed.len(), "stored sealed blob");
        Ok(())
    }

    fn get(&self, group_id: &str, data_type: &str) -> Result<Option<Vec<u8>>> {
        let key = blob_key(group_id, data_type);
        let rtxn = self.db.begin_read()?;
        let table = match rtxn.open_table(BLOBS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }
}

fn record_options() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_RECORD_SIZE)
}

/// Serializes `value`, seals it under `(root, context)` and writes it.
pub fn save_sealed<T: Serialize>(
    store: &dyn EncryptedStore,
    root: &RootSecret,
    context: KeyContext,
    group_id: &str,
    data_type: &str,
    value: &T,
) -> Result<()> {
    let plaintext = zeroize::Zeroizing::new(record_options().serialize(value)?);
    let envelope = crypto::seal_with(root, context, Some(data_type), &plaintext)?;
    store.put(group_id, data_type, &envelope.to_bytes())
}

/// Reads, opens and deserializes a record written by [`save_sealed`].
pub fn load_sealed<T: DeserializeOwned>(
    store: &dyn EncryptedStore,
    root: &RootSecret,
    context: KeyContext,
    group_id: &str,
    data_type: &str,
) -> Result<Option<T>> {
    let Some(bytes) = store.get(group_id, data_type)? else {
        return Ok(None);
    };
    let envelope = SealedEnvelope::from_bytes(&bytes)?;
    let plaintext = crypto::open_with(root, context, Some(data_type), &envelope)?;
    Ok(Some(record_options().deserialize(&plaintext)?))
}
