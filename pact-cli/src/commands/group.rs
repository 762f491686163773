// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;

use nostr_sdk::prelude::*;
use tracing::{debug, info};

use pact_core::{CustodyGroup, Member, Role, RootSecret};

use crate::error::{CliError, Result};
use crate::output::Output;

use super::expand_path;

const MAX_GROUP_FILE_SIZE: u64 = 256 * 1024;

/// Member ids are the first eight bytes of the relay key, hex encoded.
pub(crate) fn member_id_for(keys: &Keys) -> String {
    hex::encode(&keys.public_key().to_bytes()[..8])
}

pub(crate) fn new_group(
    name: &str,
    threshold: u8,
    signers: u8,
    member_name: &str,
) -> Result<(CustodyGroup, Keys)> {
    let keys = Keys::generate();
    let creator = Member::new(
        &member_id_for(&keys),
        member_name,
        keys.public_key().to_bytes(),
        Role::Creator,
    );
    let group = CustodyGroup::new(
        &uuid::Uuid::new_v4().to_string(),
        name,
        threshold,
        signers,
        creator,
        RootSecret::generate(),
    )?;
    Ok((group, keys))
}

pub(crate) fn encode_group(group: &CustodyGroup) -> Result<String> {
    toml::to_string_pretty(group).map_err(|e| CliError::GroupFile(e.to_string()))
}

pub(crate) fn read_group(path: &Path) -> Result<CustodyGroup> {
    let path = expand_path(path);
    let metadata = std::fs::metadata(&path)?;
    if metadata.len() > MAX_GROUP_FILE_SIZE {
        return Err(CliError::GroupFile("group file too large".into()));
    }
    let content = std::fs::read_to_string(&path)?;
    let group: CustodyGroup =
        toml::from_str(&content).map_err(|e| CliError::GroupFile(e.to_string()))?;
    if group.members.is_empty() {
        return Err(CliError::GroupFile("group has no members".into()));
    }
    Ok(group)
}

#[tracing::instrument(skip(out))]
pub fn cmd_group_new(
    out: &Output,
    name: &str,
    threshold: u8,
    signers: u8,
    member_name: &str,
    dest: Option<&Path>,
) -> Result<()> {
    let (group, keys) = new_group(name, threshold, signers, member_name)?;
    let encoded = encode_group(&group)?;
    debug!(group_id = %group.id, threshold, signers, "group created");

    match dest {
        Some(path) => {
            let path = expand_path(path);
            std::fs::write(&path, &encoded)?;
            info!(path = %path.display(), "group record written");
            out.success(&format!("Group record written to {}", path.display()));
        }
        None => println!("{encoded}"),
    }

    out.header("Custody Group");
    out.field("Name", &group.name);
    out.field("Id", &group.id);
    out.field("Quorum", &format!("{threshold}-of-{signers}"));
    out.field("Creator", &format!("{} ({})", member_name, member_id_for(&keys)));
    out.key_field("Relay public key", &keys.public_key().to_hex());
    out.key_field("Relay secret key", &keys.secret_key().to_secret_hex());
    out.newline();
    out.warn("The group record holds the group root. Share it only with members.");
    out.warn("Store the relay secret key offline; it authenticates you to the group.");
    Ok(())
}
