// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pact")]
#[command(about = "Shared bitcoin custody coordinated over Nostr relays")]
#[command(version)]
pub(crate) struct Cli {
    #[arg(short, long, global = true, help = "Config file (defaults to ~/.config/pact/config.toml)")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Connect to the configured relays and report their health
    Relays,
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Follow a custody group as a read-only observer
    Watch {
        #[arg(short, long)]
        group: PathBuf,
    },
}

#[derive(Subcommand)]
pub(crate) enum GroupCommands {
    /// Create a group record with a fresh group root and creator identity
    New {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        threshold: u8,
        #[arg(short, long)]
        signers: u8,
        #[arg(long, default_value = "creator")]
        member_name: String,
        #[arg(short, long, help = "Write the group record here instead of stdout")]
        out: Option<PathBuf>,
    },
}
