// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod cli;
mod commands;
mod config;
mod error;
mod output;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::cli::*;
use crate::config::{Config, LogLevel};
use crate::error::Result;
use crate::output::Output;

/// `RUST_LOG` wins; the config file level applies otherwise.
fn init_logging(level: LogLevel) {
    let use_json = std::env::var("PACT_LOG_JSON").is_ok();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let out = Output::new();
    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            out.error(&e.to_string());
            std::process::exit(2);
        }
    };
    init_logging(cfg.log_level);
    pact_net::install_default_crypto_provider();

    if let Err(e) = run(&out, &cfg, cli.command) {
        out.error(&e.to_string());
        std::process::exit(1);
    }
}

fn run(out: &Output, cfg: &Config, command: Commands) -> Result<()> {
    debug!(relays = cfg.relays.len(), "starting command");
    match command {
        Commands::Relays => commands::relays::cmd_relays(out, cfg),
        Commands::Group { command } => match command {
            GroupCommands::New {
                name,
                threshold,
                signers,
                member_name,
                out: dest,
            } => commands::group::cmd_group_new(
                out,
                &name,
                threshold,
                signers,
                &member_name,
                dest.as_deref(),
            ),
        },
        Commands::Watch { group } => commands::watch::cmd_watch(out, cfg, &group),
    }
}
