// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use tracing::debug;

use pact_net::{RelayState, Transport};

use crate::config::Config;
use crate::error::Result;
use crate::output::Output;

use super::runtime;

#[tracing::instrument(skip(out, cfg))]
pub fn cmd_relays(out: &Output, cfg: &Config) -> Result<()> {
    let endpoints = cfg.endpoints()?;
    debug!(relays = endpoints.len(), "checking relays");

    let rt = runtime()?;
    rt.block_on(async {
        let transport = Transport::new(endpoints, cfg.transport_config());

        let spinner = out.spinner("Connecting to relays...");
        let health = transport.connect().await;
        spinner.finish();

        out.header("Relay Health");
        out.field(
            "Connected",
            &format!("{}/{}", transport.connected_count(), transport.relay_status().len()),
        );
        if health.is_degraded() {
            out.warn(&format!("Health: {health}"));
        } else {
            out.success(&format!("Health: {health}"));
        }

        out.table_header(&[
            ("URL", 34),
            ("PRIORITY", 9),
            ("STATE", 13),
            ("FAILURES", 9),
            ("QUEUED", 6),
        ]);
        for status in transport.relay_status() {
            let failures = status.consecutive_failures.to_string();
            let queued = status.queued.to_string();
            let state = status.state.to_string();
            let priority = status.priority.to_string();
            out.table_row(&[
                (&status.url, 34, false),
                (&priority, 9, false),
                (&state, 13, status.state != RelayState::Connected),
                (&failures, 9, status.consecutive_failures > 0),
                (&queued, 6, false),
            ]);
        }
        out.newline();

        transport.shutdown();
    });
    Ok(())
}
