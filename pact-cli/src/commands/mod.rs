// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod group;
pub mod relays;
pub mod watch;

use std::path::{Path, PathBuf};

use crate::error::{CliError, Result};

/// Expands a leading `~` the shell left alone, e.g. inside quotes.
pub(crate) fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| CliError::Runtime(e.to_string()))
}
