// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;

use pact_core::PactError;
use pact_net::NetError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not determine the user config directory")]
    HomeNotFound,

    #[error("Invalid group file: {0}")]
    GroupFile(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Core(#[from] PactError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
