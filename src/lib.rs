// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod cli;
pub mod command;
pub mod constant;
pub mod context;
pub mod crypto;
pub mod device;
pub mod digest;
pub mod error;
pub mod mocktpm;
pub mod parser;
pub mod pcr;
pub mod policy;
pub mod resource;
pub mod session;
pub mod transport;
pub mod util;

pub use cli::execute_cli;
pub use command::{Authorization, Tpm};
pub use error::TpmError;
