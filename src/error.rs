// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use std::{io::Error as IoError, num::ParseIntError};
use thiserror::Error;
use tpm2_protocol::{
    data::{TpmAlgId, TpmCc, TpmRc},
    TpmErrorKind,
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{0}")]
    Custom(String),
    #[error("hex decoding failed: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("integer parsing failed: {0}")]
    Int(#[from] ParseIntError),
}

#[derive(Debug, Error)]
pub enum TpmError {
    /// Input bytes could not be unpacked into the expected structure.
    #[error("malformed: {0}")]
    Malformed(String),

    /// A checksum or a cross-field consistency check failed.
    #[error("integrity: {0}")]
    Integrity(String),

    /// The caller supplied arguments outside of the contract.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(TpmAlgId),

    /// The TPM answered with an error or a warning.
    #[error("{0}")]
    TpmRc(TpmRc),

    #[error("TPM unexpected: {0}")]
    UnexpectedResponse(String),

    #[error("response mismatch: {0}")]
    ResponseMismatch(TpmCc),

    #[error("marshal: {0}")]
    Marshal(TpmErrorKind),

    #[error("transport: {0}")]
    Transport(String),

    #[error("'{0}': {1}")]
    File(String, #[source] IoError),

    #[error("I/O: {0}")]
    Io(#[from] IoError),

    #[error("Parser: {0}")]
    Parse(#[from] ParseError),

    #[error("response underflow")]
    ResponseUnderflow,

    #[error("response overflow")]
    ResponseOverflow,
}

impl From<TpmErrorKind> for TpmError {
    fn from(err: TpmErrorKind) -> Self {
        TpmError::Marshal(err)
    }
}

impl From<TpmRc> for TpmError {
    fn from(rc: TpmRc) -> Self {
        TpmError::TpmRc(rc)
    }
}

impl TpmError {
    /// Returns true if the TPM reported a warning, i.e. the command was not
    /// executed but might succeed if issued again.
    #[must_use]
    pub fn is_tpm_warning(&self) -> bool {
        matches!(self, Self::TpmRc(rc) if rc.is_warning())
    }
}
