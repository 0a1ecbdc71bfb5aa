// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Running hash state over a selected TPM hash algorithm.

use crate::error::TpmError;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tpm2_protocol::data::TpmAlgId;

#[derive(Clone)]
enum HashState {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl HashState {
    fn new(alg: TpmAlgId) -> Option<Self> {
        match alg {
            TpmAlgId::Sha1 => Some(Self::Sha1(Sha1::new())),
            TpmAlgId::Sha256 => Some(Self::Sha256(Sha256::new())),
            TpmAlgId::Sha384 => Some(Self::Sha384(Sha384::new())),
            TpmAlgId::Sha512 => Some(Self::Sha512(Sha512::new())),
            _ => None,
        }
    }
}

/// An incremental digest. No intermediate value is materialized until
/// `finalize`.
#[derive(Clone)]
pub struct DigestAccumulator {
    alg: TpmAlgId,
    state: HashState,
}

impl std::fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl DigestAccumulator {
    /// Creates an accumulator.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::UnsupportedAlgorithm` if `alg` is not a supported
    /// hash algorithm.
    pub fn new(alg: TpmAlgId) -> Result<Self, TpmError> {
        let state = HashState::new(alg).ok_or(TpmError::UnsupportedAlgorithm(alg))?;
        Ok(Self { alg, state })
    }

    #[must_use]
    pub fn algorithm(&self) -> TpmAlgId {
        self.alg
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self.state {
            HashState::Sha1(_) => 20,
            HashState::Sha256(_) => 32,
            HashState::Sha384(_) => 48,
            HashState::Sha512(_) => 64,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        match &mut self.state {
            HashState::Sha1(h) => h.update(bytes),
            HashState::Sha256(h) => h.update(bytes),
            HashState::Sha384(h) => h.update(bytes),
            HashState::Sha512(h) => h.update(bytes),
        }
    }

    /// Consumes the accumulator and returns the digest.
    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        match self.state {
            HashState::Sha1(h) => h.finalize().to_vec(),
            HashState::Sha256(h) => h.finalize().to_vec(),
            HashState::Sha384(h) => h.finalize().to_vec(),
            HashState::Sha512(h) => h.finalize().to_vec(),
        }
    }

    /// Discards everything extended so far.
    pub fn reset(&mut self) {
        match &mut self.state {
            HashState::Sha1(h) => Digest::reset(h),
            HashState::Sha256(h) => Digest::reset(h),
            HashState::Sha384(h) => Digest::reset(h),
            HashState::Sha512(h) => Digest::reset(h),
        }
    }
}

/// Returns true if the algorithm can back a `DigestAccumulator`.
#[must_use]
pub fn is_hash_supported(alg: TpmAlgId) -> bool {
    HashState::new(alg).is_some()
}

/// Computes `H(parts[0] || parts[1] || ...)`.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` if `alg` is not a supported hash.
pub fn hash_parts(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>, TpmError> {
    let mut acc = DigestAccumulator::new(alg)?;
    for part in parts {
        acc.extend(part);
    }
    Ok(acc.finalize())
}
