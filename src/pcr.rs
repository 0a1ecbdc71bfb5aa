// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Abstractions and logic for handling Platform Configuration Registers (PCRs).

use crate::{
    constant::{TPM_PCR_COUNT, TPM_PCR_SELECT_MIN},
    digest::DigestAccumulator,
    error::TpmError,
};
use tpm2_protocol::{
    data::{TpmAlgId, TpmlPcrSelection, TpmsPcrSelection},
    tpm_hash_size, TpmBuffer,
};

/// Represents the state of a single PCR register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcr {
    pub bank: TpmAlgId,
    pub index: u32,
    pub value: Vec<u8>,
}

/// Represents a user's selection of PCR indices for a specific bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    pub alg: TpmAlgId,
    pub indices: Vec<u32>,
}

/// Parses a hash algorithm name.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` for an unknown name.
pub fn alg_from_str(s: &str) -> Result<TpmAlgId, TpmError> {
    match s {
        "sha1" => Ok(TpmAlgId::Sha1),
        "sha256" => Ok(TpmAlgId::Sha256),
        "sha384" => Ok(TpmAlgId::Sha384),
        "sha512" => Ok(TpmAlgId::Sha512),
        _ => Err(TpmError::InvalidParameter(format!(
            "invalid hash algorithm: '{s}'"
        ))),
    }
}

/// Parses a PCR selection string (e.g., "sha256:0,7+sha1:1") into a vector of
/// `PcrSelection`.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` on a malformed selection.
pub fn pcr_selection_vec_from_str(selection_str: &str) -> Result<Vec<PcrSelection>, TpmError> {
    let mut selections = Vec::new();
    for bank_str in selection_str.split('+') {
        let (alg_str, indices_str) = bank_str.split_once(':').ok_or_else(|| {
            TpmError::InvalidParameter(format!("invalid bank format: '{bank_str}'"))
        })?;
        let alg = alg_from_str(alg_str)?;
        let indices: Vec<u32> = indices_str
            .split(',')
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e: std::num::ParseIntError| TpmError::InvalidParameter(e.to_string()))?;
        selections.push(PcrSelection { alg, indices });
    }
    Ok(selections)
}

/// Converts a vector of `PcrSelection` into the low-level `TpmlPcrSelection`
/// format.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` if an index is out of range or a bank
/// is listed twice.
pub fn pcr_selection_vec_to_tpml(selections: &[PcrSelection]) -> Result<TpmlPcrSelection, TpmError> {
    let mut list = TpmlPcrSelection::new();
    for selection in selections {
        if list.iter().any(|s| s.hash == selection.alg) {
            return Err(TpmError::InvalidParameter(format!(
                "duplicate PCR bank: {}",
                selection.alg
            )));
        }
        let mut pcr_select = vec![0u8; TPM_PCR_SELECT_MIN];
        for &index in &selection.indices {
            let index = usize::try_from(index)
                .ok()
                .filter(|&i| i < TPM_PCR_COUNT)
                .ok_or_else(|| {
                    TpmError::InvalidParameter(format!("PCR index out of range: {index}"))
                })?;
            pcr_select[index / 8] |= 1 << (index % 8);
        }
        list.try_push(TpmsPcrSelection {
            hash: selection.alg,
            pcr_select: TpmBuffer::try_from(pcr_select.as_slice())?,
        })?;
    }
    Ok(list)
}

/// Lists the selected (bank, index) pairs in the order the TPM reports them:
/// banks in list order, indices ascending.
#[must_use]
pub fn pcr_selected(tpml: &TpmlPcrSelection) -> Vec<(TpmAlgId, u32)> {
    let mut selected = Vec::new();
    for bank in tpml.iter() {
        for (byte_index, byte) in bank.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    if let Ok(index) = u32::try_from(byte_index * 8 + bit) {
                        selected.push((bank.hash, index));
                    }
                }
            }
        }
    }
    selected
}

/// Computes the composite digest of PCR values: the values are concatenated
/// in selection order and hashed once.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` if the number of values does not match
/// the selection, and `TpmError::UnsupportedAlgorithm` for an unsupported hash.
pub fn pcr_composite_digest(
    alg: TpmAlgId,
    selection: &TpmlPcrSelection,
    values: &[Vec<u8>],
) -> Result<Vec<u8>, TpmError> {
    let selected = pcr_selected(selection);
    if selected.len() != values.len() {
        return Err(TpmError::InvalidParameter(format!(
            "PCR selection has {} registers, got {} values",
            selected.len(),
            values.len()
        )));
    }
    for ((bank, index), value) in selected.iter().zip(values) {
        if tpm_hash_size(bank) != Some(value.len()) {
            return Err(TpmError::InvalidParameter(format!(
                "PCR {bank}:{index}: invalid value size {}",
                value.len()
            )));
        }
    }
    let mut acc = DigestAccumulator::new(alg)?;
    for value in values {
        acc.extend(value);
    }
    Ok(acc.finalize())
}
