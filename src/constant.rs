// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

pub const TPM_HEADER_SIZE: usize = 10;

/// Size of `TPMU_HA`, the upper bound of digests and nonces.
pub const TPM_MAX_DIGEST_SIZE: usize = 64;

pub const TPM_PCR_SELECT_MIN: usize = 3;
pub const TPM_PCR_COUNT: usize = 24;

pub const TPM_RH_HMAC_SESSION_FIRST: u32 = 0x0200_0000;
pub const TPM_RH_POLICY_SESSION_FIRST: u32 = 0x0300_0000;

pub const TPM_HANDLE_TYPE_SHIFT: u32 = 24;
pub const TPM_HANDLE_INDEX_MASK: u32 = 0x00ff_ffff;

/// Maximum number of branches accepted by `TPM2_PolicyOR`.
pub const TPM_POLICY_OR_MAX: usize = 8;

pub const KDF_LABEL_SESSION_KEY: &str = "ATH";
pub const KDF_LABEL_CFB: &str = "CFB";
pub const KDF_LABEL_XOR: &str = "XOR";
