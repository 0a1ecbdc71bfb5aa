// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Host-side state and cryptography of authorization sessions.

use crate::{
    constant::{KDF_LABEL_CFB, KDF_LABEL_SESSION_KEY},
    crypto::{crypto_aes_cfb, crypto_hmac, crypto_hmac_verify, crypto_kdfa, crypto_xor_obfuscate},
    digest::{hash_parts, is_hash_supported},
    error::TpmError,
};
use log::{debug, error};
use rand::{thread_rng, RngCore};
use tpm2_protocol::{
    data::{
        Tpm2bAuth, Tpm2bNonce, TpmAlgId, TpmCc, TpmRh, TpmSe, TpmSt, TpmaSession,
        TpmsAuthCommand, TpmsAuthResponse, TpmtSymDefObject, TpmtTkAuth, TpmuSymKeyBits,
        TpmuSymMode,
    },
    tpm_hash_size, TpmSession,
};

/// How a policy session proves knowledge of the authorized entity's
/// authorization value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyHmacType {
    NoAuth = 0,
    Auth = 1,
    Password = 2,
}

impl TryFrom<u8> for PolicyHmacType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoAuth),
            1 => Ok(Self::Auth),
            2 => Ok(Self::Password),
            other => Err(other),
        }
    }
}

impl From<PolicyHmacType> for u8 {
    fn from(value: PolicyHmacType) -> Self {
        value as u8
    }
}

/// The largest valid `PolicyHmacType` value.
pub const POLICY_HMAC_TYPE_MAX: u8 = 2;

/// Parameter encryption of a session. Every value is a canonical symmetric
/// definition: a null cipher carries no key size or mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionCipher {
    #[default]
    Null,
    /// XOR obfuscation keyed with the given hash.
    Xor(TpmAlgId),
    /// AES in CFB mode.
    Aes { key_bits: u16 },
}

impl SessionCipher {
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` for an AES key size other than
    /// 128, 192 or 256 bits, and `TpmError::UnsupportedAlgorithm` for an XOR
    /// hash without a digest implementation.
    pub fn validate(self) -> Result<Self, TpmError> {
        match self {
            Self::Null => Ok(self),
            Self::Xor(hash_alg) if is_hash_supported(hash_alg) => Ok(self),
            Self::Xor(hash_alg) => Err(TpmError::UnsupportedAlgorithm(hash_alg)),
            Self::Aes { key_bits: 128 | 192 | 256 } => Ok(self),
            Self::Aes { key_bits } => Err(TpmError::InvalidParameter(format!(
                "invalid AES key size: {key_bits}"
            ))),
        }
    }

    /// Converts a wire symmetric definition. Any key size or mode attached to
    /// the null algorithm is dropped, as is the mode of an XOR definition.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` for a cipher or mode that cannot
    /// protect session parameters.
    pub fn from_sym_def(symmetric: &TpmtSymDefObject) -> Result<Self, TpmError> {
        let cipher = match (symmetric.algorithm, &symmetric.key_bits, &symmetric.mode) {
            (TpmAlgId::Null, _, _) => Self::Null,
            (TpmAlgId::Xor, TpmuSymKeyBits::Xor(hash_alg), _) => Self::Xor(*hash_alg),
            (TpmAlgId::Aes, TpmuSymKeyBits::Aes(key_bits), TpmuSymMode::Aes(TpmAlgId::Cfb)) => {
                Self::Aes {
                    key_bits: *key_bits,
                }
            }
            (alg, _, _) => {
                return Err(TpmError::InvalidParameter(format!(
                    "parameter encryption not available: {alg:?}"
                )))
            }
        };
        cipher.validate()
    }

    #[must_use]
    pub fn to_sym_def(self) -> TpmtSymDefObject {
        match self {
            Self::Null => TpmtSymDefObject {
                algorithm: TpmAlgId::Null,
                key_bits: TpmuSymKeyBits::Null,
                mode: TpmuSymMode::Null,
            },
            Self::Xor(hash_alg) => TpmtSymDefObject {
                algorithm: TpmAlgId::Xor,
                key_bits: TpmuSymKeyBits::Xor(hash_alg),
                mode: TpmuSymMode::Null,
            },
            Self::Aes { key_bits } => TpmtSymDefObject {
                algorithm: TpmAlgId::Aes,
                key_bits: TpmuSymKeyBits::Aes(key_bits),
                mode: TpmuSymMode::Aes(TpmAlgId::Cfb),
            },
        }
    }

    /// Returns `(algorithm, keyBits, mode)` as stored in a saved context.
    #[must_use]
    pub fn to_raw(self) -> (u16, u16, u16) {
        let null = TpmAlgId::Null as u16;
        match self {
            Self::Null => (null, 0, null),
            Self::Xor(hash_alg) => (TpmAlgId::Xor as u16, hash_alg as u16, null),
            Self::Aes { key_bits } => (TpmAlgId::Aes as u16, key_bits, TpmAlgId::Cfb as u16),
        }
    }

    /// Parses the stored `(algorithm, keyBits, mode)` triple. Only canonical
    /// triples, as written by `to_raw`, are accepted.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Integrity` naming the offending field.
    pub fn from_raw(algorithm: u16, key_bits: u16, mode: u16) -> Result<Self, TpmError> {
        let invalid_alg = || TpmError::Integrity("invalid symmetric algorithm".to_string());
        let invalid_mode = || TpmError::Integrity("invalid symmetric mode".to_string());
        let algorithm = TpmAlgId::try_from(algorithm).map_err(|_| invalid_alg())?;
        let cipher = match algorithm {
            TpmAlgId::Null => Self::Null,
            TpmAlgId::Xor => {
                Self::Xor(TpmAlgId::try_from(key_bits).map_err(|_| invalid_alg())?)
            }
            TpmAlgId::Aes => Self::Aes { key_bits },
            _ => return Err(invalid_alg()),
        };
        let cipher = cipher.validate().map_err(|_| invalid_alg())?;
        if cipher.to_raw() != (algorithm as u16, key_bits, mode) {
            return Err(invalid_mode());
        }
        Ok(cipher)
    }
}

/// Host-side state of a TPM session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub handle: u32,
    /// False while the session is saved out of the TPM.
    pub usable: bool,
    pub is_audit: bool,
    pub is_exclusive: bool,
    pub hash_alg: TpmAlgId,
    pub session_type: TpmSe,
    pub policy_hmac_type: PolicyHmacType,
    pub is_bound: bool,
    pub bound_entity: Vec<u8>,
    pub session_key: Vec<u8>,
    pub nonce_caller: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    pub symmetric: SessionCipher,
}

impl SessionContext {
    /// Creates the state for a session the TPM has just started.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash and
    /// `TpmError::InvalidParameter` if a nonce has the wrong size or the
    /// cipher is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: u32,
        session_type: TpmSe,
        hash_alg: TpmAlgId,
        symmetric: SessionCipher,
        nonce_caller: Vec<u8>,
        nonce_tpm: Vec<u8>,
        bind: Option<(&[u8], &[u8])>,
        salt: &[u8],
    ) -> Result<Self, TpmError> {
        let size = tpm_hash_size(&hash_alg)
            .filter(|_| is_hash_supported(hash_alg))
            .ok_or(TpmError::UnsupportedAlgorithm(hash_alg))?;
        let symmetric = symmetric.validate()?;
        if nonce_caller.len() != size || nonce_tpm.len() != size {
            return Err(TpmError::InvalidParameter(format!(
                "session nonces must be {size} bytes"
            )));
        }
        let (bound_entity, bind_auth) = match bind {
            Some((name, auth)) => (name.to_vec(), auth),
            None => (Vec::new(), &[][..]),
        };
        let session_key = derive_session_key(hash_alg, bind_auth, salt, &nonce_tpm, &nonce_caller)?;
        Ok(Self {
            handle,
            usable: true,
            is_audit: false,
            is_exclusive: false,
            hash_alg,
            session_type,
            policy_hmac_type: PolicyHmacType::NoAuth,
            is_bound: !bound_entity.is_empty(),
            bound_entity,
            session_key,
            nonce_caller,
            nonce_tpm,
            symmetric,
        })
    }

    #[must_use]
    pub fn digest_size(&self) -> usize {
        self.nonce_caller.len()
    }

    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the session is saved.
    pub fn ensure_usable(&self) -> Result<(), TpmError> {
        if self.usable {
            Ok(())
        } else {
            Err(TpmError::InvalidParameter(format!(
                "session 0x{:08x} is saved and cannot be used",
                self.handle
            )))
        }
    }

    /// Replaces the caller nonce with fresh random bytes.
    pub fn roll_nonce_caller(&mut self) {
        let mut nonce = vec![0u8; self.digest_size()];
        thread_rng().fill_bytes(&mut nonce);
        self.nonce_caller = nonce;
    }

    /// Stores the nonce returned by the TPM.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::UnexpectedResponse` if the nonce has the wrong size.
    pub fn update_nonce_tpm(&mut self, nonce: &[u8]) -> Result<(), TpmError> {
        if nonce.len() != self.digest_size() {
            return Err(TpmError::UnexpectedResponse(format!(
                "TPM nonce of {} bytes",
                nonce.len()
            )));
        }
        self.nonce_tpm = nonce.to_vec();
        Ok(())
    }

    fn hmac_key(&self, entity_name: Option<&[u8]>, auth_value: &[u8]) -> Vec<u8> {
        let include_auth = match self.session_type {
            TpmSe::Policy => self.policy_hmac_type == PolicyHmacType::Auth,
            TpmSe::Hmac => match entity_name {
                Some(name) => !(self.is_bound && self.bound_entity == name),
                None => false,
            },
            TpmSe::Trial => false,
        };
        let mut key = self.session_key.clone();
        if include_auth {
            key.extend_from_slice(auth_value);
        }
        key
    }

    /// Builds the authorization area entry for a command. A fresh caller
    /// nonce is generated first.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the session is not usable or is
    /// a trial session.
    pub fn command_auth(
        &mut self,
        cp_hash: &[u8],
        entity_name: Option<&[u8]>,
        auth_value: &[u8],
        attributes: TpmaSession,
    ) -> Result<TpmsAuthCommand, TpmError> {
        self.ensure_usable()?;
        if self.session_type == TpmSe::Trial {
            return Err(TpmError::InvalidParameter(
                "trial session cannot authorize".to_string(),
            ));
        }
        self.roll_nonce_caller();

        let hmac = if self.policy_hmac_type == PolicyHmacType::Password {
            auth_value.to_vec()
        } else {
            let key = self.hmac_key(entity_name, auth_value);
            crypto_hmac(
                self.hash_alg,
                &key,
                &[
                    cp_hash,
                    &self.nonce_caller,
                    &self.nonce_tpm,
                    &[attributes.bits()],
                ],
            )?
        };
        debug!(
            "session 0x{:08x}: command auth with attributes 0x{:02x}",
            self.handle,
            attributes.bits()
        );
        Ok(TpmsAuthCommand {
            session_handle: TpmSession(self.handle),
            nonce: Tpm2bNonce::try_from(self.nonce_caller.as_slice())?,
            session_attributes: attributes,
            hmac: Tpm2bAuth::try_from(hmac.as_slice())?,
        })
    }

    /// Stores the new TPM nonce and verifies the response HMAC.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Integrity` if the HMAC does not match.
    pub fn response_auth(
        &mut self,
        rp_hash: &[u8],
        response: &TpmsAuthResponse,
        entity_name: Option<&[u8]>,
        auth_value: &[u8],
    ) -> Result<(), TpmError> {
        self.update_nonce_tpm(&response.nonce)?;
        if self.policy_hmac_type == PolicyHmacType::Password {
            return Ok(());
        }
        let key = self.hmac_key(entity_name, auth_value);
        crypto_hmac_verify(
            self.hash_alg,
            &key,
            &[
                rp_hash,
                &self.nonce_tpm,
                &self.nonce_caller,
                &[response.session_attributes.bits()],
            ],
            &response.hmac,
        )
        .map_err(|_| {
            error!("session 0x{:08x}: response HMAC mismatch", self.handle);
            TpmError::Integrity(format!(
                "session 0x{:08x}: response HMAC mismatch",
                self.handle
            ))
        })
    }

    fn cipher_key_iv(
        &self,
        key_bits: u16,
        auth_value: &[u8],
        nonce_newer: &[u8],
        nonce_older: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), TpmError> {
        let key_bytes = usize::from(key_bits / 8);
        let bits = u32::from(key_bits) + 128;
        let mut key = self.session_key.clone();
        key.extend_from_slice(auth_value);
        let mut material =
            crypto_kdfa(self.hash_alg, &key, KDF_LABEL_CFB, nonce_newer, nonce_older, bits)?;
        let iv = material.split_off(key_bytes);
        Ok((material, iv))
    }

    fn apply_symmetric(
        &self,
        auth_value: &[u8],
        nonce_newer: &[u8],
        nonce_older: &[u8],
        buf: &mut [u8],
        encrypt: bool,
    ) -> Result<(), TpmError> {
        match self.symmetric {
            SessionCipher::Aes { key_bits } => {
                let (key, iv) =
                    self.cipher_key_iv(key_bits, auth_value, nonce_newer, nonce_older)?;
                crypto_aes_cfb(&key, &iv, buf, encrypt)
            }
            SessionCipher::Xor(hash_alg) => {
                let mut key = self.session_key.clone();
                key.extend_from_slice(auth_value);
                crypto_xor_obfuscate(hash_alg, &key, nonce_newer, nonce_older, buf)
            }
            SessionCipher::Null => Err(TpmError::InvalidParameter(
                "parameter encryption not available".to_string(),
            )),
        }
    }

    /// Encrypts the first command parameter in place.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the session has no usable
    /// symmetric definition.
    pub fn encrypt_command_parameter(
        &self,
        auth_value: &[u8],
        buf: &mut [u8],
    ) -> Result<(), TpmError> {
        self.apply_symmetric(auth_value, &self.nonce_caller, &self.nonce_tpm, buf, true)
    }

    /// Decrypts the first response parameter in place.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the session has no usable
    /// symmetric definition.
    pub fn decrypt_response_parameter(
        &self,
        auth_value: &[u8],
        buf: &mut [u8],
    ) -> Result<(), TpmError> {
        self.apply_symmetric(auth_value, &self.nonce_tpm, &self.nonce_caller, buf, false)
    }
}

/// Derives the session key. Unbound and unsalted sessions have an empty key.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash.
pub fn derive_session_key(
    hash_alg: TpmAlgId,
    bind_auth: &[u8],
    salt: &[u8],
    nonce_tpm: &[u8],
    nonce_caller: &[u8],
) -> Result<Vec<u8>, TpmError> {
    let size = tpm_hash_size(&hash_alg).ok_or(TpmError::UnsupportedAlgorithm(hash_alg))?;
    if bind_auth.is_empty() && salt.is_empty() {
        return Ok(Vec::new());
    }
    let mut key = bind_auth.to_vec();
    key.extend_from_slice(salt);
    let bits = u32::try_from(size * 8).map_err(|_| TpmError::UnsupportedAlgorithm(hash_alg))?;
    crypto_kdfa(
        hash_alg,
        &key,
        KDF_LABEL_SESSION_KEY,
        nonce_tpm,
        nonce_caller,
        bits,
    )
}

/// `cpHash := H(commandCode || names || parameters)`
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash.
pub fn cp_hash(
    hash_alg: TpmAlgId,
    command_code: TpmCc,
    names: &[&[u8]],
    parameters: &[u8],
) -> Result<Vec<u8>, TpmError> {
    let cc = (command_code as u32).to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![&cc];
    parts.extend_from_slice(names);
    parts.push(parameters);
    hash_parts(hash_alg, &parts)
}

/// `rpHash := H(responseCode || commandCode || parameters)`
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash.
pub fn rp_hash(
    hash_alg: TpmAlgId,
    response_code: u32,
    command_code: TpmCc,
    parameters: &[u8],
) -> Result<Vec<u8>, TpmError> {
    hash_parts(
        hash_alg,
        &[
            &response_code.to_be_bytes(),
            &(command_code as u32).to_be_bytes(),
            parameters,
        ],
    )
}

/// The digest an authorizing key signs for `TPM2_PolicySigned`:
/// `aHash := H(nonceTPM || expiration || cpHashA || policyRef)`.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash.
pub fn policy_signed_digest(
    hash_alg: TpmAlgId,
    nonce_tpm: &[u8],
    expiration: i32,
    cp_hash_a: &[u8],
    policy_ref: &[u8],
) -> Result<Vec<u8>, TpmError> {
    hash_parts(
        hash_alg,
        &[nonce_tpm, &expiration.to_be_bytes(), cp_hash_a, policy_ref],
    )
}

/// The assertion family a policy ticket stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    Secret,
    Signed,
}

impl TicketKind {
    #[must_use]
    pub fn from_tag(tag: TpmSt) -> Option<Self> {
        match tag {
            TpmSt::AuthSecret => Some(Self::Secret),
            TpmSt::AuthSigned => Some(Self::Signed),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> TpmSt {
        match self {
            Self::Secret => TpmSt::AuthSecret,
            Self::Signed => TpmSt::AuthSigned,
        }
    }

    #[must_use]
    pub fn command_code(self) -> TpmCc {
        match self {
            Self::Secret => TpmCc::PolicySecret,
            Self::Signed => TpmCc::PolicySigned,
        }
    }
}

/// Checks a ticket before it is presented with `TPM2_PolicyTicket`.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` if the tag is not an authorization
/// ticket of the expected kind, if a timeout is tied to the null hierarchy,
/// or if `cp_hash` has the wrong size.
pub fn validate_policy_ticket(
    hash_alg: TpmAlgId,
    timeout: &[u8],
    cp_hash: &[u8],
    ticket: &TpmtTkAuth,
    expected: Option<TicketKind>,
) -> Result<TicketKind, TpmError> {
    let kind = TicketKind::from_tag(ticket.tag).ok_or_else(|| {
        TpmError::InvalidParameter(format!("invalid ticket tag: {:?}", ticket.tag))
    })?;
    if let Some(expected) = expected {
        if expected != kind {
            return Err(TpmError::InvalidParameter(format!(
                "expected a {expected:?} ticket, got {kind:?}"
            )));
        }
    }
    if !timeout.is_empty() && ticket.hierarchy == TpmRh::Null {
        return Err(TpmError::InvalidParameter(
            "ticket with a timeout has the null hierarchy".to_string(),
        ));
    }
    if !is_hash_supported(hash_alg) {
        return Err(TpmError::UnsupportedAlgorithm(hash_alg));
    }
    if !cp_hash.is_empty() && Some(cp_hash.len()) != tpm_hash_size(&hash_alg) {
        return Err(TpmError::InvalidParameter(format!(
            "cpHash of {} bytes",
            cp_hash.len()
        )));
    }
    Ok(kind)
}

/// Returns the lifetime in seconds of the reusable ticket requested by
/// `expiration`, or `None` if no ticket is requested. Negative values
/// request a ticket.
#[must_use]
pub fn ticket_lifetime(expiration: i32) -> Option<u64> {
    if expiration < 0 {
        Some(u64::from(expiration.unsigned_abs()))
    } else {
        None
    }
}

/// Returns the hierarchy a ticket for `expiration` is tied to.
#[must_use]
pub fn ticket_hierarchy(expiration: i32) -> TpmRh {
    if ticket_lifetime(expiration).is_some() {
        TpmRh::Owner
    } else {
        TpmRh::Null
    }
}

/// Checks that a `PolicySecret` or `PolicySigned` reply follows the
/// expiration convention.
///
/// # Errors
///
/// Returns `TpmError::UnexpectedResponse` if the timeout or the ticket
/// hierarchy does not match `expiration`.
pub fn check_ticket_reply(
    expiration: i32,
    timeout: &[u8],
    ticket: &TpmtTkAuth,
) -> Result<(), TpmError> {
    let wants_ticket = ticket_lifetime(expiration).is_some();
    let null_hierarchy = ticket.hierarchy == TpmRh::Null;
    if wants_ticket == timeout.is_empty() || wants_ticket == null_hierarchy {
        return Err(TpmError::UnexpectedResponse(format!(
            "ticket does not match expiration {expiration}"
        )));
    }
    Ok(())
}
