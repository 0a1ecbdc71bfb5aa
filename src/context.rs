// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Host envelope for saved TPM contexts.
//!
//! The TPM protects only its own opaque context blob. The envelope binds the
//! host metadata of the resource to that blob with a checksum:
//!
//! ```text
//! outer := u16 checksumAlg || TPM2B checksum || TPM2B inner
//! inner := u8 type || metadata || TPM2B tpmBlob
//! ```

use crate::{
    digest::{hash_parts, is_hash_supported},
    error::TpmError,
    resource::{HandleType, ObjectContext},
    session::{PolicyHmacType, SessionCipher, SessionContext, POLICY_HMAC_TYPE_MAX},
    util::{build_to_vec, parse_exact},
};
use log::error;
use tpm2_protocol::{
    constant::TPM_MAX_COMMAND_SIZE,
    data::{TpmAlgId, TpmSe, TpmsContext, TpmtPublic},
    tpm_hash_size, TpmBuild, TpmErrorKind, TpmParse, TpmSized, TpmWriter,
};

const CONTEXT_TYPE_OBJECT: u8 = 0;
const CONTEXT_TYPE_SESSION: u8 = 1;

/// The checksum algorithm of envelopes written by this crate.
pub const CONTEXT_CHECKSUM_ALG: TpmAlgId = TpmAlgId::Sha256;

fn sized_len(bytes: &[u8]) -> usize {
    2 + bytes.len()
}

fn build_sized(writer: &mut TpmWriter, bytes: &[u8]) -> Result<(), TpmErrorKind> {
    let size = u16::try_from(bytes.len()).map_err(|_| TpmErrorKind::InvalidValue)?;
    size.build(writer)?;
    writer.write_bytes(bytes)
}

fn parse_sized(buf: &[u8]) -> Result<(&[u8], &[u8]), TpmErrorKind> {
    let (size, buf) = u16::parse(buf)?;
    let size = usize::from(size);
    if buf.len() < size {
        return Err(TpmErrorKind::Underflow);
    }
    Ok(buf.split_at(size))
}

fn parse_flag(buf: &[u8]) -> Result<(bool, &[u8]), TpmErrorKind> {
    let (value, buf) = u8::parse(buf)?;
    match value {
        0 => Ok((false, buf)),
        1 => Ok((true, buf)),
        _ => Err(TpmErrorKind::InvalidValue),
    }
}

/// Symmetric definition with a raw algorithm, so that unrecognized values
/// survive parsing and are rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSymDef {
    pub algorithm: u16,
    pub key_bits: u16,
    pub mode: u16,
}

impl RawSymDef {
    fn is_null(&self) -> bool {
        self.algorithm == TpmAlgId::Null as u16
    }

    fn is_xor(&self) -> bool {
        self.algorithm == TpmAlgId::Xor as u16
    }
}

impl From<SessionCipher> for RawSymDef {
    fn from(cipher: SessionCipher) -> Self {
        let (algorithm, key_bits, mode) = cipher.to_raw();
        Self {
            algorithm,
            key_bits,
            mode,
        }
    }
}

impl TpmSized for RawSymDef {
    const SIZE: usize = 6;

    fn len(&self) -> usize {
        if self.is_null() {
            2
        } else if self.is_xor() {
            4
        } else {
            6
        }
    }
}

impl TpmBuild for RawSymDef {
    fn build(&self, writer: &mut TpmWriter) -> Result<(), TpmErrorKind> {
        self.algorithm.build(writer)?;
        if self.is_null() {
            return Ok(());
        }
        self.key_bits.build(writer)?;
        if self.is_xor() {
            return Ok(());
        }
        self.mode.build(writer)
    }
}

impl TpmParse for RawSymDef {
    fn parse(buf: &[u8]) -> Result<(Self, &[u8]), TpmErrorKind> {
        let null = TpmAlgId::Null as u16;
        let (algorithm, buf) = u16::parse(buf)?;
        let mut sym = Self {
            algorithm,
            key_bits: 0,
            mode: null,
        };
        if sym.is_null() {
            return Ok((sym, buf));
        }
        let (key_bits, buf) = u16::parse(buf)?;
        sym.key_bits = key_bits;
        if sym.is_xor() {
            return Ok((sym, buf));
        }
        let (mode, buf) = u16::parse(buf)?;
        sym.mode = mode;
        Ok((sym, buf))
    }
}

/// Session fields as stored in an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContextData {
    pub is_audit: bool,
    pub is_exclusive: bool,
    pub hash_alg: u16,
    pub session_type: u8,
    pub policy_hmac_type: u8,
    pub is_bound: bool,
    pub bound_entity: Vec<u8>,
    pub session_key: Vec<u8>,
    pub nonce_caller: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    pub symmetric: RawSymDef,
}

impl TpmSized for SessionContextData {
    const SIZE: usize = TPM_MAX_COMMAND_SIZE;

    fn len(&self) -> usize {
        7 + sized_len(&self.bound_entity)
            + sized_len(&self.session_key)
            + sized_len(&self.nonce_caller)
            + sized_len(&self.nonce_tpm)
            + self.symmetric.len()
    }
}

impl TpmBuild for SessionContextData {
    fn build(&self, writer: &mut TpmWriter) -> Result<(), TpmErrorKind> {
        u8::from(self.is_audit).build(writer)?;
        u8::from(self.is_exclusive).build(writer)?;
        self.hash_alg.build(writer)?;
        self.session_type.build(writer)?;
        self.policy_hmac_type.build(writer)?;
        u8::from(self.is_bound).build(writer)?;
        build_sized(writer, &self.bound_entity)?;
        build_sized(writer, &self.session_key)?;
        build_sized(writer, &self.nonce_caller)?;
        build_sized(writer, &self.nonce_tpm)?;
        self.symmetric.build(writer)
    }
}

impl TpmParse for SessionContextData {
    fn parse(buf: &[u8]) -> Result<(Self, &[u8]), TpmErrorKind> {
        let (is_audit, buf) = parse_flag(buf)?;
        let (is_exclusive, buf) = parse_flag(buf)?;
        let (hash_alg, buf) = u16::parse(buf)?;
        let (session_type, buf) = u8::parse(buf)?;
        let (policy_hmac_type, buf) = u8::parse(buf)?;
        let (is_bound, buf) = parse_flag(buf)?;
        let (bound_entity, buf) = parse_sized(buf)?;
        let (session_key, buf) = parse_sized(buf)?;
        let (nonce_caller, buf) = parse_sized(buf)?;
        let (nonce_tpm, buf) = parse_sized(buf)?;
        let (symmetric, buf) = RawSymDef::parse(buf)?;
        Ok((
            Self {
                is_audit,
                is_exclusive,
                hash_alg,
                session_type,
                policy_hmac_type,
                is_bound,
                bound_entity: bound_entity.to_vec(),
                session_key: session_key.to_vec(),
                nonce_caller: nonce_caller.to_vec(),
                nonce_tpm: nonce_tpm.to_vec(),
                symmetric,
            },
            buf,
        ))
    }
}

/// Resource metadata stored in an envelope, selected by the context type.
///
/// The public area of an object is kept as its marshalled `TPMT_PUBLIC`
/// so that the envelope checksum covers exactly the bytes the name was
/// computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextData {
    Object { public: Vec<u8>, name: Vec<u8> },
    Session(SessionContextData),
}

impl TpmSized for ContextData {
    const SIZE: usize = TPM_MAX_COMMAND_SIZE;

    fn len(&self) -> usize {
        1 + match self {
            Self::Object { public, name } => sized_len(public) + sized_len(name),
            Self::Session(data) => data.len(),
        }
    }
}

impl TpmBuild for ContextData {
    fn build(&self, writer: &mut TpmWriter) -> Result<(), TpmErrorKind> {
        match self {
            Self::Object { public, name } => {
                CONTEXT_TYPE_OBJECT.build(writer)?;
                build_sized(writer, public)?;
                build_sized(writer, name)
            }
            Self::Session(data) => {
                CONTEXT_TYPE_SESSION.build(writer)?;
                data.build(writer)
            }
        }
    }
}

impl TpmParse for ContextData {
    fn parse(buf: &[u8]) -> Result<(Self, &[u8]), TpmErrorKind> {
        let (context_type, buf) = u8::parse(buf)?;
        match context_type {
            CONTEXT_TYPE_OBJECT => {
                let (public, buf) = parse_sized(buf)?;
                let (name, buf) = parse_sized(buf)?;
                Ok((
                    Self::Object {
                        public: public.to_vec(),
                        name: name.to_vec(),
                    },
                    buf,
                ))
            }
            CONTEXT_TYPE_SESSION => {
                let (data, buf) = SessionContextData::parse(buf)?;
                Ok((Self::Session(data), buf))
            }
            _ => Err(TpmErrorKind::InvalidValue),
        }
    }
}

/// A resource that can describe itself for a context envelope.
pub trait ContextMetadata {
    /// # Errors
    ///
    /// Returns `TpmError::Marshal` if the metadata cannot be marshalled.
    fn context_data(&self) -> Result<ContextData, TpmError>;
}

impl ContextMetadata for ObjectContext {
    fn context_data(&self) -> Result<ContextData, TpmError> {
        Ok(ContextData::Object {
            public: build_to_vec(&self.public)?,
            name: self.name.clone(),
        })
    }
}

impl ContextMetadata for SessionContext {
    fn context_data(&self) -> Result<ContextData, TpmError> {
        Ok(ContextData::Session(SessionContextData {
            is_audit: self.is_audit,
            is_exclusive: self.is_exclusive,
            hash_alg: self.hash_alg as u16,
            session_type: self.session_type as u8,
            policy_hmac_type: self.policy_hmac_type.into(),
            is_bound: self.is_bound,
            bound_entity: self.bound_entity.clone(),
            session_key: self.session_key.clone(),
            nonce_caller: self.nonce_caller.clone(),
            nonce_tpm: self.nonce_tpm.clone(),
            symmetric: self.symmetric.into(),
        }))
    }
}

/// A resource recovered from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoredContext {
    Object(ObjectContext),
    /// The session is not usable until the TPM has loaded it.
    Session(SessionContext),
}

impl ContextMetadata for RestoredContext {
    fn context_data(&self) -> Result<ContextData, TpmError> {
        match self {
            Self::Object(object) => object.context_data(),
            Self::Session(session) => session.context_data(),
        }
    }
}

/// The checksummed part of an envelope.
struct ContextInner<'a> {
    data: &'a ContextData,
    tpm_blob: &'a [u8],
}

impl TpmSized for ContextInner<'_> {
    const SIZE: usize = TPM_MAX_COMMAND_SIZE;

    fn len(&self) -> usize {
        self.data.len() + sized_len(self.tpm_blob)
    }
}

impl TpmBuild for ContextInner<'_> {
    fn build(&self, writer: &mut TpmWriter) -> Result<(), TpmErrorKind> {
        self.data.build(writer)?;
        build_sized(writer, self.tpm_blob)
    }
}

/// The outer layer of an envelope.
struct ContextOuter<'a> {
    checksum: &'a [u8],
    inner: &'a [u8],
}

impl TpmSized for ContextOuter<'_> {
    const SIZE: usize = TPM_MAX_COMMAND_SIZE;

    fn len(&self) -> usize {
        2 + sized_len(self.checksum) + sized_len(self.inner)
    }
}

impl TpmBuild for ContextOuter<'_> {
    fn build(&self, writer: &mut TpmWriter) -> Result<(), TpmErrorKind> {
        (CONTEXT_CHECKSUM_ALG as u16).build(writer)?;
        build_sized(writer, self.checksum)?;
        build_sized(writer, self.inner)
    }
}

fn build_envelope(tpm_blob: &[u8], data: &ContextData) -> Result<Vec<u8>, TpmError> {
    let inner = build_to_vec(&ContextInner { data, tpm_blob })?;
    let checksum = hash_parts(CONTEXT_CHECKSUM_ALG, &[&inner])?;
    Ok(build_to_vec(&ContextOuter {
        checksum: &checksum,
        inner: &inner,
    })?)
}

/// Wraps the TPM's opaque context blob together with the resource metadata.
///
/// # Errors
///
/// Returns `TpmError::Marshal` if the metadata cannot be marshalled.
pub fn wrap_context_blob(
    tpm_blob: &[u8],
    resource: &dyn ContextMetadata,
) -> Result<Vec<u8>, TpmError> {
    build_envelope(tpm_blob, &resource.context_data()?)
}

/// Replaces the opaque blob of a context returned by `TPM2_ContextSave` with
/// the wrapped envelope.
///
/// # Errors
///
/// Returns `TpmError::Marshal` if the envelope does not fit into the context
/// blob.
pub fn wrap_context(
    context: &TpmsContext,
    resource: &dyn ContextMetadata,
) -> Result<TpmsContext, TpmError> {
    let blob = wrap_context_blob(&context.context_blob, resource)?;
    let mut wrapped = context.clone();
    wrapped.context_blob = blob.as_slice().try_into()?;
    Ok(wrapped)
}

fn integrity(rule: &str) -> TpmError {
    error!("context: {rule}");
    TpmError::Integrity(rule.to_string())
}

fn malformed(what: &str, err: TpmErrorKind) -> TpmError {
    TpmError::Malformed(format!("{what}: {err}"))
}

/// Unpacks an envelope and validates the metadata against the saved handle.
///
/// # Errors
///
/// Returns `TpmError::Malformed` if the envelope cannot be unpacked or uses an
/// unsupported checksum algorithm, and `TpmError::Integrity` if the checksum
/// or any consistency rule fails.
pub fn unwrap_context_blob(
    saved_handle: u32,
    blob: &[u8],
) -> Result<(RestoredContext, Vec<u8>), TpmError> {
    let envelope = |e| malformed("context envelope", e);
    let (checksum_alg, buf) = u16::parse(blob).map_err(envelope)?;
    let (checksum, buf) = parse_sized(buf).map_err(envelope)?;
    let (inner, buf) = parse_sized(buf).map_err(envelope)?;
    if !buf.is_empty() {
        return Err(envelope(TpmErrorKind::TrailingData));
    }

    let checksum_alg = TpmAlgId::try_from(checksum_alg)
        .ok()
        .filter(|&alg| is_hash_supported(alg))
        .ok_or_else(|| {
            TpmError::Malformed(format!(
                "unsupported checksum algorithm: 0x{checksum_alg:04x}"
            ))
        })?;

    if hash_parts(checksum_alg, &[inner])? != checksum {
        return Err(integrity("checksum mismatch"));
    }

    if let Some(&context_type) = inner.first() {
        if context_type != CONTEXT_TYPE_OBJECT && context_type != CONTEXT_TYPE_SESSION {
            return Err(integrity("inconsistent attributes"));
        }
    }
    let data_error = |e| malformed("context data", e);
    let (data, buf) = ContextData::parse(inner).map_err(data_error)?;
    let (tpm_blob, buf) = parse_sized(buf).map_err(data_error)?;
    if !buf.is_empty() {
        return Err(data_error(TpmErrorKind::TrailingData));
    }

    let restored = match data {
        ContextData::Object { public, name } => {
            RestoredContext::Object(restore_object(saved_handle, &public, &name)?)
        }
        ContextData::Session(data) => {
            RestoredContext::Session(restore_session(saved_handle, data)?)
        }
    };
    Ok((restored, tpm_blob.to_vec()))
}

/// Unwraps a context produced by `wrap_context`, returning the context to
/// pass to `TPM2_ContextLoad`.
///
/// # Errors
///
/// See [`unwrap_context_blob`]. Returns `TpmError::Marshal` if the TPM blob
/// cannot be placed back into a context.
pub fn unwrap_context(context: &TpmsContext) -> Result<(RestoredContext, TpmsContext), TpmError> {
    let (restored, tpm_blob) = unwrap_context_blob(context.saved_handle.0, &context.context_blob)?;
    let mut inner = context.clone();
    inner.context_blob = tpm_blob.as_slice().try_into()?;
    Ok((restored, inner))
}

fn restore_object(saved_handle: u32, public: &[u8], name: &[u8]) -> Result<ObjectContext, TpmError> {
    if HandleType::from_handle(saved_handle) != Some(HandleType::Transient) {
        return Err(integrity("saved handle is not a transient object"));
    }
    let public: TpmtPublic =
        parse_exact(public).map_err(|e| malformed("context public area", e))?;
    ObjectContext::with_name(saved_handle, public, name)
        .map_err(|_| integrity("public area and name don't match"))
}

fn restore_session(saved_handle: u32, data: SessionContextData) -> Result<SessionContext, TpmError> {
    if !HandleType::from_handle(saved_handle).is_some_and(HandleType::is_session) {
        return Err(integrity("saved handle is not a session"));
    }
    if data.is_exclusive && !data.is_audit {
        return Err(integrity("inconsistent audit attributes"));
    }
    let hash_alg = TpmAlgId::try_from(data.hash_alg)
        .ok()
        .filter(|&alg| is_hash_supported(alg))
        .ok_or_else(|| integrity("invalid session hash algorithm"))?;
    let digest_size =
        tpm_hash_size(&hash_alg).ok_or_else(|| integrity("invalid session hash algorithm"))?;
    let session_type =
        TpmSe::try_from(data.session_type).map_err(|_| integrity("invalid session type"))?;
    if data.policy_hmac_type > POLICY_HMAC_TYPE_MAX {
        return Err(integrity("invalid policy session HMAC type"));
    }
    let policy_hmac_type = PolicyHmacType::try_from(data.policy_hmac_type)
        .map_err(|_| integrity("invalid policy session HMAC type"))?;
    if data.is_bound == data.bound_entity.is_empty() {
        return Err(integrity("invalid bind properties"));
    }
    if !data.session_key.is_empty() && data.session_key.len() != digest_size {
        return Err(integrity("unexpected session key size"));
    }
    if data.nonce_caller.len() != digest_size {
        return Err(integrity("unexpected nonceCaller size"));
    }
    if data.nonce_tpm.len() != digest_size {
        return Err(integrity("unexpected nonceTPM size"));
    }
    let sym = data.symmetric;
    let symmetric = SessionCipher::from_raw(sym.algorithm, sym.key_bits, sym.mode).map_err(
        |err| match err {
            TpmError::Integrity(rule) => integrity(&rule),
            other => other,
        },
    )?;

    Ok(SessionContext {
        handle: saved_handle,
        usable: false,
        is_audit: data.is_audit,
        is_exclusive: data.is_exclusive,
        hash_alg,
        session_type,
        policy_hmac_type,
        is_bound: data.is_bound,
        bound_entity: data.bound_entity,
        session_key: data.session_key,
        nonce_caller: data.nonce_caller,
        nonce_tpm: data.nonce_tpm,
        symmetric,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::sealed_data_template;
    use tpm2_protocol::{data::TpmRh, TpmTransient};

    fn session() -> SessionContext {
        let mut session = SessionContext::new(
            0x0300_0000,
            TpmSe::Policy,
            TpmAlgId::Sha256,
            SessionCipher::Aes { key_bits: 128 },
            vec![0x11; 32],
            vec![0x22; 32],
            Some((&[0x00, 0x0b, 0xaa][..], b"bind auth")),
            &[],
        )
        .unwrap();
        session.usable = false;
        session
    }

    fn object(name_alg: TpmAlgId) -> ObjectContext {
        ObjectContext::new(0x8000_0001, sealed_data_template(name_alg, &[]).unwrap()).unwrap()
    }

    fn wrap_session(f: impl FnOnce(&mut SessionContextData)) -> Vec<u8> {
        let ContextData::Session(mut data) = session().context_data().unwrap() else {
            unreachable!()
        };
        f(&mut data);
        build_envelope(b"tpm blob", &ContextData::Session(data)).unwrap()
    }

    #[test]
    fn test_session_round_trip() {
        let original = session();
        let blob = wrap_context_blob(b"tpm blob", &original).unwrap();
        let (restored, tpm_blob) = unwrap_context_blob(0x0300_0000, &blob).unwrap();
        assert_eq!(tpm_blob, b"tpm blob");
        assert_eq!(restored, RestoredContext::Session(original));
    }

    #[test]
    fn test_object_round_trip() {
        let object = object(TpmAlgId::Sha384);
        let blob = wrap_context_blob(&[0xde, 0xad], &object).unwrap();
        let (restored, tpm_blob) = unwrap_context_blob(0x8000_0001, &blob).unwrap();
        assert_eq!(tpm_blob, vec![0xde, 0xad]);
        assert_eq!(restored, RestoredContext::Object(object));
    }

    #[test]
    fn test_wrap_is_deterministic() {
        assert_eq!(
            wrap_context_blob(b"x", &session()).unwrap(),
            wrap_context_blob(b"x", &session()).unwrap()
        );
    }

    #[test]
    fn test_object_with_wrong_handle_type() {
        let blob = wrap_context_blob(&[], &object(TpmAlgId::Sha256)).unwrap();
        assert!(matches!(
            unwrap_context_blob(0x8100_0001, &blob),
            Err(TpmError::Integrity(_))
        ));
    }

    #[test]
    fn test_object_name_mismatch() {
        let mut object = object(TpmAlgId::Sha256);
        object.name[2] ^= 1;
        let blob = wrap_context_blob(&[], &object).unwrap();
        match unwrap_context_blob(0x8000_0001, &blob) {
            Err(TpmError::Integrity(rule)) => assert_eq!(rule, "public area and name don't match"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_envelope() {
        let blob = wrap_context_blob(b"tpm blob", &session()).unwrap();
        assert!(matches!(
            unwrap_context_blob(0x0300_0000, &blob[..blob.len() - 1]),
            Err(TpmError::Malformed(_))
        ));
        assert!(matches!(
            unwrap_context_blob(0x0300_0000, &[]),
            Err(TpmError::Malformed(_))
        ));
    }

    #[test]
    fn test_unsupported_checksum_algorithm() {
        let mut blob = wrap_context_blob(b"tpm blob", &session()).unwrap();
        blob[1] = 0x06;
        assert!(matches!(
            unwrap_context_blob(0x0300_0000, &blob),
            Err(TpmError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_context_type() {
        let inner = [7u8, 0, 0];
        let checksum = hash_parts(TpmAlgId::Sha256, &[&inner]).unwrap();
        let blob = build_to_vec(&ContextOuter {
            checksum: &checksum,
            inner: &inner,
        })
        .unwrap();
        match unwrap_context_blob(0x8000_0000, &blob) {
            Err(TpmError::Integrity(rule)) => assert_eq!(rule, "inconsistent attributes"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_single_byte_flips() {
        let blob = wrap_context_blob(b"tpm blob", &session()).unwrap();
        // checksum starts after the algorithm and the size prefix
        let checksum_start = 4;
        let inner_start = checksum_start + 32 + 2;
        for i in (checksum_start..checksum_start + 32).chain(inner_start..blob.len()) {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(
                    unwrap_context_blob(0x0300_0000, &tampered),
                    Err(TpmError::Integrity(_))
                ),
                "byte {i}"
            );
        }
    }

    #[test]
    fn test_session_with_object_handle() {
        let blob = wrap_context_blob(b"tpm blob", &session()).unwrap();
        assert!(matches!(
            unwrap_context_blob(0x8000_0000, &blob),
            Err(TpmError::Integrity(_))
        ));
    }

    #[test]
    fn test_session_validation_rules() {
        let cases: Vec<(Box<dyn FnOnce(&mut SessionContextData)>, &str)> = vec![
            (
                Box::new(|d| {
                    d.is_exclusive = true;
                    d.is_audit = false;
                }),
                "inconsistent audit attributes",
            ),
            (
                Box::new(|d| d.hash_alg = 0x0012),
                "invalid session hash algorithm",
            ),
            (Box::new(|d| d.session_type = 2), "invalid session type"),
            (
                Box::new(|d| d.policy_hmac_type = 3),
                "invalid policy session HMAC type",
            ),
            (
                Box::new(|d| d.bound_entity.clear()),
                "invalid bind properties",
            ),
            (
                Box::new(|d| d.session_key.truncate(10)),
                "unexpected session key size",
            ),
            (
                Box::new(|d| d.nonce_caller.push(0)),
                "unexpected nonceCaller size",
            ),
            (
                Box::new(|d| d.nonce_tpm.truncate(20)),
                "unexpected nonceTPM size",
            ),
            (
                Box::new(|d| d.symmetric.algorithm = 0x0001),
                "invalid symmetric algorithm",
            ),
            (
                Box::new(|d| d.symmetric.mode = 0x0042),
                "invalid symmetric mode",
            ),
        ];
        for (mutate, rule) in cases {
            let blob = wrap_session(mutate);
            match unwrap_context_blob(0x0300_0000, &blob) {
                Err(TpmError::Integrity(msg)) => assert_eq!(msg, rule),
                other => panic!("{rule}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_exclusive_audit_session_is_accepted() {
        let blob = wrap_session(|d| {
            d.is_audit = true;
            d.is_exclusive = true;
        });
        assert!(unwrap_context_blob(0x0200_0000, &blob).is_ok());
    }

    #[test]
    fn test_flag_must_be_boolean() {
        let ContextData::Session(data) = session().context_data().unwrap() else {
            unreachable!()
        };
        let mut bytes = build_to_vec(&data).unwrap();
        bytes[0] = 2;
        assert!(matches!(
            SessionContextData::parse(&bytes),
            Err(TpmErrorKind::InvalidValue)
        ));
    }

    #[test]
    fn test_wrap_context_keeps_header() {
        let context = TpmsContext {
            sequence: 42,
            saved_handle: TpmTransient(0x0300_0000),
            hierarchy: TpmRh::Null,
            context_blob: b"opaque".as_slice().try_into().unwrap(),
        };
        let wrapped = wrap_context(&context, &session()).unwrap();
        assert_eq!(wrapped.sequence, 42);
        assert_ne!(&wrapped.context_blob[..], &context.context_blob[..]);
        let (_, unwrapped) = unwrap_context(&wrapped).unwrap();
        assert_eq!(unwrapped, context);
    }
}
