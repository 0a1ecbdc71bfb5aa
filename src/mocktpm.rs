// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! An in-process TPM simulator for the commands driven by `command::Tpm`.
//!
//! The simulator runs on its own thread behind a `PipeTransport`. It keeps
//! its own object, session and policy state and verifies authorizations the
//! way a TPM does, so that host-side state can be tested end to end.

use crate::{
    constant::{
        TPM_HEADER_SIZE, TPM_MAX_DIGEST_SIZE, TPM_PCR_COUNT, TPM_POLICY_OR_MAX,
        TPM_RH_HMAC_SESSION_FIRST, TPM_RH_POLICY_SESSION_FIRST,
    },
    crypto::{
        crypto_aes_cfb, crypto_hmac, crypto_kdfa, crypto_make_name, crypto_make_nv_name,
        crypto_signature_hmac,
    },
    device::{command_parameters, patch_last_u32, response_parameters},
    digest::hash_parts,
    error::TpmError,
    parser::NvOperation,
    pcr::pcr_selected,
    resource::{normalize_session_handle, HandleType},
    session::{
        cp_hash, derive_session_key, policy_signed_digest, rp_hash, ticket_lifetime,
        PolicyHmacType, SessionCipher,
    },
    transport::{read_message, PipeTransport},
    util::{build_to_vec, TpmErrorKindExt},
};
use log::{debug, error};
use rand::{thread_rng, RngCore};
use std::{collections::HashMap, io::Write, thread::JoinHandle};
use tpm2_protocol::{
    constant::{TPM_MAX_COMMAND_SIZE, TPM_RH_TRANSIENT_FIRST},
    data::{
        Tpm2bDigest, Tpm2bNvPublic, Tpm2bPrivate, Tpm2bPublic, TpmAlgId, TpmCc, TpmRc,
        TpmRcBase, TpmRh, TpmSe, TpmSt, TpmaNv, TpmaObject, TpmaSession, TpmlDigest,
        TpmlPcrSelection, TpmsAuthCommand, TpmsAuthResponse, TpmsContext, TpmsNvPublic, TpmtPublic,
        TpmtTkAuth, TpmuPublicId, TpmuSensitiveComposite,
    },
    message::{
        tpm_build_response, tpm_parse_command, TpmAuthResponses, TpmCommandBody,
        TpmContextLoadCommand, TpmContextLoadResponse, TpmContextSaveCommand,
        TpmContextSaveResponse, TpmCreateCommand, TpmCreatePrimaryCommand,
        TpmCreatePrimaryResponse, TpmCreateResponse, TpmEvictControlCommand,
        TpmEvictControlResponse, TpmFlushContextCommand, TpmFlushContextResponse,
        TpmLoadCommand, TpmLoadExternalCommand, TpmLoadExternalResponse, TpmLoadResponse,
        TpmNvReadPublicCommand, TpmNvReadPublicResponse, TpmPcrReadCommand, TpmPcrReadResponse,
        TpmPolicyAuthValueCommand, TpmPolicyAuthValueResponse, TpmPolicyCommandCodeCommand,
        TpmPolicyCommandCodeResponse, TpmPolicyGetDigestCommand, TpmPolicyGetDigestResponse,
        TpmPolicyNvCommand, TpmPolicyNvResponse, TpmPolicyOrCommand, TpmPolicyOrResponse,
        TpmPolicyPasswordCommand, TpmPolicyPasswordResponse, TpmPolicyPcrCommand,
        TpmPolicyPcrResponse, TpmPolicyRestartCommand, TpmPolicyRestartResponse,
        TpmPolicySecretCommand, TpmPolicySecretResponse, TpmPolicySignedCommand,
        TpmPolicySignedResponse, TpmPolicyTicketCommand, TpmPolicyTicketResponse,
        TpmReadPublicCommand, TpmReadPublicResponse, TpmResponseBody, TpmShutdownCommand,
        TpmShutdownResponse, TpmStartAuthSessionCommand, TpmStartAuthSessionResponse,
        TpmStartupCommand, TpmStartupResponse, TpmUnsealCommand, TpmUnsealResponse,
    },
    tpm_hash_size, TpmErrorKind, TpmSession, TpmTransient, TpmWriter,
};

const KDF_LABEL_STORAGE: &str = "STORAGE";
const KDF_LABEL_INTEGRITY: &str = "INTEGRITY";

/// `TPMA_NV_AUTHWRITE | TPMA_NV_AUTHREAD` and their policy counterparts.
const MOCK_NV_ATTRIBUTES: u32 = 0x0006_0006;

type MockTpmResult = Result<TpmResponseBody, TpmRc>;

fn rc(base: TpmRcBase) -> TpmRc {
    TpmRc::from(base)
}

/// Converts a host-side failure into the response code the simulator
/// reports.
fn error_rc(err: TpmError) -> TpmRc {
    match err {
        TpmError::Marshal(kind) => kind.to_tpm_rc(),
        TpmError::UnsupportedAlgorithm(_) => rc(TpmRcBase::Hash),
        TpmError::InvalidParameter(_) => rc(TpmRcBase::Value),
        _ => rc(TpmRcBase::Failure),
    }
}

fn random_bytes(size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// An NV index provisioned into the simulator at start.
#[derive(Debug, Clone)]
pub struct MockNvIndex {
    pub handle: u32,
    pub public: TpmsNvPublic,
    pub data: Vec<u8>,
}

impl MockNvIndex {
    /// Describes an index readable and writable with its (empty)
    /// authorization value.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Marshal` if `auth_policy` or `data` is too large.
    pub fn new(
        handle: u32,
        name_alg: TpmAlgId,
        auth_policy: &[u8],
        data: Vec<u8>,
    ) -> Result<Self, TpmError> {
        let data_size = u16::try_from(data.len())
            .map_err(|_| TpmError::InvalidParameter(format!("NV data of {} bytes", data.len())))?;
        let public = TpmsNvPublic {
            nv_index: handle.into(),
            name_alg,
            attributes: TpmaNv::from_bits_truncate(MOCK_NV_ATTRIBUTES),
            auth_policy: Tpm2bDigest::try_from(auth_policy)?,
            data_size,
        };
        Ok(Self {
            handle,
            public,
            data,
        })
    }
}

#[derive(Debug, Clone)]
struct MockObject {
    public: TpmtPublic,
    name: Vec<u8>,
    auth_value: Vec<u8>,
    sensitive: Vec<u8>,
}


#[derive(Debug, Clone)]
struct MockSession {
    session_type: TpmSe,
    hash_alg: TpmAlgId,
    session_key: Vec<u8>,
    bound_entity: Vec<u8>,
    nonce_tpm: Vec<u8>,
    policy_digest: Vec<u8>,
    policy_hmac_type: PolicyHmacType,
    command_code: Option<u32>,
    saved: bool,
}

impl MockSession {
    fn digest(&self, parts: &[&[u8]]) -> Result<Vec<u8>, TpmRc> {
        hash_parts(self.hash_alg, parts).map_err(error_rc)
    }

    fn extend(&mut self, cc: TpmCc, args: &[&[u8]]) -> Result<(), TpmRc> {
        let code = (cc as u32).to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![self.policy_digest.as_slice(), &code[..]];
        parts.extend_from_slice(args);
        self.policy_digest = self.digest(&parts)?;
        Ok(())
    }

    fn policy_update(&mut self, cc: TpmCc, name: &[u8], policy_ref: &[u8]) -> Result<(), TpmRc> {
        self.extend(cc, &[name])?;
        self.policy_digest = self.digest(&[&self.policy_digest, policy_ref])?;
        Ok(())
    }

    fn reset(&mut self) {
        self.policy_digest.iter_mut().for_each(|b| *b = 0);
        self.policy_hmac_type = PolicyHmacType::NoAuth;
        self.command_code = None;
    }

    fn hmac_key(&self, entity_name: &[u8], auth_value: &[u8]) -> Vec<u8> {
        let include_auth = match self.session_type {
            TpmSe::Policy => self.policy_hmac_type == PolicyHmacType::Auth,
            _ => self.bound_entity.is_empty() || self.bound_entity != entity_name,
        };
        let mut key = self.session_key.clone();
        if include_auth {
            key.extend_from_slice(auth_value);
        }
        key
    }
}

#[derive(Debug, Clone)]
enum MockSaved {
    Object(MockObject),
    Session(u32),
}

/// The authorization properties of an entity.
#[derive(Debug, Clone, Default)]
struct MockEntity {
    auth_value: Vec<u8>,
    auth_policy: Vec<u8>,
    user_with_auth: bool,
}

/// The parts of a command that handlers and the authorization checks share.
#[derive(Debug)]
struct MockCall<'a> {
    cc: TpmCc,
    request: &'a [u8],
    handles: Vec<u32>,
    sessions: Vec<TpmsAuthCommand>,
    parameters: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockTpm {
    objects: HashMap<u32, MockObject>,
    sessions: HashMap<u32, MockSession>,
    saved: HashMap<u64, MockSaved>,
    nv_indices: HashMap<u32, MockNvIndex>,
    pcrs: HashMap<TpmAlgId, Vec<Vec<u8>>>,
    next_transient_handle: u32,
    next_session_index: u32,
    sequence: u64,
    clock: u64,
    proof: Vec<u8>,
    exclusive: Option<u32>,
}

trait MockTpmResponse {
    fn build(
        &self,
        writer: &mut TpmWriter,
        rc: TpmRc,
        auth_responses: &TpmAuthResponses,
    ) -> Result<(), TpmRc>;
}

macro_rules! mocktpm_response {
    ($($variant:ident),* $(,)?) => {
        impl MockTpmResponse for TpmResponseBody {
            fn build(
                &self,
                writer: &mut TpmWriter,
                rc: TpmRc,
                auth_responses: &TpmAuthResponses,
            ) -> Result<(), TpmRc> {
                match self {
                    $(
                        TpmResponseBody::$variant(r) => {
                            tpm_build_response(r, auth_responses, rc, writer)
                                .map_err(TpmErrorKindExt::to_tpm_rc)
                        }
                    )*
                    _ => Err(TpmErrorKind::Unreachable.to_tpm_rc()),
                }
            }
        }
    };
}

mocktpm_response!(
    ContextLoad,
    ContextSave,
    Create,
    CreatePrimary,
    EvictControl,
    FlushContext,
    Load,
    LoadExternal,
    NvReadPublic,
    PcrRead,
    PolicyAuthValue,
    PolicyCommandCode,
    PolicyGetDigest,
    PolicyNv,
    PolicyOr,
    PolicyPassword,
    PolicyPcr,
    PolicyRestart,
    PolicySecret,
    PolicySigned,
    PolicyTicket,
    ReadPublic,
    Shutdown,
    StartAuthSession,
    Startup,
    Unseal,
);

macro_rules! mocktpm_command {
    ($($variant:ident => ($auths:literal, $handler:path)),* $(,)?) => {
        /// Returns the number of authorizations a command takes.
        fn mocktpm_auth_count(cc: TpmCc) -> Option<usize> {
            match cc {
                $(TpmCc::$variant => Some($auths),)*
                _ => None,
            }
        }

        fn mocktpm_dispatch(
            tpm: &mut MockTpm,
            body: &TpmCommandBody,
            call: &MockCall<'_>,
        ) -> MockTpmResult {
            match body {
                $(TpmCommandBody::$variant(cmd) => $handler(tpm, cmd, call),)*
                _ => Err(rc(TpmRcBase::CommandCode)),
            }
        }
    };
}

mocktpm_command!(
    ContextLoad => (0, mocktpm_context_load),
    ContextSave => (0, mocktpm_context_save),
    Create => (1, mocktpm_create),
    CreatePrimary => (1, mocktpm_create_primary),
    EvictControl => (1, mocktpm_evict_control),
    FlushContext => (0, mocktpm_flush_context),
    Load => (1, mocktpm_load),
    LoadExternal => (0, mocktpm_load_external),
    NvReadPublic => (0, mocktpm_nv_read_public),
    PcrRead => (0, mocktpm_pcr_read),
    PolicyAuthValue => (0, mocktpm_policy_auth_value),
    PolicyCommandCode => (0, mocktpm_policy_command_code),
    PolicyGetDigest => (0, mocktpm_policy_get_digest),
    PolicyNv => (1, mocktpm_policy_nv),
    PolicyOr => (0, mocktpm_policy_or),
    PolicyPassword => (0, mocktpm_policy_password),
    PolicyPcr => (0, mocktpm_policy_pcr),
    PolicyRestart => (0, mocktpm_policy_restart),
    PolicySecret => (1, mocktpm_policy_secret),
    PolicySigned => (0, mocktpm_policy_signed),
    PolicyTicket => (0, mocktpm_policy_ticket),
    ReadPublic => (0, mocktpm_read_public),
    Shutdown => (0, mocktpm_shutdown),
    StartAuthSession => (0, mocktpm_start_auth_session),
    Startup => (0, mocktpm_startup),
    Unseal => (1, mocktpm_unseal),
);

fn mocktpm_encode(
    body: &TpmResponseBody,
    auth_responses: &TpmAuthResponses,
) -> Result<Vec<u8>, TpmRc> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        body.build(&mut writer, rc(TpmRcBase::Success), auth_responses)?;
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

fn mocktpm_build_response(
    result: Result<(TpmResponseBody, TpmAuthResponses), TpmRc>,
) -> Result<Vec<u8>, TpmRc> {
    match result {
        Ok((body, auth_responses)) => mocktpm_encode(&body, &auth_responses),
        Err(code) => {
            let mut buf = [0u8; TPM_HEADER_SIZE];
            let len = {
                let mut writer = TpmWriter::new(&mut buf);
                tpm_build_response(&TpmFlushContextResponse {}, &[], code, &mut writer)
                    .map_err(TpmErrorKindExt::to_tpm_rc)?;
                writer.len()
            };
            Ok(buf[..len].to_vec())
        }
    }
}

impl MockTpm {
    fn new(nv_indices: Vec<MockNvIndex>) -> Self {
        let mut pcrs = HashMap::new();
        pcrs.insert(TpmAlgId::Sha256, vec![vec![0; 32]; TPM_PCR_COUNT]);
        pcrs.insert(TpmAlgId::Sha1, vec![vec![0; 20]; TPM_PCR_COUNT]);

        Self {
            nv_indices: nv_indices
                .into_iter()
                .map(|index| (index.handle, index))
                .collect(),
            pcrs,
            next_transient_handle: TPM_RH_TRANSIENT_FIRST,
            proof: random_bytes(32),
            ..Default::default()
        }
    }

    fn allocate_transient(&mut self) -> u32 {
        let handle = self.next_transient_handle;
        self.next_transient_handle += 1;
        handle
    }

    fn name_of(&self, handle: u32) -> Result<Vec<u8>, TpmRc> {
        match HandleType::from_handle(handle) {
            Some(HandleType::Transient | HandleType::Persistent) => self
                .objects
                .get(&handle)
                .map(|object| object.name.clone())
                .ok_or(rc(TpmRcBase::Handle)),
            Some(HandleType::NvIndex) => {
                let index = self.nv_indices.get(&handle).ok_or(rc(TpmRcBase::Handle))?;
                crypto_make_nv_name(&index.public).map_err(error_rc)
            }
            _ => Ok(handle.to_be_bytes().to_vec()),
        }
    }

    fn entity(&self, handle: u32) -> Result<MockEntity, TpmRc> {
        match HandleType::from_handle(handle) {
            Some(HandleType::Transient | HandleType::Persistent) => {
                let object = self.objects.get(&handle).ok_or(rc(TpmRcBase::Handle))?;
                Ok(MockEntity {
                    auth_value: object.auth_value.clone(),
                    auth_policy: object.public.auth_policy.to_vec(),
                    user_with_auth: object
                        .public
                        .object_attributes
                        .contains(TpmaObject::USER_WITH_AUTH),
                })
            }
            Some(HandleType::NvIndex) => {
                let index = self.nv_indices.get(&handle).ok_or(rc(TpmRcBase::Handle))?;
                Ok(MockEntity {
                    auth_value: Vec::new(),
                    auth_policy: index.public.auth_policy.to_vec(),
                    user_with_auth: true,
                })
            }
            _ => Ok(MockEntity {
                user_with_auth: true,
                ..MockEntity::default()
            }),
        }
    }

    fn session(&self, handle: u32) -> Result<&MockSession, TpmRc> {
        self.sessions
            .get(&normalize_session_handle(handle))
            .filter(|session| !session.saved)
            .ok_or(rc(TpmRcBase::Handle))
    }

    fn policy_session_mut(&mut self, handle: u32) -> Result<&mut MockSession, TpmRc> {
        let session = self
            .sessions
            .get_mut(&normalize_session_handle(handle))
            .filter(|session| !session.saved)
            .ok_or(rc(TpmRcBase::Handle))?;
        if session.session_type == TpmSe::Hmac {
            return Err(rc(TpmRcBase::Type));
        }
        Ok(session)
    }

    fn authorize(
        &self,
        call: &MockCall<'_>,
        auth: &TpmsAuthCommand,
        entity: &MockEntity,
        names: &[Vec<u8>],
        index: usize,
    ) -> Result<(), TpmRc> {
        if auth.session_handle.0 == TpmRh::Pw as u32 {
            if !entity.user_with_auth {
                return Err(rc(TpmRcBase::AuthUnavailable));
            }
            return if auth.hmac[..] == entity.auth_value[..] {
                Ok(())
            } else {
                Err(rc(TpmRcBase::BadAuth))
            };
        }

        let session = self.session(auth.session_handle.0)?;
        match session.session_type {
            TpmSe::Trial => return Err(rc(TpmRcBase::AuthType)),
            TpmSe::Policy => {
                if session.policy_digest != entity.auth_policy {
                    return Err(rc(TpmRcBase::PolicyFail));
                }
                if session
                    .command_code
                    .is_some_and(|code| code != call.cc as u32)
                {
                    return Err(rc(TpmRcBase::PolicyCc));
                }
                if session.policy_hmac_type == PolicyHmacType::Password {
                    return if auth.hmac[..] == entity.auth_value[..] {
                        Ok(())
                    } else {
                        Err(rc(TpmRcBase::BadAuth))
                    };
                }
            }
            TpmSe::Hmac => {
                if !entity.user_with_auth {
                    return Err(rc(TpmRcBase::AuthUnavailable));
                }
            }
        }
        if auth.nonce.len() != session.nonce_tpm.len() {
            return Err(rc(TpmRcBase::Size));
        }
        let name_refs: Vec<&[u8]> = names.iter().map(Vec::as_slice).collect();
        let cp = cp_hash(session.hash_alg, call.cc, &name_refs, &call.parameters)
            .map_err(error_rc)?;
        let key = session.hmac_key(&names[index], &entity.auth_value);
        let expected = crypto_hmac(
            session.hash_alg,
            &key,
            &[
                &cp,
                &auth.nonce,
                &session.nonce_tpm,
                &[auth.session_attributes.bits()],
            ],
        )
        .map_err(error_rc)?;
        if expected[..] == auth.hmac[..] {
            Ok(())
        } else {
            Err(rc(TpmRcBase::AuthFail))
        }
    }

    fn respond(
        &mut self,
        call: &MockCall<'_>,
        entities: &[MockEntity],
        names: &[Vec<u8>],
        parameters: &[u8],
    ) -> Result<TpmAuthResponses, TpmRc> {
        let mut responses = TpmAuthResponses::default();
        let mut exclusive = None;
        for (index, auth) in call.sessions.iter().enumerate() {
            let response = if auth.session_handle.0 == TpmRh::Pw as u32 {
                TpmsAuthResponse {
                    nonce: Default::default(),
                    session_attributes: TpmaSession::CONTINUE_SESSION,
                    hmac: Default::default(),
                }
            } else {
                let key = normalize_session_handle(auth.session_handle.0);
                let requested = auth.session_attributes;
                let mut attributes = requested;
                attributes.remove(TpmaSession::AUDIT_EXCLUSIVE | TpmaSession::AUDIT_RESET);
                if requested.contains(TpmaSession::AUDIT)
                    && (requested.contains(TpmaSession::AUDIT_RESET)
                        || self.exclusive == Some(key))
                {
                    exclusive = Some(key);
                    attributes |= TpmaSession::AUDIT_EXCLUSIVE;
                }

                let session = self.sessions.get_mut(&key).ok_or(rc(TpmRcBase::Handle))?;
                let nonce = random_bytes(session.nonce_tpm.len());
                session.nonce_tpm.clone_from(&nonce);
                let hmac = if session.session_type == TpmSe::Policy
                    && session.policy_hmac_type == PolicyHmacType::Password
                {
                    Vec::new()
                } else {
                    let rp = rp_hash(session.hash_alg, 0, call.cc, parameters).map_err(error_rc)?;
                    let hmac_key = session.hmac_key(&names[index], &entities[index].auth_value);
                    crypto_hmac(
                        session.hash_alg,
                        &hmac_key,
                        &[&rp, &nonce, &auth.nonce, &[attributes.bits()]],
                    )
                    .map_err(error_rc)?
                };
                if session.session_type == TpmSe::Policy {
                    session.reset();
                }
                if !requested.contains(TpmaSession::CONTINUE_SESSION) {
                    self.sessions.remove(&key);
                }
                TpmsAuthResponse {
                    nonce: nonce.as_slice().try_into().map_err(TpmErrorKindExt::to_tpm_rc)?,
                    session_attributes: attributes,
                    hmac: hmac.as_slice().try_into().map_err(TpmErrorKindExt::to_tpm_rc)?,
                }
            };
            responses
                .try_push(response)
                .map_err(|_| rc(TpmRcBase::Memory))?;
        }
        if !call.sessions.is_empty() {
            self.exclusive = exclusive;
        }
        Ok(responses)
    }

    fn run(&mut self, request: &[u8]) -> Result<(TpmResponseBody, TpmAuthResponses), TpmRc> {
        let code = read_u32(request, 6).ok_or(rc(TpmRcBase::Size))?;
        let cc = TpmCc::try_from(code).map_err(|_| rc(TpmRcBase::CommandCode))?;
        let auth_count = mocktpm_auth_count(cc).ok_or(rc(TpmRcBase::CommandCode))?;
        let tag = request.get(0..2).map(|t| u16::from_be_bytes([t[0], t[1]]));
        if auth_count > 0 && tag != Some(TpmSt::Sessions as u16) {
            return Err(rc(TpmRcBase::AuthMissing));
        }
        debug!("mocktpm: {cc:?}");

        // The typed form of TPM2_PolicyCommandCode only carries known codes.
        let mut typed = request.to_vec();
        if cc == TpmCc::PolicyCommandCode {
            patch_last_u32(&mut typed, TpmCc::PolicyCommandCode as u32)
                .map_err(|_| rc(TpmRcBase::Size))?;
        }
        let (handles, body, sessions) =
            tpm_parse_command(&typed).map_err(TpmErrorKindExt::to_tpm_rc)?;
        let handles: Vec<u32> = handles.iter().copied().collect();
        let sessions: Vec<TpmsAuthCommand> = sessions.iter().cloned().collect();
        if sessions.len() != auth_count {
            return Err(rc(TpmRcBase::AuthMissing));
        }
        let call = MockCall {
            cc,
            request,
            parameters: command_parameters(request, handles.len())
                .map_err(|_| rc(TpmRcBase::Size))?,
            handles,
            sessions,
        };

        let names = if call.sessions.is_empty() {
            Vec::new()
        } else {
            call.handles
                .iter()
                .map(|&handle| self.name_of(handle))
                .collect::<Result<Vec<_>, _>>()?
        };
        let entities = call
            .handles
            .get(..auth_count)
            .ok_or(rc(TpmRcBase::AuthMissing))?
            .iter()
            .map(|&handle| self.entity(handle))
            .collect::<Result<Vec<_>, _>>()?;
        for (index, (auth, entity)) in call.sessions.iter().zip(&entities).enumerate() {
            self.authorize(&call, auth, entity, &names, index)?;
        }

        let body = mocktpm_dispatch(self, &body, &call)?;
        let plain = mocktpm_encode(&body, &TpmAuthResponses::default())?;
        let parameters = response_parameters(cc, &plain).map_err(|_| rc(TpmRcBase::Failure))?;
        let auth_responses = self.respond(&call, &entities, &names, &parameters)?;
        Ok((body, auth_responses))
    }

    fn execute(&mut self, request: &[u8]) -> Vec<u8> {
        let result = self.run(request);
        if let Err(code) = &result {
            debug!("mocktpm: {code}");
        }
        mocktpm_build_response(result).unwrap_or_else(|e| {
            error!("mocktpm: {e}");
            mocktpm_build_response(Err(rc(TpmRcBase::Failure))).unwrap_or_default()
        })
    }

    fn ticket_digest(
        &self,
        tag: TpmSt,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
    ) -> Result<Vec<u8>, TpmRc> {
        crypto_hmac(
            TpmAlgId::Sha256,
            &self.proof,
            &[
                &(tag as u16).to_be_bytes(),
                timeout,
                cp_hash_a,
                policy_ref,
                auth_name,
            ],
        )
        .map_err(error_rc)
    }

    /// The shared part of `PolicySecret` and `PolicySigned`: updates the
    /// policy digest and issues the ticket requested by `expiration`.
    #[allow(clippy::too_many_arguments)]
    fn policy_authorize(
        &mut self,
        session: u32,
        tag: TpmSt,
        cc: TpmCc,
        nonce_tpm: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth_name: &[u8],
    ) -> Result<(Vec<u8>, TpmtTkAuth), TpmRc> {
        if policy_ref.len() > TPM_MAX_DIGEST_SIZE {
            return Err(rc(TpmRcBase::Size));
        }
        let clock = self.clock;
        let session_state = self.policy_session_mut(session)?;
        if !nonce_tpm.is_empty() && nonce_tpm != session_state.nonce_tpm {
            return Err(rc(TpmRcBase::Nonce));
        }
        if !cp_hash_a.is_empty() && cp_hash_a.len() != session_state.policy_digest.len() {
            return Err(rc(TpmRcBase::Size));
        }
        session_state.policy_update(cc, auth_name, policy_ref)?;

        match ticket_lifetime(expiration) {
            Some(lifetime) => {
                let timeout = (clock + lifetime).to_be_bytes().to_vec();
                let digest = self.ticket_digest(tag, &timeout, cp_hash_a, policy_ref, auth_name)?;
                let ticket = TpmtTkAuth {
                    tag,
                    hierarchy: TpmRh::Owner,
                    digest: Tpm2bDigest::try_from(digest.as_slice())
                        .map_err(TpmErrorKindExt::to_tpm_rc)?,
                };
                Ok((timeout, ticket))
            }
            None => {
                let ticket = TpmtTkAuth {
                    tag,
                    hierarchy: TpmRh::Null,
                    digest: Tpm2bDigest::default(),
                };
                Ok((Vec::new(), ticket))
            }
        }
    }

    /// Derives the keys that protect private areas under `parent_name`.
    fn private_keys(&self, parent_name: &[u8], name: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TpmRc> {
        let sym_key = crypto_kdfa(
            TpmAlgId::Sha256,
            &self.proof,
            KDF_LABEL_STORAGE,
            name,
            parent_name,
            128,
        )
        .map_err(error_rc)?;
        let hmac_key = crypto_kdfa(
            TpmAlgId::Sha256,
            &self.proof,
            KDF_LABEL_INTEGRITY,
            parent_name,
            &[],
            256,
        )
        .map_err(error_rc)?;
        Ok((sym_key, hmac_key))
    }

    /// Produces `integrity || encrypted(authValue || data)`, where both
    /// fields are prefixed with a 16-bit size.
    fn wrap_private(
        &self,
        parent_name: &[u8],
        name: &[u8],
        auth_value: &[u8],
        data: &[u8],
    ) -> Result<Tpm2bPrivate, TpmRc> {
        let mut sensitive = Vec::new();
        for field in [auth_value, data] {
            let size = u16::try_from(field.len()).map_err(|_| rc(TpmRcBase::Size))?;
            sensitive.extend_from_slice(&size.to_be_bytes());
            sensitive.extend_from_slice(field);
        }
        let (sym_key, hmac_key) = self.private_keys(parent_name, name)?;
        crypto_aes_cfb(&sym_key, &[0; 16], &mut sensitive, true).map_err(error_rc)?;
        let integrity =
            crypto_hmac(TpmAlgId::Sha256, &hmac_key, &[&sensitive, name]).map_err(error_rc)?;
        let mut blob = integrity;
        blob.extend_from_slice(&sensitive);
        Tpm2bPrivate::try_from(blob.as_slice()).map_err(TpmErrorKindExt::to_tpm_rc)
    }

    fn unwrap_private(
        &self,
        parent_name: &[u8],
        name: &[u8],
        private: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), TpmRc> {
        if private.len() < 32 {
            return Err(rc(TpmRcBase::Size));
        }
        let (integrity, encrypted) = private.split_at(32);
        let (sym_key, hmac_key) = self.private_keys(parent_name, name)?;
        let expected =
            crypto_hmac(TpmAlgId::Sha256, &hmac_key, &[encrypted, name]).map_err(error_rc)?;
        if expected != integrity {
            return Err(rc(TpmRcBase::Integrity));
        }
        let mut sensitive = encrypted.to_vec();
        crypto_aes_cfb(&sym_key, &[0; 16], &mut sensitive, false).map_err(error_rc)?;

        let mut fields = Vec::with_capacity(2);
        let mut rest = sensitive.as_slice();
        for _ in 0..2 {
            let size = rest
                .get(0..2)
                .map(|s| usize::from(u16::from_be_bytes([s[0], s[1]])))
                .ok_or(rc(TpmRcBase::Size))?;
            let field = rest.get(2..2 + size).ok_or(rc(TpmRcBase::Size))?;
            fields.push(field.to_vec());
            rest = &rest[2 + size..];
        }
        let data = fields.pop().unwrap_or_default();
        let auth_value = fields.pop().unwrap_or_default();
        Ok((auth_value, data))
    }
}

/// Starts the simulator on a thread and returns the client end of its
/// transport. The thread exits when the client is dropped.
#[must_use]
pub fn start(nv_indices: Vec<MockNvIndex>) -> (JoinHandle<()>, PipeTransport) {
    let (client, server) = PipeTransport::pair();
    let handle = std::thread::spawn(move || {
        let mut tpm = MockTpm::new(nv_indices);
        mocktpm_run(server, &mut tpm);
    });
    (handle, client)
}

fn mocktpm_run(mut stream: PipeTransport, tpm: &mut MockTpm) {
    loop {
        let command = match read_message(&mut stream) {
            Ok(command) => command,
            Err(TpmError::Io(_)) => break,
            Err(e) => {
                error!("mocktpm: {e}");
                break;
            }
        };
        let response = tpm.execute(&command);
        if stream.write_all(&response).is_err() || stream.flush().is_err() {
            error!("mocktpm: no response");
            break;
        }
    }
}

fn mocktpm_startup(
    tpm: &mut MockTpm,
    _cmd: &TpmStartupCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    tpm.objects
        .retain(|&handle, _| HandleType::from_handle(handle) == Some(HandleType::Persistent));
    tpm.sessions.clear();
    tpm.saved.clear();
    tpm.exclusive = None;
    Ok(TpmResponseBody::Startup(TpmStartupResponse {}))
}

fn mocktpm_shutdown(
    _tpm: &mut MockTpm,
    _cmd: &TpmShutdownCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    Ok(TpmResponseBody::Shutdown(TpmShutdownResponse {}))
}

fn mocktpm_start_auth_session(
    tpm: &mut MockTpm,
    cmd: &TpmStartAuthSessionCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    if cmd.tpm_key.0 != TpmRh::Null as u32 || !cmd.encrypted_salt.is_empty() {
        return Err(rc(TpmRcBase::Value));
    }
    SessionCipher::from_sym_def(&cmd.symmetric).map_err(|_| rc(TpmRcBase::Symmetric))?;
    let hash_alg = cmd.auth_hash;
    let size = tpm_hash_size(&hash_alg).ok_or(rc(TpmRcBase::Hash))?;
    if cmd.nonce_caller.len() != size {
        return Err(rc(TpmRcBase::Size));
    }
    let bind = cmd.bind.0;
    let (bound_entity, bind_auth) = if bind == TpmRh::Null as u32 {
        (Vec::new(), Vec::new())
    } else {
        (tpm.name_of(bind)?, tpm.entity(bind)?.auth_value)
    };

    let nonce_tpm = random_bytes(size);
    let session_key =
        derive_session_key(hash_alg, &bind_auth, &[], &nonce_tpm, &cmd.nonce_caller)
            .map_err(error_rc)?;
    let base = if cmd.session_type == TpmSe::Hmac {
        TPM_RH_HMAC_SESSION_FIRST
    } else {
        TPM_RH_POLICY_SESSION_FIRST
    };
    let handle = base + tpm.next_session_index;
    tpm.next_session_index += 1;
    tpm.sessions.insert(
        normalize_session_handle(handle),
        MockSession {
            session_type: cmd.session_type,
            hash_alg,
            session_key,
            bound_entity,
            nonce_tpm: nonce_tpm.clone(),
            policy_digest: vec![0; size],
            policy_hmac_type: PolicyHmacType::NoAuth,
            command_code: None,
            saved: false,
        },
    );

    Ok(TpmResponseBody::StartAuthSession(
        TpmStartAuthSessionResponse {
            session_handle: TpmSession(handle),
            nonce_tpm: nonce_tpm
                .as_slice()
                .try_into()
                .map_err(TpmErrorKindExt::to_tpm_rc)?,
        },
    ))
}

/// Sets the unique field of a keyed hash public area from its seed and
/// sensitive data, and returns the name.
fn mocktpm_keyed_hash_unique(
    public: &mut TpmtPublic,
    seed: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, TpmRc> {
    if public.object_type != TpmAlgId::KeyedHash {
        return Err(rc(TpmRcBase::Type));
    }
    let unique = hash_parts(public.name_alg, &[seed, data]).map_err(error_rc)?;
    public.unique = TpmuPublicId::KeyedHash(
        unique
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    );
    crypto_make_name(public).map_err(error_rc)
}

fn mocktpm_create_primary(
    tpm: &mut MockTpm,
    cmd: &TpmCreatePrimaryCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let hierarchy = cmd.primary_handle.0;
    if ![TpmRh::Owner, TpmRh::Endorsement, TpmRh::Platform]
        .into_iter()
        .any(|rh| rh as u32 == hierarchy)
    {
        return Err(rc(TpmRcBase::Hierarchy));
    }
    let sensitive = &cmd.in_sensitive.inner;
    let mut public = cmd.in_public.inner.clone();
    let name = mocktpm_keyed_hash_unique(&mut public, &hierarchy.to_be_bytes(), &sensitive.data)?;

    let handle = tpm.allocate_transient();
    tpm.objects.insert(
        handle,
        MockObject {
            public: public.clone(),
            name: name.clone(),
            auth_value: sensitive.user_auth.to_vec(),
            sensitive: sensitive.data.to_vec(),
        },
    );
    Ok(TpmResponseBody::CreatePrimary(TpmCreatePrimaryResponse {
        object_handle: TpmTransient(handle),
        out_public: Tpm2bPublic { inner: public },
        creation_data: Default::default(),
        creation_hash: Default::default(),
        creation_ticket: Default::default(),
        name: name
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}

fn mocktpm_create(
    tpm: &mut MockTpm,
    cmd: &TpmCreateCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let parent_name = tpm
        .objects
        .get(&cmd.parent_handle.0)
        .map(|parent| parent.name.clone())
        .ok_or(rc(TpmRcBase::Handle))?;
    let sensitive = &cmd.in_sensitive.inner;
    let mut public = cmd.in_public.inner.clone();
    let seed_size = tpm_hash_size(&public.name_alg).ok_or(rc(TpmRcBase::Hash))?;
    let name = mocktpm_keyed_hash_unique(&mut public, &random_bytes(seed_size), &sensitive.data)?;
    let out_private =
        tpm.wrap_private(&parent_name, &name, &sensitive.user_auth, &sensitive.data)?;

    Ok(TpmResponseBody::Create(TpmCreateResponse {
        out_private,
        out_public: Tpm2bPublic { inner: public },
        creation_data: Default::default(),
        creation_hash: Default::default(),
        creation_ticket: Default::default(),
    }))
}

fn mocktpm_load(tpm: &mut MockTpm, cmd: &TpmLoadCommand, _call: &MockCall<'_>) -> MockTpmResult {
    let parent_name = tpm
        .objects
        .get(&cmd.parent_handle.0)
        .map(|parent| parent.name.clone())
        .ok_or(rc(TpmRcBase::Handle))?;
    let public = cmd.in_public.inner.clone();
    let name = crypto_make_name(&public).map_err(error_rc)?;
    let (auth_value, data) = tpm.unwrap_private(&parent_name, &name, &cmd.in_private)?;

    let handle = tpm.allocate_transient();
    tpm.objects.insert(
        handle,
        MockObject {
            public,
            name: name.clone(),
            auth_value,
            sensitive: data,
        },
    );
    Ok(TpmResponseBody::Load(TpmLoadResponse {
        object_handle: TpmTransient(handle),
        name: name
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}

fn mocktpm_load_external(
    tpm: &mut MockTpm,
    cmd: &TpmLoadExternalCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    if cmd.hierarchy != TpmRh::Null {
        return Err(rc(TpmRcBase::Hierarchy));
    }
    let public = cmd.in_public.inner.clone();
    let sensitive = &cmd.in_private.inner;
    if public.object_type != TpmAlgId::KeyedHash || sensitive.sensitive_type != public.object_type
    {
        return Err(rc(TpmRcBase::Type));
    }
    let TpmuSensitiveComposite::Bits(data) = &sensitive.sensitive else {
        return Err(rc(TpmRcBase::Type));
    };
    let mut expected = public.clone();
    let name = mocktpm_keyed_hash_unique(&mut expected, &sensitive.seed_value, data)?;
    if crypto_make_name(&public).map_err(error_rc)? != name {
        return Err(rc(TpmRcBase::Binding));
    }

    let handle = tpm.allocate_transient();
    tpm.objects.insert(
        handle,
        MockObject {
            public,
            name: name.clone(),
            auth_value: sensitive.auth_value.to_vec(),
            sensitive: data.to_vec(),
        },
    );
    Ok(TpmResponseBody::LoadExternal(TpmLoadExternalResponse {
        object_handle: TpmTransient(handle),
        name: name
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}

fn mocktpm_read_public(
    tpm: &mut MockTpm,
    cmd: &TpmReadPublicCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let object = tpm
        .objects
        .get(&cmd.object_handle.0)
        .ok_or(rc(TpmRcBase::Handle))?;
    let name = object
        .name
        .as_slice()
        .try_into()
        .map_err(TpmErrorKindExt::to_tpm_rc)?;
    Ok(TpmResponseBody::ReadPublic(TpmReadPublicResponse {
        out_public: Tpm2bPublic {
            inner: object.public.clone(),
        },
        name,
        qualified_name: name,
    }))
}

fn mocktpm_nv_read_public(
    tpm: &mut MockTpm,
    cmd: &TpmNvReadPublicCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let index = tpm
        .nv_indices
        .get(&cmd.nv_index.0)
        .ok_or(rc(TpmRcBase::Handle))?;
    let name = crypto_make_nv_name(&index.public).map_err(error_rc)?;
    Ok(TpmResponseBody::NvReadPublic(TpmNvReadPublicResponse {
        nv_public: Tpm2bNvPublic {
            inner: index.public.clone(),
        },
        nv_name: name
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}

fn mocktpm_pcr_values(
    tpm: &MockTpm,
    selection: &TpmlPcrSelection,
) -> Result<Vec<Vec<u8>>, TpmRc> {
    pcr_selected(selection)
        .into_iter()
        .map(|(bank, index)| {
            tpm.pcrs
                .get(&bank)
                .and_then(|values| values.get(index as usize))
                .cloned()
                .ok_or(rc(TpmRcBase::Value))
        })
        .collect()
}

fn mocktpm_pcr_read(
    tpm: &mut MockTpm,
    cmd: &TpmPcrReadCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let values = mocktpm_pcr_values(tpm, &cmd.pcr_selection_in)?;
    let mut pcr_values = TpmlDigest::new();
    for value in values {
        let digest =
            Tpm2bDigest::try_from(value.as_slice()).map_err(TpmErrorKindExt::to_tpm_rc)?;
        pcr_values
            .try_push(digest)
            .map_err(|_| rc(TpmRcBase::Memory))?;
    }
    Ok(TpmResponseBody::PcrRead(TpmPcrReadResponse {
        pcr_update_counter: 0,
        pcr_selection_out: cmd.pcr_selection_in,
        pcr_values,
    }))
}

fn mocktpm_context_save(
    tpm: &mut MockTpm,
    cmd: &TpmContextSaveCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let handle = cmd.save_handle.0;
    let (saved, hierarchy) = match HandleType::from_handle(handle) {
        Some(HandleType::HmacSession | HandleType::PolicySession) => {
            let key = normalize_session_handle(handle);
            let session = tpm
                .sessions
                .get_mut(&key)
                .filter(|session| !session.saved)
                .ok_or(rc(TpmRcBase::Handle))?;
            session.saved = true;
            (MockSaved::Session(key), TpmRh::Null)
        }
        Some(HandleType::Transient) => {
            let object = tpm.objects.get(&handle).ok_or(rc(TpmRcBase::Handle))?;
            (MockSaved::Object(object.clone()), TpmRh::Owner)
        }
        _ => return Err(rc(TpmRcBase::Handle)),
    };
    tpm.sequence += 1;
    let sequence = tpm.sequence;
    let blob = crypto_hmac(
        TpmAlgId::Sha256,
        &tpm.proof,
        &[&sequence.to_be_bytes(), &handle.to_be_bytes()],
    )
    .map_err(error_rc)?;
    tpm.saved.insert(sequence, saved);

    Ok(TpmResponseBody::ContextSave(TpmContextSaveResponse {
        context: TpmsContext {
            sequence,
            saved_handle: TpmTransient(handle),
            hierarchy,
            context_blob: blob
                .as_slice()
                .try_into()
                .map_err(TpmErrorKindExt::to_tpm_rc)?,
        },
    }))
}

fn mocktpm_context_load(
    tpm: &mut MockTpm,
    cmd: &TpmContextLoadCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let context = &cmd.context;
    let saved_handle = context.saved_handle.0;
    let expected = crypto_hmac(
        TpmAlgId::Sha256,
        &tpm.proof,
        &[&context.sequence.to_be_bytes(), &saved_handle.to_be_bytes()],
    )
    .map_err(error_rc)?;
    if expected[..] != context.context_blob[..] {
        return Err(rc(TpmRcBase::Integrity));
    }

    let loaded = match tpm.saved.get(&context.sequence).cloned() {
        Some(MockSaved::Session(key)) => {
            tpm.saved.remove(&context.sequence);
            let session = tpm.sessions.get_mut(&key).ok_or(rc(TpmRcBase::Handle))?;
            session.saved = false;
            saved_handle
        }
        Some(MockSaved::Object(object)) => {
            let handle = tpm.allocate_transient();
            tpm.objects.insert(handle, object);
            handle
        }
        None => return Err(rc(TpmRcBase::Handle)),
    };
    Ok(TpmResponseBody::ContextLoad(TpmContextLoadResponse {
        loaded_handle: TpmTransient(loaded),
    }))
}

fn mocktpm_flush_context(
    tpm: &mut MockTpm,
    cmd: &TpmFlushContextCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let handle = cmd.flush_handle.0;
    match HandleType::from_handle(handle) {
        Some(HandleType::Transient) => {
            tpm.objects.remove(&handle).ok_or(rc(TpmRcBase::Handle))?;
        }
        Some(HandleType::HmacSession | HandleType::PolicySession) => {
            let key = normalize_session_handle(handle);
            tpm.sessions.remove(&key).ok_or(rc(TpmRcBase::Handle))?;
            tpm.saved
                .retain(|_, saved| !matches!(saved, MockSaved::Session(k) if *k == key));
            if tpm.exclusive == Some(key) {
                tpm.exclusive = None;
            }
        }
        _ => return Err(rc(TpmRcBase::Handle)),
    }
    Ok(TpmResponseBody::FlushContext(TpmFlushContextResponse {}))
}

fn mocktpm_evict_control(
    tpm: &mut MockTpm,
    cmd: &TpmEvictControlCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let persistent = cmd.persistent_handle.0;
    let object = cmd.object_handle.0;
    if HandleType::from_handle(persistent) != Some(HandleType::Persistent) {
        return Err(rc(TpmRcBase::Range));
    }
    if object == persistent {
        tpm.objects
            .remove(&persistent)
            .ok_or(rc(TpmRcBase::Handle))?;
    } else {
        if HandleType::from_handle(object) != Some(HandleType::Transient) {
            return Err(rc(TpmRcBase::Handle));
        }
        if tpm.objects.contains_key(&persistent) {
            return Err(rc(TpmRcBase::Value));
        }
        let copy = tpm
            .objects
            .get(&object)
            .ok_or(rc(TpmRcBase::Handle))?
            .clone();
        tpm.objects.insert(persistent, copy);
    }
    Ok(TpmResponseBody::EvictControl(TpmEvictControlResponse {}))
}

fn mocktpm_policy_secret(
    tpm: &mut MockTpm,
    cmd: &TpmPolicySecretCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let auth_name = tpm.name_of(cmd.auth_handle.0)?;
    let (timeout, policy_ticket) = tpm.policy_authorize(
        cmd.policy_session.0,
        TpmSt::AuthSecret,
        TpmCc::PolicySecret,
        &cmd.nonce_tpm,
        &cmd.cp_hash_a,
        &cmd.policy_ref,
        cmd.expiration,
        &auth_name,
    )?;
    Ok(TpmResponseBody::PolicySecret(TpmPolicySecretResponse {
        timeout: timeout
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
        policy_ticket,
    }))
}

fn mocktpm_policy_signed(
    tpm: &mut MockTpm,
    cmd: &TpmPolicySignedCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let object = tpm
        .objects
        .get(&cmd.auth_object.0)
        .ok_or(rc(TpmRcBase::Handle))?;
    let (hash_alg, digest) = crypto_signature_hmac(&cmd.auth).ok_or(rc(TpmRcBase::Scheme))?;
    let a_hash = policy_signed_digest(
        hash_alg,
        &cmd.nonce_tpm,
        cmd.expiration,
        &cmd.cp_hash_a,
        &cmd.policy_ref,
    )
    .map_err(error_rc)?;
    let expected = crypto_hmac(hash_alg, &object.sensitive, &[&a_hash]).map_err(error_rc)?;
    if expected != digest {
        return Err(rc(TpmRcBase::Signature));
    }
    let auth_name = object.name.clone();
    let (timeout, policy_ticket) = tpm.policy_authorize(
        cmd.policy_session.0,
        TpmSt::AuthSigned,
        TpmCc::PolicySigned,
        &cmd.nonce_tpm,
        &cmd.cp_hash_a,
        &cmd.policy_ref,
        cmd.expiration,
        &auth_name,
    )?;
    Ok(TpmResponseBody::PolicySigned(TpmPolicySignedResponse {
        timeout: timeout
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
        policy_ticket,
    }))
}

fn mocktpm_policy_ticket(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyTicketCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let ticket = &cmd.ticket;
    let cc = match ticket.tag {
        TpmSt::AuthSecret => TpmCc::PolicySecret,
        TpmSt::AuthSigned => TpmCc::PolicySigned,
        _ => return Err(rc(TpmRcBase::Tag)),
    };
    if ticket.hierarchy == TpmRh::Null {
        return Err(rc(TpmRcBase::Ticket));
    }
    let expected = tpm.ticket_digest(
        ticket.tag,
        &cmd.timeout,
        &cmd.cp_hash_a,
        &cmd.policy_ref,
        &cmd.auth_name,
    )?;
    if expected[..] != ticket.digest[..] {
        return Err(rc(TpmRcBase::Ticket));
    }
    let timeout: [u8; 8] = cmd.timeout[..]
        .try_into()
        .map_err(|_| rc(TpmRcBase::Size))?;
    if tpm.clock > u64::from_be_bytes(timeout) {
        return Err(rc(TpmRcBase::Expired));
    }
    tpm.policy_session_mut(cmd.policy_session.0)?
        .policy_update(cc, &cmd.auth_name, &cmd.policy_ref)?;
    Ok(TpmResponseBody::PolicyTicket(TpmPolicyTicketResponse {}))
}

fn mocktpm_policy_or(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyOrCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let digests: Vec<&[u8]> = cmd.p_hash_list.iter().map(|d| &d[..]).collect();
    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    if !(2..=TPM_POLICY_OR_MAX).contains(&digests.len()) {
        return Err(rc(TpmRcBase::Size));
    }
    if digests
        .iter()
        .any(|digest| digest.len() != session.policy_digest.len())
    {
        return Err(rc(TpmRcBase::Size));
    }
    if session.session_type == TpmSe::Policy
        && !digests.iter().any(|digest| *digest == session.policy_digest)
    {
        return Err(rc(TpmRcBase::Value));
    }
    let concat = digests.concat();
    session.extend(TpmCc::PolicyOr, &[&concat])?;
    Ok(TpmResponseBody::PolicyOr(TpmPolicyOrResponse {}))
}

fn mocktpm_policy_pcr(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyPcrCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let values = mocktpm_pcr_values(tpm, &cmd.pcrs)?;
    let selection = build_to_vec(&cmd.pcrs).map_err(TpmErrorKindExt::to_tpm_rc)?;
    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    let current = session.digest(&values.iter().map(Vec::as_slice).collect::<Vec<_>>())?;
    let pcr_digest = if cmd.pcr_digest.is_empty() {
        current
    } else if session.session_type == TpmSe::Trial || cmd.pcr_digest[..] == current[..] {
        cmd.pcr_digest.to_vec()
    } else {
        return Err(rc(TpmRcBase::Value));
    };
    session.extend(TpmCc::PolicyPcr, &[&selection, &pcr_digest])?;
    Ok(TpmResponseBody::PolicyPcr(TpmPolicyPcrResponse {}))
}

/// Takes the code from the wire, as the typed form only carries known codes.
fn mocktpm_policy_command_code(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyCommandCodeCommand,
    call: &MockCall<'_>,
) -> MockTpmResult {
    let code = call
        .request
        .len()
        .checked_sub(4)
        .and_then(|offset| read_u32(call.request, offset))
        .ok_or(rc(TpmRcBase::Size))?;
    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    if session.command_code.is_some_and(|current| current != code) {
        return Err(rc(TpmRcBase::Value));
    }
    session.extend(TpmCc::PolicyCommandCode, &[&code.to_be_bytes()])?;
    session.command_code = Some(code);
    Ok(TpmResponseBody::PolicyCommandCode(
        TpmPolicyCommandCodeResponse {},
    ))
}

fn mocktpm_policy_auth_value(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyAuthValueCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    session.extend(TpmCc::PolicyAuthValue, &[])?;
    session.policy_hmac_type = PolicyHmacType::Auth;
    Ok(TpmResponseBody::PolicyAuthValue(TpmPolicyAuthValueResponse {}))
}

fn mocktpm_policy_password(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyPasswordCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    session.extend(TpmCc::PolicyPassword, &[])?;
    session.policy_hmac_type = PolicyHmacType::Password;
    Ok(TpmResponseBody::PolicyPassword(TpmPolicyPasswordResponse {}))
}

/// Compares two big-endian operands of equal size.
fn mocktpm_compare(op: NvOperation, a: &[u8], b: &[u8]) -> bool {
    let signed = |x: &[u8]| {
        let mut v = x.to_vec();
        if let Some(first) = v.first_mut() {
            *first ^= 0x80;
        }
        v
    };
    match op {
        NvOperation::Eq => a == b,
        NvOperation::Neq => a != b,
        NvOperation::SignedGt => signed(a) > signed(b),
        NvOperation::UnsignedGt => a > b,
        NvOperation::SignedLt => signed(a) < signed(b),
        NvOperation::UnsignedLt => a < b,
        NvOperation::SignedGe => signed(a) >= signed(b),
        NvOperation::UnsignedGe => a >= b,
        NvOperation::SignedLe => signed(a) <= signed(b),
        NvOperation::UnsignedLe => a <= b,
        NvOperation::BitSet => a.iter().zip(b).all(|(x, y)| x & y == *y),
        NvOperation::BitClear => a.iter().zip(b).all(|(x, y)| x & y == 0),
    }
}

fn mocktpm_policy_nv(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyNvCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let op = NvOperation::try_from(cmd.operation as u16).map_err(|_| rc(TpmRcBase::Value))?;
    let nv_index = cmd.nv_index.0;
    let index = tpm.nv_indices.get(&nv_index).ok_or(rc(TpmRcBase::Handle))?;
    let operand_b = &cmd.operand_b[..];
    let start = usize::from(cmd.offset);
    let operand_a = index
        .data
        .get(start..start + operand_b.len())
        .ok_or(rc(TpmRcBase::NvRange))?;
    if !mocktpm_compare(op, operand_a, operand_b) {
        return Err(rc(TpmRcBase::Policy));
    }
    let index_name = tpm.name_of(nv_index)?;

    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    let args = session.digest(&[
        operand_b,
        &cmd.offset.to_be_bytes(),
        &u16::from(op).to_be_bytes(),
    ])?;
    session.extend(TpmCc::PolicyNv, &[&args, &index_name])?;
    Ok(TpmResponseBody::PolicyNv(TpmPolicyNvResponse {}))
}

fn mocktpm_policy_get_digest(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyGetDigestCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let session = tpm.policy_session_mut(cmd.policy_session.0)?;
    Ok(TpmResponseBody::PolicyGetDigest(TpmPolicyGetDigestResponse {
        policy_digest: Tpm2bDigest::try_from(session.policy_digest.as_slice())
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}

fn mocktpm_policy_restart(
    tpm: &mut MockTpm,
    cmd: &TpmPolicyRestartCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    tpm.policy_session_mut(cmd.session_handle.0)?.reset();
    Ok(TpmResponseBody::PolicyRestart(TpmPolicyRestartResponse {}))
}

fn mocktpm_unseal(
    tpm: &mut MockTpm,
    cmd: &TpmUnsealCommand,
    _call: &MockCall<'_>,
) -> MockTpmResult {
    let object = tpm
        .objects
        .get(&cmd.item_handle.0)
        .ok_or(rc(TpmRcBase::Handle))?;
    if object.public.object_type != TpmAlgId::KeyedHash
        || object
            .public
            .object_attributes
            .contains(TpmaObject::SIGN_ENCRYPT)
    {
        return Err(rc(TpmRcBase::Type));
    }
    Ok(TpmResponseBody::Unseal(TpmUnsealResponse {
        out_data: object
            .sensitive
            .as_slice()
            .try_into()
            .map_err(TpmErrorKindExt::to_tpm_rc)?,
    }))
}
