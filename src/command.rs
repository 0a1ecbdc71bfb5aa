// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2024-2025 Jarkko Sakkinen
// Copyright (c) 2025 Opinsys Oy

//! The TPM facade: commands that keep host-side state in sync with the TPM.

use crate::{
    context::{unwrap_context, wrap_context, RestoredContext},
    crypto::{crypto_make_name, crypto_make_nv_name},
    device::{build_command, command_parameters, patch_last_u32, TpmDevice, TpmResponse},
    error::TpmError,
    parser::{NvOperation, PolicyExpr},
    pcr::{pcr_composite_digest, pcr_selected, pcr_selection_vec_from_str, pcr_selection_vec_to_tpml},
    policy::{expr_name, TrialPolicy},
    resource::{normalize_session_handle, HandleType, ObjectContext, ResourceContext, ResourceRegistry},
    session::{
        check_ticket_reply, cp_hash, rp_hash, validate_policy_ticket, PolicyHmacType,
        SessionCipher, SessionContext,
    },
};
use log::debug;
use rand::{thread_rng, RngCore};
use tpm2_protocol::{
    data::{
        Tpm2bAuth, Tpm2bData, Tpm2bDigest, Tpm2bNonce, Tpm2bPrivate, Tpm2bPublic,
        Tpm2bSensitive, Tpm2bSensitiveCreate, TpmAlgId, TpmCc, TpmEo, TpmRh, TpmSe, TpmSu,
        TpmaObject, TpmaSession, TpmlDigest, TpmlPcrSelection, TpmsAuthCommand, TpmsContext,
        TpmsKeyedhashParms, TpmsNvPublic, TpmsSensitiveCreate, TpmtPublic, TpmtScheme,
        TpmtSensitive, TpmtSignature, TpmtTkAuth, TpmuPublicId, TpmuPublicParms,
    },
    message::{
        TpmContextLoadCommand, TpmContextSaveCommand, TpmCreateCommand, TpmCreatePrimaryCommand,
        TpmEvictControlCommand, TpmFlushContextCommand, TpmHeader, TpmLoadCommand,
        TpmLoadExternalCommand, TpmNvReadPublicCommand, TpmPcrReadCommand,
        TpmPolicyAuthValueCommand, TpmPolicyCommandCodeCommand, TpmPolicyGetDigestCommand,
        TpmPolicyNvCommand, TpmPolicyOrCommand, TpmPolicyPasswordCommand, TpmPolicyPcrCommand,
        TpmPolicyRestartCommand, TpmPolicySecretCommand, TpmPolicySignedCommand,
        TpmPolicyTicketCommand, TpmReadPublicCommand, TpmShutdownCommand,
        TpmStartAuthSessionCommand, TpmStartupCommand, TpmUnsealCommand,
    },
    tpm_hash_size, TpmBuffer, TpmPersistent, TpmSession,
};

/// How an authorized handle of a command is authorized.
#[derive(Debug, Clone, Copy)]
pub enum Authorization<'a> {
    /// A password session with the plaintext authorization value.
    Password(&'a [u8]),
    /// A started HMAC or policy session.
    Session {
        handle: u32,
        auth_value: &'a [u8],
        attributes: TpmaSession,
    },
}

impl<'a> Authorization<'a> {
    /// A policy or HMAC session that stays open after the command.
    #[must_use]
    pub fn session(handle: u32, auth_value: &'a [u8]) -> Self {
        Self::Session {
            handle,
            auth_value,
            attributes: TpmaSession::CONTINUE_SESSION,
        }
    }

    fn auth_value(&self) -> &'a [u8] {
        match *self {
            Self::Password(value) => value,
            Self::Session { auth_value, .. } => auth_value,
        }
    }
}

fn keyed_hash_template(
    name_alg: TpmAlgId,
    object_attributes: TpmaObject,
    auth_policy: &[u8],
) -> Result<TpmtPublic, TpmError> {
    if tpm_hash_size(&name_alg).is_none() {
        return Err(TpmError::UnsupportedAlgorithm(name_alg));
    }
    Ok(TpmtPublic {
        object_type: TpmAlgId::KeyedHash,
        name_alg,
        object_attributes,
        auth_policy: Tpm2bDigest::try_from(auth_policy)?,
        parameters: TpmuPublicParms::KeyedHash(TpmsKeyedhashParms {
            scheme: TpmtScheme {
                scheme: TpmAlgId::Null,
            },
        }),
        unique: TpmuPublicId::KeyedHash(TpmBuffer::default()),
    })
}

/// Template of a sealed data object, which can be unsealed with its
/// authorization value or with a session satisfying `auth_policy`.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unknown hash and
/// `TpmError::Marshal` if `auth_policy` is too large.
pub fn sealed_data_template(name_alg: TpmAlgId, auth_policy: &[u8]) -> Result<TpmtPublic, TpmError> {
    keyed_hash_template(
        name_alg,
        TpmaObject::FIXED_TPM | TpmaObject::FIXED_PARENT | TpmaObject::USER_WITH_AUTH,
        auth_policy,
    )
}

/// Template of an HMAC key, as used to authorize `TPM2_PolicySigned`.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unknown hash and
/// `TpmError::Marshal` if `auth_policy` is too large.
pub fn hmac_key_template(name_alg: TpmAlgId, auth_policy: &[u8]) -> Result<TpmtPublic, TpmError> {
    keyed_hash_template(
        name_alg,
        TpmaObject::FIXED_TPM
            | TpmaObject::FIXED_PARENT
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::SIGN_ENCRYPT,
        auth_policy,
    )
}

/// Checks the `timeout` and `policyTicket` of a `PolicySecret` or
/// `PolicySigned` reply.
fn ticket_reply(
    expiration: i32,
    timeout: &[u8],
    ticket: TpmtTkAuth,
) -> Result<(Vec<u8>, TpmtTkAuth), TpmError> {
    check_ticket_reply(expiration, timeout, &ticket)?;
    Ok((timeout.to_vec(), ticket))
}

/// A TPM connection together with the host-side state of its resources.
#[derive(Debug)]
pub struct Tpm {
    device: TpmDevice,
    registry: ResourceRegistry,
    exclusive_session: Option<u32>,
}

impl Tpm {
    #[must_use]
    pub fn new(device: TpmDevice) -> Self {
        Self {
            device,
            registry: ResourceRegistry::new(),
            exclusive_session: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// The session that last reported exclusive audit, if any.
    #[must_use]
    pub fn exclusive_session(&self) -> Option<u32> {
        self.exclusive_session
    }

    /// Returns the name of a handle, asking the TPM for objects and NV
    /// indices that are not tracked yet.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the TPM cannot report the name.
    pub fn name_of(&mut self, handle: u32) -> Result<Vec<u8>, TpmError> {
        if let Some(resource) = self.registry.lookup(handle) {
            return Ok(resource.name());
        }
        match HandleType::from_handle(handle) {
            Some(HandleType::Transient | HandleType::Persistent) => {
                Ok(self.read_public(handle)?.name)
            }
            Some(HandleType::NvIndex) => Ok(self.nv_read_public(handle)?.1),
            _ => Ok(handle.to_be_bytes().to_vec()),
        }
    }

    fn session(&self, handle: u32) -> Result<&SessionContext, TpmError> {
        self.registry.get(handle)?.as_session().ok_or_else(|| {
            TpmError::InvalidParameter(format!("handle 0x{handle:08x} is not a session"))
        })
    }

    fn policy_session(&self, handle: u32) -> Result<&SessionContext, TpmError> {
        let session = self.session(handle)?;
        session.ensure_usable()?;
        if session.session_type == TpmSe::Hmac {
            return Err(TpmError::InvalidParameter(format!(
                "session 0x{handle:08x} is not a policy session"
            )));
        }
        Ok(session)
    }

    /// Returns the current TPM nonce of a session, as needed for signing
    /// `TPM2_PolicySigned` authorizations.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the handle is not a session.
    pub fn nonce_tpm(&self, handle: u32) -> Result<Vec<u8>, TpmError> {
        Ok(self.session(handle)?.nonce_tpm.clone())
    }

    fn update_exclusive(&mut self, exclusive: Option<u32>) {
        if let Some(previous) = self.exclusive_session.take() {
            if exclusive != Some(previous) {
                if let Some(session) = self
                    .registry
                    .lookup_mut(previous)
                    .and_then(ResourceContext::as_session_mut)
                {
                    session.is_exclusive = false;
                }
            }
        }
        self.exclusive_session = exclusive;
    }

    /// Executes a command. `handles` are the handles of the command in
    /// order and `auths` authorize the first of them. Session state is only
    /// committed after the response has been verified.
    fn run<C: TpmHeader>(
        &mut self,
        command: &C,
        handles: &[u32],
        auths: &[Authorization<'_>],
    ) -> Result<TpmResponse, TpmError> {
        self.run_patched(command, handles, auths, None)
    }

    /// `run` with the last parameter replaced by `last` on the wire.
    fn run_patched<C: TpmHeader>(
        &mut self,
        command: &C,
        handles: &[u32],
        auths: &[Authorization<'_>],
        last: Option<u32>,
    ) -> Result<TpmResponse, TpmError> {
        let cc = C::COMMAND;
        if auths.len() > handles.len() {
            return Err(TpmError::InvalidParameter(format!(
                "{cc:?}: {} authorizations for {} handles",
                auths.len(),
                handles.len()
            )));
        }
        let mut plain = build_command(command, &[])?;
        if let Some(value) = last {
            patch_last_u32(&mut plain, value)?;
        }
        let parameters = command_parameters(&plain, handles.len())?;

        let names = if auths.is_empty() {
            Vec::new()
        } else {
            handles
                .iter()
                .map(|&handle| self.name_of(handle))
                .collect::<Result<Vec<_>, _>>()?
        };
        let name_refs: Vec<&[u8]> = names.iter().map(Vec::as_slice).collect();

        let mut pending = Vec::with_capacity(auths.len());
        let mut commands = Vec::with_capacity(auths.len());
        for (auth, name) in auths.iter().zip(&names) {
            match *auth {
                Authorization::Password(value) => {
                    commands.push(TpmsAuthCommand {
                        session_handle: TpmSession(TpmRh::Pw as u32),
                        nonce: Tpm2bNonce::default(),
                        session_attributes: TpmaSession::CONTINUE_SESSION,
                        hmac: Tpm2bAuth::try_from(value)?,
                    });
                    pending.push(None);
                }
                Authorization::Session {
                    handle,
                    auth_value,
                    attributes,
                } => {
                    let mut session = self.session(handle)?.clone();
                    let cp = cp_hash(session.hash_alg, cc, &name_refs, &parameters)?;
                    commands.push(session.command_auth(
                        &cp,
                        Some(name.as_slice()),
                        auth_value,
                        attributes,
                    )?);
                    pending.push(Some(session));
                }
            }
        }

        let mut buf = build_command(command, &commands)?;
        if let Some(value) = last {
            patch_last_u32(&mut buf, value)?;
        }
        let response = self.device.execute_bytes(cc, &buf)?;
        if response.auth_responses.len() != commands.len() {
            return Err(TpmError::UnexpectedResponse(format!(
                "{cc:?}: {} authorization responses for {} sessions",
                response.auth_responses.len(),
                commands.len()
            )));
        }

        for (((auth, name), session), reply) in auths
            .iter()
            .zip(&names)
            .zip(pending.iter_mut())
            .zip(response.auth_responses.iter())
        {
            if let Some(session) = session {
                let rp = rp_hash(session.hash_alg, 0, cc, &response.parameters)?;
                session.response_auth(&rp, reply, Some(name.as_slice()), auth.auth_value())?;
            }
        }

        let mut exclusive = None;
        for ((session, command), reply) in pending
            .into_iter()
            .zip(&commands)
            .zip(response.auth_responses.iter())
        {
            let Some(mut session) = session else {
                continue;
            };
            if !reply
                .session_attributes
                .contains(TpmaSession::CONTINUE_SESSION)
            {
                debug!("{cc:?}: session 0x{:08x} closed", session.handle);
                self.registry.evict(session.handle);
                continue;
            }
            if command.session_attributes.contains(TpmaSession::AUDIT) {
                session.is_audit = true;
            }
            session.is_exclusive = reply
                .session_attributes
                .contains(TpmaSession::AUDIT_EXCLUSIVE);
            if session.is_exclusive {
                exclusive = Some(session.handle);
            }
            if session.session_type == TpmSe::Policy {
                session.policy_hmac_type = PolicyHmacType::NoAuth;
            }
            self.registry.add(ResourceContext::Session(session));
        }
        if !auths.is_empty() {
            self.update_exclusive(exclusive);
        }
        Ok(response)
    }

    /// Runs `TPM2_Startup`. Every transient object and session known to the
    /// host is forgotten.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn startup(&mut self, startup_type: TpmSu) -> Result<(), TpmError> {
        self.run(&TpmStartupCommand { startup_type }, &[], &[])?;
        self.registry.evict_transient();
        self.exclusive_session = None;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn shutdown(&mut self, shutdown_type: TpmSu) -> Result<(), TpmError> {
        self.run(&TpmShutdownCommand { shutdown_type }, &[], &[])?;
        Ok(())
    }

    /// Flushes a transient object or a session and forgets it.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn flush_context(&mut self, handle: u32) -> Result<(), TpmError> {
        let cmd = TpmFlushContextCommand {
            flush_handle: handle.into(),
        };
        self.run(&cmd, &[], &[])?;
        self.registry.evict(handle);
        if self.exclusive_session.map(normalize_session_handle)
            == Some(normalize_session_handle(handle))
        {
            self.exclusive_session = None;
        }
        Ok(())
    }

    /// Makes a transient object persistent at `persistent`, or evicts a
    /// persistent object when `object == persistent`.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn evict_control(
        &mut self,
        auth: Authorization<'_>,
        object: u32,
        persistent: u32,
    ) -> Result<(), TpmError> {
        if HandleType::from_handle(persistent) != Some(HandleType::Persistent) {
            return Err(TpmError::InvalidParameter(format!(
                "0x{persistent:08x} is not a persistent handle"
            )));
        }
        let owner = TpmRh::Owner as u32;
        let cmd = TpmEvictControlCommand {
            auth: owner.into(),
            object_handle: object.into(),
            persistent_handle: TpmPersistent(persistent),
        };
        self.run(&cmd, &[owner, object], &[auth])?;
        if object == persistent {
            self.registry.evict(persistent);
        } else if let Some(source) = self.registry.get(object)?.as_object() {
            let mut copy = source.clone();
            copy.handle = persistent;
            self.registry.add(ResourceContext::Object(copy));
        }
        Ok(())
    }

    /// Starts an unsalted session, optionally bound to `bind`, which is
    /// given as a handle and its authorization value.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the reply is inconsistent.
    pub fn start_auth_session(
        &mut self,
        session_type: TpmSe,
        hash_alg: TpmAlgId,
        symmetric: SessionCipher,
        bind: Option<(u32, &[u8])>,
    ) -> Result<u32, TpmError> {
        let symmetric = symmetric.validate()?;
        let size = tpm_hash_size(&hash_alg).ok_or(TpmError::UnsupportedAlgorithm(hash_alg))?;
        let mut nonce_caller = vec![0u8; size];
        thread_rng().fill_bytes(&mut nonce_caller);
        let bind_name = match bind {
            Some((handle, _)) => Some(self.name_of(handle)?),
            None => None,
        };

        let tpm_key = TpmRh::Null as u32;
        let bind_handle = bind.map_or(TpmRh::Null as u32, |(handle, _)| handle);
        let cmd = TpmStartAuthSessionCommand {
            tpm_key: tpm_key.into(),
            bind: bind_handle.into(),
            nonce_caller: Tpm2bNonce::try_from(nonce_caller.as_slice())?,
            encrypted_salt: Default::default(),
            session_type,
            symmetric: symmetric.to_sym_def(),
            auth_hash: hash_alg,
        };
        let cc = TpmCc::StartAuthSession;
        let response = self.run(&cmd, &[tpm_key, bind_handle], &[])?;
        let resp = response
            .body
            .StartAuthSession()
            .map_err(|_| TpmError::ResponseMismatch(cc))?;
        let handle = resp.session_handle.0;

        let bind = match (&bind_name, bind) {
            (Some(name), Some((_, auth))) => Some((name.as_slice(), auth)),
            _ => None,
        };
        let session = SessionContext::new(
            handle,
            session_type,
            hash_alg,
            symmetric,
            nonce_caller,
            resp.nonce_tpm.to_vec(),
            bind,
            &[],
        )
        .map_err(|e| TpmError::UnexpectedResponse(format!("{cc:?}: {e}")))?;
        debug!("started {session_type:?} session 0x{handle:08x}");
        self.registry.add(ResourceContext::Session(session));
        Ok(handle)
    }

    /// Creates a primary object under `hierarchy`.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the returned name does
    /// not match the returned public area.
    pub fn create_primary(
        &mut self,
        hierarchy: TpmRh,
        auth: Authorization<'_>,
        public: &TpmtPublic,
        sensitive: &TpmsSensitiveCreate,
    ) -> Result<u32, TpmError> {
        let primary = hierarchy as u32;
        let cmd = TpmCreatePrimaryCommand {
            primary_handle: primary.into(),
            in_sensitive: Tpm2bSensitiveCreate {
                inner: sensitive.clone(),
            },
            in_public: Tpm2bPublic {
                inner: public.clone(),
            },
            outside_info: Tpm2bData::default(),
            creation_pcr: TpmlPcrSelection::new(),
        };
        let response = self.run(&cmd, &[primary], &[auth])?;
        let resp = response
            .body
            .CreatePrimary()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::CreatePrimary))?;
        let handle = resp.object_handle.0;
        let object = ObjectContext::with_name(handle, resp.out_public.inner, &resp.name)?;
        self.registry.add(ResourceContext::Object(object));
        Ok(handle)
    }

    /// Creates an ordinary object under `parent`. The object is not loaded;
    /// pass the returned areas to `load`.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the returned public area
    /// has no valid name.
    pub fn create(
        &mut self,
        parent: u32,
        auth: Authorization<'_>,
        public: &TpmtPublic,
        sensitive: &TpmsSensitiveCreate,
    ) -> Result<(Tpm2bPrivate, TpmtPublic), TpmError> {
        let cmd = TpmCreateCommand {
            parent_handle: parent.into(),
            in_sensitive: Tpm2bSensitiveCreate {
                inner: sensitive.clone(),
            },
            in_public: Tpm2bPublic {
                inner: public.clone(),
            },
            outside_info: Tpm2bData::default(),
            creation_pcr: TpmlPcrSelection::new(),
        };
        let response = self.run(&cmd, &[parent], &[auth])?;
        let resp = response
            .body
            .Create()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::Create))?;
        let out_public = resp.out_public.inner;
        if out_public.object_type != public.object_type || out_public.name_alg != public.name_alg
        {
            return Err(TpmError::UnexpectedResponse(
                "Create: public area does not match the template".to_string(),
            ));
        }
        crypto_make_name(&out_public)?;
        Ok((resp.out_private, out_public))
    }

    /// Loads an object created by `create` and tracks it.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the reported name does
    /// not match `public`.
    pub fn load(
        &mut self,
        parent: u32,
        auth: Authorization<'_>,
        private: &Tpm2bPrivate,
        public: &TpmtPublic,
    ) -> Result<u32, TpmError> {
        let cmd = TpmLoadCommand {
            parent_handle: parent.into(),
            in_private: private.clone(),
            in_public: Tpm2bPublic {
                inner: public.clone(),
            },
        };
        let response = self.run(&cmd, &[parent], &[auth])?;
        let resp = response
            .body
            .Load()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::Load))?;
        let handle = resp.object_handle.0;
        let object = ObjectContext::with_name(handle, public.clone(), &resp.name)?;
        debug!("loaded object 0x{handle:08x}");
        self.registry.add(ResourceContext::Object(object));
        Ok(handle)
    }

    /// Loads an object from its plaintext areas and tracks it.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the reported name does
    /// not match `public`.
    pub fn load_external(
        &mut self,
        hierarchy: TpmRh,
        public: &TpmtPublic,
        sensitive: &TpmtSensitive,
    ) -> Result<u32, TpmError> {
        let cmd = TpmLoadExternalCommand {
            in_private: Tpm2bSensitive {
                inner: sensitive.clone(),
            },
            in_public: Tpm2bPublic {
                inner: public.clone(),
            },
            hierarchy,
        };
        let response = self.run(&cmd, &[], &[])?;
        let resp = response
            .body
            .LoadExternal()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::LoadExternal))?;
        let handle = resp.object_handle.0;
        let object = ObjectContext::with_name(handle, public.clone(), &resp.name)?;
        self.registry.add(ResourceContext::Object(object));
        Ok(handle)
    }

    /// Reads the public area of an object and tracks it.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the name does not match
    /// the public area.
    pub fn read_public(&mut self, handle: u32) -> Result<ObjectContext, TpmError> {
        let cmd = TpmReadPublicCommand {
            object_handle: handle.into(),
        };
        let response = self.run(&cmd, &[handle], &[])?;
        let resp = response
            .body
            .ReadPublic()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::ReadPublic))?;
        let object = ObjectContext::with_name(handle, resp.out_public.inner, &resp.name)?;
        self.registry.add(ResourceContext::Object(object.clone()));
        Ok(object)
    }

    /// Reads the public area and the name of an NV index and tracks it.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails or the name does not match
    /// the public area.
    pub fn nv_read_public(&mut self, handle: u32) -> Result<(TpmsNvPublic, Vec<u8>), TpmError> {
        let cmd = TpmNvReadPublicCommand {
            nv_index: handle.into(),
        };
        let response = self.run(&cmd, &[handle], &[])?;
        let resp = response
            .body
            .NvReadPublic()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::NvReadPublic))?;
        let public = resp.nv_public.inner;
        let name = resp.nv_name.to_vec();
        if crypto_make_nv_name(&public)? != name {
            return Err(TpmError::Integrity(format!(
                "NV index 0x{handle:08x}: public area and name don't match"
            )));
        }
        self.registry.add(ResourceContext::Permanent {
            handle,
            name: name.clone(),
        });
        Ok((public, name))
    }

    /// Reads PCR values. The TPM may return fewer registers than selected;
    /// the returned selection lists the ones actually read.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn pcr_read(
        &mut self,
        selection: &TpmlPcrSelection,
    ) -> Result<(TpmlPcrSelection, Vec<Vec<u8>>), TpmError> {
        let cmd = TpmPcrReadCommand {
            pcr_selection_in: *selection,
        };
        let response = self.run(&cmd, &[], &[])?;
        let resp = response
            .body
            .PcrRead()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::PcrRead))?;
        let values = resp.pcr_values.iter().map(|d| d.to_vec()).collect();
        Ok((resp.pcr_selection_out, values))
    }

    /// Saves the context of a transient object or a session. A saved session
    /// cannot be used until it is loaded again.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` for permanent handles and for
    /// sessions that are already saved.
    pub fn context_save(&mut self, handle: u32) -> Result<TpmsContext, TpmError> {
        let resource = match HandleType::from_handle(handle) {
            Some(HandleType::HmacSession | HandleType::PolicySession) => {
                let session = self.session(handle)?;
                session.ensure_usable()?;
                ResourceContext::Session(session.clone())
            }
            Some(HandleType::Transient) => {
                self.name_of(handle)?;
                self.registry.get(handle)?.clone()
            }
            _ => {
                return Err(TpmError::InvalidParameter(format!(
                    "context of 0x{handle:08x} cannot be saved"
                )))
            }
        };

        let cmd = TpmContextSaveCommand {
            save_handle: handle.into(),
        };
        let response = self.run(&cmd, &[handle], &[])?;
        let resp = response
            .body
            .ContextSave()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::ContextSave))?;
        let wrapped = match &resource {
            ResourceContext::Session(session) => wrap_context(&resp.context, session)?,
            ResourceContext::Object(object) => wrap_context(&resp.context, object)?,
            ResourceContext::Permanent { .. } => {
                return Err(TpmError::InvalidParameter(format!(
                    "context of 0x{handle:08x} cannot be saved"
                )))
            }
        };
        if let Some(session) = self
            .registry
            .lookup_mut(handle)
            .and_then(ResourceContext::as_session_mut)
        {
            session.usable = false;
        }
        Ok(wrapped)
    }

    /// Loads a context produced by `context_save` and returns the handle it
    /// was loaded at.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Malformed` or `TpmError::Integrity` if the envelope
    /// does not verify, and `TpmError::UnexpectedResponse` if the TPM loads
    /// the context at an unexpected handle.
    pub fn context_load(&mut self, context: &TpmsContext) -> Result<u32, TpmError> {
        let (restored, inner) = unwrap_context(context)?;
        let saved_handle = context.saved_handle.0;
        let cc = TpmCc::ContextLoad;
        let response = self.run(&TpmContextLoadCommand { context: inner }, &[], &[])?;
        let loaded = response
            .body
            .ContextLoad()
            .map_err(|_| TpmError::ResponseMismatch(cc))?
            .loaded_handle
            .0;

        match restored {
            RestoredContext::Session(mut session) => {
                if normalize_session_handle(loaded) != normalize_session_handle(saved_handle) {
                    return Err(TpmError::UnexpectedResponse(format!(
                        "{cc:?}: session 0x{saved_handle:08x} loaded at 0x{loaded:08x}"
                    )));
                }
                session.is_exclusive = session.is_exclusive
                    && self.exclusive_session.map(normalize_session_handle)
                        == Some(normalize_session_handle(loaded));
                session.usable = true;
                self.registry.add(ResourceContext::Session(session));
            }
            RestoredContext::Object(mut object) => {
                if HandleType::from_handle(loaded) != Some(HandleType::Transient) {
                    return Err(TpmError::UnexpectedResponse(format!(
                        "{cc:?}: object loaded at 0x{loaded:08x}"
                    )));
                }
                object.handle = loaded;
                self.registry.add(ResourceContext::Object(object));
            }
        }
        debug!("loaded context 0x{saved_handle:08x} at 0x{loaded:08x}");
        Ok(loaded)
    }

    /// Runs `TPM2_PolicySecret`. A negative `expiration` requests a ticket
    /// that stays valid for `-expiration` seconds.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the session is not a usable policy session or
    /// the command fails.
    pub fn policy_secret(
        &mut self,
        auth_handle: u32,
        auth: Authorization<'_>,
        session: u32,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
    ) -> Result<(Vec<u8>, TpmtTkAuth), TpmError> {
        let nonce_tpm = self.policy_session(session)?.nonce_tpm.clone();
        let cmd = TpmPolicySecretCommand {
            auth_handle: auth_handle.into(),
            policy_session: session.into(),
            nonce_tpm: nonce_tpm.as_slice().try_into()?,
            cp_hash_a: cp_hash_a.try_into()?,
            policy_ref: policy_ref.try_into()?,
            expiration,
        };
        let response = self.run(&cmd, &[auth_handle, session], &[auth])?;
        let resp = response
            .body
            .PolicySecret()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::PolicySecret))?;
        ticket_reply(expiration, &resp.timeout, resp.policy_ticket)
    }

    /// Runs `TPM2_PolicySigned` with a signature over the digest returned by
    /// `session::policy_signed_digest`.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the session is not a usable policy session or
    /// the command fails.
    pub fn policy_signed(
        &mut self,
        auth_object: u32,
        session: u32,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        signature: &TpmtSignature,
    ) -> Result<(Vec<u8>, TpmtTkAuth), TpmError> {
        let nonce_tpm = self.policy_session(session)?.nonce_tpm.clone();
        let cmd = TpmPolicySignedCommand {
            auth_object: auth_object.into(),
            policy_session: session.into(),
            nonce_tpm: nonce_tpm.as_slice().try_into()?,
            cp_hash_a: cp_hash_a.try_into()?,
            policy_ref: policy_ref.try_into()?,
            expiration,
            auth: signature.clone(),
        };
        let response = self.run(&cmd, &[auth_object, session], &[])?;
        let resp = response
            .body
            .PolicySigned()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::PolicySigned))?;
        ticket_reply(expiration, &resp.timeout, resp.policy_ticket)
    }

    /// Presents a ticket from an earlier `policy_secret` or `policy_signed`.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the ticket is rejected before
    /// it is sent, and a `TpmError` if the command fails.
    pub fn policy_ticket(
        &mut self,
        session: u32,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TpmtTkAuth,
    ) -> Result<(), TpmError> {
        let hash_alg = self.policy_session(session)?.hash_alg;
        validate_policy_ticket(hash_alg, timeout, cp_hash_a, ticket, None)?;
        let cmd = TpmPolicyTicketCommand {
            policy_session: session.into(),
            timeout: timeout.try_into()?,
            cp_hash_a: cp_hash_a.try_into()?,
            policy_ref: policy_ref.try_into()?,
            auth_name: auth_name.try_into()?,
            ticket: ticket.clone(),
        };
        self.run(&cmd, &[session], &[])?;
        Ok(())
    }

    /// Runs `TPM2_PolicyOR`. The current digest of the session must be one of
    /// the branches, which the TPM checks.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` unless there are 2 to 8
    /// digest-sized branches.
    pub fn policy_or(&mut self, session: u32, digests: &[Vec<u8>]) -> Result<(), TpmError> {
        let hash_alg = self.policy_session(session)?.hash_alg;
        TrialPolicy::new(hash_alg)?.policy_or(digests)?;
        let mut p_hash_list = TpmlDigest::new();
        for digest in digests {
            p_hash_list.try_push(Tpm2bDigest::try_from(digest.as_slice())?)?;
        }
        let cmd = TpmPolicyOrCommand {
            policy_session: session.into(),
            p_hash_list,
        };
        self.run(&cmd, &[session], &[])?;
        Ok(())
    }

    /// Runs `TPM2_PolicyPCR`. Without `pcr_digest`, the composite digest of
    /// the current PCR values is used.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the digest has the wrong size or the command
    /// fails.
    pub fn policy_pcr(
        &mut self,
        session: u32,
        pcr_digest: Option<&[u8]>,
        selection: &TpmlPcrSelection,
    ) -> Result<(), TpmError> {
        let hash_alg = self.policy_session(session)?.hash_alg;
        let pcr_digest = match pcr_digest {
            Some(digest) => digest.to_vec(),
            None => {
                let (read, values) = self.pcr_read(selection)?;
                if pcr_selected(&read) != pcr_selected(selection) {
                    return Err(TpmError::UnexpectedResponse(
                        "PCR selection was not read in full".to_string(),
                    ));
                }
                pcr_composite_digest(hash_alg, selection, &values)?
            }
        };
        if Some(pcr_digest.len()) != tpm_hash_size(&hash_alg) {
            return Err(TpmError::InvalidParameter(format!(
                "PCR digest of {} bytes",
                pcr_digest.len()
            )));
        }
        let cmd = TpmPolicyPcrCommand {
            policy_session: session.into(),
            pcr_digest: pcr_digest.as_slice().try_into()?,
            pcrs: *selection,
        };
        self.run(&cmd, &[session], &[])?;
        Ok(())
    }

    /// Limits the session to authorizing `code`, which may be any command
    /// code including vendor codes.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn policy_command_code(&mut self, session: u32, code: u32) -> Result<(), TpmError> {
        self.policy_session(session)?;
        let cmd = TpmPolicyCommandCodeCommand {
            policy_session: session.into(),
            code: TpmCc::PolicyCommandCode,
        };
        self.run_patched(&cmd, &[session], &[], Some(code))?;
        Ok(())
    }

    fn set_policy_hmac_type<C: TpmHeader>(
        &mut self,
        session: u32,
        command: &C,
        hmac_type: PolicyHmacType,
    ) -> Result<(), TpmError> {
        self.policy_session(session)?;
        self.run(command, &[session], &[])?;
        self.registry.session_mut(session)?.policy_hmac_type = hmac_type;
        Ok(())
    }

    /// After this, the session proves the authorization value with an HMAC.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn policy_auth_value(&mut self, session: u32) -> Result<(), TpmError> {
        let cmd = TpmPolicyAuthValueCommand {
            policy_session: session.into(),
        };
        self.set_policy_hmac_type(session, &cmd, PolicyHmacType::Auth)
    }

    /// After this, the session sends the authorization value in the clear.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn policy_password(&mut self, session: u32) -> Result<(), TpmError> {
        let cmd = TpmPolicyPasswordCommand {
            policy_session: session.into(),
        };
        self.set_policy_hmac_type(session, &cmd, PolicyHmacType::Password)
    }

    /// Runs `TPM2_PolicyNV`, comparing `operand_b` against the contents of
    /// `nv_index` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    #[allow(clippy::too_many_arguments)]
    pub fn policy_nv(
        &mut self,
        auth_handle: u32,
        auth: Authorization<'_>,
        nv_index: u32,
        session: u32,
        operand_b: &[u8],
        offset: u16,
        op: NvOperation,
    ) -> Result<(), TpmError> {
        self.policy_session(session)?;
        let operation = TpmEo::try_from(u16::from(op))
            .map_err(|_| TpmError::InvalidParameter(format!("NV operation {op}")))?;
        let cmd = TpmPolicyNvCommand {
            auth_handle: auth_handle.into(),
            nv_index: nv_index.into(),
            policy_session: session.into(),
            operand_b: operand_b.try_into()?,
            offset,
            operation,
        };
        self.run(&cmd, &[auth_handle, nv_index, session], &[auth])?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>, TpmError> {
        self.policy_session(session)?;
        let cmd = TpmPolicyGetDigestCommand {
            policy_session: session.into(),
        };
        let response = self.run(&cmd, &[session], &[])?;
        let resp = response
            .body
            .PolicyGetDigest()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::PolicyGetDigest))?;
        Ok(resp.policy_digest.to_vec())
    }

    /// Returns the session digest to zero.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the command fails.
    pub fn policy_restart(&mut self, session: u32) -> Result<(), TpmError> {
        let cmd = TpmPolicyRestartCommand {
            session_handle: session.into(),
        };
        self.set_policy_hmac_type(session, &cmd, PolicyHmacType::NoAuth)
    }

    /// # Errors
    ///
    /// Returns a `TpmError` if the authorization fails.
    pub fn unseal(&mut self, item: u32, auth: Authorization<'_>) -> Result<Vec<u8>, TpmError> {
        let cmd = TpmUnsealCommand {
            item_handle: item.into(),
        };
        let response = self.run(&cmd, &[item], &[auth])?;
        let resp = response
            .body
            .Unseal()
            .map_err(|_| TpmError::ResponseMismatch(TpmCc::Unseal))?;
        Ok(resp.out_data.to_vec())
    }

    fn resolve_name(&mut self, expr: &PolicyExpr) -> Result<PolicyExpr, TpmError> {
        if expr_name(expr).is_ok() {
            return Ok(expr.clone());
        }
        match expr {
            PolicyExpr::TpmHandle(handle) => Ok(PolicyExpr::Data {
                encoding: "hex".to_string(),
                value: hex::encode(self.name_of(*handle)?),
            }),
            _ => Err(TpmError::InvalidParameter(format!("not a name: {expr}"))),
        }
    }

    /// Fills in what an offline evaluation of `expr` cannot know: current PCR
    /// digests under `hash_alg`, and the names of objects and NV indices.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if a PCR or a name cannot be read.
    pub fn resolve_policy(
        &mut self,
        hash_alg: TpmAlgId,
        expr: &PolicyExpr,
    ) -> Result<PolicyExpr, TpmError> {
        Ok(match expr {
            PolicyExpr::Pcr {
                selection,
                digest: None,
            } => {
                let tpml = pcr_selection_vec_to_tpml(&pcr_selection_vec_from_str(selection)?)?;
                let (_, values) = self.pcr_read(&tpml)?;
                PolicyExpr::Pcr {
                    selection: selection.clone(),
                    digest: Some(pcr_composite_digest(hash_alg, &tpml, &values)?),
                }
            }
            PolicyExpr::Secret { name, policy_ref } => PolicyExpr::Secret {
                name: Box::new(self.resolve_name(name)?),
                policy_ref: policy_ref.clone(),
            },
            PolicyExpr::Signed { name, policy_ref } => PolicyExpr::Signed {
                name: Box::new(self.resolve_name(name)?),
                policy_ref: policy_ref.clone(),
            },
            PolicyExpr::Nv {
                name,
                operand,
                offset,
                op,
            } => PolicyExpr::Nv {
                name: Box::new(self.resolve_name(name)?),
                operand: operand.clone(),
                offset: *offset,
                op: *op,
            },
            PolicyExpr::Or(branches) => PolicyExpr::Or(
                branches
                    .iter()
                    .map(|branch| self.resolve_policy(hash_alg, branch))
                    .collect::<Result<_, _>>()?,
            ),
            PolicyExpr::All(items) => PolicyExpr::All(
                items
                    .iter()
                    .map(|item| self.resolve_policy(hash_alg, item))
                    .collect::<Result<_, _>>()?,
            ),
            _ => expr.clone(),
        })
    }

    /// Computes the digest of `expr` without a policy session on the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the expression cannot be resolved or applied.
    pub fn trial_policy(
        &mut self,
        hash_alg: TpmAlgId,
        expr: &PolicyExpr,
    ) -> Result<TrialPolicy, TpmError> {
        let resolved = self.resolve_policy(hash_alg, expr)?;
        let mut trial = TrialPolicy::new(hash_alg)?;
        trial.apply(&resolved)?;
        Ok(trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_keyed_hash_templates(#[case] hmac: bool) {
        let policy = [0xaa; 32];
        let public = if hmac {
            hmac_key_template(TpmAlgId::Sha256, &policy).unwrap()
        } else {
            sealed_data_template(TpmAlgId::Sha256, &policy).unwrap()
        };
        assert_eq!(public.object_type, TpmAlgId::KeyedHash);
        assert_eq!(&public.auth_policy[..], &policy[..]);
        assert_eq!(
            public.object_attributes.contains(TpmaObject::SIGN_ENCRYPT),
            hmac
        );
        assert!(public
            .object_attributes
            .contains(TpmaObject::USER_WITH_AUTH));
    }

    #[test]
    fn test_template_rejects_unknown_hash() {
        assert!(matches!(
            sealed_data_template(TpmAlgId::Null, &[]),
            Err(TpmError::UnsupportedAlgorithm(TpmAlgId::Null))
        ));
    }
}
