// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Host-side metadata of TPM resources, keyed by handle.

use crate::{
    constant::{TPM_HANDLE_INDEX_MASK, TPM_HANDLE_TYPE_SHIFT, TPM_RH_HMAC_SESSION_FIRST},
    crypto::crypto_make_name,
    error::TpmError,
    session::SessionContext,
};
use log::debug;
use std::collections::BTreeMap;
use tpm2_protocol::data::TpmtPublic;

/// The handle type, i.e. the most significant byte of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Pcr,
    NvIndex,
    HmacSession,
    PolicySession,
    Permanent,
    Transient,
    Persistent,
}

impl HandleType {
    #[must_use]
    pub fn from_handle(handle: u32) -> Option<Self> {
        match handle >> TPM_HANDLE_TYPE_SHIFT {
            0x00 => Some(Self::Pcr),
            0x01 => Some(Self::NvIndex),
            0x02 => Some(Self::HmacSession),
            0x03 => Some(Self::PolicySession),
            0x40 => Some(Self::Permanent),
            0x80 => Some(Self::Transient),
            0x81 => Some(Self::Persistent),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_session(self) -> bool {
        matches!(self, Self::HmacSession | Self::PolicySession)
    }
}

/// Maps a policy session handle into the HMAC session range. The TPM reports
/// a saved session under either range depending on its type.
#[must_use]
pub fn normalize_session_handle(handle: u32) -> u32 {
    match HandleType::from_handle(handle) {
        Some(HandleType::PolicySession) => {
            (handle & TPM_HANDLE_INDEX_MASK) | TPM_RH_HMAC_SESSION_FIRST
        }
        _ => handle,
    }
}

/// A loaded, persistent or otherwise named object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectContext {
    pub handle: u32,
    pub public: TpmtPublic,
    pub name: Vec<u8>,
}

impl ObjectContext {
    /// Creates an object context, computing the name from the public area.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the name cannot be computed.
    pub fn new(handle: u32, public: TpmtPublic) -> Result<Self, TpmError> {
        let name = crypto_make_name(&public)?;
        Ok(Self {
            handle,
            public,
            name,
        })
    }

    /// Creates an object context from a name reported by the TPM, which must
    /// match the public area.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Integrity` if the name does not match.
    pub fn with_name(handle: u32, public: TpmtPublic, name: &[u8]) -> Result<Self, TpmError> {
        let object = Self {
            handle,
            public,
            name: name.to_vec(),
        };
        object.verify_name()?;
        Ok(object)
    }

    /// Checks that `name` is the name of the public area.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Integrity` on mismatch.
    pub fn verify_name(&self) -> Result<(), TpmError> {
        let expected = crypto_make_name(&self.public)?;
        if expected == self.name {
            Ok(())
        } else {
            Err(TpmError::Integrity(
                "public area and name don't match".to_string(),
            ))
        }
    }
}

/// Host-side state of a TPM resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceContext {
    Object(ObjectContext),
    Session(SessionContext),
    /// A PCR, NV index or permanent handle, named by the handle itself
    /// unless a name is known.
    Permanent { handle: u32, name: Vec<u8> },
}

impl ResourceContext {
    #[must_use]
    pub fn permanent(handle: u32) -> Self {
        Self::Permanent {
            handle,
            name: handle.to_be_bytes().to_vec(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> u32 {
        match self {
            Self::Object(object) => object.handle,
            Self::Session(session) => session.handle,
            Self::Permanent { handle, .. } => *handle,
        }
    }

    /// Returns the name used for the resource in authorization digests.
    #[must_use]
    pub fn name(&self) -> Vec<u8> {
        match self {
            Self::Object(object) => object.name.clone(),
            Self::Session(session) => session.handle.to_be_bytes().to_vec(),
            Self::Permanent { name, .. } => name.clone(),
        }
    }

    #[must_use]
    pub fn as_session(&self) -> Option<&SessionContext> {
        match self {
            Self::Session(session) => Some(session),
            _ => None,
        }
    }

    pub fn as_session_mut(&mut self) -> Option<&mut SessionContext> {
        match self {
            Self::Session(session) => Some(session),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectContext> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

/// Returns true for handles that survive `TPM2_Startup`.
#[must_use]
pub fn survives_startup(handle: u32) -> bool {
    matches!(
        HandleType::from_handle(handle),
        Some(
            HandleType::Pcr
                | HandleType::NvIndex
                | HandleType::Permanent
                | HandleType::Persistent
        )
    )
}

/// Owns the host-side state of every resource known to a TPM connection.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: BTreeMap<u32, ResourceContext>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a resource, replacing any stale entry with the same handle.
    pub fn add(&mut self, resource: ResourceContext) {
        let key = normalize_session_handle(resource.handle());
        if self.entries.insert(key, resource).is_some() {
            debug!("registry: replaced 0x{key:08x}");
        } else {
            debug!("registry: added 0x{key:08x}");
        }
    }

    #[must_use]
    pub fn lookup(&self, handle: u32) -> Option<&ResourceContext> {
        self.entries.get(&normalize_session_handle(handle))
    }

    pub fn lookup_mut(&mut self, handle: u32) -> Option<&mut ResourceContext> {
        self.entries.get_mut(&normalize_session_handle(handle))
    }

    /// Looks up a resource that must exist.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the handle is not tracked.
    pub fn get(&self, handle: u32) -> Result<&ResourceContext, TpmError> {
        self.lookup(handle).ok_or_else(|| {
            TpmError::InvalidParameter(format!("handle 0x{handle:08x} is not tracked"))
        })
    }

    /// Looks up a session that must exist.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the handle is not a tracked
    /// session.
    pub fn session_mut(&mut self, handle: u32) -> Result<&mut SessionContext, TpmError> {
        self.lookup_mut(handle)
            .and_then(ResourceContext::as_session_mut)
            .ok_or_else(|| {
                TpmError::InvalidParameter(format!("handle 0x{handle:08x} is not a session"))
            })
    }

    /// Removes a resource. Evicting an absent handle is not an error, since
    /// the TPM may already have flushed it on its own.
    pub fn evict(&mut self, handle: u32) -> Option<ResourceContext> {
        let removed = self.entries.remove(&normalize_session_handle(handle));
        if removed.is_some() {
            debug!("registry: evicted 0x{handle:08x}");
        }
        removed
    }

    /// Drops every transient object and session, as `TPM2_Startup` does on
    /// the device.
    pub fn evict_transient(&mut self) {
        self.entries.retain(|&handle, _| survives_startup(handle));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.values().map(ResourceContext::handle)
    }
}
