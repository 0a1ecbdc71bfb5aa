// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    constant::TPM_HEADER_SIZE,
    error::TpmError,
    transport::{FileTransport, Transport},
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace, warn};
use std::{
    fs::OpenOptions,
    io::{self, IsTerminal},
    path::Path,
    time::Duration,
};
use tpm2_protocol::{
    constant::TPM_MAX_COMMAND_SIZE,
    data::{TpmCc, TpmRc, TpmSt, TpmsAuthCommand},
    message::{
        tpm_build_command, tpm_parse_response, TpmAuthResponses, TpmHeader, TpmResponseBody,
    },
    TpmWriter,
};

/// A successfully executed command.
#[derive(Debug)]
pub struct TpmResponse {
    pub rc: TpmRc,
    pub body: TpmResponseBody,
    pub auth_responses: TpmAuthResponses,
    /// The marshalled response parameters, as covered by `rpHash`.
    pub parameters: Vec<u8>,
}

/// Number of handles a response carries before its parameters.
#[must_use]
pub fn response_handle_count(cc: TpmCc) -> usize {
    match cc {
        TpmCc::ContextLoad
        | TpmCc::CreatePrimary
        | TpmCc::Load
        | TpmCc::LoadExternal
        | TpmCc::StartAuthSession => 1,
        _ => 0,
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn has_sessions(buf: &[u8]) -> bool {
    buf.get(0..2)
        .is_some_and(|tag| u16::from_be_bytes([tag[0], tag[1]]) == TpmSt::Sessions as u16)
}

/// Returns the parameter area of a marshalled command with `handle_count`
/// handles, skipping the authorization area if there is one.
///
/// # Errors
///
/// Returns `TpmError::Malformed` if the buffer is truncated.
pub fn command_parameters(buf: &[u8], handle_count: usize) -> Result<Vec<u8>, TpmError> {
    let truncated = || TpmError::Malformed("truncated command".to_string());
    let mut start = TPM_HEADER_SIZE + 4 * handle_count;
    if has_sessions(buf) {
        let auth_size = read_u32(buf, start).ok_or_else(truncated)? as usize;
        start += 4 + auth_size;
    }
    buf.get(start..).map(<[u8]>::to_vec).ok_or_else(truncated)
}

/// Returns the parameter area of a marshalled response.
///
/// # Errors
///
/// Returns `TpmError::UnexpectedResponse` if the buffer is truncated.
pub fn response_parameters(cc: TpmCc, buf: &[u8]) -> Result<Vec<u8>, TpmError> {
    let truncated = || TpmError::UnexpectedResponse(format!("{cc:?}: truncated response"));
    let start = TPM_HEADER_SIZE + 4 * response_handle_count(cc);
    if !has_sessions(buf) {
        return buf.get(start..).map(<[u8]>::to_vec).ok_or_else(truncated);
    }
    let size = read_u32(buf, start).ok_or_else(truncated)? as usize;
    buf.get(start + 4..start + 4 + size)
        .map(<[u8]>::to_vec)
        .ok_or_else(truncated)
}

/// Builds a command buffer.
///
/// # Errors
///
/// Returns `TpmError::Marshal` if the command does not fit into a command
/// buffer.
pub fn build_command<C: TpmHeader>(
    command: &C,
    sessions: &[TpmsAuthCommand],
) -> Result<Vec<u8>, TpmError> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        let tag = if sessions.is_empty() {
            TpmSt::NoSessions
        } else {
            TpmSt::Sessions
        };
        tpm_build_command(command, tag, sessions, &mut writer)?;
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

/// Replaces the last parameter of a command buffer with a raw `u32`. Used
/// for parameters whose typed form cannot carry every wire value.
///
/// # Errors
///
/// Returns `TpmError::Malformed` if the buffer is shorter than a header.
pub fn patch_last_u32(buf: &mut [u8], value: u32) -> Result<(), TpmError> {
    let len = buf.len();
    if len < TPM_HEADER_SIZE + 4 {
        return Err(TpmError::Malformed("truncated command".to_string()));
    }
    buf[len - 4..].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// A TPM reached through a transport.
#[derive(Debug)]
pub struct TpmDevice {
    transport: Box<dyn Transport>,
    spinner: bool,
}

impl TpmDevice {
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            spinner: false,
        }
    }

    /// Opens a TPM character device.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError::File` if the path cannot be opened.
    pub fn open(path: &str) -> Result<Self, TpmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(path))
            .map_err(|e| {
                TpmError::File(
                    path.to_string(),
                    io::Error::new(e.kind(), "could not open device node"),
                )
            })?;
        debug!("opening {path}");
        Ok(Self::new(Box::new(FileTransport(file))))
    }

    /// Shows a spinner on stderr while waiting for the TPM, if stderr is a
    /// terminal.
    #[must_use]
    pub fn with_spinner(mut self, spinner: bool) -> Self {
        self.spinner = spinner;
        self
    }

    fn start_spinner(&self) -> Option<ProgressBar> {
        if !self.spinner || !io::stderr().is_terminal() {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(100));
        let style = ProgressStyle::with_template("{spinner:.cyan.bold} {msg}").ok()?;
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        pb.set_message("Waiting for TPM...");
        Some(pb)
    }

    /// Sends a raw command buffer and returns the raw response.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if the transport fails.
    pub fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TpmError> {
        let pb = self.start_spinner();
        trace!("command: {}", hex::encode(command));
        let result = self
            .transport
            .send(command)
            .and_then(|()| self.transport.receive());
        if let Some(pb) = pb {
            match &result {
                Ok(_) => pb.finish_and_clear(),
                Err(_) => pb.abandon_with_message("✖ TPM transport failed."),
            }
        }
        let response = result?;
        trace!("response: {}", hex::encode(&response));
        Ok(response)
    }

    /// Executes a command that has already been marshalled.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::TpmRc` if the TPM reports an error or a warning,
    /// and other `TpmError` variants for transport and framing failures.
    pub fn execute_bytes(&mut self, cc: TpmCc, command: &[u8]) -> Result<TpmResponse, TpmError> {
        let buf = self.transmit(command)?;
        let parsed = tpm_parse_response(cc, &buf)
            .map_err(|e| TpmError::UnexpectedResponse(format!("{cc:?}: {e:?}")))?;
        match parsed {
            Ok((rc, body, auth_responses)) => Ok(TpmResponse {
                rc,
                body,
                auth_responses,
                parameters: response_parameters(cc, &buf)?,
            }),
            Err((rc, _)) => {
                if rc.is_warning() {
                    warn!("{cc:?}: {rc}");
                } else {
                    debug!("{cc:?}: {rc}");
                }
                Err(TpmError::TpmRc(rc))
            }
        }
    }

    /// Executes a command.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::TpmRc` if the TPM reports an error or a warning,
    /// and other `TpmError` variants for transport and framing failures.
    pub fn execute<C: TpmHeader>(
        &mut self,
        command: &C,
        sessions: &[TpmsAuthCommand],
    ) -> Result<TpmResponse, TpmError> {
        debug!("{:?}: {} sessions", C::COMMAND, sessions.len());
        let buf = build_command(command, sessions)?;
        self.execute_bytes(C::COMMAND, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tpm2_protocol::{
        data::{Tpm2bAuth, Tpm2bNonce, TpmRh, TpmaSession},
        message::TpmUnsealCommand,
        TpmSession,
    };

    fn response(tag: TpmSt, rc: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(tag as u16).to_be_bytes());
        buf.extend_from_slice(&u32::try_from(10 + body.len()).unwrap().to_be_bytes());
        buf.extend_from_slice(&rc.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_build_command_with_session() {
        let session = TpmsAuthCommand {
            session_handle: TpmSession(TpmRh::Pw as u32),
            nonce: Tpm2bNonce::default(),
            session_attributes: TpmaSession::CONTINUE_SESSION,
            hmac: Tpm2bAuth::default(),
        };
        let cmd = TpmUnsealCommand {
            item_handle: 0x8000_0000u32.into(),
        };
        let buf = build_command(&cmd, &[session]).unwrap();
        assert_eq!(
            hex::encode(&buf),
            "80020000001b0000015e8000000000000009400000090000010000"
        );
        assert!(command_parameters(&buf, 1).unwrap().is_empty());
    }

    #[rstest]
    #[case(TpmSt::NoSessions, &[0x00, 0x00, 0x01, 0x4e][..])]
    #[case(TpmSt::Sessions, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x4e][..])]
    fn test_command_parameters(#[case] tag: TpmSt, #[case] tail: &[u8]) {
        let mut body = 0x0300_0000u32.to_be_bytes().to_vec();
        body.extend_from_slice(tail);
        let buf = response(tag, 0x0000_016c, &body);
        assert_eq!(command_parameters(&buf, 1).unwrap(), vec![0x00, 0x00, 0x01, 0x4e]);
    }

    #[test]
    fn test_response_parameters_with_sessions() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x8000_0001u32.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&[0xab, 0xcd]);
        body.extend_from_slice(&[0, 1, 0x11, 0x01, 0, 0]);
        let buf = response(TpmSt::Sessions, 0, &body);
        assert_eq!(
            response_parameters(TpmCc::CreatePrimary, &buf).unwrap(),
            vec![0xab, 0xcd]
        );
    }

    #[test]
    fn test_response_parameters_truncated() {
        let mut body = 2u32.to_be_bytes().to_vec();
        body.push(0xab);
        let buf = response(TpmSt::Sessions, 0, &body);
        assert!(matches!(
            response_parameters(TpmCc::Unseal, &buf),
            Err(TpmError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_patch_last_u32() {
        let mut buf = response(TpmSt::NoSessions, 0x0000_016c, &[0, 0, 1, 0x5e]);
        patch_last_u32(&mut buf, 0x2000_0001).unwrap();
        assert_eq!(&buf[10..], &[0x20, 0x00, 0x00, 0x01]);
        assert!(patch_last_u32(&mut [0u8; 12], 0).is_err());
    }
}
