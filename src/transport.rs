// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{constant::TPM_HEADER_SIZE, error::TpmError};
use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex},
};
use tpm2_protocol::constant::TPM_MAX_COMMAND_SIZE;

/// A trait for a transport layer capable of sending and receiving full TPM
/// messages.
pub trait Transport: Send + std::fmt::Debug {
    /// Sends a complete command buffer to the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError::Io` on I/O failure.
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmError>;

    /// Receives a complete response buffer from the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` on I/O failure or if the size in the header is out
    /// of bounds.
    fn receive(&mut self) -> Result<Vec<u8>, TpmError>;
}

/// Reads one message framed by the size field of the TPM header.
///
/// # Errors
///
/// Returns `TpmError::ResponseUnderflow` or `TpmError::ResponseOverflow` if the
/// size is out of bounds, and `TpmError::Io` on I/O failure.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, TpmError> {
    let mut header = [0u8; TPM_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if size < TPM_HEADER_SIZE {
        return Err(TpmError::ResponseUnderflow);
    }
    if size > TPM_MAX_COMMAND_SIZE {
        return Err(TpmError::ResponseOverflow);
    }

    let mut buf = header.to_vec();
    buf.resize(size, 0);
    reader.read_exact(&mut buf[TPM_HEADER_SIZE..])?;
    Ok(buf)
}

/// A transport over a character device such as `/dev/tpmrm0`.
#[derive(Debug)]
pub struct FileTransport(pub File);

impl Transport for FileTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmError> {
        self.0.write_all(command_bytes)?;
        self.0.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmError> {
        read_message(&mut self.0)
    }
}

#[derive(Debug)]
struct EndpointState {
    buffer: VecDeque<u8>,
    writer_dropped: bool,
}

#[derive(Debug)]
struct EndpointGuard {
    state: Mutex<EndpointState>,
    cvar: Condvar,
}

impl EndpointGuard {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EndpointState {
                buffer: VecDeque::new(),
                writer_dropped: false,
            }),
            cvar: Condvar::new(),
        })
    }
}

/// One direction of an in-memory pipe.
#[derive(Debug)]
pub struct Endpoint(Arc<EndpointGuard>);

/// An in-memory, bidirectional pipe. The first endpoint is read from and the
/// second one is written to.
#[derive(Debug)]
pub struct PipeTransport(Endpoint, Endpoint);

impl PipeTransport {
    /// Creates two connected transports: whatever one writes, the other reads.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let to_server = EndpointGuard::new();
        let to_client = EndpointGuard::new();
        let client = PipeTransport(
            Endpoint(Arc::clone(&to_client)),
            Endpoint(Arc::clone(&to_server)),
        );
        let server = PipeTransport(Endpoint(to_server), Endpoint(to_client));
        (client, server)
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.0.state.lock().unwrap();
        while !state.writer_dropped && state.buffer.is_empty() {
            state = self.0.cvar.wait(state).unwrap();
        }

        if state.writer_dropped && state.buffer.is_empty() {
            return Ok(0);
        }

        let bytes_to_read = buf.len().min(state.buffer.len());
        for (i, byte) in state.buffer.drain(..bytes_to_read).enumerate() {
            buf[i] = byte;
        }
        Ok(bytes_to_read)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.0.state.lock().unwrap();
        if state.writer_dropped {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader dropped",
            ));
        }
        state.buffer.extend(buf);
        self.0.cvar.notify_one();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap();
        state.writer_dropped = true;
        self.0.cvar.notify_all();
    }
}

impl Read for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PipeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.1.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.1.flush()
    }
}

impl Transport for PipeTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmError> {
        self.write_all(command_bytes)?;
        self.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmError> {
        read_message(self)
    }
}
