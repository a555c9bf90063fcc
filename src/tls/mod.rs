//! Non-blocking TLS over a record engine.
//!
//! [`TlsEngine`] drives any [`RecordEngine`] (a handshake/record-layer
//! implementation exposing wrap and unwrap) against a non-blocking socket.
//! Ciphertext, pending output and unwrapped plaintext live in growable
//! buffers owned by the engine, so a call never loses bytes when the socket
//! would block or the caller's buffer is short.

pub mod config;
pub mod rustls_engine;

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::trace;

pub use config::load_server_config;
pub use rustls_engine::RustlsEngine;

/// Largest buffer the engine is allowed to ask for.
const MAX_BUFFER: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("TLS engine error: {0}")]
    Engine(String),
    #[error("TLS handshake failed")]
    HandshakeFailed,
    #[error("TLS connection closed")]
    Closed,
}

/// Handshake status as reported by a record engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    Finished,
    NeedTask,
    NeedWrap,
    NeedUnwrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// More ciphertext is needed before anything can be unwrapped.
    BufferUnderflow,
    /// The destination buffer is too small.
    BufferOverflow,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    pub consumed: usize,
    pub produced: usize,
}

/// Black-box TLS record layer.
pub trait RecordEngine: Send {
    fn handshake_status(&self) -> HandshakeStatus;

    /// Decrypts ciphertext from `src` into plaintext in `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// Encrypts plaintext from `src` (possibly empty) into ciphertext in `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// Next blocking computation the handshake is waiting on, if any.
    fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>>;

    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;

    fn packet_buffer_size(&self) -> usize;

    fn application_buffer_size(&self) -> usize;
}

/// Where the handshake state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NeedUnwrap,
    NeedWrap,
    NeedTask,
    Finished,
    Failed,
}

impl From<HandshakeStatus> for HandshakeState {
    fn from(status: HandshakeStatus) -> Self {
        match status {
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => HandshakeState::Finished,
            HandshakeStatus::NeedTask => HandshakeState::NeedTask,
            HandshakeStatus::NeedWrap => HandshakeState::NeedWrap,
            HandshakeStatus::NeedUnwrap => HandshakeState::NeedUnwrap,
        }
    }
}

/// Result of a plaintext transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Bytes(usize),
    WouldBlock,
    Closed,
}

enum Fill {
    Read,
    WouldBlock,
    Eof,
}

pub struct TlsEngine {
    engine: Box<dyn RecordEngine>,
    state: HandshakeState,
    net_in: BytesMut,
    net_in_limit: usize,
    net_out: BytesMut,
    app_in: BytesMut,
    scratch: Vec<u8>,
    inbound_closed: bool,
}

impl TlsEngine {
    pub fn new(engine: Box<dyn RecordEngine>) -> Self {
        let state = engine.handshake_status().into();
        let net_in_limit = engine.packet_buffer_size().max(1);
        let scratch = vec![0; engine.application_buffer_size().max(engine.packet_buffer_size()).max(1)];

        Self {
            engine,
            state,
            net_in: BytesMut::with_capacity(net_in_limit),
            net_in_limit,
            net_out: BytesMut::new(),
            app_in: BytesMut::new(),
            scratch,
            inbound_closed: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Finished
    }

    pub fn has_pending_output(&self) -> bool {
        !self.net_out.is_empty()
    }

    /// Advances the handshake as far as the socket allows.
    ///
    /// Returns `true` once the handshake is finished and its last flight
    /// has left the socket. Once that has happened, further calls return
    /// `true` without touching the engine.
    pub fn handshake<S: Read + Write>(&mut self, io: &mut S) -> Result<bool, TlsError> {
        let result = self.drive_handshake(io);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn drive_handshake<S: Read + Write>(&mut self, io: &mut S) -> Result<bool, TlsError> {
        loop {
            match self.state {
                HandshakeState::Finished => return self.flush_pending(io),
                HandshakeState::Failed => return Err(TlsError::HandshakeFailed),
                HandshakeState::NeedTask => {
                    while let Some(task) = self.engine.delegated_task() {
                        task();
                    }
                    self.state = self.engine.handshake_status().into();
                }
                HandshakeState::NeedWrap => {
                    let result = self.wrap_into_net_out(&[])?;
                    self.state = result.handshake.into();
                    if !self.flush_pending(io)? {
                        trace!(pending = self.net_out.len(), "Handshake flight waiting on socket");
                        return Ok(false);
                    }
                }
                HandshakeState::NeedUnwrap => {
                    if self.net_in.is_empty() {
                        match self.fill_net_in(io)? {
                            Fill::Read => {}
                            Fill::WouldBlock => return Ok(false),
                            Fill::Eof => return Err(TlsError::Closed),
                        }
                    }
                    let result = self.unwrap_once()?;
                    match result.status {
                        EngineStatus::Closed => return Err(TlsError::Closed),
                        EngineStatus::BufferUnderflow => match self.fill_net_in(io)? {
                            Fill::Read => continue,
                            Fill::WouldBlock => return Ok(false),
                            Fill::Eof => return Err(TlsError::Closed),
                        },
                        _ => {
                            let next = HandshakeState::from(result.handshake);
                            if next == HandshakeState::Finished {
                                // The final flight may still sit inside the engine.
                                self.wrap_into_net_out(&[])?;
                            }
                            self.state = next;
                        }
                    }
                }
            }
        }
    }

    /// Reads plaintext into `dst`.
    ///
    /// Plaintext that does not fit is kept for the next call.
    pub fn read<S: Read>(&mut self, io: &mut S, dst: &mut [u8]) -> Result<Transfer, TlsError> {
        if !self.is_established() {
            return Ok(Transfer::WouldBlock);
        }
        loop {
            if !self.app_in.is_empty() {
                let n = dst.len().min(self.app_in.len());
                dst[..n].copy_from_slice(&self.app_in[..n]);
                self.app_in.advance(n);
                return Ok(Transfer::Bytes(n));
            }
            if self.inbound_closed || self.engine.is_inbound_done() {
                return Ok(Transfer::Closed);
            }

            let result = self.unwrap_once()?;
            match result.status {
                EngineStatus::Closed => {
                    self.inbound_closed = true;
                    continue;
                }
                EngineStatus::Ok if result.produced > 0 || result.consumed > 0 => continue,
                _ => {}
            }

            match self.fill_net_in(io)? {
                Fill::Read => {}
                Fill::WouldBlock => return Ok(Transfer::WouldBlock),
                Fill::Eof => self.inbound_closed = true,
            }
        }
    }

    /// Encrypts all of `src` and writes as much ciphertext as the socket
    /// takes. Whatever remains is sent by [`TlsEngine::flush_pending`].
    pub fn write<S: Write>(&mut self, io: &mut S, src: &[u8]) -> Result<usize, TlsError> {
        if !self.is_established() {
            return Err(TlsError::HandshakeFailed);
        }
        self.wrap_into_net_out(src)?;
        self.flush_pending(io)?;
        Ok(src.len())
    }

    /// Writes pending ciphertext. Returns `true` once nothing is left.
    pub fn flush_pending<S: Write>(&mut self, io: &mut S) -> Result<bool, TlsError> {
        while !self.net_out.is_empty() {
            match io.write(&self.net_out) {
                Ok(0) => return Err(TlsError::Closed),
                Ok(n) => self.net_out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Sends close_notify on a best-effort basis.
    pub fn shutdown<S: Write>(&mut self, io: &mut S) {
        self.engine.close_outbound();
        for _ in 0..4 {
            match self.wrap_into_net_out(&[]) {
                Ok(result) if result.produced > 0 => continue,
                _ => break,
            }
        }
        if let Err(e) = self.flush_pending(io) {
            trace!("Ignoring error while sending close_notify: {}", e);
        }
    }

    fn fill_net_in<S: Read>(&mut self, io: &mut S) -> Result<Fill, TlsError> {
        if self.net_in.len() >= self.net_in_limit {
            self.net_in_limit = grow(self.net_in_limit)?;
        }
        let start = self.net_in.len();
        self.net_in.resize(self.net_in_limit, 0);
        loop {
            match io.read(&mut self.net_in[start..]) {
                Ok(0) => {
                    self.net_in.truncate(start);
                    return Ok(Fill::Eof);
                }
                Ok(n) => {
                    self.net_in.truncate(start + n);
                    trace!(bytes = n, "Read ciphertext");
                    return Ok(Fill::Read);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.net_in.truncate(start);
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Ok(Fill::WouldBlock);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    fn unwrap_once(&mut self) -> Result<EngineResult, TlsError> {
        loop {
            let result = self.engine.unwrap(&self.net_in, &mut self.scratch)?;
            self.net_in.advance(result.consumed);
            self.app_in.extend_from_slice(&self.scratch[..result.produced]);
            match result.status {
                EngineStatus::BufferOverflow if result.produced == 0 => {
                    let next = grow(self.scratch.len())?;
                    self.scratch.resize(next, 0);
                }
                EngineStatus::BufferUnderflow => {
                    if self.net_in.len() >= self.net_in_limit {
                        self.net_in_limit = grow(self.net_in_limit)?;
                    }
                    return Ok(result);
                }
                _ => return Ok(result),
            }
        }
    }

    fn wrap_into_net_out(&mut self, src: &[u8]) -> Result<EngineResult, TlsError> {
        let mut offset = 0;
        loop {
            let result = self.engine.wrap(&src[offset..], &mut self.scratch)?;
            offset += result.consumed;
            self.net_out.extend_from_slice(&self.scratch[..result.produced]);

            match result.status {
                EngineStatus::Closed => return Err(TlsError::Closed),
                EngineStatus::BufferOverflow => {
                    if result.produced == 0 {
                        let next = grow(self.scratch.len())?;
                        self.scratch.resize(next, 0);
                    }
                    continue;
                }
                _ => {}
            }

            if offset >= src.len() {
                return Ok(result);
            }
            if result.consumed == 0 && result.produced == 0 {
                return Err(TlsError::Engine("wrap made no progress".to_string()));
            }
        }
    }
}

fn grow(current: usize) -> Result<usize, TlsError> {
    if current >= MAX_BUFFER {
        return Err(TlsError::Engine(format!("buffer would exceed {} bytes", MAX_BUFFER)));
    }
    Ok((current * 2).clamp(1, MAX_BUFFER))
}
