use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use super::{EngineResult, EngineStatus, HandshakeStatus, RecordEngine, TlsError};

/// Largest TLS record plus header and expansion.
const PACKET_BUFFER: usize = 16 * 1024 + 325;
const APPLICATION_BUFFER: usize = 16 * 1024;

/// [`RecordEngine`] backed by a rustls server connection.
///
/// rustls has no delegated tasks and buffers partial records internally,
/// so unwrap never reports overflow and only underflows when every byte
/// offered was taken without producing anything.
pub struct RustlsEngine {
    conn: ServerConnection,
    was_handshaking: bool,
    inbound_done: bool,
}

impl RustlsEngine {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config).map_err(|e| TlsError::Engine(e.to_string()))?;
        Ok(Self {
            conn,
            was_handshaking: true,
            inbound_done: false,
        })
    }

    /// Reports `Finished` exactly once, on the call that completes the handshake.
    fn progress(&mut self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            return self.handshake_status();
        }
        if self.was_handshaking {
            self.was_handshaking = false;
            return HandshakeStatus::Finished;
        }
        HandshakeStatus::NotHandshaking
    }
}

impl RecordEngine for RustlsEngine {
    fn handshake_status(&self) -> HandshakeStatus {
        if !self.conn.is_handshaking() {
            HandshakeStatus::NotHandshaking
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NeedUnwrap
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let mut consumed = 0;
        if !src.is_empty() {
            let mut input = src;
            consumed = self.conn.read_tls(&mut input)?;
            self.conn
                .process_new_packets()
                .map_err(|e| TlsError::Engine(e.to_string()))?;
        }

        let mut produced = 0;
        let mut status = EngineStatus::Ok;
        while produced < dst.len() {
            match self.conn.reader().read(&mut dst[produced..]) {
                Ok(0) => {
                    self.inbound_done = true;
                    status = EngineStatus::Closed;
                    break;
                }
                Ok(n) => produced += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TlsError::Engine(e.to_string())),
            }
        }

        let handshake = self.progress();
        if status == EngineStatus::Ok
            && produced == 0
            && consumed == src.len()
            && !self.conn.wants_write()
        {
            status = EngineStatus::BufferUnderflow;
        }

        Ok(EngineResult {
            status,
            handshake,
            consumed,
            produced,
        })
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let consumed = if src.is_empty() {
            0
        } else {
            self.conn.writer().write(src)?
        };

        let mut produced = 0;
        while self.conn.wants_write() && produced < dst.len() {
            let mut out = &mut dst[produced..];
            let n = self.conn.write_tls(&mut out)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        let status = if self.conn.wants_write() {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult {
            status,
            handshake: self.progress(),
            consumed,
            produced,
        })
    }

    fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        None
    }

    fn close_outbound(&mut self) {
        self.conn.send_close_notify();
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER
    }

    fn application_buffer_size(&self) -> usize {
        APPLICATION_BUFFER
    }
}
