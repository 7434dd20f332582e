//! Byte transports underneath a [`Connection`](crate::net::connection::Connection).
//!
//! A transport is a non-blocking byte pipe. [`PlainTransport`] wraps a socket
//! directly; [`TlsTransport`] runs a rustls session over one, stepping the
//! handshake on readability and keeping ciphertext that the socket could not
//! take yet until the next writability notification.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use rustls::Connection as TlsSession;

/// Progress of a transport-level handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Done,
    /// Waiting for the peer; try again on the next readability event.
    Pending,
    Failed(String),
}

pub trait Transport {
    /// One non-blocking read. `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// One non-blocking write; returns how many bytes were taken.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Pushes bytes the transport holds internally. `Ok(true)` once nothing
    /// is left.
    fn flush_pending(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// Whether bytes accepted by `write` are still held internally.
    fn has_pending(&self) -> bool {
        false
    }

    fn handshake(&mut self) -> HandshakeStatus {
        HandshakeStatus::Done
    }

    fn is_secure(&self) -> bool {
        false
    }

    /// Best-effort orderly shutdown before the descriptor is closed.
    fn close(&mut self) {}

    fn raw_fd(&self) -> RawFd;
}

/// Socket used as-is.
pub struct PlainTransport<S> {
    stream: S,
}

impl<S: Read + Write + AsRawFd> PlainTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write + AsRawFd> Transport for PlainTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// rustls session (server or client side) over a socket.
pub struct TlsTransport<S> {
    session: TlsSession,
    stream: S,
}

impl<S: Read + Write + AsRawFd> TlsTransport<S> {
    pub fn new(session: impl Into<TlsSession>, stream: S) -> Self {
        Self {
            session: session.into(),
            stream,
        }
    }

    /// Writes queued TLS records until the socket would block.
    fn write_records(&mut self) -> io::Result<bool> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.session.reader().read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(if filled > 0 { Some(filled) } else { None });
                }
                Err(e) => return Err(e),
            }
        }
        // Ok(0) from the reader means close_notify was received
        Ok(Some(filled))
    }
}

impl<S: Read + Write + AsRawFd> Transport for TlsTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(n) = self.read_plaintext(buf)? {
            return Ok(n);
        }
        if self.session.read_tls(&mut self.stream)? == 0 {
            return Ok(0);
        }
        self.session
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // alerts and key updates produced while processing
        self.write_records()?;
        match self.read_plaintext(buf)? {
            Some(n) => Ok(n),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.session.writer().write(data)?;
        self.write_records()?;
        Ok(n)
    }

    fn flush_pending(&mut self) -> io::Result<bool> {
        self.write_records()
    }

    fn has_pending(&self) -> bool {
        self.session.wants_write()
    }

    fn handshake(&mut self) -> HandshakeStatus {
        loop {
            match self.write_records() {
                Ok(true) => {}
                Ok(false) => return HandshakeStatus::Pending,
                Err(e) => return HandshakeStatus::Failed(e.to_string()),
            }
            if !self.session.is_handshaking() {
                return HandshakeStatus::Done;
            }
            match self.session.read_tls(&mut self.stream) {
                Ok(0) => return HandshakeStatus::Failed("peer closed during handshake".into()),
                Ok(_) => {
                    if let Err(e) = self.session.process_new_packets() {
                        // deliver the alert before giving up
                        let _ = self.write_records();
                        return HandshakeStatus::Failed(e.to_string());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::Pending
                }
                Err(e) => return HandshakeStatus::Failed(e.to_string()),
            }
        }
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.session.send_close_notify();
        let _ = self.write_records();
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
