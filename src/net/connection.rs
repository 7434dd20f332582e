//! Per-connection buffering, framing and backpressure.
//!
//! A [`Connection`] owns one transport, a receive buffer and a send buffer.
//! The event loop only holds weak callbacks keyed by the descriptor; the
//! owning server's connection table keeps the connection alive until
//! [`Connection::destroy`] removes it.
//!
//! ```text
//!  readable ──▶ read chunk ──▶ recv buffer ──▶ check_package_length ─┐
//!                                   ▲                                │
//!                                   └──── remainder ◀── split ◀──────┘
//!                                                        │
//!                                                        ▼
//!                                              Protocol::execute ──▶ callbacks
//!
//!  send ──▶ direct write ──(partial / would block)──▶ send buffer ──▶ writable
//! ```
//!
//! Lifecycle: `Initial → Connecting → Established → Closing → Closed`.
//! `Connecting` is only used by outbound connections. `Closing` waits for the
//! send buffer and any bytes held by the transport to drain. `Closed` is terminal.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};

use crate::net::events::{Event, TcpErrorKind};
use crate::net::server::ServerContext;
use crate::net::traits::{ConnectionId, LogLevel};
use crate::net::transport::{HandshakeStatus, Transport};
use crate::protocol::{ConnectionKind, PackageLength, Protocol, ProtocolContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initial = 0,
    Connecting = 1,
    Established = 2,
    Closing = 4,
    Closed = 8,
}

/// Outcome of [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Written to the transport in full.
    Sent,
    /// Buffered; flushed once the socket is writable or the connection is
    /// established.
    Queued,
    /// Dropped: the connection is closing, the send buffer is full, or the
    /// socket failed.
    Rejected,
}

pub struct Connection {
    id: ConnectionId,
    fd: RawFd,
    remote_address: RefCell<String>,
    transport: RefCell<Option<Box<dyn Transport>>>,
    recv_buffer: RefCell<BytesMut>,
    send_buffer: RefCell<BytesMut>,
    /// Scratch space for transport reads, sized on first use.
    read_chunk: RefCell<Vec<u8>>,
    /// Length of the package being waited for, 0 when unknown.
    expected_len: Cell<usize>,
    status: Cell<ConnectionStatus>,
    read_buffer_size: usize,
    max_send_buffer_size: Cell<usize>,
    max_package_size: Cell<usize>,
    tls_handshake_done: Cell<bool>,
    paused: Cell<bool>,
    buffer_full: Cell<bool>,
    bytes_read: Cell<u64>,
    bytes_written: Cell<u64>,
    client_mode: bool,
    context: RefCell<ProtocolContext>,
    ctx: Rc<ServerContext>,
    this: Weak<Connection>,
}

impl Connection {
    fn build(
        ctx: Rc<ServerContext>,
        transport: Box<dyn Transport>,
        remote_address: String,
        client_mode: bool,
    ) -> Rc<Self> {
        let config = ctx.config();
        let id = ctx.next_connection_id();
        let fd = transport.raw_fd();
        let secure = transport.is_secure();
        let read_buffer_size = config.read_buffer_size.max(1);
        let max_send_buffer_size = config.max_send_buffer_size;
        let max_package_size = config.max_package_size;
        let context = ctx.protocol().make_context();

        Rc::new_cyclic(|this| Self {
            id,
            fd,
            remote_address: RefCell::new(remote_address),
            transport: RefCell::new(Some(transport)),
            recv_buffer: RefCell::new(BytesMut::new()),
            send_buffer: RefCell::new(BytesMut::new()),
            read_chunk: RefCell::new(Vec::new()),
            expected_len: Cell::new(0),
            status: Cell::new(ConnectionStatus::Initial),
            read_buffer_size,
            max_send_buffer_size: Cell::new(max_send_buffer_size),
            max_package_size: Cell::new(max_package_size),
            tls_handshake_done: Cell::new(!secure),
            paused: Cell::new(false),
            buffer_full: Cell::new(false),
            bytes_read: Cell::new(0),
            bytes_written: Cell::new(0),
            client_mode,
            context: RefCell::new(context),
            ctx,
            this: this.clone(),
        })
    }

    /// Wraps an accepted socket: the connection is established, tracked by
    /// the server and watched for readability.
    pub(crate) fn accepted(
        ctx: Rc<ServerContext>,
        transport: Box<dyn Transport>,
        remote_address: String,
    ) -> crate::error::Result<Rc<Self>> {
        let connection = Self::build(ctx, transport, remote_address, false);
        connection.status.set(ConnectionStatus::Established);
        connection.ctx.track(connection.clone());
        if let Err(e) = connection.watch_readable() {
            connection.destroy();
            return Err(e);
        }
        Ok(connection)
    }

    /// Wraps a socket whose non-blocking connect is in flight. The caller
    /// confirms the connection and then calls [`establish`](Self::establish).
    pub(crate) fn outbound(
        ctx: Rc<ServerContext>,
        transport: Box<dyn Transport>,
        remote_address: String,
    ) -> Rc<Self> {
        let connection = Self::build(ctx, transport, remote_address, true);
        connection.status.set(ConnectionStatus::Connecting);
        connection.ctx.track(connection.clone());
        connection
    }

    /// Completes an outbound connect: starts reading and flushes anything
    /// queued while connecting.
    pub(crate) fn establish(&self, remote_address: Option<String>) -> crate::error::Result<()> {
        if self.status.get() != ConnectionStatus::Connecting {
            return Ok(());
        }
        if let Some(address) = remote_address {
            *self.remote_address.borrow_mut() = address;
        }
        self.status.set(ConnectionStatus::Established);
        self.watch_readable()?;
        self.ctx.protocol().on_connect(self)?;
        if !self.tls_handshake_done.get() {
            // the client speaks first in TLS
            self.step_handshake();
        } else if !self.send_buffer.borrow().is_empty() {
            self.watch_writable();
        }
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn remote_address(&self) -> String {
        self.remote_address.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn is_established(&self) -> bool {
        self.status.get() == ConnectionStatus::Established
    }

    pub fn is_closed(&self) -> bool {
        self.status.get() == ConnectionStatus::Closed
    }

    /// Whether this connection was opened by a local connect rather than
    /// an accept.
    pub fn is_client_mode(&self) -> bool {
        self.client_mode
    }

    pub fn is_secure(&self) -> bool {
        self.transport
            .borrow()
            .as_ref()
            .is_some_and(|t| t.is_secure())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub fn max_package_size(&self) -> usize {
        self.max_package_size.get()
    }

    pub fn set_max_package_size(&self, size: usize) {
        self.max_package_size.set(size);
    }

    pub fn max_send_buffer_size(&self) -> usize {
        self.max_send_buffer_size.get()
    }

    pub fn set_max_send_buffer_size(&self, size: usize) {
        self.max_send_buffer_size.set(size);
    }

    pub fn recv_buffer_len(&self) -> usize {
        self.recv_buffer.borrow().len()
    }

    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer.borrow().len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    pub fn protocol(&self) -> &Protocol {
        self.ctx.protocol()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.ctx.protocol().connection_kind()
    }

    /// Listener-wide state: protocol, callbacks, logger.
    pub fn server_context(&self) -> &Rc<ServerContext> {
        &self.ctx
    }

    /// Protocol state private to this connection.
    pub fn context(&self) -> Ref<'_, ProtocolContext> {
        self.context.borrow()
    }

    pub fn context_mut(&self) -> RefMut<'_, ProtocolContext> {
        self.context.borrow_mut()
    }

    fn watch_readable(&self) -> crate::error::Result<()> {
        let weak = self.this.clone();
        self.ctx.event_loop().on_readable(
            self.fd,
            Rc::new(move |_| {
                if let Some(connection) = weak.upgrade() {
                    connection.on_readable();
                }
            }),
        )
    }

    fn watch_writable(&self) {
        let weak = self.this.clone();
        let result = self.ctx.event_loop().on_writable(
            self.fd,
            Rc::new(move |_| {
                if let Some(connection) = weak.upgrade() {
                    connection.on_writable();
                }
            }),
        );
        if let Err(e) = result {
            self.ctx.logger().log(
                LogLevel::Error,
                &format!("Connection {}: cannot watch writability: {}", self.id, e),
            );
        }
    }

    /// Steps the TLS handshake. Returns `true` once it is complete.
    fn step_handshake(&self) -> bool {
        if self.tls_handshake_done.get() {
            return true;
        }
        let status = match self.transport.borrow_mut().as_mut() {
            Some(transport) => transport.handshake(),
            None => return false,
        };
        match status {
            HandshakeStatus::Done => {
                self.tls_handshake_done.set(true);
                if !self.send_buffer.borrow().is_empty() {
                    self.watch_writable();
                }
                true
            }
            HandshakeStatus::Pending => false,
            HandshakeStatus::Failed(reason) => {
                self.ctx.logger().log(
                    LogLevel::Debug,
                    &format!("TLS handshake failed on connection {}: {}", self.id, reason),
                );
                self.destroy();
                false
            }
        }
    }

    /// Reads one chunk and frames as many packages as it completes.
    pub fn on_readable(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.status.get() == ConnectionStatus::Closed {
            return;
        }
        if !self.step_handshake() {
            return;
        }

        // taken out so a nested read from a callback cannot alias it
        let mut chunk = self.read_chunk.take();
        chunk.resize(self.read_buffer_size, 0);
        let result = match self.transport.borrow_mut().as_mut() {
            Some(transport) => transport.read(&mut chunk),
            None => return,
        };
        match result {
            Ok(0) => {
                self.destroy();
                return;
            }
            Ok(n) => {
                self.bytes_read.set(self.bytes_read.get() + n as u64);
                self.recv_buffer.borrow_mut().extend_from_slice(&chunk[..n]);
                self.ctx.callbacks().emit_receive(&this, &chunk[..n]);
                self.read_chunk.replace(chunk);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                self.read_chunk.replace(chunk);
                return;
            }
            Err(e) => {
                self.ctx.stats().record_read_failure();
                self.ctx.logger().log(
                    LogLevel::Debug,
                    &format!("Read error on connection {}: {}", self.id, e),
                );
                self.destroy();
                return;
            }
        }

        self.drain(&this);
    }

    /// Hands every complete package in the receive buffer to the protocol,
    /// in arrival order.
    fn drain(&self, this: &Rc<Connection>) {
        let protocol = self.ctx.protocol();
        loop {
            if self.paused.get() || self.status.get() != ConnectionStatus::Established {
                return;
            }
            let available = self.recv_buffer.borrow().len();
            if available == 0 {
                return;
            }

            let mut expected = self.expected_len.get();
            if expected == 0 {
                let verdict = {
                    let buffer = self.recv_buffer.borrow();
                    protocol.check_package_length(&buffer, self)
                };
                match verdict {
                    PackageLength::NeedMore | PackageLength::Complete(0) => return,
                    PackageLength::Reject { reply } => {
                        match reply {
                            Some(reply) => self.close_with(reply),
                            None => self.close(),
                        }
                        return;
                    }
                    PackageLength::Complete(n) if n > self.max_package_size.get() => {
                        self.ctx.logger().log(
                            LogLevel::Debug,
                            &format!(
                                "Package of {} bytes exceeds max package size on connection {}",
                                n, self.id
                            ),
                        );
                        self.destroy();
                        return;
                    }
                    PackageLength::Complete(n) => {
                        expected = n;
                        self.expected_len.set(n);
                    }
                }
            }
            if available < expected {
                return;
            }

            let package = self.recv_buffer.borrow_mut().split_to(expected).freeze();
            self.expected_len.set(0);
            if let Err(e) = protocol.execute(&self.ctx, package, this) {
                self.ctx.logger().log(
                    LogLevel::Error,
                    &format!("Error handling package on connection {}: {}", self.id, e),
                );
            }
        }
    }

    fn write_transport(&self, data: &[u8]) -> io::Result<usize> {
        match self.transport.borrow_mut().as_mut() {
            Some(transport) => transport.write(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn transport_has_pending(&self) -> bool {
        self.transport
            .borrow()
            .as_ref()
            .is_some_and(|t| t.has_pending())
    }

    fn emit(&self, event: Event) {
        if let Some(this) = self.this.upgrade() {
            self.ctx.callbacks().emit_connection(event, &this);
        }
    }

    fn emit_send_failure(&self, message: &str) {
        self.ctx.stats().record_send_failure();
        if let Some(this) = self.this.upgrade() {
            self.ctx
                .callbacks()
                .emit_tcp_error(&this, TcpErrorKind::SendFailed, message);
        }
    }

    fn check_buffer_full(&self) {
        let buffered = self.send_buffer.borrow().len();
        if buffered >= self.max_send_buffer_size.get() && !self.buffer_full.get() {
            self.buffer_full.set(true);
            self.emit(Event::BufferFull);
        }
    }

    /// Appends to the send buffer unless that would take it past the limit.
    fn enqueue(&self, data: &[u8]) -> SendResult {
        let buffered = self.send_buffer.borrow().len();
        if buffered + data.len() > self.max_send_buffer_size.get() {
            self.emit_send_failure("Send buffer is full, package dropped");
            return SendResult::Rejected;
        }
        self.send_buffer.borrow_mut().extend_from_slice(data);
        self.check_buffer_full();
        SendResult::Queued
    }

    /// Writes `data`, or queues it when the socket cannot take it yet.
    pub fn send(&self, data: &[u8]) -> SendResult {
        match self.status.get() {
            ConnectionStatus::Closing | ConnectionStatus::Closed => return SendResult::Rejected,
            ConnectionStatus::Initial | ConnectionStatus::Connecting => return self.enqueue(data),
            ConnectionStatus::Established => {}
        }
        if !self.tls_handshake_done.get() || !self.send_buffer.borrow().is_empty() {
            return self.enqueue(data);
        }
        if data.is_empty() {
            return SendResult::Sent;
        }

        match self.write_transport(data) {
            Ok(n) if n == data.len() => {
                self.bytes_written.set(self.bytes_written.get() + n as u64);
                if self.transport_has_pending() {
                    self.watch_writable();
                }
                SendResult::Sent
            }
            Ok(n) => {
                self.bytes_written.set(self.bytes_written.get() + n as u64);
                self.send_buffer.borrow_mut().extend_from_slice(&data[n..]);
                self.watch_writable();
                self.check_buffer_full();
                SendResult::Queued
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_buffer.borrow_mut().extend_from_slice(data);
                self.watch_writable();
                self.check_buffer_full();
                SendResult::Queued
            }
            Err(e) => {
                self.ctx.logger().log(
                    LogLevel::Debug,
                    &format!("Write error on connection {}: {}", self.id, e),
                );
                self.emit_send_failure("client closed");
                self.destroy();
                SendResult::Rejected
            }
        }
    }

    /// Flushes the send buffer.
    pub fn on_writable(&self) {
        if self.status.get() == ConnectionStatus::Closed {
            return;
        }
        if !self.step_handshake() {
            return;
        }

        let flushed = match self.transport.borrow_mut().as_mut() {
            Some(transport) => transport.flush_pending(),
            None => return,
        };
        match flushed {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.fail_write(e);
                return;
            }
        }

        let result = {
            let buffer = self.send_buffer.borrow();
            if buffer.is_empty() {
                Ok(0)
            } else {
                match self.transport.borrow_mut().as_mut() {
                    Some(transport) => transport.write(&buffer),
                    None => return,
                }
            }
        };

        match result {
            Ok(n) => {
                self.bytes_written.set(self.bytes_written.get() + n as u64);
                let remaining = {
                    let mut buffer = self.send_buffer.borrow_mut();
                    let consumed = n.min(buffer.len());
                    buffer.advance(consumed);
                    buffer.len()
                };
                if remaining < self.max_send_buffer_size.get() {
                    self.buffer_full.set(false);
                }
                if remaining == 0 && !self.transport_has_pending() {
                    self.ctx.event_loop().off_writable(self.fd);
                    self.emit(Event::BufferDrain);
                    if self.status.get() == ConnectionStatus::Closing {
                        self.destroy();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.fail_write(e),
        }
    }

    fn fail_write(&self, e: io::Error) {
        self.ctx.logger().log(
            LogLevel::Debug,
            &format!("Flush failed on connection {}: {}", self.id, e),
        );
        self.emit_send_failure("client closed");
        self.destroy();
    }

    /// Closes once the send buffer and the transport have drained.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Queues `data` as the last bytes of the connection, then closes.
    pub fn close_with(&self, data: &[u8]) {
        self.close_inner(Some(data));
    }

    fn close_inner(&self, data: Option<&[u8]>) {
        match self.status.get() {
            ConnectionStatus::Connecting => {
                self.destroy();
                return;
            }
            ConnectionStatus::Closing | ConnectionStatus::Closed => return,
            _ => {}
        }
        if let Some(data) = data {
            self.send(data);
            if self.status.get() == ConnectionStatus::Closed {
                return;
            }
        }

        self.status.set(ConnectionStatus::Closing);
        if self.send_buffer.borrow().is_empty() && !self.transport_has_pending() {
            self.destroy();
        } else {
            self.ctx.event_loop().off_readable(self.fd);
            self.paused.set(true);
            self.watch_writable();
        }
    }

    /// Stops reading until [`resume_recv`](Self::resume_recv).
    pub fn pause_recv(&self) {
        self.ctx.event_loop().off_readable(self.fd);
        self.paused.set(true);
    }

    pub fn resume_recv(&self) {
        if !self.paused.get() || self.status.get() != ConnectionStatus::Established {
            return;
        }
        self.paused.set(false);
        if let Err(e) = self.watch_readable() {
            self.ctx.logger().log(
                LogLevel::Error,
                &format!("Connection {}: cannot resume reading: {}", self.id, e),
            );
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.drain(&this);
        }
    }

    /// Tears the connection down immediately. Idempotent.
    ///
    /// The `close` event fires after the socket is released but before the
    /// buffers are reset.
    pub fn destroy(&self) {
        if self.status.get() == ConnectionStatus::Closed {
            return;
        }
        let event_loop = self.ctx.event_loop();
        event_loop.off_readable(self.fd);
        event_loop.off_writable(self.fd);

        let transport = self.transport.borrow_mut().take();
        if let Some(mut transport) = transport {
            transport.close();
        }

        self.status.set(ConnectionStatus::Closed);
        self.ctx.stats().record_destroy();
        self.emit(Event::Close);

        self.recv_buffer.borrow_mut().clear();
        self.send_buffer.borrow_mut().clear();
        self.expected_len.set(0);
        self.paused.set(false);
        self.buffer_full.set(false);

        self.ctx.untrack(self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("remote_address", &*self.remote_address.borrow())
            .field("status", &self.status.get())
            .field("client_mode", &self.client_mode)
            .finish_non_exhaustive()
    }
}
