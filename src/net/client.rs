//! Outbound connections.
//!
//! A [`TcpClient`] opens a client-mode [`Connection`] that is framed by the
//! same protocols as inbound ones: `http://` clients receive `response`
//! events, `ws://` clients send the upgrade request on connect and push
//! masked frames once the server accepts it, `tcp://` clients see raw
//! `receive` events.
//!
//! The connect itself never blocks. The socket is watched for writability,
//! and `SO_ERROR` decides whether the attempt succeeded:
//!
//! ```text
//!  connect() ──▶ Connecting ──writable──▶ SO_ERROR == 0 ──▶ Established + "connect"
//!                    │                         │
//!                    │                         └─ error ──▶ "tcperror" + destroy
//!                    └─ 5 s timeout (connect_async only) ──▶ task resumed with false
//! ```

use std::cell::{Cell, RefCell};
use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol as IpProtocol, Socket, Type};

use crate::error::{NetworkError, Result};
use crate::event_loop::TimerId;
use crate::net::connection::{Connection, ConnectionStatus, SendResult};
use crate::net::events::{Callback, Event, TcpErrorKind};
use crate::net::server::ServerContext;
use crate::net::tls;
use crate::net::traits::LogLevel;
use crate::net::transport::{PlainTransport, TlsTransport, Transport};
use crate::protocol::TransportKind;
use crate::task::TaskId;

/// How long [`TcpClient::connect_async`] waits before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpClient {
    ctx: Rc<ServerContext>,
    tls: RefCell<Option<Arc<rustls::ClientConfig>>>,
    connection: RefCell<Option<Rc<Connection>>>,
    waiter: Rc<Cell<Option<TaskId>>>,
    timeout: Rc<Cell<Option<TimerId>>>,
}

impl TcpClient {
    pub(crate) fn new(ctx: Rc<ServerContext>) -> Self {
        Self {
            ctx,
            tls: RefCell::new(None),
            connection: RefCell::new(None),
            waiter: Rc::new(Cell::new(None)),
            timeout: Rc::new(Cell::new(None)),
        }
    }

    /// Trust settings for `https://` and `wss://` targets.
    pub fn with_tls(self, config: Arc<rustls::ClientConfig>) -> Self {
        *self.tls.borrow_mut() = Some(config);
        self
    }

    pub fn on(&self, event: &str, callback: Callback) -> Result<()> {
        self.ctx.callbacks().register_named(event, callback)
    }

    pub fn uri(&self) -> &str {
        self.ctx.protocol().name()
    }

    pub fn context(&self) -> &Rc<ServerContext> {
        &self.ctx
    }

    /// The connection of the latest [`connect`](Self::connect) call.
    pub fn connection(&self) -> Option<Rc<Connection>> {
        self.connection.borrow().clone()
    }

    /// Sends through the current connection; data sent while connecting is
    /// queued.
    pub fn send(&self, data: &[u8]) -> SendResult {
        match self.connection() {
            Some(connection) => connection.send(data),
            None => SendResult::Rejected,
        }
    }

    pub fn close(&self) {
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    /// Starts a non-blocking connect. The `connect` event fires once the
    /// socket is confirmed; a failed attempt fires `tcperror` instead.
    pub fn connect(&self) -> Result<Rc<Connection>> {
        let info = self.ctx.protocol().info().clone();
        let config = self.ctx.config();
        if !matches!(info.transport, TransportKind::Tcp | TransportKind::Ssl) {
            return Err(NetworkError::UnsupportedProtocol(format!(
                "{} (clients connect over tcp or ssl)",
                info.name
            )));
        }

        let addr = (info.host.as_str(), info.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                NetworkError::Configuration(format!("'{}' does not resolve", info.name))
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(IpProtocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        let _ = socket.set_nodelay(config.no_delay);
        let _ = socket.set_keepalive(config.keep_alive);

        let stream: TcpStream = socket.into();
        let probe = stream.try_clone()?;
        let transport: Box<dyn Transport> = match info.transport {
            TransportKind::Ssl => {
                let tls_config = self.tls.borrow().clone().ok_or_else(|| {
                    NetworkError::Configuration(format!(
                        "'{}' needs a TLS client configuration",
                        info.name
                    ))
                })?;
                let session = tls::connect_session(&tls_config, &info.host)?;
                Box::new(TlsTransport::new(session, stream))
            }
            _ => Box::new(PlainTransport::new(stream)),
        };

        let connection = Connection::outbound(self.ctx.clone(), transport, addr.to_string());
        *self.connection.borrow_mut() = Some(connection.clone());

        let weak = Rc::downgrade(&connection);
        let ctx = self.ctx.clone();
        let waiter = self.waiter.clone();
        let timeout = self.timeout.clone();
        let registered = self.ctx.event_loop().on_writable(
            connection.raw_fd(),
            Rc::new(move |_| {
                if let Some(connection) = weak.upgrade() {
                    confirm(&ctx, &connection, &probe, &waiter, &timeout);
                }
            }),
        );
        if let Err(e) = registered {
            connection.destroy();
            return Err(e);
        }
        Ok(connection)
    }

    /// Connects from inside a task and suspends it until the attempt
    /// resolves. Resolves to `false` on failure or after
    /// [`CONNECT_TIMEOUT`].
    pub async fn connect_async(&self) -> Result<bool> {
        let tasks = self.ctx.tasks().clone();
        let task = tasks.current().ok_or_else(|| {
            NetworkError::Configuration("connect_async must run inside a task".into())
        })?;
        self.connect()?;
        self.waiter.set(Some(task));

        let weak = Rc::downgrade(&tasks);
        let waiter = self.waiter.clone();
        let timer = self.ctx.timer().add(CONNECT_TIMEOUT, false, move || {
            if waiter.get() == Some(task) {
                waiter.set(None);
                if let Some(tasks) = weak.upgrade() {
                    if tasks.exists(task) {
                        tasks.resume(task, false);
                    }
                }
            }
            Ok(())
        })?;
        self.timeout.set(Some(timer));

        let value = tasks.suspend().await;
        Ok(value.downcast::<bool>().map(|ok| *ok).unwrap_or(false))
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("uri", &self.uri())
            .field("connection", &self.connection())
            .finish_non_exhaustive()
    }
}

/// Writability callback of a connecting socket.
fn confirm(
    ctx: &Rc<ServerContext>,
    connection: &Rc<Connection>,
    probe: &TcpStream,
    waiter: &Cell<Option<TaskId>>,
    timeout: &Cell<Option<TimerId>>,
) {
    ctx.event_loop().off_writable(connection.raw_fd());
    if connection.status() != ConnectionStatus::Connecting {
        return;
    }
    if let Some(timer) = timeout.take() {
        ctx.timer().del(timer);
    }

    let outcome = match probe.take_error() {
        Ok(None) => probe.peer_addr().map_err(|e| e.to_string()),
        Ok(Some(e)) | Err(e) => Err(e.to_string()),
    };

    let connected = match outcome {
        Ok(peer) => match connection.establish(Some(peer.to_string())) {
            Ok(()) => match ctx.callbacks().try_emit_connection(Event::Connect, connection) {
                Ok(()) => true,
                Err(e) => {
                    ctx.logger().log(
                        LogLevel::Error,
                        &format!("Error in 'connect' callback: {:#}", e),
                    );
                    connection.close();
                    false
                }
            },
            Err(e) => {
                fail(ctx, connection, &e.to_string());
                false
            }
        },
        Err(reason) => {
            fail(ctx, connection, &reason);
            false
        }
    };

    if let Some(task) = waiter.take() {
        ctx.tasks().resume(task, connected);
    }
}

fn fail(ctx: &ServerContext, connection: &Rc<Connection>, reason: &str) {
    let message = format!("connect {} fail, {}", connection.remote_address(), reason);
    ctx.logger().log(LogLevel::Debug, &message);
    ctx.callbacks()
        .emit_tcp_error(connection, TcpErrorKind::ConnectFailed, &message);
    connection.destroy();
}
