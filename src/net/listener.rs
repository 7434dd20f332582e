//! Listening sockets.
//!
//! A [`Listener`] binds the address its port's protocol names, watches the
//! socket for readability and turns each accepted socket into an
//! established [`Connection`]. TLS protocols wrap the socket in a rustls
//! server session before the connection sees it.

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use socket2::{Domain, Protocol as IpProtocol, SockRef, Socket, Type};

use crate::error::{NetworkError, Result};
use crate::net::connection::Connection;
use crate::net::events::Event;
use crate::net::server::ServerContext;
use crate::net::tls;
use crate::net::traits::LogLevel;
use crate::net::transport::{PlainTransport, TlsTransport, Transport};
use crate::protocol::TransportKind;

enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

pub struct Listener {
    socket: BoundSocket,
    tls: Option<Arc<rustls::ServerConfig>>,
    ctx: Rc<ServerContext>,
    this: Weak<Listener>,
}

impl Listener {
    /// Binds the port's address. Bind failures are fatal startup errors.
    pub fn bind(ctx: Rc<ServerContext>) -> Result<Rc<Self>> {
        let info = ctx.protocol().info().clone();
        let config = ctx.config();

        let tls = match info.transport {
            TransportKind::Ssl => {
                let (cert, key) = match (&config.tls_cert, &config.tls_key) {
                    (Some(cert), Some(key)) => (cert, key),
                    _ => {
                        return Err(NetworkError::Configuration(format!(
                            "'{}' needs tls-cert and tls-key",
                            info.name
                        )))
                    }
                };
                Some(tls::server_config(cert, key)?)
            }
            _ => None,
        };

        let socket = match info.transport {
            TransportKind::Tcp | TransportKind::Ssl => {
                BoundSocket::Tcp(bind_tcp(&info.host, info.port, ctx.config())?)
            }
            TransportKind::Unix => {
                let path = PathBuf::from(&info.host);
                if path.exists() {
                    // stale socket from an earlier run
                    fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path).map_err(|source| NetworkError::Bind {
                    address: info.socket_address(),
                    source,
                })?;
                listener.set_nonblocking(true)?;
                BoundSocket::Unix(listener, path)
            }
            TransportKind::Udp => {
                return Err(NetworkError::UnsupportedProtocol(format!(
                    "{} (datagram listeners are not supported)",
                    info.name
                )))
            }
        };

        ctx.logger()
            .log(LogLevel::Info, &format!("Listening on {}", info.name));

        Ok(Rc::new_cyclic(|this| Self {
            socket,
            tls,
            ctx,
            this: this.clone(),
        }))
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.socket {
            BoundSocket::Tcp(listener) => listener.as_raw_fd(),
            BoundSocket::Unix(listener, _) => listener.as_raw_fd(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            BoundSocket::Tcp(listener) => listener.local_addr().ok(),
            BoundSocket::Unix(..) => None,
        }
    }

    /// Starts (or restarts) accepting connections.
    pub fn resume_accept(&self) -> Result<()> {
        let weak = self.this.clone();
        self.ctx.event_loop().on_readable(
            self.raw_fd(),
            Rc::new(move |_| {
                if let Some(listener) = weak.upgrade() {
                    listener.accept_one();
                }
            }),
        )
    }

    pub fn pause_accept(&self) {
        self.ctx.event_loop().off_readable(self.raw_fd());
    }

    /// Stops accepting and removes a Unix socket file. Existing connections
    /// are unaffected.
    pub fn close(&self) {
        self.pause_accept();
        if let BoundSocket::Unix(_, path) = &self.socket {
            let _ = fs::remove_file(path);
        }
    }

    /// Accepts one pending connection. An empty backlog is not an error.
    fn accept_one(&self) {
        let accepted = match &self.socket {
            BoundSocket::Tcp(listener) => listener
                .accept()
                .and_then(|(stream, peer)| self.wrap_tcp(stream).map(|t| (t, peer.to_string()))),
            BoundSocket::Unix(listener, path) => listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(true)?;
                let transport: Box<dyn Transport> = Box::new(PlainTransport::<UnixStream>::new(stream));
                Ok((transport, format!("unix://{}", path.display())))
            }),
        };

        let (transport, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.ctx
                    .logger()
                    .log(LogLevel::Error, &format!("Accept error: {}", e));
                return;
            }
        };

        let connection = match Connection::accepted(self.ctx.clone(), transport, remote) {
            Ok(connection) => connection,
            Err(e) => {
                self.ctx.logger().log(
                    LogLevel::Error,
                    &format!("Failed to register connection: {}", e),
                );
                return;
            }
        };
        self.ctx.stats().record_accept();
        self.ctx.logger().log(
            LogLevel::Debug,
            &format!(
                "New connection: {} (id: {})",
                connection.remote_address(),
                connection.id()
            ),
        );

        if let Err(e) = self
            .ctx
            .callbacks()
            .try_emit_connection(Event::Connect, &connection)
        {
            self.ctx.logger().log(
                LogLevel::Error,
                &format!("Error in 'connect' callback: {:#}", e),
            );
            connection.close();
        }
    }

    fn wrap_tcp(&self, stream: TcpStream) -> io::Result<Box<dyn Transport>> {
        stream.set_nonblocking(true)?;
        let config = self.ctx.config();
        if let Err(e) = stream.set_nodelay(config.no_delay) {
            self.ctx
                .logger()
                .log(LogLevel::Warn, &format!("Failed to set TCP_NODELAY: {}", e));
        }
        if let Err(e) = SockRef::from(&stream).set_keepalive(config.keep_alive) {
            self.ctx
                .logger()
                .log(LogLevel::Warn, &format!("Failed to set SO_KEEPALIVE: {}", e));
        }

        match &self.tls {
            Some(tls) => {
                let session = tls::accept_session(tls)
                    .map_err(|e| io::Error::other(e.to_string()))?;
                Ok(Box::new(TlsTransport::new(session, stream)))
            }
            None => Ok(Box::new(PlainTransport::new(stream))),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("uri", &self.ctx.protocol().name())
            .field("fd", &self.raw_fd())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// `SO_REUSEADDR` (and optionally `SO_REUSEPORT`) TCP listener in
/// non-blocking mode.
fn bind_tcp(host: &str, port: u16, config: &crate::net::config::ServerConfig) -> Result<TcpListener> {
    let address = format!("{}:{}", host, port);
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|source| NetworkError::Bind {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| NetworkError::Configuration(format!("'{}' does not resolve", address)))?;

    let bind_error = |source| NetworkError::Bind {
        address: address.clone(),
        source,
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(IpProtocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    if config.reuse_port {
        socket.set_reuse_port(true).map_err(bind_error)?;
    }
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(config.backlog).map_err(bind_error)?;
    Ok(socket.into())
}
