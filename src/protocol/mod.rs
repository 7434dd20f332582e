//! Wire protocols.
//!
//! A protocol answers two questions for the connection engine:
//!
//! 1. `check_package_length`: given the bytes received so far, how many of
//!    them form the next package (or: wait, or: reject the peer)?
//! 2. `execute`: what to do with one complete package, usually parse it and
//!    emit a named event.
//!
//! Protocol values hold only listener-wide settings and bounded parse caches.
//! Everything that belongs to a single connection lives in its
//! [`ProtocolContext`].
//!
//! ```text
//!  listen URI ──▶ ProtocolRegistry ──▶ Protocol
//!   "ws://0.0.0.0:8080"                  ├── RawTcp     tcp://, unix://
//!                                        ├── Text       text://
//!                                        ├── Http       http://, https://
//!                                        ├── WebSocket  ws://, wss://
//!                                        └── Custom     register()
//! ```

pub mod http;
pub mod raw;
pub mod text;
pub mod websocket;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use url::{Host, Url};

use crate::error::{NetworkError, ProtocolError, Result};
use crate::net::config::ServerConfig;
use crate::net::connection::Connection;
use crate::net::events::Event;
use crate::net::server::ServerContext;

pub use http::HttpProtocol;
pub use raw::RawTcpProtocol;
pub use text::TextProtocol;
pub use websocket::{WebSocketContext, WebSocketProtocol};

/// Fixed responses written before a full response object can be built.
pub mod canned {
    pub const OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
    pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
    pub const PAYLOAD_TOO_LARGE: &[u8] = b"HTTP/1.1 413 Payload Too Large\r\n\r\n";
}

/// Outcome of asking a protocol where the next package ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageLength {
    /// Not enough bytes to tell yet.
    NeedMore,
    /// The next package is exactly this many bytes.
    Complete(usize),
    /// The peer sent something unacceptable. The connection writes `reply`
    /// (if any) and closes.
    Reject { reply: Option<&'static [u8]> },
}

impl PackageLength {
    pub const CLOSE: PackageLength = PackageLength::Reject { reply: None };

    pub fn reject_with(reply: &'static [u8]) -> Self {
        PackageLength::Reject { reply: Some(reply) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    Unix,
    Ssl,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Unix => "unix",
            TransportKind::Ssl => "ssl",
        }
    }

    /// The OS-level socket family; TLS runs over TCP.
    pub fn builtin(&self) -> TransportKind {
        match self {
            TransportKind::Ssl => TransportKind::Tcp,
            other => *other,
        }
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    fn base_events(&self) -> Vec<Event> {
        if self.is_stream() {
            Event::STREAM.to_vec()
        } else {
            Event::DATAGRAM.to_vec()
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a listener was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Host to bind, or the socket path for `unix`.
    pub host: String,
    pub port: u16,
    /// The URI the protocol was created from.
    pub name: String,
    pub transport: TransportKind,
}

impl ProtocolInfo {
    pub fn socket_address(&self) -> String {
        match self.transport {
            TransportKind::Unix => format!("unix://{}", self.host),
            TransportKind::Udp => format!("udp://{}:{}", self.host, self.port),
            _ => format!("tcp://{}:{}", self.host, self.port),
        }
    }
}

/// Which connection flavour a protocol expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp,
    Http,
    WebSocket,
}

/// Per-connection protocol state.
#[derive(Default)]
pub enum ProtocolContext {
    #[default]
    Default,
    WebSocket(WebSocketContext),
    Custom(Box<dyn Any>),
}

impl ProtocolContext {
    pub fn websocket(&self) -> Option<&WebSocketContext> {
        match self {
            ProtocolContext::WebSocket(ws) => Some(ws),
            _ => None,
        }
    }

    pub fn websocket_mut(&mut self) -> Option<&mut WebSocketContext> {
        match self {
            ProtocolContext::WebSocket(ws) => Some(ws),
            _ => None,
        }
    }

    pub fn custom<T: 'static>(&self) -> Option<&T> {
        match self {
            ProtocolContext::Custom(any) => any.downcast_ref(),
            _ => None,
        }
    }

    pub fn custom_mut<T: 'static>(&mut self) -> Option<&mut T> {
        match self {
            ProtocolContext::Custom(any) => any.downcast_mut(),
            _ => None,
        }
    }
}

impl fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolContext::Default => f.write_str("Default"),
            ProtocolContext::WebSocket(ws) => f.debug_tuple("WebSocket").field(ws).finish(),
            ProtocolContext::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Extension point for protocols outside the built-in set.
pub trait ProtocolHandler {
    fn info(&self) -> &ProtocolInfo;

    /// Events this protocol emits on top of the transport's.
    fn events(&self) -> Vec<Event> {
        Vec::new()
    }

    fn make_context(&self) -> ProtocolContext {
        ProtocolContext::Default
    }

    fn connection_kind(&self) -> ConnectionKind {
        ConnectionKind::Tcp
    }

    fn check_package_length(&self, buffer: &[u8], connection: &Connection) -> PackageLength;

    fn execute(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> std::result::Result<bool, ProtocolError>;
}

pub enum Protocol {
    RawTcp(RawTcpProtocol),
    Text(TextProtocol),
    Http(HttpProtocol),
    WebSocket(WebSocketProtocol),
    Custom(Rc<dyn ProtocolHandler>),
}

impl Protocol {
    pub fn info(&self) -> &ProtocolInfo {
        match self {
            Protocol::RawTcp(p) => p.info(),
            Protocol::Text(p) => p.info(),
            Protocol::Http(p) => p.info(),
            Protocol::WebSocket(p) => p.info(),
            Protocol::Custom(p) => p.info(),
        }
    }

    pub fn socket_address(&self) -> String {
        self.info().socket_address()
    }

    pub fn transport(&self) -> TransportKind {
        self.info().transport
    }

    pub fn builtin_transport(&self) -> TransportKind {
        self.transport().builtin()
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    /// Events this protocol emits, excluding the transport's.
    pub fn protocol_events(&self) -> Vec<Event> {
        match self {
            Protocol::RawTcp(_) => Vec::new(),
            Protocol::Text(_) => vec![Event::TextReceive],
            Protocol::Http(_) => HttpProtocol::EVENTS.to_vec(),
            Protocol::WebSocket(_) => WebSocketProtocol::EVENTS.to_vec(),
            Protocol::Custom(p) => p.events(),
        }
    }

    /// Every event name a listener using this protocol accepts.
    pub fn supported_events(&self) -> Vec<Event> {
        let mut events = self.transport().base_events();
        for event in self.protocol_events() {
            if !events.contains(&event) {
                events.push(event);
            }
        }
        events
    }

    pub fn make_context(&self) -> ProtocolContext {
        match self {
            Protocol::WebSocket(_) => ProtocolContext::WebSocket(WebSocketContext::default()),
            Protocol::Custom(p) => p.make_context(),
            _ => ProtocolContext::Default,
        }
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        match self {
            Protocol::RawTcp(_) | Protocol::Text(_) => ConnectionKind::Tcp,
            Protocol::Http(_) => ConnectionKind::Http,
            Protocol::WebSocket(_) => ConnectionKind::WebSocket,
            Protocol::Custom(p) => p.connection_kind(),
        }
    }

    pub fn check_package_length(&self, buffer: &[u8], connection: &Connection) -> PackageLength {
        match self {
            Protocol::RawTcp(p) => p.check_package_length(buffer, connection),
            Protocol::Text(p) => p.check_package_length(buffer, connection),
            Protocol::Http(p) => p.check_package_length(buffer, connection),
            Protocol::WebSocket(p) => p.check_package_length(buffer, connection),
            Protocol::Custom(p) => p.check_package_length(buffer, connection),
        }
    }

    pub fn execute(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> std::result::Result<bool, ProtocolError> {
        match self {
            Protocol::RawTcp(p) => p.execute(ctx, package, connection),
            Protocol::Text(p) => p.execute(ctx, package, connection),
            Protocol::Http(p) => p.execute(ctx, package, connection),
            Protocol::WebSocket(p) => p.execute(ctx, package, connection),
            Protocol::Custom(p) => p.execute(ctx, package, connection),
        }
    }

    /// Runs once an outbound connection is established, before anything
    /// is read from it.
    pub fn on_connect(&self, connection: &Connection) -> std::result::Result<(), ProtocolError> {
        match self {
            Protocol::WebSocket(p) => p.start_client_handshake(connection),
            _ => Ok(()),
        }
    }

    /// The HTTP layer of this protocol, if it has one.
    pub fn http(&self) -> Option<&HttpProtocol> {
        match self {
            Protocol::Http(p) => Some(p),
            Protocol::WebSocket(p) => Some(p.http()),
            _ => None,
        }
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Protocol::RawTcp(_) => "RawTcp",
            Protocol::Text(_) => "Text",
            Protocol::Http(_) => "Http",
            Protocol::WebSocket(_) => "WebSocket",
            Protocol::Custom(_) => "Custom",
        };
        f.debug_struct("Protocol")
            .field("kind", &kind)
            .field("info", self.info())
            .finish()
    }
}

pub type ProtocolConstructor = Rc<dyn Fn(ProtocolInfo, &ServerConfig) -> Result<Protocol>>;

struct SchemeEntry {
    transport: TransportKind,
    default_port: Option<u16>,
    construct: ProtocolConstructor,
}

/// Scheme → protocol constructor table.
pub struct ProtocolRegistry {
    schemes: HashMap<String, SchemeEntry>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self {
            schemes: HashMap::new(),
        };
        let raw: ProtocolConstructor =
            Rc::new(|info, _| Ok(Protocol::RawTcp(RawTcpProtocol::new(info))));
        let text: ProtocolConstructor =
            Rc::new(|info, _| Ok(Protocol::Text(TextProtocol::new(info))));
        let http: ProtocolConstructor =
            Rc::new(|info, config| Ok(Protocol::Http(HttpProtocol::new(info, config))));
        let ws: ProtocolConstructor = Rc::new(|info, config| {
            Ok(Protocol::WebSocket(WebSocketProtocol::new(info, config)))
        });

        registry.register("tcp", TransportKind::Tcp, None, raw.clone());
        registry.register("udp", TransportKind::Udp, None, raw.clone());
        registry.register("unix", TransportKind::Unix, None, raw);
        registry.register("text", TransportKind::Tcp, None, text);
        registry.register("http", TransportKind::Tcp, Some(80), http.clone());
        registry.register("https", TransportKind::Ssl, Some(443), http);
        registry.register("ws", TransportKind::Tcp, Some(80), ws.clone());
        registry.register("wss", TransportKind::Ssl, Some(443), ws);
        registry
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the constructor for `scheme`.
    pub fn register(
        &mut self,
        scheme: &str,
        transport: TransportKind,
        default_port: Option<u16>,
        construct: ProtocolConstructor,
    ) {
        self.schemes.insert(
            scheme.to_ascii_lowercase(),
            SchemeEntry {
                transport,
                default_port,
                construct,
            },
        );
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.schemes.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Parses a listen URI such as `http://0.0.0.0:8080` or
    /// `unix:///run/app.sock`.
    pub fn parse(&self, uri: &str) -> Result<ProtocolInfo> {
        let url = Url::parse(uri)
            .map_err(|e| NetworkError::Configuration(format!("malformed URI '{}': {}", uri, e)))?;
        let entry = self
            .schemes
            .get(url.scheme())
            .ok_or_else(|| NetworkError::UnsupportedProtocol(url.scheme().to_string()))?;

        if entry.transport == TransportKind::Unix {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(NetworkError::Configuration(format!(
                    "'{}' does not name a socket path",
                    uri
                )));
            }
            return Ok(ProtocolInfo {
                host: path.to_string(),
                port: 0,
                name: uri.to_string(),
                transport: entry.transport,
            });
        }

        let host = match url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            _ => {
                return Err(NetworkError::Configuration(format!(
                    "'{}' has no host",
                    uri
                )))
            }
        };
        let port = url
            .port()
            .or(entry.default_port)
            .ok_or_else(|| NetworkError::Configuration(format!("'{}' has no port", uri)))?;

        Ok(ProtocolInfo {
            host,
            port,
            name: uri.to_string(),
            transport: entry.transport,
        })
    }

    pub fn resolve(&self, uri: &str, config: &ServerConfig) -> Result<Protocol> {
        let info = self.parse(uri)?;
        let scheme = uri
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        let entry = self
            .schemes
            .get(&scheme)
            .ok_or(NetworkError::UnsupportedProtocol(scheme))?;
        (entry.construct)(info, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_uris() {
        let registry = ProtocolRegistry::new();

        let info = registry.parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.port, 8080);
        assert_eq!(info.transport, TransportKind::Tcp);
        assert_eq!(info.socket_address(), "tcp://127.0.0.1:8080");

        let info = registry.parse("wss://localhost").unwrap();
        assert_eq!(info.port, 443);
        assert_eq!(info.transport, TransportKind::Ssl);
        assert_eq!(info.transport.builtin(), TransportKind::Tcp);

        let info = registry.parse("tcp://[::1]:9000").unwrap();
        assert_eq!(info.host, "::1");

        let info = registry.parse("unix:///tmp/mill.sock").unwrap();
        assert_eq!(info.host, "/tmp/mill.sock");
        assert_eq!(info.socket_address(), "unix:///tmp/mill.sock");
    }

    #[test]
    fn test_configuration_errors() {
        let registry = ProtocolRegistry::new();
        assert!(matches!(
            registry.parse("gopher://x:70"),
            Err(NetworkError::UnsupportedProtocol(s)) if s == "gopher"
        ));
        assert!(matches!(
            registry.parse("tcp://127.0.0.1"),
            Err(NetworkError::Configuration(_))
        ));
        assert!(matches!(
            registry.parse("not a uri"),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[test]
    fn test_supported_events_per_protocol() {
        let registry = ProtocolRegistry::new();
        let config = ServerConfig::default();

        let ws = registry.resolve("ws://127.0.0.1:0", &config).unwrap();
        let events = ws.supported_events();
        for event in [Event::Connect, Event::Request, Event::Open, Event::Disconnect] {
            assert!(events.contains(&event), "{} missing", event);
        }
        assert_eq!(ws.connection_kind(), ConnectionKind::WebSocket);
        assert!(ws.make_context().websocket().is_some());

        let text = registry.resolve("text://127.0.0.1:7000", &config).unwrap();
        assert!(text.supported_events().contains(&Event::TextReceive));
        assert!(!text.supported_events().contains(&Event::Request));

        let udp = registry.resolve("udp://127.0.0.1:7000", &config).unwrap();
        assert!(udp.supported_events().contains(&Event::Packet));
        assert!(!udp.supported_events().contains(&Event::Connect));
    }

    #[test]
    fn test_plugin_registration() {
        let mut registry = ProtocolRegistry::new();
        registry.register(
            "echo",
            TransportKind::Tcp,
            Some(7),
            Rc::new(|info, _| Ok(Protocol::RawTcp(RawTcpProtocol::new(info)))),
        );
        assert!(registry.supports("ECHO"));
        let proto = registry
            .resolve("echo://127.0.0.1", &ServerConfig::default())
            .unwrap();
        assert_eq!(proto.info().port, 7);
        assert_eq!(proto.name(), "echo://127.0.0.1");
    }
}
