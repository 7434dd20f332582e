use std::fmt;
use std::io;

/// Errors surfaced by server setup, the event loop and the socket layer.
///
/// Protocol violations committed by peers never show up here at runtime; the
/// connection engine handles those locally by closing the offending
/// connection. A `NetworkError` escaping [`Server::start`](crate::Server::start)
/// is a fatal startup fault.
#[derive(Debug)]
pub enum NetworkError {
    Io(io::Error),
    Accept(io::Error),
    Bind { address: String, source: io::Error },
    Configuration(String),
    UnsupportedProtocol(String),
    UnsupportedEvent(String),
    BackendUnavailable,
    Tls(String),
    Protocol(ProtocolError),
    EventLoopGone,
    Other(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(e) => write!(f, "IO Error: {}", e),
            NetworkError::Accept(e) => write!(f, "Accept Error: {}", e),
            NetworkError::Bind { address, source } => {
                write!(f, "Bind Error: cannot listen on {}: {}", address, source)
            }
            NetworkError::Configuration(msg) => write!(f, "Configuration Error: {}", msg),
            NetworkError::UnsupportedProtocol(scheme) => {
                write!(f, "Unsupported protocol '{}'", scheme)
            }
            NetworkError::UnsupportedEvent(name) => write!(f, "Unsupported event name: {}", name),
            NetworkError::BackendUnavailable => {
                write!(f, "No event loop backend is available on this platform")
            }
            NetworkError::Tls(msg) => write!(f, "TLS Error: {}", msg),
            NetworkError::Protocol(e) => write!(f, "Protocol Error: {}", e),
            NetworkError::EventLoopGone => write!(f, "EventLoop is gone"),
            NetworkError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) | NetworkError::Accept(e) => Some(e),
            NetworkError::Bind { source, .. } => Some(source),
            NetworkError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

impl From<ProtocolError> for NetworkError {
    fn from(err: ProtocolError) -> Self {
        NetworkError::Protocol(err)
    }
}

impl From<rustls::Error> for NetworkError {
    fn from(err: rustls::Error) -> Self {
        NetworkError::Tls(err.to_string())
    }
}

/// Expected parse failures. These are ordinary values, not faults: the
/// caller decides whether the connection survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The request or status line could not be split into its parts.
    MalformedStartLine(String),
    /// A header name or value was rejected.
    MalformedHeader(String),
    InvalidUri(String),
    /// The `\r\n\r\n` header terminator is missing.
    IncompleteHead,
    MissingBoundary,
    EmptyBoundary,
    MalformedChunkedBody,
    MalformedFrame(&'static str),
    InvalidStatus(u16),
    /// The server did not accept a WebSocket upgrade.
    HandshakeRejected(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedStartLine(line) => write!(f, "malformed start line: {:?}", line),
            ProtocolError::MalformedHeader(msg) => write!(f, "malformed header: {}", msg),
            ProtocolError::InvalidUri(uri) => write!(f, "invalid uri: {:?}", uri),
            ProtocolError::IncompleteHead => write!(f, "HTTP raw content is broken"),
            ProtocolError::MissingBoundary => {
                write!(f, "multipart/form-data does not specify boundary")
            }
            ProtocolError::EmptyBoundary => write!(f, "boundary cannot be empty"),
            ProtocolError::MalformedChunkedBody => write!(f, "malformed chunked body"),
            ProtocolError::MalformedFrame(why) => write!(f, "malformed websocket frame: {}", why),
            ProtocolError::InvalidStatus(code) => write!(f, "invalid status code {}", code),
            ProtocolError::HandshakeRejected(why) => write!(f, "websocket handshake rejected: {}", why),
        }
    }
}

impl std::error::Error for ProtocolError {}
