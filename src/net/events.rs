//! Named events and the callback registry.
//!
//! Every listener owns one [`CallbackRegistry`]. The set of accepted event
//! names is fixed when the registry is created (transport events plus the
//! events the protocol declares), so registering an unknown or unsupported
//! name fails while the server is being configured, not while it runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{NetworkError, Result};
use crate::net::connection::Connection;
use crate::net::traits::{LogLevel, Logger};
use crate::protocol::http::ServerRequest;
use crate::protocol::websocket::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Connect,
    Receive,
    Close,
    TcpError,
    BufferFull,
    BufferDrain,
    WorkerStart,
    WorkerStop,
    Shutdown,
    Packet,
    TextReceive,
    Request,
    Response,
    Open,
    Message,
    WebSocketPing,
    WebSocketPong,
    Disconnect,
}

impl Event {
    /// Events every stream transport (tcp, unix, ssl) supports.
    pub const STREAM: [Event; 9] = [
        Event::Connect,
        Event::Receive,
        Event::Close,
        Event::TcpError,
        Event::BufferFull,
        Event::BufferDrain,
        Event::WorkerStart,
        Event::WorkerStop,
        Event::Shutdown,
    ];

    /// Events a datagram transport supports.
    pub const DATAGRAM: [Event; 4] = [
        Event::Packet,
        Event::WorkerStart,
        Event::WorkerStop,
        Event::Shutdown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect => "connect",
            Event::Receive => "receive",
            Event::Close => "close",
            Event::TcpError => "tcperror",
            Event::BufferFull => "bufferfull",
            Event::BufferDrain => "bufferdrain",
            Event::WorkerStart => "workerstart",
            Event::WorkerStop => "workerstop",
            Event::Shutdown => "shutdown",
            Event::Packet => "packet",
            Event::TextReceive => "textreceive",
            Event::Request => "request",
            Event::Response => "response",
            Event::Open => "open",
            Event::Message => "message",
            Event::WebSocketPing => "websocketping",
            Event::WebSocketPong => "websocketpong",
            Event::Disconnect => "disconnect",
        }
    }

    /// Whether `callback` has the shape this event is emitted with.
    pub fn accepts(&self, callback: &Callback) -> bool {
        matches!(
            (self, callback),
            (
                Event::Connect | Event::Close | Event::BufferFull | Event::BufferDrain,
                Callback::Connection(_)
            ) | (Event::Receive, Callback::Data(_))
                | (Event::TextReceive, Callback::Text(_))
                | (Event::TcpError, Callback::TcpError(_))
                | (
                    Event::WorkerStart | Event::WorkerStop | Event::Shutdown,
                    Callback::Worker(_)
                )
                | (Event::Packet, Callback::Packet(_))
                | (Event::Request | Event::Open, Callback::Request(_))
                | (Event::Response, Callback::Response(_))
                | (
                    Event::Message
                        | Event::WebSocketPing
                        | Event::WebSocketPong
                        | Event::Disconnect,
                    Callback::Frame(_)
                )
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Event {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let event = match s.to_ascii_lowercase().as_str() {
            "connect" => Event::Connect,
            "receive" => Event::Receive,
            "close" => Event::Close,
            "tcperror" => Event::TcpError,
            "bufferfull" => Event::BufferFull,
            "bufferdrain" => Event::BufferDrain,
            "workerstart" => Event::WorkerStart,
            "workerstop" => Event::WorkerStop,
            "shutdown" => Event::Shutdown,
            "packet" => Event::Packet,
            "textreceive" => Event::TextReceive,
            "request" => Event::Request,
            "response" => Event::Response,
            "open" => Event::Open,
            "message" => Event::Message,
            "websocketping" => Event::WebSocketPing,
            "websocketpong" => Event::WebSocketPong,
            "disconnect" => Event::Disconnect,
            _ => return Err(NetworkError::UnsupportedEvent(s.to_string())),
        };
        Ok(event)
    }
}

/// Reason attached to a `tcperror` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpErrorKind {
    ConnectFailed = 1,
    SendFailed = 2,
}

impl TcpErrorKind {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

pub type CallbackResult = anyhow::Result<()>;

/// A user callback, tagged by the arguments it receives.
#[derive(Clone)]
pub enum Callback {
    Connection(Rc<dyn Fn(&Rc<Connection>) -> CallbackResult>),
    Data(Rc<dyn Fn(&Rc<Connection>, &[u8]) -> CallbackResult>),
    Text(Rc<dyn Fn(&Rc<Connection>, &str) -> CallbackResult>),
    TcpError(Rc<dyn Fn(&Rc<Connection>, TcpErrorKind, &str) -> CallbackResult>),
    Worker(Rc<dyn Fn() -> CallbackResult>),
    /// Payload and sender address of a datagram.
    Packet(Rc<dyn Fn(&[u8], &str) -> CallbackResult>),
    Request(Rc<dyn Fn(&Rc<Connection>, &Rc<ServerRequest>) -> CallbackResult>),
    Response(Rc<dyn Fn(&Rc<Connection>, &Rc<http::Response<Bytes>>) -> CallbackResult>),
    Frame(Rc<dyn Fn(&Rc<Connection>, &Frame) -> CallbackResult>),
}

impl Callback {
    pub fn connection<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>) -> CallbackResult + 'static,
    {
        Callback::Connection(Rc::new(f))
    }

    pub fn data<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>, &[u8]) -> CallbackResult + 'static,
    {
        Callback::Data(Rc::new(f))
    }

    pub fn text<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>, &str) -> CallbackResult + 'static,
    {
        Callback::Text(Rc::new(f))
    }

    pub fn tcp_error<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>, TcpErrorKind, &str) -> CallbackResult + 'static,
    {
        Callback::TcpError(Rc::new(f))
    }

    pub fn worker<F>(f: F) -> Self
    where
        F: Fn() -> CallbackResult + 'static,
    {
        Callback::Worker(Rc::new(f))
    }

    pub fn packet<F>(f: F) -> Self
    where
        F: Fn(&[u8], &str) -> CallbackResult + 'static,
    {
        Callback::Packet(Rc::new(f))
    }

    pub fn request<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>, &Rc<ServerRequest>) -> CallbackResult + 'static,
    {
        Callback::Request(Rc::new(f))
    }

    pub fn response<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>, &Rc<http::Response<Bytes>>) -> CallbackResult + 'static,
    {
        Callback::Response(Rc::new(f))
    }

    pub fn frame<F>(f: F) -> Self
    where
        F: Fn(&Rc<Connection>, &Frame) -> CallbackResult + 'static,
    {
        Callback::Frame(Rc::new(f))
    }

    fn shape(&self) -> &'static str {
        match self {
            Callback::Connection(_) => "connection",
            Callback::Data(_) => "data",
            Callback::Text(_) => "text",
            Callback::TcpError(_) => "tcp-error",
            Callback::Worker(_) => "worker",
            Callback::Packet(_) => "packet",
            Callback::Request(_) => "request",
            Callback::Response(_) => "response",
            Callback::Frame(_) => "frame",
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback::{}", self.shape())
    }
}

/// Event name → callback table for one listener.
///
/// Callbacks are cloned out of the table before they run, so a callback may
/// register or remove callbacks without a borrow conflict.
pub struct CallbackRegistry {
    supported: Vec<Event>,
    callbacks: RefCell<HashMap<Event, Callback>>,
    logger: Arc<dyn Logger>,
}

impl CallbackRegistry {
    pub fn new(supported: Vec<Event>, logger: Arc<dyn Logger>) -> Self {
        Self {
            supported,
            callbacks: RefCell::new(HashMap::new()),
            logger,
        }
    }

    pub fn supported(&self) -> &[Event] {
        &self.supported
    }

    pub fn supports(&self, event: Event) -> bool {
        self.supported.contains(&event)
    }

    /// Registers `callback` for `event`, replacing any earlier one.
    pub fn register(&self, event: Event, callback: Callback) -> Result<()> {
        if !self.supports(event) {
            return Err(NetworkError::UnsupportedEvent(event.name().to_string()));
        }
        if !event.accepts(&callback) {
            return Err(NetworkError::Configuration(format!(
                "event '{}' cannot take a {} callback",
                event,
                callback.shape()
            )));
        }
        self.callbacks.borrow_mut().insert(event, callback);
        Ok(())
    }

    pub fn register_named(&self, name: &str, callback: Callback) -> Result<()> {
        self.register(name.parse()?, callback)
    }

    pub fn remove(&self, event: Event) -> bool {
        self.callbacks.borrow_mut().remove(&event).is_some()
    }

    pub fn has(&self, event: Event) -> bool {
        self.callbacks.borrow().contains_key(&event)
    }

    fn get(&self, event: Event) -> Option<Callback> {
        self.callbacks.borrow().get(&event).cloned()
    }

    fn report(&self, event: Event, result: CallbackResult) {
        if let Err(e) = result {
            self.logger.log(
                LogLevel::Error,
                &format!("Error in '{}' callback: {:#}", event, e),
            );
        }
    }

    /// Runs a connection-shaped callback and hands back its result instead
    /// of logging it.
    pub fn try_emit_connection(&self, event: Event, connection: &Rc<Connection>) -> CallbackResult {
        match self.get(event) {
            Some(Callback::Connection(cb)) => cb(connection),
            _ => Ok(()),
        }
    }

    pub fn emit_connection(&self, event: Event, connection: &Rc<Connection>) {
        let result = self.try_emit_connection(event, connection);
        self.report(event, result);
    }

    pub fn emit_receive(&self, connection: &Rc<Connection>, data: &[u8]) {
        if let Some(Callback::Data(cb)) = self.get(Event::Receive) {
            self.report(Event::Receive, cb(connection, data));
        }
    }

    pub fn emit_text(&self, connection: &Rc<Connection>, line: &str) {
        if let Some(Callback::Text(cb)) = self.get(Event::TextReceive) {
            self.report(Event::TextReceive, cb(connection, line));
        }
    }

    pub fn emit_tcp_error(&self, connection: &Rc<Connection>, kind: TcpErrorKind, message: &str) {
        if let Some(Callback::TcpError(cb)) = self.get(Event::TcpError) {
            self.report(Event::TcpError, cb(connection, kind, message));
        }
    }

    pub fn emit_worker(&self, event: Event) {
        if let Some(Callback::Worker(cb)) = self.get(event) {
            self.report(event, cb());
        }
    }

    pub fn emit_packet(&self, payload: &[u8], from: &str) {
        if let Some(Callback::Packet(cb)) = self.get(Event::Packet) {
            self.report(Event::Packet, cb(payload, from));
        }
    }

    pub fn emit_request(&self, event: Event, connection: &Rc<Connection>, request: &Rc<ServerRequest>) {
        if let Some(Callback::Request(cb)) = self.get(event) {
            self.report(event, cb(connection, request));
        }
    }

    pub fn emit_response(&self, connection: &Rc<Connection>, response: &Rc<http::Response<Bytes>>) {
        if let Some(Callback::Response(cb)) = self.get(Event::Response) {
            self.report(Event::Response, cb(connection, response));
        }
    }

    pub fn emit_frame(&self, event: Event, connection: &Rc<Connection>, frame: &Frame) {
        if let Some(Callback::Frame(cb)) = self.get(event) {
            self.report(event, cb(connection, frame));
        }
    }
}
