//! WebSocket on top of the HTTP protocol.
//!
//! A `ws://` listener serves plain HTTP and WebSocket on the same port.
//! Until a connection completes the upgrade handshake its bytes are framed
//! and parsed as HTTP requests; an upgrade request gets the `101` reply and
//! switches the connection to frame mode, any other request goes to the
//! `request` event unchanged.
//!
//! Client-mode connections run the other side: once connected they send the
//! upgrade request with a random key, and frame mode starts when the `101`
//! carries the matching `Sec-WebSocket-Accept`.
//!
//! ```text
//!            handshake_done = false               handshake_done = true
//!  bytes ──▶ HttpProtocol framing ──▶ upgrade? ──▶ FrameHeader framing
//!                                      │  no            │
//!                                      ▼                ▼
//!                                  `request`     fragments spliced
//!                                                       │
//!                       ┌──────────────┬─────────────┬──┴───────────┐
//!                       ▼              ▼             ▼              ▼
//!                   `message`  `websocketping`  `websocketpong`  `disconnect`
//!                               (or auto PONG)                  (+ close echo)
//! ```

pub mod frame;
pub mod handshake;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use url::Url;

use super::{PackageLength, ProtocolContext, ProtocolInfo};
use crate::cache::BoundedCache;
use crate::error::ProtocolError;
use crate::net::config::ServerConfig;
use crate::net::connection::{Connection, SendResult};
use crate::net::events::Event;
use crate::net::server::ServerContext;
use crate::net::traits::LogLevel;
use crate::protocol::http::{encode_response, HttpProtocol, ServerRequest};

pub use frame::{apply_mask, close_code, Frame, FrameHeader, Opcode, CLIENT_MASK_KEY};
pub use handshake::{accept_key, WEBSOCKET_GUID};

/// Smallest frame a client can send: two header bytes plus the mask key.
const MIN_CLIENT_FRAME: usize = 6;
const SMALL_FRAME: usize = 512;
const FRAME_CACHE_SIZE: usize = 512;

/// Per-connection WebSocket state.
#[derive(Debug, Default)]
pub struct WebSocketContext {
    handshake_done: bool,
    /// Payload of a fragmented message collected so far.
    fragments: BytesMut,
    /// Opcode of the first fragment, while a message is being collected.
    fragment_opcode: Option<Opcode>,
    /// Frames pushed before the handshake finished.
    pending_output: BytesMut,
    /// Key of the upgrade request sent by a client-mode connection.
    client_key: Option<String>,
    upgrade_request: Option<Rc<ServerRequest>>,
}

impl WebSocketContext {
    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn is_assembling(&self) -> bool {
        self.fragment_opcode.is_some()
    }

    pub fn fragment_len(&self) -> usize {
        self.fragments.len()
    }

    pub fn pending_output_len(&self) -> usize {
        self.pending_output.len()
    }

    fn reset_fragments(&mut self) {
        self.fragments.clear();
        self.fragment_opcode = None;
    }

    /// Switches to frame mode and hands back the frames parked until now.
    fn finish_handshake(&mut self) -> Bytes {
        self.handshake_done = true;
        self.client_key = None;
        self.reset_fragments();
        self.pending_output.split().freeze()
    }
}

pub struct WebSocketProtocol {
    http: HttpProtocol,
    auto_splice: bool,
    frames: RefCell<Option<BoundedCache<Bytes, Rc<Frame>>>>,
}

impl WebSocketProtocol {
    pub const EVENTS: [Event; 7] = [
        Event::Open,
        Event::Message,
        Event::WebSocketPing,
        Event::WebSocketPong,
        Event::Disconnect,
        Event::Request,
        Event::Response,
    ];

    pub fn new(info: ProtocolInfo, config: &ServerConfig) -> Self {
        Self {
            http: HttpProtocol::new(info, config),
            auto_splice: config.auto_splice_frames,
            frames: RefCell::new(
                config
                    .enable_cache
                    .then(|| BoundedCache::new(FRAME_CACHE_SIZE)),
            ),
        }
    }

    pub fn info(&self) -> &ProtocolInfo {
        self.http.info()
    }

    /// The HTTP layer used before the upgrade.
    pub fn http(&self) -> &HttpProtocol {
        &self.http
    }

    /// Entries in the frame cache.
    pub fn cached_frames(&self) -> usize {
        self.frames.borrow().as_ref().map_or(0, BoundedCache::len)
    }

    fn handshake_done(connection: &Connection) -> bool {
        connection
            .context()
            .websocket()
            .is_some_and(WebSocketContext::handshake_done)
    }

    pub fn check_package_length(&self, buffer: &[u8], connection: &Connection) -> PackageLength {
        if buffer.len() < MIN_CLIENT_FRAME {
            return PackageLength::NeedMore;
        }
        if !Self::handshake_done(connection) {
            return self.http.check_package_length(buffer, connection);
        }

        let logger = connection.server_context().logger();
        let header = match FrameHeader::parse(buffer) {
            Ok(Some(header)) => header,
            Ok(None) => return PackageLength::NeedMore,
            Err(e) => {
                logger.log(
                    LogLevel::Debug,
                    &format!("{}, closing connection {}", e, connection.id()),
                );
                return PackageLength::CLOSE;
            }
        };
        if header.mask_key.is_none() && !connection.is_client_mode() {
            logger.log(
                LogLevel::Debug,
                &format!("Frame not masked, closing connection {}", connection.id()),
            );
            return PackageLength::CLOSE;
        }
        let total = header.frame_len();
        if total > connection.max_package_size() {
            logger.log(
                LogLevel::Debug,
                &format!("Frame of {} bytes exceeds max package size", total),
            );
            return PackageLength::CLOSE;
        }
        PackageLength::Complete(total)
    }

    pub fn execute(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        if Self::handshake_done(connection) {
            return self.execute_frame(ctx, package, connection);
        }
        if connection.is_client_mode() {
            return self.execute_client_handshake(ctx, package, connection);
        }
        self.execute_handshake(ctx, package, connection)
    }

    /// Sends the upgrade request on a freshly connected client connection.
    pub fn start_client_handshake(&self, connection: &Connection) -> Result<(), ProtocolError> {
        let info = self.info();
        let target = Url::parse(&info.name)
            .map(|url| match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            })
            .ok()
            .filter(|target| target.starts_with('/'))
            .unwrap_or_else(|| "/".to_string());
        let host = if info.host.contains(':') {
            format!("[{}]:{}", info.host, info.port)
        } else {
            format!("{}:{}", info.host, info.port)
        };
        let key = handshake::client_key()?;
        let (wire, request) = handshake::upgrade_request(&host, &target, &key)?;

        if let Some(ws) = connection.context_mut().websocket_mut() {
            ws.client_key = Some(key);
            ws.upgrade_request = Some(Rc::new(request));
        }
        connection.send(&wire);
        Ok(())
    }

    fn execute_client_handshake(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        let response = self.http.parse_response(package)?;
        let (key, request) = match connection.context().websocket() {
            Some(ws) => (ws.client_key.clone(), ws.upgrade_request.clone()),
            None => (None, None),
        };
        let (Some(key), Some(request)) = (key, request) else {
            ctx.callbacks().emit_response(connection, &response);
            return Ok(true);
        };

        if !handshake::is_accepted(&response, &key) {
            ctx.callbacks().emit_response(connection, &response);
            connection.close();
            return Err(ProtocolError::HandshakeRejected(format!(
                "status {} from {}",
                response.status().as_u16(),
                connection.remote_address()
            )));
        }

        let pending = connection
            .context_mut()
            .websocket_mut()
            .map(WebSocketContext::finish_handshake)
            .unwrap_or_default();
        if !pending.is_empty() {
            connection.send(&pending);
        }
        ctx.callbacks().emit_request(Event::Open, connection, &request);
        Ok(true)
    }

    fn execute_handshake(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        let request = self.http.parse_request(package)?;
        if !handshake::is_upgrade_request(&request) {
            ctx.callbacks()
                .emit_request(Event::Request, connection, &request);
            return Ok(true);
        }

        let response = handshake::switching_protocols(self.http.factory().as_ref(), &request)?;
        connection.send(&encode_response(&response));

        let pending = connection
            .context_mut()
            .websocket_mut()
            .map(WebSocketContext::finish_handshake)
            .unwrap_or_default();
        if !pending.is_empty() {
            connection.send(&pending);
        }
        ctx.callbacks().emit_request(Event::Open, connection, &request);
        Ok(true)
    }

    fn execute_frame(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        let assembling = connection
            .context()
            .websocket()
            .is_some_and(WebSocketContext::is_assembling);
        let cacheable = !assembling && package.len() < SMALL_FRAME;

        if cacheable {
            let hit = self
                .frames
                .borrow()
                .as_ref()
                .and_then(|cache| cache.get(&package).cloned());
            if let Some(frame) = hit {
                self.dispatch(ctx, &frame, connection);
                return Ok(true);
            }
        }

        let (frame, _) =
            Frame::decode(&package)?.ok_or(ProtocolError::MalformedFrame("truncated frame"))?;

        let frame = if self.auto_splice && !frame.opcode().is_control() {
            match self.splice(frame, connection) {
                Some(frame) => frame,
                None => return Ok(true),
            }
        } else {
            frame
        };

        let frame = Rc::new(frame);
        if cacheable && frame.is_fin() {
            if let Some(cache) = self.frames.borrow_mut().as_mut() {
                cache.insert(package, frame.clone());
            }
        }
        self.dispatch(ctx, &frame, connection);
        Ok(true)
    }

    /// Collects data fragments. Returns the frame to dispatch once a message
    /// is complete, `None` while more fragments are expected.
    fn splice(&self, frame: Frame, connection: &Rc<Connection>) -> Option<Frame> {
        let mut context = connection.context_mut();
        let Some(ws) = context.websocket_mut() else {
            return Some(frame);
        };

        if !frame.is_fin() {
            if frame.opcode() != Opcode::Continuation || ws.fragment_opcode.is_none() {
                ws.fragments.clear();
                ws.fragment_opcode = Some(frame.opcode());
            }
            ws.fragments.extend_from_slice(frame.payload());
            let too_big = ws.fragments.len() > connection.max_package_size();
            drop(context);
            if too_big {
                connection.close_with(&Frame::close(close_code::MESSAGE_TOO_BIG, "").encode());
            }
            return None;
        }

        match ws.fragment_opcode.take() {
            Some(opcode) => {
                ws.fragments.extend_from_slice(frame.payload());
                let payload = ws.fragments.split().freeze();
                Some(Frame::new(payload, opcode, frame.is_masked(), true))
            }
            None => Some(frame),
        }
    }

    fn dispatch(&self, ctx: &ServerContext, frame: &Rc<Frame>, connection: &Rc<Connection>) {
        let callbacks = ctx.callbacks();
        match frame.opcode() {
            Opcode::Ping => {
                if callbacks.has(Event::WebSocketPing) {
                    callbacks.emit_frame(Event::WebSocketPing, connection, frame);
                } else {
                    connection.push_frame(&Frame::pong(frame.payload().clone()));
                }
            }
            Opcode::Pong => callbacks.emit_frame(Event::WebSocketPong, connection, frame),
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                callbacks.emit_frame(Event::Message, connection, frame)
            }
            Opcode::Close => {
                callbacks.emit_frame(Event::Disconnect, connection, frame);
                let code = match frame.close_code() {
                    // reserved for local reporting, never sent
                    Some(close_code::NO_STATUS | close_code::ABNORMAL | close_code::TLS_HANDSHAKE)
                    | None => close_code::NORMAL,
                    Some(code) => code,
                };
                let echo = role_frame(connection, Frame::close(code, ""));
                connection.close_with(&echo.encode());
            }
        }
    }
}

impl std::fmt::Debug for WebSocketProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketProtocol")
            .field("info", self.info())
            .field("auto_splice", &self.auto_splice)
            .finish_non_exhaustive()
    }
}

/// Server frames go out unmasked, client frames masked.
fn role_frame(connection: &Connection, frame: Frame) -> Frame {
    if connection.is_client_mode() && !frame.is_masked() {
        frame.into_masked()
    } else {
        frame
    }
}

/// WebSocket messaging on an upgraded connection.
impl Connection {
    /// Sends a message. Strings become TEXT frames.
    pub fn push(&self, message: impl Into<Frame>) -> bool {
        self.push_frame(&message.into())
    }

    pub fn push_frame(&self, frame: &Frame) -> bool {
        let frame = if self.is_client_mode() && !frame.is_masked() {
            frame.clone().into_masked()
        } else {
            frame.clone()
        };
        let wire = frame.encode();
        {
            let mut context = self.context_mut();
            if let ProtocolContext::WebSocket(ws) = &mut *context {
                if !ws.handshake_done {
                    ws.pending_output.extend_from_slice(&wire);
                    return true;
                }
            }
        }
        self.send(&wire) != SendResult::Rejected
    }

    /// Sends a close frame. The connection stays open until the peer
    /// answers or it is closed locally.
    pub fn disconnect(&self, code: u16, reason: &str) -> bool {
        self.push_frame(&Frame::close(code, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::testing::TestHarness;

    const HANDSHAKE: &[u8] = b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";

    fn client_frame(opcode: Opcode, fin: bool, payload: &[u8]) -> Bytes {
        Frame::new(payload.to_vec(), opcode, true, fin).encode()
    }

    fn upgraded(config: ServerConfig) -> (TestHarness, Rc<Connection>, crate::net::transport::mock::MockWire) {
        let h = TestHarness::new("ws://127.0.0.1:8080", config);
        let (conn, wire) = h.accept();
        wire.push(HANDSHAKE);
        conn.on_readable();
        wire.take_written();
        (h, conn, wire)
    }

    #[test]
    fn test_handshake_switches_protocols() {
        let h = TestHarness::new("ws://127.0.0.1:8080", ServerConfig::default());
        let opens = h.record_opens();
        let (conn, wire) = h.accept();

        assert!(conn.push("early"));
        wire.push(HANDSHAKE);
        conn.on_readable();

        let written = wire.take_written();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(written.ends_with(&Frame::text("early").encode()));
        assert_eq!(opens.get(), 1);
        assert!(conn.context().websocket().unwrap().handshake_done());
    }

    fn written_key(written: &[u8]) -> String {
        String::from_utf8_lossy(written)
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_client_upgrade_flushes_parked_frames() {
        let h = TestHarness::new("ws://127.0.0.1:8080/chat", ServerConfig::default());
        let opens = h.record_opens();
        let messages = h.record_frames(Event::Message);
        let (conn, wire) = h.connect_client();

        assert!(conn.push("hi"));
        let written = wire.take_written();
        assert!(written.starts_with(b"GET /chat HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n"));
        assert!(written.ends_with(b"\r\n\r\n"));
        let parked = Frame::text("hi").into_masked().encode();
        assert_eq!(conn.context().websocket().unwrap().pending_output_len(), parked.len());

        let mut reply = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&written_key(&written))
        )
        .into_bytes();
        // servers send unmasked frames
        reply.extend_from_slice(&Frame::text("welcome").encode());
        wire.push(&reply);
        conn.on_readable();

        assert_eq!(opens.get(), 1);
        assert!(conn.context().websocket().unwrap().handshake_done());
        assert_eq!(wire.take_written(), parked.to_vec());
        assert_eq!(messages.borrow().len(), 1);
        assert_eq!(messages.borrow()[0].as_text(), Some("welcome"));

        assert!(conn.push("again"));
        assert_eq!(wire.take_written(), Frame::text("again").into_masked().encode().to_vec());
    }

    #[test]
    fn test_client_upgrade_with_wrong_accept_closes() {
        let h = TestHarness::new("ws://127.0.0.1:8080", ServerConfig::default());
        let opens = h.record_opens();
        let responses = h.record_responses();
        let (conn, wire) = h.connect_client();
        let written = wire.take_written();
        assert!(written.starts_with(b"GET / HTTP/1.1\r\n"));

        wire.push(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );
        conn.on_readable();

        assert_eq!(opens.get(), 0);
        assert_eq!(responses.borrow().len(), 1);
        assert!(!conn.context().websocket().unwrap().handshake_done());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_plain_http_on_websocket_port() {
        let h = TestHarness::new("ws://127.0.0.1:8080", ServerConfig::default());
        let requests = h.record_requests();
        let (conn, wire) = h.accept();
        wire.push(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.on_readable();
        assert_eq!(requests.borrow().len(), 1);
        assert!(!conn.context().websocket().unwrap().handshake_done());
    }

    #[test]
    fn test_fragments_are_spliced() {
        let (h, conn, wire) = upgraded(ServerConfig::default());
        let messages = h.record_frames(Event::Message);

        wire.push(&client_frame(Opcode::Text, false, b"He"));
        conn.on_readable();
        assert!(messages.borrow().is_empty());
        // control frames may arrive between fragments
        wire.push(&client_frame(Opcode::Ping, true, b"p"));
        conn.on_readable();
        assert_eq!(wire.take_written(), Frame::pong(&b"p"[..]).encode().to_vec());
        wire.push(&client_frame(Opcode::Continuation, true, b"llo"));
        conn.on_readable();

        let messages = messages.borrow();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].opcode(), Opcode::Text);
        assert_eq!(messages[0].as_text(), Some("Hello"));
        assert!(!conn.context().websocket().unwrap().is_assembling());
    }

    #[test]
    fn test_fragments_pass_through_without_splicing() {
        let config = ServerConfig::builder().auto_splice_frames(false).build();
        let (h, conn, wire) = upgraded(config);
        let messages = h.record_frames(Event::Message);

        let mut both = client_frame(Opcode::Text, false, b"He").to_vec();
        both.extend_from_slice(&client_frame(Opcode::Continuation, true, b"llo"));
        wire.push(&both);
        conn.on_readable();

        let messages = messages.borrow();
        assert_eq!(messages.len(), 2);
        assert!(!messages[0].is_fin());
        assert_eq!(messages[1].opcode(), Opcode::Continuation);
    }

    #[test]
    fn test_unmasked_frame_closes() {
        let (_h, conn, wire) = upgraded(ServerConfig::default());
        wire.push(&Frame::text("plain text").encode());
        conn.on_readable();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_oversized_frame_closes() {
        let config = ServerConfig::builder().max_package_size(256).build();
        let (_h, conn, wire) = upgraded(config);
        assert!(!conn.is_closed());
        wire.push(&client_frame(Opcode::Binary, true, &[0u8; 300]));
        conn.on_readable();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_close_is_echoed_with_peer_code() {
        let (h, conn, wire) = upgraded(ServerConfig::default());
        let disconnects = h.record_frames(Event::Disconnect);

        wire.push(&Frame::close(close_code::GOING_AWAY, "").into_masked().encode());
        conn.on_readable();

        assert_eq!(disconnects.borrow().len(), 1);
        assert_eq!(wire.written(), Frame::close(1001, "").encode().to_vec());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_reserved_close_codes_echo_normal() {
        for code in [close_code::NO_STATUS, close_code::ABNORMAL, close_code::TLS_HANDSHAKE] {
            let (_h, conn, wire) = upgraded(ServerConfig::default());
            wire.push(&Frame::close(code, "").into_masked().encode());
            conn.on_readable();
            assert_eq!(
                wire.written(),
                Frame::close(close_code::NORMAL, "").encode().to_vec(),
                "code {}",
                code
            );
            assert!(conn.is_closed());
        }
    }

    #[test]
    fn test_repeated_frames_hit_cache() {
        let (h, conn, wire) = upgraded(ServerConfig::default());
        let messages = h.record_frames(Event::Message);
        let ping = client_frame(Opcode::Text, true, b"tick");
        wire.push(&ping);
        wire.push(&ping);
        conn.on_readable();
        conn.on_readable();

        let messages = messages.borrow();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], messages[1]);
        match h.ctx.protocol() {
            crate::protocol::Protocol::WebSocket(ws) => assert_eq!(ws.cached_frames(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
