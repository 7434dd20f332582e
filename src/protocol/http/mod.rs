//! HTTP/1.x over a connection.
//!
//! Server-side connections frame requests and emit `request`; client-mode
//! connections frame responses and emit `response`. Framing only scans the
//! raw head for the few headers that decide the package length. The full
//! parse happens in `execute`, once per complete package.
//!
//! ```text
//!   recv buffer
//!  ┌───────────────────────────────┬──────────────┬──────────
//!  │ GET /a HTTP/1.1\r\n ... \r\n\r\n │ body (CL)    │ next request…
//!  └───────────────────────────────┴──────────────┴──────────
//!  ◀──────────── check_package_length ───────────▶
//! ```
//!
//! Small messages are memoized per protocol instance in bounded FIFO caches:
//! framing results, parsed heads, whole requests and responses, and the
//! encodings produced by [`Connection::end`].

pub mod chunked;
pub mod factory;
pub mod multipart;
pub mod parser;
pub mod request;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{Method, Response, StatusCode, Version};

use super::{canned, PackageLength, ProtocolInfo};
use crate::cache::BoundedCache;
use crate::error::ProtocolError;
use crate::net::config::ServerConfig;
use crate::net::connection::{Connection, SendResult};
use crate::net::events::Event;
use crate::net::server::ServerContext;
use crate::net::traits::LogLevel;

use chunked::{decode_chunked, ChunkedBody};
use parser::{
    find_header_end, find_header_value, first_line, parse_header_block, parse_request_line,
    parse_status_line, RequestLine, MAX_HEADER_SIZE, METHODS,
};

pub use factory::{encode_response, DefaultMessageFactory, MessageFactory, ReasonPhrase};
pub use multipart::{UploadError, UploadedFile};
pub use request::ServerRequest;

/// Buffers shorter than this are eligible for the framing, request,
/// response and encoding caches.
const SMALL_PACKAGE: usize = 512;
/// Heads shorter than this are eligible for the head cache.
const SMALL_HEAD: usize = 2048;

const LENGTH_CACHE_SIZE: usize = 512;
const HEAD_CACHE_SIZE: usize = 128;
const REQUEST_CACHE_SIZE: usize = 512;
const RESPONSE_CACHE_SIZE: usize = 512;
const ENCODED_CACHE_SIZE: usize = 1024;

/// Listener-wide parser switches copied out of [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub enable_cache: bool,
    pub header_case_sensitive: bool,
    pub merge_chunked_body: bool,
    pub max_form_data_files: usize,
    pub upload_dir: PathBuf,
}

impl HttpSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            enable_cache: config.enable_cache,
            header_case_sensitive: config.header_case_sensitive,
            merge_chunked_body: config.merge_chunked_body,
            max_form_data_files: config.max_form_data_files,
            upload_dir: config.upload_dir(),
        }
    }
}

#[derive(Default)]
struct Caches {
    lengths: Option<BoundedCache<Vec<u8>, usize>>,
    heads: Option<BoundedCache<Vec<u8>, (RequestLine, HeaderMap)>>,
    requests: Option<BoundedCache<Bytes, Rc<ServerRequest>>>,
    responses: Option<BoundedCache<Bytes, Rc<Response<Bytes>>>>,
    encoded: Option<BoundedCache<String, Bytes>>,
}

impl Caches {
    fn new(enabled: bool) -> Self {
        if !enabled {
            return Self::default();
        }
        Self {
            lengths: Some(BoundedCache::new(LENGTH_CACHE_SIZE)),
            heads: Some(BoundedCache::new(HEAD_CACHE_SIZE)),
            requests: Some(BoundedCache::new(REQUEST_CACHE_SIZE)),
            responses: Some(BoundedCache::new(RESPONSE_CACHE_SIZE)),
            encoded: Some(BoundedCache::new(ENCODED_CACHE_SIZE)),
        }
    }
}

pub struct HttpProtocol {
    info: ProtocolInfo,
    settings: HttpSettings,
    factory: Rc<dyn MessageFactory>,
    caches: RefCell<Caches>,
}

impl HttpProtocol {
    pub const EVENTS: [Event; 2] = [Event::Request, Event::Response];

    pub fn new(info: ProtocolInfo, config: &ServerConfig) -> Self {
        Self::with_factory(info, config, Rc::new(DefaultMessageFactory))
    }

    pub fn with_factory(
        info: ProtocolInfo,
        config: &ServerConfig,
        factory: Rc<dyn MessageFactory>,
    ) -> Self {
        let settings = HttpSettings::from_config(config);
        Self {
            caches: RefCell::new(Caches::new(settings.enable_cache)),
            info,
            settings,
            factory,
        }
    }

    pub fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    pub fn factory(&self) -> &Rc<dyn MessageFactory> {
        &self.factory
    }

    fn header<'a>(&self, head: &'a [u8], name: &str) -> Option<&'a [u8]> {
        find_header_value(head, name, self.settings.header_case_sensitive)
    }

    pub fn check_package_length(&self, buffer: &[u8], connection: &Connection) -> PackageLength {
        if connection.is_client_mode() {
            return self.check_response_length(buffer, connection);
        }
        let small = buffer.len() < SMALL_PACKAGE;
        if small {
            if let Some(cache) = self.caches.borrow().lengths.as_ref() {
                if let Some(&length) = cache.get(buffer) {
                    return PackageLength::Complete(length);
                }
            }
        }

        let result = self.check_request_length(buffer, connection.max_package_size());
        if let (true, PackageLength::Complete(length)) = (small, result) {
            if let Some(cache) = self.caches.borrow_mut().lengths.as_mut() {
                cache.insert(buffer.to_vec(), length);
            }
        }
        result
    }

    fn check_request_length(&self, buffer: &[u8], max_package_size: usize) -> PackageLength {
        let Some(header_end) = find_header_end(buffer) else {
            if buffer.len() >= MAX_HEADER_SIZE {
                return PackageLength::reject_with(canned::PAYLOAD_TOO_LARGE);
            }
            return PackageLength::NeedMore;
        };
        let head = &buffer[..header_end];
        let head_len = header_end + 4;

        let mut start = first_line(head).splitn(3, |&b| b == b' ');
        let method = start.next().unwrap_or_default();
        start.next();
        let version = start.next().unwrap_or_default();

        if !METHODS.iter().any(|m| m.as_bytes() == method) {
            return PackageLength::reject_with(canned::BAD_REQUEST);
        }
        if version == &b"HTTP/1.1"[..] && self.header(head, "Host").is_none() {
            return PackageLength::reject_with(canned::BAD_REQUEST);
        }

        if let Some(value) = self.header(head, "Content-Length") {
            let Some(body_len) = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
            else {
                return PackageLength::reject_with(canned::BAD_REQUEST);
            };
            let total = head_len.saturating_add(body_len);
            if total > max_package_size {
                return PackageLength::reject_with(canned::PAYLOAD_TOO_LARGE);
            }
            return PackageLength::Complete(total);
        }

        if self.header(head, "Transfer-Encoding").is_some() {
            if !self.settings.merge_chunked_body {
                return PackageLength::reject_with(canned::BAD_REQUEST);
            }
            return match decode_chunked(&buffer[head_len..]) {
                ChunkedBody::Complete { consumed, .. } => PackageLength::Complete(head_len + consumed),
                ChunkedBody::Incomplete if buffer.len() >= max_package_size => {
                    PackageLength::reject_with(canned::PAYLOAD_TOO_LARGE)
                }
                ChunkedBody::Incomplete => PackageLength::NeedMore,
                ChunkedBody::Malformed => PackageLength::reject_with(canned::BAD_REQUEST),
            };
        }

        PackageLength::Complete(head_len)
    }

    /// Length of the next response on a client-mode connection.
    fn check_response_length(&self, buffer: &[u8], connection: &Connection) -> PackageLength {
        let Some(header_end) = find_header_end(buffer) else {
            if buffer.len() >= MAX_HEADER_SIZE {
                return PackageLength::CLOSE;
            }
            return PackageLength::NeedMore;
        };
        let head = &buffer[..header_end];
        let head_len = header_end + 4;

        let Ok(status) = parse_status_line(first_line(head)) else {
            return PackageLength::CLOSE;
        };
        let bodiless = StatusCode::from_u16(status.status)
            .map(factory::is_bodiless)
            .unwrap_or(false);
        if bodiless {
            return PackageLength::Complete(head_len);
        }

        if let Some(value) = find_header_value(head, "Content-Length", false) {
            let Some(body_len) = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
            else {
                return PackageLength::CLOSE;
            };
            let total = head_len.saturating_add(body_len);
            if total > connection.max_package_size() {
                return PackageLength::CLOSE;
            }
            return PackageLength::Complete(total);
        }

        if find_header_value(head, "Transfer-Encoding", false).is_some() {
            return match decode_chunked(&buffer[head_len..]) {
                ChunkedBody::Complete { consumed, .. } => PackageLength::Complete(head_len + consumed),
                ChunkedBody::Incomplete if buffer.len() >= connection.max_package_size() => {
                    PackageLength::CLOSE
                }
                ChunkedBody::Incomplete => PackageLength::NeedMore,
                ChunkedBody::Malformed => PackageLength::CLOSE,
            };
        }

        // body delimited by connection close; not framed
        PackageLength::NeedMore
    }

    pub fn execute(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        if connection.is_client_mode() {
            let response = self.parse_response(package)?;
            ctx.callbacks().emit_response(connection, &response);
            return Ok(true);
        }
        let request = self.parse_request(package)?;
        ctx.callbacks()
            .emit_request(Event::Request, connection, &request);
        Ok(true)
    }

    /// Parses the start line and headers of a request head, going through
    /// the head cache for small heads.
    fn parse_head(&self, head: &[u8]) -> Result<(RequestLine, HeaderMap), ProtocolError> {
        let cacheable = head.len() < SMALL_HEAD;
        if cacheable {
            if let Some(cache) = self.caches.borrow().heads.as_ref() {
                if let Some(hit) = cache.get(head) {
                    return Ok(hit.clone());
                }
            }
        }
        let line = first_line(head);
        let request_line = parse_request_line(line)?;
        let headers = parse_header_block(&head[line.len()..])?;
        if cacheable {
            if let Some(cache) = self.caches.borrow_mut().heads.as_mut() {
                cache.insert(head.to_vec(), (request_line.clone(), headers.clone()));
            }
        }
        Ok((request_line, headers))
    }

    /// Listener-level server parameters attached to every request.
    fn server_params(&self, version: Version) -> HashMap<String, String> {
        let scheme = match self.info.transport {
            super::TransportKind::Ssl => "https",
            _ => "http",
        };
        HashMap::from([
            ("server_addr".to_string(), self.info.host.clone()),
            ("server_port".to_string(), self.info.port.to_string()),
            (
                "server_protocol".to_string(),
                parser::version_str(version).to_string(),
            ),
            ("request_scheme".to_string(), scheme.to_string()),
        ])
    }

    /// Turns one framed request into a [`ServerRequest`].
    pub fn parse_request(&self, package: Bytes) -> Result<Rc<ServerRequest>, ProtocolError> {
        let cacheable = package.len() < SMALL_PACKAGE;
        if cacheable {
            if let Some(cache) = self.caches.borrow().requests.as_ref() {
                if let Some(hit) = cache.get(&package) {
                    return Ok(hit.clone());
                }
            }
        }

        let header_end = find_header_end(&package).ok_or(ProtocolError::IncompleteHead)?;
        let (line, mut headers) = self.parse_head(&package[..header_end])?;
        let mut body = package.slice(header_end + 4..);

        if headers.contains_key(TRANSFER_ENCODING) && !headers.contains_key(CONTENT_LENGTH) {
            match decode_chunked(&body) {
                ChunkedBody::Complete { body: merged, .. } => {
                    headers.remove(TRANSFER_ENCODING);
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(merged.len()));
                    body = Bytes::from(merged);
                }
                _ => return Err(ProtocolError::MalformedChunkedBody),
            }
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let params = self.server_params(line.version);
        let mut request = self.factory.create_server_request(
            line.method.as_str(),
            &line.target,
            headers,
            self.factory.create_stream(&body),
            line.version,
            params,
        )?;

        if line.method == Method::POST {
            let media_type = content_type
                .as_deref()
                .and_then(|ct| ct.split(';').next())
                .map(str::trim)
                .unwrap_or_default();
            match media_type {
                "application/x-www-form-urlencoded" => {
                    let fields = url::form_urlencoded::parse(&body).into_owned().collect();
                    request = request.with_parsed_body(fields);
                }
                "multipart/form-data" => {
                    let boundary = multipart::boundary(content_type.as_deref().unwrap_or_default())?;
                    let form = multipart::parse_form_data(
                        &boundary,
                        &body,
                        self.settings.max_form_data_files,
                        &self.settings.upload_dir,
                    );
                    if !form.fields.is_empty() {
                        request = request.with_parsed_body(form.fields);
                    }
                    request = request.with_uploaded_files(form.files);
                }
                _ => {}
            }
        }

        let request = Rc::new(request);
        // uploads are moved by the handler; never hand them out twice
        if cacheable && request.uploaded_files().is_empty() {
            if let Some(cache) = self.caches.borrow_mut().requests.as_mut() {
                cache.insert(package, request.clone());
            }
        }
        Ok(request)
    }

    /// Turns one framed response into an `http::Response`.
    pub fn parse_response(&self, package: Bytes) -> Result<Rc<Response<Bytes>>, ProtocolError> {
        let cacheable = package.len() < SMALL_PACKAGE;
        if cacheable {
            if let Some(cache) = self.caches.borrow().responses.as_ref() {
                if let Some(hit) = cache.get(&package) {
                    return Ok(hit.clone());
                }
            }
        }

        let header_end = find_header_end(&package).ok_or(ProtocolError::IncompleteHead)?;
        let line = first_line(&package[..header_end]);
        let status = parse_status_line(line)?;
        let headers = parse_header_block(&package[line.len()..header_end])?;
        let mut body = package.slice(header_end + 4..);
        if headers.contains_key(TRANSFER_ENCODING) && !headers.contains_key(CONTENT_LENGTH) {
            body = match decode_chunked(&body) {
                ChunkedBody::Complete { body, .. } => Bytes::from(body),
                _ => return Err(ProtocolError::MalformedChunkedBody),
            };
        }
        let response = Rc::new(self.factory.create_response(
            status.status,
            Some(&status.reason),
            headers,
            self.factory.create_stream(&body),
            status.version,
        )?);

        if cacheable {
            if let Some(cache) = self.caches.borrow_mut().responses.as_mut() {
                cache.insert(package, response.clone());
            }
        }
        Ok(response)
    }

    /// Wire encoding of a plain 200 response carrying `body`.
    pub fn encode_body(&self, body: &str) -> Result<Bytes, ProtocolError> {
        let cacheable = body.len() < SMALL_PACKAGE;
        if cacheable {
            if let Some(cache) = self.caches.borrow().encoded.as_ref() {
                if let Some(hit) = cache.get(body) {
                    return Ok(hit.clone());
                }
            }
        }
        let response = self.factory.create_response(
            200,
            None,
            HeaderMap::new(),
            self.factory.create_stream(body.as_bytes()),
            Version::HTTP_11,
        )?;
        let encoded = encode_response(&response);
        if cacheable {
            if let Some(cache) = self.caches.borrow_mut().encoded.as_mut() {
                cache.insert(body.to_string(), encoded.clone());
            }
        }
        Ok(encoded)
    }
}

impl std::fmt::Debug for HttpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProtocol")
            .field("info", &self.info)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// HTTP replies on a server-side connection.
impl Connection {
    /// Replies with `200 OK` carrying `body`.
    pub fn end(&self, body: &str) -> bool {
        let ctx = self.server_context();
        let encoded = match ctx.protocol().http() {
            Some(http) => http.encode_body(body),
            None => DefaultMessageFactory
                .create_response(200, None, HeaderMap::new(), Bytes::copy_from_slice(body.as_bytes()), Version::HTTP_11)
                .map(|r| encode_response(&r)),
        };
        match encoded {
            Ok(bytes) => self.send(&bytes) != SendResult::Rejected,
            Err(e) => {
                ctx.logger()
                    .log(LogLevel::Error, &format!("Cannot build response: {}", e));
                false
            }
        }
    }

    /// Replies with a complete response.
    pub fn end_response(&self, response: &Response<Bytes>) -> bool {
        self.send(&encode_response(response)) != SendResult::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::testing::TestHarness;

    const SCENARIO_A: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    fn harness(config: ServerConfig) -> TestHarness {
        TestHarness::new("http://127.0.0.1:8080", config)
    }

    #[test]
    fn test_request_framing_rules() {
        let h = harness(ServerConfig::default());
        let (conn, _wire) = h.accept();
        let http = HttpProtocol::new(
            ProtocolInfo {
                host: "127.0.0.1".into(),
                port: 8080,
                name: "http://127.0.0.1:8080".into(),
                transport: super::super::TransportKind::Tcp,
            },
            &ServerConfig::default(),
        );

        assert_eq!(
            http.check_package_length(SCENARIO_A, &conn),
            PackageLength::Complete(SCENARIO_A.len())
        );
        assert_eq!(
            http.check_package_length(b"GET / HTTP/1.1\r\nHost: x\r\n", &conn),
            PackageLength::NeedMore
        );
        assert_eq!(
            http.check_package_length(b"BREW / HTTP/1.1\r\nHost: x\r\n\r\n", &conn),
            PackageLength::reject_with(canned::BAD_REQUEST)
        );
        assert_eq!(
            http.check_package_length(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n", &conn),
            PackageLength::reject_with(canned::BAD_REQUEST)
        );
        // HTTP/1.0 does not need Host
        assert_eq!(
            http.check_package_length(b"GET / HTTP/1.0\r\n\r\n", &conn),
            PackageLength::Complete(18)
        );
        let post = b"POST /f HTTP/1.1\r\nhost: x\r\ncontent-length: 5\r\n\r\nab";
        assert_eq!(
            http.check_package_length(post, &conn),
            PackageLength::Complete(post.len() + 3)
        );
        assert_eq!(
            http.check_package_length(
                b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: nope\r\n\r\n",
                &conn
            ),
            PackageLength::reject_with(canned::BAD_REQUEST)
        );
        assert_eq!(
            http.check_package_length(
                b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
                &conn
            ),
            PackageLength::reject_with(canned::BAD_REQUEST)
        );
        let huge = vec![b'a'; MAX_HEADER_SIZE];
        assert_eq!(
            http.check_package_length(&huge, &conn),
            PackageLength::reject_with(canned::PAYLOAD_TOO_LARGE)
        );
    }

    #[test]
    fn test_chunked_requests_are_opt_in() {
        let config = ServerConfig::builder().merge_chunked_body(true).build();
        let h = harness(config);
        let requests = h.record_requests();
        let (conn, wire) = h.accept();

        wire.push(b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n");
        conn.on_readable();
        assert!(requests.borrow().is_empty());
        wire.push(b"3\r\npie\r\n0\r\n\r\n");
        conn.on_readable();

        let requests = requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(&requests[0].body()[..], b"Wikipie");
        assert_eq!(requests[0].header("content-length"), Some("7"));
        assert!(requests[0].header("transfer-encoding").is_none());
    }

    #[test]
    fn test_head_cache_is_consistent() {
        let config = ServerConfig::default();
        let info = ProtocolInfo {
            host: "127.0.0.1".into(),
            port: 80,
            name: "http://127.0.0.1".into(),
            transport: super::super::TransportKind::Tcp,
        };
        let cached = HttpProtocol::new(info.clone(), &config);
        let uncached = HttpProtocol::new(info, &ServerConfig::builder().enable_cache(false).build());
        let raw = Bytes::from_static(b"GET /a?x=1 HTTP/1.1\r\nHost: x\r\nX-Tag: a\r\nx-tag: b\r\n\r\n");

        let first = cached.parse_request(raw.clone()).unwrap();
        let second = cached.parse_request(raw.clone()).unwrap();
        let plain = uncached.parse_request(raw).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        for req in [&second, &plain] {
            assert_eq!(req.headers(), first.headers());
            assert_eq!(req.header_line("x-tag"), "a, b");
            assert_eq!(req.query("x"), Some("1"));
            assert_eq!(req.server_params()["server_port"], "80");
        }
    }

    #[test]
    fn test_urlencoded_and_multipart_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::builder().upload_tmp_dir(dir.path()).build();
        let h = harness(config);
        let requests = h.record_requests();
        let (conn, wire) = h.accept();

        let form = b"a=1&b=two+words";
        let mut raw = format!(
            "POST /form HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
            form.len()
        )
        .into_bytes();
        raw.extend_from_slice(form);

        let multipart = b"--zz\r\nContent-Disposition: form-data; name=\"f\"; filename=\"n.bin\"\r\n\r\nDATA\r\n--zz--\r\n";
        raw.extend_from_slice(
            format!(
                "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=zz\r\nContent-Length: {}\r\n\r\n",
                multipart.len()
            )
            .as_bytes(),
        );
        raw.extend_from_slice(multipart);
        wire.push(&raw);
        conn.on_readable();

        let requests = requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].form("b"), Some("two words"));
        let file = requests[1].file("f").unwrap();
        assert_eq!(file.contents().unwrap(), b"DATA");
        assert!(file.path().unwrap().starts_with(dir.path()));
    }

    #[test]
    fn test_missing_boundary_is_logged_and_connection_survives() {
        let h = harness(ServerConfig::default());
        let requests = h.record_requests();
        let (conn, wire) = h.accept();

        wire.push(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data\r\nContent-Length: 0\r\n\r\n");
        wire.push(SCENARIO_A);
        conn.on_readable();
        conn.on_readable();

        assert_eq!(requests.borrow().len(), 1);
        assert!(!conn.is_closed());
        assert!(h.logger.contains(LogLevel::Error, "boundary"));
    }

    #[test]
    fn test_end_writes_encoded_response() {
        let h = harness(ServerConfig::default());
        let (conn, wire) = h.accept();
        assert!(conn.end("hello"));
        assert_eq!(
            wire.take_written(),
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello"
        );
        // second call goes through the encoding cache
        assert!(conn.end("hello"));
        assert_eq!(wire.take_written().len(), 43);
    }

    #[test]
    fn test_response_framing_in_client_mode() {
        let h = harness(ServerConfig::default());
        let responses = h.record_responses();
        let (conn, wire) = h.connect_client();

        wire.push(b"HTTP/1.1 204 No Content\r\nServer: t\r\n\r\n");
        wire.push(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
        wire.push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n");
        for _ in 0..3 {
            conn.on_readable();
        }
        {
            let responses = responses.borrow();
            assert_eq!(responses.len(), 3);
            assert_eq!(responses[0].status(), StatusCode::NO_CONTENT);
            assert_eq!(&responses[1].body()[..], b"ok");
            assert_eq!(&responses[2].body()[..], b"hi");
        }

        wire.push(b"SIP/2.0 200 OK\r\n\r\n");
        conn.on_readable();
        assert!(conn.is_closed());
    }
}
