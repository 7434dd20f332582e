use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, Request, Response, StatusCode, Version};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::ProtocolError;
use crate::protocol::http::{MessageFactory, ServerRequest};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut input = Vec::with_capacity(client_key.len() + WEBSOCKET_GUID.len());
    input.extend_from_slice(client_key.as_bytes());
    input.extend_from_slice(WEBSOCKET_GUID.as_bytes());
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    STANDARD.encode(digest.as_ref())
}

/// Whether `request` asks for a WebSocket upgrade.
pub fn is_upgrade_request(request: &ServerRequest) -> bool {
    *request.method() == Method::GET
        && ["Upgrade", "Connection", "Sec-WebSocket-Key", "Sec-WebSocket-Version"]
            .iter()
            .all(|name| !request.header_line(name).is_empty())
}

/// The `101 Switching Protocols` reply to an upgrade request.
pub fn switching_protocols(
    factory: &dyn MessageFactory,
    request: &ServerRequest,
) -> Result<Response<Bytes>, ProtocolError> {
    let accept = accept_key(&request.header_line("Sec-WebSocket-Key"));
    let mut headers = HeaderMap::new();
    headers.insert("upgrade", "websocket".parse().map_err(header_error)?);
    headers.insert("sec-websocket-version", "13".parse().map_err(header_error)?);
    headers.insert("connection", "Upgrade".parse().map_err(header_error)?);
    headers.insert("sec-websocket-accept", accept.parse().map_err(header_error)?);
    factory.create_response(
        101,
        Some("Switching Protocols"),
        headers,
        Bytes::new(),
        Version::HTTP_11,
    )
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn client_key() -> Result<String, ProtocolError> {
    let mut nonce = [0u8; 16];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| ProtocolError::HandshakeRejected("no randomness for the client key".into()))?;
    Ok(STANDARD.encode(nonce))
}

/// The upgrade request a client sends, both on the wire and as the request
/// object reported with `open`.
pub fn upgrade_request(
    host: &str,
    target: &str,
    key: &str,
) -> Result<(Bytes, ServerRequest), ProtocolError> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(target)
        .header("host", host)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-key", key)
        .header("sec-websocket-version", "13")
        .body(Bytes::new())
        .map_err(|e| ProtocolError::InvalidUri(e.to_string()))?;

    let wire = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        target, host, key
    );
    Ok((Bytes::from(wire), ServerRequest::new(request, HashMap::new())))
}

/// Whether `response` completes the upgrade started with `key`.
pub fn is_accepted(response: &Response<Bytes>, key: &str) -> bool {
    response.status() == StatusCode::SWITCHING_PROTOCOLS
        && response
            .headers()
            .get("sec-websocket-accept")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == accept_key(key))
}

fn header_error(e: http::header::InvalidHeaderValue) -> ProtocolError {
    ProtocolError::MalformedHeader(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::{encode_response, DefaultMessageFactory};

    fn request(extra: &str) -> ServerRequest {
        let mut builder = http::Request::builder().method("GET").uri("/chat");
        for line in extra.lines() {
            if let Some((k, v)) = line.split_once(": ") {
                builder = builder.header(k, v);
            }
        }
        ServerRequest::new(builder.body(Bytes::new()).unwrap(), HashMap::new())
    }

    #[test]
    fn test_accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_upgrade_detection() {
        let full = "Upgrade: websocket\nConnection: Upgrade\nSec-WebSocket-Key: abc\nSec-WebSocket-Version: 13";
        assert!(is_upgrade_request(&request(full)));
        assert!(!is_upgrade_request(&request("Upgrade: websocket\nConnection: Upgrade")));
    }

    #[test]
    fn test_switching_protocols_response() {
        let req = request("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==");
        let response = switching_protocols(&DefaultMessageFactory, &req).unwrap();
        let wire = String::from_utf8(encode_response(&response).to_vec()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(wire.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!wire.contains("content-length"));
    }

    #[test]
    fn test_client_key_is_random_nonce() {
        let a = client_key().unwrap();
        let b = client_key().unwrap();
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_upgrade_request_and_acceptance() {
        let (wire, request) =
            upgrade_request("example.com:80", "/chat?room=1", "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\nHost: example.com:80\r\n"));
        assert!(text.ends_with("Sec-WebSocket-Version: 13\r\n\r\n"));
        assert!(is_upgrade_request(&request));

        let response = switching_protocols(&DefaultMessageFactory, &request).unwrap();
        assert!(is_accepted(&response, "dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(!is_accepted(&response, "b3RoZXIga2V5IGhlcmUhIQ=="));

        let refused = Response::builder().status(403).body(Bytes::new()).unwrap();
        assert!(!is_accepted(&refused, "dGhlIHNhbXBsZSBub25jZQ=="));
    }
}
