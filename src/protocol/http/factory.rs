use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, Request, Response, StatusCode, Uri, Version};

use super::parser::version_str;
use super::request::ServerRequest;
use crate::error::ProtocolError;

/// Reason phrase that differs from the canonical one for the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(pub String);

/// Builds the HTTP values handed to user callbacks.
///
/// The protocol layer never constructs requests or responses by other means,
/// so an application can substitute its own representation rules here.
pub trait MessageFactory {
    fn create_request(
        &self,
        method: &str,
        uri: &str,
        headers: HeaderMap,
        body: Bytes,
        version: Version,
    ) -> Result<Request<Bytes>, ProtocolError>;

    fn create_server_request(
        &self,
        method: &str,
        uri: &str,
        headers: HeaderMap,
        body: Bytes,
        version: Version,
        server_params: HashMap<String, String>,
    ) -> Result<ServerRequest, ProtocolError> {
        let request = self.create_request(method, uri, headers, body, version)?;
        Ok(ServerRequest::new(request, server_params))
    }

    fn create_response(
        &self,
        status: u16,
        reason: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
        version: Version,
    ) -> Result<Response<Bytes>, ProtocolError>;

    fn create_stream(&self, body: &[u8]) -> Bytes {
        Bytes::copy_from_slice(body)
    }

    fn create_uri(&self, uri: &str) -> Result<Uri, ProtocolError> {
        uri.parse::<Uri>()
            .map_err(|e| ProtocolError::InvalidUri(format!("{}: {}", uri, e)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMessageFactory;

impl MessageFactory for DefaultMessageFactory {
    fn create_request(
        &self,
        method: &str,
        uri: &str,
        headers: HeaderMap,
        body: Bytes,
        version: Version,
    ) -> Result<Request<Bytes>, ProtocolError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ProtocolError::MalformedStartLine(format!("bad method '{}'", method)))?;
        let mut request = Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = self.create_uri(uri)?;
        *request.version_mut() = version;
        *request.headers_mut() = headers;
        Ok(request)
    }

    fn create_response(
        &self,
        status: u16,
        reason: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
        version: Version,
    ) -> Result<Response<Bytes>, ProtocolError> {
        let status = StatusCode::from_u16(status).map_err(|_| ProtocolError::InvalidStatus(status))?;
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.version_mut() = version;
        *response.headers_mut() = headers;
        if let Some(reason) = reason {
            if Some(reason) != status.canonical_reason() && !reason.is_empty() {
                response
                    .extensions_mut()
                    .insert(ReasonPhrase(reason.to_string()));
            }
        }
        Ok(response)
    }
}

/// Whether a response with this status never carries a body.
pub fn is_bodiless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Serializes a response to HTTP/1.x wire format. `Content-Length` is added
/// unless the response already declares its framing or may not have a body.
pub fn encode_response(response: &Response<Bytes>) -> Bytes {
    let status = response.status();
    let reason = response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|r| r.0.as_str())
        .or_else(|| status.canonical_reason())
        .unwrap_or("");

    let body = response.body();
    let mut out = BytesMut::with_capacity(64 + body.len() + response.headers().len() * 32);
    out.put_slice(version_str(response.version()).as_bytes());
    out.put_slice(format!(" {} {}\r\n", status.as_u16(), reason).as_bytes());

    for (name, value) in response.headers() {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    let framed = response.headers().contains_key(CONTENT_LENGTH)
        || response.headers().contains_key(TRANSFER_ENCODING);
    if !framed && !is_bodiless(status) {
        out.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_response_keeps_custom_reason() {
        let factory = DefaultMessageFactory;
        let response = factory
            .create_response(101, Some("Switching Protocols"), HeaderMap::new(), Bytes::new(), Version::HTTP_11)
            .unwrap();
        assert!(response.extensions().get::<ReasonPhrase>().is_none());

        let response = factory
            .create_response(200, Some("Fine"), HeaderMap::new(), Bytes::from_static(b"hi"), Version::HTTP_11)
            .unwrap();
        let wire = encode_response(&response);
        assert_eq!(&wire[..], b"HTTP/1.1 200 Fine\r\ncontent-length: 2\r\n\r\nhi");

        assert!(matches!(
            factory.create_response(1000, None, HeaderMap::new(), Bytes::new(), Version::HTTP_11),
            Err(ProtocolError::InvalidStatus(1000))
        ));
    }

    #[test]
    fn test_bodiless_statuses_get_no_length() {
        let factory = DefaultMessageFactory;
        let response = factory
            .create_response(204, None, HeaderMap::new(), Bytes::new(), Version::HTTP_11)
            .unwrap();
        assert_eq!(&encode_response(&response)[..], b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn test_create_request() {
        let factory = DefaultMessageFactory;
        let request = factory
            .create_request("PUT", "/a?b=c", HeaderMap::new(), Bytes::from_static(b"x"), Version::HTTP_10)
            .unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri().query(), Some("b=c"));
        assert!(factory.create_uri("http://[bad").is_err());
    }
}
