//! HTTP/1.x message heads.
//!
//! Two layers: cheap byte scans used while framing (`find_header_end`,
//! `find_header_value`) and full parsing of request/status lines and header
//! blocks into `http` types once a whole package is available.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};

use crate::error::ProtocolError;

/// Largest header block accepted before the body starts.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Request methods accepted on the server side.
pub const METHODS: [&str; 7] = ["GET", "POST", "OPTIONS", "HEAD", "DELETE", "PUT", "PATCH"];

/// Position of the blank line that ends the head (`\r\n\r\n`).
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Bytes of the first line, without its CRLF.
pub fn first_line(head: &[u8]) -> &[u8] {
    match head.windows(2).position(|w| w == b"\r\n") {
        Some(end) => &head[..end],
        None => head,
    }
}

/// Finds a header in a raw head block without parsing the whole block.
/// `head` must start with the start line. Returns the trimmed value.
pub fn find_header_value<'a>(head: &'a [u8], name: &str, case_sensitive: bool) -> Option<&'a [u8]> {
    let name = name.as_bytes();
    let mut rest = head;
    while let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") {
        rest = &rest[pos + 2..];
        let line_end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(rest.len());
        let line = &rest[..line_end];
        if line.len() > name.len() && line[name.len()] == b':' {
            let candidate = &line[..name.len()];
            let matched = if case_sensitive {
                candidate == name
            } else {
                candidate.eq_ignore_ascii_case(name)
            };
            if matched {
                return Some(trim(&line[name.len() + 1..]));
            }
        }
    }
    None
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

pub fn parse_version(token: &str) -> Result<Version, ProtocolError> {
    match token {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        "HTTP/0.9" => Ok(Version::HTTP_09),
        "HTTP/2" | "HTTP/2.0" => Ok(Version::HTTP_2),
        other => Err(ProtocolError::MalformedStartLine(format!(
            "unknown version '{}'",
            other
        ))),
    }
}

pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        _ => "HTTP/1.1",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: Version,
}

/// `GET /path?q HTTP/1.1`. A missing target means `/`, a missing version
/// means HTTP/1.1.
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, ProtocolError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::MalformedStartLine("not UTF-8".into()))?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or_default();
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ProtocolError::MalformedStartLine(format!("bad method '{}'", method)))?;
    let target = match parts.next() {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => "/".to_string(),
    };
    let version = match parts.next() {
        Some(v) => parse_version(v.trim())?,
        None => Version::HTTP_11,
    };
    Ok(RequestLine {
        method,
        target,
        version,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: Version,
    pub status: u16,
    pub reason: String,
}

/// `HTTP/1.1 200 OK`.
pub fn parse_status_line(line: &[u8]) -> Result<StatusLine, ProtocolError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::MalformedStartLine("not UTF-8".into()))?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProtocolError::MalformedStartLine(line.to_string()));
    }
    let version = parse_version(version)?;
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProtocolError::MalformedStartLine(line.to_string()))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok(StatusLine {
        version,
        status,
        reason,
    })
}

/// Parses `Name: value` lines separated by CRLF. Names are stored lowercase;
/// repeated names keep every value in order.
pub fn parse_header_block(block: &[u8]) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::new();
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
            ProtocolError::MalformedHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        let name = HeaderName::from_bytes(trim(&line[..colon])).map_err(|_| {
            ProtocolError::MalformedHeader(String::from_utf8_lossy(&line[..colon]).into_owned())
        })?;
        let value = HeaderValue::from_bytes(trim(&line[colon + 1..])).map_err(|_| {
            ProtocolError::MalformedHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// All values of `name` joined with `", "`.
pub fn header_line(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_value_case_modes() {
        let head = b"GET / HTTP/1.1\r\nhost: example.com\r\nContent-Length:  12 ";
        assert_eq!(find_header_value(head, "Host", false), Some(&b"example.com"[..]));
        assert_eq!(find_header_value(head, "Host", true), None);
        assert_eq!(find_header_value(head, "content-length", false), Some(&b"12"[..]));
        // the start line is never treated as a header
        assert_eq!(find_header_value(b"Host: x", "Host", false), None);
    }

    #[test]
    fn test_request_line_defaults() {
        let line = parse_request_line(b"DELETE /items/7?force=1 HTTP/1.0").unwrap();
        assert_eq!(line.method, Method::DELETE);
        assert_eq!(line.target, "/items/7?force=1");
        assert_eq!(line.version, Version::HTTP_10);

        let line = parse_request_line(b"GET").unwrap();
        assert_eq!(line.target, "/");
        assert_eq!(line.version, Version::HTTP_11);

        assert!(parse_request_line(b"GET / SPDY/3").is_err());
    }

    #[test]
    fn test_status_line() {
        let line = parse_status_line(b"HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(line.status, 404);
        assert_eq!(line.reason, "Not Found");
        assert!(parse_status_line(b"HTTP/1.1 abc").is_err());
        assert!(parse_status_line(b"ICY 200 OK").is_err());
    }

    #[test]
    fn test_header_block_multi_values() {
        let headers =
            parse_header_block(b"Accept: a\r\nX-Tag: one\r\nx-tag: two\r\nEmpty:\r\n").unwrap();
        assert_eq!(headers.get_all("x-tag").iter().count(), 2);
        assert_eq!(header_line(&headers, "X-Tag"), "one, two");
        assert_eq!(header_line(&headers, "empty"), "");
        assert!(headers.contains_key("empty"));
        assert!(parse_header_block(b"no colon here").is_err());
    }
}
