//! `Transfer-Encoding: chunked` bodies.

/// Result of scanning a chunk-encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkedBody {
    /// The terminating zero-length chunk was found. `consumed` counts every
    /// encoded byte up to and including the final CRLF (and any trailers).
    Complete { body: Vec<u8>, consumed: usize },
    /// Well-formed so far, but the terminating chunk has not arrived.
    Incomplete,
    /// Not a chunked body.
    Malformed,
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}

fn parse_size(line: &[u8]) -> Option<usize> {
    // chunk extensions are ignored
    let size = match line.iter().position(|&b| b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let size = std::str::from_utf8(size).ok()?.trim();
    if size.is_empty() {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}

/// Reassembles a chunk-encoded body.
pub fn decode_chunked(buf: &[u8]) -> ChunkedBody {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = find_crlf(buf, pos) else {
            // a size line is at most a few hex digits plus extensions
            let pending = &buf[pos..];
            let looks_like_size = pending
                .iter()
                .take_while(|&&b| b != b';')
                .all(|b| b.is_ascii_hexdigit() || *b == b' ' || *b == b'\r');
            return if looks_like_size {
                ChunkedBody::Incomplete
            } else {
                ChunkedBody::Malformed
            };
        };
        let Some(size) = parse_size(&buf[pos..line_end]) else {
            return ChunkedBody::Malformed;
        };
        let data_start = line_end + 2;

        if size == 0 {
            if buf.len() < data_start + 2 {
                return ChunkedBody::Incomplete;
            }
            if &buf[data_start..data_start + 2] == b"\r\n" {
                return ChunkedBody::Complete {
                    body,
                    consumed: data_start + 2,
                };
            }
            // trailer fields end with an empty line
            return match buf[data_start..].windows(4).position(|w| w == b"\r\n\r\n") {
                Some(p) => ChunkedBody::Complete {
                    body,
                    consumed: data_start + p + 4,
                },
                None => ChunkedBody::Incomplete,
            };
        }

        let Some(chunk_end) = data_start
            .checked_add(size)
            .and_then(|end| end.checked_add(2))
        else {
            return ChunkedBody::Malformed;
        };
        if buf.len() < chunk_end {
            return ChunkedBody::Incomplete;
        }
        let data_end = chunk_end - 2;
        if &buf[data_end..chunk_end] != b"\r\n" {
            return ChunkedBody::Malformed;
        }
        body.extend_from_slice(&buf[data_start..data_end]);
        pos = chunk_end;
    }
}

/// Decoded body, or empty when the input is not a complete chunked body.
pub fn merge_chunked_body(buf: &[u8]) -> Vec<u8> {
    match decode_chunked(buf) {
        ChunkedBody::Complete { body, .. } => body,
        _ => Vec::new(),
    }
}

/// Encodes `data` as chunks of at most `chunk_size` bytes followed by the
/// terminating chunk. A `chunk_size` of 0 emits a single chunk.
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = if chunk_size == 0 {
        data.len().max(1)
    } else {
        chunk_size
    };
    let mut out = Vec::with_capacity(data.len() + 16);
    for chunk in data.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for (data, size) in [
            (&b""[..], 4),
            (&b"a"[..], 4),
            (&b"abcd"[..], 4),
            (&b"hello chunked world"[..], 5),
            (&b"hello chunked world"[..], 0),
        ] {
            let encoded = encode_chunked(data, size);
            assert_eq!(
                decode_chunked(&encoded),
                ChunkedBody::Complete {
                    body: data.to_vec(),
                    consumed: encoded.len()
                }
            );
        }
    }

    #[test]
    fn test_empty_body_is_just_terminator() {
        assert_eq!(encode_chunked(b"", 8), b"0\r\n\r\n");
        assert_eq!(
            decode_chunked(b"0\r\n\r\n"),
            ChunkedBody::Complete {
                body: vec![],
                consumed: 5
            }
        );
    }

    #[test]
    fn test_truncation_at_every_point_is_incomplete() {
        let encoded = encode_chunked(b"0123456789abcdef", 7);
        for cut in 0..encoded.len() {
            assert_eq!(
                decode_chunked(&encoded[..cut]),
                ChunkedBody::Incomplete,
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_missing_final_crlf() {
        assert_eq!(decode_chunked(b"3\r\nabc\r\n0\r\n"), ChunkedBody::Incomplete);
        assert_eq!(decode_chunked(b"3\r\nabc\r\n0\r\n\r"), ChunkedBody::Incomplete);
    }

    #[test]
    fn test_malformed_inputs() {
        assert_eq!(decode_chunked(b"zz\r\nabc\r\n"), ChunkedBody::Malformed);
        assert_eq!(decode_chunked(b"3\r\nabcX\r\n0\r\n\r\n"), ChunkedBody::Malformed);
        assert_eq!(decode_chunked(b"\r\n"), ChunkedBody::Malformed);
        assert_eq!(decode_chunked(b"hello"), ChunkedBody::Malformed);
    }

    #[test]
    fn test_huge_chunk_size_is_malformed() {
        let raw = format!("{:x}\r\nabc", usize::MAX - 19);
        assert_eq!(decode_chunked(raw.as_bytes()), ChunkedBody::Malformed);
        let raw = format!("{:x}\r\nabc", usize::MAX);
        assert_eq!(decode_chunked(raw.as_bytes()), ChunkedBody::Malformed);
    }

    #[test]
    fn test_extensions_trailers_and_leftover() {
        let raw = b"4;name=x\r\nWiki\r\n0\r\nExpires: never\r\n\r\nGET /next";
        match decode_chunked(raw) {
            ChunkedBody::Complete { body, consumed } => {
                assert_eq!(body, b"Wiki");
                assert_eq!(&raw[consumed..], b"GET /next");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(merge_chunked_body(b"3\r\nab"), b"");
    }
}
