use std::rc::Rc;

use bytes::Bytes;

use super::{PackageLength, ProtocolInfo};
use crate::error::ProtocolError;
use crate::net::connection::Connection;
use crate::net::server::ServerContext;

/// Newline-delimited text. Each line, `\n` included, is one package and is
/// delivered to `textreceive` without its line ending.
#[derive(Debug)]
pub struct TextProtocol {
    info: ProtocolInfo,
}

impl TextProtocol {
    pub fn new(info: ProtocolInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    pub fn check_package_length(&self, buffer: &[u8], connection: &Connection) -> PackageLength {
        match buffer.iter().position(|&b| b == b'\n') {
            Some(pos) if pos < connection.max_package_size() => PackageLength::Complete(pos + 1),
            // a line that can never fit
            _ if buffer.len() >= connection.max_package_size() => PackageLength::CLOSE,
            Some(_) => PackageLength::CLOSE,
            None => PackageLength::NeedMore,
        }
    }

    pub fn execute(
        &self,
        ctx: &ServerContext,
        package: Bytes,
        connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        let line = String::from_utf8_lossy(&package);
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        ctx.callbacks().emit_text(connection, line);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::config::ServerConfig;
    use crate::net::server::testing::TestHarness;

    #[test]
    fn test_lines_are_framed_individually() {
        let harness = TestHarness::new("text://127.0.0.1:7000", ServerConfig::default());
        let lines = harness.record_text();
        let (conn, wire) = harness.accept();

        wire.push(b"hello\r\nwor");
        conn.on_readable();
        wire.push(b"ld\n");
        conn.on_readable();

        assert_eq!(*lines.borrow(), vec!["hello".to_string(), "world".to_string()]);
        assert_eq!(conn.recv_buffer_len(), 0);
    }

    #[test]
    fn test_oversized_line_closes() {
        let config = ServerConfig::builder().max_package_size(8).build();
        let harness = TestHarness::new("text://127.0.0.1:7000", config);
        let (conn, wire) = harness.accept();

        wire.push(b"0123456789");
        conn.on_readable();
        assert!(conn.is_closed());
    }
}
