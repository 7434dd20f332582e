use std::rc::Rc;

use bytes::Bytes;

use super::{PackageLength, ProtocolInfo};
use crate::error::ProtocolError;
use crate::net::connection::Connection;
use crate::net::server::ServerContext;

/// Unframed byte stream.
///
/// Applications consume the `receive` event, which fires for every read
/// before framing. Each read is then taken as one package and dropped so the
/// receive buffer never grows.
#[derive(Debug)]
pub struct RawTcpProtocol {
    info: ProtocolInfo,
}

impl RawTcpProtocol {
    pub fn new(info: ProtocolInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    pub fn check_package_length(&self, buffer: &[u8], _connection: &Connection) -> PackageLength {
        if buffer.is_empty() {
            PackageLength::NeedMore
        } else {
            PackageLength::Complete(buffer.len())
        }
    }

    pub fn execute(
        &self,
        _ctx: &ServerContext,
        _package: Bytes,
        _connection: &Rc<Connection>,
    ) -> Result<bool, ProtocolError> {
        Ok(false)
    }
}
