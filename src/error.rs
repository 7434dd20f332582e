use std::result::Result as StdResult;

pub use crate::net::errors::{NetworkError, ProtocolError};

pub type Result<T> = StdResult<T, NetworkError>;
