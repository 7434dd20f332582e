//! # Mill-Net
//! An event-driven network server runtime: one single-threaded event loop
//! driving listeners, buffered connections and protocol engines for raw TCP,
//! line-delimited text, HTTP/1.x and WebSocket, with optional TLS.
//!
//! ## Core Philosophy
//! - **One loop per process thread**: no locks on the hot path, callbacks run
//!   to completion on the loop thread
//! - **Pluggable reactors**: `mio` (epoll/kqueue) or a portable `poll(2)` loop
//!   behind one [`EventLoop`] trait
//! - **Protocols as framers**: a protocol decides how many buffered bytes form
//!   a package and what event the package becomes
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │   Server    │───▶│   Listener   │───▶│ Connection  │
//! └─────────────┘    └──────────────┘    └──────┬──────┘
//!        │                                      │ packages
//!        ▼                                      ▼
//! ┌─────────────┐                        ┌─────────────┐
//! │  EventLoop  │◀── timers, tasks       │  Protocol   │──▶ callbacks
//! └─────────────┘                        └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_net::prelude::*;
//!
//! fn main() -> mill_net::error::Result<()> {
//!     let server = Server::new("tcp://127.0.0.1:9000", ServerConfig::default())?;
//!     server.on("receive", Callback::data(|conn, data| {
//!         conn.send(data);
//!         Ok(())
//!     }))?;
//!     server.start()
//! }
//! ```
//!
//! - [`net`]: connections, listeners, clients and the [`Server`] façade
//! - [`protocol`]: framing and parsing for every supported scheme
//! - [`event_loop`]: the reactor backends
//! - [`timer`] and [`task`]: delayed callbacks and cooperative tasks
//! - [`error`]: error types and result handling

pub mod cache;
pub mod error;
pub mod event_loop;
pub mod net;
pub mod protocol;
pub mod task;
pub mod timer;

pub use event_loop::{Backend, EventLoop, StopHandle};
pub use net::{Connection, Server, ServerConfig, TcpClient};

/// Commonly used types.
///
/// ```rust
/// use mill_net::prelude::*;
/// ```
pub mod prelude {
    pub use crate::event_loop::{Backend, EventLoop, StopHandle};
    pub use crate::net::{
        Callback, Connection, ConnectionId, ConnectionStatus, Event, LogLevel, Logger,
        SendResult, Server, ServerConfig, TcpClient, TcpErrorKind,
    };
    pub use crate::protocol::http::ServerRequest;
    pub use crate::protocol::websocket::{Frame, Opcode};
    pub use crate::task::{ExecutionResult, TaskId, TaskRuntime};
    pub use crate::timer::Timer;
}
