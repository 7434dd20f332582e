//! Connection engine, listeners and the server façade.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────┐              │
//! │  │ Server /     │────────▶│ Named callbacks │              │
//! │  │ TcpClient    │          │ (on "request")  │              │
//! │  └──────────────┘          └─────────────────┘              │
//! └────────────┬──────────────────────▲─────────────────────────┘
//!              │ bind / connect       │ emit
//!              ▼                      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Listener ──accept──▶ Connection ──package──▶ Protocol      │
//! │                        recv/send buffers, backpressure, TLS │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ on_readable / on_writable
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                EventLoop (mio or poll(2))                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on the loop thread. A connection is only ever touched
//! from callbacks the loop dispatches, so state lives in `Rc`/`RefCell`
//! rather than behind locks.

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod listener;
pub mod server;
pub mod stats;
pub mod tls;
pub mod traits;
pub mod transport;

pub use client::TcpClient;
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionStatus, SendResult};
pub use events::{Callback, CallbackRegistry, Event, TcpErrorKind};
pub use listener::Listener;
pub use server::{ListenPort, Server, ServerContext};
pub use stats::StatsSnapshot;
pub use traits::{ConnectionId, LogLevel, Logger, NoOpLogger, TracingLogger};
