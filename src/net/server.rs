//! Server façade.
//!
//! A [`Server`] owns one event loop, the connection table and any number of
//! listen ports. Each port has its own protocol and its own callback table,
//! bundled in a [`ServerContext`] that every connection accepted on the port
//! holds on to.
//!
//! ```text
//!                 ┌──────────────────────── Server ────────────────────────┐
//!                 │  ServerState: event loop, id → Connection, stats,      │
//!                 │               timer, tasks                             │
//!                 │                                                        │
//!                 │  ListenPort "http://0.0.0.0:8080"   ListenPort "ws://…" │
//!                 │   └─ ServerContext                   └─ ServerContext  │
//!                 │       ├─ Protocol::Http                  ├─ Protocol   │
//!                 │       ├─ CallbackRegistry                ├─ callbacks  │
//!                 │       └─ Listener (socket)               └─ Listener   │
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! ```rust,no_run
//! use mill_net::prelude::*;
//!
//! let server = Server::new("http://127.0.0.1:8080", ServerConfig::default())?;
//! server.on("request", Callback::request(|conn, _req| {
//!     conn.end("hello");
//!     Ok(())
//! }))?;
//! server.start()?;
//! # Ok::<(), mill_net::error::NetworkError>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::Result;
use crate::event_loop::{create_event_loop, EventLoop, StopHandle};
use crate::net::client::TcpClient;
use crate::net::config::ServerConfig;
use crate::net::connection::{Connection, SendResult};
use crate::net::events::{Callback, CallbackRegistry, Event};
use crate::net::listener::Listener;
use crate::net::stats::{ConnectionStats, StatsSnapshot};
use crate::net::traits::{ConnectionId, LogLevel, Logger};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::task::TaskRuntime;
use crate::timer::Timer;

/// State shared by every port of one server.
pub(crate) struct ServerState {
    event_loop: Rc<dyn EventLoop>,
    connections: RefCell<BTreeMap<ConnectionId, Rc<Connection>>>,
    next_id: Cell<u64>,
    stats: ConnectionStats,
    timer: Timer,
    tasks: Rc<TaskRuntime>,
    logger: Arc<dyn Logger>,
    stop: StopHandle,
}

impl ServerState {
    pub(crate) fn new(config: &ServerConfig) -> Result<Rc<Self>> {
        let logger = config.logger.clone();
        let stop = StopHandle::new();
        let event_loop = create_event_loop(&config.event_loop, logger.clone(), stop.clone())?;
        let timer = Timer::new(logger.clone());
        timer.attach(&event_loop);
        let tasks = TaskRuntime::new(event_loop.clone(), logger.clone());
        Ok(Rc::new(Self {
            event_loop,
            connections: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
            stats: ConnectionStats::default(),
            timer,
            tasks,
            logger,
            stop,
        }))
    }

    fn connections(&self) -> Vec<Rc<Connection>> {
        self.connections.borrow().values().cloned().collect()
    }
}

/// Everything a connection needs from the port that created it.
pub struct ServerContext {
    protocol: Protocol,
    callbacks: CallbackRegistry,
    config: Rc<ServerConfig>,
    state: Rc<ServerState>,
}

impl ServerContext {
    pub(crate) fn new(
        protocol: Protocol,
        config: Rc<ServerConfig>,
        state: Rc<ServerState>,
    ) -> Rc<Self> {
        let callbacks = CallbackRegistry::new(protocol.supported_events(), state.logger.clone());
        Rc::new(Self {
            protocol,
            callbacks,
            config,
            state,
        })
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.state.logger
    }

    pub fn event_loop(&self) -> &Rc<dyn EventLoop> {
        &self.state.event_loop
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.state.stats
    }

    pub fn timer(&self) -> &Timer {
        &self.state.timer
    }

    pub fn tasks(&self) -> &Rc<TaskRuntime> {
        &self.state.tasks
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Rc<Connection>> {
        self.state.connections.borrow().get(&id).cloned()
    }

    /// Open connections across all ports of the server.
    pub fn connection_count(&self) -> usize {
        self.state.connections.borrow().len()
    }

    pub(crate) fn state(&self) -> &Rc<ServerState> {
        &self.state
    }

    /// Ids increase for the lifetime of the process and wrap at `u64::MAX`.
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        let id = self.state.next_id.get().wrapping_add(1);
        self.state.next_id.set(id);
        ConnectionId(id)
    }

    pub(crate) fn track(&self, connection: Rc<Connection>) {
        self.state
            .connections
            .borrow_mut()
            .insert(connection.id(), connection);
    }

    pub(crate) fn untrack(&self, id: ConnectionId) {
        self.state.connections.borrow_mut().remove(&id);
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// One listening socket with its own protocol and callbacks.
pub struct ListenPort {
    ctx: Rc<ServerContext>,
    listener: RefCell<Option<Rc<Listener>>>,
}

impl ListenPort {
    fn new(ctx: Rc<ServerContext>) -> Rc<Self> {
        Rc::new(Self {
            ctx,
            listener: RefCell::new(None),
        })
    }

    /// Registers `callback` under an event name such as `"request"`.
    /// Unknown or unsupported names fail immediately.
    pub fn on(&self, event: &str, callback: Callback) -> Result<()> {
        self.ctx.callbacks().register_named(event, callback)
    }

    pub fn on_event(&self, event: Event, callback: Callback) -> Result<()> {
        self.ctx.callbacks().register(event, callback)
    }

    /// The URI this port was created from.
    pub fn uri(&self) -> &str {
        self.ctx.protocol().name()
    }

    pub fn context(&self) -> &Rc<ServerContext> {
        &self.ctx
    }

    pub fn is_listening(&self) -> bool {
        self.listener.borrow().is_some()
    }

    /// Bound address once listening; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.borrow().as_ref().and_then(|l| l.local_addr())
    }

    fn bind(&self) -> Result<()> {
        if self.is_listening() {
            return Ok(());
        }
        let listener = Listener::bind(self.ctx.clone())?;
        listener.resume_accept()?;
        *self.listener.borrow_mut() = Some(listener);
        Ok(())
    }

    pub fn pause_accept(&self) {
        if let Some(listener) = self.listener.borrow().as_ref() {
            listener.pause_accept();
        }
    }

    pub fn resume_accept(&self) -> Result<()> {
        match self.listener.borrow().as_ref() {
            Some(listener) => listener.resume_accept(),
            None => Ok(()),
        }
    }

    fn stop_listening(&self) {
        let listener = self.listener.borrow_mut().take();
        if let Some(listener) = listener {
            listener.close();
        }
    }
}

pub struct Server {
    config: Rc<ServerConfig>,
    registry: ProtocolRegistry,
    state: Rc<ServerState>,
    ports: Vec<Rc<ListenPort>>,
}

impl Server {
    /// Creates a server for `uri` (e.g. `ws://0.0.0.0:8080`). Nothing is
    /// bound until [`bind`](Self::bind) or [`start`](Self::start).
    pub fn new(uri: &str, config: ServerConfig) -> Result<Self> {
        Self::with_registry(uri, config, ProtocolRegistry::new())
    }

    /// Like [`new`](Self::new), resolving schemes through `registry`.
    pub fn with_registry(uri: &str, config: ServerConfig, registry: ProtocolRegistry) -> Result<Self> {
        let config = Rc::new(config);
        let state = ServerState::new(&config)?;
        let mut server = Self {
            config,
            registry,
            state,
            ports: Vec::new(),
        };
        server.listen(uri)?;
        Ok(server)
    }

    /// Adds a listen port with its own protocol and callbacks.
    pub fn listen(&mut self, uri: &str) -> Result<Rc<ListenPort>> {
        let protocol = self.registry.resolve(uri, &self.config)?;
        let ctx = ServerContext::new(protocol, self.config.clone(), self.state.clone());
        let port = ListenPort::new(ctx);
        self.ports.push(port.clone());
        Ok(port)
    }

    /// The port created from the URI given to [`new`](Self::new).
    pub fn main_port(&self) -> &Rc<ListenPort> {
        &self.ports[0]
    }

    pub fn ports(&self) -> &[Rc<ListenPort>] {
        &self.ports
    }

    /// Registers a callback on the main port.
    pub fn on(&self, event: &str, callback: Callback) -> Result<()> {
        self.main_port().on(event, callback)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds every port that is not listening yet.
    pub fn bind(&self) -> Result<()> {
        for port in &self.ports {
            port.bind()?;
        }
        Ok(())
    }

    /// Address of the main port once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.main_port().local_addr()
    }

    /// Binds and runs until stopped.
    pub fn start(&self) -> Result<()> {
        self.bind()?;
        self.run()
    }

    /// Runs the event loop on the calling thread until [`stop`](Self::stop)
    /// or a stop signal. Ports are bound first if needed.
    pub fn run(&self) -> Result<()> {
        self.bind()?;
        let signals = self.install_signal_handlers();
        for port in &self.ports {
            port.ctx.callbacks().emit_worker(Event::WorkerStart);
        }

        let result = self.state.event_loop.run();

        for port in &self.ports {
            port.ctx.callbacks().emit_worker(Event::WorkerStop);
        }
        self.shutdown();
        for signal in signals {
            self.state.event_loop.off_signal(signal);
        }
        for port in &self.ports {
            port.ctx.callbacks().emit_worker(Event::Shutdown);
        }
        self.state.logger.log(LogLevel::Info, "Server stopped");
        result
    }

    fn install_signal_handlers(&self) -> Vec<i32> {
        if !self.config.install_signal_handlers {
            return Vec::new();
        }
        let mut installed = Vec::new();
        for signal in [libc::SIGINT, libc::SIGTERM] {
            let stop = self.state.stop.clone();
            let logger = self.state.logger.clone();
            let routed = self.state.event_loop.on_signal(
                signal,
                Rc::new(move |signal| {
                    logger.log(
                        LogLevel::Info,
                        &format!("Received signal {}, stopping", signal),
                    );
                    stop.stop();
                }),
            );
            if routed {
                installed.push(signal);
            }
        }
        installed
    }

    /// Stops listening and tears down every connection and timer.
    fn shutdown(&self) {
        for port in &self.ports {
            port.stop_listening();
        }
        for connection in self.state.connections() {
            connection.destroy();
        }
        self.state.timer.del_all();
    }

    pub fn stop(&self) {
        self.state.event_loop.stop();
    }

    /// Thread-safe handle that stops [`run`](Self::run).
    pub fn stop_handle(&self) -> StopHandle {
        self.state.event_loop.stop_handle()
    }

    pub fn event_loop(&self) -> &Rc<dyn EventLoop> {
        &self.state.event_loop
    }

    pub fn timer(&self) -> &Timer {
        &self.state.timer
    }

    pub fn tasks(&self) -> &Rc<TaskRuntime> {
        &self.state.tasks
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    /// Open connections, ordered by id.
    pub fn connections(&self) -> Vec<Rc<Connection>> {
        self.state.connections()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Rc<Connection>> {
        self.state.connections.borrow().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.borrow().len()
    }

    /// Sends `data` to every established inbound connection. Returns how
    /// many connections accepted it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.connections()
            .iter()
            .filter(|c| c.is_established() && !c.is_client_mode())
            .filter(|c| c.send(data) != SendResult::Rejected)
            .count()
    }

    /// An outbound client driven by this server's loop, e.g.
    /// `server.client("http://example.com")`.
    pub fn client(&self, uri: &str) -> Result<TcpClient> {
        let protocol = self.registry.resolve(uri, &self.config)?;
        let ctx = ServerContext::new(protocol, self.config.clone(), self.state.clone());
        Ok(TcpClient::new(ctx))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("ports", &self.ports.iter().map(|p| p.uri()).collect::<Vec<_>>())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Backend;
    use crate::net::errors::NetworkError;
    use crate::net::traits::NoOpLogger;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .event_loop(vec![Backend::Poll])
            .install_signal_handlers(false)
            .logger(Arc::new(NoOpLogger))
            .build()
    }

    #[test]
    fn test_unsupported_event_fails_at_setup() {
        let server = Server::new("http://127.0.0.1:0", config()).unwrap();
        assert!(matches!(
            server.on("message", Callback::frame(|_, _| Ok(()))),
            Err(NetworkError::UnsupportedEvent(_))
        ));
        assert!(matches!(
            server.on("nonsense", Callback::worker(|| Ok(()))),
            Err(NetworkError::UnsupportedEvent(_))
        ));
        assert!(server.on("request", Callback::request(|_, _| Ok(()))).is_ok());
    }

    #[test]
    fn test_unknown_scheme_fails_at_setup() {
        assert!(matches!(
            Server::new("gopher://127.0.0.1:70", config()),
            Err(NetworkError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_lifecycle_events_fire_in_order() {
        let server = Server::new("tcp://127.0.0.1:0", config()).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for event in ["workerstart", "workerstop", "shutdown"] {
            let sink = order.clone();
            server
                .on(
                    event,
                    Callback::worker(move || {
                        sink.borrow_mut().push(event);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let stop = server.stop_handle();
        server
            .timer()
            .add(Duration::from_millis(10), false, move || {
                stop.stop();
                Ok(())
            })
            .unwrap();

        server.start().unwrap();
        assert_eq!(*order.borrow(), vec!["workerstart", "workerstop", "shutdown"]);
        assert!(!server.main_port().is_listening());
    }

    #[test]
    fn test_additional_port_has_own_callbacks() {
        let mut server = Server::new("http://127.0.0.1:0", config()).unwrap();
        let ws = server.listen("ws://127.0.0.1:0").unwrap();
        assert!(ws.on("message", Callback::frame(|_, _| Ok(()))).is_ok());
        assert!(server.on("message", Callback::frame(|_, _| Ok(()))).is_err());

        server.bind().unwrap();
        assert!(server.local_addr().is_some());
        assert!(ws.local_addr().is_some());
        assert_ne!(server.local_addr(), ws.local_addr());
        assert_eq!(server.ports().len(), 2);
    }

    #[test]
    fn test_connection_ids_increase() {
        let h = testing::TestHarness::new("tcp://127.0.0.1:9", ServerConfig::default());
        let (a, _) = h.accept();
        let (b, _) = h.accept();
        assert!(b.id() > a.id());
        assert_eq!(h.ctx.connection_count(), 2);
        a.destroy();
        assert!(h.ctx.connection(a.id()).is_none());
        assert!(h.ctx.connection(b.id()).is_some());
    }
}
