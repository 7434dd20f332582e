//! Uniform event-loop interface over interchangeable reactor backends.
//!
//! Everything above this module (connections, listeners, timers, tasks) talks
//! to an [`EventLoop`] trait object and never to a concrete poller. Two
//! backends ship with the crate:
//!
//! ```text
//! ┌──────────────┐   preference list   ┌──────────────────────────────┐
//! │ ServerConfig │ ──────────────────▶│ create_event_loop            │
//! └──────────────┘                     │  first Backend::is_available │
//!                                      └──────────┬───────────────────┘
//!                         ┌───────────────────────┴──────────────┐
//!                         ▼                                      ▼
//!              ┌────────────────────┐               ┌────────────────────┐
//!              │ MioLoop            │               │ PollLoop           │
//!              │ epoll / kqueue     │               │ poll(2) fallback   │
//!              └─────────┬──────────┘               └─────────┬──────────┘
//!                        └──────────────┬─────────────────────┘
//!                                       ▼
//!                     LoopCore: fd → callbacks, timer heap, signals
//! ```
//!
//! The loop is single-threaded: registrations, timers and callbacks all live
//! on the thread that calls [`EventLoop::run`]. The only thread-safe entry
//! point is [`StopHandle`].
//!
//! Callbacks never crash the loop. A panic inside one is caught, logged and
//! the remaining ready events are still dispatched.

pub mod event;
pub mod mio_loop;
pub mod poll_loop;
pub(crate) mod registry;
pub(crate) mod signal;
pub(crate) mod timers;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};
use crate::net::traits::{LogLevel, Logger};

pub use event::Readiness;
pub use mio_loop::MioLoop;
pub use poll_loop::PollLoop;

use registry::IoRegistry;
use signal::SignalPipe;
use timers::{DueTimer, TimerQueue};

/// Callback invoked with the ready descriptor.
pub type IoCallback = Rc<dyn Fn(RawFd)>;
/// Callback invoked with the delivered signal number.
pub type SignalCallback = Rc<dyn Fn(i32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Operations every reactor backend provides.
///
/// Interest registration is persistent until removed, and registering a
/// second callback for the same descriptor and direction replaces the first.
pub trait EventLoop {
    fn backend(&self) -> Backend;

    fn on_readable(&self, fd: RawFd, callback: IoCallback) -> Result<()>;
    /// Returns whether a read registration existed.
    fn off_readable(&self, fd: RawFd) -> bool;
    fn on_writable(&self, fd: RawFd, callback: IoCallback) -> Result<()>;
    fn off_writable(&self, fd: RawFd) -> bool;

    /// Runs `callback` once after `after`.
    fn delay(&self, after: Duration, callback: Box<dyn FnOnce()>) -> TimerId;
    /// Runs `callback` every `interval` until the timer is deleted.
    fn repeat(&self, interval: Duration, callback: Rc<dyn Fn(TimerId)>) -> TimerId;
    fn delete_timer(&self, id: TimerId) -> bool;
    fn delete_all_timers(&self);
    fn timer_count(&self) -> usize;

    /// Routes `signal` through the loop. Returns `false` when signal delivery
    /// is unavailable (another loop owns it, or the handler cannot be set).
    fn on_signal(&self, signal: i32, callback: SignalCallback) -> bool;
    fn off_signal(&self, signal: i32) -> bool;

    /// Blocks, dispatching I/O, timers and signals until stopped.
    fn run(&self) -> Result<()>;
    fn stop(&self);
    fn stop_handle(&self) -> StopHandle;
}

/// Available reactor backends, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Readiness-based multiplexing through mio (epoll on Linux, kqueue on BSD/macOS).
    Mio,
    /// Portable `poll(2)` fallback.
    Poll,
}

impl Backend {
    pub const DEFAULT_PREFERENCE: [Backend; 2] = [Backend::Mio, Backend::Poll];

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Mio => "mio",
            Backend::Poll => "poll",
        }
    }

    /// Capability probe used during backend selection.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Mio => mio::Poll::new().is_ok(),
            Backend::Poll => true,
        }
    }

    fn build(&self, logger: Arc<dyn Logger>, stop: StopHandle) -> Result<Rc<dyn EventLoop>> {
        Ok(match self {
            Backend::Mio => Rc::new(MioLoop::with_stop_handle(logger, stop)?),
            Backend::Poll => Rc::new(PollLoop::with_stop_handle(logger, stop)?),
        })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mio" | "epoll" | "kqueue" => Ok(Backend::Mio),
            "poll" | "select" => Ok(Backend::Poll),
            other => Err(NetworkError::Configuration(format!(
                "unknown event loop backend '{}'",
                other
            ))),
        }
    }
}

/// Builds the first available backend from `preference`.
///
/// Fails with [`NetworkError::BackendUnavailable`] when none is usable; this
/// is a fatal startup error.
pub fn create_event_loop(
    preference: &[Backend],
    logger: Arc<dyn Logger>,
    stop: StopHandle,
) -> Result<Rc<dyn EventLoop>> {
    for backend in preference {
        if backend.is_available() {
            logger.log(LogLevel::Debug, &format!("Using {} event loop", backend));
            return backend.build(logger, stop);
        }
        logger.log(
            LogLevel::Debug,
            &format!("Event loop backend {} is not available", backend),
        );
    }
    Err(NetworkError::BackendUnavailable)
}

/// Wakes a blocked poller from another thread.
pub(crate) trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

impl Notify for mio::Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

#[derive(Default)]
struct StopState {
    stopped: AtomicBool,
    notifier: Mutex<Option<Arc<dyn Notify>>>,
}

/// Thread-safe handle that stops a running loop.
///
/// A handle can be created before the loop exists and handed to the loop at
/// construction; stopping before `run` makes `run` return immediately. A
/// stopped loop stays stopped.
#[derive(Clone, Default)]
pub struct StopHandle {
    state: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        if let Ok(guard) = self.state.notifier.lock() {
            if let Some(notifier) = guard.as_ref() {
                let _ = notifier.notify();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, notifier: Arc<dyn Notify>) {
        if let Ok(mut guard) = self.state.notifier.lock() {
            *guard = Some(notifier);
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Backend-independent loop state: the descriptor registry, timers and
/// signal routing. Backends own one and only add the OS wait.
pub(crate) struct LoopCore {
    pub(crate) io: RefCell<IoRegistry>,
    pub(crate) timers: RefCell<TimerQueue>,
    signals: RefCell<HashMap<i32, SignalCallback>>,
    pub(crate) signal_pipe: RefCell<Option<SignalPipe>>,
    pub(crate) stop: StopHandle,
    pub(crate) logger: Arc<dyn Logger>,
}

impl LoopCore {
    pub(crate) fn new(logger: Arc<dyn Logger>, stop: StopHandle) -> Self {
        Self {
            io: RefCell::new(IoRegistry::default()),
            timers: RefCell::new(TimerQueue::default()),
            signals: RefCell::new(HashMap::new()),
            signal_pipe: RefCell::new(None),
            stop,
            logger,
        }
    }

    fn guarded(&self, what: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            self.logger
                .log(LogLevel::Error, &format!("{} callback panicked", what));
        }
    }

    /// Runs the callbacks for one readiness report. Callbacks are looked up at
    /// dispatch time, so a callback removed by an earlier one is skipped.
    pub(crate) fn dispatch(&self, ready: &Readiness) {
        let fd = ready.fd();
        if ready.is_readable() {
            let callback = self.io.borrow().read_callback(fd);
            if let Some(callback) = callback {
                self.guarded("readable", || callback(fd));
            }
        }
        if ready.is_writable() {
            let callback = self.io.borrow().write_callback(fd);
            if let Some(callback) = callback {
                self.guarded("writable", || callback(fd));
            }
        }
    }

    pub(crate) fn run_due_timers(&self) {
        let now = Instant::now();
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            match due {
                Some(DueTimer::Once(_, callback)) => self.guarded("timer", callback),
                Some(DueTimer::Every(id, callback)) => self.guarded("timer", || callback(id)),
                None => break,
            }
        }
    }

    /// Time until the next timer, `None` to block indefinitely.
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        self.timers
            .borrow_mut()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn dispatch_signals(&self) {
        let received = match self.signal_pipe.borrow().as_ref() {
            Some(pipe) => pipe.drain(),
            None => return,
        };
        for signal in received {
            let callback = self.signals.borrow().get(&signal).cloned();
            if let Some(callback) = callback {
                self.logger
                    .log(LogLevel::Debug, &format!("Dispatching signal {}", signal));
                self.guarded("signal", || callback(signal));
            }
        }
    }

    /// Installs the handler and records the callback. Returns the pipe's read
    /// descriptor when the pipe was opened by this call, so the backend can
    /// start watching it.
    pub(crate) fn add_signal(
        &self,
        signal: i32,
        callback: SignalCallback,
    ) -> std::result::Result<Option<RawFd>, io::Error> {
        let mut slot = self.signal_pipe.borrow_mut();
        let opened = if slot.is_none() {
            let pipe = SignalPipe::open()?;
            let fd = pipe.read_fd();
            *slot = Some(pipe);
            Some(fd)
        } else {
            None
        };
        if let Some(pipe) = slot.as_mut() {
            pipe.install(signal)?;
        }
        self.signals.borrow_mut().insert(signal, callback);
        Ok(opened)
    }

    pub(crate) fn remove_signal(&self, signal: i32) -> bool {
        if self.signals.borrow_mut().remove(&signal).is_none() {
            return false;
        }
        if let Some(pipe) = self.signal_pipe.borrow_mut().as_mut() {
            if let Err(e) = pipe.restore(signal) {
                self.logger.log(
                    LogLevel::Warn,
                    &format!("Failed to restore signal {}: {}", signal, e),
                );
            }
        }
        true
    }

    pub(crate) fn signal_fd(&self) -> Option<RawFd> {
        self.signal_pipe.borrow().as_ref().map(|p| p.read_fd())
    }
}
