use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use super::signal::{drain_fd, nonblocking_pipe};
use super::{
    Backend, EventLoop, IoCallback, LoopCore, Notify, Readiness, SignalCallback, StopHandle,
    TimerId,
};
use crate::error::Result;
use crate::net::traits::{LogLevel, Logger};

/// Registered descriptor count above which the fallback warns (once).
pub const FD_WARN_THRESHOLD: usize = 1024;

struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Notify for WakePipe {
    fn notify(&self) -> io::Result<()> {
        let byte = 1u8;
        let n = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // a full pipe already guarantees a wake-up
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// `poll(2)` fallback backend.
///
/// The descriptor set is rebuilt from the callback table before every wait
/// and the wait timeout is always the time until the next timer, so timers
/// fire on time without a fixed polling interval.
pub struct PollLoop {
    core: LoopCore,
    wake: Arc<WakePipe>,
    warned: Cell<bool>,
}

impl PollLoop {
    pub fn new(logger: Arc<dyn Logger>) -> Result<Self> {
        Self::with_stop_handle(logger, StopHandle::new())
    }

    pub fn with_stop_handle(logger: Arc<dyn Logger>, stop: StopHandle) -> Result<Self> {
        let (read, write) = nonblocking_pipe()?;
        let wake = Arc::new(WakePipe { read, write });
        stop.attach(wake.clone());
        Ok(Self {
            core: LoopCore::new(logger, stop),
            wake,
            warned: Cell::new(false),
        })
    }

    fn check_threshold(&self) {
        let count = self.core.io.borrow().len();
        if count > FD_WARN_THRESHOLD && !self.warned.get() {
            self.warned.set(true);
            self.core.logger.log(
                LogLevel::Warn,
                &format!(
                    "poll backend is watching {} descriptors (more than {}); consider the mio backend",
                    count, FD_WARN_THRESHOLD
                ),
            );
        }
    }

    fn build_pollfds(&self) -> Vec<libc::pollfd> {
        let io = self.core.io.borrow();
        let mut fds = Vec::with_capacity(io.len() + 2);
        fds.push(libc::pollfd {
            fd: self.wake.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        if let Some(fd) = self.core.signal_fd() {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        for (fd, entry) in io.iter() {
            let mut events = 0;
            if entry.wants_read() {
                events |= libc::POLLIN;
            }
            if entry.wants_write() {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd {
                fd: *fd,
                events,
                revents: 0,
            });
        }
        fds
    }
}

/// Rounds up to whole milliseconds so a wait never ends just before a
/// deadline and spins.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl EventLoop for PollLoop {
    fn backend(&self) -> Backend {
        Backend::Poll
    }

    fn on_readable(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.core.io.borrow_mut().set_read(fd, callback);
        self.check_threshold();
        Ok(())
    }

    fn off_readable(&self, fd: RawFd) -> bool {
        self.core.io.borrow_mut().clear_read(fd)
    }

    fn on_writable(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.core.io.borrow_mut().set_write(fd, callback);
        self.check_threshold();
        Ok(())
    }

    fn off_writable(&self, fd: RawFd) -> bool {
        self.core.io.borrow_mut().clear_write(fd)
    }

    fn delay(&self, after: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        self.core.timers.borrow_mut().add_once(after, callback)
    }

    fn repeat(&self, interval: Duration, callback: Rc<dyn Fn(TimerId)>) -> TimerId {
        self.core.timers.borrow_mut().add_repeating(interval, callback)
    }

    fn delete_timer(&self, id: TimerId) -> bool {
        self.core.timers.borrow_mut().cancel(id)
    }

    fn delete_all_timers(&self) {
        self.core.timers.borrow_mut().clear();
    }

    fn timer_count(&self) -> usize {
        self.core.timers.borrow().len()
    }

    fn on_signal(&self, signal: i32, callback: SignalCallback) -> bool {
        match self.core.add_signal(signal, callback) {
            Ok(_) => true,
            Err(e) => {
                self.core.logger.log(
                    LogLevel::Warn,
                    &format!("Signal {} cannot be routed through the loop: {}", signal, e),
                );
                false
            }
        }
    }

    fn off_signal(&self, signal: i32) -> bool {
        self.core.remove_signal(signal)
    }

    fn run(&self) -> Result<()> {
        let wake_fd = self.wake.read.as_raw_fd();
        while !self.core.stop.is_stopped() {
            let timeout = timeout_ms(self.core.next_timeout());
            let mut fds = self.build_pollfds();

            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err.into());
                }
            }

            if n > 0 {
                let signal_fd = self.core.signal_fd();
                let mut ready = Vec::new();
                for pfd in fds.iter().filter(|p| p.revents != 0) {
                    if pfd.fd == wake_fd {
                        drain_fd(wake_fd);
                    } else if Some(pfd.fd) == signal_fd {
                        self.core.dispatch_signals();
                    } else {
                        ready.push(Readiness::from_revents(pfd.fd, pfd.revents));
                    }
                }
                for readiness in &ready {
                    self.core.dispatch(readiness);
                }
            }
            self.core.run_due_timers();
        }
        Ok(())
    }

    fn stop(&self) {
        self.core.stop.stop();
    }

    fn stop_handle(&self) -> StopHandle {
        self.core.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::traits::testing::MemoryLogger;
    use crate::net::traits::NoOpLogger;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1500))), 2);
        assert_eq!(timeout_ms(Some(Duration::from_millis(7))), 7);
    }

    #[test]
    fn test_writable_then_deregistered() {
        let lp = Rc::new(PollLoop::new(Arc::new(NoOpLogger)).unwrap());
        let (tx, _rx) = UnixStream::pair().unwrap();
        tx.set_nonblocking(true).unwrap();

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let weak = Rc::downgrade(&lp);
        lp.on_writable(
            tx.as_raw_fd(),
            Rc::new(move |fd| {
                counter.set(counter.get() + 1);
                if let Some(lp) = weak.upgrade() {
                    lp.off_writable(fd);
                }
            }),
        )
        .unwrap();
        let weak = Rc::downgrade(&lp);
        lp.delay(
            Duration::from_millis(30),
            Box::new(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.stop();
                }
            }),
        );

        lp.run().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_timer_latency_without_io() {
        let lp = Rc::new(PollLoop::new(Arc::new(NoOpLogger)).unwrap());
        let weak = Rc::downgrade(&lp);
        let started = Instant::now();
        lp.delay(
            Duration::from_millis(20),
            Box::new(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.stop();
                }
            }),
        );
        lp.run().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_warns_once_over_threshold() {
        let logger = Arc::new(MemoryLogger::default());
        let lp = PollLoop::new(logger.clone()).unwrap();
        for fd in 0..(FD_WARN_THRESHOLD as RawFd + 5) {
            // registration alone never touches the descriptor
            lp.on_readable(10_000 + fd, Rc::new(|_| {})).unwrap();
        }
        let warnings = logger
            .lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == LogLevel::Warn)
            .count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_readable_pipe() {
        let lp = Rc::new(PollLoop::new(Arc::new(NoOpLogger)).unwrap());
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();

        let weak = Rc::downgrade(&lp);
        let seen = Rc::new(Cell::new(-1));
        let slot = seen.clone();
        lp.on_readable(
            rx.as_raw_fd(),
            Rc::new(move |fd| {
                slot.set(fd);
                if let Some(lp) = weak.upgrade() {
                    lp.stop();
                }
            }),
        )
        .unwrap();
        lp.run().unwrap();
        assert_eq!(seen.get(), rx.as_raw_fd());
    }
}
