use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use super::{
    Backend, EventLoop, IoCallback, LoopCore, Readiness, SignalCallback, StopHandle, TimerId,
};
use crate::error::Result;
use crate::net::traits::{LogLevel, Logger};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

const WAKE_TOKEN: Token = Token(usize::MAX);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness-based backend on top of [`mio::Poll`].
///
/// mio registers descriptors edge-triggered. The connection engine expects
/// level semantics (it reads one chunk per notification), so every descriptor
/// that reported readiness is re-armed after dispatch, which makes the kernel
/// report it again while it stays ready.
pub struct MioLoop {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    armed: RefCell<HashMap<RawFd, Interest>>,
    core: LoopCore,
}

impl MioLoop {
    pub fn new(logger: Arc<dyn Logger>) -> Result<Self> {
        Self::with_stop_handle(logger, StopHandle::new())
    }

    pub fn with_stop_handle(logger: Arc<dyn Logger>, stop: StopHandle) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        stop.attach(waker);
        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(DEFAULT_EVENTS_CAPACITY)),
            armed: RefCell::new(HashMap::new()),
            core: LoopCore::new(logger, stop),
        })
    }

    fn desired_interest(&self, fd: RawFd) -> Option<Interest> {
        let io = self.core.io.borrow();
        let entry = io.get(fd)?;
        match (entry.wants_read(), entry.wants_write()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Brings the OS registration for `fd` in line with the callback table.
    fn sync(&self, fd: RawFd) -> io::Result<()> {
        let desired = self.desired_interest(fd);
        let mut armed = self.armed.borrow_mut();
        let token = Token(fd as usize);
        match (armed.get(&fd).copied(), desired) {
            (None, Some(interest)) => {
                self.registry
                    .register(&mut SourceFd(&fd), token, interest)?;
                armed.insert(fd, interest);
            }
            (Some(current), Some(interest)) if current != interest => {
                self.registry
                    .reregister(&mut SourceFd(&fd), token, interest)?;
                armed.insert(fd, interest);
            }
            (Some(_), None) => {
                armed.remove(&fd);
                // the descriptor may already be closed
                let _ = self.registry.deregister(&mut SourceFd(&fd));
            }
            _ => {}
        }
        Ok(())
    }

    fn rearm(&self, fd: RawFd) {
        let interest = self.armed.borrow().get(&fd).copied();
        if let Some(interest) = interest {
            if let Err(e) =
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            {
                self.core.logger.log(
                    LogLevel::Debug,
                    &format!("Failed to re-arm fd {}: {}", fd, e),
                );
            }
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(Vec<Readiness>, bool)> {
        let mut poll = self.poll.borrow_mut();
        let mut events = self.events.borrow_mut();
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok((Vec::new(), false));
            }
            Err(e) => return Err(e.into()),
        }

        let mut ready = Vec::with_capacity(events.iter().count());
        let mut signalled = false;
        for event in events.iter() {
            match event.token() {
                WAKE_TOKEN => {}
                SIGNAL_TOKEN => signalled = true,
                _ => ready.push(Readiness::from(event)),
            }
        }
        Ok((ready, signalled))
    }
}

impl EventLoop for MioLoop {
    fn backend(&self) -> Backend {
        Backend::Mio
    }

    fn on_readable(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.core.io.borrow_mut().set_read(fd, callback);
        if let Err(e) = self.sync(fd) {
            self.core.io.borrow_mut().clear_read(fd);
            return Err(e.into());
        }
        Ok(())
    }

    fn off_readable(&self, fd: RawFd) -> bool {
        let removed = self.core.io.borrow_mut().clear_read(fd);
        let _ = self.sync(fd);
        removed
    }

    fn on_writable(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.core.io.borrow_mut().set_write(fd, callback);
        if let Err(e) = self.sync(fd) {
            self.core.io.borrow_mut().clear_write(fd);
            return Err(e.into());
        }
        Ok(())
    }

    fn off_writable(&self, fd: RawFd) -> bool {
        let removed = self.core.io.borrow_mut().clear_write(fd);
        let _ = self.sync(fd);
        removed
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
            Ok(Some(fd)) => {
                if let Err(e) = self
                    .registry
                    .register(&mut SourceFd(&fd), SIGNAL_TOKEN, Interest::READABLE)
                {
                    self.core.logger.log(
                        LogLevel::Warn,
                        &format!("Failed to watch signal pipe: {}", e),
                    );
                    return false;
                }
                true
            }
            Ok(None) => true,
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
        while !self.core.stop.is_stopped() {
            let timeout = self.core.next_timeout();
            let (ready, signalled) = self.wait(timeout)?;

            if signalled {
                self.core.dispatch_signals();
            }
            for readiness in &ready {
                self.core.dispatch(readiness);
            }
            for readiness in &ready {
                self.rearm(readiness.fd());
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
    use crate::net::traits::NoOpLogger;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn new_loop() -> Rc<MioLoop> {
        Rc::new(MioLoop::new(Arc::new(NoOpLogger)).unwrap())
    }

    #[test]
    fn test_readable_dispatch_and_stop() {
        let lp = new_loop();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"ping").unwrap();

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let weak = Rc::downgrade(&lp);
        lp.on_readable(
            rx.as_raw_fd(),
            Rc::new(move |_| {
                counter.set(counter.get() + 1);
                if let Some(lp) = weak.upgrade() {
                    lp.stop();
                }
            }),
        )
        .unwrap();

        lp.run().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_level_semantics_after_rearm() {
        let lp = new_loop();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"unread").unwrap();

        // never reads: readiness must be reported on every iteration
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let weak = Rc::downgrade(&lp);
        lp.on_readable(
            rx.as_raw_fd(),
            Rc::new(move |_| {
                counter.set(counter.get() + 1);
                if counter.get() == 3 {
                    if let Some(lp) = weak.upgrade() {
                        lp.stop();
                    }
                }
            }),
        )
        .unwrap();

        lp.run().unwrap();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn test_delay_and_repeat() {
        let lp = new_loop();
        let ticks = Rc::new(Cell::new(0));

        let counter = ticks.clone();
        let weak = Rc::downgrade(&lp);
        lp.repeat(
            Duration::from_millis(5),
            Rc::new(move |id| {
                counter.set(counter.get() + 1);
                if counter.get() == 3 {
                    if let Some(lp) = weak.upgrade() {
                        lp.delete_timer(id);
                    }
                }
            }),
        );
        let weak = Rc::downgrade(&lp);
        lp.delay(
            Duration::from_millis(60),
            Box::new(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.stop();
                }
            }),
        );
        assert_eq!(lp.timer_count(), 2);

        lp.run().unwrap();
        assert_eq!(ticks.get(), 3);
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn test_stop_from_other_thread() {
        let lp = new_loop();
        let handle = lp.stop_handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.stop();
        });
        lp.run().unwrap();
        t.join().unwrap();
    }
}
