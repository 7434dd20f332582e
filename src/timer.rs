//! Timer facility that works with or without a running event loop.
//!
//! While a loop is attached every timer is handed to it
//! ([`EventLoop::delay`] / [`EventLoop::repeat`]) and fires with the loop's
//! precision. Without a loop (before the server starts, or in a supervising
//! process that never runs one) timers fall back to a coarse table ticked once
//! per second by `SIGALRM`:
//!
//! ```text
//!   SIGALRM ──▶ handler: flag = true, alarm(1)
//!                                │
//!   main thread: Timer::dispatch_pending() ──▶ tick_at(now) ──▶ due callbacks
//! ```
//!
//! The signal handler never runs user code; the owner of the fallback calls
//! [`Timer::dispatch_pending`] from its own loop.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::event_loop::{signal, EventLoop, TimerId};
use crate::net::traits::{LogLevel, Logger, TracingLogger};

static ALARM_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_alarm(_signal: libc::c_int) {
    ALARM_PENDING.store(true, Ordering::SeqCst);
    unsafe {
        libc::alarm(1);
    }
}

type TimerFn = Rc<dyn Fn() -> anyhow::Result<()>>;

struct AlarmTask {
    id: TimerId,
    callback: TimerFn,
    persistent: bool,
    interval_secs: u64,
}

#[derive(Default)]
struct AlarmTable {
    by_second: BTreeMap<u64, Vec<AlarmTask>>,
    live: HashSet<TimerId>,
    next_id: u64,
}

pub struct Timer {
    event_loop: RefCell<Option<Weak<dyn EventLoop>>>,
    fallback: RefCell<AlarmTable>,
    use_alarm: bool,
    logger: Arc<dyn Logger>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Timer {
    /// A timer whose fallback is driven by `SIGALRM`.
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            event_loop: RefCell::new(None),
            fallback: RefCell::new(AlarmTable::default()),
            use_alarm: true,
            logger,
        }
    }

    /// A timer whose fallback is only advanced by explicit
    /// [`tick_at`](Self::tick_at) calls. No signal handler is installed.
    pub fn manual(logger: Arc<dyn Logger>) -> Self {
        Self {
            use_alarm: false,
            ..Self::new(logger)
        }
    }

    pub fn attach(&self, event_loop: &Rc<dyn EventLoop>) {
        *self.event_loop.borrow_mut() = Some(Rc::downgrade(event_loop));
    }

    pub fn detach(&self) {
        *self.event_loop.borrow_mut() = None;
    }

    fn active_loop(&self) -> Option<Rc<dyn EventLoop>> {
        self.event_loop.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Schedules `callback` after `interval`; repeated every `interval` when
    /// `persistent`. Errors returned by the callback are logged.
    pub fn add<F>(&self, interval: Duration, persistent: bool, callback: F) -> Result<TimerId>
    where
        F: Fn() -> anyhow::Result<()> + 'static,
    {
        let logger = self.logger.clone();
        let callback: TimerFn = Rc::new(callback);

        if let Some(event_loop) = self.active_loop() {
            let run = move || {
                if let Err(e) = callback() {
                    logger.log(LogLevel::Error, &format!("Timer callback error: {:#}", e));
                }
            };
            return Ok(if persistent {
                event_loop.repeat(interval, Rc::new(move |_| run()))
            } else {
                event_loop.delay(interval, Box::new(run))
            });
        }

        let was_empty = self.fallback.borrow().live.is_empty();
        if was_empty && self.use_alarm {
            signal::set_handler(libc::SIGALRM, on_alarm as usize)?;
            unsafe {
                libc::alarm(1);
            }
        }
        Ok(self.add_fallback(now_secs(), interval, persistent, callback))
    }

    fn add_fallback(
        &self,
        now: u64,
        interval: Duration,
        persistent: bool,
        callback: TimerFn,
    ) -> TimerId {
        let mut table = self.fallback.borrow_mut();
        table.next_id = table.next_id.wrapping_add(1).max(1);
        let id = TimerId(table.next_id);
        // second resolution, rounded up
        let interval_secs = interval.as_secs() + u64::from(interval.subsec_nanos() > 0);
        table.live.insert(id);
        table
            .by_second
            .entry(now + interval_secs)
            .or_default()
            .push(AlarmTask {
                id,
                callback,
                persistent,
                interval_secs: interval_secs.max(1),
            });
        id
    }

    pub fn del(&self, id: TimerId) -> bool {
        if let Some(event_loop) = self.active_loop() {
            return event_loop.delete_timer(id);
        }
        self.fallback.borrow_mut().live.remove(&id)
    }

    pub fn del_all(&self) {
        {
            let mut table = self.fallback.borrow_mut();
            table.by_second.clear();
            table.live.clear();
        }
        if self.use_alarm {
            unsafe {
                libc::alarm(0);
            }
        }
        if let Some(event_loop) = self.active_loop() {
            event_loop.delete_all_timers();
        }
    }

    /// Number of timers waiting in the fallback table.
    pub fn pending_count(&self) -> usize {
        self.fallback.borrow().live.len()
    }

    /// Runs the fallback table if `SIGALRM` fired since the last call.
    pub fn dispatch_pending(&self) -> usize {
        if !ALARM_PENDING.swap(false, Ordering::SeqCst) {
            return 0;
        }
        self.tick_at(now_secs())
    }

    /// Runs every fallback task due at or before `now` (seconds since the
    /// epoch) and returns how many ran.
    pub fn tick_at(&self, now: u64) -> usize {
        let due: Vec<AlarmTask> = {
            let mut table = self.fallback.borrow_mut();
            let later = table.by_second.split_off(&(now + 1));
            let due = std::mem::replace(&mut table.by_second, later);
            due.into_values().flatten().collect()
        };

        let mut ran = 0;
        for task in due {
            if !self.fallback.borrow().live.contains(&task.id) {
                continue;
            }
            if let Err(e) = (task.callback)() {
                self.logger
                    .log(LogLevel::Error, &format!("Timer callback error: {:#}", e));
            }
            ran += 1;

            let mut table = self.fallback.borrow_mut();
            if task.persistent && table.live.contains(&task.id) {
                table
                    .by_second
                    .entry(now + task.interval_secs)
                    .or_default()
                    .push(task);
            } else {
                table.live.remove(&task.id);
            }
        }

        if self.use_alarm && self.fallback.borrow().live.is_empty() {
            unsafe {
                libc::alarm(0);
            }
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{create_event_loop, Backend, StopHandle};
    use crate::net::traits::NoOpLogger;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() -> anyhow::Result<()>) {
        let hits = Rc::new(Cell::new(0));
        let c = hits.clone();
        (hits, move || {
            c.set(c.get() + 1);
            Ok(())
        })
    }

    #[test]
    fn test_fallback_one_shot() {
        let timer = Timer::manual(Arc::new(NoOpLogger));
        let (hits, cb) = counter();
        let now = now_secs();
        timer.add(Duration::from_secs(2), false, cb).unwrap();

        assert_eq!(timer.tick_at(now + 1), 0);
        assert_eq!(timer.tick_at(now + 2), 1);
        assert_eq!(timer.tick_at(now + 10), 0);
        assert_eq!(hits.get(), 1);
        assert_eq!(timer.pending_count(), 0);
    }

    #[test]
    fn test_fallback_persistent_and_delete() {
        let timer = Timer::manual(Arc::new(NoOpLogger));
        let (hits, cb) = counter();
        let now = now_secs();
        let id = timer.add(Duration::from_millis(1500), true, cb).unwrap();

        // 1.5s rounds up to 2s
        assert_eq!(timer.tick_at(now + 1), 0);
        assert_eq!(timer.tick_at(now + 2), 1);
        assert_eq!(timer.tick_at(now + 4), 1);
        assert!(timer.del(id));
        assert_eq!(timer.tick_at(now + 6), 0);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_errors_are_logged_not_fatal() {
        let timer = Timer::manual(Arc::new(NoOpLogger));
        let now = now_secs();
        timer
            .add(Duration::ZERO, false, || anyhow::bail!("nope"))
            .unwrap();
        assert_eq!(timer.tick_at(now), 1);
    }

    #[test]
    fn test_routes_to_attached_loop() {
        let timer = Timer::manual(Arc::new(NoOpLogger));
        let lp = create_event_loop(
            &[Backend::Poll],
            Arc::new(NoOpLogger),
            StopHandle::new(),
        )
        .unwrap();
        timer.attach(&lp);

        let (hits, cb) = counter();
        let id = timer.add(Duration::from_millis(1), false, cb).unwrap();
        assert_eq!(lp.timer_count(), 1);
        assert_eq!(timer.pending_count(), 0);

        let stop = lp.stop_handle();
        lp.delay(Duration::from_millis(20), Box::new(move || stop.stop()));
        lp.run().unwrap();
        assert_eq!(hits.get(), 1);
        assert!(!timer.del(id));

        timer.detach();
        let (_, cb) = counter();
        timer.add(Duration::from_secs(1), false, cb).unwrap();
        assert_eq!(timer.pending_count(), 1);
    }
}
