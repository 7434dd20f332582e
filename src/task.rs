//! Cooperative tasks driven by the event loop.
//!
//! A task is a `!Send` future owned by the [`TaskRuntime`]. It runs on the
//! loop thread until it reaches an explicit suspension point
//! ([`TaskRuntime::suspend`], [`TaskRuntime::sleep`] or
//! [`TaskRuntime::exec`]) and continues when something resumes it: a timer,
//! an I/O callback, or user code calling [`TaskRuntime::resume`]. The
//! reactor never blocks inside a task.
//!
//! ```rust,no_run
//! # use mill_net::task::TaskRuntime;
//! # use std::rc::Rc;
//! # use std::time::Duration;
//! # fn demo(tasks: Rc<TaskRuntime>) {
//! let rt = tasks.clone();
//! tasks.spawn(async move {
//!     rt.sleep(Duration::from_millis(50)).await;
//!     let answer = rt.suspend().await; // parked until someone resumes us
//!     let _ = answer.downcast::<bool>();
//! });
//! # }
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use crate::error::{NetworkError, Result};
use crate::event_loop::{EventLoop, TimerId};
use crate::net::traits::{LogLevel, Logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Value handed to a suspended task by [`TaskRuntime::resume`].
pub type ResumeValue = Box<dyn Any>;

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Outcome of [`TaskRuntime::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit status, or -1 when the process was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

struct Slot {
    /// `None` while the task is being polled.
    future: Option<LocalFuture>,
    resume_value: Option<ResumeValue>,
}

struct TaskWaker {
    id: TaskId,
    woken: Arc<Mutex<VecDeque<TaskId>>>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Ok(mut queue) = self.woken.lock() {
            queue.push_back(self.id);
        }
    }
}

pub struct TaskRuntime {
    event_loop: Rc<dyn EventLoop>,
    tasks: RefCell<HashMap<TaskId, Slot>>,
    next_id: Cell<u64>,
    current: Cell<Option<TaskId>>,
    woken: Arc<Mutex<VecDeque<TaskId>>>,
    draining: Cell<bool>,
    logger: Arc<dyn Logger>,
}

impl TaskRuntime {
    pub fn new(event_loop: Rc<dyn EventLoop>, logger: Arc<dyn Logger>) -> Rc<Self> {
        Rc::new(Self {
            event_loop,
            tasks: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            current: Cell::new(None),
            woken: Arc::new(Mutex::new(VecDeque::new())),
            draining: Cell::new(false),
            logger,
        })
    }

    /// Creates a task and runs it up to its first suspension point.
    pub fn spawn<F>(self: &Rc<Self>, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.next_id.get().wrapping_add(1));
        self.next_id.set(id.0);
        self.tasks.borrow_mut().insert(
            id,
            Slot {
                future: Some(Box::pin(future)),
                resume_value: None,
            },
        );
        self.poll_task(id);
        self.drain_woken();
        id
    }

    pub fn exists(&self, id: TaskId) -> bool {
        self.tasks.borrow().contains_key(&id)
    }

    /// The task currently being polled, if any.
    pub fn current(&self) -> Option<TaskId> {
        self.current.get()
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Hands `value` to a suspended task and runs it to its next suspension
    /// point. Returns `false` when no such task exists.
    pub fn resume<T: Any>(&self, id: TaskId, value: T) -> bool {
        {
            let mut tasks = self.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return false;
            };
            slot.resume_value = Some(Box::new(value));
        }
        if self.current.get() == Some(id) {
            // resumed from inside itself: finish the current poll first
            self.push_woken(id);
        } else {
            self.poll_task(id);
        }
        self.drain_woken();
        true
    }

    /// Parks the calling task until [`resume`](Self::resume) is called for it.
    pub fn suspend(self: &Rc<Self>) -> Suspend {
        Suspend {
            runtime: self.clone(),
            id: None,
        }
    }

    /// Parks the calling task for `duration` using a loop timer.
    pub fn sleep(self: &Rc<Self>, duration: Duration) -> Sleep {
        Sleep {
            runtime: self.clone(),
            duration,
            state: SleepState::Init,
        }
    }

    /// Runs `command` through `/bin/sh -c`, parking the calling task while
    /// the event loop collects its output.
    pub async fn exec(self: &Rc<Self>, command: &str) -> Result<ExecutionResult> {
        let Some(id) = self.current() else {
            return Err(NetworkError::Configuration(
                "exec() awaited outside of a task".into(),
            ));
        };
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        self.logger.log(
            LogLevel::Debug,
            &format!("exec: spawned pid {} for {:?}", child.id(), command),
        );

        let pipes = match self.watch_output(id, &mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        while !pipes.borrow().is_finished() {
            // values from unrelated resumes are dropped
            let _ = self.suspend().await;
        }

        let status = child.wait()?;
        let pipes = pipes.borrow();
        Ok(ExecutionResult {
            code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&pipes.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&pipes.stderr).into_owned(),
        })
    }

    /// Registers the child's output pipes with the loop. The calling task is
    /// resumed once both reach end of file.
    fn watch_output(
        self: &Rc<Self>,
        id: TaskId,
        child: &mut Child,
    ) -> Result<Rc<RefCell<ChildOutput>>> {
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(NetworkError::Configuration("child output is not piped".into()));
        };
        let (out_fd, err_fd) = (stdout.as_raw_fd(), stderr.as_raw_fd());
        set_nonblocking(out_fd)?;
        set_nonblocking(err_fd)?;

        let pipes = Rc::new(RefCell::new(ChildOutput {
            out: Some(stdout),
            err: Some(stderr),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }));
        for (fd, which) in [(out_fd, Stream::Out), (err_fd, Stream::Err)] {
            let weak = Rc::downgrade(self);
            let state = pipes.clone();
            let registered = self.event_loop.on_readable(
                fd,
                Rc::new(move |fd| {
                    let Some(runtime) = weak.upgrade() else {
                        return;
                    };
                    if !state.borrow_mut().pump(which) {
                        return;
                    }
                    runtime.event_loop.off_readable(fd);
                    let finished = {
                        let mut state = state.borrow_mut();
                        state.close(which);
                        state.is_finished()
                    };
                    if finished {
                        runtime.resume(id, ());
                    }
                }),
            );
            if let Err(e) = registered {
                self.event_loop.off_readable(out_fd);
                return Err(e);
            }
        }
        Ok(pipes)
    }

    fn take_resume_value(&self, id: TaskId) -> Option<ResumeValue> {
        self.tasks
            .borrow_mut()
            .get_mut(&id)
            .and_then(|slot| slot.resume_value.take())
    }

    fn push_woken(&self, id: TaskId) {
        if let Ok(mut queue) = self.woken.lock() {
            queue.push_back(id);
        }
    }

    fn poll_task(&self, id: TaskId) {
        let future = match self.tasks.borrow_mut().get_mut(&id) {
            Some(slot) => slot.future.take(),
            None => return,
        };
        let Some(mut future) = future else {
            // already on the stack; poll again once it yields
            self.push_woken(id);
            return;
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            woken: self.woken.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        let previous = self.current.replace(Some(id));
        let outcome = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        self.current.set(previous);

        match outcome {
            Ok(Poll::Pending) => {
                if let Some(slot) = self.tasks.borrow_mut().get_mut(&id) {
                    slot.future = Some(future);
                }
            }
            Ok(Poll::Ready(())) => {
                self.tasks.borrow_mut().remove(&id);
            }
            Err(_) => {
                self.tasks.borrow_mut().remove(&id);
                self.logger
                    .log(LogLevel::Error, &format!("{} panicked and was dropped", id));
            }
        }
    }

    fn drain_woken(&self) {
        if self.draining.replace(true) {
            return;
        }
        loop {
            let next = self.woken.lock().ok().and_then(|mut q| q.pop_front());
            match next {
                Some(id) => self.poll_task(id),
                None => break,
            }
        }
        self.draining.set(false);
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Out,
    Err,
}

/// Output pipes of an [`exec`](TaskRuntime::exec) child and what was read
/// from them so far.
struct ChildOutput {
    out: Option<ChildStdout>,
    err: Option<ChildStderr>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ChildOutput {
    /// Reads what is available. Returns `true` at end of file.
    fn pump(&mut self, which: Stream) -> bool {
        let (reader, sink): (&mut dyn Read, &mut Vec<u8>) = match which {
            Stream::Out => match self.out.as_mut() {
                Some(pipe) => (pipe as &mut dyn Read, &mut self.stdout),
                None => return true,
            },
            Stream::Err => match self.err.as_mut() {
                Some(pipe) => (pipe as &mut dyn Read, &mut self.stderr),
                None => return true,
            },
        };
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => sink.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return true,
            }
        }
    }

    fn close(&mut self, which: Stream) {
        match which {
            Stream::Out => self.out = None,
            Stream::Err => self.err = None,
        }
    }

    fn is_finished(&self) -> bool {
        self.out.is_none() && self.err.is_none()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by a live pipe handle
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Future returned by [`TaskRuntime::suspend`].
pub struct Suspend {
    runtime: Rc<TaskRuntime>,
    id: Option<TaskId>,
}

impl Future for Suspend {
    type Output = ResumeValue;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<ResumeValue> {
        match self.id {
            None => {
                let Some(id) = self.runtime.current() else {
                    // not inside a task: nobody can resume us
                    self.runtime
                        .logger
                        .log(LogLevel::Warn, "suspend() awaited outside of a task");
                    return Poll::Ready(Box::new(()));
                };
                // stale values from an earlier suspension are discarded
                self.runtime.take_resume_value(id);
                self.id = Some(id);
                Poll::Pending
            }
            Some(id) => match self.runtime.take_resume_value(id) {
                Some(value) => Poll::Ready(value),
                None => Poll::Pending,
            },
        }
    }
}

enum SleepState {
    Init,
    Waiting(TaskId, TimerId),
    Done,
}

/// Future returned by [`TaskRuntime::sleep`].
pub struct Sleep {
    runtime: Rc<TaskRuntime>,
    duration: Duration,
    state: SleepState,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        match self.state {
            SleepState::Init => {
                let Some(id) = self.runtime.current() else {
                    self.runtime
                        .logger
                        .log(LogLevel::Warn, "sleep() awaited outside of a task");
                    self.state = SleepState::Done;
                    return Poll::Ready(());
                };
                self.runtime.take_resume_value(id);
                let weak: Weak<TaskRuntime> = Rc::downgrade(&self.runtime);
                let timer = self.runtime.event_loop.delay(
                    self.duration,
                    Box::new(move || {
                        if let Some(runtime) = weak.upgrade() {
                            runtime.resume(id, ());
                        }
                    }),
                );
                self.state = SleepState::Waiting(id, timer);
                Poll::Pending
            }
            SleepState::Waiting(id, _) => match self.runtime.take_resume_value(id) {
                Some(_) => {
                    self.state = SleepState::Done;
                    Poll::Ready(())
                }
                None => Poll::Pending,
            },
            SleepState::Done => Poll::Ready(()),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let SleepState::Waiting(_, timer) = self.state {
            self.runtime.event_loop.delete_timer(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{create_event_loop, Backend, StopHandle};
    use crate::net::traits::NoOpLogger;
    use std::time::Instant;

    fn runtime() -> (Rc<dyn EventLoop>, Rc<TaskRuntime>) {
        let lp = create_event_loop(&[Backend::Poll], Arc::new(NoOpLogger), StopHandle::new())
            .unwrap();
        let rt = TaskRuntime::new(lp.clone(), Arc::new(NoOpLogger));
        (lp, rt)
    }

    #[test]
    fn test_suspend_and_resume_with_value() {
        let (_lp, rt) = runtime();
        let got = Rc::new(Cell::new(None));

        let inner = rt.clone();
        let slot = got.clone();
        let id = rt.spawn(async move {
            let value = inner.suspend().await;
            slot.set(value.downcast::<bool>().ok().map(|b| *b));
        });

        assert!(rt.exists(id));
        assert_eq!(got.get(), None);

        assert!(rt.resume(id, false));
        assert_eq!(got.get(), Some(false));
        assert!(!rt.exists(id));
        assert!(!rt.resume(id, true));
    }

    #[test]
    fn test_task_without_suspension_finishes_immediately() {
        let (_lp, rt) = runtime();
        let id = rt.spawn(async {});
        assert!(!rt.exists(id));
        assert!(rt.is_empty());
    }

    #[test]
    fn test_sleep_is_driven_by_loop_timer() {
        let (lp, rt) = runtime();
        let woke_at = Rc::new(Cell::new(None));

        let inner = rt.clone();
        let slot = woke_at.clone();
        let stop = lp.stop_handle();
        let started = Instant::now();
        rt.spawn(async move {
            inner.sleep(Duration::from_millis(20)).await;
            slot.set(Some(started.elapsed()));
            stop.stop();
        });
        assert_eq!(lp.timer_count(), 1);

        lp.run().unwrap();
        assert!(woke_at.get().unwrap() >= Duration::from_millis(20));
        assert!(rt.is_empty());
    }

    #[test]
    fn test_exec_collects_output_through_loop() {
        let (lp, rt) = runtime();
        let result = Rc::new(RefCell::new(None));

        let inner = rt.clone();
        let slot = result.clone();
        let stop = lp.stop_handle();
        let id = rt.spawn(async move {
            let outcome = inner.exec("echo hi; echo oops >&2; exit 3").await;
            *slot.borrow_mut() = outcome.ok();
            stop.stop();
        });
        // parked on the pipes, not blocked in the spawn
        assert!(rt.exists(id));
        assert!(result.borrow().is_none());

        lp.run().unwrap();
        let result = result.borrow_mut().take().unwrap();
        assert_eq!(
            result,
            ExecutionResult {
                code: 3,
                stdout: "hi\n".into(),
                stderr: "oops\n".into(),
            }
        );
        assert!(rt.is_empty());
    }

    #[test]
    fn test_exec_large_output_does_not_stall() {
        let (lp, rt) = runtime();
        let result = Rc::new(RefCell::new(None));

        let inner = rt.clone();
        let slot = result.clone();
        let stop = lp.stop_handle();
        rt.spawn(async move {
            // more than a pipe holds, on the stream read second
            let outcome = inner.exec("head -c 200000 /dev/zero >&2; echo done").await;
            *slot.borrow_mut() = outcome.ok();
            stop.stop();
        });
        lp.run().unwrap();
        let result = result.borrow_mut().take().unwrap();
        assert_eq!(result.stderr.len(), 200000);
        assert_eq!(result.stdout, "done\n");
        assert_eq!(result.code, 0);
    }

    #[test]
    fn test_current_is_scoped_to_poll() {
        let (_lp, rt) = runtime();
        let seen = Rc::new(Cell::new(None));
        let inner = rt.clone();
        let slot = seen.clone();
        let id = rt.spawn(async move {
            slot.set(inner.current());
        });
        assert_eq!(seen.get(), Some(id));
        assert_eq!(rt.current(), None);
    }
}
