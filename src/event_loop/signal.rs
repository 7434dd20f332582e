//! Signal delivery through a self-pipe.
//!
//! The installed handler only writes the signal number into a non-blocking
//! pipe; the owning loop watches the read end like any other descriptor and
//! runs the user callbacks from its own thread. Only one loop per process can
//! own the signal pipe at a time.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signal: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signal as u8;
        // write(2) is async-signal-safe; a full pipe just drops the byte
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Creates a pipe with both ends non-blocking and close-on-exec.
pub(crate) fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) just handed us two fresh descriptors we exclusively own
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((read, write))
}

/// Reads everything currently buffered in a non-blocking descriptor.
pub(crate) fn drain_fd(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

pub(crate) struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
    installed: Vec<libc::c_int>,
}

impl SignalPipe {
    pub(crate) fn open() -> io::Result<Self> {
        let (read, write) = nonblocking_pipe()?;
        let raw = write.as_raw_fd();
        if SIGNAL_PIPE_WRITE
            .compare_exchange(-1, raw, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "another event loop already owns signal delivery",
            ));
        }
        Ok(Self {
            read,
            write,
            installed: Vec::new(),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub(crate) fn install(&mut self, signal: libc::c_int) -> io::Result<()> {
        set_handler(signal, forward_signal as usize)?;
        if !self.installed.contains(&signal) {
            self.installed.push(signal);
        }
        Ok(())
    }

    pub(crate) fn restore(&mut self, signal: libc::c_int) -> io::Result<()> {
        self.installed.retain(|s| *s != signal);
        set_handler(signal, libc::SIG_DFL)
    }

    /// Signal numbers received since the last drain, in arrival order.
    pub(crate) fn drain(&self) -> Vec<libc::c_int> {
        drain_fd(self.read_fd())
            .into_iter()
            .map(libc::c_int::from)
            .collect()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for signal in std::mem::take(&mut self.installed) {
            let _ = set_handler(signal, libc::SIG_DFL);
        }
        let _ = SIGNAL_PIPE_WRITE.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

pub(crate) fn set_handler(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip() {
        let (read, write) = nonblocking_pipe().unwrap();
        let payload = [1u8, 2, 3];
        let n = unsafe {
            libc::write(
                write.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n, 3);
        assert_eq!(drain_fd(read.as_raw_fd()), payload);
        // empty and non-blocking
        assert!(drain_fd(read.as_raw_fd()).is_empty());
    }
}
