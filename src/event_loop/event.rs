use mio::event::Event;
use std::fmt;
use std::os::fd::RawFd;

/// Backend-neutral readiness report for one descriptor.
///
/// Both backends translate their native notifications into this shape before
/// dispatch, so error and hang-up conditions are folded in the same way: a
/// peer hang-up wakes the read side (the read then observes EOF) and an error
/// wakes both sides.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    fd: RawFd,
    is_readable: bool,
    is_writable: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("fd", &self.fd)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .finish()
    }
}

impl Readiness {
    pub fn new(fd: RawFd, is_readable: bool, is_writable: bool) -> Self {
        Self {
            fd,
            is_readable,
            is_writable,
        }
    }

    /// Translates `poll(2)` result bits.
    pub fn from_revents(fd: RawFd, revents: libc::c_short) -> Self {
        let failed = revents & (libc::POLLERR | libc::POLLNVAL) != 0;
        Self {
            fd,
            is_readable: failed || revents & (libc::POLLIN | libc::POLLHUP) != 0,
            is_writable: failed || revents & libc::POLLOUT != 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        let failed = event.is_error();
        Self {
            fd: event.token().0 as RawFd,
            is_readable: failed || event.is_readable() || event.is_read_closed(),
            is_writable: failed || event.is_writable() || event.is_write_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revents_translation() {
        let r = Readiness::from_revents(7, libc::POLLIN);
        assert!(r.is_readable() && !r.is_writable());

        let r = Readiness::from_revents(7, libc::POLLHUP);
        assert!(r.is_readable() && !r.is_writable());

        let r = Readiness::from_revents(7, libc::POLLERR);
        assert!(r.is_readable() && r.is_writable());
        assert_eq!(r.fd(), 7);
    }
}
