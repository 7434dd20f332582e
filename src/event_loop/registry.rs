use std::collections::HashMap;
use std::os::fd::RawFd;

use super::IoCallback;

/// Callbacks watching one descriptor. At most one per direction: registering
/// again replaces the previous callback.
#[derive(Default, Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) read: Option<IoCallback>,
    pub(crate) write: Option<IoCallback>,
}

impl HandlerEntry {
    pub(crate) fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    pub(crate) fn wants_read(&self) -> bool {
        self.read.is_some()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.write.is_some()
    }
}

#[derive(Default)]
pub(crate) struct IoRegistry {
    entries: HashMap<RawFd, HandlerEntry>,
}

impl IoRegistry {
    pub(crate) fn set_read(&mut self, fd: RawFd, callback: IoCallback) {
        self.entries.entry(fd).or_default().read = Some(callback);
    }

    pub(crate) fn set_write(&mut self, fd: RawFd, callback: IoCallback) {
        self.entries.entry(fd).or_default().write = Some(callback);
    }

    /// Returns whether a read callback was removed.
    pub(crate) fn clear_read(&mut self, fd: RawFd) -> bool {
        self.clear(fd, |entry| entry.read.take().is_some())
    }

    pub(crate) fn clear_write(&mut self, fd: RawFd) -> bool {
        self.clear(fd, |entry| entry.write.take().is_some())
    }

    fn clear(&mut self, fd: RawFd, take: impl FnOnce(&mut HandlerEntry) -> bool) -> bool {
        let Some(entry) = self.entries.get_mut(&fd) else {
            return false;
        };
        let removed = take(entry);
        if entry.is_empty() {
            self.entries.remove(&fd);
        }
        removed
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&HandlerEntry> {
        self.entries.get(&fd)
    }

    pub(crate) fn read_callback(&self, fd: RawFd) -> Option<IoCallback> {
        self.entries.get(&fd).and_then(|e| e.read.clone())
    }

    pub(crate) fn write_callback(&self, fd: RawFd) -> Option<IoCallback> {
        self.entries.get(&fd).and_then(|e| e.write.clone())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&RawFd, &HandlerEntry)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
