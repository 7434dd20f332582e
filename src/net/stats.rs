use std::cell::Cell;

/// Failure counters for one server, read by monitoring code.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    accepted: Cell<u64>,
    destroyed: Cell<u64>,
    send_failures: Cell<u64>,
    read_failures: Cell<u64>,
}

/// Copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub destroyed: u64,
    pub send_failures: u64,
    pub read_failures: u64,
}

fn bump(counter: &Cell<u64>) {
    counter.set(counter.get().wrapping_add(1));
}

impl ConnectionStats {
    pub fn record_accept(&self) {
        bump(&self.accepted);
    }

    pub fn record_destroy(&self) {
        bump(&self.destroyed);
    }

    pub fn record_send_failure(&self) {
        bump(&self.send_failures);
    }

    pub fn record_read_failure(&self) {
        bump(&self.read_failures);
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.get()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.get(),
            destroyed: self.destroyed.get(),
            send_failures: self.send_failures.get(),
            read_failures: self.read_failures.get(),
        }
    }
}
