/// Unique identifier for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Log levels for network events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for network events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Logger forwarding to the `tracing` macros.
///
/// Nothing is printed unless the application installs a subscriber, e.g.
/// `tracing_subscriber::fmt().with_env_filter("mill_net=debug").init()`.
#[derive(Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "mill_net", "{}", message),
            LogLevel::Info => tracing::info!(target: "mill_net", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "mill_net", "{}", message),
            LogLevel::Error => tracing::error!(target: "mill_net", "{}", message),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{LogLevel, Logger};
    use std::sync::Mutex;

    /// Captures log lines so tests can assert on them.
    #[derive(Default)]
    pub struct MemoryLogger {
        pub lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl MemoryLogger {
        pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .any(|(l, m)| *l == level && m.contains(needle))
        }
    }

    impl Logger for MemoryLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }
}
