use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::event_loop::Backend;
use crate::net::traits::{Logger, TracingLogger};

pub const DEFAULT_MAX_SEND_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_PACKAGE_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 87380;
pub const DEFAULT_BACKLOG: i32 = 102400;
pub const DEFAULT_MAX_FORM_DATA_FILES: usize = 1024;

/// Server configuration.
///
/// Controls buffering limits, protocol parser switches, socket options and
/// which event-loop backend is used. Build one with
/// [`ServerConfig::builder()`], or deserialize it from any serde format using
/// kebab-case keys:
///
/// ```json
/// { "max-package-size": 65536, "event-loop": ["poll"], "merge-chunked-body": true }
/// ```
///
/// ## Backpressure
///
/// - max_send_buffer_size: queued outbound bytes per connection before sends fail
/// - max_package_size: largest single package a peer may frame
///
/// ## HTTP / WebSocket
///
/// - merge_chunked_body: accept `Transfer-Encoding: chunked` requests (off by default)
/// - auto_splice_frames: reassemble fragmented WebSocket messages
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub max_send_buffer_size: usize,
    pub max_package_size: usize,
    /// Bytes requested from the socket per read
    pub read_buffer_size: usize,
    /// SO_REUSEPORT on listening sockets
    pub reuse_port: bool,
    pub backlog: i32,
    /// Memoize parse results of small repeated messages
    pub enable_cache: bool,
    pub header_case_sensitive: bool,
    pub merge_chunked_body: bool,
    pub max_form_data_files: usize,
    /// Where multipart uploads are written; the system temp dir when unset
    pub upload_tmp_dir: Option<PathBuf>,
    pub auto_splice_frames: bool,
    /// Backend preference, first available wins
    pub event_loop: Vec<Backend>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Route SIGINT/SIGTERM to a graceful stop
    pub install_signal_handlers: bool,
    /// TCP_NODELAY on accepted sockets
    pub no_delay: bool,
    /// SO_KEEPALIVE on accepted sockets
    pub keep_alive: bool,
    #[serde(skip)]
    pub logger: Arc<dyn Logger>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Directory used for uploaded files.
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_tmp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_send_buffer_size: DEFAULT_MAX_SEND_BUFFER_SIZE,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reuse_port: false,
            backlog: DEFAULT_BACKLOG,
            enable_cache: true,
            header_case_sensitive: false,
            merge_chunked_body: false,
            max_form_data_files: DEFAULT_MAX_FORM_DATA_FILES,
            upload_tmp_dir: None,
            auto_splice_frames: true,
            event_loop: Backend::DEFAULT_PREFERENCE.to_vec(),
            tls_cert: None,
            tls_key: None,
            install_signal_handlers: true,
            no_delay: true,
            keep_alive: true,
            logger: Arc::new(TracingLogger),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_send_buffer_size", &self.max_send_buffer_size)
            .field("max_package_size", &self.max_package_size)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("reuse_port", &self.reuse_port)
            .field("backlog", &self.backlog)
            .field("enable_cache", &self.enable_cache)
            .field("header_case_sensitive", &self.header_case_sensitive)
            .field("merge_chunked_body", &self.merge_chunked_body)
            .field("max_form_data_files", &self.max_form_data_files)
            .field("upload_tmp_dir", &self.upload_tmp_dir)
            .field("auto_splice_frames", &self.auto_splice_frames)
            .field("event_loop", &self.event_loop)
            .field("tls_cert", &self.tls_cert)
            .field("tls_key", &self.tls_key)
            .field("install_signal_handlers", &self.install_signal_handlers)
            .field("no_delay", &self.no_delay)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

/// Builder for ServerConfig.
///
/// Every field is optional and falls back to `ServerConfig::default()`.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_send_buffer_size(mut self, size: usize) -> Self {
        self.config.max_send_buffer_size = size;
        self
    }

    pub fn max_package_size(mut self, size: usize) -> Self {
        self.config.max_package_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.config.reuse_port = enabled;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.config.enable_cache = enabled;
        self
    }

    pub fn header_case_sensitive(mut self, enabled: bool) -> Self {
        self.config.header_case_sensitive = enabled;
        self
    }

    pub fn merge_chunked_body(mut self, enabled: bool) -> Self {
        self.config.merge_chunked_body = enabled;
        self
    }

    pub fn max_form_data_files(mut self, max: usize) -> Self {
        self.config.max_form_data_files = max;
        self
    }

    pub fn upload_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_tmp_dir = Some(dir.into());
        self
    }

    pub fn auto_splice_frames(mut self, enabled: bool) -> Self {
        self.config.auto_splice_frames = enabled;
        self
    }

    /// Set the backend preference list
    pub fn event_loop(mut self, preference: impl Into<Vec<Backend>>) -> Self {
        self.config.event_loop = preference.into();
        self
    }

    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.tls_cert = Some(cert.into());
        self.config.tls_key = Some(key.into());
        self
    }

    pub fn install_signal_handlers(mut self, enabled: bool) -> Self {
        self.config.install_signal_handlers = enabled;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.config.keep_alive = enabled;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.config.logger = logger;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_send_buffer_size, 1048576);
        assert_eq!(config.max_package_size, 10485760);
        assert_eq!(config.read_buffer_size, 87380);
        assert!(!config.merge_chunked_body);
        assert!(config.enable_cache);
        assert_eq!(config.event_loop, vec![Backend::Mio, Backend::Poll]);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::builder()
            .max_package_size(4096)
            .event_loop([Backend::Poll])
            .merge_chunked_body(true)
            .build();
        assert_eq!(config.max_package_size, 4096);
        assert_eq!(config.event_loop, vec![Backend::Poll]);
        assert!(config.merge_chunked_body);
        assert_eq!(config.max_send_buffer_size, DEFAULT_MAX_SEND_BUFFER_SIZE);
    }

    #[test]
    fn test_deserialize_kebab_case_with_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{ "max-package-size": 65536, "event-loop": ["poll"], "upload-tmp-dir": "/var/tmp" }"#,
        )
        .unwrap();
        assert_eq!(config.max_package_size, 65536);
        assert_eq!(config.event_loop, vec![Backend::Poll]);
        assert_eq!(config.upload_dir(), PathBuf::from("/var/tmp"));
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
    }
}
