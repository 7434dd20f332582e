//! A real server on `127.0.0.1:0`, running on its own thread.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mill_net::net::NoOpLogger;
use mill_net::prelude::*;

pub struct RunningServer {
    pub addr: SocketAddr,
    stop: StopHandle,
    handle: Option<thread::JoinHandle<()>>,
}

impl RunningServer {
    /// Builds the server on a fresh thread. `setup` registers callbacks
    /// before the port is bound.
    pub fn start<C, F>(uri: &'static str, configure: C, setup: F) -> Self
    where
        C: FnOnce(mill_net::net::config::ServerConfigBuilder) -> mill_net::net::config::ServerConfigBuilder
            + Send
            + 'static,
        F: FnOnce(&Server) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let builder = ServerConfig::builder()
                .install_signal_handlers(false)
                .logger(Arc::new(NoOpLogger));
            let server = Server::new(uri, configure(builder).build()).unwrap();
            setup(&server);
            server.bind().unwrap();
            tx.send((server.local_addr().unwrap(), server.stop_handle()))
                .unwrap();
            server.run().unwrap();
        });
        let (addr, stop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Reads `count` HTTP responses, using `Content-Length` to split them.
pub fn read_responses(stream: &mut TcpStream, count: usize) -> Vec<String> {
    let mut data = Vec::new();
    let mut responses = Vec::new();
    let mut chunk = [0u8; 4096];
    while responses.len() < count {
        if let Some(len) = complete_response_len(&data) {
            responses.push(String::from_utf8_lossy(&data[..len]).into_owned());
            data.drain(..len);
            continue;
        }
        let n = stream.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
    }
    assert!(data.is_empty(), "unexpected trailing bytes");
    responses
}

pub fn read_response(stream: &mut TcpStream) -> String {
    read_responses(stream, 1).pop().unwrap_or_default()
}

fn complete_response_len(data: &[u8]) -> Option<usize> {
    let end = find(data, b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
    let body_len = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let total = end + 4 + body_len;
    (data.len() >= total).then_some(total)
}

/// Reads until the peer closes the stream.
pub fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = stream.read_to_end(&mut data);
    data
}

pub fn send(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(data).unwrap();
    stream.flush().unwrap();
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
