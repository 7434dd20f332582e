mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{read_response, read_to_close, send, RunningServer};
use mill_net::prelude::*;
use mill_net::protocol::websocket::close_code;

const HANDSHAKE: &[u8] = b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";

#[derive(Default)]
struct Seen {
    opens: AtomicUsize,
    disconnects: AtomicUsize,
    messages: Mutex<Vec<(Opcode, Vec<u8>)>>,
}

/// A WebSocket server that echoes every message back as text.
fn chat_server() -> (RunningServer, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let shared = seen.clone();
    let server = RunningServer::start("ws://127.0.0.1:0", |b| b, move |server| {
        let on_open = shared.clone();
        server
            .on(
                "open",
                Callback::request(move |_, _| {
                    on_open.opens.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        let on_message = shared.clone();
        server
            .on(
                "message",
                Callback::frame(move |conn, frame| {
                    on_message
                        .messages
                        .lock()
                        .unwrap()
                        .push((frame.opcode(), frame.payload().to_vec()));
                    conn.push(Frame::text(format!("echo: {}", frame.as_text().unwrap_or(""))));
                    Ok(())
                }),
            )
            .unwrap();
        let on_disconnect = shared;
        server
            .on(
                "disconnect",
                Callback::frame(move |_, _| {
                    on_disconnect.disconnects.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
    });
    (server, seen)
}

fn upgraded(server: &RunningServer) -> TcpStream {
    let mut stream = server.connect();
    send(&mut stream, HANDSHAKE);
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", response);
    stream
}

fn client_frame(opcode: Opcode, fin: bool, payload: &[u8]) -> Vec<u8> {
    Frame::new(payload.to_vec(), opcode, true, fin).encode().to_vec()
}

fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some((frame, _)) = Frame::decode(&data).unwrap() {
            return frame;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before a full frame arrived");
        data.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn test_handshake_fires_open_once() {
    let (server, seen) = chat_server();
    let mut stream = server.connect();
    send(&mut stream, HANDSHAKE);

    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // the echo proves the handshake completed before the frame was read
    send(&mut stream, &client_frame(Opcode::Text, true, b"hi"));
    assert_eq!(read_frame(&mut stream).as_text(), Some("echo: hi"));
    assert_eq!(seen.opens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fragmented_text_is_one_message() {
    let (server, seen) = chat_server();
    let mut stream = upgraded(&server);

    let mut wire = client_frame(Opcode::Text, false, b"He");
    wire.extend(client_frame(Opcode::Continuation, true, b"llo"));
    send(&mut stream, &wire);

    let echo = read_frame(&mut stream);
    assert!(!echo.is_masked());
    assert_eq!(echo.as_text(), Some("echo: Hello"));
    let messages = seen.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], (Opcode::Text, b"Hello".to_vec()));
}

#[test]
fn test_close_is_echoed_then_connection_closes() {
    let (server, seen) = chat_server();
    let mut stream = upgraded(&server);

    let payload = close_code::NORMAL.to_be_bytes();
    send(&mut stream, &client_frame(Opcode::Close, true, &payload));

    let rest = read_to_close(&mut stream);
    let (echo, used) = Frame::decode(&rest).unwrap().unwrap();
    assert_eq!(echo.opcode(), Opcode::Close);
    assert_eq!(echo.close_code(), Some(close_code::NORMAL));
    assert_eq!(used, rest.len());
    assert_eq!(seen.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ping_without_callback_gets_pong() {
    let (server, _) = chat_server();
    let mut stream = upgraded(&server);

    send(&mut stream, &client_frame(Opcode::Ping, true, b"beat"));
    let pong = read_frame(&mut stream);
    assert_eq!(pong.opcode(), Opcode::Pong);
    assert_eq!(&pong.payload()[..], b"beat");
}
