//! WebSocket chat room: every message is broadcast to all open sockets.
//!
//! ```text
//! cargo run --example websocket_server
//! websocat ws://127.0.0.1:8081/
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use mill_net::{error::Result, prelude::*};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mill_net=info".parse().unwrap()))
        .init();

    let server = Server::new("ws://127.0.0.1:8081", ServerConfig::default())?;
    let room: Rc<RefCell<BTreeMap<ConnectionId, Weak<Connection>>>> = Rc::default();

    let members = room.clone();
    server.on(
        "open",
        Callback::request(move |conn, req| {
            println!("{} joined on {}", conn.id(), req.path());
            members.borrow_mut().insert(conn.id(), Rc::downgrade(conn));
            conn.push(format!("welcome, you are {}", conn.id()));
            Ok(())
        }),
    )?;

    let members = room.clone();
    server.on(
        "message",
        Callback::frame(move |conn, frame| {
            let text = match frame.as_text() {
                Some(text) if frame.opcode() == Opcode::Text => text,
                _ => return Ok(()),
            };
            let line = format!("{}: {}", conn.id(), text);
            let peers: Vec<Rc<Connection>> =
                members.borrow().values().filter_map(Weak::upgrade).collect();
            for peer in peers {
                peer.push(line.as_str());
            }
            Ok(())
        }),
    )?;

    let members = room;
    server.on(
        "close",
        Callback::connection(move |conn| {
            if members.borrow_mut().remove(&conn.id()).is_some() {
                println!("{} left", conn.id());
            }
            Ok(())
        }),
    )?;

    println!("WebSocket server listening on ws://127.0.0.1:8081");
    server.start()
}
