//! Raw TCP echo server.
//!
//! ```text
//! cargo run --example echo_server
//! nc 127.0.0.1 8080
//! ```

use mill_net::{error::Result, prelude::*};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mill_net=info".parse().unwrap()))
        .init();

    let server = Server::new("tcp://127.0.0.1:8080", ServerConfig::default())?;

    server.on(
        "connect",
        Callback::connection(|conn| {
            println!("client {} connected from {}", conn.id(), conn.remote_address());
            Ok(())
        }),
    )?;
    server.on(
        "receive",
        Callback::data(|conn, data| {
            println!(
                "Received {} bytes from {}: {:?}",
                data.len(),
                conn.id(),
                String::from_utf8_lossy(data)
            );
            conn.send(data);
            Ok(())
        }),
    )?;
    server.on(
        "close",
        Callback::connection(|conn| {
            println!(
                "client {} disconnected ({} bytes in, {} bytes out)",
                conn.id(),
                conn.bytes_read(),
                conn.bytes_written()
            );
            Ok(())
        }),
    )?;

    println!("Echo server listening on 127.0.0.1:8080");
    server.start()
}
