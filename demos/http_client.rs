//! Fetches `/` from an HTTP server using the non-blocking client.
//!
//! ```text
//! cargo run --example http_server &
//! cargo run --example http_client -- 127.0.0.1:8080
//! ```

use std::time::Duration;

use mill_net::{error::Result, prelude::*};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mill_net=info".parse().unwrap()))
        .init();

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    // the server side is only used for its loop; nothing is bound
    let config = ServerConfig::builder().install_signal_handlers(false).build();
    let runtime = Server::new("tcp://127.0.0.1:0", config)?;
    let client = runtime.client(&format!("http://{}", target))?;

    let host = target.clone();
    client.on(
        "connect",
        Callback::connection(move |conn| {
            let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
            conn.send(request.as_bytes());
            Ok(())
        }),
    )?;

    let stop = runtime.stop_handle();
    client.on(
        "response",
        Callback::response(move |conn, response| {
            println!("{:?} {}", response.version(), response.status());
            for (name, value) in response.headers() {
                println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
            println!();
            println!("{}", String::from_utf8_lossy(response.body()));
            conn.close();
            stop.stop();
            Ok(())
        }),
    )?;

    let stop = runtime.stop_handle();
    client.on(
        "tcperror",
        Callback::tcp_error(move |_, kind, message| {
            eprintln!("connect failed ({}): {}", kind.code(), message);
            stop.stop();
            Ok(())
        }),
    )?;

    let stop = runtime.stop_handle();
    runtime.timer().add(Duration::from_secs(10), false, move || {
        eprintln!("no response after 10s, giving up");
        stop.stop();
        Ok(())
    })?;

    client.connect()?;
    runtime.event_loop().run()
}
