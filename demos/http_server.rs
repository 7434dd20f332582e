//! HTTP server with a few routes and a periodic request counter.
//!
//! ```text
//! cargo run --example http_server
//! curl http://127.0.0.1:8080/
//! curl -F upload=@Cargo.toml http://127.0.0.1:8080/upload
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Response, StatusCode};
use mill_net::{error::Result, prelude::*};
use tracing_subscriber::EnvFilter;

fn html(status: StatusCode, body: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::copy_from_slice(body.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html"),
    );
    response
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mill_net=info".parse().unwrap()))
        .init();

    let config = ServerConfig::builder()
        .max_package_size(16 * 1024 * 1024)
        .merge_chunked_body(true)
        .build();
    let server = Server::new("http://127.0.0.1:8080", config)?;

    let served = Rc::new(Cell::new(0u64));
    let counter = served.clone();
    server.on(
        "request",
        Callback::request(move |conn, req| {
            counter.set(counter.get() + 1);
            match req.path() {
                "/" => {
                    conn.end_response(&html(
                        StatusCode::OK,
                        "<h1>mill-net</h1><p>Try /hello?name=you or POST /upload</p>",
                    ));
                }
                "/hello" => {
                    let name = req.query("name").unwrap_or("world");
                    conn.end(&format!("hello, {}", name));
                }
                "/upload" => {
                    let files: Vec<String> = req
                        .uploaded_files()
                        .iter()
                        .map(|f| format!("{} ({} bytes)", f.client_filename(), f.size()))
                        .collect();
                    conn.end(&format!("received: {}", files.join(", ")));
                }
                _ => {
                    conn.end_response(&html(StatusCode::NOT_FOUND, "<h1>404 Not Found</h1>"));
                }
            }
            Ok(())
        }),
    )?;

    let reported = served.clone();
    server.timer().add(Duration::from_secs(10), true, move || {
        println!("requests served: {}", reported.get());
        Ok(())
    })?;

    println!("HTTP server listening on http://127.0.0.1:8080");
    server.start()
}
