//! A minimal HTTP daemon: answers every request with a text page that
//! echoes the method and URL.
//!
//! Run with:
//!
//! ```not_rust
//! cargo run --example http_hello
//! ```
//!
//! then poke it with `curl -v http://127.0.0.1:8964/anything`.

use evio::http::{HttpConfig, HttpServer};
use evio::{AioEngine, EngineConfig, WriteBuf};

fn main() -> Result<(), evio::Error> {
    env_logger::init();

    let engine = AioEngine::new(EngineConfig::default());
    engine.start(4)?;

    let server = HttpServer::start_serving(&engine, HttpConfig::new(8964), |session| {
        let body = format!("you sent {:?} {}\n", session.method(), session.url());
        let head = format!(
            "200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        if let Err(err) = session.respond(&head, WriteBuf::Owned(body.into_bytes())) {
            log::warn!("could not respond: {}", err);
        }
    })?;

    println!("serving on port {}, ctrl-c to quit", server.port());
    std::thread::park();

    server.shutdown();
    engine.shutdown();
    Ok(())
}
