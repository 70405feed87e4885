//! Minimal daemon serving `echo` (1), exercised by an in-process client.
//!
//! Run with:
//!   cargo run --example echo-daemon --features peer
//!
//! Or against the CLI:
//!   cargo run --features cli -- serve /tmp/courier-echo.sock
//!   cargo run --features cli -- call /tmp/courier-echo.sock --op 1 --data hi

use std::fs;
use std::time::Duration;

use courier::{Bytes, CallContext, HandlerResult, Server, Session};

const ECHO: u32 = 1;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("courier-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let mut server = Server::listen(&sock_path)?;
    server.register_named(ECHO, "echo", |ctx: &CallContext, body: Bytes| -> HandlerResult {
        eprintln!(
            "connection {} call {}: {} bytes",
            ctx.connection_id,
            ctx.call_id,
            body.len()
        );
        Ok(body)
    })?;
    let handle = server.handle();
    let daemon = std::thread::spawn(move || server.serve());
    eprintln!("Listening on {}", sock_path.display());

    let session = Session::connect(&sock_path)?;
    for word in ["alpha", "beta", "gamma"] {
        let reply = session.call(ECHO, word.as_bytes().to_vec(), Duration::from_secs(1))?;
        eprintln!("reply: {}", String::from_utf8_lossy(&reply));
    }
    drop(session);

    handle.shutdown();
    if let Ok(result) = daemon.join() {
        result?;
    }
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
