//! Typed operations: one definition shared by daemon and client.
//!
//! Run with:
//!   cargo run --example typed-client --features peer

use std::fs;
use std::sync::Arc;

use courier::peer::SessionConfig;
use courier::{CallContext, HandlerError, Operation, Server, Session};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Resize {
    width: u32,
    height: u32,
    scale: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Resized {
    width: u32,
    height: u32,
}

struct ResizeOp;

impl Operation for ResizeOp {
    const ID: u32 = 100;
    const NAME: &'static str = "resize";
    type Request = Resize;
    type Response = Resized;
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("courier-typed-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("typed.sock");

    let mut server = Server::listen(&sock_path)?;
    server.register_operation::<ResizeOp, _>(|_: &CallContext, req: Resize| {
        if req.scale <= 0.0 {
            return Err(HandlerError::new("scale must be positive"));
        }
        Ok(Resized {
            width: (req.width as f32 * req.scale) as u32,
            height: (req.height as f32 * req.scale) as u32,
        })
    })?;
    let handle = server.handle();
    let daemon = std::thread::spawn(move || server.serve());

    let config = SessionConfig {
        validate_operations: true,
        ..SessionConfig::default()
    };
    let session = Arc::new(Session::connect_with_config(&sock_path, config)?);
    for op in session.operations()? {
        eprintln!("daemon serves {:#x} {}", op.id, op.name);
    }

    let workers: Vec<_> = (1..=4)
        .map(|i| {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                session.invoke::<ResizeOp>(&Resize {
                    width: 640,
                    height: 480,
                    scale: i as f32 * 0.5,
                })
            })
        })
        .collect();
    for worker in workers {
        match worker.join() {
            Ok(Ok(resized)) => eprintln!("resized to {}x{}", resized.width, resized.height),
            Ok(Err(err)) => eprintln!("call failed: {err}"),
            Err(_) => eprintln!("worker panicked"),
        }
    }

    match session.invoke::<ResizeOp>(&Resize { width: 1, height: 1, scale: 0.0 }) {
        Ok(_) => eprintln!("unexpected success"),
        Err(err) => eprintln!("expected failure: {err}"),
    }
    drop(session);

    handle.shutdown();
    if let Ok(result) = daemon.join() {
        result?;
    }
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
