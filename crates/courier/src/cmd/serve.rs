use std::thread;
use std::time::Duration;

use bytes::Bytes;
use courier_peer::{CallContext, HandlerError, HandlerResult, Server, ServerConfig, ServerHandle};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{courier_error, CliError, CliResult, SUCCESS};

pub const ECHO: u32 = 1;
pub const REVERSE: u32 = 2;
pub const SLEEP: u32 = 3;

const MAX_SLEEP: Duration = Duration::from_secs(60);

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let drain_timeout = parse_duration(&args.drain_timeout)?;
    let config = ServerConfig {
        worker_threads: args.workers,
        drain_timeout,
        ..ServerConfig::default()
    };

    let mut server = Server::listen_with_config(&args.path, config)
        .map_err(|err| courier_error("listen failed", err))?;
    register_demo_operations(&mut server).map_err(|err| courier_error("register failed", err))?;
    install_ctrlc_handler(server.handle())?;

    tracing::info!(path = %args.path.display(), "serving echo=1 reverse=2 sleep=3");
    server
        .serve()
        .map_err(|err| courier_error("serve failed", err))?;
    Ok(SUCCESS)
}

fn register_demo_operations(server: &mut Server) -> courier_peer::Result<()> {
    server.register_named(ECHO, "echo", echo)?;
    server.register_named(REVERSE, "reverse", reverse)?;
    server.register_named(SLEEP, "sleep", sleep)?;
    Ok(())
}

fn echo(_: &CallContext, body: Bytes) -> HandlerResult {
    Ok(body)
}

fn reverse(_: &CallContext, body: Bytes) -> HandlerResult {
    let text = std::str::from_utf8(&body)
        .map_err(|err| HandlerError::malformed(format!("body is not utf-8: {err}")))?;
    Ok(Bytes::from(text.chars().rev().collect::<String>()))
}

/// Body is a JSON number of milliseconds; replies with the same body.
fn sleep(ctx: &CallContext, body: Bytes) -> HandlerResult {
    let millis: u64 = serde_json::from_slice(&body)?;
    let delay = Duration::from_millis(millis).min(MAX_SLEEP);
    tracing::debug!(call_id = ctx.call_id, ?delay, "sleeping");
    thread::sleep(delay);
    Ok(body)
}

fn install_ctrlc_handler(handle: ServerHandle) -> CliResult<()> {
    ctrlc::set_handler(move || handle.shutdown()).map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use courier_peer::ErrorCode;

    use super::*;

    fn ctx(operation_id: u32) -> CallContext {
        CallContext {
            connection_id: 1,
            call_id: 1,
            operation_id,
        }
    }

    #[test]
    fn reverse_handles_unicode() {
        let reply = reverse(&ctx(REVERSE), Bytes::from("héllo")).unwrap();
        assert_eq!(reply, Bytes::from("olléh"));
    }

    #[test]
    fn reverse_rejects_binary() {
        let err = reverse(&ctx(REVERSE), Bytes::from_static(&[0xff, 0xfe])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);
    }

    #[test]
    fn sleep_requires_a_number() {
        let err = sleep(&ctx(SLEEP), Bytes::from_static(b"soon")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);
        assert_eq!(sleep(&ctx(SLEEP), Bytes::from_static(b"1")).unwrap(), Bytes::from_static(b"1"));
    }
}
