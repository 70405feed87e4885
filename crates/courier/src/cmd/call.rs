use std::fs;
use std::time::Instant;

use courier_peer::{ReconnectPolicy, Session, SessionConfig};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{courier_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let body = resolve_body(&args)?;

    let config = SessionConfig {
        default_timeout: timeout,
        reconnect: ReconnectPolicy::disabled(),
        ..SessionConfig::default()
    };
    let session = Session::connect_with_config(&args.path, config)
        .map_err(|err| courier_error("connect failed", err))?;

    let started = Instant::now();
    let reply = session
        .call(args.op, body, timeout)
        .map_err(|err| courier_error("call failed", err))?;
    print_reply(
        &args.path.display().to_string(),
        args.op,
        started.elapsed(),
        &reply,
        format,
    );
    Ok(SUCCESS)
}

fn resolve_body(args: &CallArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
