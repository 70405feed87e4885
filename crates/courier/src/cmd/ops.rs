use courier_peer::{ReconnectPolicy, Session, SessionConfig};

use crate::cmd::{parse_duration, OpsArgs};
use crate::exit::{courier_error, CliResult, SUCCESS};
use crate::output::{print_operations, OutputFormat};

pub fn run(args: OpsArgs, format: OutputFormat) -> CliResult<i32> {
    let config = SessionConfig {
        default_timeout: parse_duration(&args.timeout)?,
        reconnect: ReconnectPolicy::disabled(),
        ..SessionConfig::default()
    };
    let session = Session::connect_with_config(&args.path, config)
        .map_err(|err| courier_error("connect failed", err))?;
    let operations = session
        .operations()
        .map_err(|err| courier_error("listing failed", err))?;

    print_operations(&args.path.display().to_string(), &operations, format);
    Ok(SUCCESS)
}
