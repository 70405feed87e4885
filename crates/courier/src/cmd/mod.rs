use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod ops;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a demo daemon (echo=1, reverse=2, sleep=3).
    Serve(ServeArgs),
    /// Issue one call and print the reply.
    Call(CallArgs),
    /// List the operations a daemon serves.
    Ops(OpsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Ops(args) => ops::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    #[arg(env = "COURIER_SOCKET")]
    pub path: PathBuf,
    /// Handler threads.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,
    /// How long shutdown waits for in-flight calls (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub drain_timeout: String,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("body").args(["data", "json", "file"])))]
pub struct CallArgs {
    /// Socket path to connect to.
    #[arg(env = "COURIER_SOCKET")]
    pub path: PathBuf,
    /// Operation id.
    #[arg(long)]
    pub op: u32,
    /// UTF-8 request body.
    #[arg(long)]
    pub data: Option<String>,
    /// JSON request body (validated before sending).
    #[arg(long)]
    pub json: Option<String>,
    /// Read the request body from a file.
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,
    /// Call timeout (e.g. 5s, 250ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct OpsArgs {
    /// Socket path to connect to.
    #[arg(env = "COURIER_SOCKET")]
    pub path: PathBuf,
    /// Timeout for the listing call.
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Include build and feature details.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }
}
