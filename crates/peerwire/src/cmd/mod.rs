use std::time::Duration;

use clap::{Args, Subcommand};
use peerwire_transport::Endpoint;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the built-in `echo` and `ping` services.
    Serve(ServeArgs),
    /// Call a service on a running peer and print the result.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Call(args) => call::run(args, format).await,
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to listen on (tcp://host:port, unix:///path, host:port or /path).
    pub endpoint: Endpoint,
    /// Close connections that stay silent this long (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s", env = "PEERWIRE_READ_TIMEOUT")]
    pub read_timeout: String,
    /// Heartbeat interval on idle connections; 0 disables heartbeats.
    #[arg(long, default_value = "3s", env = "PEERWIRE_HEARTBEAT")]
    pub heartbeat: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint of the serving peer.
    pub endpoint: Endpoint,
    /// Service name to call.
    pub service: String,
    /// JSON arguments. Default: null.
    #[arg(long)]
    pub json: Option<String>,
    /// Give up after this long, dial included (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "PEERWIRE_CALL_TIMEOUT")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds. Zero is allowed only
/// when `allow_zero` is set.
pub(crate) fn parse_duration(input: &str, allow_zero: bool) -> CliResult<Duration> {
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

    if value == 0 && !allow_zero {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
