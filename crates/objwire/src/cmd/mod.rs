use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use objwire_protocol::ServeMode;
use objwire_transport::Endpoint;

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod counter;
pub mod ping;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo counter service.
    Serve(ServeArgs),
    /// Round-trip a message through a serving peer.
    Ping(PingArgs),
    /// Create a remote counter and add to it.
    Counter(CounterArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Ping(args) => ping::run(args, format),
        Command::Counter(args) => counter::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Serving mode: simple, threaded or library.
    #[arg(short = 'm', long, default_value = "simple", env = "OBJWIRE_MODE")]
    pub mode: ServeMode,
    /// Host to listen on.
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "OBJWIRE_HOST")]
    pub host: String,
    /// TCP port. Required in simple and threaded mode; library mode picks a
    /// free port when omitted.
    #[arg(short = 'p', long, env = "OBJWIRE_PORT")]
    pub port: Option<u16>,
    /// Listen on a Unix domain socket instead of TCP.
    #[arg(long, value_name = "PATH", conflicts_with = "port")]
    pub unix: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Endpoint to connect to (host:port, tcp://host:port or unix:path).
    pub endpoint: Endpoint,
    /// Message to echo.
    #[arg(long, default_value = "ping")]
    pub message: String,
    /// Number of round trips.
    #[arg(long, default_value = "1")]
    pub count: u32,
    /// Connect and call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct CounterArgs {
    /// Endpoint to connect to (host:port, tcp://host:port or unix:path).
    pub endpoint: Endpoint,
    /// Initial counter value.
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub start: i64,
    /// Amounts to add, in order (comma-separated or repeated).
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    pub add: Vec<i64>,
    /// Connect and call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
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
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
