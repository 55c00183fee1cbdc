mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::{parse_duration, Command, Settings};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "chanlink", version, about = "Typed channel connections over Unix sockets")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// How long an outgoing connection may wait for the peer (e.g. 5s, 500ms).
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "5s",
        env = "CHANLINK_ACTIVATION_TIMEOUT",
        global = true
    )]
    activation_timeout: String,

    /// Maximum number of live connections.
    #[arg(long, value_name = "N", env = "CHANLINK_MAX_CONNECTIONS", global = true)]
    max_connections: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = parse_duration(&cli.activation_timeout).and_then(|activation_timeout| {
        let settings = Settings {
            activation_timeout,
            max_connections: cli.max_connections,
        };
        cmd::run(cli.command, format, &settings)
    });

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
