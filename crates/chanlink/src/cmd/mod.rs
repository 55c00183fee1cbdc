use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chanlink::peer::{
    Connection, ConnectionState, ContextConfig, IoThread, NetworkContext, PeerError, UdsTransport,
};
use chanlink::transport::Transport;
use clap::{Args, Subcommand};

use crate::exit::{peer_error, CliError, CliResult, FAILURE, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod info;
pub mod listen;
pub mod send;
pub mod version;

/// Pause between ticks of a command's main loop.
const TICK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and echo chat messages to every connected peer.
    Echo(EchoArgs),
    /// Send one chat message.
    Send(SendArgs),
    /// Accept connections and print received chat messages.
    Listen(ListenArgs),
    /// Connect and list the channels the remote end announces.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

/// Settings shared by every networked command.
#[derive(Debug, Clone)]
pub struct Settings {
    pub activation_timeout: Duration,
    pub max_connections: Option<usize>,
}

impl Settings {
    pub fn context_config(&self) -> ContextConfig {
        let config = ContextConfig::default().with_activation_timeout(self.activation_timeout);
        match self.max_connections {
            Some(max) => config.with_max_connections(max),
            None => config,
        }
    }
}

pub fn run(command: Command, format: OutputFormat, settings: &Settings) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, settings),
        Command::Send(args) => send::run(args, format, settings),
        Command::Listen(args) => listen::run(args, format, settings),
        Command::Info(args) => info::run(args, format, settings),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Socket path to bind.
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Chat message text.
    #[arg(long, short = 'm')]
    pub message: String,
    /// Wait for one chat message in reply and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// How long to collect channel announcements after the connection activates.
    #[arg(long, default_value = "200ms")]
    pub settle: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// A context over Unix sockets with its I/O thread running.
///
/// Drop the connections a command holds before the session, so their
/// disconnects still reach the socket.
pub struct Session {
    io: Option<IoThread>,
    context: NetworkContext,
}

impl Session {
    pub fn start(settings: &Settings) -> CliResult<Self> {
        Self::over(UdsTransport::new(), settings)
    }

    pub fn over(transport: impl Transport + 'static, settings: &Settings) -> CliResult<Self> {
        let context = NetworkContext::new(transport, settings.context_config());
        let io = context
            .spawn_io_thread()
            .map_err(|err| peer_error("io thread failed to start", err))?;
        Ok(Self {
            io: Some(io),
            context,
        })
    }

    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    /// Run one tick, then sleep briefly.
    pub fn tick(&self) {
        self.context.update();
        std::thread::sleep(TICK_INTERVAL);
    }

    /// Tick until `connection` leaves Pending.
    pub fn wait_for_activation(&self, connection: &Connection) -> CliResult<()> {
        loop {
            self.tick();
            match connection.state() {
                ConnectionState::Active => return Ok(()),
                ConnectionState::Pending => {}
                ConnectionState::TimedOut => {
                    let timeout = self.context.config().activation_timeout;
                    return Err(peer_error(
                        "connect failed",
                        PeerError::ActivationTimeout(timeout),
                    ));
                }
                ConnectionState::Closing => {
                    return Err(CliError::new(
                        FAILURE,
                        "connect failed: connection closed before activation",
                    ))
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            io.stop();
        }
    }
}

pub fn socket_address(path: &Path) -> CliResult<&str> {
    path.to_str().ok_or_else(|| {
        CliError::new(
            USAGE,
            format!("socket path is not valid UTF-8: {}", path.display()),
        )
    })
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
