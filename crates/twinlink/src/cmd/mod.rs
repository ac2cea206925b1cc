use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use tokio::sync::mpsc;
use twinlink_frame::{Message, TEXT};
use twinlink_peer::Dispatcher;

use crate::exit::{peer_error, CliError, CliResult, USAGE};
use crate::output::{OutputFormat, ReceivedText};

pub mod connect;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server and print received text messages.
    Serve(ServeArgs),
    /// Connect to a server, complete the handshake, and send text messages.
    Connect(ConnectArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Connect(args) => connect::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Reliable (TCP) listen address.
    #[arg(long, env = "TWINLINK_TCP_ADDR", default_value = "0.0.0.0:42131")]
    pub tcp_addr: SocketAddr,
    /// Unreliable (UDP) listen address.
    #[arg(long, env = "TWINLINK_UDP_ADDR", default_value = "0.0.0.0:42132")]
    pub udp_addr: SocketAddr,
    /// Exit after printing N text messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Server host name or IP address.
    #[arg(long, env = "TWINLINK_HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// Server reliable (TCP) port.
    #[arg(long, env = "TWINLINK_TCP_PORT", default_value_t = twinlink_peer::DEFAULT_TCP_PORT)]
    pub tcp_port: u16,
    /// Server unreliable (UDP) port.
    #[arg(long, env = "TWINLINK_UDP_PORT", default_value_t = twinlink_peer::DEFAULT_UDP_PORT)]
    pub udp_port: u16,
    /// Text message to send once bound. Repeatable.
    #[arg(long = "text", value_name = "TEXT")]
    pub texts: Vec<String>,
    /// Send text messages over the unreliable channel.
    #[arg(long)]
    pub unreliable: bool,
    /// Give up binding the unreliable channel after this long (e.g. 5s, 500ms).
    #[arg(long, env = "TWINLINK_BIND_TIMEOUT")]
    pub bind_timeout: Option<String>,
    /// Give up dialing the server after this long (e.g. 10s).
    #[arg(long, env = "TWINLINK_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<String>,
    /// Pause between dial attempts.
    #[arg(long, env = "TWINLINK_RECONNECT_DELAY", default_value = "2s")]
    pub reconnect_delay: String,
    /// Keep running and print text messages from the server until Ctrl-C.
    #[arg(long)]
    pub listen: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) type TextInbox = mpsc::UnboundedReceiver<ReceivedText>;

/// Dispatcher whose Text handler forwards into a channel instead of logging,
/// so printing happens off the receive loops.
pub(crate) fn text_dispatcher() -> CliResult<(Arc<Dispatcher>, TextInbox)> {
    let dispatcher = Arc::new(Dispatcher::empty());
    let (tx, rx) = mpsc::unbounded_channel();
    dispatcher
        .register(TEXT, move |message, origin| {
            if let Message::Text(text) = message {
                let _ = tx.send(ReceivedText { text, origin });
            }
        })
        .map_err(|err| peer_error("handler registration failed", err))?;
    Ok((dispatcher, rx))
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
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

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
