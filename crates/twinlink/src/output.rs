use std::io::IsTerminal;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use serde::Serialize;
use twinlink_transport::Origin;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// A Text message handed from a dispatcher handler to the printing loop.
#[derive(Debug, Clone)]
pub struct ReceivedText {
    pub text: String,
    pub origin: Origin,
}

#[derive(Serialize)]
struct TextOutput<'a> {
    event: &'static str,
    text: &'a str,
    from: String,
    channel: String,
    timestamp: String,
}

#[derive(Serialize)]
struct ListeningOutput {
    event: &'static str,
    tcp_addr: String,
    udp_addr: String,
}

#[derive(Serialize)]
struct ConnectedOutput {
    event: &'static str,
    server: String,
    identity: u32,
    bound: bool,
}

pub fn print_text(received: &ReceivedText, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = TextOutput {
                event: "text",
                text: &received.text,
                from: received.origin.addr.to_string(),
                channel: received.origin.channel.to_string(),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Pretty => {
            println!(
                "text from={} channel={} {}",
                received.origin.addr, received.origin.channel, received.text
            );
        }
    }
}

pub fn print_listening(tcp_addr: SocketAddr, udp_addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            event: "listening",
            tcp_addr: tcp_addr.to_string(),
            udp_addr: udp_addr.to_string(),
        }),
        OutputFormat::Pretty => println!("listening tcp={tcp_addr} udp={udp_addr}"),
    }
}

pub fn print_connected(server: SocketAddr, identity: u32, bound: bool, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ConnectedOutput {
            event: "connected",
            server: server.to_string(),
            identity,
            bound,
        }),
        OutputFormat::Pretty => {
            println!("connected server={server} identity={identity} bound={bound}")
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
