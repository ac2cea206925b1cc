use tracing::{info, warn};
use twinlink_frame::Message;
use twinlink_peer::{Client, ClientConfig, HandshakeConfig};

use crate::cmd::{parse_duration, text_dispatcher, ConnectArgs, TextInbox};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_connected, print_text, OutputFormat};

pub async fn run(args: ConnectArgs, format: OutputFormat) -> CliResult<i32> {
    let bind_timeout = args.bind_timeout.as_deref().map(parse_duration).transpose()?;
    let connect_timeout = args
        .connect_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    let reconnect_delay = parse_duration(&args.reconnect_delay)?;

    let (dispatcher, mut texts) = text_dispatcher()?;
    let config = ClientConfig {
        server_host: args.host,
        tcp_port: args.tcp_port,
        udp_port: args.udp_port,
        reconnect_delay,
        connect_timeout,
        handshake: HandshakeConfig {
            bind_timeout,
            ..HandshakeConfig::default()
        },
    };

    let client = Client::connect(config, dispatcher)
        .await
        .map_err(|err| peer_error("connect failed", err))?;
    let result = session(
        &client,
        &args.texts,
        args.unreliable,
        args.listen,
        &mut texts,
        format,
    )
    .await;
    client.close().await;
    result
}

async fn session(
    client: &Client,
    texts: &[String],
    unreliable: bool,
    listen: bool,
    inbound: &mut TextInbox,
    format: OutputFormat,
) -> CliResult<i32> {
    let identity = client
        .wait_identity()
        .await
        .map_err(|err| peer_error("identity assignment failed", err))?;
    client
        .wait_bound()
        .await
        .map_err(|err| peer_error("unreliable binding failed", err))?;
    print_connected(client.server_addr(), identity, client.is_bound(), format);

    for text in texts {
        let message = Message::text(text.as_str());
        let sent = if unreliable {
            client.send_unreliable(&message).await
        } else {
            client.send_reliable(&message).await
        };
        sent.map_err(|err| peer_error("send failed", err))?;
    }
    if !texts.is_empty() {
        info!(count = texts.len(), unreliable, "sent text messages");
    }

    if !listen {
        return Ok(SUCCESS);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(err) = signal {
                    warn!(error = %err, "signal handler failed");
                }
                return Ok(SUCCESS);
            }
            _ = client.closed() => return Ok(SUCCESS),
            received = inbound.recv() => match received {
                Some(received) => print_text(&received, format),
                None => return Ok(SUCCESS),
            },
        }
    }
}
