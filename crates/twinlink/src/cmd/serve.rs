use tracing::{info, warn};
use twinlink_peer::{Server, ServerConfig};

use crate::cmd::{text_dispatcher, ServeArgs};
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_listening, print_text, OutputFormat};

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let (dispatcher, mut texts) = text_dispatcher()?;
    let config = ServerConfig {
        tcp_addr: args.tcp_addr,
        udp_addr: args.udp_addr,
    };
    let server = Server::bind(config, dispatcher)
        .await
        .map_err(|err| peer_error("bind failed", err))?;
    let mut accept_loop = server.spawn();
    print_listening(server.local_tcp_addr(), server.local_udp_addr(), format);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0usize;
    let outcome = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(err) = signal {
                    warn!(error = %err, "signal handler failed");
                }
                info!("interrupted; shutting down");
                break Ok(SUCCESS);
            }
            received = texts.recv() => {
                let Some(received) = received else {
                    break Ok(SUCCESS);
                };
                print_text(&received, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break Ok(SUCCESS);
                }
            }
            joined = &mut accept_loop => {
                break match joined {
                    Ok(Ok(())) => Ok(SUCCESS),
                    Ok(Err(err)) => Err(peer_error("accept loop failed", err)),
                    Err(err) => Err(CliError::new(INTERNAL, format!("accept loop panicked: {err}"))),
                };
            }
        }
    };

    server.shutdown().await;
    outcome
}
