use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinlink_frame::{Message, IDENTITY_ASSIGNMENT, PEER_BIND};
use twinlink_transport::{ChannelKind, Inbound, ReliableChannel, TransportError, UnreliableChannel};

use crate::dispatcher::Dispatcher;
use crate::error::{PeerError, Result};
use crate::handshake::{ClientHandshake, HandshakeConfig};
use crate::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};

/// Fixed pause between failed dial attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Where and how a [`Client`] connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Host name or IP literal of the server.
    pub server_host: String,
    pub tcp_port: u16,
    /// Server datagram port. The datagram host is always the reliable peer's IP.
    pub udp_port: u16,
    pub reconnect_delay: Duration,
    /// Upper bound on the dial loop. `None` retries forever.
    pub connect_timeout: Option<Duration>,
    pub handshake: HandshakeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: Ipv4Addr::LOCALHOST.to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: None,
            handshake: HandshakeConfig::default(),
        }
    }
}

/// One connection to a server over both channels.
///
/// The identity and binding handlers are installed on the dispatcher passed
/// to [`Client::connect`], so a dispatcher serves at most one client.
///
/// Dropping a client tears down both channels and the bind loop, just like
/// [`close`](Self::close) without waiting for the stream shutdown.
pub struct Client {
    reliable: Arc<ReliableChannel>,
    unreliable: Arc<UnreliableChannel>,
    handshake: Arc<ClientHandshake>,
    dispatcher: Arc<Dispatcher>,
    bind_timeout: Option<Duration>,
    bind_abandoned: CancellationToken,
    closed: CancellationToken,
}

impl Client {
    /// Dial the server, retrying with a fixed delay, and start both channels.
    pub async fn connect(config: ClientConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let stream = dial(&config).await?;
        Self::from_stream(stream, config, dispatcher).await
    }

    /// Start both channels over an already-connected stream.
    pub async fn from_stream(
        stream: TcpStream,
        config: ClientConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let (reliable, disconnected) = ReliableChannel::new(stream)?;
        let server_ip = unmap(reliable.remote_addr().ip());
        let udp_peer = SocketAddr::new(server_ip, config.udp_port);
        let udp_local = SocketAddr::new(unspecified_like(server_ip), 0);
        let unreliable = UnreliableChannel::bind_to_peer(udp_local, udp_peer).await?;

        let client = Self {
            reliable,
            unreliable,
            handshake: Arc::new(ClientHandshake::new()),
            dispatcher,
            bind_timeout: config.handshake.bind_timeout,
            bind_abandoned: CancellationToken::new(),
            closed: CancellationToken::new(),
        };
        client.install_handlers(config.handshake)?;

        let inbound: Arc<dyn Inbound> = Arc::clone(&client.dispatcher) as Arc<dyn Inbound>;
        client.reliable.start_receiving(Arc::clone(&inbound));
        client.unreliable.start_receiving(inbound);

        let closed = client.closed.clone();
        let unreliable = Arc::clone(&client.unreliable);
        tokio::spawn(async move {
            let server = disconnected.wait().await;
            info!(%server, "disconnected from server");
            closed.cancel();
            unreliable.close();
        });

        info!(server = %client.reliable.remote_addr(), %udp_peer, "connected to server");
        Ok(client)
    }

    fn install_handlers(&self, handshake_config: HandshakeConfig) -> Result<()> {
        let handshake = Arc::clone(&self.handshake);
        let unreliable = Arc::clone(&self.unreliable);
        let closed = self.closed.clone();
        let abandoned = self.bind_abandoned.clone();
        self.dispatcher
            .register(IDENTITY_ASSIGNMENT, move |message, origin| {
                let Message::IdentityAssignment(identity) = message else {
                    return;
                };
                if origin.channel != ChannelKind::Reliable {
                    debug!(%origin, identity, "ignoring identity assignment on unreliable channel");
                    return;
                }
                if !handshake.on_identity_assignment(identity) {
                    return;
                }
                info!(identity, "received identity");

                let handshake = Arc::clone(&handshake);
                let unreliable = Arc::clone(&unreliable);
                let closed = closed.clone();
                let abandoned = abandoned.clone();
                let config = handshake_config.clone();
                tokio::spawn(async move {
                    match handshake
                        .run_bind_loop(identity, &unreliable, &config, &closed)
                        .await
                    {
                        Ok(()) => {}
                        Err(PeerError::Cancelled) => debug!(identity, "bind loop cancelled"),
                        Err(err) => {
                            warn!(identity, error = %err, "unreliable binding abandoned");
                            abandoned.cancel();
                        }
                    }
                });
            })?;

        let handshake = Arc::clone(&self.handshake);
        self.dispatcher.register(PEER_BIND, move |message, origin| {
            let Message::PeerBind(bind) = message else {
                return;
            };
            if origin.channel != ChannelKind::Reliable {
                debug!(%origin, identity = bind.identity, "ignoring bind message on unreliable channel");
                return;
            }
            if handshake.on_bind_ack(bind) {
                info!(identity = bind.identity, "unreliable channel established");
            }
        })?;
        Ok(())
    }

    /// The server-assigned identity, once received.
    pub fn identity(&self) -> Option<u32> {
        self.handshake.identity()
    }

    pub fn is_bound(&self) -> bool {
        self.handshake.is_bound()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.reliable.remote_addr()
    }

    pub fn local_udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.unreliable.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Wait for the identity assignment. Fails with `Cancelled` if the
    /// connection closes first.
    pub async fn wait_identity(&self) -> Result<u32> {
        tokio::select! {
            identity = self.handshake.wait_identity() => identity,
            _ = self.closed.cancelled() => Err(PeerError::Cancelled),
        }
    }

    /// Wait for the server to acknowledge the unreliable binding.
    ///
    /// Fails with `Cancelled` if the connection closes first and with
    /// `Timeout` if the configured bind timeout elapsed.
    pub async fn wait_bound(&self) -> Result<()> {
        if self.is_bound() {
            return Ok(());
        }
        tokio::select! {
            bound = self.handshake.wait_bound() => bound,
            _ = self.closed.cancelled() => Err(PeerError::Cancelled),
            _ = self.bind_abandoned.cancelled() => {
                Err(PeerError::Timeout(self.bind_timeout.unwrap_or_default()))
            }
        }
    }

    pub async fn send_reliable(&self, message: &Message) -> Result<()> {
        self.reliable.send(message).await?;
        Ok(())
    }

    /// Send one datagram to the server. Delivery is not guaranteed, and
    /// the server drops it if binding has not completed.
    pub async fn send_unreliable(&self, message: &Message) -> Result<()> {
        self.unreliable.send(message, None).await?;
        Ok(())
    }

    /// Resolve once the reliable connection is gone.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close both channels. Idempotent.
    pub async fn close(&self) {
        self.closed.cancel();
        self.unreliable.close();
        self.reliable.dispose().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.closed.cancel();
        self.unreliable.close();
        self.reliable.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.reliable.remote_addr())
            .field("identity", &self.identity())
            .field("bound", &self.is_bound())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dial until a reliable connection succeeds, pausing `reconnect_delay`
/// between attempts.
async fn dial(config: &ClientConfig) -> Result<TcpStream> {
    let attempts = async {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match TcpStream::connect((config.server_host.as_str(), config.tcp_port)).await {
                Ok(stream) => return stream,
                Err(err) => {
                    let err = TransportError::Connect {
                        addr: format!("{}:{}", config.server_host, config.tcp_port),
                        source: err,
                    };
                    warn!(attempt, error = %err, delay = ?config.reconnect_delay, "connect failed; retrying");
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        }
    };

    match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempts)
            .await
            .map_err(|_| PeerError::Timeout(limit)),
        None => Ok(attempts.await),
    }
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
