use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinlink_frame::{Message, PEER_BIND};
use twinlink_transport::{ChannelKind, Inbound, ReliableChannel, TransportError, UnreliableChannel};

use crate::dispatcher::Dispatcher;
use crate::error::{PeerError, Result};
use crate::handshake::{accept_bind_request, spawn_bind_ack};
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};

/// Listen addresses for a [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT)),
            udp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_UDP_PORT)),
        }
    }
}

/// Accepts reliable connections, assigns identities, and binds each client's
/// unreliable address through the shared datagram socket.
pub struct Server {
    listener: Mutex<Option<TcpListener>>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    udp: Arc<UnreliableChannel>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    next_identity: AtomicU32,
    cancel: CancellationToken,
}

impl Server {
    /// Bind both sockets and install the bind-request handler on `dispatcher`.
    ///
    /// Fails with `DuplicateHandler` if the dispatcher already handles
    /// bind messages.
    pub async fn bind(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.tcp_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.tcp_addr,
                source,
            })?;
        let tcp_addr = listener.local_addr().map_err(TransportError::from)?;
        let udp = UnreliableChannel::bind(config.udp_addr).await?;
        let udp_addr = udp.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let bind_registry = Arc::clone(&registry);
        dispatcher.register(PEER_BIND, move |message, origin| {
            let Message::PeerBind(bind) = message else {
                return;
            };
            if origin.channel != ChannelKind::Unreliable {
                debug!(%origin, identity = bind.identity, "ignoring bind message on reliable channel");
                return;
            }
            if let Some(session) = accept_bind_request(&bind_registry, bind, origin.addr) {
                spawn_bind_ack(session);
            }
        })?;

        info!(%tcp_addr, %udp_addr, "server bound");
        Ok(Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            tcp_addr,
            udp_addr,
            udp,
            registry,
            dispatcher,
            next_identity: AtomicU32::new(1),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown).
    ///
    /// Only the first call runs the loop; later calls return immediately.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return Ok(());
        };

        let inbound: Arc<dyn Inbound> = Arc::clone(&self.dispatcher) as Arc<dyn Inbound>;
        self.udp.start_receiving(inbound);
        info!(tcp_addr = %self.tcp_addr, udp_addr = %self.udp_addr, "server started");

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    if let Err(err) = self.admit(stream, remote) {
                        warn!(%remote, error = %err, "failed to admit client");
                    }
                }
                Err(err) if is_transient_accept(err.kind()) => {
                    debug!(error = %err, "transient accept error");
                }
                Err(err) => {
                    self.cancel.cancel();
                    return Err(TransportError::Accept(err).into());
                }
            }
        }

        info!(tcp_addr = %self.tcp_addr, "server stopped");
        Ok(())
    }

    /// Run the accept loop on a new task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.run().await })
    }

    fn admit(&self, stream: TcpStream, remote: SocketAddr) -> Result<u32> {
        let (channel, disconnected) = ReliableChannel::new(stream)?;
        let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(identity, Arc::clone(&channel)));
        self.registry.add(Arc::clone(&session))?;
        info!(identity, %remote, "client connected");

        channel.start_receiving(Arc::clone(&self.dispatcher) as Arc<dyn Inbound>);

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            match session.send(&Message::IdentityAssignment(identity)).await {
                Ok(()) => debug!(identity, "identity assigned"),
                Err(err) => debug!(identity, error = %err, "identity assignment not delivered"),
            }
            drop(session);

            disconnected.wait().await;
            if registry.remove(identity).await {
                info!(identity, %remote, "client disconnected");
            }
        });
        Ok(identity)
    }

    /// Send to `identity` over its reliable channel.
    pub async fn send_reliable(&self, identity: u32, message: &Message) -> Result<()> {
        let session = self
            .registry
            .get(identity)
            .ok_or(PeerError::UnknownIdentity(identity))?;
        session.send(message).await
    }

    /// Send to `identity` over the shared unreliable socket.
    ///
    /// Fails with `NotBound` until the client's bind request has arrived.
    pub async fn send_unreliable(&self, identity: u32, message: &Message) -> Result<()> {
        if !self.registry.contains(identity) {
            return Err(PeerError::UnknownIdentity(identity));
        }
        let addr = self
            .registry
            .resolve_unreliable_address(identity)
            .ok_or(PeerError::NotBound(identity))?;
        self.udp.send(message, Some(addr)).await?;
        Ok(())
    }

    /// Stop both loops and dispose every session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.udp.close();
        self.registry.dispose_all().await;
        debug!(tcp_addr = %self.tcp_addr, "server shut down");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tcp_addr", &self.tcp_addr)
            .field("udp_addr", &self.udp_addr)
            .field("clients", &self.registry.len())
            .finish()
    }
}

fn is_transient_accept(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}
