use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use twinlink_frame::{parse_frame, Message};

use crate::error::{Result, TransportError};
use crate::traits::{Inbound, Origin};

/// Receive buffer size; large enough for any frame the codec can produce.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Datagram endpoint carrying one frame per datagram.
///
/// In **bound** mode the socket is connected to a single peer: sends take no
/// address and the kernel drops datagrams from anyone else. In **open** mode
/// every send names its destination and every receive reports its source.
///
/// No delivery, ordering, or deduplication guarantees.
///
/// [`close`](Self::close) releases the socket: the port is free again once
/// the receive loop and any in-flight send have let go of it.
pub struct UnreliableChannel {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    peer: Option<SocketAddr>,
    send_lock: AsyncMutex<()>,
    cancel: CancellationToken,
    listening: AtomicBool,
}

impl UnreliableChannel {
    /// Bind an open-mode endpoint.
    pub async fn bind(local: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local,
                source,
            })?;
        info!(local = %socket.local_addr()?, "unreliable channel listening");
        Ok(Arc::new(Self::from_socket(socket, None)))
    }

    /// Bind a bound-mode endpoint fixed to `peer`.
    pub async fn bind_to_peer(local: SocketAddr, peer: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local,
                source,
            })?;
        socket
            .connect(peer)
            .await
            .map_err(|source| TransportError::Connect {
                addr: peer.to_string(),
                source,
            })?;
        debug!(local = %socket.local_addr()?, %peer, "unreliable channel bound to peer");
        Ok(Arc::new(Self::from_socket(socket, Some(peer))))
    }

    fn from_socket(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            peer,
            send_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
            listening: AtomicBool::new(false),
        }
    }

    /// Local address of the socket. Fails with `Disconnected` once closed.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    /// The fixed peer in bound mode, `None` in open mode.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send one message as a single datagram.
    ///
    /// `addr` must be `None` in bound mode and `Some` in open mode; anything
    /// else fails with `InvalidArgument` before touching the socket.
    pub async fn send(&self, message: &Message, addr: Option<SocketAddr>) -> Result<()> {
        match (self.peer, addr) {
            (Some(_), Some(_)) => {
                return Err(TransportError::InvalidArgument(
                    "destination must not be supplied on a bound channel",
                ))
            }
            (None, None) => {
                return Err(TransportError::InvalidArgument(
                    "destination is required on an open channel",
                ))
            }
            _ => {}
        }
        let socket = self.socket()?;

        let bytes = message.encode()?;
        let _guard = self.send_lock.lock().await;
        let sent = match addr {
            Some(addr) => socket.send_to(&bytes, addr).await?,
            None => socket.send(&bytes).await?,
        };
        trace!(kind = message.kind(), size = sent, ?addr, "sent datagram");
        Ok(())
    }

    /// Start the receive loop, delivering every well-formed datagram to `inbound`.
    ///
    /// Returns false if the loop was already started or the channel is closed.
    pub fn start_receiving(self: &Arc<Self>, inbound: Arc<dyn Inbound>) -> bool {
        let Ok(socket) = self.socket() else {
            return false;
        };
        if self.listening.swap(true, Ordering::AcqRel) {
            return false;
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.receive_loop(socket, inbound).await;
        });
        true
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, inbound: Arc<dyn Inbound>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("unreliable receive loop cancelled");
                    break;
                }
                received = socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => match parse_frame(&buf[..len]) {
                    Ok(frame) => inbound.deliver(frame, Origin::unreliable(from)),
                    Err(err) => debug!(%from, error = %err, "dropping malformed datagram"),
                },
                Err(err) if is_transient(err.kind()) => {
                    trace!(error = %err, "transient datagram receive error");
                }
                Err(err) => {
                    warn!(error = %err, "unreliable receive loop stopped");
                    break;
                }
            }
        }
    }

    /// Stop the receive loop, reject further sends, and release the socket.
    /// Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if socket.is_some() {
            debug!(peer = ?self.peer, "unreliable channel closed");
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Disconnected)
    }
}

impl std::fmt::Debug for UnreliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreliableChannel")
            .field("local", &self.local_addr().ok())
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ICMP unreachable replies surface as errors on the next receive; the
// socket itself is still usable.
fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
