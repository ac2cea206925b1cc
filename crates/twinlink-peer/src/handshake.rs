//! Identity assignment and unreliable-address binding.
//!
//! The client side is a two-flag state machine ([`ClientHandshake`]) plus a
//! retry loop that keeps announcing the identity over the unreliable channel
//! until the server acknowledges it over the reliable one. The server side is
//! [`accept_bind_request`], which records the datagram source in the
//! [`ConnectionRegistry`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use twinlink_frame::{Message, PeerBind};
use twinlink_transport::{TransportError, UnreliableChannel};

use crate::error::{PeerError, Result};
use crate::registry::ConnectionRegistry;
use crate::session::Session;

/// Pause between two bind requests.
pub const DEFAULT_BIND_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the binding phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Interval between unacknowledged bind requests.
    pub bind_retry_interval: Duration,
    /// Upper bound on the whole binding phase. `None` retries forever.
    pub bind_timeout: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            bind_retry_interval: DEFAULT_BIND_RETRY_INTERVAL,
            bind_timeout: None,
        }
    }
}

/// Client-side handshake state.
///
/// Both flags only ever move forward: the identity is set by the first
/// assignment and `bound` flips once, on the first matching ack.
#[derive(Debug)]
pub struct ClientHandshake {
    identity: watch::Sender<Option<u32>>,
    bound: watch::Sender<bool>,
}

impl ClientHandshake {
    pub fn new() -> Self {
        let (identity, _) = watch::channel(None);
        let (bound, _) = watch::channel(false);
        Self { identity, bound }
    }

    pub fn identity(&self) -> Option<u32> {
        *self.identity.borrow()
    }

    pub fn is_bound(&self) -> bool {
        *self.bound.borrow()
    }

    /// Record the server-assigned identity.
    ///
    /// Returns true only for the assignment that actually set it; later
    /// assignments are ignored.
    pub fn on_identity_assignment(&self, identity: u32) -> bool {
        self.identity.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(identity);
            true
        })
    }

    /// Apply a bind message received from the server.
    ///
    /// Returns true only for the ack that completed binding. Requests, acks
    /// for another identity, and duplicate acks are ignored.
    pub fn on_bind_ack(&self, bind: PeerBind) -> bool {
        if !bind.ack || self.identity() != Some(bind.identity) {
            return false;
        }
        self.bound.send_if_modified(|bound| {
            if *bound {
                return false;
            }
            *bound = true;
            true
        })
    }

    /// Resolve once an identity has been assigned.
    pub async fn wait_identity(&self) -> Result<u32> {
        let mut rx = self.identity.subscribe();
        let identity = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PeerError::Cancelled)?;
        (*identity).ok_or(PeerError::Cancelled)
    }

    /// Resolve once binding has been acknowledged.
    pub async fn wait_bound(&self) -> Result<()> {
        let mut rx = self.bound.subscribe();
        rx.wait_for(|bound| *bound)
            .await
            .map_err(|_| PeerError::Cancelled)?;
        Ok(())
    }

    /// Announce `identity` over `channel` until acknowledged.
    ///
    /// Stops early with `Cancelled` when `cancel` fires or the channel is
    /// closed, and with `Timeout` when `config.bind_timeout` elapses.
    pub async fn run_bind_loop(
        &self,
        identity: u32,
        channel: &UnreliableChannel,
        config: &HandshakeConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let attempts = self.bind_attempts(identity, channel, config.bind_retry_interval, cancel);
        match config.bind_timeout {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .map_err(|_| PeerError::Timeout(limit))?,
            None => attempts.await,
        }
    }

    async fn bind_attempts(
        &self,
        identity: u32,
        channel: &UnreliableChannel,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = Message::from(PeerBind::request(identity));
        let mut bound = self.bound.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if *bound.borrow_and_update() {
                debug!(identity, attempt, "unreliable channel bound");
                return Ok(());
            }

            attempt += 1;
            trace!(identity, attempt, "sending bind request");
            match channel.send(&request, None).await {
                Ok(()) => {}
                Err(TransportError::Disconnected) => return Err(PeerError::Cancelled),
                Err(err) => debug!(identity, attempt, error = %err, "bind request not sent"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                changed = bound.changed() => {
                    if changed.is_err() {
                        return Err(PeerError::Cancelled);
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side handling of a bind message that arrived from `source`.
///
/// A request for a registered identity records `source` as its bound
/// unreliable address (replacing any earlier one) and returns the session
/// the ack must be sent on. Acks and unknown identities return `None`.
pub fn accept_bind_request(
    registry: &ConnectionRegistry,
    bind: PeerBind,
    source: SocketAddr,
) -> Option<Arc<Session>> {
    if bind.ack {
        debug!(identity = bind.identity, %source, "ignoring bind ack sent to server");
        return None;
    }

    let session = registry.get(bind.identity);
    let Some(session) = session else {
        warn!(identity = bind.identity, %source, "bind request from unknown identity");
        return None;
    };

    match registry.bind_unreliable_address(bind.identity, source) {
        Ok(Some(previous)) if previous != source => {
            info!(identity = bind.identity, %previous, %source, "unreliable address rebound");
        }
        Ok(Some(_)) => {}
        Ok(None) => info!(identity = bind.identity, %source, "unreliable channel established"),
        Err(err) => {
            warn!(identity = bind.identity, %source, error = %err, "bind request raced disconnect");
            return None;
        }
    }
    Some(session)
}

/// Send the bind ack for `session` over its reliable channel, off the
/// calling task.
pub fn spawn_bind_ack(session: Arc<Session>) {
    tokio::spawn(async move {
        let identity = session.identity();
        if let Err(err) = session.send(&PeerBind::ack(identity).into()).await {
            debug!(identity, error = %err, "bind ack not delivered");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{duplex, split};
    use twinlink_frame::{Frame, PEER_BIND};
    use twinlink_transport::{Inbound, Origin, ReliableChannel};

    use super::*;

    #[test]
    fn identity_is_first_writer_wins() {
        let handshake = ClientHandshake::new();
        assert_eq!(handshake.identity(), None);
        assert!(handshake.on_identity_assignment(7));
        assert!(!handshake.on_identity_assignment(8));
        assert_eq!(handshake.identity(), Some(7));
    }

    #[test]
    fn binding_transitions_exactly_once() {
        let handshake = ClientHandshake::new();

        // Ack before identity is known.
        assert!(!handshake.on_bind_ack(PeerBind::ack(7)));

        handshake.on_identity_assignment(7);
        assert!(!handshake.on_bind_ack(PeerBind::request(7)));
        assert!(!handshake.on_bind_ack(PeerBind::ack(8)));
        assert!(!handshake.is_bound());

        assert!(handshake.on_bind_ack(PeerBind::ack(7)));
        assert!(!handshake.on_bind_ack(PeerBind::ack(7)));
        assert!(!handshake.on_bind_ack(PeerBind::ack(7)));
        assert!(handshake.is_bound());
    }

    #[tokio::test]
    async fn wait_identity_resolves_after_assignment() {
        let handshake = Arc::new(ClientHandshake::new());
        let waiter = {
            let handshake = Arc::clone(&handshake);
            tokio::spawn(async move { handshake.wait_identity().await })
        };
        tokio::task::yield_now().await;
        handshake.on_identity_assignment(3);
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    // Answers every bind request the way a server would, after `skip`
    // requests have been lost.
    struct LossyServer {
        handshake: Arc<ClientHandshake>,
        seen: std::sync::atomic::AtomicUsize,
        skip: usize,
    }

    impl Inbound for LossyServer {
        fn deliver(&self, frame: Frame, _origin: Origin) {
            assert_eq!(frame.kind, PEER_BIND);
            let Ok(Message::PeerBind(bind)) = Message::from_frame(frame) else {
                panic!("expected bind request");
            };
            assert!(!bind.ack);
            let n = self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.skip {
                self.handshake.on_bind_ack(PeerBind::ack(bind.identity));
            }
        }
    }

    #[tokio::test]
    async fn bind_loop_retries_until_acknowledged() {
        let handshake = Arc::new(ClientHandshake::new());
        handshake.on_identity_assignment(7);

        let server = UnreliableChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let sink = Arc::new(LossyServer {
            handshake: Arc::clone(&handshake),
            seen: Default::default(),
            skip: 3,
        });
        server.start_receiving(Arc::clone(&sink) as Arc<dyn Inbound>);

        let client = UnreliableChannel::bind_to_peer("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();
        let config = HandshakeConfig {
            bind_timeout: Some(Duration::from_secs(5)),
            ..HandshakeConfig::default()
        };
        handshake
            .run_bind_loop(7, &client, &config, &CancellationToken::new())
            .await
            .unwrap();

        assert!(handshake.is_bound());
        assert!(sink.seen.load(std::sync::atomic::Ordering::SeqCst) >= 4);
        server.close();
    }

    #[tokio::test]
    async fn bind_loop_honours_timeout_and_cancel() {
        let handshake = ClientHandshake::new();
        handshake.on_identity_assignment(1);

        // Nobody answers on this address.
        let silent = UnreliableChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = UnreliableChannel::bind_to_peer(
            "127.0.0.1:0".parse().unwrap(),
            silent.local_addr().unwrap(),
        )
        .await
        .unwrap();

        let config = HandshakeConfig {
            bind_timeout: Some(Duration::from_millis(50)),
            ..HandshakeConfig::default()
        };
        let err = handshake
            .run_bind_loop(1, &client, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Timeout(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handshake
            .run_bind_loop(1, &client, &HandshakeConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Cancelled));
        assert!(!handshake.is_bound());
    }

    fn registered(registry: &ConnectionRegistry, identity: u32) -> tokio::io::DuplexStream {
        let (local, remote) = duplex(1024);
        let (reader, writer) = split(local);
        let (channel, _signal) =
            ReliableChannel::from_parts(reader, writer, "127.0.0.1:4000".parse().unwrap());
        registry
            .add(Arc::new(Session::new(identity, channel)))
            .unwrap();
        remote
    }

    #[tokio::test]
    async fn server_records_latest_source() {
        let registry = ConnectionRegistry::new();
        let _remote = registered(&registry, 7);

        let first: SocketAddr = "198.51.100.1:4000".parse().unwrap();
        let second: SocketAddr = "198.51.100.1:4100".parse().unwrap();

        assert!(accept_bind_request(&registry, PeerBind::request(7), first).is_some());
        assert_eq!(registry.resolve_unreliable_address(7), Some(first));
        assert!(accept_bind_request(&registry, PeerBind::request(7), second).is_some());
        assert_eq!(registry.resolve_unreliable_address(7), Some(second));
    }

    #[tokio::test]
    async fn server_ignores_acks_and_unknown_identities() {
        let registry = ConnectionRegistry::new();
        let _remote = registered(&registry, 7);
        let source: SocketAddr = "198.51.100.1:4000".parse().unwrap();

        assert!(accept_bind_request(&registry, PeerBind::ack(7), source).is_none());
        assert!(accept_bind_request(&registry, PeerBind::request(9), source).is_none());
        assert_eq!(registry.resolve_unreliable_address(7), None);
        assert_eq!(registry.resolve_unreliable_address(9), None);
    }

    #[tokio::test]
    async fn ack_goes_out_on_the_reliable_channel() {
        use tokio::io::AsyncReadExt;

        let registry = ConnectionRegistry::new();
        let mut remote = registered(&registry, 5);
        let session = accept_bind_request(
            &registry,
            PeerBind::request(5),
            "198.51.100.1:4000".parse().unwrap(),
        )
        .unwrap();
        spawn_bind_ack(session);

        let mut buf = [0u8; 8];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            Message::decode(&buf).unwrap(),
            Message::PeerBind(PeerBind::ack(5))
        );
    }
}
