use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{PeerError, Result};
use crate::session::Session;

/// Concurrent map from identity to session and bound unreliable address.
///
/// Both maps are sharded, so connects, disconnects, and bindings for
/// unrelated identities do not contend. No shard lock is held across an
/// `.await`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<u32, Arc<Session>>,
    peer_addrs: DashMap<u32, SocketAddr>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session under its identity.
    pub fn add(&self, session: Arc<Session>) -> Result<()> {
        let identity = session.identity();
        match self.sessions.entry(identity) {
            Entry::Occupied(_) => Err(PeerError::DuplicateIdentity(identity)),
            Entry::Vacant(slot) => {
                slot.insert(session);
                debug!(identity, "session registered");
                Ok(())
            }
        }
    }

    /// Remove a session and dispose its reliable channel.
    ///
    /// Idempotent; returns whether an entry was actually removed.
    pub async fn remove(&self, identity: u32) -> bool {
        let removed = self.sessions.remove(&identity);
        self.peer_addrs.remove(&identity);
        match removed {
            Some((_, session)) => {
                session.dispose().await;
                debug!(identity, "session removed");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, identity: u32) -> Option<Arc<Session>> {
        self.sessions
            .get(&identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, identity: u32) -> bool {
        self.sessions.contains_key(&identity)
    }

    /// Record `addr` as the bound unreliable address of `identity`,
    /// replacing any earlier binding. Returns the previous address.
    pub fn bind_unreliable_address(
        &self,
        identity: u32,
        addr: SocketAddr,
    ) -> Result<Option<SocketAddr>> {
        // Holding the session entry keeps a concurrent `remove` from leaving
        // a stale address behind.
        let Some(_session) = self.sessions.get(&identity) else {
            return Err(PeerError::UnknownIdentity(identity));
        };
        Ok(self.peer_addrs.insert(identity, addr))
    }

    /// Bound unreliable address, or `None` if the handshake has not completed.
    pub fn resolve_unreliable_address(&self, identity: u32) -> Option<SocketAddr> {
        self.peer_addrs.get(&identity).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the registered identities, in no particular order.
    pub fn identities(&self) -> Vec<u32> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove and dispose every session.
    pub async fn dispose_all(&self) {
        for identity in self.identities() {
            self.remove(identity).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{duplex, split, DuplexStream};
    use twinlink_transport::ReliableChannel;

    use super::*;

    fn session(identity: u32) -> (Arc<Session>, DuplexStream) {
        let (local, remote) = duplex(1024);
        let (reader, writer) = split(local);
        let addr: SocketAddr = format!("127.0.0.1:{}", 30000 + identity % 1000)
            .parse()
            .unwrap();
        let (channel, _signal) = ReliableChannel::from_parts(reader, writer, addr);
        (Arc::new(Session::new(identity, channel)), remote)
    }

    #[tokio::test]
    async fn duplicate_identity_rejected() {
        let registry = ConnectionRegistry::new();
        let (first, _a) = session(1);
        let (second, _b) = session(1);

        registry.add(first).unwrap();
        assert!(matches!(
            registry.add(second),
            Err(PeerError::DuplicateIdentity(1))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_disposes() {
        let registry = ConnectionRegistry::new();
        let (session, _remote) = session(4);
        registry.add(Arc::clone(&session)).unwrap();

        assert!(registry.remove(4).await);
        assert!(!session.is_connected());
        assert!(!registry.remove(4).await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn binding_is_last_writer_wins() {
        let registry = ConnectionRegistry::new();
        let (session, _remote) = session(7);
        registry.add(session).unwrap();

        assert_eq!(registry.resolve_unreliable_address(7), None);

        let first: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let second: SocketAddr = "192.0.2.1:5999".parse().unwrap();
        assert_eq!(registry.bind_unreliable_address(7, first).unwrap(), None);
        assert_eq!(registry.resolve_unreliable_address(7), Some(first));
        assert_eq!(
            registry.bind_unreliable_address(7, second).unwrap(),
            Some(first)
        );
        assert_eq!(registry.resolve_unreliable_address(7), Some(second));
    }

    #[tokio::test]
    async fn binding_unknown_identity_fails() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        assert!(matches!(
            registry.bind_unreliable_address(99, addr),
            Err(PeerError::UnknownIdentity(99))
        ));
        assert_eq!(registry.resolve_unreliable_address(99), None);
    }

    #[tokio::test]
    async fn remove_clears_binding() {
        let registry = ConnectionRegistry::new();
        let (session, _remote) = session(2);
        registry.add(session).unwrap();
        registry
            .bind_unreliable_address(2, "192.0.2.9:7000".parse().unwrap())
            .unwrap();

        registry.remove(2).await;
        assert_eq!(registry.resolve_unreliable_address(2), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_add_bind_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for identity in 1..=200u32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (session, _remote) = session(identity);
                registry.add(session).unwrap();
                let addr: SocketAddr = format!("10.0.0.1:{}", 1000 + identity).parse().unwrap();
                registry.bind_unreliable_address(identity, addr).unwrap();
                assert_eq!(registry.resolve_unreliable_address(identity), Some(addr));
                if identity % 2 == 0 {
                    assert!(registry.remove(identity).await);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 100);
        assert!(registry.identities().iter().all(|id| id % 2 == 1));

        registry.dispose_all().await;
        assert!(registry.is_empty());
    }
}
