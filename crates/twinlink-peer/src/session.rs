use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use twinlink_frame::Message;
use twinlink_transport::ReliableChannel;

use crate::error::Result;

/// One connected client as seen by the server.
///
/// The bound unreliable address lives in the
/// [`ConnectionRegistry`](crate::ConnectionRegistry), not here, so the shared
/// datagram socket can resolve it without touching the session.
#[derive(Debug)]
pub struct Session {
    identity: u32,
    channel: Arc<ReliableChannel>,
    connected_at: Instant,
}

impl Session {
    pub fn new(identity: u32, channel: Arc<ReliableChannel>) -> Self {
        Self {
            identity,
            channel,
            connected_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn channel(&self) -> &Arc<ReliableChannel> {
        &self.channel
    }

    /// Remote address of the reliable stream.
    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Send over this session's reliable channel.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.channel.send(message).await?;
        Ok(())
    }

    pub async fn dispose(&self) {
        self.channel.dispose().await;
    }
}
