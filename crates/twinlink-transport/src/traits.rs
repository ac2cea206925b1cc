use std::fmt;
use std::net::SocketAddr;

use twinlink_frame::Frame;

/// Which of the two multiplexed channels delivered a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Ordered byte stream (TCP).
    Reliable,
    /// Best-effort datagrams (UDP).
    Unreliable,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Reliable => f.write_str("reliable"),
            ChannelKind::Unreliable => f.write_str("unreliable"),
        }
    }
}

/// Where an inbound frame came from.
///
/// For the reliable channel `addr` is the stream's remote address; for the
/// unreliable channel it is the datagram's source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    pub addr: SocketAddr,
    pub channel: ChannelKind,
}

impl Origin {
    pub fn reliable(addr: SocketAddr) -> Self {
        Self {
            addr,
            channel: ChannelKind::Reliable,
        }
    }

    pub fn unreliable(addr: SocketAddr) -> Self {
        Self {
            addr,
            channel: ChannelKind::Unreliable,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.channel)
    }
}

/// Receives every complete, length-validated frame a channel reads.
///
/// Called directly from the channel's receive loop, so implementations must
/// return promptly; anything slow belongs on a spawned task.
pub trait Inbound: Send + Sync + 'static {
    fn deliver(&self, frame: Frame, origin: Origin);
}

impl<F> Inbound for F
where
    F: Fn(Frame, Origin) + Send + Sync + 'static,
{
    fn deliver(&self, frame: Frame, origin: Origin) {
        self(frame, origin)
    }
}
