//! Two-channel client/server transport for real-time applications.
//!
//! A server and its clients share an ordered reliable stream and a
//! best-effort datagram channel. Each client is assigned an identity over
//! the stream and then binds its datagram address to that identity.
//!
//! # Crate Structure
//!
//! - [`frame`]: Length-prefixed wire frames and the built-in message kinds
//! - [`transport`]: Reliable (TCP) and unreliable (UDP) channels
//! - [`peer`]: Dispatch, handshake, registry, server and client (behind `peer` feature)

/// Re-export frame types.
pub mod frame {
    pub use twinlink_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use twinlink_transport::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use twinlink_peer::*;
}
