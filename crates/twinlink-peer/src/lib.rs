//! Sessions, dispatch, and the identity handshake for twinlink.
//!
//! A [`Server`] accepts reliable connections, assigns each one an identity,
//! and learns the client's unreliable address from bind requests that arrive
//! on its shared datagram socket. A [`Client`] dials the server, waits for
//! its identity, and announces itself over the unreliable channel until the
//! server acknowledges over the reliable one. Both route inbound traffic
//! through a [`Dispatcher`].

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;

/// Default server port for the reliable channel.
pub const DEFAULT_TCP_PORT: u16 = 42131;
/// Default server port for the unreliable channel.
pub const DEFAULT_UDP_PORT: u16 = 42132;

pub use client::{Client, ClientConfig, DEFAULT_RECONNECT_DELAY};
pub use dispatcher::{Disposition, Dispatcher, Handler};
pub use error::{PeerError, Result};
pub use handshake::{
    accept_bind_request, spawn_bind_ack, ClientHandshake, HandshakeConfig,
    DEFAULT_BIND_RETRY_INTERVAL,
};
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerConfig};
pub use session::Session;
