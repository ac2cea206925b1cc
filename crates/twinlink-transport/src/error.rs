use std::net::SocketAddr;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the underlying socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel has been disposed or the remote side closed it.
    #[error("channel disconnected")]
    Disconnected,

    /// An address was supplied or omitted inconsistently with the channel mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The message could not be framed.
    #[error("frame error: {0}")]
    Frame(#[from] twinlink_frame::FrameError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
