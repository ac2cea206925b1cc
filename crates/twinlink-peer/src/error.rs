/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] twinlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] twinlink_frame::FrameError),

    /// A handler is already registered for this message kind.
    #[error("handler already registered for message kind {0}")]
    DuplicateHandler(u8),

    /// A session is already registered under this identity.
    #[error("identity {0} is already registered")]
    DuplicateIdentity(u32),

    /// No session exists for this identity.
    #[error("unknown identity {0}")]
    UnknownIdentity(u32),

    /// The identity has not completed the unreliable-channel handshake.
    #[error("identity {0} has no bound unreliable address")]
    NotBound(u32),

    /// The operation did not finish within its configured bound.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled before it finished.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PeerError>;
