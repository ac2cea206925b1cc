//! Built-in message kinds.
//!
//! Kinds 0-2 are used by the transport itself. Every other value is free for
//! application-defined messages registered with the dispatcher.

/// Free-form UTF-8 text.
pub const TEXT: u8 = 0;

/// Server-assigned identity pushed to a freshly connected client.
pub const IDENTITY_ASSIGNMENT: u8 = 1;

/// Unreliable-channel binding request (client) and acknowledgement (server).
pub const PEER_BIND: u8 = 2;

/// Returns a human-readable name for a message kind.
pub fn kind_name(kind: u8) -> &'static str {
    match kind {
        TEXT => "TEXT",
        IDENTITY_ASSIGNMENT => "IDENTITY_ASSIGNMENT",
        PEER_BIND => "PEER_BIND",
        _ => "USER",
    }
}
