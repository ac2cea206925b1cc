//! Message-kind dispatch.
//!
//! A [`Dispatcher`] maps each kind byte to exactly one handler. Channels feed
//! it through the [`Inbound`] trait; it decodes the frame, looks up the
//! handler, and invokes it on the caller's task.
//!
//! ```ignore
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher.register(10, |message, origin| {
//!     tracing::info!(%origin, ?message, "position update");
//! })?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};
use twinlink_frame::{kind_name, Frame, Message, TEXT};
use twinlink_transport::{Inbound, Origin};

use crate::error::{PeerError, Result};

/// Handler invoked for every inbound message of one kind.
pub type Handler = Arc<dyn Fn(Message, Origin) + Send + Sync>;

/// What [`Dispatcher::dispatch`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The registered handler ran.
    Handled,
    /// No handler is registered for this kind; the frame was dropped.
    Unhandled(u8),
    /// The payload did not decode for its kind; the frame was dropped.
    Malformed,
}

/// Registry of one handler per message kind.
pub struct Dispatcher {
    handlers: RwLock<HashMap<u8, Handler>>,
}

impl Dispatcher {
    /// Dispatcher with the default Text handler installed.
    pub fn new() -> Self {
        let dispatcher = Self::empty();
        dispatcher.insert(TEXT, Arc::new(log_text));
        dispatcher
    }

    /// Dispatcher with no handlers at all.
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler for `kind`.
    ///
    /// There is no override path: a second registration for the same kind
    /// fails with `DuplicateHandler` and leaves the first in place.
    pub fn register<F>(&self, kind: u8, handler: F) -> Result<()>
    where
        F: Fn(Message, Origin) + Send + Sync + 'static,
    {
        if self.insert(kind, Arc::new(handler)) {
            debug!(kind, kind_name = kind_name(kind), "registered handler");
            Ok(())
        } else {
            Err(PeerError::DuplicateHandler(kind))
        }
    }

    fn insert(&self, kind: u8, handler: Handler) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&kind) {
            return false;
        }
        handlers.insert(kind, handler);
        true
    }

    /// True if a handler is registered for `kind`.
    pub fn is_registered(&self, kind: u8) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Decode `frame` and route it to its handler.
    pub fn dispatch(&self, frame: Frame, origin: Origin) -> Disposition {
        let kind = frame.kind;
        let message = match Message::from_frame(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(%origin, kind, error = %err, "dropping undecodable message");
                return Disposition::Malformed;
            }
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();

        match handler {
            Some(handler) => {
                handler(message, origin);
                Disposition::Handled
            }
            None => {
                warn!(%origin, kind, kind_name = kind_name(kind), "unhandled message kind");
                Disposition::Unhandled(kind)
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbound for Dispatcher {
    fn deliver(&self, frame: Frame, origin: Origin) {
        self.dispatch(frame, origin);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<u8> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort_unstable();
        f.debug_struct("Dispatcher").field("kinds", &kinds).finish()
    }
}

fn log_text(message: Message, origin: Origin) {
    if let Message::Text(text) = message {
        info!(%origin, %text, "text message received");
    }
}
