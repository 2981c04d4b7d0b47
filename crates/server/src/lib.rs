//! TCP relay server for Parley chat.
//!
//! Accepts length-prefixed JSON frames over plain TCP, binds user names
//! to connections, and relays chat messages between them through a
//! retrying outbox. A single dispatch task owns all mutable session
//! state; per-connection read and write pumps communicate with it over
//! channels, so no lock guards the registry or the outbox.

mod connection;
mod handler;
mod outbox;
mod registry;
mod router;
mod server;

pub use handler::RelayEvent;
pub use server::{RelayConfig, RelayServer};

/// Write pump command buffer capacity, per connection.
///
/// Sized for a burst of relayed chats plus the occasional reply. When it
/// fills, the router reports the destination as not ready and the outbox
/// retries on a later flush instead of blocking dispatch.
pub(crate) const SEND_BUFFER_SIZE: usize = 64;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
