//! Resolves a chat message's destination and forwards it.

use std::collections::HashMap;

use parley_protocol::Envelope;

use crate::connection::{ConnectionHandle, SendError};
use crate::registry::{ConnId, SessionRegistry};

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the destination's write pump.
    Delivered,
    /// The destination has a session but cannot take the frame right
    /// now; retry on a later flush.
    NotReady,
    /// Nobody with that name is online.
    Unknown,
}

/// Attempts to forward `envelope` to its destination.
///
/// Never blocks: the hand-off is a `try_send` into the destination's
/// write pump, so a slow or dying peer stalls only its own queue.
pub fn route(
    envelope: &Envelope,
    registry: &SessionRegistry,
    connections: &HashMap<ConnId, ConnectionHandle>,
) -> RouteOutcome {
    let Some(destination) = envelope.destination.as_deref() else {
        return RouteOutcome::Unknown;
    };
    let Some(conn) = registry.lookup(destination) else {
        return RouteOutcome::Unknown;
    };
    let Some(handle) = connections.get(&conn) else {
        tracing::debug!(%conn, destination, "session without a connection handle");
        return RouteOutcome::Unknown;
    };

    match handle.try_send_frame(envelope.clone()) {
        Ok(()) => RouteOutcome::Delivered,
        Err(SendError::Full) | Err(SendError::Closed) => RouteOutcome::NotReady,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::WriteCmd;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn handle_with_capacity(
        id: ConnId,
        capacity: usize,
    ) -> (ConnectionHandle, mpsc::Receiver<WriteCmd>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = ConnectionHandle::new(
            id,
            "127.0.0.1:9".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (handle, rx)
    }

    #[test]
    fn routes_to_registered_destination() {
        let mut registry = SessionRegistry::new();
        registry.register("bob", ConnId(1)).unwrap();
        let (handle, mut rx) = handle_with_capacity(ConnId(1), 4);
        let connections = HashMap::from([(ConnId(1), handle)]);

        let envelope = Envelope::chat("alice", "bob", "hi");
        let outcome = route(&envelope, &registry, &connections);
        assert_eq!(outcome, RouteOutcome::Delivered);

        match rx.try_recv().unwrap() {
            WriteCmd::Frame(received) => assert_eq!(received, envelope),
            other => panic!("unexpected write command: {other:?}"),
        }
    }

    #[test]
    fn unknown_destination() {
        let registry = SessionRegistry::new();
        let connections = HashMap::new();

        let envelope = Envelope::chat("alice", "ghost", "anyone?");
        assert_eq!(
            route(&envelope, &registry, &connections),
            RouteOutcome::Unknown
        );
    }

    #[test]
    fn full_write_buffer_is_not_ready() {
        let mut registry = SessionRegistry::new();
        registry.register("bob", ConnId(1)).unwrap();
        let (handle, _rx) = handle_with_capacity(ConnId(1), 1);
        handle
            .try_send_frame(Envelope::chat("x", "bob", "filler"))
            .unwrap();
        let connections = HashMap::from([(ConnId(1), handle)]);

        let envelope = Envelope::chat("alice", "bob", "hi");
        assert_eq!(
            route(&envelope, &registry, &connections),
            RouteOutcome::NotReady
        );
    }

    #[test]
    fn closed_write_pump_is_not_ready() {
        let mut registry = SessionRegistry::new();
        registry.register("bob", ConnId(1)).unwrap();
        let (handle, rx) = handle_with_capacity(ConnId(1), 4);
        drop(rx);
        let connections = HashMap::from([(ConnId(1), handle)]);

        // The session still exists this tick; cleanup happens when the
        // close event is drained, after which the outcome is Unknown.
        let envelope = Envelope::chat("alice", "bob", "hi");
        assert_eq!(
            route(&envelope, &registry, &connections),
            RouteOutcome::NotReady
        );
    }
}
