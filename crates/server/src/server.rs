//! The relay's accept and dispatch loop.
//!
//! One task owns every piece of mutable relay state: the session
//! registry, the pending outbox and the table of live connections.
//! Per-connection pump tasks talk to it exclusively over channels, so
//! a dispatch tick never contends with socket I/O and no lock guards
//! the session state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_protocol::{DEFAULT_MAX_FRAME, DEFAULT_PORT, Envelope};
use parley_storage::Storage;

use crate::RelayError;
use crate::connection::{self, ConnEvent, ConnectionHandle};
use crate::handler::{RelayEvent, RelayState};
use crate::registry::ConnId;
use crate::router::route;

/// How often queued deliveries are retried while the relay is idle.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Inbound events from every connection funnel through one channel of
/// this size; read pumps await their turn when it is full.
const EVENT_BUFFER_SIZE: usize = 256;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind: SocketAddr,
    /// Largest accepted frame payload, in bytes.
    pub max_frame: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// The chat relay server.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_frame: usize,
    state: RelayState,
    connections: HashMap<ConnId, ConnectionHandle>,
    next_conn: u64,
    conn_events: mpsc::Receiver<ConnEvent>,
    /// Kept alive so `conn_events.recv()` never reports all senders
    /// gone while connections come and go.
    conn_events_tx: mpsc::Sender<ConnEvent>,
    cancel: CancellationToken,
    relay_events_tx: mpsc::Sender<RelayEvent>,
    relay_events_rx: Option<mpsc::Receiver<RelayEvent>>,
}

impl RelayServer {
    /// Binds the listening socket and prepares the dispatch state.
    pub async fn bind(config: RelayConfig, storage: Arc<dyn Storage>) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("relay listening on {local_addr}");

        let (conn_events_tx, conn_events) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (relay_events_tx, relay_events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        Ok(Self {
            listener,
            local_addr,
            max_frame: config.max_frame,
            state: RelayState::new(storage),
            connections: HashMap::new(),
            next_conn: 0,
            conn_events,
            conn_events_tx,
            cancel: CancellationToken::new(),
            relay_events_tx,
            relay_events_rx: Some(relay_events_rx),
        })
    }

    /// Address the relay is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Takes the session event receiver.
    ///
    /// Call before [`run`](Self::run); later calls return `None`. Event
    /// delivery is best effort: if the receiver is never taken or stops
    /// being drained, events are dropped rather than stalling dispatch.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.relay_events_rx.take()
    }

    /// Runs the accept and dispatch loop until cancellation.
    pub async fn run(mut self) -> Result<(), RelayError> {
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if !self.state.outbox.is_empty() {
                        tracing::info!(
                            pending = self.state.outbox.len(),
                            "discarding undelivered messages"
                        );
                    }
                    tracing::info!("relay shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.accept_connection(stream, peer_addr),
                        Err(e) => tracing::error!("accept error: {e}"),
                    }
                }

                event = self.conn_events.recv() => {
                    // recv() cannot yield None: we hold a sender clone.
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }

                _ = flush_tick.tick() => {}
            }

            // Retry queued deliveries after every wakeup. The tick arm
            // exists so a destination that reported NotReady is retried
            // even while the relay is otherwise idle.
            self.flush_outbox();
            self.forward_events();
        }

        // Connection pumps hold child tokens of `cancel`; they tear
        // themselves down without further help.
        Ok(())
    }

    fn accept_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;

        tracing::info!(conn = %id, %peer_addr, "accepted connection");
        let handle = connection::spawn_connection(
            id,
            stream,
            peer_addr,
            self.max_frame,
            self.conn_events_tx.clone(),
            &self.cancel,
        );
        self.connections.insert(id, handle);
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame { conn, envelope } => self.handle_frame(conn, envelope),
            ConnEvent::Closed { conn } => self.handle_closed(conn),
        }
    }

    fn handle_frame(&mut self, conn: ConnId, envelope: Envelope) {
        let Some(handle) = self.connections.get(&conn) else {
            // A frame can race the teardown of its own connection.
            return;
        };
        let disposition = self.state.handle_frame(conn, handle.peer_addr, envelope);

        if let Some(reply) = disposition.reply {
            if let Err(e) = handle.try_send_frame(reply) {
                tracing::warn!(%conn, "dropping reply: {e}");
            }
        }
        if disposition.close {
            handle.request_shutdown();
        }
    }

    fn handle_closed(&mut self, conn: ConnId) {
        // The read pump has already exited and cancelled its sibling;
        // dropping the handle completes the teardown.
        if let Some(handle) = self.connections.remove(&conn) {
            tracing::debug!(%conn, peer_addr = %handle.peer_addr, "connection closed");
        }
        if let Some(user) = self.state.client_gone(conn) {
            tracing::debug!(%conn, user = %user, "session dropped with connection");
        }
    }

    fn flush_outbox(&mut self) {
        if self.state.outbox.is_empty() {
            return;
        }
        let registry = &self.state.registry;
        let connections = &self.connections;
        let stats = self
            .state
            .outbox
            .flush(|envelope| route(envelope, registry, connections));
        if stats.delivered > 0 || stats.dropped > 0 {
            tracing::debug!(
                delivered = stats.delivered,
                dropped = stats.dropped,
                pending = self.state.outbox.len(),
                "outbox flush"
            );
        }
    }

    fn forward_events(&mut self) {
        for event in self.state.take_events() {
            // Best effort; dispatch never waits on the event channel.
            let _ = self.relay_events_tx.try_send(event);
        }
    }
}
