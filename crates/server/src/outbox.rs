//! Queue of accepted chat messages awaiting delivery.
//!
//! Accepting a message from its sender and delivering it to its
//! destination are decoupled: the outbox holds the gap. Envelopes are
//! stored exactly as received so forwarding never rewrites a message.

use std::collections::{HashSet, VecDeque};

use parley_protocol::Envelope;

use crate::router::RouteOutcome;

/// Counters from one flush pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct PendingOutbox {
    queue: VecDeque<Envelope>,
}

impl PendingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Attempts delivery of every queued envelope, in order.
    ///
    /// `deliver` is called once per attempted envelope. `Delivered`
    /// removes it; `Unknown` drops it (the destination has no session);
    /// `NotReady` keeps it queued and, to preserve per-sender order,
    /// also holds back every later envelope for the same destination
    /// without attempting it this pass.
    pub fn flush<F>(&mut self, mut deliver: F) -> FlushStats
    where
        F: FnMut(&Envelope) -> RouteOutcome,
    {
        let mut stats = FlushStats::default();
        let mut stalled: HashSet<String> = HashSet::new();
        let mut kept = VecDeque::new();

        for envelope in self.queue.drain(..) {
            let Some(destination) = envelope.destination.as_deref() else {
                // Queued envelopes are validated chats; no destination
                // means a logic error upstream, not a deliverable frame.
                stats.dropped += 1;
                continue;
            };
            if stalled.contains(destination) {
                kept.push_back(envelope);
                continue;
            }
            match deliver(&envelope) {
                RouteOutcome::Delivered => stats.delivered += 1,
                RouteOutcome::NotReady => {
                    stalled.insert(destination.to_owned());
                    kept.push_back(envelope);
                }
                RouteOutcome::Unknown => {
                    tracing::info!(destination, "no session for destination, dropping message");
                    stats.dropped += 1;
                }
            }
        }

        self.queue = kept;
        stats
    }
}
