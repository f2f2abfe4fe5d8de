//! Handshake correlation registry.
//!
//! The accept stream registers a `Handshake` under a fresh correlation id when
//! it opens the network stream. The network reply stream carries the same id
//! and claims the record to take over the engine. A claim removes the entry,
//! so each handshake is adopted at most once.

use std::sync::Arc;

use dashmap::DashMap;

use crate::client::connection::Connection;

/// In-progress handshake waiting for its network reply stream.
#[derive(Debug)]
pub struct Handshake {
    pub correlation_id: u64,
    pub connection: Arc<Connection>,
    /// Protocol the route resolved to (request value wins over route value).
    pub application_protocol: Option<String>,
    /// A protocol-agnostic route matched the request.
    pub default_route: bool,
    /// Correlation id of the application stream, echoed on the reply begin.
    pub application_correlation_id: u64,
}

/// Correlation id → pending handshake. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct Correlations {
    pending: Arc<DashMap<u64, Handshake>>,
}

impl Correlations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handshake. An existing entry under the same id is replaced
    /// and returned; ids come from a monotonic supply, so that means misuse.
    pub fn register(&self, handshake: Handshake) -> Option<Handshake> {
        let previous = self.pending.insert(handshake.correlation_id, handshake);
        if let Some(previous) = &previous {
            tracing::warn!(correlation_id = previous.correlation_id, "Replaced pending handshake");
        }
        previous
    }

    /// Atomically remove and return the handshake for `correlation_id`.
    pub fn claim(&self, correlation_id: u64) -> Option<Handshake> {
        self.pending.remove(&correlation_id).map(|(_, handshake)| handshake)
    }

    /// Drop an unclaimed handshake. Returns true if one was pending.
    pub fn discard(&self, correlation_id: u64) -> bool {
        let discarded = self.claim(correlation_id).is_some();
        if discarded {
            tracing::debug!(correlation_id, "Discarded abandoned handshake");
        }
        discarded
    }

    pub fn contains(&self, correlation_id: u64) -> bool {
        self.pending.contains_key(&correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
