//! Shared connection record and lifecycle tracking.
//!
//! # Responsibilities
//! - Own the TLS engine shared by the accept and connect-reply streams
//! - Emit frames on the network stream and acks on the application stream
//! - Make every terminal signal (FIN, RST, RST ack) happen at most once
//! - Count live connections for the active-connections gauge
//!
//! # Design Decisions
//! - One `Arc<Connection>` per accepted stream, held by the accept stream,
//!   the pending handshake and later the connect-reply stream
//! - The engine sits behind a mutex only so the record is `Sync`; frames for
//!   one connection are handled one at a time
//! - Terminal flags are atomics so either side can close without coordination

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::observability::metrics;
use crate::stream::{Ack, Flags, Frame, FrameSink, Region, StreamId, Transfer};
use crate::tls::TlsEngine;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_active_connections(count);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_active_connections(count);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// The outbound network stream opened by the accept stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEnd {
    pub target: String,
    pub id: StreamId,
    pub authorization: u64,
}

/// The application stream the accept stream was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationEnd {
    pub source: String,
    pub id: StreamId,
    pub authorization: u64,
}

pub struct Connection {
    engine: Mutex<Box<dyn TlsEngine>>,
    network: NetworkEnd,
    application: ApplicationEnd,
    route: String,
    network_closed: AtomicBool,
    application_closed: AtomicBool,
    guard: ConnectionGuard,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.guard.id())
            .field("network", &self.network)
            .field("application", &self.application)
            .field("route", &self.route)
            .field("network_closed", &self.is_network_closed())
            .field("application_closed", &self.is_application_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(
        engine: Box<dyn TlsEngine>,
        network: NetworkEnd,
        application: ApplicationEnd,
        route: String,
        guard: ConnectionGuard,
    ) -> Self {
        Self {
            engine: Mutex::new(engine),
            network,
            application,
            route,
            network_closed: AtomicBool::new(false),
            application_closed: AtomicBool::new(false),
            guard,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    /// Lock the engine. Never hold the guard across another `engine()` call.
    pub fn engine(&self) -> MutexGuard<'_, Box<dyn TlsEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn network(&self) -> &NetworkEnd {
        &self.network
    }

    pub fn application(&self) -> &ApplicationEnd {
        &self.application
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn is_network_closed(&self) -> bool {
        self.network_closed.load(Ordering::Acquire)
    }

    pub fn is_application_closed(&self) -> bool {
        self.application_closed.load(Ordering::Acquire)
    }

    /// Send a payload transfer on the network stream unless it is closed.
    pub fn network_transfer(&self, sink: &mut dyn FrameSink, regions: Vec<Region>) -> bool {
        if self.is_network_closed() {
            return false;
        }
        self.send_network(sink, Flags::EMPTY, regions);
        true
    }

    /// Finish the network stream. Returns false if it was already closed.
    pub fn end_network(&self, sink: &mut dyn FrameSink) -> bool {
        if self.network_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(connection_id = %self.id(), network_id = self.network.id, "Network stream ended");
        self.send_network(sink, Flags::FIN, Vec::new());
        true
    }

    /// Reset the network stream. Returns false if it was already closed.
    pub fn abort_network(&self, sink: &mut dyn FrameSink) -> bool {
        if self.network_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(connection_id = %self.id(), network_id = self.network.id, "Network stream reset");
        self.send_network(sink, Flags::RST, Vec::new());
        true
    }

    /// The peer reset the network stream; nothing more may be sent on it.
    pub fn network_reset_by_peer(&self) {
        self.network_closed.store(true, Ordering::Release);
    }

    /// Return credit (or FIN) to the application unless it is closed.
    pub fn application_ack(&self, sink: &mut dyn FrameSink, flags: Flags, regions: Vec<Region>) -> bool {
        if self.is_application_closed() {
            return false;
        }
        if flags.is_fin() {
            self.application_closed.store(true, Ordering::Release);
        }
        self.send_application_ack(sink, flags, regions);
        true
    }

    /// Reset the application stream. Returns false if it was already closed.
    pub fn reset_application(&self, sink: &mut dyn FrameSink) -> bool {
        if self.application_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(connection_id = %self.id(), stream_id = self.application.id, "Application stream reset");
        self.send_application_ack(sink, Flags::RST, Vec::new());
        true
    }

    /// The application reset its own stream; no acks follow.
    pub fn application_reset_by_peer(&self) {
        self.application_closed.store(true, Ordering::Release);
    }

    fn send_network(&self, sink: &mut dyn FrameSink, flags: Flags, regions: Vec<Region>) {
        let bytes = regions
            .iter()
            .filter(|region| region.stream_id == self.network.id)
            .map(|region| region.length)
            .sum();
        metrics::record_frame(&self.route, "network_out", bytes);
        tracing::trace!(
            network_id = self.network.id,
            flags = %flags,
            regions = regions.len(),
            bytes,
            "Network transfer"
        );
        sink.send(
            &self.network.target,
            Frame::Transfer(Transfer {
                stream_id: self.network.id,
                authorization: self.network.authorization,
                flags,
                regions,
            }),
        );
    }

    fn send_application_ack(&self, sink: &mut dyn FrameSink, flags: Flags, regions: Vec<Region>) {
        sink.send(
            &self.application.source,
            Frame::Ack(Ack {
                stream_id: self.application.id,
                flags,
                regions,
            }),
        );
    }
}
