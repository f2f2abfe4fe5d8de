//! Client-side TLS stream orchestration.
//!
//! # Data Flow
//! ```text
//! Application Begin (source_ref != 0)
//!     → admission (default + specific route predicates)
//!     → accept.rs: mint network id + correlation id, create engine,
//!       register Handshake, Begin on the network stream
//! Network reply Begin (source_ref == 0, correlation id)
//!     → connect_reply.rs: claim Handshake, run the status loop
//!     → FINISHED + protocol check → Begin on the application-reply stream
//!
//! Steady state:
//!     application Transfer → wrap → network Transfer
//!     network reply Transfer → unwrap → application-reply Transfer
//!     acks travel back the other way at each hop
//! ```
//!
//! # Design Decisions
//! - The factory owns every stream; a stream is a tagged state enum, not a callback
//! - Acks are routed through a throttle table: outbound stream id → owning inbound stream id
//! - Every failure is turned into RST frames on the affected pair; `handle` never fails
//! - The correlation registry is injected, so several factories can share one

pub mod accept;
pub mod connect_reply;
pub mod connection;
pub mod handshake;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::memory::{MemoryError, MemoryManager, MAXIMUM_PAYLOAD_LENGTH};
use crate::observability::metrics;
use crate::routing::{DefaultRouteMatcher, Route, RouteRequest, RouteTable, SpecificRouteMatcher};
use crate::stream::{Ack, Begin, Flags, Frame, FrameSink, StreamId, StreamIds};
use crate::tls::{TlsEngineFactory, TlsError};

pub use accept::AcceptStream;
pub use connect_reply::ConnectReplyStream;
pub use connection::{Connection, ConnectionTracker};
pub use handshake::{Correlations, Handshake};

/// Namespace this proxy uses as the source of the streams it opens.
pub const SOURCE_NAME: &str = "tls";

/// Why a stream pair was torn down.
#[derive(Debug, Error)]
pub enum StreamFailure {
    #[error("engine construction failed: {0}")]
    EngineConstruction(TlsError),

    #[error("engine failure: {0}")]
    Engine(#[from] TlsError),

    #[error("payload budget exceeded: {0}")]
    Budget(MemoryError),

    #[error("memory failure: {0}")]
    Memory(MemoryError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("no pending handshake for correlation id {0}")]
    UnknownCorrelation(u64),

    #[error("negotiated protocol {negotiated:?} does not match route protocol {expected:?}")]
    ProtocolMismatch {
        negotiated: Option<String>,
        expected: Option<String>,
    },
}

impl From<MemoryError> for StreamFailure {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::BudgetExceeded { .. } => StreamFailure::Budget(err),
            other => StreamFailure::Memory(other),
        }
    }
}

impl StreamFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamFailure::EngineConstruction(_) => "engine_construction",
            StreamFailure::Engine(_) => "engine",
            StreamFailure::Budget(_) => "budget",
            StreamFailure::Memory(_) => "memory",
            StreamFailure::ProtocolViolation(_) => "protocol_violation",
            StreamFailure::UnknownCorrelation(_) => "unknown_correlation",
            StreamFailure::ProtocolMismatch { .. } => "protocol_mismatch",
        }
    }

    /// Log and count the failure.
    pub(crate) fn report(&self, stream_id: StreamId) {
        tracing::warn!(stream_id, kind = self.kind(), error = %self, "Stream failed");
        metrics::record_stream_failure(self.kind());
    }
}

/// Result of route resolution for an application Begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub route: Route,
    /// A protocol-agnostic route also matched.
    pub default_route: bool,
    /// Server name for SNI: the request value, else the route value.
    pub hostname: Option<String>,
    /// ALPN protocol to offer: the request value, else the route value.
    pub application_protocol: Option<String>,
}

impl Admission {
    pub fn route_label(&self) -> String {
        format!("{}->{}", self.route.source, self.route.target)
    }
}

/// Linear buffers shared by every stream of one factory.
#[derive(Debug)]
pub(crate) struct Scratch {
    /// Application plaintext gathered from regions before wrapping.
    pub(crate) staging: Vec<u8>,
    /// Unwrap destination.
    pub(crate) plaintext: Vec<u8>,
    /// Wrap destination.
    pub(crate) ciphertext: Vec<u8>,
}

impl Scratch {
    fn new(transfer_capacity: usize) -> Self {
        Self {
            staging: Vec::with_capacity(transfer_capacity),
            plaintext: vec![0; transfer_capacity],
            ciphertext: vec![0; transfer_capacity.min(MAXIMUM_PAYLOAD_LENGTH)],
        }
    }
}

/// Everything a stream needs while handling one frame.
pub(crate) struct Context<'a> {
    pub(crate) memory: &'a dyn MemoryManager,
    pub(crate) engines: &'a dyn TlsEngineFactory,
    pub(crate) ids: &'a StreamIds,
    pub(crate) correlations: &'a Correlations,
    pub(crate) tracker: &'a ConnectionTracker,
    pub(crate) transfer_capacity: usize,
    pub(crate) throttles: &'a mut HashMap<StreamId, StreamId>,
    pub(crate) scratch: &'a mut Scratch,
    pub(crate) sink: &'a mut dyn FrameSink,
}

struct Shared {
    memory: Arc<dyn MemoryManager>,
    engines: Arc<dyn TlsEngineFactory>,
    ids: Arc<StreamIds>,
    correlations: Correlations,
    tracker: ConnectionTracker,
    transfer_capacity: usize,
    throttles: HashMap<StreamId, StreamId>,
    scratch: Scratch,
}

impl Shared {
    fn context<'a>(&'a mut self, sink: &'a mut dyn FrameSink) -> Context<'a> {
        Context {
            memory: self.memory.as_ref(),
            engines: self.engines.as_ref(),
            ids: &self.ids,
            correlations: &self.correlations,
            tracker: &self.tracker,
            transfer_capacity: self.transfer_capacity,
            throttles: &mut self.throttles,
            scratch: &mut self.scratch,
            sink,
        }
    }
}

enum ClientStream {
    Accept(AcceptStream),
    ConnectReply(ConnectReplyStream),
}

impl ClientStream {
    fn is_closed(&self) -> bool {
        match self {
            ClientStream::Accept(stream) => stream.is_closed(),
            ClientStream::ConnectReply(stream) => stream.is_closed(),
        }
    }

    fn partner(&self) -> Option<StreamId> {
        match self {
            ClientStream::Accept(_) => None,
            ClientStream::ConnectReply(stream) => stream.accept_id(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ClientStream::Accept(_) => "accept",
            ClientStream::ConnectReply(_) => "connect_reply",
        }
    }
}

/// Entry point for every frame addressed to this proxy.
pub struct ClientStreamFactory {
    routes: Arc<dyn RouteTable>,
    streams: HashMap<StreamId, ClientStream>,
    shared: Shared,
}

impl ClientStreamFactory {
    pub fn new(
        routes: Arc<dyn RouteTable>,
        engines: Arc<dyn TlsEngineFactory>,
        memory: Arc<dyn MemoryManager>,
        transfer_capacity: usize,
    ) -> Self {
        Self {
            routes,
            streams: HashMap::new(),
            shared: Shared {
                memory,
                engines,
                ids: Arc::new(StreamIds::new()),
                correlations: Correlations::new(),
                tracker: ConnectionTracker::new(),
                transfer_capacity,
                throttles: HashMap::new(),
                scratch: Scratch::new(transfer_capacity),
            },
        }
    }

    /// Share id supply and correlation registry with other factories.
    pub fn with_shared(mut self, ids: Arc<StreamIds>, correlations: Correlations) -> Self {
        self.shared.ids = ids;
        self.shared.correlations = correlations;
        self
    }

    pub fn with_tracker(mut self, tracker: ConnectionTracker) -> Self {
        self.shared.tracker = tracker;
        self
    }

    pub fn correlations(&self) -> &Correlations {
        &self.shared.correlations
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.shared.tracker
    }

    /// Number of live stream state machines.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Resolve the route for an application Begin. Specific routes win;
    /// whether a default route matched is kept for the protocol check.
    pub fn admit(&self, begin: &Begin) -> Option<Admission> {
        let request = RouteRequest::from_begin(begin);
        let default = self
            .routes
            .resolve(begin.authorization, &DefaultRouteMatcher::new(&request));
        let specific = self
            .routes
            .resolve(begin.authorization, &SpecificRouteMatcher::new(&request));

        let default_route = default.is_some();
        let route = specific.or(default)?;
        let hostname = request
            .hostname
            .or_else(|| route.extension.hostname.clone());
        let application_protocol = request
            .application_protocol
            .or_else(|| route.extension.application_protocol.clone());

        Some(Admission {
            route,
            default_route,
            hostname,
            application_protocol,
        })
    }

    /// Process one inbound frame, emitting any resulting frames to `sink`.
    pub fn handle(&mut self, frame: Frame, sink: &mut dyn FrameSink) {
        let stream_id = frame.stream_id();
        tracing::trace!(stream_id, kind = frame.kind(), "Frame received");

        match frame {
            Frame::Begin(begin) => self.on_begin(begin, sink),
            Frame::Transfer(transfer) => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    tracing::trace!(stream_id, "Transfer for unknown stream ignored");
                    return;
                };
                let mut ctx = self.shared.context(sink);
                match stream {
                    ClientStream::Accept(stream) => stream.on_transfer(transfer, &mut ctx),
                    ClientStream::ConnectReply(stream) => stream.on_transfer(transfer, &mut ctx),
                }
                let partner = stream.partner();
                self.reap(stream_id);
                self.reap_partner(partner);
            }
            Frame::Ack(ack) => {
                let Some(&owner) = self.shared.throttles.get(&stream_id) else {
                    tracing::trace!(stream_id, "Ack for unknown stream ignored");
                    return;
                };
                let Some(stream) = self.streams.get_mut(&owner) else {
                    return;
                };
                let mut ctx = self.shared.context(sink);
                match stream {
                    ClientStream::Accept(stream) => stream.on_ack(ack, &mut ctx),
                    ClientStream::ConnectReply(stream) => stream.on_ack(ack, &mut ctx),
                }
                let partner = stream.partner();
                self.reap(owner);
                self.reap_partner(partner);
            }
        }
    }

    fn on_begin(&mut self, begin: Begin, sink: &mut dyn FrameSink) {
        let stream_id = begin.stream_id;
        if self.streams.contains_key(&stream_id) {
            tracing::warn!(stream_id, source = %begin.source, "Duplicate begin rejected");
            sink.send(
                &begin.source,
                Frame::Ack(Ack {
                    stream_id,
                    flags: Flags::RST,
                    regions: Vec::new(),
                }),
            );
            return;
        }

        let stream = if begin.source_ref == 0 {
            let mut ctx = self.shared.context(sink);
            ClientStream::ConnectReply(ConnectReplyStream::begin(begin, &mut ctx))
        } else {
            let Some(admission) = self.admit(&begin) else {
                tracing::debug!(
                    stream_id,
                    source = %begin.source,
                    source_ref = begin.source_ref,
                    "No route, stream refused"
                );
                metrics::record_stream("refused");
                return;
            };
            tracing::debug!(stream_id, route = %admission.route_label(), "Stream admitted");
            metrics::record_stream("admitted");
            let mut ctx = self.shared.context(sink);
            ClientStream::Accept(AcceptStream::begin(begin, admission, &mut ctx))
        };

        let partner = stream.partner();
        if stream.is_closed() {
            self.shared.throttles.retain(|_, owner| *owner != stream_id);
        } else {
            self.streams.insert(stream_id, stream);
        }
        self.reap_partner(partner);
    }

    /// A reply stream failure can leave its accept stream with both ends closed.
    fn reap_partner(&mut self, partner: Option<StreamId>) {
        if let Some(partner) = partner {
            self.reap(partner);
        }
    }

    /// Drop a stream once it has reached its terminal state.
    fn reap(&mut self, stream_id: StreamId) {
        let closed = self
            .streams
            .get(&stream_id)
            .is_some_and(ClientStream::is_closed);
        if closed {
            if let Some(stream) = self.streams.remove(&stream_id) {
                tracing::debug!(stream_id, kind = stream.kind(), "Stream closed");
            }
            self.shared.throttles.retain(|_, owner| *owner != stream_id);
        }
    }
}

impl std::fmt::Debug for ClientStreamFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStreamFactory")
            .field("streams", &self.streams.len())
            .field("throttles", &self.shared.throttles.len())
            .field("pending_handshakes", &self.shared.correlations.len())
            .field("transfer_capacity", &self.shared.transfer_capacity)
            .finish()
    }
}
