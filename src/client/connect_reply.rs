//! Connect-reply stream: TLS records in, application plaintext out.
//!
//! # Responsibilities
//! - Claim the pending handshake named by the reply's correlation id
//! - Drive the handshake status loop until FINISHED, then check ALPN against routing
//! - Decrypt network payload and forward it on the application-reply stream
//! - Propagate FIN, RST and credit between the two reply streams
//!
//! # Data Flow
//! ```text
//! network reply Transfer(regions)
//!     → copy into the inbound staging buffer, hold the regions
//!     → unwrap while input remains and the pending buffer has room
//!         → status loop after every unwrap (NEED_TASK / NEED_WRAP / FINISHED)
//!     → pending plaintext → application-reply Transfer, bounded by max_payload_size
//!     → ack held regions while staging has room for their bytes again
//! application-reply Ack(regions)
//!     → release our plaintext regions, resume flushing and unwrapping
//! ```
//!
//! # Design Decisions
//! - The status loop re-queries the engine after every step and is safe to re-enter
//! - A protocol mismatch after FINISHED tears the whole pair down
//! - Plaintext that cannot be forwarded yet stays in a per-stream pending buffer
//! - Credit outstanding to the network peer never exceeds free staging space,
//!   so only a peer that sends past its credit overflows the staging buffer

use std::collections::VecDeque;
use std::sync::Arc;

use crate::client::connection::Connection;
use crate::client::{Context, Handshake, StreamFailure, SOURCE_NAME};
use crate::memory::{pack_regions, release_owned, MemoryError};
use crate::observability::metrics;
use crate::stream::{Ack, Begin, Flags, Frame, Region, StreamId, TlsBeginEx, Transfer};
use crate::tls::HandshakeStatus;

/// The application-reply stream opened after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ApplicationReply {
    id: StreamId,
    target: String,
    authorization: u64,
}

impl ApplicationReply {
    fn send(&self, ctx: &mut Context<'_>, flags: Flags, regions: Vec<Region>) {
        ctx.sink.send(
            &self.target,
            Frame::Transfer(Transfer {
                stream_id: self.id,
                authorization: self.authorization,
                flags,
                regions,
            }),
        );
    }
}

#[derive(Debug)]
enum Phase {
    Handshaking,
    Established(ApplicationReply),
}

/// What the stream should become after handling a frame.
#[derive(Debug)]
enum Flow {
    Open,
    /// The application-reply stream was ended; wait for its final ack.
    Ended(ApplicationReply),
    Closed,
}

#[derive(Debug)]
enum ReplyState {
    BeforeHandshake,
    Active(Box<Session>),
    Ending(ApplicationReply),
    Closed,
}

#[derive(Debug)]
pub struct ConnectReplyStream {
    id: StreamId,
    source: String,
    /// Application stream of the claimed connection.
    accept_id: Option<StreamId>,
    state: ReplyState,
}

#[derive(Debug)]
struct Session {
    id: StreamId,
    source: String,
    connection: Arc<Connection>,
    application_protocol: Option<String>,
    default_route: bool,
    application_correlation_id: u64,
    phase: Phase,
    /// Ciphertext not yet consumed by the engine.
    inbound: Vec<u8>,
    /// Network regions whose credit is withheld, oldest first.
    held: VecDeque<Region>,
    /// Bytes credited back to the peer and not yet received again.
    credited: usize,
    /// Plaintext waiting for application-reply credit.
    pending: Vec<u8>,
    network_ended: bool,
}

fn ack(ctx: &mut Context<'_>, target: &str, stream_id: StreamId, flags: Flags, regions: Vec<Region>) {
    ctx.sink.send(
        target,
        Frame::Ack(Ack {
            stream_id,
            flags,
            regions,
        }),
    );
}

impl ConnectReplyStream {
    /// Handle the network reply Begin.
    pub(crate) fn begin(begin: Begin, ctx: &mut Context<'_>) -> Self {
        let mut stream = Self {
            id: begin.stream_id,
            source: begin.source.clone(),
            accept_id: None,
            state: ReplyState::BeforeHandshake,
        };
        stream.on_begin(begin, ctx);
        stream
    }

    fn on_begin(&mut self, begin: Begin, ctx: &mut Context<'_>) {
        if begin.source_ref != 0 {
            StreamFailure::ProtocolViolation("reply stream with non-zero source_ref").report(self.id);
            ack(ctx, &self.source, self.id, Flags::RST, Vec::new());
            self.state = ReplyState::Closed;
            return;
        }

        let Some(handshake) = ctx.correlations.claim(begin.correlation_id) else {
            StreamFailure::UnknownCorrelation(begin.correlation_id).report(self.id);
            metrics::record_handshake("unknown_correlation");
            ack(ctx, &self.source, self.id, Flags::RST, Vec::new());
            self.state = ReplyState::Closed;
            return;
        };

        tracing::debug!(
            stream_id = self.id,
            connection_id = %handshake.connection.id(),
            correlation_id = handshake.correlation_id,
            "Handshake claimed"
        );
        self.accept_id = Some(handshake.connection.application().id);
        let mut session = Box::new(Session::new(self.id, self.source.clone(), handshake));
        let outcome = session.advance(ctx).map(|()| Flow::Open);
        self.state = ReplyState::Active(session);
        self.apply(outcome, ctx);
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReplyState::Closed)
    }

    /// Accept stream sharing our connection, once the handshake is claimed.
    pub fn accept_id(&self) -> Option<StreamId> {
        self.accept_id
    }

    pub fn is_established(&self) -> bool {
        match &self.state {
            ReplyState::Active(session) => matches!(session.phase, Phase::Established(_)),
            ReplyState::Ending(_) => true,
            _ => false,
        }
    }

    /// Network reply payload, FIN or RST.
    pub(crate) fn on_transfer(&mut self, transfer: Transfer, ctx: &mut Context<'_>) {
        match &mut self.state {
            ReplyState::Active(session) => {
                let outcome = if transfer.flags.is_reset() {
                    Ok(session.on_network_reset(ctx))
                } else {
                    let mut outcome = if transfer.regions.is_empty() {
                        Ok(Flow::Open)
                    } else {
                        session.on_data(transfer.regions, ctx)
                    };
                    if transfer.flags.is_fin() && matches!(outcome, Ok(Flow::Open)) {
                        outcome = session.on_network_end(ctx);
                    }
                    outcome
                };
                self.apply(outcome, ctx);
            }
            ReplyState::Ending(_) => {
                // Inbound is done; return credit for anything still arriving.
                if !transfer.regions.is_empty() {
                    ack(ctx, &self.source, self.id, Flags::EMPTY, transfer.regions);
                }
            }
            ReplyState::BeforeHandshake | ReplyState::Closed => {
                tracing::trace!(stream_id = self.id, "Transfer on closed reply stream ignored");
            }
        }
    }

    /// Ack on the application-reply stream.
    pub(crate) fn on_ack(&mut self, ack_frame: Ack, ctx: &mut Context<'_>) {
        match &mut self.state {
            ReplyState::Active(session) => {
                let outcome = session.on_reply_ack(ack_frame, ctx);
                self.apply(outcome, ctx);
            }
            ReplyState::Ending(reply) => {
                release_owned(ctx.memory, reply.id, ack_frame.regions);
                if ack_frame.flags.is_fin() {
                    ack(ctx, &self.source, self.id, Flags::FIN, Vec::new());
                    self.state = ReplyState::Closed;
                } else if ack_frame.flags.is_reset() {
                    ack(ctx, &self.source, self.id, Flags::RST, Vec::new());
                    self.state = ReplyState::Closed;
                }
            }
            ReplyState::BeforeHandshake | ReplyState::Closed => {}
        }
    }

    fn apply(&mut self, outcome: Result<Flow, StreamFailure>, ctx: &mut Context<'_>) {
        let ReplyState::Active(session) = &mut self.state else {
            return;
        };
        match outcome {
            Ok(Flow::Open) => {}
            Ok(Flow::Ended(reply)) => self.state = ReplyState::Ending(reply),
            Ok(Flow::Closed) => self.state = ReplyState::Closed,
            Err(failure) => {
                session.fail(failure, ctx);
                self.state = ReplyState::Closed;
            }
        }
    }
}

impl Session {
    fn new(id: StreamId, source: String, handshake: Handshake) -> Self {
        Self {
            id,
            source,
            connection: handshake.connection,
            application_protocol: handshake.application_protocol,
            default_route: handshake.default_route,
            application_correlation_id: handshake.application_correlation_id,
            phase: Phase::Handshaking,
            inbound: Vec::new(),
            held: VecDeque::new(),
            credited: 0,
            pending: Vec::new(),
            network_ended: false,
        }
    }

    /// Handshake status loop. Runs until the engine waits for input.
    fn advance(&mut self, ctx: &mut Context<'_>) -> Result<(), StreamFailure> {
        loop {
            let status = self.connection.engine().handshake_status();
            tracing::trace!(stream_id = self.id, status = %status, "Handshake status");
            match status {
                HandshakeStatus::NeedTask => {
                    if !self.run_delegated_tasks() {
                        break;
                    }
                }
                HandshakeStatus::NeedWrap => {
                    if !self.wrap_handshake(ctx)? {
                        break;
                    }
                }
                HandshakeStatus::Finished => {
                    if let Phase::Established(_) = self.phase {
                        break;
                    }
                    self.finish_handshake(ctx)?;
                }
                HandshakeStatus::NeedUnwrap | HandshakeStatus::NotHandshaking => break,
            }
        }
        Ok(())
    }

    /// Returns false when the engine had nothing to run.
    fn run_delegated_tasks(&self) -> bool {
        let mut ran = 0;
        loop {
            let task = self.connection.engine().delegated_task();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        tracing::trace!(stream_id = self.id, tasks = ran, "Ran delegated tasks");
        ran > 0
    }

    /// Send handshake or close bytes on the network stream.
    fn wrap_handshake(&mut self, ctx: &mut Context<'_>) -> Result<bool, StreamFailure> {
        let (result, outbound_done) = {
            let mut engine = self.connection.engine();
            let result = engine.wrap(&[], &mut ctx.scratch.ciphertext)?;
            (result, engine.is_outbound_done())
        };

        if result.produced > 0 {
            let network_id = self.connection.network().id;
            let packed = pack_regions(
                ctx.memory,
                network_id,
                &ctx.scratch.ciphertext[..result.produced],
                &[],
            )?;
            if !self.connection.network_transfer(ctx.sink, packed.clone()) {
                release_owned(ctx.memory, network_id, packed);
            }
        }
        if outbound_done {
            self.connection.end_network(ctx.sink);
        }
        Ok(result.produced > 0)
    }

    /// FINISHED: check the negotiated protocol, then open the application reply.
    fn finish_handshake(&mut self, ctx: &mut Context<'_>) -> Result<(), StreamFailure> {
        let (negotiated, peer_host) = {
            let engine = self.connection.engine();
            (engine.application_protocol(), engine.peer_host())
        };
        let agrees = negotiated == self.application_protocol
            || (negotiated.is_none() && self.default_route);
        if !agrees {
            metrics::record_handshake("protocol_mismatch");
            return Err(StreamFailure::ProtocolMismatch {
                negotiated,
                expected: self.application_protocol.clone(),
            });
        }
        if self.connection.is_application_closed() {
            return Err(StreamFailure::ProtocolViolation(
                "application stream closed during handshake",
            ));
        }

        let application = self.connection.application();
        let reply = ApplicationReply {
            id: ctx.ids.next_stream_id(),
            target: application.source.clone(),
            authorization: application.authorization,
        };
        ctx.sink.send(
            &reply.target,
            Frame::Begin(Begin {
                stream_id: reply.id,
                source: SOURCE_NAME.to_string(),
                source_ref: 0,
                correlation_id: self.application_correlation_id,
                authorization: reply.authorization,
                extension: Some(TlsBeginEx {
                    hostname: peer_host,
                    application_protocol: negotiated.clone(),
                }),
            }),
        );
        ctx.throttles.insert(reply.id, self.id);

        metrics::record_handshake("finished");
        tracing::info!(
            connection_id = %self.connection.id(),
            stream_id = self.id,
            reply_id = reply.id,
            protocol = ?negotiated,
            "Handshake finished"
        );
        self.phase = Phase::Established(reply);
        Ok(())
    }

    fn on_data(&mut self, regions: Vec<Region>, ctx: &mut Context<'_>) -> Result<Flow, StreamFailure> {
        let before = self.inbound.len();
        for region in &regions {
            ctx.memory.read(region, &mut self.inbound)?;
        }
        let received = self.inbound.len() - before;
        self.credited = self.credited.saturating_sub(received);
        self.held.extend(regions);

        if self.inbound.len() > ctx.transfer_capacity {
            return Err(StreamFailure::ProtocolViolation(
                "network payload exceeds granted credit",
            ));
        }
        metrics::record_frame(self.connection.route(), "network_in", received);
        self.pump(ctx)
    }

    /// Unwrap and flush until neither makes progress.
    fn pump(&mut self, ctx: &mut Context<'_>) -> Result<Flow, StreamFailure> {
        loop {
            self.flush(ctx)?;
            if !self.unwrap_once(ctx)? {
                break;
            }
        }
        self.flush(ctx)?;

        if self.network_ended && self.inbound.is_empty() {
            let closed = {
                let mut engine = self.connection.engine();
                if engine.is_inbound_done() {
                    Ok(())
                } else {
                    engine.close_inbound()
                }
            };
            closed?;
        }

        let inbound_done = self.connection.engine().is_inbound_done();
        if inbound_done {
            return self.finish_inbound(ctx);
        }
        // With room left in pending the engine is waiting for input, so it
        // gets all the credit it needs to complete a record.
        let limit = if self.pending.len() < ctx.transfer_capacity {
            usize::MAX
        } else {
            ctx.transfer_capacity
        };
        self.release_credit(ctx, limit);
        Ok(Flow::Open)
    }

    /// Ack held network regions, oldest first, while the staged bytes plus
    /// the outstanding credit stay within `limit`.
    fn release_credit(&mut self, ctx: &mut Context<'_>, limit: usize) {
        let mut regions = Vec::new();
        while let Some(region) = self.held.pop_front() {
            let committed = self.inbound.len() + self.credited;
            if committed.saturating_add(region.length) > limit {
                self.held.push_front(region);
                break;
            }
            self.credited += region.length;
            regions.push(region);
        }
        if !regions.is_empty() {
            ack(ctx, &self.source, self.id, Flags::EMPTY, regions);
        }
    }

    fn unwrap_once(&mut self, ctx: &mut Context<'_>) -> Result<bool, StreamFailure> {
        let room = ctx
            .transfer_capacity
            .saturating_sub(self.pending.len())
            .min(ctx.scratch.plaintext.len());
        if self.inbound.is_empty() || room == 0 {
            return Ok(false);
        }

        let result = {
            let mut engine = self.connection.engine();
            if engine.is_inbound_done() {
                return Ok(false);
            }
            engine.unwrap(&self.inbound, &mut ctx.scratch.plaintext[..room])?
        };
        self.inbound.drain(..result.consumed);
        self.pending
            .extend_from_slice(&ctx.scratch.plaintext[..result.produced]);

        self.advance(ctx)?;
        Ok(result.made_progress())
    }

    /// Forward pending plaintext while the arena has room.
    fn flush(&mut self, ctx: &mut Context<'_>) -> Result<(), StreamFailure> {
        let Phase::Established(reply) = &self.phase else {
            return Ok(());
        };

        while !self.pending.is_empty() {
            let chunk = self.pending.len().min(ctx.memory.max_payload_size(&[]));
            if chunk == 0 {
                tracing::trace!(stream_id = self.id, pending = self.pending.len(), "Flush paused");
                break;
            }
            let regions = match pack_regions(ctx.memory, reply.id, &self.pending[..chunk], &[]) {
                Ok(regions) => regions,
                Err(MemoryError::OutOfMemory { .. }) => break,
                Err(err) => return Err(err.into()),
            };
            metrics::record_frame(self.connection.route(), "application_out", chunk);
            reply.send(ctx, Flags::EMPTY, regions);
            self.pending.drain(..chunk);
        }
        Ok(())
    }

    /// Inbound is done: end the application reply once pending data is out.
    fn finish_inbound(&mut self, ctx: &mut Context<'_>) -> Result<Flow, StreamFailure> {
        if let Phase::Handshaking = self.phase {
            return Err(StreamFailure::ProtocolViolation(
                "network reply closed during handshake",
            ));
        }
        // The engine reads no more input, so every held region goes back.
        self.release_credit(ctx, usize::MAX);

        let Phase::Established(reply) = &self.phase else {
            return Ok(Flow::Open);
        };
        if !self.pending.is_empty() {
            return Ok(Flow::Open);
        }
        tracing::debug!(stream_id = self.id, reply_id = reply.id, "Application reply ended");
        reply.send(ctx, Flags::FIN, Vec::new());
        Ok(Flow::Ended(reply.clone()))
    }

    fn on_network_end(&mut self, ctx: &mut Context<'_>) -> Result<Flow, StreamFailure> {
        self.network_ended = true;
        if let Phase::Handshaking = self.phase {
            return Err(StreamFailure::ProtocolViolation(
                "network reply ended during handshake",
            ));
        }
        self.pump(ctx)
    }

    fn on_network_reset(&mut self, ctx: &mut Context<'_>) -> Flow {
        tracing::debug!(stream_id = self.id, "Network reply reset by peer");
        let _ = self.connection.engine().close_inbound();
        match &self.phase {
            Phase::Handshaking => {
                self.connection.reset_application(ctx.sink);
                self.connection.abort_network(ctx.sink);
            }
            Phase::Established(reply) => reply.send(ctx, Flags::RST, Vec::new()),
        }
        Flow::Closed
    }

    fn on_reply_ack(&mut self, ack_frame: Ack, ctx: &mut Context<'_>) -> Result<Flow, StreamFailure> {
        let Phase::Established(reply) = &self.phase else {
            return Ok(Flow::Open);
        };
        release_owned(ctx.memory, reply.id, ack_frame.regions);

        if ack_frame.flags.is_reset() {
            tracing::debug!(stream_id = self.id, reply_id = reply.id, "Application reply reset");
            let _ = self.connection.engine().close_inbound();
            let held = self.held.drain(..).collect();
            ack(ctx, &self.source, self.id, Flags::RST, held);
            return Ok(Flow::Closed);
        }

        let flow = self.pump(ctx)?;
        if ack_frame.flags.is_fin() {
            ack(ctx, &self.source, self.id, Flags::FIN, Vec::new());
            return Ok(Flow::Closed);
        }
        Ok(flow)
    }

    fn fail(&mut self, failure: StreamFailure, ctx: &mut Context<'_>) {
        failure.report(self.id);
        let handshaking = matches!(self.phase, Phase::Handshaking);
        if handshaking && !matches!(failure, StreamFailure::ProtocolMismatch { .. }) {
            metrics::record_handshake("failed");
        }
        let held = self.held.drain(..).collect();
        ack(ctx, &self.source, self.id, Flags::RST, held);
        match &self.phase {
            Phase::Handshaking => {
                self.connection.engine().close_outbound();
                self.connection.reset_application(ctx.sink);
                self.connection.abort_network(ctx.sink);
            }
            Phase::Established(reply) => reply.send(ctx, Flags::RST, Vec::new()),
        }
        self.pending.clear();
    }
}
