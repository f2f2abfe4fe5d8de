//! Accept stream: application plaintext in, TLS records out.
//!
//! # Responsibilities
//! - Open the network stream and register the pending handshake on Begin
//! - Encrypt application payload into network transfers within the payload budget
//! - Turn application FIN into a TLS close and application RST into a network reset
//! - Release our record regions on network acks and pass the rest to the application
//!
//! # Data Flow
//! ```text
//! application Transfer(regions)
//!     → copy regions into the staging buffer
//!     → wrap until the plaintext is consumed and no record bytes are queued
//!     → pack ciphertext (+ application regions on the last chunk)
//!     → network Transfer
//! network Ack(regions, flags)
//!     → release regions owned by the network stream
//!     → application Ack(remaining regions, flags)
//! ```

use std::sync::Arc;

use crate::client::connection::{ApplicationEnd, Connection, NetworkEnd};
use crate::client::{Admission, Context, Handshake, StreamFailure, SOURCE_NAME};
use crate::memory::{pack_regions, release_owned, MemoryError};
use crate::observability::metrics;
use crate::stream::{Ack, Begin, Flags, Frame, Region, StreamId, Transfer};

#[derive(Debug)]
enum AcceptState {
    Open(Arc<Connection>),
    /// Application finished; waiting for the network to acknowledge our FIN.
    Ending(Arc<Connection>),
    Closed,
}

#[derive(Debug)]
pub struct AcceptStream {
    id: StreamId,
    correlation_id: u64,
    state: AcceptState,
}

impl AcceptStream {
    /// Handle the application Begin for an admitted route.
    pub(crate) fn begin(begin: Begin, admission: Admission, ctx: &mut Context<'_>) -> Self {
        let network_id = ctx.ids.next_stream_id();
        let correlation_id = ctx.ids.next_correlation_id();
        let mut stream = Self {
            id: begin.stream_id,
            correlation_id,
            state: AcceptState::Closed,
        };

        let engine = match ctx.engines.new_client_engine(
            admission.hostname.as_deref(),
            admission.application_protocol.as_deref(),
        ) {
            Ok(engine) => engine,
            Err(err) => {
                StreamFailure::EngineConstruction(err).report(begin.stream_id);
                ctx.sink.send(
                    &begin.source,
                    Frame::Ack(Ack {
                        stream_id: begin.stream_id,
                        flags: Flags::RST,
                        regions: Vec::new(),
                    }),
                );
                return stream;
            }
        };

        let route = &admission.route;
        let connection = Arc::new(Connection::new(
            engine,
            NetworkEnd {
                target: route.target.clone(),
                id: network_id,
                authorization: begin.authorization,
            },
            ApplicationEnd {
                source: begin.source.clone(),
                id: begin.stream_id,
                authorization: begin.authorization,
            },
            admission.route_label(),
            ctx.tracker.track(),
        ));

        ctx.correlations.register(Handshake {
            correlation_id,
            connection: Arc::clone(&connection),
            application_protocol: admission.application_protocol.clone(),
            default_route: admission.default_route,
            application_correlation_id: begin.correlation_id,
        });

        ctx.sink.send(
            &route.target,
            Frame::Begin(Begin {
                stream_id: network_id,
                source: SOURCE_NAME.to_string(),
                source_ref: route.target_ref,
                correlation_id,
                authorization: begin.authorization,
                extension: None,
            }),
        );
        ctx.throttles.insert(network_id, begin.stream_id);

        tracing::debug!(
            connection_id = %connection.id(),
            stream_id = begin.stream_id,
            network_id,
            correlation_id,
            hostname = ?admission.hostname,
            protocol = ?admission.application_protocol,
            "Network stream opened"
        );

        let started = connection.engine().begin_handshake();
        match started {
            Ok(()) => stream.state = AcceptState::Open(connection),
            Err(err) => stream.fail(&connection, err.into(), ctx),
        }
        stream
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Closed by us, or both ends were torn down from the reply side.
    pub fn is_closed(&self) -> bool {
        match &self.state {
            AcceptState::Open(connection) | AcceptState::Ending(connection) => {
                connection.is_network_closed() && connection.is_application_closed()
            }
            AcceptState::Closed => true,
        }
    }

    /// Application payload, FIN or RST.
    pub(crate) fn on_transfer(&mut self, transfer: Transfer, ctx: &mut Context<'_>) {
        let AcceptState::Open(connection) = &self.state else {
            tracing::trace!(stream_id = self.id, "Transfer after end of stream ignored");
            return;
        };
        let connection = Arc::clone(connection);

        if transfer.flags.is_reset() {
            self.on_reset(&connection, ctx);
            return;
        }

        if !transfer.regions.is_empty() {
            if let Err(failure) = self.on_payload(&connection, &transfer.regions, ctx) {
                self.fail(&connection, failure, ctx);
                return;
            }
        }

        if transfer.flags.is_fin() {
            self.on_end(&connection, ctx);
        }
    }

    fn on_payload(
        &mut self,
        connection: &Connection,
        regions: &[Region],
        ctx: &mut Context<'_>,
    ) -> Result<(), StreamFailure> {
        let staging = &mut ctx.scratch.staging;
        staging.clear();
        for region in regions {
            ctx.memory.read(region, staging)?;
        }
        if staging.len() > ctx.transfer_capacity {
            return Err(StreamFailure::ProtocolViolation(
                "application payload exceeds transfer capacity",
            ));
        }
        metrics::record_frame(connection.route(), "application_in", staging.len());

        let network_id = connection.network().id;
        let mut offset = 0;
        let mut forwarded = false;
        loop {
            let result = {
                let mut engine = connection.engine();
                if engine.is_outbound_done() || (offset == staging.len() && !engine.wants_wrap()) {
                    break;
                }
                engine.wrap(&staging[offset..], &mut ctx.scratch.ciphertext)?
            };
            offset += result.consumed;

            if result.produced > 0 {
                // Every chunk is sized against the regions it was wrapped from.
                let budget = ctx.memory.max_payload_size(regions);
                if result.produced > budget {
                    return Err(MemoryError::BudgetExceeded {
                        produced: result.produced,
                        budget,
                    }
                    .into());
                }
                let last = offset == staging.len() && !forwarded;
                let source = if last { regions } else { &[] };
                let packed = pack_regions(
                    ctx.memory,
                    network_id,
                    &ctx.scratch.ciphertext[..result.produced],
                    source,
                )?;
                if !connection.network_transfer(ctx.sink, packed.clone()) {
                    release_owned(ctx.memory, network_id, packed);
                    return Err(StreamFailure::ProtocolViolation("network stream already closed"));
                }
                forwarded |= last;
            }

            if !result.made_progress() {
                break;
            }
        }

        if offset < staging.len() {
            return Err(StreamFailure::ProtocolViolation(
                "engine did not accept application payload",
            ));
        }
        if !forwarded {
            connection.application_ack(ctx.sink, Flags::EMPTY, regions.to_vec());
        }
        Ok(())
    }

    /// Application FIN: close_notify, flush, then FIN the network stream.
    fn on_end(&mut self, connection: &Arc<Connection>, ctx: &mut Context<'_>) {
        match self.flush_close(connection, ctx) {
            Ok(()) => {
                connection.end_network(ctx.sink);
                self.state = AcceptState::Ending(Arc::clone(connection));
            }
            Err(failure) => {
                failure.report(self.id);
                connection.abort_network(ctx.sink);
                self.close(ctx);
            }
        }
    }

    fn flush_close(&mut self, connection: &Connection, ctx: &mut Context<'_>) -> Result<(), StreamFailure> {
        connection.engine().close_outbound();
        let network_id = connection.network().id;
        loop {
            let result = {
                let mut engine = connection.engine();
                if engine.is_outbound_done() {
                    break;
                }
                engine.wrap(&[], &mut ctx.scratch.ciphertext)?
            };
            if result.produced == 0 {
                break;
            }
            let packed = pack_regions(
                ctx.memory,
                network_id,
                &ctx.scratch.ciphertext[..result.produced],
                &[],
            )?;
            if !connection.network_transfer(ctx.sink, packed.clone()) {
                release_owned(ctx.memory, network_id, packed);
                break;
            }
        }
        Ok(())
    }

    /// Application RST: no clean shutdown.
    fn on_reset(&mut self, connection: &Connection, ctx: &mut Context<'_>) {
        tracing::debug!(stream_id = self.id, "Application reset");
        connection.application_reset_by_peer();
        connection.engine().close_outbound();
        connection.abort_network(ctx.sink);
        self.close(ctx);
    }

    /// Ack on the network stream.
    pub(crate) fn on_ack(&mut self, ack: Ack, ctx: &mut Context<'_>) {
        let connection = match &self.state {
            AcceptState::Open(connection) | AcceptState::Ending(connection) => Arc::clone(connection),
            AcceptState::Closed => return,
        };

        let remaining = release_owned(ctx.memory, connection.network().id, ack.regions);

        if ack.flags.is_reset() {
            tracing::debug!(stream_id = self.id, network_id = ack.stream_id, "Network stream reset by peer");
            connection.network_reset_by_peer();
            connection.engine().close_outbound();
            if !remaining.is_empty() {
                connection.application_ack(ctx.sink, Flags::EMPTY, remaining);
            }
            connection.reset_application(ctx.sink);
            self.close(ctx);
            return;
        }

        if !remaining.is_empty() || ack.flags.is_fin() {
            connection.application_ack(ctx.sink, ack.flags, remaining);
        }
        if ack.flags.is_fin() {
            self.close(ctx);
        }
    }

    fn fail(&mut self, connection: &Connection, failure: StreamFailure, ctx: &mut Context<'_>) {
        failure.report(self.id);
        connection.engine().close_outbound();
        connection.abort_network(ctx.sink);
        connection.reset_application(ctx.sink);
        self.close(ctx);
    }

    /// Terminal state; a handshake nobody claimed is dropped with us.
    fn close(&mut self, ctx: &mut Context<'_>) {
        ctx.correlations.discard(self.correlation_id);
        self.state = AcceptState::Closed;
    }
}
