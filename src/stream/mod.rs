//! Stream substrate: frames, ids and the outbound frame sink.
//!
//! # Data Flow
//! ```text
//! Runtime delivers parsed frames
//!     → frame.rs (Begin / Transfer / Ack, Region descriptors, Flags)
//!     → client::ClientStreamFactory::handle
//!     → FrameSink::send(target, frame) for every frame we emit
//!
//! Each logical connection is two one-way streams:
//!     forward:  Begin → Transfer* (last one carries FIN or RST)
//!     reverse:  Ack* (credit, FIN or RST) sent back to the writer
//! ```
//!
//! # Design Decisions
//! - Frames never carry payload bytes, only Region descriptors into the shared arena
//! - The sink is the only way out of the core; the runtime decides delivery
//! - Ids come from a shared atomic supplier so several factories never collide

pub mod frame;
pub mod ids;

pub use frame::{Ack, Begin, Flags, Frame, Region, StreamId, TlsBeginEx, Transfer};
pub use ids::StreamIds;

/// Destination for every frame the core emits.
///
/// `target` names the peer that receives the frame: the route target for the
/// network stream, the application name for the application-reply stream, and
/// the original writer for acks.
pub trait FrameSink {
    fn send(&mut self, target: &str, frame: Frame);
}

impl FrameSink for Vec<(String, Frame)> {
    fn send(&mut self, target: &str, frame: Frame) {
        self.push((target.to_string(), frame));
    }
}
