//! Shared memory boundary.
//!
//! # Data Flow
//! ```text
//! Inbound Transfer regions
//!     → MemoryManager::read (copy into a linear staging buffer for the engine)
//! Engine output (ciphertext or plaintext)
//!     → pack.rs::pack_regions (acquire + write, bounded by max_payload_size)
//!     → outbound Transfer regions
//! Ack regions we own
//!     → MemoryManager::release
//! ```
//!
//! # Design Decisions
//! - The allocator is a collaborator behind a trait; `HeapArena` is the in-process version
//! - Views are transient copies, never borrowed across frames
//! - Budget is checked before anything is acquired

pub mod arena;
pub mod pack;

use thiserror::Error;

use crate::stream::Region;

pub use arena::HeapArena;
pub use pack::{pack_regions, release_owned};

/// Largest payload a single transfer may carry.
pub const MAXIMUM_PAYLOAD_LENGTH: usize = (1 << 16) - 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("region at {address:#x} (+{length}) is not backed by the arena")]
    UnknownRegion { address: u64, length: usize },

    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("payload of {produced} bytes exceeds budget of {budget} bytes")]
    BudgetExceeded { produced: usize, budget: usize },
}

/// Off-heap region allocator shared by all streams.
pub trait MemoryManager: Send + Sync + std::fmt::Debug {
    /// Reserve `length` bytes and return their address.
    fn acquire(&self, length: usize) -> Result<u64, MemoryError>;

    /// Return a block previously obtained from `acquire`.
    fn release(&self, address: u64, length: usize);

    /// Append the bytes a region references to `dst`.
    fn read(&self, region: &Region, dst: &mut Vec<u8>) -> Result<(), MemoryError>;

    /// Overwrite bytes starting at `address`.
    fn write(&self, address: u64, src: &[u8]) -> Result<(), MemoryError>;

    /// Largest payload that can be packed next to `regions` in one transfer.
    fn max_payload_size(&self, regions: &[Region]) -> usize;
}
