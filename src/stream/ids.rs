//! Stream and correlation id supply.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::stream::StreamId;

/// Mints fresh stream ids and correlation ids.
///
/// Relaxed ordering is enough: callers only need uniqueness.
#[derive(Debug)]
pub struct StreamIds {
    next_stream_id: AtomicU64,
    next_correlation_id: AtomicU64,
}

impl StreamIds {
    pub fn new() -> Self {
        Self::starting_at(1, 1)
    }

    /// Start both counters at explicit values (tests use this to keep ids readable).
    pub fn starting_at(stream_id: StreamId, correlation_id: u64) -> Self {
        Self {
            next_stream_id: AtomicU64::new(stream_id.max(1)),
            next_correlation_id: AtomicU64::new(correlation_id.max(1)),
        }
    }

    pub fn next_stream_id(&self) -> StreamId {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for StreamIds {
    fn default() -> Self {
        Self::new()
    }
}
