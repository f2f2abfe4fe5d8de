//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, EnvFilter + fmt layer)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → stdout log stream
//!     → whatever metrics recorder the host process installs
//! ```
//!
//! # Design Decisions
//! - Every event carries stream ids as structured fields
//! - Metrics are cheap (atomic increments) and can be switched off in config
//! - The crate installs no metrics exporter of its own

pub mod logging;
pub mod metrics;
