//! TLS engine boundary.
//!
//! # Data Flow
//! ```text
//! Accept stream plaintext
//!     → TlsEngine::wrap (plaintext → records)
//!     → network stream
//! Network reply records
//!     → TlsEngine::unwrap (records → plaintext)
//!     → application-reply stream
//! Handshake progress
//!     → TlsEngine::handshake_status (NEED_TASK / NEED_WRAP / NEED_UNWRAP / FINISHED)
//!     → client::connect_reply status loop
//! ```
//!
//! # Design Decisions
//! - The stream state machines only see the `TlsEngine` trait, never rustls types
//! - Engine failures are values (`TlsError`), consumed by explicit matches
//! - FINISHED is a one-shot latch kept by the engine, not by the caller
//! - `RustlsEngineFactory` is the production engine; tests script their own

pub mod engine;
pub mod error;
pub mod rustls_engine;

pub use engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine, TlsEngineFactory};
pub use error::TlsError;
pub use rustls_engine::{RustlsEngine, RustlsEngineFactory};
