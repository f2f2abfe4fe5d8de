//! TLS engine errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("record transform failed: {0}")]
    RecordTransformFailed(String),

    #[error("engine is closed")]
    EngineClosed,

    #[error("invalid server name: {0:?}")]
    InvalidServerName(String),

    #[error("server name required to verify the peer")]
    MissingServerName,

    #[error("inbound closed before the peer sent close_notify")]
    Truncated,

    #[error("TLS configuration: {0}")]
    Configuration(String),
}

impl TlsError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TlsError::HandshakeFailed(_) => "handshake_failed",
            TlsError::RecordTransformFailed(_) => "record_transform_failed",
            TlsError::EngineClosed => "engine_closed",
            TlsError::InvalidServerName(_) => "invalid_server_name",
            TlsError::MissingServerName => "missing_server_name",
            TlsError::Truncated => "truncated",
            TlsError::Configuration(_) => "configuration",
        }
    }
}
