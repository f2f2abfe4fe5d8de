//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the TLS client proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Engine and buffer settings.
    pub tls: TlsConfig,

    /// Routes from application sources to network targets.
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// TLS engine and buffer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Staging buffer capacity per stream (must be a power of two).
    pub transfer_capacity: usize,

    /// PEM bundle of trusted CA certificates.
    pub ca_path: Option<String>,

    /// Bytes backing the in-process region arena.
    pub arena_capacity: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            transfer_capacity: 65_536,
            ca_path: None,
            arena_capacity: 16 * 1024 * 1024,
        }
    }
}

/// Route from an application source to a network target.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Application namespace the route accepts streams from.
    pub source: String,

    /// Application reference; 0 is reserved for reply streams.
    pub source_ref: u64,

    /// Network namespace the encrypted stream is opened on.
    pub target: String,

    pub target_ref: u64,

    /// Authorization bits a stream must carry (default: none).
    #[serde(default)]
    pub authorization: u64,

    /// Server name to match and to send as SNI.
    #[serde(default)]
    pub hostname: Option<String>,

    /// ALPN protocol this route is restricted to.
    #[serde(default)]
    pub application_protocol: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit counters through the `metrics` facade.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
