//! rustls-backed client engine.
//!
//! # Responsibilities
//! - Build one shared `ClientConfig` (ring provider, CA roots from PEM)
//! - Adapt `ClientConnection` to the wrap/unwrap/status model of `TlsEngine`
//! - Emulate a duplex close: a peer close_notify queues ours
//!
//! # Design Decisions
//! - The plaintext buffer limit is lifted so data written during the
//!   handshake is held by rustls and flushed once the handshake completes
//! - After the handshake one wrap consumes at most one record of plaintext
//! - `read_tls` is never called with an empty slice, which rustls reads as EOF

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::config::TlsConfig;
use crate::tls::engine::DelegatedTask;
use crate::tls::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine, TlsEngineFactory, TlsError};

/// Largest plaintext fragment a single TLS record carries.
pub const MAX_PLAINTEXT_PER_WRAP: usize = 16 * 1024;

pub struct RustlsEngine {
    conn: ClientConnection,
    hostname: String,
    outbound_closed: bool,
    inbound_done: bool,
    peer_closed: bool,
    finished_reported: bool,
}

impl RustlsEngine {
    pub fn new(config: Arc<ClientConfig>, hostname: &str) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TlsError::InvalidServerName(hostname.to_string()))?;
        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|err| TlsError::Configuration(err.to_string()))?;
        conn.set_buffer_limit(None);

        Ok(Self {
            conn,
            hostname: hostname.to_string(),
            outbound_closed: false,
            inbound_done: false,
            peer_closed: false,
            finished_reported: false,
        })
    }

    fn failure(&self, err: impl std::fmt::Display) -> TlsError {
        if self.conn.is_handshaking() {
            TlsError::HandshakeFailed(err.to_string())
        } else {
            TlsError::RecordTransformFailed(err.to_string())
        }
    }

    /// Move queued record bytes into `dst`; returns bytes written.
    fn write_tls_into(&mut self, dst: &mut [u8]) -> Result<usize, TlsError> {
        let capacity = dst.len();
        let mut out: &mut [u8] = dst;
        while self.conn.wants_write() && !out.is_empty() {
            match self.conn.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => return Err(TlsError::RecordTransformFailed(err.to_string())),
            }
        }
        Ok(capacity - out.len())
    }

    /// Move decrypted bytes into `dst`; notices a clean peer close.
    fn drain_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, TlsError> {
        let mut produced = 0;
        while produced < dst.len() {
            let read = self.conn.reader().read(&mut dst[produced..]);
            match read {
                Ok(0) => {
                    self.on_peer_close();
                    break;
                }
                Ok(n) => produced += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(TlsError::RecordTransformFailed(err.to_string())),
            }
        }
        Ok(produced)
    }

    fn on_peer_close(&mut self) {
        if !self.peer_closed {
            tracing::trace!(hostname = %self.hostname, "Peer sent close_notify");
            self.peer_closed = true;
            self.inbound_done = true;
            self.close_outbound();
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake_status(&mut self) -> HandshakeStatus {
        if self.conn.wants_write() {
            return HandshakeStatus::NeedWrap;
        }
        if self.conn.is_handshaking() {
            return if self.inbound_done {
                HandshakeStatus::NotHandshaking
            } else {
                HandshakeStatus::NeedUnwrap
            };
        }
        if !self.finished_reported {
            self.finished_reported = true;
            return HandshakeStatus::Finished;
        }
        HandshakeStatus::NotHandshaking
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        // ClientHello is queued when the connection is created.
        if self.outbound_closed {
            return Err(TlsError::EngineClosed);
        }
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let mut consumed = 0;
        if !src.is_empty() {
            if self.outbound_closed {
                return Err(TlsError::EngineClosed);
            }
            let limit = if self.conn.is_handshaking() {
                src.len()
            } else {
                src.len().min(MAX_PLAINTEXT_PER_WRAP)
            };
            let written = self.conn.writer().write(&src[..limit]);
            consumed = written.map_err(|err| self.failure(err))?;
        }

        let produced = self.write_tls_into(dst)?;
        let status = if self.is_outbound_done() {
            EngineStatus::Closed
        } else if self.conn.wants_write() {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        if self.inbound_done {
            return Ok(EngineResult::new(EngineStatus::Closed, 0, 0));
        }

        let mut consumed = 0;
        let mut produced = self.drain_plaintext(dst)?;
        while !self.inbound_done && produced < dst.len() && consumed < src.len() {
            let mut input = &src[consumed..];
            let read = match self.conn.read_tls(&mut input) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => return Err(self.failure(err)),
            };
            consumed += read;

            if let Err(err) = self.conn.process_new_packets() {
                return Err(self.failure(err));
            }
            produced += self.drain_plaintext(&mut dst[produced..])?;
        }

        let status = if self.inbound_done {
            EngineStatus::Closed
        } else if consumed < src.len() {
            EngineStatus::BufferOverflow
        } else if consumed == 0 && produced == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn close_inbound(&mut self) -> Result<(), TlsError> {
        self.inbound_done = true;
        if self.peer_closed {
            Ok(())
        } else {
            Err(TlsError::Truncated)
        }
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.wants_write()
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn wants_wrap(&self) -> bool {
        self.conn.wants_write()
    }

    fn application_protocol(&self) -> Option<String> {
        self.conn
            .alpn_protocol()
            .map(|protocol| String::from_utf8_lossy(protocol).into_owned())
    }

    fn peer_host(&self) -> Option<String> {
        Some(self.hostname.clone())
    }
}

/// Builds `RustlsEngine`s from one shared client configuration.
#[derive(Debug, Clone)]
pub struct RustlsEngineFactory {
    config: Arc<ClientConfig>,
}

impl RustlsEngineFactory {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Ring provider, safe default versions, no client auth, no resumption.
    pub fn with_roots(roots: RootCertStore) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| TlsError::Configuration(err.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.resumption = Resumption::disabled();
        Ok(Self::new(Arc::new(config)))
    }

    pub fn from_config(tls: &TlsConfig) -> Result<Self, TlsError> {
        let roots = match &tls.ca_path {
            Some(path) => load_roots(Path::new(path))?,
            None => {
                tracing::warn!("No ca_path configured, peer certificates cannot be verified");
                RootCertStore::empty()
            }
        };
        Self::with_roots(roots)
    }
}

impl TlsEngineFactory for RustlsEngineFactory {
    fn new_client_engine(
        &self,
        hostname: Option<&str>,
        application_protocol: Option<&str>,
    ) -> Result<Box<dyn TlsEngine>, TlsError> {
        let hostname = hostname.ok_or(TlsError::MissingServerName)?;
        let config = match application_protocol {
            Some(protocol) => {
                let mut config = (*self.config).clone();
                config.alpn_protocols = vec![protocol.as_bytes().to_vec()];
                Arc::new(config)
            }
            None => Arc::clone(&self.config),
        };
        Ok(Box::new(RustlsEngine::new(config, hostname)?))
    }
}

/// Load trust anchors from a PEM bundle.
pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let file = File::open(path)
        .map_err(|err| TlsError::Configuration(format!("{}: {}", path.display(), err)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Configuration(format!("{}: {}", path.display(), err)))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(TlsError::Configuration(format!(
            "{}: no usable CA certificates",
            path.display()
        )));
    }
    tracing::debug!(path = %path.display(), added, ignored, "Loaded CA certificates");
    Ok(roots)
}
