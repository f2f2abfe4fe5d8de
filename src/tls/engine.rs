//! Engine adapter trait and result types.

use std::fmt;

use crate::tls::TlsError;

/// What the engine needs next to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// Delegated work must run before the handshake can continue.
    NeedTask,
    /// The engine has handshake (or close) bytes to send.
    NeedWrap,
    /// The engine is waiting for bytes from the peer.
    NeedUnwrap,
    /// The handshake has just completed. Reported once.
    Finished,
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStatus::NotHandshaking => "NOT_HANDSHAKING",
            HandshakeStatus::NeedTask => "NEED_TASK",
            HandshakeStatus::NeedWrap => "NEED_WRAP",
            HandshakeStatus::NeedUnwrap => "NEED_UNWRAP",
            HandshakeStatus::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Outcome of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// More input is needed to produce anything.
    BufferUnderflow,
    /// The destination filled up before the engine was done.
    BufferOverflow,
    /// This direction of the engine is closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub consumed: usize,
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }

    pub fn made_progress(&self) -> bool {
        self.consumed > 0 || self.produced > 0
    }
}

/// Delegated engine work, run inline by the status loop.
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// Client-mode TLS engine driven by the stream state machines.
///
/// The engine never touches streams or memory regions; callers copy bytes in
/// and out through linear buffers.
pub trait TlsEngine: Send {
    /// Current handshake need. `Finished` is returned exactly once.
    fn handshake_status(&mut self) -> HandshakeStatus;

    /// Next piece of delegated work, if any.
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    fn begin_handshake(&mut self) -> Result<(), TlsError>;

    /// Encrypt plaintext from `src` into `dst`. An empty `src` flushes
    /// handshake, close or previously buffered record bytes.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// Decrypt records from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// Queue close_notify; later wraps flush it.
    fn close_outbound(&mut self);

    /// Stop reading. Fails with `Truncated` unless the peer closed cleanly.
    fn close_inbound(&mut self) -> Result<(), TlsError>;

    /// Outbound is closed and every close byte has been wrapped.
    fn is_outbound_done(&self) -> bool;

    fn is_inbound_done(&self) -> bool;

    /// Record bytes are waiting for a wrap call.
    fn wants_wrap(&self) -> bool;

    /// Protocol selected by ALPN, if any.
    fn application_protocol(&self) -> Option<String>;

    /// Server name the engine was created for.
    fn peer_host(&self) -> Option<String>;
}

/// Creates client engines for new accept streams.
pub trait TlsEngineFactory: Send + Sync + fmt::Debug {
    fn new_client_engine(
        &self,
        hostname: Option<&str>,
        application_protocol: Option<&str>,
    ) -> Result<Box<dyn TlsEngine>, TlsError>;
}
