//! Parsed frame model.

use std::fmt;

/// 64-bit stream identifier.
pub type StreamId = u64;

/// Frame flag bits shared by transfers and acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const EMPTY: Flags = Flags(0x00);
    pub const FIN: Flags = Flags(0x01);
    pub const RST: Flags = Flags(0x02);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::FIN.0 | Self::RST.0))
    }

    pub fn is_fin(self) -> bool {
        self.0 & Self::FIN.0 != 0
    }

    pub fn is_reset(self) -> bool {
        self.0 & Self::RST.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_fin(), self.is_reset()) {
            (false, false) => write!(f, "EMPTY"),
            (true, false) => write!(f, "FIN"),
            (false, true) => write!(f, "RST"),
            (true, true) => write!(f, "FIN|RST"),
        }
    }
}

/// Descriptor of bytes held in the shared arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub address: u64,
    pub length: usize,
    /// Stream that owns the bytes and must be credited when they are released.
    pub stream_id: StreamId,
}

impl Region {
    pub fn new(address: u64, length: usize, stream_id: StreamId) -> Self {
        Self {
            address,
            length,
            stream_id,
        }
    }
}

/// TLS begin extension: requested (or negotiated) server name and protocol.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsBeginEx {
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
}

impl TlsBeginEx {
    /// Empty strings on the wire mean "absent".
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref().filter(|h| !h.is_empty())
    }

    pub fn application_protocol(&self) -> Option<&str> {
        self.application_protocol.as_deref().filter(|p| !p.is_empty())
    }
}

/// Opens a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Begin {
    pub stream_id: StreamId,
    pub source: String,
    pub source_ref: u64,
    pub correlation_id: u64,
    pub authorization: u64,
    pub extension: Option<TlsBeginEx>,
}

/// Forward-direction frame carrying payload regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub stream_id: StreamId,
    pub authorization: u64,
    pub flags: Flags,
    pub regions: Vec<Region>,
}

impl Transfer {
    pub fn payload_len(&self) -> usize {
        self.regions.iter().map(|r| r.length).sum()
    }
}

/// Reverse-direction frame returning credit or signalling termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub stream_id: StreamId,
    pub flags: Flags,
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Begin(Begin),
    Transfer(Transfer),
    Ack(Ack),
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Begin(begin) => begin.stream_id,
            Frame::Transfer(transfer) => transfer.stream_id,
            Frame::Ack(ack) => ack.stream_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "begin",
            Frame::Transfer(_) => "transfer",
            Frame::Ack(_) => "ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_query() {
        let flags = Flags::FIN | Flags::RST;
        assert!(flags.is_fin());
        assert!(flags.is_reset());
        assert!(!flags.is_empty());
        assert!(Flags::EMPTY.is_empty());
        assert_eq!(Flags::from_bits(0xff), flags);
        assert_eq!(Flags::RST.to_string(), "RST");
    }

    #[test]
    fn empty_extension_strings_are_absent() {
        let ex = TlsBeginEx {
            hostname: Some(String::new()),
            application_protocol: Some("h2".into()),
        };
        assert_eq!(ex.hostname(), None);
        assert_eq!(ex.application_protocol(), Some("h2"));
    }
}
