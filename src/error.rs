//! eipip Error Types

use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for eipip operations
pub type Result<T> = std::result::Result<T, Error>;

/// eipip error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Invalid key encoding: {0}")]
    KeyEncoding(#[from] hex::FromHexError),

    // Crypto errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    // Endpoint errors
    #[error("Failed to acquire {endpoint}: {reason}")]
    EndpointSetup { endpoint: String, reason: String },

    #[error("Endpoint {endpoint} closed: {reason}")]
    EndpointClosed { endpoint: String, reason: String },

    #[error("Endpoint {endpoint} rejected packet: {reason}")]
    PacketRejected { endpoint: String, reason: String },

    // Kernel-style link and registry errors
    #[error("Invalid link attributes: {0}")]
    LinkAttributes(String),

    #[error("Tunnel already registered for namespace {0}")]
    TunnelExists(u64),

    #[error("No tunnel registered for namespace {0}")]
    TunnelNotFound(u64),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error should terminate the tunnel instance
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::PacketRejected { .. } | Error::TunnelExists(_) | Error::TunnelNotFound(_)
        )
    }

    pub(crate) fn closed(endpoint: &str, reason: impl ToString) -> Self {
        Error::EndpointClosed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn rejected(endpoint: &str, reason: impl ToString) -> Self {
        Error::PacketRejected {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn setup(endpoint: &str, reason: impl ToString) -> Self {
        Error::EndpointSetup {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors produced by the symmetric codec
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid key length {len} for {suite}")]
    InvalidKeyLength { len: usize, suite: &'static str },

    #[error("Corrupt ciphertext")]
    CorruptCiphertext,
}

/// Packet-level failures. These never stop the pipeline: the packet is
/// dropped and the matching counter in [`crate::stats::TunnelStats`] is bumped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("Inner packet of {len} bytes exceeds MTU budget of {budget}")]
    PacketTooLarge { len: usize, budget: usize },

    #[error("Datagram of {0} bytes is shorter than the outer header")]
    TruncatedDatagram(usize),

    #[error("Malformed outer header: {0}")]
    MalformedHeader(&'static str),

    #[error("Header checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("Datagram not for this tunnel (protocol {protocol}, destination {destination})")]
    ProtocolMismatch { protocol: u8, destination: Ipv4Addr },

    #[error("Corrupt ciphertext")]
    CorruptCiphertext,

    #[error("Codec rejected key: {0}")]
    Codec(CodecError),
}

impl From<CodecError> for PacketError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::CorruptCiphertext => PacketError::CorruptCiphertext,
            other => PacketError::Codec(other),
        }
    }
}

/// Counter bucket a dropped packet is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Oversize,
    Truncated,
    Malformed,
    Checksum,
    Protocol,
    Corrupt,
}

impl PacketError {
    /// Which drop counter this failure belongs to
    pub fn drop_reason(&self) -> DropReason {
        match self {
            PacketError::PacketTooLarge { .. } => DropReason::Oversize,
            PacketError::TruncatedDatagram(_) => DropReason::Truncated,
            PacketError::MalformedHeader(_) => DropReason::Malformed,
            PacketError::ChecksumMismatch { .. } => DropReason::Checksum,
            PacketError::ProtocolMismatch { .. } => DropReason::Protocol,
            PacketError::CorruptCiphertext | PacketError::Codec(_) => DropReason::Corrupt,
        }
    }
}
