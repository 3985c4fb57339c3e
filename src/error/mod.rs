//! Error types for the packet network

use std::io;
use thiserror::Error;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Packet network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed frame or packet body
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Frame larger than the configured ceiling
    #[error("Message too large: {0} bytes (max: {1} bytes)")]
    MessageTooLarge(usize, usize),

    /// Operation on a closed connection
    #[error("Connection is closed")]
    Closed,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No prototype registered for a packet id
    #[error("Unknown packet id: {0}")]
    UnknownPacketId(u32),

    /// Two packet types claim the same id
    #[error("Duplicate packet id {id}: {duplicate} conflicts with {existing}")]
    DuplicatePacketId {
        id: u32,
        existing: &'static str,
        duplicate: &'static str,
    },

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Other errors
    #[error("Network error: {0}")]
    Other(String),
}

impl NetworkError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Self::Tls(msg.into())
    }

    /// Create an other error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Copy of this error for a second receiver.
    ///
    /// The variant and message are kept; an I/O error keeps its kind but
    /// loses its source chain.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Connection(msg) => Self::Connection(msg.clone()),
            Self::Timeout(msg) => Self::Timeout(msg.clone()),
            Self::Codec(msg) => Self::Codec(msg.clone()),
            Self::InvalidState(msg) => Self::InvalidState(msg.clone()),
            Self::MessageTooLarge(size, max) => Self::MessageTooLarge(*size, *max),
            Self::Closed => Self::Closed,
            Self::Config(msg) => Self::Config(msg.clone()),
            Self::UnknownPacketId(id) => Self::UnknownPacketId(*id),
            Self::DuplicatePacketId {
                id,
                existing,
                duplicate,
            } => Self::DuplicatePacketId {
                id: *id,
                existing: *existing,
                duplicate: *duplicate,
            },
            Self::Tls(msg) => Self::Tls(msg.clone()),
            Self::Other(msg) => Self::Other(msg.clone()),
        }
    }

    /// Whether this error means the underlying channel is gone.
    ///
    /// Such errors close the connection; any other write failure only fails
    /// the packet being written.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => is_closed_io(e),
            _ => false,
        }
    }
}

/// Classify an I/O error as a closed channel.
pub(crate) fn is_closed_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
