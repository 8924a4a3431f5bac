//! Error types for tunnelgate.

use std::io;

use thiserror::Error;

use crate::types::IoId;

/// Result type alias for tunnelgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tunnelgate.
#[derive(Error, Debug)]
pub enum Error {
    // Initialization errors
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),

    #[error("engine not initialized: {0}")]
    NotInitialized(String),

    // Connection errors
    #[error("unknown connection {0}")]
    UnknownConnection(IoId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send buffer full")]
    BufferFull,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // Intercept errors
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    // Interface driver errors
    #[error("route error: {0}")]
    Route(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    // Cross-thread dispatch
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("backend error: {0}")]
    Backend(String),

    // Packet errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Failures during engine bring-up. The engine cannot do its job after any of
/// these; the embedding application decides whether to exit.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("missing required backend callback: {0}")]
    MissingCallback(&'static str),

    #[error("failed to initialize IP stack: {0}")]
    StackInit(String),

    #[error("failed to attach network interface: {0}")]
    NetifAttach(String),

    #[error("failed to set up packet input: {0}")]
    InputSetup(String),

    #[error("failed to register {protocol} handler: {reason}")]
    HandlerRegistration { protocol: &'static str, reason: String },
}

/// Packet parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("unsupported transport protocol: {0}")]
    UnsupportedTransport(u8),

    #[error("address family mismatch between {src} and {dst}")]
    AddressFamilyMismatch { src: String, dst: String },
}

impl Error {
    /// Check if error belongs to the fatal initialization class.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Check if error is recoverable (caller may retry later).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BufferFull | Error::Dispatch(_) | Error::Route(_) | Error::Io(_)
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError::MalformedPacket(reason.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err: Error = FatalError::MissingCallback("dial").into();
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "fatal: missing required backend callback: dial"
        );

        assert!(!Error::ConnectionClosed.is_fatal());
        assert!(Error::BufferFull.is_recoverable());
    }
}
