//! Error types for qback.
//!
//! This module provides a unified error type for all qback operations,
//! with specific error variants for different failure modes.
//!
//! An upload rejected at admission is not an error: it is reported as
//! [`crate::transfer::UploadOutcome::Rejected`].

use std::io;

use thiserror::Error;

/// A specialized `Result` type for qback operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for qback.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not establish a connection to the server
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed
        addr: String,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Connection lost while a session was in progress
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A send or receive did not complete within its deadline
    #[error("{operation} timed out after {secs} seconds")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Configured deadline in seconds
        secs: u64,
    },

    /// Received content does not match the declared metadata
    #[error("integrity check failed for '{name}': {reason}")]
    IntegrityMismatch {
        /// Object name
        name: String,
        /// Size or hash mismatch details
        reason: String,
    },

    /// The server reported a failed transfer
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// The server answered a request with an explicit failure
    #[error("server error: {0}")]
    Remote(String),

    /// Target already exists locally
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// File or object not found
    #[error("file not found: {0}")]
    NotFound(String),

    /// Invalid user input (tag, name, chunk size, address, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    Protocol(String),

    /// Unsupported protocol version
    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },

    /// Unexpected message type
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Build a timeout error for the given operation.
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs: duration.as_secs(),
        }
    }

    /// Returns whether this error may be retried.
    ///
    /// Only connection establishment is retryable. Once stream bytes have
    /// been exchanged the protocol is not idempotent and nothing is retried.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connect_errors_are_recoverable() {
        let connect = Error::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(connect.is_recoverable());

        assert!(!Error::timeout("chunk 1/3 send", std::time::Duration::from_secs(30))
            .is_recoverable());
        assert!(!Error::ConnectionLost("reset".to_string()).is_recoverable());
        assert!(!Error::Io(io::Error::other("disk full")).is_recoverable());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::timeout("chunk 2/5 send", std::time::Duration::from_secs(30));
        assert_eq!(err.to_string(), "chunk 2/5 send timed out after 30 seconds");
    }
}
