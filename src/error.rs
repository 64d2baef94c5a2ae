//! Error types for the Tor client
//!
//! This module provides the error taxonomy used across the crate:
//! - Detailed error variants for different failure modes
//! - Category and severity tags for programmatic handling
//! - Classification into fatal vs retryable

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Coarse error category, used by retry policies and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connection,
    Circuit,
    Directory,
    Protocol,
    Crypto,
    Configuration,
    Timeout,
    Network,
    Internal,
}

impl ErrorCategory {
    /// Whether errors of this category may be retried by default.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Connection
                | ErrorCategory::Circuit
                | ErrorCategory::Timeout
                | ErrorCategory::Network
        )
    }
}

/// How bad an error is for the process as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Transient; the operation can be repeated.
    Transient,
    /// The affected circuit/link/stream is dead, the client is fine.
    Degraded,
    /// Security-relevant or invariant violation; do not continue blindly.
    Fatal,
}

/// Main error type for the Tor client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Link connection is not open")]
    NotOpen,

    #[error("Connection closed by peer")]
    Eof,

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Unexpected end of stream mid-frame")]
    UnexpectedEof,

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("No compatible link protocol version (peer offered {0:?})")]
    NoCompatibleVersion(Vec<u16>),

    #[error("Relay cell digest mismatch")]
    DigestMismatch,

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream refused by exit: reason={0}")]
    StreamRefused(u8),

    // ===== Crypto Errors (fatal) =====
    #[error("Handshake authentication failed")]
    HandshakeAuthFailure,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Signature verification failed: {0}")]
    BadSignature(String),

    // ===== Directory Errors =====
    #[error("All directory authorities failed")]
    NoDirectory,

    #[error("Consensus failed validation: {0}")]
    CorruptConsensus(String),

    #[error("Directory error: {0}")]
    Directory(String),

    // ===== Path Selection =====
    #[error("Path selection failed: {0}")]
    PathSelectionFailed(String),

    // ===== Hidden Service Errors =====
    #[error("Invalid onion address: {0}")]
    InvalidAddress(String),

    #[error("Hidden-service descriptor fetch failed: {0}")]
    DescriptorFetchFailed(String),

    #[error("Hidden-service descriptor invalid: {0}")]
    InvalidDescriptor(String),

    #[error("Introduction to hidden service failed: {0}")]
    IntroductionFailed(String),

    #[error("Rendezvous with hidden service failed: {0}")]
    RendezvousFailed(String),

    // ===== Configuration Errors =====
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TorError {
    /// Category tag for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TorError::ConnectionFailed(_) | TorError::NotOpen => ErrorCategory::Connection,

            TorError::Timeout(_) => ErrorCategory::Timeout,

            TorError::ProtocolError(_)
            | TorError::MalformedCell(_)
            | TorError::UnexpectedEof
            | TorError::UnexpectedCell { .. }
            | TorError::NoCompatibleVersion(_)
            | TorError::DigestMismatch => ErrorCategory::Protocol,

            TorError::CircuitBuildFailed(_)
            | TorError::CircuitDestroyed { .. }
            | TorError::CircuitClosed(_)
            | TorError::Stream(_)
            | TorError::StreamRefused(_)
            | TorError::PathSelectionFailed(_)
            | TorError::IntroductionFailed(_)
            | TorError::RendezvousFailed(_) => ErrorCategory::Circuit,

            TorError::HandshakeAuthFailure
            | TorError::Crypto(_)
            | TorError::BadSignature(_)
            | TorError::InvalidDescriptor(_) => ErrorCategory::Crypto,

            TorError::NoDirectory
            | TorError::CorruptConsensus(_)
            | TorError::Directory(_)
            | TorError::DescriptorFetchFailed(_) => ErrorCategory::Directory,

            TorError::InvalidAddress(_) | TorError::InvalidConfig(_) => {
                ErrorCategory::Configuration
            }

            TorError::Storage(_) => ErrorCategory::Internal,

            TorError::Network(_) | TorError::Eof => ErrorCategory::Network,

            TorError::Internal(_) | TorError::ResourceExhausted(_) => ErrorCategory::Internal,
        }
    }

    /// Severity tag for this error.
    pub fn severity(&self) -> Severity {
        match self {
            TorError::HandshakeAuthFailure
            | TorError::Crypto(_)
            | TorError::BadSignature(_)
            | TorError::InvalidConfig(_)
            | TorError::Internal(_) => Severity::Fatal,

            TorError::CircuitDestroyed { .. }
            | TorError::CircuitClosed(_)
            | TorError::CircuitBuildFailed(_)
            | TorError::CorruptConsensus(_)
            | TorError::InvalidDescriptor(_)
            | TorError::NoDirectory => Severity::Degraded,

            _ => Severity::Transient,
        }
    }

    /// Whether this error is fatal to the whole client.
    ///
    /// Fatal errors indicate security problems or broken invariants; the
    /// client should not transparently retry past them.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Whether this error can be retried (possibly against a different
    /// relay or authority).
    pub fn is_retryable(&self) -> bool {
        if self.is_fatal() {
            return false;
        }
        match self {
            // Never retried against the same peer without a state reset.
            TorError::MalformedCell(_)
            | TorError::UnexpectedCell { .. }
            | TorError::ProtocolError(_)
            | TorError::NoCompatibleVersion(_) => false,
            _ => self.category().is_retryable(),
        }
    }

    /// Create a CircuitDestroyed error with the reason name filled in.
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TorError::UnexpectedEof,
            std::io::ErrorKind::TimedOut => TorError::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                TorError::ConnectionFailed(err.to_string())
            }
            _ => TorError::Network(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TorError::HandshakeAuthFailure.is_fatal());
        assert!(TorError::Crypto("test".into()).is_fatal());
        assert!(TorError::BadSignature("test".into()).is_fatal());
        assert!(TorError::InvalidConfig("test".into()).is_fatal());

        assert!(!TorError::ConnectionFailed("test".into()).is_fatal());
        assert!(!TorError::Timeout("read".into()).is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TorError::ConnectionFailed("test".into()).is_retryable());
        assert!(TorError::Timeout("read".into()).is_retryable());
        assert!(TorError::CircuitBuildFailed("test".into()).is_retryable());
        assert!(TorError::Network("reset".into()).is_retryable());

        // Protocol violations are never retried against the same peer.
        assert!(!TorError::MalformedCell("bad len".into()).is_retryable());
        assert!(!TorError::HandshakeAuthFailure.is_retryable());
        assert!(!TorError::NoDirectory.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(TorError::NoDirectory.category(), ErrorCategory::Directory);
        assert_eq!(
            TorError::HandshakeAuthFailure.category(),
            ErrorCategory::Crypto
        );
        assert_eq!(TorError::UnexpectedEof.category(), ErrorCategory::Protocol);
        assert_eq!(
            TorError::InvalidConfig("x".into()).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_circuit_destroyed() {
        let err = TorError::circuit_destroyed(1);
        if let TorError::CircuitDestroyed {
            reason,
            reason_name,
        } = err
        {
            assert_eq!(reason, 1);
            assert_eq!(reason_name, "PROTOCOL");
        } else {
            panic!("Expected CircuitDestroyed");
        }
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(TorError::from(eof), TorError::UnexpectedEof));
    }
}
