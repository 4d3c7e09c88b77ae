//! Unified error types for the transport seam.
//!
//! Framework-level errors (definition and load failures) live in
//! `kiln-framework`.

use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors raised while running a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {reason}")]
    ConnectionFailed {
        /// Reason for failure.
        reason: String,
    },

    /// Connection closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Reason for closure.
        reason: String,
    },

    /// The receiving side of the event channel is gone.
    #[error("event channel closed")]
    ChannelClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// =============================================================================
// API Errors
// =============================================================================

/// Error type for outbound calls (sending messages).
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The transport is not connected.
    #[error("transport is not connected")]
    NotConnected,

    /// A channel identifier was not of the form `<kind>:<id>`.
    #[error("malformed channel id: {0:?}")]
    MalformedChannel(String),

    /// A channel identifier named a kind no transport operation exists for.
    #[error("unknown channel kind: {0:?}")]
    UnknownChannelKind(String),

    /// The remote side rejected the call.
    #[error("API error ({retcode}): {message}")]
    Rejected { retcode: i64, message: String },

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for outbound calls.
pub type ApiResult<T> = Result<T, ApiError>;
