//! Error types for the depot store protocol.
//!
//! One enum covers both sides of the wire. Server-side failures are carried
//! to the client inside the reply envelope as `{code, message}` and mapped
//! back to the matching variant, so protocol errors round-trip typed.

use crate::registry::PhaseKind;
use crate::store::CorrelationId;
use thiserror::Error;

/// Main error type for depot store operations.
#[derive(Debug, Error)]
pub enum DepotError {
    // Transport errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Correlation protocol errors
    #[error("Unknown correlation id: {id}")]
    UnknownCorrelation { id: CorrelationId },

    #[error("Duplicate correlation id: {id}")]
    DuplicateCorrelation { id: CorrelationId },

    #[error("{phase} phase already resolved for correlation id {id}")]
    AlreadyResolved { id: CorrelationId, phase: PhaseKind },

    #[error("{phase} phase already consumed for correlation id {id}")]
    AlreadyConsumed { id: CorrelationId, phase: PhaseKind },

    // Administrative errors
    #[error("Server is configured to ignore stop requests")]
    StopRefused,

    #[error("Client has been closed")]
    ClientClosed,

    // Store collaborator failures, propagated verbatim
    #[error("{message}")]
    Collaborator { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for depot store operations.
pub type Result<T> = std::result::Result<T, DepotError>;

impl From<std::io::Error> for DepotError {
    fn from(err: std::io::Error) -> Self {
        DepotError::Connection {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DepotError {
    fn from(err: serde_json::Error) -> Self {
        DepotError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl DepotError {
    /// Connection dropped by the peer before a reply was read.
    pub(crate) fn connection_lost(message: impl Into<String>) -> Self {
        DepotError::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Convert to a wire error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Connection/transport error
    /// - -32010: Unknown correlation id
    /// - -32011: Duplicate correlation id
    /// - -32012: Phase already resolved
    /// - -32013: Phase already consumed
    /// - -32014: Stop request refused
    pub fn to_wire_code(&self) -> i32 {
        match self {
            DepotError::Connection { .. } => -32000,

            DepotError::Json { .. } => -32700,

            DepotError::Validation { .. } => -32600,

            DepotError::UnknownCorrelation { .. } => -32010,
            DepotError::DuplicateCorrelation { .. } => -32011,
            DepotError::AlreadyResolved { .. } => -32012,
            DepotError::AlreadyConsumed { .. } => -32013,
            DepotError::StopRefused => -32014,

            // Collaborator and everything else are internal errors
            _ => -32603,
        }
    }

    /// Check if this error is a transient connectivity failure.
    ///
    /// Transient failures are retried indefinitely by the retry policy;
    /// everything else propagates to the caller immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            DepotError::Connection {
                source: Some(io), ..
            } => matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Source-less connection errors are peer-loss mid-exchange
            DepotError::Connection { source: None, .. } => true,
            _ => false,
        }
    }
}
