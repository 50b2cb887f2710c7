//! Error types for repl-link.
//!
//! Connection-level failures, wire format violations and caller mistakes all
//! surface as [`ReplError`]. A failed evaluation on the remote side is not an
//! error here; it is delivered as a normal terminal outcome of the eval.

use crate::codec::{EncodingError, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the repl-link library.
#[derive(Debug, Error)]
pub enum ReplError {
    // Connection errors
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection is not ready for evaluation yet")]
    NotReady,

    #[error("No previous connection to replay")]
    NoPreviousConnection,

    // Wire format errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Eval bookkeeping errors
    #[error("Eval {id} is already registered")]
    DuplicateEval { id: u64 },

    #[error("Unknown eval: {id}")]
    UnknownEval { id: u64 },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for repl-link operations.
pub type Result<T> = std::result::Result<T, ReplError>;

impl From<std::io::Error> for ReplError {
    fn from(err: std::io::Error) -> Self {
        ReplError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ReplError {
    fn from(err: serde_json::Error) -> Self {
        ReplError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ReplError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        ReplError::Config {
            message: message.into(),
        }
    }

    /// Whether this error ends the current connection.
    ///
    /// Malformed bytes on the wire and socket failures both tear the
    /// connection down; everything else leaves it usable.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, ReplError::Protocol(_) | ReplError::Io { .. })
    }

    /// Whether the error should be shown to the user as-is.
    ///
    /// Encoding errors and eval bookkeeping mistakes are programming errors
    /// and are only logged.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            ReplError::Encoding(_) | ReplError::DuplicateEval { .. } | ReplError::UnknownEval { .. }
        )
    }
}
