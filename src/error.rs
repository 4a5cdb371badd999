//! Error types for the Kindling feedback store.
//!
//! Nothing in this layer is fatal to the host process: the worst outcome
//! of any error here is that learning or model usage is disabled for one
//! query or one feature subspace.

use thiserror::Error;

/// The primary error type for Kindling operations.
#[derive(Error, Debug)]
pub enum KindlingError {
    /// Array/text encoding error (unsupported value, malformed dimensions).
    ///
    /// Fatal for the current call only; a remote-forward attempt that hits
    /// this is aborted rather than silently truncated.
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// A required table or index is missing.
    ///
    /// This is the "feature unavailable" condition: callers respond by
    /// disabling the optimizer for the current query, not by aborting.
    #[error("Storage object unavailable: {object}")]
    Unavailable { object: String },

    /// Remote forwarding failure (connect or command status).
    ///
    /// Never retried on the hot path.
    #[error("Remote forward failed: {message}")]
    Remote { message: String },

    /// Malformed frame on the forwarding wire protocol.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid configuration value.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Background worker failure (failed to start, or panicked).
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Underlying storage engine error.
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: rusqlite::Error,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl KindlingError {
    /// Create an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a feature-unavailable error naming the missing object.
    pub fn unavailable(object: impl Into<String>) -> Self {
        Self::Unavailable {
            object: object.into(),
        }
    }

    /// Create a remote-forwarding error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a wire-protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a background-worker error.
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Whether this error is the non-fatal "feature unavailable" class.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type alias for Kindling operations.
pub type Result<T> = std::result::Result<T, KindlingError>;
