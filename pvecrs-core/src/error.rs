//! Error types for the scheduler.
//!
//! All fallible operations in this crate return [`CrsResult`]. Remote
//! failures keep enough context (HTTP status, server message) to be
//! actionable in logs; a tick aborts on the first error and the next tick
//! re-derives everything from observed state.

use thiserror::Error;

pub type CrsResult<T> = Result<T, CrsError>;

#[derive(Debug, Error)]
pub enum CrsError {
    /// Structured error returned by the Proxmox API (non-2xx with a
    /// `{status, error}` body).
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure talking to a remote endpoint.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Failure decoding or encoding a payload.
    #[error("serialization failed during {operation}: {source}")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Coordination-service (Consul) failure: sessions, locks, KV lookups.
    #[error("coordination error: {message}")]
    Coordination { message: String },

    /// Configuration error: bad endpoint URL, missing auth material.
    #[error("configuration error: {0}")]
    Config(String),

    /// Inconsistency between observed inventory and expectations.
    #[error("planning error: {message}")]
    Planning { message: String },

    /// The surrounding task was cancelled; the tick aborts cleanly.
    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CrsError {
    pub fn serialization(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CrsError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error is a permission / unsupported-feature response.
    /// Best-effort phases use this to pick the log level for a failure:
    /// a rejection is routine on old clusters or restricted tokens.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, CrsError::Api { status, .. } if *status == 401 || *status == 403)
    }
}

impl From<reqwest::Error> for CrsError {
    fn from(err: reqwest::Error) -> Self {
        CrsError::Connection {
            message: err.to_string(),
        }
    }
}
