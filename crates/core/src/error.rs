use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for operations and the engine.
///
/// Only [`CourierError::Network`] and [`CourierError::Timeout`] are eligible
/// for automatic retry. HTTP status errors are not retried, auth expiry is
/// routed to the token-wait path, and configuration errors fail fast at
/// enqueue time without reaching the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CourierError {
    /// Transport-level failure: connection refused/reset, DNS, TLS.
    #[error("network error: {0}")]
    Network(String),

    /// A single attempt exceeded the operation timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with a non-2xx status.
    #[error("HTTP status {status}: {message}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Short description or response excerpt.
        message: String,
    },

    /// The access token was rejected; the operation is parked until the
    /// session is refreshed.
    #[error("access token expired or invalid")]
    AuthExpired,

    /// A transport-successful response whose payload is an application-level
    /// error (single error object in a JSON array).
    #[error("logical error in response payload: {0}")]
    LogicalPayload(String),

    /// Invalid operation setup, surfaced synchronously at build/enqueue.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An accessor was used in a state where it is not valid.
    #[error("invalid operation state: {0}")]
    InvalidState(String),

    /// Reading or writing downloaded content failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A response body could not be decoded as the requested type.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl CourierError {
    /// Whether this error counts as a network error for retry policy.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}
