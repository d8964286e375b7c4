//! Error types for the realtime session.

use crate::session::ConnectionState;

/// Failure reported by a [`Connector`](crate::transport::Connector) or one of
/// its live links.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be established (DNS, TCP, TLS or handshake).
    #[error("failed to open transport: {0}")]
    Connect(String),
    /// An established transport failed while reading or writing.
    #[error("transport I/O failed: {0}")]
    Io(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Everything a [`Session`](crate::session::Session) can report, either as a
/// return value or through the `error` subscriber channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The transport failed before reaching `Open`.
    #[error("connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: TransportError,
    },
    /// The transport failed after it was open.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// `send` was called while the session was not open.
    #[error("session is not connected (state: {0})")]
    NotConnected(ConnectionState),
    /// The outbound queue is full; the payload was not accepted.
    #[error("outbound queue is full")]
    Backpressure,
    /// An inbound payload could not be decoded as JSON.
    #[error("failed to decode inbound payload: {0}")]
    Decode(String),
    /// Automatic reconnection gave up after the configured number of retries.
    #[error("reconnect attempts exhausted after {attempts} retries")]
    RetryExhausted { attempts: u32 },
    /// A newer `connect`, `disconnect` or `reset` replaced this attempt.
    #[error("connection attempt was superseded")]
    Superseded,
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    /// The auth token could not be obtained.
    #[error("failed to obtain credentials: {0}")]
    Credential(String),
    /// A payload handed to `send_json` could not be serialized.
    #[error("failed to encode outbound payload: {0}")]
    Encode(String),
}

/// Failure reported by a [`SecretFetcher`](crate::secret_cache::SecretFetcher).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret service request failed: {0}")]
    Request(String),
    #[error("secret service returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for SecretError {
    fn from(err: reqwest::Error) -> Self {
        SecretError::Request(err.to_string())
    }
}
