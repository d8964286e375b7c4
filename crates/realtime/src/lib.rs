//! Reconnecting realtime session client for the media-generation platform.
//!
//! - `session`: the session manager (connect, send, disconnect, subscribe, reconnect).
//! - `transport`: the connector seam and its WebSocket implementation.
//! - `events`: subscriber channels.
//! - `backoff`: retry limit and delay curve.
//! - `endpoint`: URL normalization and credential query.
//! - `credentials` / `secret_cache`: where the bearer token comes from.
//! - `config`: environment-driven configuration.

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod secret_cache;
pub mod session;
pub mod transport;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use config::{Config, ConfigError, SessionConfig};
pub use credentials::{CachedToken, StaticToken, TokenSource};
pub use error::{SecretError, SessionError, TransportError};
pub use events::{EventKind, SessionEvent, Subscription};
pub use secret_cache::{EvictionPolicy, HttpSecretFetcher, SecretCache, SecretFetcher};
pub use session::{ConnectionState, Payload, Session};
pub use transport::{Connector, Frame, TransportLink, WsConnector};
