//! Where the session gets its bearer token from.
//!
//! The token is resolved again on every connection attempt, so a rotated
//! secret is picked up by the next reconnect.

use crate::{error::SessionError, secret_cache::SecretCache};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `Ok(None)` means connect unauthenticated.
    async fn token(&self) -> Result<Option<SecretString>, SessionError>;
}

/// A fixed token, or none at all.
#[derive(Default)]
pub struct StaticToken(Option<SecretString>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(SecretString::from(token.into())))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl From<Option<SecretString>> for StaticToken {
    fn from(token: Option<SecretString>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<Option<SecretString>, SessionError> {
        Ok(self
            .0
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_owned())))
    }
}

/// Reads the token through a shared [`SecretCache`].
pub struct CachedToken {
    cache: Arc<SecretCache>,
    secret_id: String,
}

impl CachedToken {
    pub fn new(cache: Arc<SecretCache>, secret_id: impl Into<String>) -> Self {
        Self {
            cache,
            secret_id: secret_id.into(),
        }
    }
}

#[async_trait]
impl TokenSource for CachedToken {
    async fn token(&self) -> Result<Option<SecretString>, SessionError> {
        self.cache
            .get(&self.secret_id)
            .await
            .map(Some)
            .map_err(|e| SessionError::Credential(e.to_string()))
    }
}
