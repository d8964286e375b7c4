//! Injectable secret cache with request coalescing.
//!
//! Concurrent `get` calls for the same id share one in-flight fetch. Entries
//! are evicted by age (optional TTL) and by count (oldest inserted first).
//! Failed fetches are never cached.

use crate::error::SecretError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::OnceCell, time::Instant};
use tracing::{debug, warn};
use url::Url;

/// Source of secrets, typically a remote secret service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<SecretString, SecretError>;
}

/// Eviction settings for [`SecretCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Entries older than this are fetched again. `None` keeps them forever.
    pub ttl: Option<Duration>,
    /// Upper bound on cached entries. `None` means unbounded.
    pub max_entries: Option<usize>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl: None,
            max_entries: Some(256),
        }
    }
}

struct Fetched {
    secret: SecretString,
    at: Instant,
}

struct Slot {
    cell: Arc<OnceCell<Fetched>>,
    seq: u64,
}

#[derive(Default)]
struct Slots {
    next_seq: u64,
    map: HashMap<String, Slot>,
}

pub struct SecretCache {
    fetcher: Arc<dyn SecretFetcher>,
    policy: EvictionPolicy,
    slots: Mutex<Slots>,
}

impl SecretCache {
    pub fn new(fetcher: Arc<dyn SecretFetcher>, policy: EvictionPolicy) -> Self {
        Self {
            fetcher,
            policy,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Returns the secret for `id`, fetching it at most once for all
    /// concurrent callers.
    pub async fn get(&self, id: &str) -> Result<SecretString, SecretError> {
        let cell = self.slot_for(id);

        let fetched = cell
            .get_or_try_init(|| async {
                debug!(secret_id = id, "Fetching secret");
                let secret = self.fetcher.fetch(id).await?;
                Ok::<_, SecretError>(Fetched {
                    secret,
                    at: Instant::now(),
                })
            })
            .await;

        match fetched {
            Ok(fetched) => Ok(duplicate(&fetched.secret)),
            Err(e) => {
                warn!(secret_id = id, error = %e, "Secret fetch failed");
                self.discard_if_empty(id, &cell);
                Err(e)
            }
        }
    }

    /// Drops the cached value for `id`; the next `get` fetches again.
    pub fn invalidate(&self, id: &str) -> bool {
        self.lock().map.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.lock().map.clear();
    }

    /// Number of ids holding a fetched secret.
    pub fn len(&self) -> usize {
        self.lock()
            .map
            .values()
            .filter(|slot| slot.cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_for(&self, id: &str) -> Arc<OnceCell<Fetched>> {
        let mut slots = self.lock();

        if let Some(slot) = slots.map.get(id) {
            if !self.is_expired(slot) {
                return slot.cell.clone();
            }
            debug!(secret_id = id, "Cached secret expired");
            slots.map.remove(id);
        }

        if let Some(max) = self.policy.max_entries {
            while slots.map.len() >= max.max(1) {
                let Some(oldest) = slots
                    .map
                    .iter()
                    .min_by_key(|(_, slot)| slot.seq)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                debug!(secret_id = %oldest, "Evicting oldest cached secret");
                slots.map.remove(&oldest);
            }
        }

        slots.next_seq += 1;
        let seq = slots.next_seq;
        let cell = Arc::new(OnceCell::new());
        slots.map.insert(
            id.to_string(),
            Slot {
                cell: cell.clone(),
                seq,
            },
        );
        cell
    }

    fn is_expired(&self, slot: &Slot) -> bool {
        match (self.policy.ttl, slot.cell.get()) {
            (Some(ttl), Some(fetched)) => fetched.at.elapsed() >= ttl,
            _ => false,
        }
    }

    fn discard_if_empty(&self, id: &str, cell: &Arc<OnceCell<Fetched>>) {
        let mut slots = self.lock();
        let stale = slots
            .map
            .get(id)
            .is_some_and(|slot| Arc::ptr_eq(&slot.cell, cell) && !slot.cell.initialized());
        if stale {
            slots.map.remove(id);
        }
    }
}

fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

#[derive(Deserialize)]
struct SecretResponse {
    secret: String,
}

/// Fetches secrets with `GET {base_url}/{id}`, expecting `{"secret": "..."}`.
pub struct HttpSecretFetcher {
    client: reqwest::Client,
    base_url: Url,
    auth: Option<SecretString>,
}

impl HttpSecretFetcher {
    pub fn new(base_url: Url, auth: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            auth,
        }
    }
}

#[async_trait]
impl SecretFetcher for HttpSecretFetcher {
    async fn fetch(&self, id: &str) -> Result<SecretString, SecretError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SecretError::Request(format!("'{}' cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push(id);

        let mut request = self.client.get(url);
        if let Some(auth) = &self.auth {
            request = request.bearer_auth(auth.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            return Err(SecretError::Request(format!("unexpected status {}", status)));
        }

        let body: SecretResponse = response
            .json()
            .await
            .map_err(|e| SecretError::InvalidResponse(e.to_string()))?;
        Ok(SecretString::from(body.secret))
    }
}
