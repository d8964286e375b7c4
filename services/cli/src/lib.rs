//! Realtime CLI Library Crate
//!
//! Argument parsing and credential wiring for the `realtime` binary, kept
//! here so they can be tested. The binary is a thin wrapper around this.

use clap::Parser;
use mediagen_realtime::{
    CachedToken, Config, EvictionPolicy, HttpSecretFetcher, SecretCache, StaticToken, TokenSource,
};
use std::sync::Arc;
use tracing::{Level, info};

/// Connects to the realtime endpoint, prints inbound messages as JSON lines
/// and sends each stdin line as an outbound text message.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Realtime endpoint; overrides REALTIME_ENDPOINT.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Extra query string appended to the connection URL (e.g. `task_id=42`).
    #[arg(long)]
    pub query: Option<String>,

    /// Log level; overrides RUST_LOG.
    #[arg(long)]
    pub log_level: Option<Level>,
}

/// Picks the token source: a secret-service lookup when `SECRET_ID` is
/// configured, otherwise the static `REALTIME_TOKEN` (or none).
pub fn token_source(config: &mut Config) -> Arc<dyn TokenSource> {
    match (config.secret_service_url.take(), config.secret_id.take()) {
        (Some(url), Some(secret_id)) => {
            info!(%url, %secret_id, "Resolving realtime token through the secret service");
            let fetcher = HttpSecretFetcher::new(url, config.token.take());
            let cache = Arc::new(SecretCache::new(
                Arc::new(fetcher),
                EvictionPolicy::default(),
            ));
            Arc::new(CachedToken::new(cache, secret_id))
        }
        _ => Arc::new(StaticToken::from(config.token.take())),
    }
}
