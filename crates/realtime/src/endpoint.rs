//! Builds the realtime URL from the configured endpoint, the auth token and
//! any extra query string supplied to `connect`.

use crate::error::SessionError;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Everything except RFC 3986 unreserved characters, so a space is `%20`
/// and never `+`.
const TOKEN_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Rewrites `http`/`https` to `ws`/`wss`. A bare authority gets `wss://`.
pub fn normalize(endpoint: &str) -> Result<Url, SessionError> {
    let endpoint = endpoint.trim();
    let invalid = |reason: String| SessionError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("wss://{}", endpoint)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot rewrite scheme to '{}'", scheme)))?;
    }
    Ok(url)
}

/// Returns the full connection URL. The result contains the token in clear
/// text and must not be logged.
pub fn build_url(
    endpoint: &str,
    token: Option<&SecretString>,
    extra_query: Option<&str>,
) -> Result<Url, SessionError> {
    let mut url = normalize(endpoint)?;

    let extra = extra_query
        .map(|q| q.trim_start_matches(['?', '&']))
        .filter(|q| !q.is_empty());
    let token = token
        .map(|t| t.expose_secret())
        .filter(|t| !t.is_empty());

    if let Some(token) = token {
        let token = format!("token={}", utf8_percent_encode(token, TOKEN_VALUE));
        let query = match url.query().filter(|q| !q.is_empty()) {
            Some(existing) => format!("{}&{}", existing, token),
            None => token,
        };
        url.set_query(Some(&query));
    }
    if let Some(extra) = extra {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in url::form_urlencoded::parse(extra.as_bytes()) {
            pairs.append_pair(&key, &value);
        }
    }
    Ok(url)
}

/// Endpoint with query and credentials stripped, safe for logs and errors.
pub fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    let _ = clean.set_password(None);
    clean.to_string()
}
