//! Connection URL construction.
//!
//! The backend authenticates the socket from query parameters:
//! - `token` (mandatory)
//! - `session_id` (optional, resumes an existing session)
//!
//! Any query parameters already present on the base URL are preserved.

use thiserror::Error;
use url::Url;

/// Errors that can occur while building a connection URL
#[derive(Debug, Error, PartialEq)]
pub enum ConnectionUrlError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be ws or wss, got: {0}")]
    UnsupportedScheme(String),

    #[error("URL must have a host")]
    MissingHost,

    #[error("Auth token is required")]
    MissingAuthToken,
}

/// Parse and check a base URL.
pub fn validate_base_url(base_url: &str) -> Result<Url, ConnectionUrlError> {
    let url = Url::parse(base_url)?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConnectionUrlError::UnsupportedScheme(other.to_string())),
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConnectionUrlError::MissingHost);
    }

    Ok(url)
}

/// Append `token` and, when present, `session_id` to `base`.
///
/// Existing `token`/`session_id` parameters on the base are replaced.
pub fn build_connection_url(
    base: &Url,
    token: &str,
    session_id: Option<&str>,
) -> Result<Url, ConnectionUrlError> {
    if token.trim().is_empty() {
        return Err(ConnectionUrlError::MissingAuthToken);
    }

    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "token" && key != "session_id")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = base.clone();
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &retained {
            query.append_pair(key, value);
        }
        query.append_pair("token", token);
        if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
            query.append_pair("session_id", session_id);
        }
    }

    Ok(url)
}

/// Render a URL for logs with the token masked.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), value)
        })
        .collect();

    if pairs.is_empty() {
        return redacted.to_string();
    }

    redacted.set_query(None);
    redacted.query_pairs_mut().extend_pairs(pairs);
    redacted.to_string()
}
