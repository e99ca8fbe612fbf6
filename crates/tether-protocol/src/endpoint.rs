//! Daemon endpoint derivation
//!
//! The client is handed the URL of the page that hosts it and derives both
//! daemon endpoints from it:
//! - the WebSocket: `ws`/`wss` + host + page path + `socket`
//! - the session bootstrap: same origin, path `/session`

use url::Url;

/// Literal appended to the page path to form the socket path.
pub const SOCKET_SEGMENT: &str = "socket";

/// Path of the HTTP session bootstrap endpoint.
pub const SESSION_PATH: &str = "/session";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid url {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("url has no host: {0}")]
    MissingHost(String),
}

fn authority(page: &Url) -> Result<String, EndpointError> {
    let host = page
        .host_str()
        .ok_or_else(|| EndpointError::MissingHost(page.to_string()))?;
    Ok(match page.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn parse(candidate: String) -> Result<Url, EndpointError> {
    Url::parse(&candidate).map_err(|e| EndpointError::Parse {
        url: candidate.clone(),
        reason: e.to_string(),
    })
}

/// Derive the daemon WebSocket URL from a page URL.
///
/// `socket` is concatenated onto the page path as-is, so a page at
/// `/app/` connects to `/app/socket`. Query and fragment are dropped.
pub fn socket_url(page: &Url) -> Result<Url, EndpointError> {
    let scheme = match page.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let authority = authority(page)?;
    parse(format!(
        "{}://{}{}{}",
        scheme,
        authority,
        page.path(),
        SOCKET_SEGMENT
    ))
}

/// Derive the session bootstrap URL (same origin as the page).
pub fn session_url(page: &Url) -> Result<Url, EndpointError> {
    let scheme = match page.scheme() {
        "https" | "wss" => "https",
        _ => "http",
    };
    let authority = authority(page)?;
    parse(format!("{}://{}{}", scheme, authority, SESSION_PATH))
}
