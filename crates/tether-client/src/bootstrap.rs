//! HTTP session bootstrap
//!
//! Some daemons keep per-client state keyed by a cookie handed out from
//! `GET /session`. The cookies are collected here and replayed on the
//! WebSocket upgrade request, the way a browser would send them.

use reqwest::header::SET_COOKIE;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::ClientError;

/// Cookies returned by the session endpoint, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCookies {
    pairs: Vec<(String, String)>,
}

impl SessionCookies {
    /// Collect `name=value` pairs from `Set-Cookie` header values.
    ///
    /// Attributes (`Path`, `HttpOnly`, ...) are ignored. A repeated name keeps
    /// its first position and takes the latest value.
    pub fn from_set_cookie<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut cookies = Self::default();
        for header in headers {
            let pair = header.split(';').next().unwrap_or_default();
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            cookies.insert(name, value.trim());
        }
        cookies
    }

    fn insert(&mut self, name: &str, value: &str) {
        match self.pairs.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.pairs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Value for a `Cookie` request header, or `None` when there are no cookies.
    pub fn header_value(&self) -> Option<String> {
        if self.pairs.is_empty() {
            return None;
        }
        Some(
            self.pairs
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Fetch the session endpoint and return the cookies it sets.
///
/// Any transport failure or non-2xx status fails the bootstrap.
pub async fn establish_session(
    url: &Url,
    timeout: Option<Duration>,
) -> Result<SessionCookies, ClientError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder
        .build()
        .map_err(|e| ClientError::Session(format!("failed to build HTTP client: {}", e)))?;

    debug!(url = %url, "Establishing daemon session");
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ClientError::Session(format!("GET {}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Session(format!(
            "GET {} returned {}",
            url, status
        )));
    }

    let cookies = SessionCookies::from_set_cookie(
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    );
    info!(url = %url, cookies = cookies.len(), "Daemon session established");
    Ok(cookies)
}
