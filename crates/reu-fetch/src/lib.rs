//! HTTP fetch layer for source sites and APIs.
//!
//! One request per call, no retries: a failed source is skipped for the
//! current sync pass and picked up again on the next run.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "reu-fetch";

const BODY_SNIPPET_CHARS: usize = 200;

/// Client-wide configuration. Per-request headers passed to [`Fetcher::get`]
/// override these defaults.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "reu-cafe-bot/0.1".to_string(),
            default_headers: BTreeMap::new(),
        }
    }
}

/// Raw response handed to the extractor.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Could not reach the source: connection refused, DNS failure, timeout.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The source answered with a non-2xx status.
    #[error("http status {status} for {url}")]
    Http {
        status: u16,
        url: String,
        body_snippet: String,
    },
}

#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(build_header_map(&config.default_headers)?)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Issue a single GET and return the body on any 2xx status.
    pub async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        query: &BTreeMap<String, String>,
    ) -> Result<RawResponse, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !query.is_empty() {
            request = request.query(&query.iter().collect::<Vec<_>>());
        }

        let response = request.send().await.map_err(|source| FetchError::Network {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        let final_url = response.url().to_string();
        debug!(target: "reu::scraper", %final_url, status = status.as_u16(), "fetched");

        // Read the body even on failure so the caller can log a diagnostic
        // snippet; a body read error after a success status is still a
        // network failure.
        if status.is_success() {
            let body = response.text().await.map_err(|source| FetchError::Network {
                url: final_url.clone(),
                source,
            })?;
            return Ok(RawResponse {
                status: status.as_u16(),
                final_url,
                body,
            });
        }

        let body_snippet = response
            .text()
            .await
            .map(|body| snippet(&body))
            .unwrap_or_default();
        Err(FetchError::Http {
            status: status.as_u16(),
            url: final_url,
            body_snippet,
        })
    }
}

fn build_header_map(headers: &BTreeMap<String, String>) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name: HeaderName = name
            .parse()
            .with_context(|| format!("invalid header name `{name}`"))?;
        let value: HeaderValue = value
            .parse()
            .with_context(|| format!("invalid value for header `{name:?}`"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// First [`BODY_SNIPPET_CHARS`] characters of a body, for error diagnostics.
pub fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let body = "é".repeat(500);
        let cut = snippet(&body);
        assert_eq!(cut.chars().count(), 200);
        assert!(body.starts_with(&cut));
    }

    #[test]
    fn snippet_keeps_short_bodies_whole() {
        assert_eq!(snippet("not found"), "not found");
    }

    #[test]
    fn header_map_accepts_bearer_token() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc123".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        let map = build_header_map(&headers).expect("valid headers");
        assert_eq!(map.len(), 2);
        assert_eq!(map["authorization"], "Bearer abc123");
    }

    #[test]
    fn header_map_rejects_invalid_names() {
        let mut headers = BTreeMap::new();
        headers.insert("not a header\n".to_string(), "x".to_string());
        assert!(build_header_map(&headers).is_err());
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error() {
        let fetcher = Fetcher::new(&FetchConfig {
            timeout: Duration::from_millis(500),
            ..FetchConfig::default()
        })
        .expect("fetcher");
        // Port 9 (discard) is not listening on loopback in the test env.
        let err = fetcher
            .get("http://127.0.0.1:9/", &BTreeMap::new(), &BTreeMap::new())
            .await
            .expect_err("should fail");
        assert!(matches!(err, FetchError::Network { .. }));
    }
}
