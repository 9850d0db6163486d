//! Code-host HTTP clients and the identifiers shared across them.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;

pub mod github;
pub mod gitlab;
pub mod ratelimit;

pub use github::GitHubClient;
pub use gitlab::GitLabClient;
pub use ratelimit::RateLimitMonitor;

pub const SERVICE_TYPE_GITHUB: &str = "github";
pub const SERVICE_TYPE_GITLAB: &str = "gitlab";

/// Identifies a repository on a code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRepoSpec {
    /// Code-host identifier (GitHub node id, GitLab project id).
    pub id: String,
    pub service_type: String,
    /// Normalized base URL of the code host, with trailing slash.
    pub service_id: String,
}

/// A user's linked identity on a code host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAccount {
    pub id: i32,
    pub user_id: i32,
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
    pub access_token: Option<String>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next_page: bool,
}

#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("rate limited by code host, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request to {url} returned status {status}: {message}")]
    Api {
        url: String,
        status: u16,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode code host response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl CodeHostError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CodeHostError::NotFound { .. })
    }
}

/// Lower-case the host and force a trailing slash so the URL can serve as a service id.
pub fn normalize_base_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    if let Some(host) = url.host_str() {
        let lowered = host.to_ascii_lowercase();
        if lowered != host {
            // Setting a lower-cased form of an existing valid host cannot fail.
            let _ = normalized.set_host(Some(&lowered));
        }
    }
    if !normalized.path().ends_with('/') {
        let path = format!("{}/", normalized.path());
        normalized.set_path(&path);
    }
    normalized.set_query(None);
    normalized.set_fragment(None);
    normalized
}

/// Parse and normalize a base URL string.
pub fn parse_base_url(raw: &str) -> Result<Url, url::ParseError> {
    Url::parse(raw).map(|url| normalize_base_url(&url))
}

/// Record one code-host request in the request counter and latency histogram.
pub(crate) fn record_request(
    client: &'static str,
    category: &'static str,
    status: Option<u16>,
    started: Instant,
) {
    let status = status.map_or_else(|| "error".to_string(), |code| code.to_string());
    counter!(
        "permsync_codehost_requests_total",
        "client" => client,
        "category" => category,
        "status" => status
    )
    .increment(1);
    histogram!(
        "permsync_codehost_request_duration_seconds",
        "client" => client,
        "category" => category
    )
    .record(started.elapsed().as_secs_f64());
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, "Retry-After")
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}
