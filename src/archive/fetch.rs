//! HTTP fetcher for hourly archive files.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::cancel::Scope;
use crate::error::ArchiveError;
use crate::hour::HourKey;

/// Upstream archive host.
const ARCHIVE_BASE_URL: &str = "https://data.gharchive.org";

/// Per-request ceiling; archive hours run to a few hundred megabytes.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Validators from a previous fetch, replayed on a conditional GET.
#[derive(Debug, Clone, Default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Result of asking upstream for one hour.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The validators still hold; the cached copy is current.
    NotModified,
    /// Fresh archive bytes plus the validators to remember.
    Fetched {
        bytes: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Source of raw `.json.gz` archive bytes for an hour.
#[async_trait]
pub trait HourFetcher: Send + Sync {
    /// Fetches one hour. `validators` turns the request conditional; a
    /// conditional request may answer [`FetchOutcome::NotModified`].
    async fn fetch(
        &self,
        hour: HourKey,
        validators: Option<&Validators>,
        scope: &Scope,
    ) -> Result<FetchOutcome, ArchiveError>;
}

/// Fetcher against the public archive host.
pub struct HttpHourFetcher {
    client: Client,
    base_url: String,
    user_agent: String,
}

impl HttpHourFetcher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: ARCHIVE_BASE_URL.to_string(),
            user_agent: user_agent.into(),
        }
    }

    /// Overrides the archive host, for tests against a local server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl HourFetcher for HttpHourFetcher {
    async fn fetch(
        &self,
        hour: HourKey,
        validators: Option<&Validators>,
        scope: &Scope,
    ) -> Result<FetchOutcome, ArchiveError> {
        if scope.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let url = format!("{}/{}.json.gz", self.base_url, hour.archive_stem());
        let mut request = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent);
        if let Some(timeout) = scope.remaining() {
            request = request.timeout(timeout.min(FETCH_TIMEOUT));
        }
        if let Some(validators) = validators {
            if let Some(ref etag) = validators.etag {
                request = request.header("If-None-Match", etag);
            }
            if let Some(ref last_modified) = validators.last_modified {
                request = request.header("If-Modified-Since", last_modified);
            }
        }

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| ArchiveError::Http(e.to_string()))?,
            _ = scope.token().cancelled() => return Err(ArchiveError::Cancelled),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(ArchiveError::Status {
                status: status.as_u16(),
                hour: hour.to_string(),
            });
        }

        let etag = header_string(&response, "etag");
        let last_modified = header_string(&response, "last-modified");
        let bytes = tokio::select! {
            result = response.bytes() => result.map_err(|e| ArchiveError::Http(e.to_string()))?,
            _ = scope.token().cancelled() => return Err(ArchiveError::Cancelled),
        };

        Ok(FetchOutcome::Fetched {
            bytes: bytes.to_vec(),
            etag,
            last_modified,
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validators_emptiness() {
        assert!(Validators::default().is_empty());
        assert!(!Validators {
            etag: Some("\"abc\"".into()),
            last_modified: None
        }
        .is_empty());
    }

    #[test]
    fn fetch_url_shape() {
        let hour: HourKey = "2015-01-02T03".parse().unwrap();
        let url = format!("{}/{}.json.gz", ARCHIVE_BASE_URL, hour.archive_stem());
        assert_eq!(url, "https://data.gharchive.org/2015-01-02-3.json.gz");
    }
}
