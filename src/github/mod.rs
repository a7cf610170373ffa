//! Resilient upstream REST client.
//!
//! Wraps the REST API v3 with token rotation, conditional GETs, rate-limit
//! accounting and bounded retries. Callers get typed outcomes: a decoded
//! value with fresh validators, `NotModified`, or a classified error.
//! Permanently-gone statuses come back as [`GithubError::Gone`] so the
//! hallmonitor can tombstone.

pub mod tokens;
pub mod types;

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cancel::Scope;
use crate::config::GithubConfig;
use crate::error::GithubError;

pub use tokens::TokenPool;
pub use types::{ApiContents, ApiGist, ApiRepo, ApiUser};

/// Upstream API host.
const API_BASE_URL: &str = "https://api.github.com";

/// Per-request transport timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry backoff base.
const RETRY_BASE: Duration = Duration::from_millis(750);

/// Retry backoff ceiling.
const RETRY_CAP: Duration = Duration::from_secs(60);

/// Diagnostic tail kept from error bodies.
const BODY_TAIL: usize = 256;

/// Validators replayed on a conditional request.
#[derive(Debug, Clone, Default)]
pub struct Conditional {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Conditional {
    pub fn etag(etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
            last_modified: None,
        }
    }
}

/// A decoded response or a 304.
#[derive(Debug)]
pub enum Fetched<T> {
    Modified {
        value: T,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    NotModified,
}

impl<T> Fetched<T> {
    pub fn is_modified(&self) -> bool {
        matches!(self, Fetched::Modified { .. })
    }
}

/// Shared REST client; cloning shares the token pool.
#[derive(Clone)]
pub struct GithubClient {
    http: Client,
    base_url: String,
    user_agent: String,
    tokens: TokenPool,
    max_retries: u32,
}

impl GithubClient {
    pub fn new(config: &GithubConfig) -> Self {
        Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: API_BASE_URL.to_string(),
            user_agent: config.user_agent.clone(),
            tokens: TokenPool::new(config.tokens.clone()),
            max_retries: config.max_retries.max(1),
        }
    }

    /// Overrides the API host, for tests against a local server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    // ------------------------------------------------------------------
    // Typed endpoints
    // ------------------------------------------------------------------

    pub async fn repo_by_id(
        &self,
        id: i64,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<ApiRepo>, GithubError> {
        self.get_json(&format!("/repositories/{}", id), cond, scope)
            .await
    }

    pub async fn repo_by_name(
        &self,
        owner: &str,
        repo: &str,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<ApiRepo>, GithubError> {
        self.get_json(&format!("/repos/{}/{}", owner, repo), cond, scope)
            .await
    }

    pub async fn repo_languages(
        &self,
        owner: &str,
        repo: &str,
        scope: &Scope,
    ) -> Result<Fetched<std::collections::BTreeMap<String, i64>>, GithubError> {
        self.get_json(&format!("/repos/{}/{}/languages", owner, repo), None, scope)
            .await
    }

    pub async fn contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<ApiContents>, GithubError> {
        let path = format!(
            "/repos/{}/{}/contents/{}?ref={}",
            owner,
            repo,
            urlencoding::encode(path),
            urlencoding::encode(git_ref)
        );
        self.get_json(&path, cond, scope).await
    }

    pub async fn user_by_id(
        &self,
        id: i64,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<ApiUser>, GithubError> {
        self.get_json(&format!("/user/{}", id), cond, scope).await
    }

    pub async fn user_by_login(
        &self,
        login: &str,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<ApiUser>, GithubError> {
        self.get_json(&format!("/users/{}", login), cond, scope)
            .await
    }

    pub async fn gists(
        &self,
        login: &str,
        per_page: u32,
        page: u32,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<Vec<ApiGist>>, GithubError> {
        let path = format!(
            "/users/{}/gists?per_page={}&page={}",
            login, per_page, page
        );
        self.get_json(&path, cond, scope).await
    }

    // ------------------------------------------------------------------
    // Core request loop
    // ------------------------------------------------------------------

    /// One logical GET with token rotation, conditional headers, rate-limit
    /// waits and bounded retries. Waits never extend past the scope deadline.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cond: Option<&Conditional>,
        scope: &Scope,
    ) -> Result<Fetched<T>, GithubError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        while attempt < self.max_retries {
            if scope.is_cancelled() {
                return Err(GithubError::Cancelled);
            }
            attempt += 1;

            // Pick a token with budget left; if all are exhausted, wait for
            // the earliest reset.
            let token = match self.tokens.pick(Utc::now().timestamp()) {
                Ok(token) => token,
                Err(wait_secs) => {
                    let wait = Duration::from_secs(wait_secs.max(1) as u64);
                    // A wait that cannot fit the deadline surfaces as a
                    // rate-limit error so queue workers reschedule instead
                    // of blocking.
                    if scope.remaining().is_some_and(|left| wait > left) {
                        return Err(GithubError::RateLimited {
                            reset_epoch: Utc::now().timestamp() + wait_secs,
                        });
                    }
                    debug!(wait_secs = wait.as_secs(), "all tokens exhausted, waiting for reset");
                    if !scope.sleep(wait).await {
                        return Err(GithubError::Cancelled);
                    }
                    attempt -= 1;
                    continue;
                }
            };

            let mut request = self
                .http
                .get(&url)
                .header("User-Agent", &self.user_agent)
                .header("Accept", "application/vnd.github+json");
            if let Some(ref value) = token.value {
                request = request.header("Authorization", format!("token {}", value));
            }
            if let Some(cond) = cond {
                if let Some(ref etag) = cond.etag {
                    request = request.header("If-None-Match", etag);
                }
                if let Some(ref last_modified) = cond.last_modified {
                    request = request.header("If-Modified-Since", last_modified);
                }
            }
            if let Some(remaining) = scope.remaining() {
                request = request.timeout(remaining.min(REQUEST_TIMEOUT));
            }

            let response = tokio::select! {
                result = request.send() => result,
                _ = scope.token().cancelled() => return Err(GithubError::Cancelled),
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    last_error = err.to_string();
                    warn!(attempt, error = %last_error, "upstream transport error");
                    if !scope.sleep(backoff_delay(attempt)).await {
                        return Err(GithubError::Cancelled);
                    }
                    continue;
                }
            };

            let status = response.status();
            self.tokens.observe(token.index, &response);

            match classify_status(status, &response) {
                StatusClass::Ok => {
                    let etag = header_string(&response, "etag");
                    let last_modified = header_string(&response, "last-modified");
                    let value = response
                        .json::<T>()
                        .await
                        .map_err(|e| GithubError::Decode(e.to_string()))?;
                    return Ok(Fetched::Modified {
                        value,
                        etag,
                        last_modified,
                    });
                }
                StatusClass::NotModified => return Ok(Fetched::NotModified),
                StatusClass::Gone => {
                    let reason = status
                        .canonical_reason()
                        .unwrap_or("Gone")
                        .to_string();
                    drain(response).await;
                    return Err(GithubError::Gone {
                        status: status.as_u16(),
                        reason,
                    });
                }
                StatusClass::RateLimited => {
                    let reset_epoch = rate_limit_reset(&response)
                        .unwrap_or_else(|| Utc::now().timestamp() + 60);
                    drain(response).await;
                    let wait = Duration::from_secs(
                        (reset_epoch - Utc::now().timestamp()).max(1) as u64,
                    );
                    if scope.remaining().is_some_and(|left| wait > left) {
                        return Err(GithubError::RateLimited { reset_epoch });
                    }
                    warn!(wait_secs = wait.as_secs(), "rate limited, honoring reset");
                    if !scope.sleep(wait).await {
                        return Err(GithubError::Cancelled);
                    }
                    last_error = format!("rate limited until {}", reset_epoch);
                    continue;
                }
                StatusClass::Unauthorized => {
                    drain(response).await;
                    return Err(GithubError::Unauthorized {
                        status: status.as_u16(),
                    });
                }
                StatusClass::Transient => {
                    let tail = body_tail(response).await;
                    last_error = format!("HTTP {}: {}", status.as_u16(), tail);
                    warn!(attempt, status = status.as_u16(), "transient upstream error");
                    if !scope.sleep(backoff_delay(attempt)).await {
                        return Err(GithubError::Cancelled);
                    }
                    continue;
                }
                StatusClass::Fatal => {
                    let tail = body_tail(response).await;
                    return Err(GithubError::Unexpected {
                        status: status.as_u16(),
                        body: tail,
                    });
                }
            }
        }

        Err(GithubError::RetriesExhausted {
            attempts: attempt,
            last: last_error,
        })
    }
}

enum StatusClass {
    Ok,
    NotModified,
    Gone,
    RateLimited,
    Unauthorized,
    Transient,
    Fatal,
}

fn classify_status(status: StatusCode, response: &reqwest::Response) -> StatusClass {
    match status.as_u16() {
        200..=299 => StatusClass::Ok,
        304 => StatusClass::NotModified,
        404 | 410 | 451 => StatusClass::Gone,
        429 => StatusClass::RateLimited,
        403 => {
            // 403 doubles as a rate-limit response; the headers disambiguate.
            if remaining_zero(response) || response.headers().contains_key("retry-after") {
                StatusClass::RateLimited
            } else {
                StatusClass::Unauthorized
            }
        }
        401 => StatusClass::Unauthorized,
        500 | 502 | 503 | 504 => StatusClass::Transient,
        _ => StatusClass::Fatal,
    }
}

fn remaining_zero(response: &reqwest::Response) -> bool {
    header_i64(response, "x-ratelimit-remaining") == Some(0)
}

/// Earliest epoch-second a rate-limited caller may retry at.
fn rate_limit_reset(response: &reqwest::Response) -> Option<i64> {
    if let Some(after) = header_i64(response, "retry-after") {
        return Some(Utc::now().timestamp() + after);
    }
    header_i64(response, "x-ratelimit-reset")
}

fn header_i64(response: &reqwest::Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Consumes and discards an unwanted body so the connection can be reused.
async fn drain(response: reqwest::Response) {
    let _ = response.bytes().await;
}

/// Keeps a small tail of an error body for diagnostics.
async fn body_tail(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => body.chars().take(BODY_TAIL).collect(),
        Err(_) => String::new(),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(RETRY_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(1) < backoff_delay(2));
        assert!(backoff_delay(2) < backoff_delay(3));
        assert_eq!(backoff_delay(30), RETRY_CAP);
    }

    #[test]
    fn conditional_helper() {
        let cond = Conditional::etag("\"abc\"");
        assert_eq!(cond.etag.as_deref(), Some("\"abc\""));
        assert!(cond.last_modified.is_none());
    }
}
