//! Shared API HTTP client
//!
//! One client for the whole process: pooled connections, redirects
//! disabled (a 3xx from the API means the anti-bot interstitial, which is
//! an error, not a location to follow), and the header set the site
//! currently requires. Transient failures are retried with exponential
//! backoff, honoring `Retry-After`.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, ORIGIN, REFERER, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::constants::network;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API redirected ({0}), likely an anti-bot interstitial")]
    Redirected(u16),

    #[error("Authentication required ({0}); session/DDG cookies needed")]
    Unauthorized(u16),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Response was not valid JSON")]
    InvalidJson,

    #[error("Response had an unexpected shape")]
    UnexpectedShape,
}

impl ApiError {
    /// Transient errors are worth another page-level attempt; protocol
    /// errors (redirects, auth) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::InvalidJson => true,
            Self::Status(code) => matches!(*code, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

/// Cookies carried on API requests.
#[derive(Debug, Clone, Default)]
pub struct SessionCookies {
    pub session: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl SessionCookies {
    fn header_value(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(session) = &self.session {
            parts.push(format!("session={}", session));
        }
        for (name, value) in &self.extra {
            parts.push(format!("{}={}", name, value));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Process-wide client for the posts API.
pub struct ApiClient {
    http: reqwest::Client,
    cookies: SessionCookies,
}

impl ApiClient {
    pub fn new(cookies: SessionCookies) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(network::API_ACCEPT));

        let http = reqwest::Client::builder()
            .user_agent(network::USER_AGENT)
            .default_headers(headers)
            .pool_max_idle_per_host(network::POOL_MAX_IDLE_PER_HOST)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(network::CONNECT_TIMEOUT)
            .read_timeout(network::READ_TIMEOUT)
            .build()?;

        Ok(Self { http, cookies })
    }

    /// GET `url` and parse the body as JSON, retrying 429/5xx and socket
    /// errors within the client's budget. `referer` should point at the
    /// profile page the request is about.
    pub async fn get_json(&self, url: &str, referer: &str) -> Result<Value, ApiError> {
        let mut backoff = network::API_BACKOFF_BASE;
        let mut last_error: Option<ApiError> = None;

        for attempt in 0..network::API_RETRIES {
            let mut request = self
                .http
                .get(url)
                .header(REFERER, referer)
                .header(ORIGIN, format!("https://{}", crate::constants::cdn::BASE_HOST));
            if let Some(cookie) = self.cookies.header_value() {
                request = request.header(COOKIE, cookie);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url, attempt, error = %e, "API request failed, backing off");
                    last_error = Some(ApiError::Network(e));
                    tokio::time::sleep(backoff).await;
                    backoff = grow_backoff(backoff);
                    continue;
                }
            };

            let status = response.status();

            if status.is_redirection() {
                error!(url, status = status.as_u16(), "API redirected, aborting");
                return Err(ApiError::Redirected(status.as_u16()));
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ApiError::Unauthorized(status.as_u16()));
            }

            if matches!(status.as_u16(), 429 | 502 | 503 | 504) {
                let delay = retry_after(&response)
                    .unwrap_or(backoff)
                    .min(network::API_BACKOFF_CAP);
                warn!(url, status = status.as_u16(), delay_secs = delay.as_secs(), "transient API status");
                last_error = Some(ApiError::Status(status.as_u16()));
                tokio::time::sleep(delay).await;
                backoff = grow_backoff(backoff);
                continue;
            }

            if !status.is_success() {
                return Err(ApiError::Status(status.as_u16()));
            }

            return response
                .json::<Value>()
                .await
                .map_err(|_| ApiError::InvalidJson);
        }

        Err(last_error.unwrap_or(ApiError::Status(0)))
    }
}

fn grow_backoff(current: Duration) -> Duration {
    current
        .mul_f64(network::API_BACKOFF_FACTOR)
        .min(network::API_BACKOFF_CAP)
}

/// `Retry-After` in seconds, tolerating absent or non-numeric values.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Append a unix-timestamp cache buster and extra query parameters.
pub fn build_url(base: &str, params: &[(&str, String)]) -> String {
    let mut url = match url::Url::parse(base) {
        Ok(url) => url,
        Err(_) => return base.to_string(),
    };
    {
        let mut query = url.query_pairs_mut();
        for (name, value) in params {
            query.append_pair(name, value);
        }
        let now = chrono::Utc::now().timestamp();
        query.append_pair("_", &now.to_string());
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_header_value() {
        let empty = SessionCookies::default();
        assert_eq!(empty.header_value(), None);

        let cookies = SessionCookies {
            session: Some("abc".to_string()),
            extra: vec![("__ddg1".to_string(), "xyz".to_string())],
        };
        assert_eq!(cookies.header_value().as_deref(), Some("session=abc; __ddg1=xyz"));
    }

    #[test]
    fn test_build_url_appends_params_and_buster() {
        let url = build_url(
            "https://coomer.st/api/v1/onlyfans/user/val/posts",
            &[("before_id", "99".to_string())],
        );
        assert!(url.starts_with("https://coomer.st/api/v1/onlyfans/user/val/posts?before_id=99&_="));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Status(429).is_transient());
        assert!(ApiError::Status(503).is_transient());
        assert!(!ApiError::Status(404).is_transient());
        assert!(!ApiError::Redirected(302).is_transient());
        assert!(!ApiError::Unauthorized(401).is_transient());
        assert!(ApiError::InvalidJson.is_transient());
    }

    #[tokio::test]
    async fn test_client_builds() {
        ApiClient::new(SessionCookies::default()).unwrap();
    }
}
