//! Shared HTTP transport: client construction and the retry policy applied
//! beneath every terminology and PubMed call.

use std::time::Duration;

use reqwest::{
    header::{HeaderValue, RETRY_AFTER},
    Client, Response, StatusCode,
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Settings;

/// Failures surfaced by the transport once retries are exhausted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status} after {attempts} attempt(s)")]
    Status {
        url: String,
        status: StatusCode,
        attempts: u32,
    },
    #[error("could not read body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    /// HTTP status carried by the failure, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Retry behaviour for idempotent GET requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each later attempt.
    pub backoff: Duration,
    pub retryable_statuses: Vec<StatusCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1500),
            retryable_statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status)
    }

    fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        retry_after.map_or(exp, |hint| hint.max(exp))
    }
}

/// Build the shared client with the configured timeout.
pub fn build_client(settings: &Settings) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(format!("mesh2icd/0.1 (+{})", settings.pubmed_email))
        .timeout(settings.http_timeout)
        .gzip(true)
        .brotli(true)
        .build()
}

/// GET `url`, retrying transport errors and retryable statuses.
///
/// Returns the first successful response. A non-retryable status (404 for
/// instance) is returned immediately as [`TransportError::Status`].
pub async fn get_with_retry(
    client: &Client,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Response, TransportError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                if !policy.is_retryable(status) || attempt >= attempts {
                    return Err(TransportError::Status {
                        url: redact(url),
                        status,
                        attempts: attempt,
                    });
                }
                let delay = policy.delay_for(attempt, parse_retry_after(resp.headers().get(RETRY_AFTER)));
                warn!(%status, attempt, delay_ms = delay.as_millis() as u64, "retryable status");
                sleep(delay).await;
            }
            Err(err) => {
                // reqwest errors embed the full URL, api key included.
                let err = err.without_url();
                if attempt >= attempts {
                    return Err(TransportError::Request {
                        url: redact(url),
                        source: err,
                    });
                }
                let delay = policy.delay_for(attempt, None);
                warn!(%err, attempt, delay_ms = delay.as_millis() as u64, "request error, retrying");
                sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

/// GET `url` with retries and decode the body as text.
pub async fn get_text(client: &Client, url: &str, policy: &RetryPolicy) -> Result<String, TransportError> {
    let resp = get_with_retry(client, url, policy).await?;
    resp.text().await.map_err(|source| TransportError::Body {
        url: redact(url),
        source: source.without_url(),
    })
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let secs: u64 = value?.to_str().ok()?.trim().parse().ok()?;
    debug!(secs, "server sent Retry-After");
    Some(Duration::from_secs(secs))
}

/// Strip credentials from a URL before it reaches logs or error messages.
pub fn redact(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let params: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("apikey") || key == "api_key" => {
                format!("{key}=***")
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", params.join("&"))
}
