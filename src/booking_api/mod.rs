//! Native booking-platform API client.
//!
//! Direct HTTP via reqwest against the platform's REST surface:
//! organization-scoped list endpoints, opaque continuation tokens, one
//! status filter per call, Retry-After on 429.
//!
//! Modules:
//! - events: event type discovery, scheduled-event pages, invitee lookup

pub mod events;

use std::time::Duration;

use url::Url;

pub use events::{BookingEvent, EventSource, EventTypeInfo, EventsPage, EventsPageQuery, InviteeDetail};

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BookingApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Access token rejected by the source")]
    AuthExpired,
    #[error("Rate limited by the source")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("Invalid API base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl BookingApiError {
    /// Returns true if retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BookingApiError::RateLimited { .. } => true,
            BookingApiError::Http(e) => e.is_timeout() || e.is_connect(),
            BookingApiError::ApiError { status, .. } => *status >= 500 || *status == 408,
            BookingApiError::AuthExpired
            | BookingApiError::InvalidBaseUrl(_)
            | BookingApiError::Json(_) => false,
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

/// Seconds the source asked us to wait, if it said so.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(secs) = parse_retry_after(retry_after) {
        return Duration::from_secs(secs.min(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying rate limits, timeouts, and server errors with
/// exponential backoff. Honors Retry-After when the source provides one.
///
/// After the final attempt the response is returned as-is; the caller maps
/// the status to a typed error so a still-limited 429 surfaces as
/// `RateLimited` for the reconciler's own status-level handling.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, BookingApiError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(BookingApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "booking_api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "booking_api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(BookingApiError::Http(err));
            }
        }
    }

    unreachable!("send_with_retry loop always returns within max attempts")
}

/// Map a non-success response to a typed error, consuming the body for the
/// message. 401 means the project's token is dead; 429 carries the wait
/// hint forward.
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, BookingApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(BookingApiError::AuthExpired);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs =
            parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
        return Err(BookingApiError::RateLimited { retry_after_secs });
    }
    let body = response.text().await.unwrap_or_default();
    Err(BookingApiError::ApiError {
        status: status.as_u16(),
        message: body,
    })
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client bound to one project's token and organization scope.
pub struct BookingClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
    policy: RetryPolicy,
    page_size: u32,
}

impl BookingClient {
    pub fn new(
        base_url: &str,
        access_token: &str,
        page_size: u32,
    ) -> Result<Self, BookingApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BookingApiError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            access_token: access_token.to_string(),
            policy: RetryPolicy::default(),
            page_size,
        })
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, BookingApiError> {
        // Url::join treats a base without a trailing slash as a file; build
        // from segments instead so "/v2" bases keep their prefix.
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BookingApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }

    pub(crate) fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.http.get(url).bearer_auth(&self.access_token)
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.page_size
    }
}

// ============================================================================
// Tests
// ============================================================================
