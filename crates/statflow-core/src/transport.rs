//! Rate-limited, retrying request execution.
//!
//! Every attempt, including retries, first reserves capacity with the
//! provider's rate limiter, so retries can never bust the ceilings the
//! initial attempt was held to.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryConfig;

/// A completed exchange and how many attempts it took.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub response: HttpResponse,
    pub attempts: u32,
}

/// The failure observed on one attempt.
#[derive(Debug, Clone)]
pub enum AttemptError {
    Status(u16),
    Transport(HttpError),
}

impl Display for AttemptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Transport(error) => write!(f, "{error}"),
        }
    }
}

/// Terminal failure of a retried exchange.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// A status the retry policy does not cover; retrying cannot help.
    #[error("fatal HTTP {status} after {attempts} attempts")]
    FatalStatus {
        status: u16,
        body: String,
        attempts: u32,
    },
    /// All attempts were spent on retryable failures.
    #[error("gave up after {attempts} attempts, last failure: {last}")]
    RetriesExhausted { attempts: u32, last: AttemptError },
}

/// HTTP client that folds the rate limiter and retry policy into a single
/// `execute` call.
pub struct RetryingClient {
    http: Arc<dyn HttpClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
}

impl RetryingClient {
    pub fn new(http: Arc<dyn HttpClient>, limiter: Arc<RateLimiter>, retry: RetryConfig) -> Self {
        Self {
            http,
            limiter,
            retry,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute a request, retrying transient failures with backoff. Returns
    /// the first success, the first fatal status, or the last retryable
    /// failure once attempts are spent.
    pub async fn execute(&self, request: HttpRequest) -> Result<Exchange, TransportError> {
        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0u32;

        loop {
            self.limiter.reserve(request.size_hint).await;
            attempts += 1;

            let failure = match self.http.execute(request.clone()).await {
                Ok(response) => {
                    self.limiter.record_bytes(response.body.len() as u64);
                    if response.is_success() {
                        return Ok(Exchange { response, attempts });
                    }
                    self.limiter.record_error();
                    if !self.retry.should_retry_status(response.status) {
                        return Err(TransportError::FatalStatus {
                            status: response.status,
                            body: response.body,
                            attempts,
                        });
                    }
                    let retry_after = response.retry_after_secs;
                    (AttemptError::Status(response.status), retry_after)
                }
                Err(error) => {
                    self.limiter.record_error();
                    (AttemptError::Transport(error), None)
                }
            };

            if attempts >= max_attempts {
                return Err(TransportError::RetriesExhausted {
                    attempts,
                    last: failure.0,
                });
            }

            let delay = match failure.1 {
                // A provider-supplied Retry-After overrides our own backoff.
                Some(secs) => Duration::from_secs(secs),
                None => self.retry.backoff.delay(attempts - 1),
            };
            tracing::debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                failure = %failure.0,
                "retrying request"
            );
            sleep(delay).await;
        }
    }
}
