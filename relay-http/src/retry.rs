//! Retry configuration, strategies and the retry handler.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::context::SentContext;
use crate::handler::Handler;
use crate::{HttpClientError, Response, Result};

/// Item key counting the retries made so far by one call.
pub const RETRY_COUNT: &str = "RetryCount";

/// Item key holding the instant the first retry started.
pub const RETRY_STARTED_AT: &str = "RetryStartedAt";

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Status codes that should trigger a retry.
    pub retry_status_codes: Vec<u16>,
    /// Whether a connection error raised by a nested attempt is retried.
    ///
    /// Retries start from a received response, so a connection error on
    /// the first attempt reaches the Exception stage directly.
    pub retry_on_connection_error: bool,
    /// Whether a timeout raised by a nested attempt is retried. Same scope
    /// as `retry_on_connection_error`.
    pub retry_on_timeout: bool,
    /// Whether a `Retry-After` header overrides the backoff delay.
    pub respect_retry_after: bool,
    /// Maximum total time for all retries.
    pub max_retry_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(10),
                multiplier: 2.0,
            },
            retry_status_codes: vec![408, 429, 500, 502, 503, 504],
            retry_on_connection_error: true,
            retry_on_timeout: true,
            respect_retry_after: true,
            max_retry_time: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryConfig {
    /// Create a retry config with exponential backoff.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial: initial_delay,
                max: Duration::from_secs(30),
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    /// Create a retry config with linear backoff.
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Linear {
                delay,
                max: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    /// Create a retry config with constant delay.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Constant(delay),
            ..Default::default()
        }
    }

    /// Create a retry config with no delay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::None,
            ..Default::default()
        }
    }

    /// Replace the status codes to retry on.
    pub fn with_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_status_codes = codes;
        self
    }

    /// Disable retry on connection errors.
    pub fn no_retry_on_connection(mut self) -> Self {
        self.retry_on_connection_error = false;
        self
    }

    /// Disable retry on timeout errors.
    pub fn no_retry_on_timeout(mut self) -> Self {
        self.retry_on_timeout = false;
        self
    }

    /// Ignore `Retry-After` headers.
    pub fn ignore_retry_after(mut self) -> Self {
        self.respect_retry_after = false;
        self
    }

    /// Set maximum total retry time.
    pub fn with_max_retry_time(mut self, duration: Duration) -> Self {
        self.max_retry_time = Some(duration);
        self
    }

    /// Calculate delay for a given attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Constant delay between retries.
    Constant(Duration),
    /// Linear backoff: delay increases by a fixed amount.
    Linear {
        /// Delay increment per attempt.
        delay: Duration,
        /// Maximum delay.
        max: Duration,
    },
    /// Exponential backoff: delay doubles each attempt.
    Exponential {
        /// Initial delay.
        initial: Duration,
        /// Maximum delay.
        max: Duration,
        /// Multiplier (typically 2.0).
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear { delay, max } => {
                let total = delay.saturating_mul(attempt + 1);
                total.min(*max)
            }
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

/// Retry strategy trait for custom retry logic.
///
/// `attempt` is the number of retries already made.
pub trait RetryStrategy: Send + Sync + 'static {
    /// Check if a failed nested attempt should be retried.
    ///
    /// Only consulted for faults of attempts started by a retry; the first
    /// retry is always decided by [`should_retry_response`](Self::should_retry_response).
    fn should_retry(&self, attempt: u32, error: &HttpClientError) -> bool;

    /// Check if a received response should be retried.
    fn should_retry_response(&self, attempt: u32, response: &Response) -> bool;

    /// Get the delay before the next retry.
    fn retry_delay(&self, attempt: u32, response: Option<&Response>) -> Duration;

    /// Upper bound on the time spent retrying one call.
    fn max_retry_time(&self) -> Option<Duration> {
        None
    }
}

impl RetryStrategy for RetryConfig {
    fn should_retry(&self, attempt: u32, error: &HttpClientError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        match error {
            HttpClientError::Timeout(_) => self.retry_on_timeout,
            HttpClientError::Connection(_) => self.retry_on_connection_error,
            HttpClientError::CallFailed { status, .. } => {
                self.retry_status_codes.contains(&status.as_u16())
            }
            HttpClientError::Http(e) => {
                if e.is_timeout() {
                    self.retry_on_timeout
                } else if e.is_connect() {
                    self.retry_on_connection_error
                } else if let Some(status) = e.status() {
                    self.retry_status_codes.contains(&status.as_u16())
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn should_retry_response(&self, attempt: u32, response: &Response) -> bool {
        attempt < self.max_attempts && self.should_retry_status(response.status().as_u16())
    }

    fn retry_delay(&self, attempt: u32, response: Option<&Response>) -> Duration {
        let retry_after = response
            .filter(|_| self.respect_retry_after)
            .and_then(retry_after);
        retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt))
    }

    fn max_retry_time(&self) -> Option<Duration> {
        self.max_retry_time
    }
}

/// `Retry-After` given in seconds.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Sent handler that re-runs the call while the strategy asks for it.
///
/// Each retry is a nested call through
/// [`SentContext::recursive_result`]; the retry counter lives in the item
/// bag under [`RETRY_COUNT`], so nested attempts see the retries their
/// parents made. A retry replays the request of the attempt it retries.
///
/// The handler runs on received responses. Transport faults are retried
/// when a nested attempt raises them; a fault on the first attempt goes to
/// the Exception stage.
pub struct RetryHandler<S = RetryConfig> {
    strategy: S,
}

impl<S: RetryStrategy> RetryHandler<S> {
    /// Create a retry handler.
    pub fn new(strategy: S) -> Self {
        Self { strategy }
    }

    /// Get the strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    fn budget_exhausted(&self, context: &SentContext) -> bool {
        let Some(limit) = self.strategy.max_retry_time() else {
            return false;
        };
        let started = context
            .items()
            .get::<Instant>(RETRY_STARTED_AT)
            .unwrap_or_else(|| {
                let now = Instant::now();
                context.items().insert(RETRY_STARTED_AT, now);
                now
            });
        started.elapsed() >= limit
    }

    async fn wait(&self, context: &SentContext, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = context.cancellation().cancelled() => Err(HttpClientError::OperationCanceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl<S: RetryStrategy> Handler<SentContext> for RetryHandler<S> {
    async fn handle(&self, context: &mut SentContext) -> Result<()> {
        if context.result().is_dirty() {
            return Ok(());
        }
        let attempt = context.items().get::<u32>(RETRY_COUNT).unwrap_or(0);
        if !self
            .strategy
            .should_retry_response(attempt, context.response())
        {
            return Ok(());
        }

        let mut delay = self.strategy.retry_delay(attempt, Some(context.response()));
        loop {
            if self.budget_exhausted(context) {
                debug!("retry time budget exhausted");
                return Ok(());
            }

            let attempt = context
                .items()
                .update::<u32, _>(RETRY_COUNT, |count| *count += 1);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                url = %context.request().url(),
                "retrying request"
            );
            self.wait(context, delay).await?;

            match context.recursive_result().await {
                Ok(_) => return Ok(()),
                Err(error) => {
                    // Nested attempts may have retried too.
                    let made = context.items().get::<u32>(RETRY_COUNT).unwrap_or(attempt);
                    if !self.strategy.should_retry(made, &error) {
                        return Err(error);
                    }
                    debug!(error = %error, "nested attempt failed");
                    delay = self.strategy.retry_delay(made, None);
                }
            }
        }
    }
}
