//! Circuit breaker pattern implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::context::{ExceptionContext, SendingContext, SentContext};
use crate::handler::Handler;
use crate::registry::HandlerRegistry;
use crate::stage::Priority;
use crate::{HttpClientError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, limited requests are allowed for testing.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures to open the circuit.
    pub failure_threshold: u32,
    /// Number of successful requests to close the circuit.
    pub success_threshold: u32,
    /// Time to wait before attempting to close the circuit.
    pub reset_timeout: Duration,
    /// Number of requests to allow in half-open state.
    pub half_open_requests: u32,
    /// Time window for counting failures.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 3,
            failure_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            ..Default::default()
        }
    }

    /// Set the success threshold to close the circuit.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the number of half-open requests.
    pub fn with_half_open_requests(mut self, count: u32) -> Self {
        self.half_open_requests = count;
        self
    }

    /// Set the failure counting window.
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

/// Circuit breaker implementation.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    half_open_count: AtomicU32,
    /// Milliseconds since `epoch` of the last failure.
    last_failure_time: AtomicU64,
    epoch: Instant,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_count: AtomicU32::new(0),
            last_failure_time: AtomicU64::new(0),
            epoch: Instant::now(),
            opened_at: RwLock::new(None),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.read()
    }

    /// Check if a request is allowed.
    pub fn is_allowed(&self) -> bool {
        self.maybe_transition_to_half_open();

        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let count = self.half_open_count.fetch_add(1, Ordering::SeqCst);
                count < self.config.half_open_requests
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.close();
                }
            }
            CircuitState::Open => {
                debug!("success recorded while circuit open, ignoring");
            }
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let now_millis = self.epoch.elapsed().as_millis() as u64;
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                let last_failure = self.last_failure_time.swap(now_millis, Ordering::SeqCst);
                let window_millis = self.config.failure_window.as_millis() as u64;

                let failures = if now_millis.saturating_sub(last_failure) > window_millis {
                    self.failure_count.store(1, Ordering::SeqCst);
                    1
                } else {
                    self.failure_count.fetch_add(1, Ordering::SeqCst) + 1
                };
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                self.open();
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        let mut state = self.state.write();
        if *state != CircuitState::Open {
            warn!(
                failures = self.failure_count.load(Ordering::SeqCst),
                "circuit breaker opening"
            );
            *state = CircuitState::Open;
            *self.opened_at.write() = Some(Instant::now());
            self.half_open_count.store(0, Ordering::SeqCst);
            self.success_count.store(0, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closing");
            *state = CircuitState::Closed;
            *self.opened_at.write() = None;
            self.failure_count.store(0, Ordering::SeqCst);
            self.success_count.store(0, Ordering::SeqCst);
            self.half_open_count.store(0, Ordering::SeqCst);
        }
    }

    fn maybe_transition_to_half_open(&self) {
        let state = *self.state.read();
        if state != CircuitState::Open {
            return;
        }

        let opened_at = *self.opened_at.read();
        if let Some(opened) = opened_at
            && opened.elapsed() >= self.config.reset_timeout
        {
            let mut state = self.state.write();
            if *state == CircuitState::Open {
                debug!("circuit breaker transitioning to half-open");
                *state = CircuitState::HalfOpen;
                self.half_open_count.store(0, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Failures counted in the current window.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }
}

/// Drives a [`CircuitBreaker`] from the pipeline.
///
/// Installed at `First` on three stages: Sending rejects calls while the
/// circuit is open, Sent records 5xx responses as failures and everything
/// else as success, Exception records transport faults.
#[derive(Debug, Clone)]
pub struct CircuitBreakerHandler {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerHandler {
    /// Create a handler with its own breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_breaker(Arc::new(CircuitBreaker::new(config)))
    }

    /// Create a handler around a shared breaker.
    pub fn with_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// Get the breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Register the Sending, Sent and Exception handlers.
    pub fn install(self, registry: &mut HandlerRegistry) {
        let handler = Arc::new(self);
        registry
            .on::<SendingContext, _>(Priority::First, Arc::clone(&handler))
            .on::<SentContext, _>(Priority::First, Arc::clone(&handler))
            .on::<ExceptionContext, _>(Priority::First, handler);
    }
}

#[async_trait]
impl Handler<SendingContext> for CircuitBreakerHandler {
    async fn handle(&self, context: &mut SendingContext) -> Result<()> {
        if self.breaker.is_allowed() {
            return Ok(());
        }
        debug!(url = %context.request().url(), "circuit open, rejecting request");
        Err(HttpClientError::CircuitOpen)
    }
}

#[async_trait]
impl Handler<SentContext> for CircuitBreakerHandler {
    async fn handle(&self, context: &mut SentContext) -> Result<()> {
        if context.status().is_server_error() {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<ExceptionContext> for CircuitBreakerHandler {
    async fn handle(&self, context: &mut ExceptionContext) -> Result<()> {
        if context.error().is_transport() {
            self.breaker.record_failure();
        }
        Ok(())
    }
}
