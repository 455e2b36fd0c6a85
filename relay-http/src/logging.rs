//! Request and response logging handlers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use http::HeaderMap;

use crate::Result;
use crate::context::{ExceptionContext, SendingContext, SentContext};
use crate::handler::Handler;
use crate::registry::HandlerRegistry;
use crate::stage::Priority;

/// Item key holding the instant the current attempt entered Sending.
pub const LOGGING_STARTED_AT: &str = "LoggingStartedAt";

/// Logs outgoing requests, received responses and faults.
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler {
    log_headers: bool,
}

impl LoggingHandler {
    /// Create a new logging handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable logging of headers.
    pub fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }

    /// Register the handler on Sending (`First`), Sent (`Parallel`) and
    /// Exception (`First`).
    pub fn install(self, registry: &mut HandlerRegistry) {
        let handler = Arc::new(self);
        registry
            .on::<SendingContext, _>(Priority::First, Arc::clone(&handler))
            .on::<SentContext, _>(Priority::Parallel, Arc::clone(&handler))
            .on::<ExceptionContext, _>(Priority::First, handler);
    }

    fn headers(&self, kind: &'static str, headers: &HeaderMap) {
        if !self.log_headers {
            return;
        }
        for (name, value) in headers {
            tracing::trace!(kind, header = %name, value = ?value, "header");
        }
    }
}

#[async_trait]
impl Handler<SendingContext> for LoggingHandler {
    async fn handle(&self, context: &mut SendingContext) -> Result<()> {
        context.items().insert(LOGGING_STARTED_AT, Instant::now());
        let request = context.request();
        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "sending http request"
        );
        self.headers("request", request.headers());
        Ok(())
    }
}

#[async_trait]
impl Handler<SentContext> for LoggingHandler {
    async fn handle(&self, context: &mut SentContext) -> Result<()> {
        let elapsed_ms = context
            .items()
            .get::<Instant>(LOGGING_STARTED_AT)
            .map(|started| started.elapsed().as_millis() as u64);
        tracing::debug!(
            method = %context.request().method(),
            url = %context.request().url(),
            status = %context.status(),
            elapsed_ms,
            "received http response"
        );
        self.headers("response", context.response().headers());
        Ok(())
    }
}

#[async_trait]
impl Handler<ExceptionContext> for LoggingHandler {
    async fn handle(&self, context: &mut ExceptionContext) -> Result<()> {
        let url = context.request().map(|request| request.url().to_string());
        let status = context.response().map(|response| response.status().as_u16());
        tracing::warn!(
            error = %context.error(),
            url,
            status,
            "http call failed"
        );
        Ok(())
    }
}
