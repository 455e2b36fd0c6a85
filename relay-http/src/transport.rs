//! Transport abstraction and the reqwest-backed default.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::HttpClientConfig;
use crate::request::Request;
use crate::response::Response;
use crate::{HttpClientError, Result};

/// Sends one request and returns its response.
///
/// Implementations must return promptly once `cancellation` fires and must
/// never retry; retrying is a pipeline concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request.
    async fn send(&self, request: &Request, cancellation: &CancellationToken) -> Result<Response>;
}

/// Transport backed by a `reqwest::Client`.
///
/// Redirects are never followed here; the redirect handler follows them
/// through the pipeline.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    inner: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Build a reqwest client from the configuration.
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none());

        if config.gzip {
            builder = builder.gzip(true);
        }
        if config.brotli {
            builder = builder.brotli(true);
        }

        let inner = builder
            .build()
            .map_err(|e| HttpClientError::RequestBuild(e.to_string()))?;
        Ok(Self {
            inner,
            timeout: config.timeout,
        })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(inner: reqwest::Client, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Get the underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    fn to_reqwest(&self, request: &Request) -> Result<reqwest::Request> {
        let mut builder = self
            .inner
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout() {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| HttpClientError::RequestBuild(e.to_string()))
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        let response = self
            .inner
            .execute(self.to_reqwest(request)?)
            .await
            .map_err(|e| self.map_error(e, request))?;
        Response::from_reqwest(response).await
    }

    fn map_error(&self, error: reqwest::Error, request: &Request) -> HttpClientError {
        if error.is_timeout() {
            HttpClientError::Timeout(request.timeout().unwrap_or(self.timeout))
        } else if error.is_connect() {
            HttpClientError::Connection(error.to_string())
        } else {
            HttpClientError::from(error)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &Request, cancellation: &CancellationToken) -> Result<Response> {
        tracing::trace!(method = %request.method(), url = %request.url(), "sending request");
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(HttpClientError::OperationCanceled),
            response = self.execute(request) => response,
        }
    }
}
