//! Outgoing request and the per-call template it is built from.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;

use crate::config::HttpClientConfig;
use crate::formatter::Formatters;
use crate::{HttpClientError, Result};

/// A fully built HTTP request, as handed to the transport.
///
/// Sending handlers may edit it through
/// [`SendingContext::request_mut`](crate::SendingContext::request_mut).
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: url::Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl Request {
    /// Create a request without headers or body.
    pub fn new(method: Method, url: url::Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Replace the method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Target URL.
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Replace the target URL.
    pub fn set_url(&mut self, url: url::Url) {
        self.url = url;
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<()> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Request body.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Replace the per-request timeout.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

pub(crate) fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::try_from(name)
        .map_err(|e| HttpClientError::RequestBuild(format!("invalid header name {name:?}: {e}")))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| HttpClientError::RequestBuild(format!("invalid value for {name}: {e}")))?;
    Ok((name, value))
}

/// Everything the fluent builder collected for one call. The top-level
/// attempt builds its [`Request`] from it; nested attempts replay the
/// request of the attempt that started them.
#[derive(Debug, Clone)]
pub(crate) struct RequestTemplate {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) headers: HeaderMap,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) content_type: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) error: Option<HttpClientError>,
}

impl RequestTemplate {
    pub(crate) fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            content_type: None,
            timeout: None,
            error: None,
        }
    }

    /// Record the first builder error; it surfaces when the call is sent.
    pub(crate) fn fail(&mut self, error: HttpClientError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Build the URL with base URL and query parameters.
    pub(crate) fn build_url(&self, config: &HttpClientConfig) -> Result<url::Url> {
        let mut url = if let Some(base) = &config.base_url {
            let base =
                url::Url::parse(base).map_err(|e| HttpClientError::InvalidUrl(e.to_string()))?;
            base.join(&self.url)
                .map_err(|e| HttpClientError::InvalidUrl(e.to_string()))?
        } else {
            url::Url::parse(&self.url).map_err(|e| HttpClientError::InvalidUrl(e.to_string()))?
        };

        if !self.query.is_empty() {
            let mut query_pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                query_pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// Build a request for one attempt.
    pub(crate) fn build<C: Serialize>(
        &self,
        config: &HttpClientConfig,
        formatters: &Formatters,
        content: Option<&C>,
    ) -> Result<Request> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        let url = self.build_url(config)?;
        let mut request = Request::new(self.method.clone(), url);

        for (name, value) in &config.default_headers {
            request.set_header(name, value)?;
        }
        for (name, value) in &self.headers {
            request.headers.insert(name.clone(), value.clone());
        }

        if !request.headers.contains_key(http::header::ACCEPT) {
            if let Ok(accept) = HeaderValue::from_str(&formatters.accept_header()) {
                request.headers.insert(http::header::ACCEPT, accept);
            }
        }

        if let Some(content) = content {
            let media_type = self
                .content_type
                .as_deref()
                .unwrap_or(&config.default_media_type);
            let body = formatters.create_content(content, media_type)?;
            request.set_header(http::header::CONTENT_TYPE.as_str(), media_type)?;
            request.body = Some(body);
        }

        request.timeout = self.timeout;
        Ok(request)
    }
}
