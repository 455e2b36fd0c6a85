//! Redirect following as a Sent handler.

use async_trait::async_trait;
use http::{Method, StatusCode, header};
use tracing::debug;

use crate::context::SentContext;
use crate::handler::Handler;
use crate::request::Request;
use crate::{HttpClientError, Result};

/// Item key counting the redirects followed by one call.
pub const REDIRECT_COUNT: &str = "RedirectCount";

/// Follows 301, 302, 303, 307 and 308 responses that carry a `Location`.
///
/// The transport never follows redirects itself; each hop is a nested call
/// through [`SentContext::recursive_result_with`].
#[derive(Debug, Clone)]
pub struct RedirectHandler {
    max_redirects: usize,
}

impl RedirectHandler {
    /// Create a redirect handler allowing up to `max_redirects` hops.
    pub fn new(max_redirects: usize) -> Self {
        Self { max_redirects }
    }

    /// Maximum number of hops.
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }
}

impl Default for RedirectHandler {
    fn default() -> Self {
        Self::new(10)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Request for the next hop.
fn next_request(request: &Request, status: StatusCode, location: &str) -> Result<Request> {
    let url = request
        .url()
        .join(location)
        .map_err(|e| HttpClientError::InvalidUrl(format!("{location}: {e}")))?;

    let mut next = request.clone();
    next.set_url(url);

    let safe = matches!(*request.method(), Method::GET | Method::HEAD);
    let to_get = status == StatusCode::SEE_OTHER
        || (!safe && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND));
    if to_get && *request.method() != Method::HEAD {
        next.set_method(Method::GET);
        next.set_body(None);
        let headers = next.headers_mut();
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::CONTENT_LENGTH);
    }

    if next.url().origin() != request.url().origin() {
        next.headers_mut().remove(header::AUTHORIZATION);
    }
    Ok(next)
}

#[async_trait]
impl Handler<SentContext> for RedirectHandler {
    async fn handle(&self, context: &mut SentContext) -> Result<()> {
        let status = context.status();
        if context.result().is_dirty() || !is_redirect(status) {
            return Ok(());
        }
        let Some(location) = context.response().header(header::LOCATION) else {
            return Ok(());
        };

        let next = next_request(context.request(), status, location)?;
        let hops = context
            .items()
            .update::<usize, _>(REDIRECT_COUNT, |count| *count += 1);
        if hops > self.max_redirects {
            return Err(HttpClientError::TooManyRedirects(self.max_redirects));
        }

        debug!(
            status = %status,
            from = %context.request().url(),
            to = %next.url(),
            hop = hops,
            "following redirect"
        );
        context.recursive_result_with(move |request| *request = next).await?;
        Ok(())
    }
}
