//! HTTP Client error types.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::stage::Stage;
use crate::value::{Dynamic, TypeTag};

/// Result type for HTTP client operations.
pub type Result<T> = std::result::Result<T, HttpClientError>;

/// HTTP client errors.
///
/// Errors are `Clone` so that the exception stage can expose the fault to
/// handlers and still hand the original variant back to the caller.
#[derive(Debug, Clone, Error)]
pub enum HttpClientError {
    /// A handler's declared types do not fit the call, or a produced value
    /// does not satisfy the declared result type.
    #[error("Type mismatch: expected {declared}, found {actual}")]
    TypeMismatch {
        /// Type the handler or call declared.
        declared: String,
        /// Type actually carried by the call.
        actual: String,
    },

    /// No formatter is registered for the media type.
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Opaque fault raised by a transport implementation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The call's cancellation token fired.
    #[error("Operation was canceled")]
    OperationCanceled,

    /// The response failed validation and no error handler handled it.
    #[error("Call failed with status {status}")]
    CallFailed {
        /// Response status code.
        status: StatusCode,
        /// Deserialized error payload.
        error: Dynamic,
    },

    /// A handler was registered under a stage it does not belong to.
    #[error("Handler for the {declared} stage cannot be registered under {requested}")]
    InvalidStage {
        /// Stage the registration asked for.
        requested: Stage,
        /// Stage the handler's context belongs to.
        declared: Stage,
    },

    /// Circuit breaker is open, rejecting requests.
    #[error("Circuit breaker is open, request rejected")]
    CircuitOpen,

    /// Request timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request building error.
    #[error("Failed to build request: {0}")]
    RequestBuild(String),

    /// Content could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Redirect chain exceeded the configured maximum.
    #[error("Exceeded the maximum of {0} redirects")]
    TooManyRedirects(usize),

    /// Recursive re-entry went deeper than allowed.
    #[error("Recursion depth limit of {0} exceeded")]
    RecursionLimit(u32),

    /// Error raised by a handler body.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Internal pipeline invariant violated.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Underlying HTTP client error.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl From<reqwest::Error> for HttpClientError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(Arc::new(error))
    }
}

impl HttpClientError {
    /// Build a type mismatch between two tags.
    pub fn type_mismatch(declared: TypeTag, actual: TypeTag) -> Self {
        Self::TypeMismatch {
            declared: declared.name().to_string(),
            actual: actual.name().to_string(),
        }
    }

    /// Build a handler error from any displayable value.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Connection(_) => true,
            Self::Transport(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::CallFailed { status, .. } => {
                // Retry on 5xx server errors and 429 rate limit
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Check if this fault came from the transport rather than the pipeline.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Http(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_)) || matches!(self, Self::Http(e) if e.is_timeout())
    }

    /// Check if this is a connection error.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_)) || matches!(self, Self::Http(e) if e.is_connect())
    }

    /// Check if this is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::OperationCanceled)
    }

    /// Check if this is a type mismatch.
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }

    /// Get the HTTP status code if this error carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::CallFailed { status, .. } => Some(status.as_u16()),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Get the typed error payload of a failed call.
    pub fn error_payload<E: Clone + 'static>(&self) -> Option<E> {
        match self {
            Self::CallFailed { error, .. } => error.downcast::<E>(),
            _ => None,
        }
    }
}
