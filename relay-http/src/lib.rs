//! # Relay HTTP
//!
//! A fluent HTTP client whose calls run through a typed, prioritized
//! handler pipeline.
//!
//! ## Features
//!
//! - **Stages**: Sending, Sent, Result, Error and Exception handlers
//! - **Priorities**: First, High, Default, Low, Last and concurrent Parallel groups
//! - **Typed handlers**: handlers declare the result, content and error types
//!   they understand and are resolved against each call at dispatch time
//! - **Short-circuits**: a Sending handler can answer a call without the network
//! - **Recursion**: Sent handlers re-run the call, sharing its item bag
//! - **Built-ins**: retry with backoff, redirects, circuit breaker, auth,
//!   caching and logging, all ordinary handlers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_http::{HttpClient, HttpClientConfig, Priority, SendingContext};
//!
//! #[derive(Clone, Default, serde::Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> relay_http::Result<()> {
//!     let config = HttpClientConfig::builder()
//!         .base_url("https://api.example.com")
//!         .build();
//!     let client = HttpClient::builder(config)
//!         .on_fn(Priority::First, |context: &mut SendingContext| {
//!             context.request_mut().set_header("x-client", "relay")
//!         })
//!         .build()?;
//!
//!     let user = client.get("/users/1").result_type::<User>().send().await?;
//!     println!("{}", user.name);
//!     Ok(())
//! }
//! ```
//!
//! ## With Retry and Circuit Breaker
//!
//! ```rust,no_run
//! use relay_http::{CircuitBreakerConfig, HttpClient, HttpClientConfig, RetryConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> relay_http::Result<()> {
//!     let config = HttpClientConfig::builder()
//!         .timeout(Duration::from_secs(30))
//!         .retry(RetryConfig::exponential(3, Duration::from_millis(100)))
//!         .circuit_breaker(CircuitBreakerConfig::default())
//!         .build();
//!
//!     let client = HttpClient::new(config)?;
//!     let created = client
//!         .post("https://api.example.com/orders")
//!         .content(serde_json::json!({"item": "widget", "quantity": 5}))
//!         .result_type::<serde_json::Value>()
//!         .send()
//!         .await?;
//!
//!     println!("{created}");
//!     Ok(())
//! }
//! ```

mod auth;
mod builder;
mod cache;
mod call;
mod circuit_breaker;
mod client;
mod config;
mod context;
mod dispatcher;
mod error;
mod formatter;
mod handler;
mod items;
mod logging;
mod redirect;
mod registry;
mod request;
mod resolver;
mod response;
mod retry;
mod slot;
mod stage;
mod transport;
mod validator;
mod value;

pub use auth::AuthHandler;
pub use builder::RequestBuilder;
pub use cache::{CACHE_HIT, CacheHandler, CacheStore, MemoryCacheStore};
pub use call::CallState;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHandler, CircuitState,
};
pub use client::{HttpClient, HttpClientBuilder};
pub use config::{HttpClientConfig, HttpClientConfigBuilder};
#[doc(hidden)]
pub use context::StageState;
pub use context::{
    CallShape, ErrorContext, ExceptionContext, ResultContext, SendingContext, SentContext,
    StageContext,
};
pub use error::{HttpClientError, Result};
pub use formatter::{Decode, FormFormatter, Formatter, Formatters, JsonFormatter, TextFormatter};
pub use handler::{FnHandler, Handler, HandlerDescriptor};
pub use items::Items;
pub use logging::LoggingHandler;
pub use redirect::{REDIRECT_COUNT, RedirectHandler};
pub use registry::{HandlerGroup, HandlerRegistry};
pub use request::Request;
pub use resolver::{
    Chaining, Converter, Narrow, Narrowing, Resolution, Signature, TypeResolver,
};
pub use response::Response;
pub use retry::{
    BackoffStrategy, RETRY_COUNT, RETRY_STARTED_AT, RetryConfig, RetryHandler, RetryStrategy,
};
pub use slot::Slot;
pub use stage::{Priority, Stage};
pub use transport::{ReqwestTransport, Transport};
pub use validator::{ResponseValidator, Validators};
pub use value::{Dynamic, Payload, TypeTag};

// Re-export common types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;

/// Prelude for common imports.
///
/// ```
/// use relay_http::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::{HttpClient, HttpClientBuilder};
    pub use crate::config::{HttpClientConfig, HttpClientConfigBuilder};
    pub use crate::context::{
        ErrorContext, ExceptionContext, ResultContext, SendingContext, SentContext,
    };
    pub use crate::error::{HttpClientError, Result};
    pub use crate::handler::Handler;
    pub use crate::builder::RequestBuilder;
    pub use crate::response::Response;
    pub use crate::retry::{BackoffStrategy, RetryConfig};
    pub use crate::circuit_breaker::CircuitBreakerConfig;
    pub use crate::stage::{Priority, Stage};
    pub use crate::value::Dynamic;
    pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
    pub use tokio_util::sync::CancellationToken;
}
