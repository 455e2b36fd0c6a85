// Relay - a fluent HTTP client built on a typed handler pipeline
//
// This library re-exports the pipeline client so applications can depend on
// a single crate.

// Re-export the client crate
pub use relay_http as http;

pub use relay_http::{
    HttpClient, HttpClientBuilder, HttpClientConfig, HttpClientError, Priority, RequestBuilder,
    Response, Result, Stage,
};

/// Prelude for common imports.
pub mod prelude {
    pub use relay_http::prelude::*;
}
