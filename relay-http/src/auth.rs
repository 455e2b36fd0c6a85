//! Authentication handler.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::Result;
use crate::context::SendingContext;
use crate::handler::Handler;

/// `Authorization` value for basic credentials.
pub(crate) fn basic_credentials(username: &str, password: Option<&str>) -> String {
    let credentials = STANDARD.encode(format!("{}:{}", username, password.unwrap_or_default()));
    format!("Basic {credentials}")
}

#[derive(Clone)]
enum AuthScheme {
    Bearer(String),
    Basic { username: String, password: String },
    ApiKey { header: String, key: String },
}

/// Sending handler that adds credentials to every request.
///
/// A header already present on the request is left alone, so per-call
/// credentials set on the builder win.
#[derive(Clone)]
pub struct AuthHandler {
    scheme: AuthScheme,
}

impl AuthHandler {
    /// Bearer token authentication.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Bearer(token.into()),
        }
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Basic {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    /// API key sent in a custom header.
    pub fn api_key(header: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::ApiKey {
                header: header.into(),
                key: key.into(),
            },
        }
    }

    fn header(&self) -> (&str, String) {
        match &self.scheme {
            AuthScheme::Bearer(token) => ("authorization", format!("Bearer {token}")),
            AuthScheme::Basic { username, password } => {
                ("authorization", basic_credentials(username, Some(password)))
            }
            AuthScheme::ApiKey { header, key } => (header.as_str(), key.clone()),
        }
    }
}

impl std::fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            AuthScheme::Bearer(_) => "bearer",
            AuthScheme::Basic { .. } => "basic",
            AuthScheme::ApiKey { .. } => "api_key",
        };
        f.debug_struct("AuthHandler").field("scheme", &scheme).finish()
    }
}

#[async_trait]
impl Handler<SendingContext> for AuthHandler {
    async fn handle(&self, context: &mut SendingContext) -> Result<()> {
        let (name, value) = self.header();
        if context.request().header(name).is_some() {
            return Ok(());
        }
        context.request_mut().set_header(name, value)
    }
}
