//! HTTP client implementation.

use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::circuit_breaker::CircuitBreakerHandler;
use crate::context::{SentContext, StageContext};
use crate::formatter::{Formatter, Formatters};
use crate::handler::{Handler, HandlerDescriptor};
use crate::redirect::RedirectHandler;
use crate::registry::HandlerRegistry;
use crate::resolver::TypeResolver;
use crate::retry::RetryHandler;
use crate::stage::{Priority, Stage};
use crate::transport::{ReqwestTransport, Transport};
use crate::validator::Validators;
use crate::{HttpClientConfig, RequestBuilder, Response, Result};

struct ClientInner {
    config: HttpClientConfig,
    transport: Arc<dyn Transport>,
    formatters: Formatters,
    registry: Arc<HandlerRegistry>,
    resolver: TypeResolver,
    validators: Validators,
}

/// HTTP client whose calls run through a typed handler pipeline.
///
/// Cloning is cheap; clones share the transport, handlers and type
/// relations.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Create a client with the reqwest transport and the handlers the
    /// configuration asks for.
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Create a client with default configuration.
    pub fn default_client() -> Result<Self> {
        Self::new(HttpClientConfig::default())
    }

    /// Start assembling a client.
    pub fn builder(config: HttpClientConfig) -> HttpClientBuilder {
        HttpClientBuilder::new(config)
    }

    /// Get the client configuration.
    pub fn config(&self) -> &HttpClientConfig {
        &self.inner.config
    }

    /// Get the transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Get the formatters.
    pub fn formatters(&self) -> &Formatters {
        &self.inner.formatters
    }

    /// Get the client-wide handlers.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Get the type relations.
    pub fn resolver(&self) -> &TypeResolver {
        &self.inner.resolver
    }

    /// Get the response validators.
    pub fn validators(&self) -> &Validators {
        &self.inner.validators
    }

    /// Create a GET request builder.
    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::GET, url.into())
    }

    /// Create a POST request builder.
    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::POST, url.into())
    }

    /// Create a PUT request builder.
    pub fn put(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::PUT, url.into())
    }

    /// Create a PATCH request builder.
    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::PATCH, url.into())
    }

    /// Create a DELETE request builder.
    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::DELETE, url.into())
    }

    /// Create a HEAD request builder.
    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::HEAD, url.into())
    }

    /// Create a request builder with a custom method.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url.into())
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.inner.config)
            .field("handlers", &self.inner.registry.len())
            .field("formatters", &self.inner.formatters)
            .finish_non_exhaustive()
    }
}

/// Assembles an [`HttpClient`].
pub struct HttpClientBuilder {
    config: HttpClientConfig,
    transport: Option<Arc<dyn Transport>>,
    formatters: Formatters,
    registry: HandlerRegistry,
    resolver: TypeResolver,
    validators: Validators,
}

impl HttpClientBuilder {
    fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            transport: None,
            formatters: Formatters::default(),
            registry: HandlerRegistry::new(),
            resolver: TypeResolver::new(),
            validators: Validators::default(),
        }
    }

    /// Use a custom transport instead of reqwest.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a shared transport.
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a formatter, consulted before the built-in ones.
    pub fn formatter<F: Formatter + 'static>(mut self, formatter: F) -> Self {
        self.formatters.push(Arc::new(formatter));
        self
    }

    /// Register a handler for every call of the client.
    pub fn on<C, H>(mut self, priority: Priority, handler: H) -> Self
    where
        C: StageContext,
        H: Handler<C>,
    {
        self.registry.on::<C, H>(priority, handler);
        self
    }

    /// Register a synchronous closure for every call of the client.
    pub fn on_fn<C, F>(mut self, priority: Priority, f: F) -> Self
    where
        C: StageContext,
        F: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.registry.on_fn::<C, F>(priority, f);
        self
    }

    /// Register a descriptor for every call of the client.
    pub fn register(
        mut self,
        stage: Stage,
        priority: Priority,
        descriptor: HandlerDescriptor,
    ) -> Result<Self> {
        self.registry.register(stage, priority, descriptor)?;
        Ok(self)
    }

    /// Apply a function to the client-wide registry, e.g. to install a
    /// handler set.
    pub fn with_registry(mut self, f: impl FnOnce(&mut HandlerRegistry)) -> Self {
        f(&mut self.registry);
        self
    }

    /// Declare `B` a base of `D` for handler resolution.
    pub fn relate<D, B>(mut self) -> Self
    where
        D: Clone + Send + Sync + 'static,
        B: From<D> + Send + Sync + 'static,
    {
        self.resolver.relate::<D, B>();
        self
    }

    /// Append a response validator.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        self.validators.push(validator);
        self
    }

    /// Remove every validator, including the default 2xx check.
    pub fn clear_validators(mut self) -> Self {
        self.validators.clear();
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<HttpClient> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };

        let mut formatters = self.formatters;
        formatters.set_default_media_type(self.config.default_media_type.clone());

        let mut registry = HandlerRegistry::new();
        if let Some(breaker) = &self.config.circuit_breaker {
            CircuitBreakerHandler::new(breaker.clone()).install(&mut registry);
        }
        if let Some(retry) = &self.config.retry {
            registry.on::<SentContext, _>(Priority::High, RetryHandler::new(retry.clone()));
        }
        if self.config.follow_redirects {
            registry.on::<SentContext, _>(
                Priority::Default,
                RedirectHandler::new(self.config.max_redirects),
            );
        }
        registry.extend(&self.registry);

        tracing::debug!(
            handlers = registry.len(),
            base_url = ?self.config.base_url,
            "built http client"
        );

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                formatters,
                registry: Arc::new(registry),
                resolver: self.resolver,
                validators: self.validators,
            }),
        })
    }
}
