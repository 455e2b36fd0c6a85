//! Fluent request builder.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::call::{Call, CallOptions, DefaultResult};
use crate::context::{CallShape, ContextCore, StageContext};
use crate::formatter::Decode;
use crate::handler::{Handler, HandlerDescriptor};
use crate::items::Items;
use crate::registry::HandlerRegistry;
use crate::request::{RequestTemplate, parse_header};
use crate::stage::{Priority, Stage};
use crate::value::Payload;
use crate::{HttpClient, Response, Result};

/// Builder for one call.
///
/// `R` is the result type, `C` the request content type and `E` the error
/// payload type. Handlers added here run only for this call, after the
/// client-wide handlers of the same priority.
pub struct RequestBuilder<R = Response, C = (), E = serde_json::Value> {
    client: HttpClient,
    template: RequestTemplate,
    content: Option<C>,
    registry: Arc<HandlerRegistry>,
    items: Items,
    cancellation: Option<CancellationToken>,
    suppress_type_mismatch: bool,
    suppress_cancellation: bool,
    default_result: Option<DefaultResult<R>>,
    _error: PhantomData<fn() -> E>,
}

impl RequestBuilder {
    /// Create a new request builder.
    pub(crate) fn new(client: HttpClient, method: Method, url: String) -> Self {
        let registry = Arc::clone(client.registry());
        let suppress_type_mismatch = client.config().suppress_type_mismatch;
        let suppress_cancellation = client.config().suppress_cancellation;
        Self {
            client,
            template: RequestTemplate::new(method, url),
            content: None,
            registry,
            items: Items::new(),
            cancellation: None,
            suppress_type_mismatch,
            suppress_cancellation,
            default_result: None,
            _error: PhantomData,
        }
    }
}

impl<R, C, E> RequestBuilder<R, C, E> {
    fn retype<R2, C2, E2>(
        self,
        content: Option<C2>,
        default_result: Option<DefaultResult<R2>>,
    ) -> RequestBuilder<R2, C2, E2> {
        RequestBuilder {
            client: self.client,
            template: self.template,
            content,
            registry: self.registry,
            items: self.items,
            cancellation: self.cancellation,
            suppress_type_mismatch: self.suppress_type_mismatch,
            suppress_cancellation: self.suppress_cancellation,
            default_result,
            _error: PhantomData,
        }
    }

    /// Add a header to the request. An invalid header fails the call when
    /// it is sent.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        match parse_header(name.as_ref(), value.as_ref()) {
            Ok((name, value)) => {
                self.template.headers.insert(name, value);
            }
            Err(error) => self.template.fail(error),
        }
        self
    }

    /// Add multiple headers to the request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.template.headers.extend(headers);
        self
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.template.query.push((key.into(), value.into()));
        self
    }

    /// Add multiple query parameters.
    pub fn queries<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in params {
            self.template.query.push((k.into(), v.into()));
        }
        self
    }

    /// Set a custom timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.template.timeout = Some(timeout);
        self
    }

    /// Set bearer authentication.
    pub fn bearer_auth(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.header("Authorization", value)
    }

    /// Set basic authentication.
    pub fn basic_auth(self, username: impl AsRef<str>, password: Option<&str>) -> Self {
        let value = crate::auth::basic_credentials(username.as_ref(), password);
        self.header("Authorization", value)
    }

    /// Media type used to encode the content.
    pub fn content_type(mut self, media_type: impl Into<String>) -> Self {
        self.template.content_type = Some(media_type.into());
        self
    }

    /// Set the request content. Its type becomes the call's content type.
    pub fn content<C2>(self, content: C2) -> RequestBuilder<R, C2, E> {
        let default_result = self.default_result.clone();
        self.retype(Some(content), default_result)
    }

    /// Declare the result type.
    pub fn result_type<R2>(self) -> RequestBuilder<R2, C, E> {
        let mut builder = self;
        let content = builder.content.take();
        builder.retype(content, None)
    }

    /// Declare the error payload type.
    pub fn error_type<E2>(self) -> RequestBuilder<R, C, E2> {
        let mut builder = self;
        let content = builder.content.take();
        let default_result = builder.default_result.take();
        builder.retype(content, default_result)
    }

    /// Register a handler for this call only.
    pub fn on<Ctx, H>(mut self, priority: Priority, handler: H) -> Self
    where
        Ctx: StageContext,
        H: Handler<Ctx>,
    {
        Arc::make_mut(&mut self.registry).on::<Ctx, H>(priority, handler);
        self
    }

    /// Register a synchronous closure for this call only.
    pub fn on_fn<Ctx, F>(mut self, priority: Priority, f: F) -> Self
    where
        Ctx: StageContext,
        F: Fn(&mut Ctx) -> Result<()> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).on_fn::<Ctx, F>(priority, f);
        self
    }

    /// Register a descriptor for this call only.
    pub fn register(
        mut self,
        stage: Stage,
        priority: Priority,
        descriptor: HandlerDescriptor,
    ) -> Result<Self> {
        Arc::make_mut(&mut self.registry).register(stage, priority, descriptor)?;
        Ok(self)
    }

    /// Seed the call's item bag.
    pub fn item<T: Payload>(self, key: impl Into<String>, value: T) -> Self {
        self.items.insert(key, value);
        self
    }

    /// Skip mismatched handlers instead of failing the call.
    pub fn suppress_type_mismatch(mut self, suppress: bool) -> Self {
        self.suppress_type_mismatch = suppress;
        self
    }

    /// Complete a cancelled call with the default result.
    pub fn suppress_cancellation(mut self, suppress: bool) -> Self {
        self.suppress_cancellation = suppress;
        self
    }

    /// Value returned when a fault is handled or suppressed without a
    /// written result. Defaults to `R::default()`.
    pub fn default_result<F>(mut self, produce: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.default_result = Some(Arc::new(produce));
        self
    }

    /// Use a caller-owned cancellation token for the call.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl<R, C, E> RequestBuilder<R, C, E>
where
    R: Payload + Decode + Default,
    C: Payload + Serialize,
    E: Payload + Decode + Default,
{
    /// Send the request and return the call's result.
    pub async fn send(self) -> Result<R> {
        tracing::debug!(
            method = %self.template.method,
            url = %self.template.url,
            result = std::any::type_name::<R>(),
            "sending call"
        );

        let call = Arc::new(Call::<R, C, E> {
            client: self.client,
            registry: self.registry,
            template: self.template,
            content: self.content,
            options: CallOptions {
                suppress_type_mismatch: self.suppress_type_mismatch,
                suppress_cancellation: self.suppress_cancellation,
                default_result: self.default_result,
            },
            core: ContextCore {
                items: self.items,
                cancellation: self.cancellation.unwrap_or_default(),
                shape: CallShape::of::<R, C, E>(),
            },
            _error: PhantomData,
        });
        call.execute().await
    }
}
