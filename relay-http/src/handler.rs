//! Handlers and their registration descriptors.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::context::{ContextChain, StageContext};
use crate::resolver::{Chaining, Narrowing, Signature};
use crate::stage::{Priority, Stage};

/// A handler for one stage, written against a typed stage context.
///
/// The context type fixes both the stage and the declared types the handler
/// is resolved with, e.g. `SentContext<Dynamic>` runs for every call while
/// `SentContext<Invoice>` requires an `Invoice` result.
///
/// ```ignore
/// struct StampHandler;
///
/// #[async_trait]
/// impl Handler<SendingContext> for StampHandler {
///     async fn handle(&self, context: &mut SendingContext) -> Result<()> {
///         context.request_mut().set_header("x-stamp", "1")
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<C: StageContext>: Send + Sync + 'static {
    /// Handle one stage pass.
    async fn handle(&self, context: &mut C) -> Result<()>;
}

#[async_trait]
impl<C: StageContext, H: Handler<C>> Handler<C> for Arc<H> {
    async fn handle(&self, context: &mut C) -> Result<()> {
        (**self).handle(context).await
    }
}

/// Adapts a synchronous closure into a handler.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<C, F> Handler<C> for FnHandler<F>
where
    C: StageContext,
    F: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, context: &mut C) -> Result<()> {
        (self.f)(context)
    }
}

/// Type-erased handler invocation.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn invoke(
        &self,
        chain: &mut ContextChain,
        narrowing: &Narrowing,
        chaining: Chaining,
    ) -> Result<()>;
}

struct TypedHandler<C, H> {
    handler: H,
    _context: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for TypedHandler<C, H>
where
    C: StageContext,
    H: Handler<C>,
{
    async fn invoke(
        &self,
        chain: &mut ContextChain,
        narrowing: &Narrowing,
        chaining: Chaining,
    ) -> Result<()> {
        let mut context = chain.checkout::<C>(narrowing, chaining)?;
        let outcome = self.handler.handle(context.as_mut()).await;
        chain.checkin(context);
        outcome
    }
}

/// A registered handler: its stage, declared types, priority and callback.
#[derive(Clone)]
pub struct HandlerDescriptor {
    stage: Stage,
    signature: Signature,
    priority: Priority,
    name: Cow<'static, str>,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    /// Describe a handler. The priority is assigned at registration.
    pub fn new<C, H>(handler: H) -> Self
    where
        C: StageContext,
        H: Handler<C>,
    {
        Self {
            stage: C::STAGE,
            signature: C::signature(),
            priority: Priority::Default,
            name: Cow::Borrowed(std::any::type_name::<H>()),
            handler: Arc::new(TypedHandler {
                handler,
                _context: PhantomData,
            }),
        }
    }

    /// Describe a synchronous closure.
    pub fn from_fn<C, F>(f: F) -> Self
    where
        C: StageContext,
        F: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    {
        Self::new::<C, _>(FnHandler::new(f)).named("closure")
    }

    /// Set the name used in log events.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    pub(crate) fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Stage the handler belongs to.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Declared types.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn invoke(
        &self,
        chain: &mut ContextChain,
        narrowing: &Narrowing,
        chaining: Chaining,
    ) -> Result<()> {
        self.handler.invoke(chain, narrowing, chaining).await
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("stage", &self.stage)
            .field("signature", &self.signature)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExceptionContext, SendingContext, SentContext};
    use crate::value::{Dynamic, TypeTag};

    struct Noop;

    #[async_trait]
    impl Handler<SentContext<String>> for Noop {
        async fn handle(&self, _context: &mut SentContext<String>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_descriptor_records_stage_and_signature() {
        let descriptor = HandlerDescriptor::new::<SentContext<String>, _>(Noop);
        assert_eq!(descriptor.stage(), Stage::Sent);
        assert_eq!(descriptor.signature().params(), &[TypeTag::of::<String>()]);
        assert_eq!(descriptor.priority(), Priority::Default);
        assert!(descriptor.name().ends_with("Noop"));
    }

    #[test]
    fn test_from_fn_descriptor() {
        let descriptor =
            HandlerDescriptor::from_fn(|_: &mut SendingContext<Dynamic, ()>| Ok(())).named("noop");
        assert_eq!(descriptor.stage(), Stage::Sending);
        assert_eq!(descriptor.signature().len(), 2);
        assert_eq!(descriptor.name(), "noop");
    }

    #[test]
    fn test_shared_handler_via_arc() {
        let shared = Arc::new(Noop);
        let descriptor = HandlerDescriptor::new::<SentContext<String>, _>(Arc::clone(&shared));
        assert_eq!(descriptor.stage(), Stage::Sent);

        let exception = HandlerDescriptor::from_fn(|_: &mut ExceptionContext| Ok(()));
        assert!(exception.signature().is_empty());
    }
}
