//! Per-stage handler contexts.
//!
//! Between handlers a stage lives in an erased [`StageState`]. Each handler
//! receives a typed view built from it: the slot, content and error payload
//! are narrowed to the handler's declared types on the way in and written
//! back, erased, on the way out. Consecutive handlers declared over the same
//! types share one view; a handler with a different declaration gets a new
//! view that carries forward every mutation made so far.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::items::Items;
use crate::request::Request;
use crate::resolver::{Chaining, Narrow, Narrowing, Signature};
use crate::response::Response;
use crate::slot::Slot;
use crate::stage::Stage;
use crate::value::{Dynamic, Payload, TypeTag};
use crate::{HttpClientError, Result};

/// The result, content and error types a call was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallShape {
    /// Result type.
    pub result: TypeTag,
    /// Request content type.
    pub content: TypeTag,
    /// Error payload type.
    pub error: TypeTag,
}

impl CallShape {
    /// Shape of a call declared over `R`, `C` and `E`.
    pub fn of<R: 'static, C: 'static, E: 'static>() -> Self {
        Self {
            result: TypeTag::of::<R>(),
            content: TypeTag::of::<C>(),
            error: TypeTag::of::<E>(),
        }
    }

    /// The actual signature a handler of `stage` is resolved against.
    pub fn signature(&self, stage: Stage) -> Signature {
        match stage {
            Stage::Sending => Signature::new(vec![self.result, self.content]),
            Stage::Sent | Stage::Result => Signature::new(vec![self.result]),
            Stage::Error => Signature::new(vec![self.error]),
            Stage::Exception => Signature::empty(),
        }
    }
}

/// Replaces parts of the request of a recursive attempt.
pub(crate) type RequestAdjust = Box<dyn FnOnce(&mut Request) + Send>;

/// Runs the forward flow of the call again, one level deeper.
pub(crate) trait Recurse: Send + Sync {
    fn recurse(&self, adjust: Option<RequestAdjust>) -> BoxFuture<'static, Result<Dynamic>>;
}

/// Handle through which a Sent handler re-enters its call.
#[derive(Clone)]
pub(crate) struct Recursion(Arc<dyn Recurse>);

impl Recursion {
    pub(crate) fn new(recurse: Arc<dyn Recurse>) -> Self {
        Self(recurse)
    }

    pub(crate) fn run(&self, adjust: Option<RequestAdjust>) -> BoxFuture<'static, Result<Dynamic>> {
        self.0.recurse(adjust)
    }
}

/// State shared by every stage of one top-level call and its recursions.
#[derive(Clone)]
pub(crate) struct ContextCore {
    pub(crate) items: Items,
    pub(crate) cancellation: CancellationToken,
    pub(crate) shape: CallShape,
}

/// Erased state of one stage pass.
#[doc(hidden)]
#[derive(Clone)]
pub struct StageState {
    pub(crate) stage: Stage,
    pub(crate) core: ContextCore,
    pub(crate) request: Option<Request>,
    pub(crate) response: Option<Response>,
    pub(crate) slot: Slot<Dynamic>,
    pub(crate) content: Option<Dynamic>,
    pub(crate) error: Option<Dynamic>,
    pub(crate) fault: Option<HttpClientError>,
    pub(crate) handled: bool,
    pub(crate) request_touched: bool,
    pub(crate) recursion: Option<Recursion>,
}

impl StageState {
    pub(crate) fn new(stage: Stage, core: ContextCore) -> Self {
        Self {
            stage,
            core,
            request: None,
            response: None,
            slot: Slot::new(),
            content: None,
            error: None,
            fault: None,
            handled: false,
            request_touched: false,
            recursion: None,
        }
    }

    pub(crate) fn with_request(mut self, request: Option<Request>) -> Self {
        self.request = request;
        self
    }

    pub(crate) fn with_response(mut self, response: Option<Response>) -> Self {
        self.response = response;
        self
    }

    /// Independent copy for one parallel handler.
    pub(crate) fn fork(&self) -> Self {
        let mut fork = self.clone();
        let (value, dirty) = self.slot.read();
        fork.slot = Slot::seeded(value.cloned(), dirty);
        fork.request_touched = false;
        fork
    }

    /// Fold a finished fork back in; later merges win.
    pub(crate) fn merge(&mut self, fork: StageState) {
        if fork.slot.written() {
            if let Some(value) = fork.slot.into_value() {
                self.slot.write(value);
            }
        }
        if fork.request_touched {
            self.request = fork.request;
            self.request_touched = true;
        }
        self.handled |= fork.handled;
    }
}

impl fmt::Debug for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageState")
            .field("stage", &self.stage)
            .field("slot", &self.slot)
            .field("handled", &self.handled)
            .finish_non_exhaustive()
    }
}

fn missing(what: &str, stage: Stage) -> HttpClientError {
    HttpClientError::Pipeline(format!("{what} is not available in the {stage} stage"))
}

fn narrow_value<T: Payload>(value: &Dynamic, narrow: &Narrow) -> Result<T> {
    narrow
        .apply(value)
        .and_then(|narrowed| narrowed.downcast::<T>())
        .ok_or_else(|| HttpClientError::type_mismatch(TypeTag::of::<T>(), value.tag()))
}

fn narrow_slot<T: Payload>(slot: &Slot<Dynamic>, narrow: &Narrow) -> Result<Slot<T>> {
    let (value, dirty) = slot.read();
    let value = value.map(|value| narrow_value::<T>(value, narrow)).transpose()?;
    Ok(Slot::seeded(value, dirty))
}

fn merge_slot<T: Payload>(target: &mut Slot<Dynamic>, view: Slot<T>) {
    if view.written() {
        if let Some(value) = view.into_value() {
            target.write(Dynamic::new(value));
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A typed stage context handlers are written against.
///
/// Implemented by the five stage contexts of this crate only.
pub trait StageContext: sealed::Sealed + Send + Sized + 'static {
    /// Stage this context belongs to.
    const STAGE: Stage;

    /// Types this context is declared over.
    fn signature() -> Signature;

    #[doc(hidden)]
    fn from_state(
        state: StageState,
        narrowing: &Narrowing,
    ) -> std::result::Result<Self, (StageState, HttpClientError)>;

    #[doc(hidden)]
    fn into_state(self) -> StageState;
}

/// Context of the Sending stage: the request is built, nothing has been sent.
///
/// Writing the result slot completes the call without touching the network.
pub struct SendingContext<R = Dynamic, C = Dynamic> {
    state: StageState,
    request: Request,
    content: Option<C>,
    result: Slot<R>,
    request_touched: bool,
}

impl<R: Payload, C: Payload> SendingContext<R, C> {
    /// The outgoing request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Edit the outgoing request.
    pub fn request_mut(&mut self) -> &mut Request {
        self.request_touched = true;
        &mut self.request
    }

    /// Content the call was given, if any.
    pub fn content(&self) -> Option<&C> {
        self.content.as_ref()
    }

    /// Result slot.
    pub fn result(&self) -> &Slot<R> {
        &self.result
    }

    /// Mutable result slot.
    pub fn result_mut(&mut self) -> &mut Slot<R> {
        &mut self.result
    }

    /// Item bag shared with recursive attempts.
    pub fn items(&self) -> &Items {
        &self.state.core.items
    }

    /// The call's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.state.core.cancellation
    }

    /// The call's declared types.
    pub fn call_types(&self) -> &CallShape {
        &self.state.core.shape
    }
}

impl<R, C> sealed::Sealed for SendingContext<R, C> {}

impl<R: Payload, C: Payload> StageContext for SendingContext<R, C> {
    const STAGE: Stage = Stage::Sending;

    fn signature() -> Signature {
        Signature::new(vec![TypeTag::of::<R>(), TypeTag::of::<C>()])
    }

    fn from_state(
        mut state: StageState,
        narrowing: &Narrowing,
    ) -> std::result::Result<Self, (StageState, HttpClientError)> {
        let narrowed = narrow_slot::<R>(&state.slot, &narrowing.param(0)).and_then(|result| {
            let content = state
                .content
                .as_ref()
                .map(|content| narrow_value::<C>(content, &narrowing.param(1)))
                .transpose()?;
            Ok((result, content))
        });
        let (result, content) = match narrowed {
            Ok(parts) => parts,
            Err(error) => return Err((state, error)),
        };
        let Some(request) = state.request.take() else {
            let error = missing("request", state.stage);
            return Err((state, error));
        };
        Ok(Self {
            state,
            request,
            content,
            result,
            request_touched: false,
        })
    }

    fn into_state(self) -> StageState {
        let mut state = self.state;
        state.request = Some(self.request);
        state.request_touched |= self.request_touched;
        merge_slot(&mut state.slot, self.result);
        state
    }
}

/// Context of the Sent stage: the transport returned a response.
///
/// Writing the result slot makes the written value the call's outcome.
pub struct SentContext<R = Dynamic> {
    state: StageState,
    request: Request,
    response: Response,
    result: Slot<R>,
    result_narrow: Narrow,
}

impl<R: Payload> SentContext<R> {
    /// The request that was sent.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Result slot.
    pub fn result(&self) -> &Slot<R> {
        &self.result
    }

    /// Mutable result slot.
    pub fn result_mut(&mut self) -> &mut Slot<R> {
        &mut self.result
    }

    /// Item bag shared with recursive attempts.
    pub fn items(&self) -> &Items {
        &self.state.core.items
    }

    /// The call's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.state.core.cancellation
    }

    /// The call's declared types.
    pub fn call_types(&self) -> &CallShape {
        &self.state.core.shape
    }

    /// Run the whole call again and write its result into this slot.
    ///
    /// The nested attempt starts from the request this attempt started
    /// from, before Sending handlers edited it, and runs every stage again.
    /// It shares the item bag and the cancellation token of this call. Its
    /// faults are returned to the caller of this method.
    pub async fn recursive_result(&mut self) -> Result<R> {
        self.recurse(None).await
    }

    /// Like [`recursive_result`](Self::recursive_result), adjusting the
    /// nested attempt's request before it is sent.
    pub async fn recursive_result_with<F>(&mut self, adjust: F) -> Result<R>
    where
        F: FnOnce(&mut Request) + Send + 'static,
    {
        self.recurse(Some(Box::new(adjust))).await
    }

    async fn recurse(&mut self, adjust: Option<RequestAdjust>) -> Result<R> {
        let recursion = self
            .state
            .recursion
            .clone()
            .ok_or_else(|| missing("recursion", self.state.stage))?;
        let value = recursion.run(adjust).await?;
        let value = narrow_value::<R>(&value, &self.result_narrow)?;
        self.result.write(value.clone());
        Ok(value)
    }
}

impl<R> sealed::Sealed for SentContext<R> {}

impl<R: Payload> StageContext for SentContext<R> {
    const STAGE: Stage = Stage::Sent;

    fn signature() -> Signature {
        Signature::new(vec![TypeTag::of::<R>()])
    }

    fn from_state(
        mut state: StageState,
        narrowing: &Narrowing,
    ) -> std::result::Result<Self, (StageState, HttpClientError)> {
        let result_narrow = narrowing.param(0);
        let result = match narrow_slot::<R>(&state.slot, &result_narrow) {
            Ok(result) => result,
            Err(error) => return Err((state, error)),
        };
        match (state.request.take(), state.response.take()) {
            (Some(request), Some(response)) => Ok(Self {
                state,
                request,
                response,
                result,
                result_narrow,
            }),
            (request, response) => {
                state.request = request;
                state.response = response;
                let error = missing("response", state.stage);
                Err((state, error))
            }
        }
    }

    fn into_state(self) -> StageState {
        let mut state = self.state;
        state.request = Some(self.request);
        state.response = Some(self.response);
        merge_slot(&mut state.slot, self.result);
        state
    }
}

/// Context of the Result stage: the response passed validation and was
/// decoded into the result slot.
pub struct ResultContext<R = Dynamic> {
    state: StageState,
    request: Request,
    response: Response,
    result: Slot<R>,
}

impl<R: Payload> ResultContext<R> {
    /// The request that was sent.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Result slot, seeded with the decoded result.
    pub fn result(&self) -> &Slot<R> {
        &self.result
    }

    /// Mutable result slot.
    pub fn result_mut(&mut self) -> &mut Slot<R> {
        &mut self.result
    }

    /// Item bag shared with recursive attempts.
    pub fn items(&self) -> &Items {
        &self.state.core.items
    }

    /// The call's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.state.core.cancellation
    }

    /// The call's declared types.
    pub fn call_types(&self) -> &CallShape {
        &self.state.core.shape
    }
}

impl<R> sealed::Sealed for ResultContext<R> {}

impl<R: Payload> StageContext for ResultContext<R> {
    const STAGE: Stage = Stage::Result;

    fn signature() -> Signature {
        Signature::new(vec![TypeTag::of::<R>()])
    }

    fn from_state(
        mut state: StageState,
        narrowing: &Narrowing,
    ) -> std::result::Result<Self, (StageState, HttpClientError)> {
        let result = match narrow_slot::<R>(&state.slot, &narrowing.param(0)) {
            Ok(result) => result,
            Err(error) => return Err((state, error)),
        };
        match (state.request.take(), state.response.take()) {
            (Some(request), Some(response)) => Ok(Self {
                state,
                request,
                response,
                result,
            }),
            (request, response) => {
                state.request = request;
                state.response = response;
                let error = missing("response", state.stage);
                Err((state, error))
            }
        }
    }

    fn into_state(self) -> StageState {
        let mut state = self.state;
        state.request = Some(self.request);
        state.response = Some(self.response);
        merge_slot(&mut state.slot, self.result);
        state
    }
}

/// Context of the Error stage: the response failed validation and its body
/// was decoded as the call's error payload.
///
/// Marking the error handled completes the call with the value written to
/// the result slot, or the default result when nothing was written.
pub struct ErrorContext<E = Dynamic> {
    state: StageState,
    request: Request,
    response: Response,
    error: E,
}

impl<E: Payload> ErrorContext<E> {
    /// The decoded error payload.
    pub fn error(&self) -> &E {
        &self.error
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// The request that was sent.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Mark the error handled.
    pub fn mark_handled(&mut self) {
        self.state.handled = true;
    }

    /// Whether some handler marked the error handled.
    pub fn is_handled(&self) -> bool {
        self.state.handled
    }

    /// Result slot, read only when the error is handled.
    pub fn result(&self) -> &Slot<Dynamic> {
        &self.state.slot
    }

    /// Mutable result slot.
    pub fn result_mut(&mut self) -> &mut Slot<Dynamic> {
        &mut self.state.slot
    }

    /// Item bag shared with recursive attempts.
    pub fn items(&self) -> &Items {
        &self.state.core.items
    }

    /// The call's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.state.core.cancellation
    }

    /// The call's declared types.
    pub fn call_types(&self) -> &CallShape {
        &self.state.core.shape
    }
}

impl<E> sealed::Sealed for ErrorContext<E> {}

impl<E: Payload> StageContext for ErrorContext<E> {
    const STAGE: Stage = Stage::Error;

    fn signature() -> Signature {
        Signature::new(vec![TypeTag::of::<E>()])
    }

    fn from_state(
        mut state: StageState,
        narrowing: &Narrowing,
    ) -> std::result::Result<Self, (StageState, HttpClientError)> {
        let error = match state.error.as_ref() {
            Some(error) => narrow_value::<E>(error, &narrowing.param(0)),
            None => Err(missing("error payload", state.stage)),
        };
        let error = match error {
            Ok(error) => error,
            Err(error) => return Err((state, error)),
        };
        match (state.request.take(), state.response.take()) {
            (Some(request), Some(response)) => Ok(Self {
                state,
                request,
                response,
                error,
            }),
            (request, response) => {
                state.request = request;
                state.response = response;
                let error = missing("response", state.stage);
                Err((state, error))
            }
        }
    }

    fn into_state(self) -> StageState {
        let mut state = self.state;
        state.request = Some(self.request);
        state.response = Some(self.response);
        state
    }
}

/// Context of the Exception stage: a fault was raised somewhere in the call.
///
/// The request is absent when the fault preceded request construction.
pub struct ExceptionContext {
    state: StageState,
    error: HttpClientError,
}

impl ExceptionContext {
    /// The fault.
    pub fn error(&self) -> &HttpClientError {
        &self.error
    }

    /// The request, when one was built.
    pub fn request(&self) -> Option<&Request> {
        self.state.request.as_ref()
    }

    /// The response, when one was received.
    pub fn response(&self) -> Option<&Response> {
        self.state.response.as_ref()
    }

    /// Mark the fault handled.
    pub fn mark_handled(&mut self) {
        self.state.handled = true;
    }

    /// Whether some handler marked the fault handled.
    pub fn is_handled(&self) -> bool {
        self.state.handled
    }

    /// Result slot.
    pub fn result(&self) -> &Slot<Dynamic> {
        &self.state.slot
    }

    /// Mutable result slot.
    pub fn result_mut(&mut self) -> &mut Slot<Dynamic> {
        &mut self.state.slot
    }

    /// Handle the fault and complete the call with `value`.
    pub fn recover_with<T: Payload>(&mut self, value: T) {
        self.state.slot.write(Dynamic::new(value));
        self.state.handled = true;
    }

    /// Item bag shared with recursive attempts.
    pub fn items(&self) -> &Items {
        &self.state.core.items
    }

    /// The call's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.state.core.cancellation
    }

    /// The call's declared types.
    pub fn call_types(&self) -> &CallShape {
        &self.state.core.shape
    }
}

impl sealed::Sealed for ExceptionContext {}

impl StageContext for ExceptionContext {
    const STAGE: Stage = Stage::Exception;

    fn signature() -> Signature {
        Signature::empty()
    }

    fn from_state(
        state: StageState,
        _narrowing: &Narrowing,
    ) -> std::result::Result<Self, (StageState, HttpClientError)> {
        match state.fault.clone() {
            Some(error) => Ok(Self { state, error }),
            None => {
                let error = missing("fault", state.stage);
                Err((state, error))
            }
        }
    }

    fn into_state(self) -> StageState {
        self.state
    }
}

/// A typed context parked between handlers.
pub(crate) trait ChainedContext: Send {
    fn release(self: Box<Self>) -> StageState;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<C: StageContext> ChainedContext for C {
    fn release(self: Box<Self>) -> StageState {
        (*self).into_state()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

enum Link {
    State(StageState),
    View {
        signature: Signature,
        context: Box<dyn ChainedContext>,
    },
    Vacant,
}

/// Threads one stage's state through consecutive handlers.
pub(crate) struct ContextChain {
    link: Link,
}

impl ContextChain {
    pub(crate) fn new(state: StageState) -> Self {
        Self {
            link: Link::State(state),
        }
    }

    /// Declared signature of the view currently parked in the chain.
    pub(crate) fn signature(&self) -> Option<&Signature> {
        match &self.link {
            Link::View { signature, .. } => Some(signature),
            _ => None,
        }
    }

    /// Hand out a typed view, reusing the parked one when allowed.
    pub(crate) fn checkout<C: StageContext>(
        &mut self,
        narrowing: &Narrowing,
        chaining: Chaining,
    ) -> Result<Box<C>> {
        let state = match std::mem::replace(&mut self.link, Link::Vacant) {
            Link::View { context, .. } if chaining == Chaining::Reuse && context.as_any().is::<C>() => {
                return context
                    .into_any()
                    .downcast::<C>()
                    .map_err(|_| HttpClientError::Pipeline("context view changed type".into()));
            }
            Link::View { context, .. } => context.release(),
            Link::State(state) => state,
            Link::Vacant => return Err(HttpClientError::Pipeline("context chain is empty".into())),
        };

        match C::from_state(state, narrowing) {
            Ok(context) => Ok(Box::new(context)),
            Err((state, error)) => {
                self.link = Link::State(state);
                Err(error)
            }
        }
    }

    /// Park a view after its handler returned.
    pub(crate) fn checkin<C: StageContext>(&mut self, context: Box<C>) {
        self.link = Link::View {
            signature: C::signature(),
            context,
        };
    }

    /// Release the erased state.
    pub(crate) fn into_state(self) -> Result<StageState> {
        match self.link {
            Link::State(state) => Ok(state),
            Link::View { context, .. } => Ok(context.release()),
            Link::Vacant => Err(HttpClientError::Pipeline("context chain is empty".into())),
        }
    }
}
