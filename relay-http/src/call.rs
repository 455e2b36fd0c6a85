//! The call state machine.
//!
//! One attempt runs `Building → Sending → Transporting → Sent → Result |
//! Error`. Any fault moves the call to the Exception stage, which runs once,
//! for the top-level call. Sent handlers may re-enter the forward flow
//! through [`SentContext::recursive_result`](crate::SentContext::recursive_result);
//! nested attempts share the item bag and the cancellation token of the
//! top-level call and hand their faults back to the handler that started
//! them.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::client::HttpClient;
use crate::context::{ContextCore, Recurse, Recursion, RequestAdjust, StageState};
use crate::dispatcher::{DispatchFault, StageDispatcher};
use crate::formatter::Decode;
use crate::request::{Request, RequestTemplate};
use crate::response::Response;
use crate::slot::Slot;
use crate::stage::Stage;
use crate::value::{Dynamic, Payload, TypeTag};
use crate::{HttpClientError, Result};

/// States of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Assembling the request. No handlers run.
    Building,
    /// Running Sending handlers.
    Sending,
    /// Waiting for the transport.
    Transporting,
    /// Running Sent handlers.
    Sent,
    /// Running Result handlers.
    Result,
    /// Running Error handlers.
    Error,
    /// Running Exception handlers.
    Exception,
    /// Finished with a value.
    Completed,
    /// Finished by cancellation.
    Cancelled,
}

impl CallState {
    /// State name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Building => "building",
            CallState::Sending => "sending",
            CallState::Transporting => "transporting",
            CallState::Sent => "sent",
            CallState::Result => "result",
            CallState::Error => "error",
            CallState::Exception => "exception",
            CallState::Completed => "completed",
            CallState::Cancelled => "cancelled",
        }
    }

    /// Whether entering this state observes cancellation.
    pub fn checks_cancellation(&self) -> bool {
        !matches!(
            self,
            CallState::Exception | CallState::Completed | CallState::Cancelled
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces the value of a call whose fault was handled or suppressed.
pub(crate) type DefaultResult<R> = Arc<dyn Fn() -> R + Send + Sync>;

pub(crate) struct CallOptions<R> {
    pub(crate) suppress_type_mismatch: bool,
    pub(crate) suppress_cancellation: bool,
    pub(crate) default_result: Option<DefaultResult<R>>,
}

/// A fault with whatever request and response the failing state held.
struct Fault {
    error: HttpClientError,
    request: Option<Request>,
    response: Option<Response>,
}

impl Fault {
    fn new(error: HttpClientError, request: Option<Request>, response: Option<Response>) -> Self {
        Self {
            error,
            request,
            response,
        }
    }

    fn bare(error: HttpClientError) -> Self {
        Self::new(error, None, None)
    }
}

impl From<DispatchFault> for Fault {
    fn from(fault: DispatchFault) -> Self {
        match fault.state {
            Some(state) => Self::new(fault.error, state.request, state.response),
            None => Self::bare(fault.error),
        }
    }
}

/// One top-level call and everything its attempts share.
pub(crate) struct Call<R, C, E> {
    pub(crate) client: HttpClient,
    pub(crate) registry: Arc<crate::registry::HandlerRegistry>,
    pub(crate) template: RequestTemplate,
    pub(crate) content: Option<C>,
    pub(crate) options: CallOptions<R>,
    pub(crate) core: ContextCore,
    pub(crate) _error: PhantomData<fn() -> E>,
}

impl<R, C, E> Call<R, C, E>
where
    R: Payload + Decode + Default,
    C: Payload + Serialize,
    E: Payload + Decode + Default,
{
    /// Run the call to completion.
    pub(crate) async fn execute(self: Arc<Self>) -> Result<R> {
        match Arc::clone(&self).forward(None, None, 0).await {
            Ok(value) => {
                self.trace_state(CallState::Completed);
                Ok(value)
            }
            Err(fault) => self.recover(fault).await,
        }
    }

    fn trace_state(&self, state: CallState) {
        tracing::trace!(state = %state, "call state transition");
    }

    fn enter(&self, state: CallState) -> Result<()> {
        self.trace_state(state);
        if state.checks_cancellation() && self.core.cancellation.is_cancelled() {
            tracing::debug!(state = %state, "call cancelled");
            return Err(HttpClientError::OperationCanceled);
        }
        Ok(())
    }

    fn stage_state(&self, stage: Stage) -> StageState {
        StageState::new(stage, self.core.clone())
    }

    async fn dispatch(&self, state: StageState) -> std::result::Result<StageState, Fault> {
        StageDispatcher::new(
            &self.registry,
            self.client.resolver(),
            self.options.suppress_type_mismatch,
        )
        .dispatch(state)
        .await
        .map_err(Fault::from)
    }

    fn default_result(&self) -> R {
        self.options
            .default_result
            .as_ref()
            .map(|produce| produce())
            .unwrap_or_default()
    }

    /// The call's value from a stage slot; an empty slot yields the default.
    fn extract(&self, slot: Slot<Dynamic>) -> Result<R> {
        match slot.into_value() {
            Some(value) => value
                .downcast::<R>()
                .ok_or_else(|| HttpClientError::type_mismatch(TypeTag::of::<R>(), value.tag())),
            None => Ok(self.default_result()),
        }
    }

    /// One forward pass. `depth` is zero for the top-level attempt.
    ///
    /// Nested attempts start from `replay`, the request their parent
    /// attempt started from; the top-level attempt builds from the template.
    async fn forward(
        self: Arc<Self>,
        replay: Option<Request>,
        adjust: Option<RequestAdjust>,
        depth: u32,
    ) -> std::result::Result<R, Fault> {
        let max_depth = self.client.config().max_recursion_depth;
        if depth > max_depth {
            return Err(Fault::bare(HttpClientError::RecursionLimit(max_depth)));
        }

        self.enter(CallState::Building).map_err(Fault::bare)?;
        let mut request = match replay {
            Some(request) => request,
            None => self
                .template
                .build(
                    self.client.config(),
                    self.client.formatters(),
                    self.content.as_ref(),
                )
                .map_err(Fault::bare)?,
        };
        if let Some(adjust) = adjust {
            adjust(&mut request);
        }
        let replay = request.clone();

        if let Err(error) = self.enter(CallState::Sending) {
            return Err(Fault::new(error, Some(request), None));
        }
        let mut sending = self.stage_state(Stage::Sending).with_request(Some(request));
        sending.content = self.content.clone().map(Dynamic::new);
        let sending = self.dispatch(sending).await?;
        if sending.slot.is_dirty() {
            tracing::debug!(depth, "sending handler produced the result, skipping transport");
            self.trace_state(CallState::Completed);
            return self
                .extract(sending.slot)
                .map_err(|error| Fault::new(error, sending.request, None));
        }
        let Some(request) = sending.request else {
            return Err(Fault::bare(HttpClientError::Pipeline(
                "sending stage lost the request".into(),
            )));
        };

        if let Err(error) = self.enter(CallState::Transporting) {
            return Err(Fault::new(error, Some(request), None));
        }
        let cancellation = &self.core.cancellation;
        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(HttpClientError::OperationCanceled),
            response = self.client.transport().send(&request, cancellation) => response,
        };
        let response = match outcome {
            Ok(response) => response,
            Err(error) => return Err(Fault::new(error, Some(request), None)),
        };

        if let Err(error) = self.enter(CallState::Sent) {
            return Err(Fault::new(error, Some(request), Some(response)));
        }
        let mut sent = self
            .stage_state(Stage::Sent)
            .with_request(Some(request))
            .with_response(Some(response));
        sent.recursion = Some(Recursion::new(Arc::new(CallHandle {
            call: Arc::clone(&self),
            replay,
            depth: depth + 1,
        })));
        let StageState {
            request,
            response,
            slot,
            ..
        } = self.dispatch(sent).await?;
        if slot.is_dirty() {
            if let Some(response) = response {
                tracing::trace!(status = %response.status(), "releasing unused response");
            }
            self.trace_state(CallState::Completed);
            return self
                .extract(slot)
                .map_err(|error| Fault::new(error, request, None));
        }
        let (Some(request), Some(response)) = (request, response) else {
            return Err(Fault::bare(HttpClientError::Pipeline(
                "sent stage lost the response".into(),
            )));
        };

        if self.client.validators().validate(&response) {
            self.complete_result(request, response).await
        } else {
            self.complete_error(request, response).await
        }
    }

    async fn complete_result(
        &self,
        request: Request,
        response: Response,
    ) -> std::result::Result<R, Fault> {
        if let Err(error) = self.enter(CallState::Result) {
            return Err(Fault::new(error, Some(request), Some(response)));
        }
        let value = match R::decode(&response, self.client.formatters()) {
            Ok(value) => value,
            Err(error) => return Err(Fault::new(error, Some(request), Some(response))),
        };

        let mut state = self
            .stage_state(Stage::Result)
            .with_request(Some(request))
            .with_response(Some(response));
        state.slot = Slot::seeded(Some(Dynamic::new(value)), false);
        let StageState {
            request,
            response,
            slot,
            ..
        } = self.dispatch(state).await?;

        self.trace_state(CallState::Completed);
        self.extract(slot)
            .map_err(|error| Fault::new(error, request, response))
    }

    async fn complete_error(
        &self,
        request: Request,
        response: Response,
    ) -> std::result::Result<R, Fault> {
        if let Err(error) = self.enter(CallState::Error) {
            return Err(Fault::new(error, Some(request), Some(response)));
        }
        let status = response.status();
        let payload = E::decode(&response, self.client.formatters()).unwrap_or_else(|error| {
            tracing::warn!(
                status = %status,
                error = %error,
                "could not decode error payload, using the default"
            );
            E::default()
        });
        let payload = Dynamic::new(payload);

        let mut state = self
            .stage_state(Stage::Error)
            .with_request(Some(request))
            .with_response(Some(response));
        state.error = Some(payload.clone());
        let StageState {
            request,
            response,
            slot,
            handled,
            ..
        } = self.dispatch(state).await?;

        if handled {
            tracing::debug!(status = %status, "error handled");
            self.trace_state(CallState::Completed);
            return self
                .extract(slot)
                .map_err(|error| Fault::new(error, request, response));
        }

        Err(Fault::new(
            HttpClientError::CallFailed {
                status,
                error: payload,
            },
            request,
            response,
        ))
    }

    /// Run the Exception stage for a fault of the top-level call.
    async fn recover(&self, fault: Fault) -> Result<R> {
        self.trace_state(CallState::Exception);
        let Fault {
            error,
            request,
            response,
        } = fault;
        tracing::debug!(error = %error, "call raised a fault");

        let mut state = self
            .stage_state(Stage::Exception)
            .with_request(request)
            .with_response(response);
        state.fault = Some(error.clone());
        let state = match self.dispatch(state).await {
            Ok(state) => state,
            Err(failure) => {
                tracing::warn!(
                    error = %failure.error,
                    original = %error,
                    "exception handler failed"
                );
                return Err(failure.error);
            }
        };

        if state.handled {
            self.trace_state(CallState::Completed);
            return self.extract(state.slot);
        }
        if error.is_canceled() {
            self.trace_state(CallState::Cancelled);
            if self.options.suppress_cancellation {
                return Ok(self.default_result());
            }
        } else if error.is_type_mismatch() && self.options.suppress_type_mismatch {
            tracing::debug!(error = %error, "type mismatch suppressed");
            self.trace_state(CallState::Completed);
            return Ok(self.default_result());
        }
        Err(error)
    }
}

/// Re-enters a call one level deeper, starting from the request of the
/// attempt that created it.
struct CallHandle<R, C, E> {
    call: Arc<Call<R, C, E>>,
    replay: Request,
    depth: u32,
}

impl<R, C, E> Recurse for CallHandle<R, C, E>
where
    R: Payload + Decode + Default,
    C: Payload + Serialize,
    E: Payload + Decode + Default,
{
    fn recurse(&self, adjust: Option<RequestAdjust>) -> BoxFuture<'static, Result<Dynamic>> {
        let call = Arc::clone(&self.call);
        let replay = self.replay.clone();
        let depth = self.depth;
        Box::pin(async move {
            tracing::debug!(depth, url = %replay.url(), "re-entering call");
            call.forward(Some(replay), adjust, depth)
                .await
                .map(Dynamic::new)
                .map_err(|fault| fault.error)
        })
    }
}
