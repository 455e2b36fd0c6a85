//! Runs one stage of a call.

use std::sync::Arc;

use futures::future::join_all;

use crate::HttpClientError;
use crate::context::{ContextChain, StageState};
use crate::handler::HandlerDescriptor;
use crate::registry::{HandlerGroup, HandlerRegistry};
use crate::resolver::{Chaining, Narrowing, Resolution, Signature, TypeResolver};

/// A fault raised while dispatching a stage, with the stage state when it
/// could be recovered.
#[derive(Debug)]
pub(crate) struct DispatchFault {
    pub(crate) error: HttpClientError,
    pub(crate) state: Option<StageState>,
}

impl DispatchFault {
    fn new(error: HttpClientError, state: Option<StageState>) -> Self {
        Self { error, state }
    }
}

/// Drives the handlers of one stage over its state.
pub(crate) struct StageDispatcher<'a> {
    registry: &'a HandlerRegistry,
    resolver: &'a TypeResolver,
    suppress_type_mismatch: bool,
}

impl<'a> StageDispatcher<'a> {
    pub(crate) fn new(
        registry: &'a HandlerRegistry,
        resolver: &'a TypeResolver,
        suppress_type_mismatch: bool,
    ) -> Self {
        Self {
            registry,
            resolver,
            suppress_type_mismatch,
        }
    }

    /// Run every handler of the state's stage and return the final state.
    pub(crate) async fn dispatch(
        &self,
        state: StageState,
    ) -> std::result::Result<StageState, DispatchFault> {
        let stage = state.stage;
        let actual = state.core.shape.signature(stage);
        let mut chain = ContextChain::new(state);

        for group in self.registry.ordered(stage) {
            chain = if group.priority.is_parallel() {
                self.run_parallel(chain, group, &actual).await?
            } else {
                self.run_sequential(chain, group, &actual).await?
            };
        }

        chain
            .into_state()
            .map_err(|error| DispatchFault::new(error, None))
    }

    async fn run_sequential(
        &self,
        mut chain: ContextChain,
        group: HandlerGroup<'_>,
        actual: &Signature,
    ) -> std::result::Result<ContextChain, DispatchFault> {
        for descriptor in group.handlers {
            let resolution = self.resolver.resolve(
                descriptor.signature(),
                actual,
                chain.signature(),
                self.suppress_type_mismatch,
            );

            match resolution {
                Resolution::Compatible {
                    narrowing,
                    chaining,
                } => {
                    tracing::trace!(
                        stage = %descriptor.stage(),
                        handler = %descriptor.name(),
                        chaining = ?chaining,
                        "invoking handler"
                    );
                    if let Err(error) = descriptor.invoke(&mut chain, &narrowing, chaining).await {
                        return Err(DispatchFault::new(error, chain.into_state().ok()));
                    }
                }
                Resolution::Skip { declared, actual } => {
                    tracing::debug!(
                        handler = %descriptor.name(),
                        declared = %declared,
                        actual = %actual,
                        "skipping handler with mismatched types"
                    );
                }
                Resolution::Mismatch { declared, actual } => {
                    return Err(DispatchFault::new(
                        mismatch(&declared, &actual),
                        chain.into_state().ok(),
                    ));
                }
            }
        }
        Ok(chain)
    }

    async fn run_parallel(
        &self,
        chain: ContextChain,
        group: HandlerGroup<'_>,
        actual: &Signature,
    ) -> std::result::Result<ContextChain, DispatchFault> {
        let base = chain
            .into_state()
            .map_err(|error| DispatchFault::new(error, None))?;

        let mut forks: Vec<(Arc<HandlerDescriptor>, Narrowing, ContextChain)> =
            Vec::with_capacity(group.handlers.len());
        for descriptor in group.handlers {
            match self.resolver.resolve(
                descriptor.signature(),
                actual,
                None,
                self.suppress_type_mismatch,
            ) {
                Resolution::Compatible { narrowing, .. } => {
                    forks.push((
                        Arc::clone(descriptor),
                        narrowing,
                        ContextChain::new(base.fork()),
                    ));
                }
                Resolution::Skip { declared, actual } => {
                    tracing::debug!(
                        handler = %descriptor.name(),
                        declared = %declared,
                        actual = %actual,
                        "skipping handler with mismatched types"
                    );
                }
                Resolution::Mismatch { declared, actual } => {
                    return Err(DispatchFault::new(
                        mismatch(&declared, &actual),
                        Some(base),
                    ));
                }
            }
        }

        tracing::trace!(handlers = forks.len(), "invoking parallel handlers");
        let outcomes = join_all(forks.iter_mut().map(|(descriptor, narrowing, chain)| {
            descriptor.invoke(chain, narrowing, Chaining::Construct)
        }))
        .await;

        let mut state = base;
        let mut first_error = None;
        for ((_, _, chain), outcome) in forks.into_iter().zip(outcomes) {
            match chain.into_state() {
                Ok(fork) => state.merge(fork),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
            if let Err(error) = outcome {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(DispatchFault::new(error, Some(state))),
            None => Ok(ContextChain::new(state)),
        }
    }
}

fn mismatch(declared: &Signature, actual: &Signature) -> HttpClientError {
    HttpClientError::TypeMismatch {
        declared: declared.to_string(),
        actual: actual.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::Result;
    use crate::context::tests::{core, request};
    use crate::context::{ResultContext, SendingContext, SentContext};
    use crate::handler::Handler;
    use crate::response::Response;
    use crate::stage::{Priority, Stage};
    use crate::value::Dynamic;

    fn result_state<R: Send + Sync + 'static>(value: R) -> StageState {
        let mut state = StageState::new(Stage::Result, core::<R, (), ()>())
            .with_request(Some(request()))
            .with_response(Some(Response::default()));
        state.slot = crate::slot::Slot::seeded(Some(Dynamic::new(value)), false);
        state
    }

    fn slot_string(state: &StageState) -> Option<String> {
        state.slot.value().and_then(|value| value.downcast::<String>())
    }

    #[tokio::test]
    async fn test_sequential_writers_observe_previous_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for (priority, text) in [
            (Priority::Low, "buckle my shoe"),
            (Priority::First, "one"),
            (Priority::Default, "two"),
        ] {
            let seen = Arc::clone(&seen);
            registry.on_fn(priority, move |context: &mut ResultContext<String>| {
                seen.lock().push(context.result().value().cloned());
                context.result_mut().write(text.to_string());
                Ok(())
            });
        }

        let resolver = TypeResolver::new();
        let state = StageDispatcher::new(&registry, &resolver, false)
            .dispatch(result_state(String::from("decoded")))
            .await
            .unwrap();

        assert_eq!(slot_string(&state).as_deref(), Some("buckle my shoe"));
        assert!(state.slot.is_dirty());
        assert_eq!(
            *seen.lock(),
            vec![
                Some("decoded".to_string()),
                Some("one".to_string()),
                Some("two".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_chaining_across_signatures_keeps_mutations() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_fn(Priority::First, |context: &mut ResultContext<String>| {
                context.result_mut().write("typed".to_string());
                Ok(())
            })
            .on_fn(Priority::Default, |context: &mut ResultContext<Dynamic>| {
                let (value, dirty) = context.result().read();
                assert!(dirty);
                assert_eq!(value.and_then(|v| v.downcast::<String>()).as_deref(), Some("typed"));
                context.items().insert("seen", true);
                Ok(())
            });

        let resolver = TypeResolver::new();
        let state = StageDispatcher::new(&registry, &resolver, false)
            .dispatch(result_state(String::new()))
            .await
            .unwrap();

        assert_eq!(slot_string(&state).as_deref(), Some("typed"));
        assert_eq!(state.core.items.get::<bool>("seen"), Some(true));
    }

    #[tokio::test]
    async fn test_mismatch_fails_unless_suppressed() {
        let mut registry = HandlerRegistry::new();
        registry.on_fn(Priority::Default, |context: &mut ResultContext<u64>| {
            context.result_mut().write(1);
            Ok(())
        });
        let resolver = TypeResolver::new();

        let fault = StageDispatcher::new(&registry, &resolver, false)
            .dispatch(result_state(String::new()))
            .await
            .unwrap_err();
        assert!(fault.error.is_type_mismatch());
        assert!(fault.state.is_some());

        let state = StageDispatcher::new(&registry, &resolver, true)
            .dispatch(result_state(String::from("kept")))
            .await
            .unwrap();
        assert_eq!(slot_string(&state).as_deref(), Some("kept"));
        assert!(!state.slot.is_dirty());
    }

    struct Delayed {
        delay: Duration,
        text: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler<SentContext<String>> for Delayed {
        async fn handle(&self, context: &mut SentContext<String>) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.order.lock().push(self.text);
            context.result_mut().write(self.text.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_merge_follows_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .on(
                Priority::Parallel,
                Delayed {
                    delay: Duration::from_millis(10),
                    text: "slow",
                    order: Arc::clone(&order),
                },
            )
            .on(
                Priority::Parallel,
                Delayed {
                    delay: Duration::from_millis(1),
                    text: "fast",
                    order: Arc::clone(&order),
                },
            )
            .on_fn(Priority::Last, |context: &mut SentContext<String>| {
                context.result_mut().write("sequential".to_string());
                Ok(())
            });

        let state = StageState::new(Stage::Sent, core::<String, (), ()>())
            .with_request(Some(request()))
            .with_response(Some(Response::default()));
        let resolver = TypeResolver::new();
        let state = StageDispatcher::new(&registry, &resolver, false)
            .dispatch(state)
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec!["fast", "slow"]);
        assert_eq!(slot_string(&state).as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn test_parallel_request_edits_merge() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_fn(Priority::Parallel, |context: &mut SendingContext<Dynamic, ()>| {
                context.request_mut().set_header("x-first", "1")
            })
            .on_fn(Priority::Parallel, |context: &mut SendingContext<Dynamic, ()>| {
                context.request_mut().set_header("x-second", "2")
            });

        let state = StageState::new(Stage::Sending, core::<String, (), ()>())
            .with_request(Some(request()));
        let resolver = TypeResolver::new();
        let state = StageDispatcher::new(&registry, &resolver, false)
            .dispatch(state)
            .await
            .unwrap();

        let request = state.request.unwrap();
        assert_eq!(request.header("x-second"), Some("2"));
        assert_eq!(request.header("x-first"), None);
        assert!(!state.slot.is_dirty());
    }

    #[tokio::test]
    async fn test_handler_error_keeps_state() {
        let mut registry = HandlerRegistry::new();
        registry.on_fn(Priority::Default, |_: &mut ResultContext| {
            Err(HttpClientError::handler("boom"))
        });

        let resolver = TypeResolver::new();
        let fault = StageDispatcher::new(&registry, &resolver, false)
            .dispatch(result_state(String::new()))
            .await
            .unwrap_err();

        assert_eq!(fault.error.to_string(), "Handler error: boom");
        let state = fault.state.unwrap();
        assert!(state.request.is_some());
        assert!(state.response.is_some());
    }
}
