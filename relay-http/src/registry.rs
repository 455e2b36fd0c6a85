//! Handler registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::StageContext;
use crate::handler::{Handler, HandlerDescriptor};
use crate::stage::{Priority, Stage};
use crate::{HttpClientError, Result};

/// Handlers of one priority, in registration order.
#[derive(Debug, Clone, Copy)]
pub struct HandlerGroup<'a> {
    /// Priority shared by the group.
    pub priority: Priority,
    /// Handlers in registration order.
    pub handlers: &'a [Arc<HandlerDescriptor>],
}

/// Handlers keyed by stage and priority.
///
/// Clones are cheap and independent. A registry is read only once a call
/// starts and may be shared by any number of concurrent calls.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<(Stage, Priority), Vec<Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under `stage` and `priority`.
    ///
    /// Fails with [`HttpClientError::InvalidStage`] when the descriptor's
    /// context belongs to a different stage.
    pub fn register(
        &mut self,
        stage: Stage,
        priority: Priority,
        descriptor: HandlerDescriptor,
    ) -> Result<()> {
        if descriptor.stage() != stage {
            return Err(HttpClientError::InvalidStage {
                requested: stage,
                declared: descriptor.stage(),
            });
        }

        self.insert(priority, descriptor);
        Ok(())
    }

    /// Register a handler under the stage of its context.
    pub fn on<C, H>(&mut self, priority: Priority, handler: H) -> &mut Self
    where
        C: StageContext,
        H: Handler<C>,
    {
        self.insert(priority, HandlerDescriptor::new::<C, H>(handler))
    }

    /// Register a synchronous closure under the stage of its context.
    pub fn on_fn<C, F>(&mut self, priority: Priority, f: F) -> &mut Self
    where
        C: StageContext,
        F: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(priority, HandlerDescriptor::from_fn::<C, F>(f))
    }

    fn insert(&mut self, priority: Priority, descriptor: HandlerDescriptor) -> &mut Self {
        tracing::trace!(
            stage = %descriptor.stage(),
            priority = ?priority,
            handler = %descriptor.name(),
            signature = %descriptor.signature(),
            "registering handler"
        );

        self.entries
            .entry((descriptor.stage(), priority))
            .or_default()
            .push(Arc::new(descriptor.with_priority(priority)));
        self
    }

    /// Priority groups of `stage`, in dispatch order.
    pub fn ordered(&self, stage: Stage) -> Vec<HandlerGroup<'_>> {
        self.entries
            .range((stage, Priority::First)..=(stage, Priority::Parallel))
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|((_, priority), handlers)| HandlerGroup {
                priority: *priority,
                handlers,
            })
            .collect()
    }

    /// Handlers of `stage` in dispatch order.
    pub fn handlers(&self, stage: Stage) -> impl Iterator<Item = &HandlerDescriptor> {
        self.entries
            .range((stage, Priority::First)..=(stage, Priority::Parallel))
            .flat_map(|(_, handlers)| handlers.iter().map(Arc::as_ref))
    }

    /// Number of handlers registered for `stage`.
    pub fn count(&self, stage: Stage) -> usize {
        self.handlers(stage).count()
    }

    /// Total number of handlers.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every handler of `other`, after the handlers already present
    /// at the same priority.
    pub fn extend(&mut self, other: &HandlerRegistry) {
        for (key, handlers) in &other.entries {
            self.entries
                .entry(*key)
                .or_default()
                .extend(handlers.iter().cloned());
        }
    }
}
