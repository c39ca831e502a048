//! Reactive side effects
//!
//! A side effect turns one committed (or transient) event into zero or
//! more follow-up events. Handlers are registered once, keyed by the event
//! types they declare, and invoked by the [`SideEffectDispatcher`].
//!
//! The engine does not detect dispatch cycles. A handler that reacts to its
//! own follow-ups must stop by itself.

mod dispatcher;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::types::{DomainEvent, EventEnvelope};
use crate::unit_of_work::UnitOfWork;

pub use dispatcher::{DispatchStats, SideEffectDispatcher};

#[async_trait]
pub trait SideEffect<E: DomainEvent>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Event types this handler reacts to
    fn handles(&self) -> &[&'static str];

    /// React to `envelope`, returning events to publish in the same unit of work
    ///
    /// May run more than once for the same envelope when the commit of its
    /// follow-ups conflicts and is retried.
    async fn handle(
        &self,
        uow: &UnitOfWork<E>,
        envelope: &EventEnvelope<E>,
    ) -> EngineResult<Vec<E>>;
}

/// Handlers keyed by event type, in registration order
pub struct SideEffectRegistry<E: DomainEvent> {
    handlers: HashMap<&'static str, Vec<Arc<dyn SideEffect<E>>>>,
}

impl<E: DomainEvent> Default for SideEffectRegistry<E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<E: DomainEvent> SideEffectRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn SideEffect<E>>) {
        for event_type in handler.handles() {
            self.handlers
                .entry(*event_type)
                .or_default()
                .push(handler.clone());
        }
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn SideEffect<E>>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
