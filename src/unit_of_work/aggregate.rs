use std::ops::Deref;

use super::UnitOfWork;
use crate::error::EngineResult;
use crate::listener::{AggregateRoot, ListenerState};
use crate::types::EventEnvelope;

/// An aggregate materialized inside a unit of work
///
/// Events applied through the handle are buffered in the owning unit of
/// work and folded into the handle's state immediately.
pub struct Aggregate<A: AggregateRoot> {
    uow: UnitOfWork<A::Event>,
    state: ListenerState<A>,
}

impl<A: AggregateRoot> Aggregate<A> {
    pub(crate) fn new(uow: UnitOfWork<A::Event>, state: ListenerState<A>) -> Self {
        Self { uow, state }
    }

    pub fn key(&self) -> &A::Key {
        self.state.key()
    }

    pub fn state(&self) -> &ListenerState<A> {
        &self.state
    }

    /// Publish `event` with this aggregate as its origin
    pub async fn apply(&mut self, event: A::Event) -> EngineResult<EventEnvelope<A::Event>> {
        let (envelope, state) = self
            .uow
            .publish_for::<A>(event, self.state.key().clone())
            .await?;
        self.state = state;
        Ok(envelope)
    }
}

impl<A: AggregateRoot> Deref for Aggregate<A> {
    type Target = A;

    fn deref(&self) -> &A {
        self.state.value()
    }
}
