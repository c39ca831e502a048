//! Event and aggregate validation
//!
//! Validators are registered once, keyed by the event type or aggregate
//! name they target, and looked up by key at publish and commit time.
//!
//! - Event validators run at commit, one buffered envelope at a time. While
//!   an envelope is validated the unit of work only exposes the envelopes
//!   validated before it.
//! - Aggregate validators run at publish, against the aggregate state that
//!   the new event produces, and only if that state differs from before.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::listener::AggregateRoot;
use crate::types::{DomainEvent, EventEnvelope};
use crate::unit_of_work::UnitOfWork;

/// A rejected event or aggregate state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed for {target}: {message}")]
pub struct ValidationError {
    /// Event type or aggregate name that was rejected
    pub target: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Validates envelopes of one event type before they are committed
#[async_trait]
pub trait EventValidator<E: DomainEvent>: Send + Sync {
    fn event_type(&self) -> &'static str;

    async fn validate(
        &self,
        uow: &UnitOfWork<E>,
        envelope: &EventEnvelope<E>,
    ) -> EngineResult<()>;
}

/// Validates the state of one aggregate type after an event is applied
#[async_trait]
pub trait AggregateValidator<E: DomainEvent>: Send + Sync {
    /// `EventListener::NAME` of the target aggregate
    fn aggregate(&self) -> &'static str;

    async fn validate(
        &self,
        uow: &UnitOfWork<E>,
        aggregate: &(dyn Any + Sync),
    ) -> EngineResult<()>;
}

/// Event validator from a plain function of the envelope
pub struct EventRule<E, F> {
    event_type: &'static str,
    rule: F,
    _event: PhantomData<fn(E)>,
}

impl<E, F> EventRule<E, F>
where
    E: DomainEvent,
    F: Fn(&EventEnvelope<E>) -> Result<(), String> + Send + Sync,
{
    pub fn new(event_type: &'static str, rule: F) -> Self {
        Self {
            event_type,
            rule,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F> EventValidator<E> for EventRule<E, F>
where
    E: DomainEvent,
    F: Fn(&EventEnvelope<E>) -> Result<(), String> + Send + Sync,
{
    fn event_type(&self) -> &'static str {
        self.event_type
    }

    async fn validate(
        &self,
        _uow: &UnitOfWork<E>,
        envelope: &EventEnvelope<E>,
    ) -> EngineResult<()> {
        (self.rule)(envelope)
            .map_err(|message| ValidationError::new(self.event_type, message).into())
    }
}

/// Aggregate validator from a plain function of the typed state
pub struct AggregateRule<A, F> {
    rule: F,
    _aggregate: PhantomData<fn(A)>,
}

impl<A, F> AggregateRule<A, F>
where
    A: AggregateRoot,
    F: Fn(&A) -> Result<(), String> + Send + Sync,
{
    pub fn new(rule: F) -> Self {
        Self {
            rule,
            _aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<A, F> AggregateValidator<A::Event> for AggregateRule<A, F>
where
    A: AggregateRoot,
    F: Fn(&A) -> Result<(), String> + Send + Sync,
{
    fn aggregate(&self) -> &'static str {
        A::NAME
    }

    async fn validate(
        &self,
        _uow: &UnitOfWork<A::Event>,
        aggregate: &(dyn Any + Sync),
    ) -> EngineResult<()> {
        // Validators are keyed by name, so two types sharing one name land here
        let Some(state) = <dyn Any>::downcast_ref::<A>(aggregate) else {
            return Err(EngineError::invalid_state(format!(
                "aggregate validator for {} expected a {}",
                A::NAME,
                std::any::type_name::<A>()
            )));
        };
        (self.rule)(state).map_err(|message| ValidationError::new(A::NAME, message).into())
    }
}

/// Validators keyed by what they target
pub struct ValidatorRegistry<E: DomainEvent> {
    events: HashMap<&'static str, Vec<Arc<dyn EventValidator<E>>>>,
    aggregates: HashMap<&'static str, Vec<Arc<dyn AggregateValidator<E>>>>,
}

impl<E: DomainEvent> Default for ValidatorRegistry<E> {
    fn default() -> Self {
        Self {
            events: HashMap::new(),
            aggregates: HashMap::new(),
        }
    }
}

impl<E: DomainEvent> ValidatorRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_event(&mut self, validator: Arc<dyn EventValidator<E>>) {
        self.events
            .entry(validator.event_type())
            .or_default()
            .push(validator);
    }

    pub fn register_aggregate(&mut self, validator: Arc<dyn AggregateValidator<E>>) {
        self.aggregates
            .entry(validator.aggregate())
            .or_default()
            .push(validator);
    }

    pub fn has_aggregate_validators(&self, aggregate: &str) -> bool {
        self.aggregates.contains_key(aggregate)
    }

    /// Run every validator registered for the envelope's event type
    pub async fn validate_event(
        &self,
        uow: &UnitOfWork<E>,
        envelope: &EventEnvelope<E>,
    ) -> EngineResult<()> {
        if let Some(validators) = self.events.get(envelope.event_type()) {
            for validator in validators {
                validator.validate(uow, envelope).await?;
            }
        }
        Ok(())
    }

    /// Run every validator registered for the named aggregate
    pub async fn validate_aggregate(
        &self,
        uow: &UnitOfWork<E>,
        aggregate: &'static str,
        state: &(dyn Any + Sync),
    ) -> EngineResult<()> {
        if let Some(validators) = self.aggregates.get(aggregate) {
            for validator in validators {
                validator.validate(uow, state).await?;
            }
        }
        Ok(())
    }
}
