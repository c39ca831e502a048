//! Authorization policies
//!
//! Every publish and every checked read-model read inside a unit of work is
//! offered to the registered policies. Policies are OR-combined: access is
//! granted as soon as one of them allows it, and an empty set allows
//! nothing.
//!
//! Policies receive the unit of work itself so they can consult read
//! models; they must use the `*_unchecked` reads to avoid authorizing their
//! own lookups recursively.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::{ActorId, DomainEvent, EventEnvelope};
use crate::unit_of_work::UnitOfWork;

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthContext {
    pub actor: Option<ActorId>,
}

impl AuthContext {
    pub fn new(actor: Option<ActorId>) -> Self {
        Self { actor }
    }
}

/// A materialized read model offered for authorization
#[derive(Clone, Copy)]
pub struct ReadModelRef<'a> {
    /// `EventListener::NAME` of the read model
    pub name: &'static str,
    pub key: &'a (dyn Debug + Sync),
    /// The listener value; downcast to the concrete read model type
    pub model: &'a (dyn Any + Sync),
}

impl ReadModelRef<'_> {
    pub fn downcast<T: Any>(&self) -> Option<&T> {
        <dyn Any>::downcast_ref::<T>(self.model)
    }
}

/// A capability predicate
///
/// Both checks deny by default, so a policy only implements what it grants.
#[async_trait]
pub trait Policy<E: DomainEvent>: Send + Sync {
    async fn allows_event(
        &self,
        _uow: &UnitOfWork<E>,
        _envelope: &EventEnvelope<E>,
        _ctx: &AuthContext,
    ) -> EngineResult<bool> {
        Ok(false)
    }

    async fn allows_read_model(
        &self,
        _uow: &UnitOfWork<E>,
        _model: ReadModelRef<'_>,
        _ctx: &AuthContext,
    ) -> EngineResult<bool> {
        Ok(false)
    }
}

/// Grants every publish and read
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl<E: DomainEvent> Policy<E> for AllowAll {
    async fn allows_event(
        &self,
        _uow: &UnitOfWork<E>,
        _envelope: &EventEnvelope<E>,
        _ctx: &AuthContext,
    ) -> EngineResult<bool> {
        Ok(true)
    }

    async fn allows_read_model(
        &self,
        _uow: &UnitOfWork<E>,
        _model: ReadModelRef<'_>,
        _ctx: &AuthContext,
    ) -> EngineResult<bool> {
        Ok(true)
    }
}

/// The registered policies, OR-combined
pub struct PolicySet<E: DomainEvent> {
    policies: Vec<Arc<dyn Policy<E>>>,
}

impl<E: DomainEvent> Default for PolicySet<E> {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
        }
    }
}

impl<E: DomainEvent> PolicySet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl Policy<E> + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn push(&mut self, policy: Arc<dyn Policy<E>>) {
        self.policies.push(policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// `Unauthorized` unless some policy allows publishing `envelope`
    pub async fn authorize_event(
        &self,
        uow: &UnitOfWork<E>,
        envelope: &EventEnvelope<E>,
        ctx: &AuthContext,
    ) -> EngineResult<()> {
        for policy in &self.policies {
            if policy.allows_event(uow, envelope, ctx).await? {
                return Ok(());
            }
        }
        debug!(event_type = envelope.event_type(), actor = ?ctx.actor, "publish denied");
        Err(EngineError::unauthorized(format!(
            "publish {}",
            envelope.event_type()
        )))
    }

    /// `Unauthorized` unless some policy allows reading `model`
    pub async fn authorize_read_model(
        &self,
        uow: &UnitOfWork<E>,
        model: ReadModelRef<'_>,
        ctx: &AuthContext,
    ) -> EngineResult<()> {
        for policy in &self.policies {
            if policy.allows_read_model(uow, model, ctx).await? {
                return Ok(());
            }
        }
        debug!(read_model = model.name, key = ?model.key, actor = ?ctx.actor, "read denied");
        Err(EngineError::unauthorized(format!(
            "read {}({:?})",
            model.name, model.key
        )))
    }
}
