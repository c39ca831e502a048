//! Unit of Work
//!
//! One logical operation's view of the log: a snapshot version fixed on
//! first use, a buffer of events not yet visible to anyone else, and the
//! read models it materialized.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──acquire──► Active ──commit──► Committed ──┐
//!                              │                            ├──release──► Returned
//!                              └────discard───► Discarded ──┘
//! ```
//!
//! Handles are cheap clones of one pooled slot. Once the slot is released
//! every handle to it fails with `InvalidState`.

mod aggregate;
mod factory;
mod pool;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::event_store::SharedLog;
use crate::listener::{
    AggregateRoot, EventListener, ListenerState, ReadModel, SharedReplay, TransientScope,
};
use crate::policy::{AuthContext, PolicySet, ReadModelRef};
use crate::types::{ActorId, DomainEvent, EventEnvelope};
use crate::validation::ValidatorRegistry;

pub use aggregate::Aggregate;
pub use factory::{RetryConfig, UnitOfWorkFactory};
pub use pool::{UnitOfWorkPool, DEFAULT_MAX_IDLE};

/// Where a unit of work is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkStatus {
    Uninitialized,
    Active,
    Committed,
    Discarded,
    Returned,
}

/// A read model materialized through a checked read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadModelRecord {
    pub name: &'static str,
    /// Debug rendering of the key
    pub key: String,
    /// Version the read model was materialized at
    pub version: i64,
}

/// Everything a unit of work is constructed with
pub struct UnitOfWorkContext<E: DomainEvent> {
    pub(crate) log: SharedLog<E>,
    pub(crate) replay: SharedReplay<E>,
    pub(crate) policies: PolicySet<E>,
    pub(crate) validators: ValidatorRegistry<E>,
    pub(crate) pool: UnitOfWorkPool<E>,
    pub(crate) transient_ttl: Duration,
}

impl<E: DomainEvent> UnitOfWorkContext<E> {
    pub fn new(
        log: SharedLog<E>,
        replay: SharedReplay<E>,
        policies: PolicySet<E>,
        validators: ValidatorRegistry<E>,
        transient_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            replay,
            policies,
            validators,
            pool: UnitOfWorkPool::default(),
            transient_ttl,
        })
    }

    pub fn log(&self) -> &SharedLog<E> {
        &self.log
    }

    pub fn replay(&self) -> &SharedReplay<E> {
        &self.replay
    }

    pub fn pool(&self) -> &UnitOfWorkPool<E> {
        &self.pool
    }
}

pub(crate) struct SlotState<E> {
    generation: u64,
    status: UnitOfWorkStatus,
    actor: Option<ActorId>,
    consistent_version: Option<i64>,
    buffer: Vec<EventEnvelope<E>>,
    read_models: Vec<ReadModelRecord>,
}

impl<E> SlotState<E> {
    fn reset(&mut self) {
        self.generation += 1;
        self.status = UnitOfWorkStatus::Returned;
        self.actor = None;
        self.consistent_version = None;
        self.buffer.clear();
        self.read_models.clear();
    }
}

/// Pooled storage behind a unit-of-work handle
pub(crate) struct Slot<E> {
    state: parking_lot::Mutex<SlotState<E>>,
    /// Serializes the first snapshot fetch
    snapshot: tokio::sync::Mutex<()>,
}

impl<E> Slot<E> {
    fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(SlotState {
                generation: 0,
                status: UnitOfWorkStatus::Uninitialized,
                actor: None,
                consistent_version: None,
                buffer: Vec::new(),
                read_models: Vec::new(),
            }),
            snapshot: tokio::sync::Mutex::new(()),
        }
    }
}

/// Persisted envelopes count towards version assignment; transient ones don't
fn persisted_count<E>(buffer: &[EventEnvelope<E>]) -> i64 {
    buffer.iter().filter(|e| e.expires_at.is_none()).count() as i64
}

/// Handle to an active unit of work
pub struct UnitOfWork<E: DomainEvent> {
    ctx: Arc<UnitOfWorkContext<E>>,
    slot: Arc<Slot<E>>,
    generation: u64,
    actor: Option<ActorId>,
}

impl<E: DomainEvent> Clone for UnitOfWork<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            slot: self.slot.clone(),
            generation: self.generation,
            actor: self.actor.clone(),
        }
    }
}

impl<E: DomainEvent> fmt::Debug for UnitOfWork<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("generation", &self.generation)
            .field("actor", &self.actor)
            .field("status", &self.status())
            .finish()
    }
}

impl<E: DomainEvent> UnitOfWork<E> {
    /// Take a slot from the context's pool and activate it for `actor`
    pub fn acquire(ctx: &Arc<UnitOfWorkContext<E>>, actor: Option<ActorId>) -> Self {
        let (slot, generation) = ctx.pool.acquire(actor.clone());
        Self {
            ctx: ctx.clone(),
            slot,
            generation,
            actor,
        }
    }

    /// Clear the slot and hand it back to the pool
    ///
    /// Safe to call more than once; only the first call has an effect.
    pub fn release(&self) {
        self.ctx.pool.release(&self.slot, self.generation);
    }

    /// Drop buffered events without committing
    pub fn discard(&self) -> EngineResult<()> {
        self.with_active(|state| {
            state.buffer.clear();
            state.status = UnitOfWorkStatus::Discarded;
        })
    }

    pub fn status(&self) -> UnitOfWorkStatus {
        let state = self.slot.state.lock();
        if state.generation != self.generation {
            UnitOfWorkStatus::Returned
        } else {
            state.status
        }
    }

    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }

    pub fn auth_context(&self) -> AuthContext {
        AuthContext::new(self.actor.clone())
    }

    fn with_active<R>(&self, f: impl FnOnce(&mut SlotState<E>) -> R) -> EngineResult<R> {
        let mut state = self.slot.state.lock();
        if state.generation != self.generation {
            return Err(EngineError::invalid_state(
                "unit of work was returned to the pool",
            ));
        }
        if state.status != UnitOfWorkStatus::Active {
            return Err(EngineError::invalid_state(format!(
                "unit of work is {:?}",
                state.status
            )));
        }
        Ok(f(&mut state))
    }

    /// The snapshot every read in this unit of work is based on
    ///
    /// Fetched from the log on first call, then frozen.
    pub async fn consistent_version(&self) -> EngineResult<i64> {
        if let Some(version) = self.with_active(|s| s.consistent_version)? {
            return Ok(version);
        }

        let _guard = self.slot.snapshot.lock().await;
        // A concurrent read may have fetched it while we waited
        if let Some(version) = self.with_active(|s| s.consistent_version)? {
            return Ok(version);
        }

        let latest = self.ctx.log.get_latest_version().await?;
        self.with_active(|s| *s.consistent_version.get_or_insert(latest))
    }

    /// Pin the snapshot to `version` before anything reads it
    pub fn prefill_version(&self, version: i64) -> EngineResult<()> {
        self.with_active(|state| match state.consistent_version {
            Some(current) if current != version => Err(EngineError::invalid_state(format!(
                "snapshot already taken at {current}"
            ))),
            _ => {
                state.consistent_version = Some(version);
                Ok(())
            }
        })?
    }

    /// Buffered envelopes, oldest first
    pub fn pending_events(&self) -> EngineResult<Vec<EventEnvelope<E>>> {
        self.with_active(|s| s.buffer.clone())
    }

    /// Read models registered by checked reads
    pub fn read_models(&self) -> EngineResult<Vec<ReadModelRecord>> {
        self.with_active(|s| s.read_models.clone())
    }

    /// Replay `L` for `key` at `at`, then overlay this unit's own writes
    ///
    /// Without `at` the read sees the snapshot, the live transient events and
    /// every buffered event. With `at` the log is replayed to
    /// `min(at, snapshot)`, only buffered envelopes up to `at` are applied and
    /// no transient event is visible.
    async fn materialize<L>(
        &self,
        key: L::Key,
        at: Option<i64>,
    ) -> EngineResult<(ListenerState<L>, i64)>
    where
        L: EventListener<Event = E>,
    {
        let consistent = self.consistent_version().await?;
        let pending = self.pending_events()?;
        let pin = at.unwrap_or(consistent + persisted_count(&pending));

        let transients = if at.is_some() {
            TransientScope::Excluded
        } else {
            TransientScope::Live
        };
        let mut state = self
            .ctx
            .replay
            .update_with(ListenerState::<L>::new(key), pin.min(consistent), transients)
            .await?;

        for envelope in &pending {
            let visible = if envelope.is_transient() {
                at.is_none()
            } else {
                envelope.version <= pin
            };
            if visible {
                state.fold(envelope)?;
            }
        }
        Ok((state, pin))
    }

    async fn authorize_read<L>(&self, state: &ListenerState<L>) -> EngineResult<()>
    where
        L: ReadModel<Event = E>,
    {
        let model = ReadModelRef {
            name: L::NAME,
            key: state.key(),
            model: state.value(),
        };
        self.ctx
            .policies
            .authorize_read_model(self, model, &self.auth_context())
            .await
    }

    /// Materialize a keyed read model, checking authorization
    ///
    /// Reads pinned with `at` see persisted events only; live and buffered
    /// transient events are left out.
    pub async fn get_read_model<L>(
        &self,
        key: L::Key,
        at: Option<i64>,
    ) -> EngineResult<ListenerState<L>>
    where
        L: ReadModel<Event = E>,
    {
        let (state, version) = self.materialize::<L>(key, at).await?;
        self.authorize_read(&state).await?;

        let record = ReadModelRecord {
            name: L::NAME,
            key: format!("{:?}", state.key()),
            version,
        };
        self.with_active(|s| s.read_models.push(record))?;
        Ok(state)
    }

    /// Materialize a root read model, checking authorization
    pub async fn get_root_read_model<L>(&self, at: Option<i64>) -> EngineResult<ListenerState<L>>
    where
        L: ReadModel<Event = E, Key = ()>,
    {
        self.get_read_model::<L>((), at).await
    }

    /// Materialize a keyed read model without authorization or registration
    ///
    /// For policies and other internal callers.
    pub async fn get_read_model_unchecked<L>(
        &self,
        key: L::Key,
        at: Option<i64>,
    ) -> EngineResult<ListenerState<L>>
    where
        L: ReadModel<Event = E>,
    {
        let (state, _) = self.materialize::<L>(key, at).await?;
        Ok(state)
    }

    pub async fn get_root_read_model_unchecked<L>(
        &self,
        at: Option<i64>,
    ) -> EngineResult<ListenerState<L>>
    where
        L: ReadModel<Event = E, Key = ()>,
    {
        self.get_read_model_unchecked::<L>((), at).await
    }

    /// Materialize several keys concurrently
    ///
    /// Keys the caller may not read are left out of the result; any other
    /// failure fails the whole call.
    pub async fn get_multiple_read_models<L>(
        &self,
        keys: impl IntoIterator<Item = L::Key>,
        at: Option<i64>,
    ) -> EngineResult<Vec<ListenerState<L>>>
    where
        L: ReadModel<Event = E>,
    {
        let reads = keys.into_iter().map(|key| self.get_read_model::<L>(key, at));
        let mut models = Vec::new();
        for result in join_all(reads).await {
            match result {
                Ok(model) => models.push(model),
                Err(EngineError::Unauthorized { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(models)
    }

    /// Materialize a keyed aggregate bound to this unit of work
    pub async fn get_aggregate<A>(&self, key: A::Key) -> EngineResult<Aggregate<A>>
    where
        A: AggregateRoot<Event = E>,
    {
        let (state, _) = self.materialize::<A>(key, None).await?;
        Ok(Aggregate::new(self.clone(), state))
    }

    pub async fn get_root_aggregate<A>(&self) -> EngineResult<Aggregate<A>>
    where
        A: AggregateRoot<Event = E, Key = ()>,
    {
        self.get_aggregate::<A>(()).await
    }

    /// Build the next envelope and authorize it
    async fn prepare(
        &self,
        event: E,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<EventEnvelope<E>> {
        let consistent = self.consistent_version().await?;
        let version = self.with_active(|s| consistent + persisted_count(&s.buffer) + 1)?;

        let envelope = match expires_at {
            Some(expires_at) => {
                EventEnvelope::transient(version, self.actor.clone(), event, expires_at)
            }
            None => EventEnvelope::new(version, self.actor.clone(), event),
        };

        self.ctx
            .policies
            .authorize_event(self, &envelope, &self.auth_context())
            .await?;
        Ok(envelope)
    }

    /// Append to the buffer, unless another publish claimed the version first
    fn enqueue(&self, envelope: &EventEnvelope<E>) -> EngineResult<()> {
        self.with_active(|state| {
            let consistent = state.consistent_version.unwrap_or(-1);
            let expected = consistent + persisted_count(&state.buffer) + 1;
            if envelope.version != expected {
                return Err(EngineError::invalid_state(
                    "unit of work used by concurrent publishers",
                ));
            }
            state.buffer.push(envelope.clone());
            Ok(())
        })?
    }

    /// Buffer an event for commit
    pub async fn publish(&self, event: E) -> EngineResult<EventEnvelope<E>> {
        let envelope = self.prepare(event, None).await?;
        self.enqueue(&envelope)?;
        Ok(envelope)
    }

    /// Buffer an event raised by `aggregate`, validating the aggregate's new state
    pub async fn publish_from<A>(
        &self,
        event: E,
        aggregate: &Aggregate<A>,
    ) -> EngineResult<EventEnvelope<E>>
    where
        A: AggregateRoot<Event = E>,
    {
        let (envelope, _) = self.publish_for::<A>(event, aggregate.key().clone()).await?;
        Ok(envelope)
    }

    /// Buffer a transient event that expires after `ttl` (or the configured default)
    pub async fn publish_transient(
        &self,
        event: E,
        ttl: Option<Duration>,
    ) -> EngineResult<EventEnvelope<E>> {
        let ttl = ttl.unwrap_or(self.ctx.transient_ttl);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| EngineError::invalid_state(format!("transient ttl out of range: {e}")))?;
        let envelope = self.prepare(event, Some(Utc::now() + ttl)).await?;
        self.enqueue(&envelope)?;
        Ok(envelope)
    }

    /// Publish on behalf of the aggregate `A` keyed by `key`
    ///
    /// Re-derives the aggregate with every buffered event plus the new one;
    /// if that changed its state, the aggregate validators must accept the
    /// new state before the event is buffered.
    pub(crate) async fn publish_for<A>(
        &self,
        event: E,
        key: A::Key,
    ) -> EngineResult<(EventEnvelope<E>, ListenerState<A>)>
    where
        A: AggregateRoot<Event = E>,
    {
        let envelope = self.prepare(event, None).await?;
        let (before, _) = self.materialize::<A>(key, None).await?;

        let mut after = before.clone();
        after.fold(&envelope)?;
        if after.value() != before.value() {
            self.ctx
                .validators
                .validate_aggregate(self, A::NAME, after.value())
                .await?;
        }

        self.enqueue(&envelope)?;
        Ok((envelope, after))
    }

    /// Validate the buffer and publish it as one batch
    ///
    /// Each envelope is validated with only the envelopes validated before
    /// it visible in the buffer. A `RetryConflict` from the log leaves the
    /// buffer in place for the factory to discard.
    pub(crate) async fn commit_internal(&self) -> EngineResult<()> {
        let pending = self.with_active(|s| std::mem::take(&mut s.buffer))?;

        for (index, envelope) in pending.iter().enumerate() {
            if let Err(e) = self.ctx.validators.validate_event(self, envelope).await {
                self.with_active(|s| s.buffer = pending.clone())?;
                debug!(
                    event_type = envelope.event_type(),
                    index,
                    error = %e,
                    "commit rejected by validator"
                );
                return Err(e);
            }
            self.with_active(|s| s.buffer.push(envelope.clone()))?;
        }

        if !pending.is_empty() {
            self.ctx.log.publish(pending.clone()).await?;
        }

        let persisted = persisted_count(&pending);
        self.with_active(|state| {
            if let Some(version) = state.consistent_version.as_mut() {
                *version += persisted;
            }
            state.buffer.clear();
            state.status = UnitOfWorkStatus::Committed;
        })?;

        debug!(
            actor = ?self.actor,
            events = pending.len(),
            persisted,
            "unit of work committed"
        );
        Ok(())
    }
}
