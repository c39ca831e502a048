//! Listener replay
//!
//! Folds a listener forward from its last seen version to a target version,
//! then overlays the live transient events unless the read is pinned to a
//! historical version.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{downcast, AnyListener, EventListener, ListenerState};
use crate::error::EngineResult;
use crate::event_store::SharedLog;
use crate::types::DomainEvent;

/// A shared handle to a replay stage
pub type SharedReplay<E> = Arc<dyn ListenerReplay<E>>;

/// Whether a replay overlays the live transient events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientScope {
    Live,
    /// Persisted events only; transients have no place in a historical read
    Excluded,
}

/// Contract implemented by every replay stage
#[async_trait]
pub trait ListenerReplay<E: DomainEvent>: Send + Sync {
    /// Bring `listener` up to `to_version`
    async fn update_to(
        &self,
        listener: Box<dyn AnyListener<E>>,
        to_version: i64,
        transients: TransientScope,
    ) -> EngineResult<Box<dyn AnyListener<E>>>;
}

impl<E: DomainEvent> dyn ListenerReplay<E> {
    /// Typed entry point over [`ListenerReplay::update_to`], with live
    /// transients overlaid
    pub async fn update<L>(
        &self,
        state: ListenerState<L>,
        to_version: i64,
    ) -> EngineResult<ListenerState<L>>
    where
        L: EventListener<Event = E>,
    {
        self.update_with(state, to_version, TransientScope::Live).await
    }

    pub async fn update_with<L>(
        &self,
        state: ListenerState<L>,
        to_version: i64,
        transients: TransientScope,
    ) -> EngineResult<ListenerState<L>>
    where
        L: EventListener<Event = E>,
    {
        let updated = self.update_to(Box::new(state), to_version, transients).await?;
        downcast::<L>(updated)
    }
}

/// The innermost replay stage, reading straight from the event log
pub struct ListenerReplayer<E: DomainEvent> {
    log: SharedLog<E>,
}

impl<E: DomainEvent> ListenerReplayer<E> {
    pub fn new(log: SharedLog<E>) -> Self {
        Self { log }
    }

    pub fn shared(log: SharedLog<E>) -> SharedReplay<E> {
        Arc::new(Self::new(log))
    }
}

#[async_trait]
impl<E: DomainEvent> ListenerReplay<E> for ListenerReplayer<E> {
    async fn update_to(
        &self,
        mut listener: Box<dyn AnyListener<E>>,
        to_version: i64,
        transients: TransientScope,
    ) -> EngineResult<Box<dyn AnyListener<E>>> {
        let from = listener.tags().last_seen_event;
        if to_version > from {
            let events = self.log.get_events(from, to_version).await?;
            trace!(
                listener = %listener.cache_key(),
                from,
                to = to_version,
                count = events.len(),
                "replaying listener"
            );
            for envelope in events.iter() {
                listener.fold(envelope)?;
            }
        }

        if transients == TransientScope::Live {
            let seen_transient = listener.tags().last_seen_transient_event;
            let transient = self.log.get_current_transient_events().await?;
            for envelope in transient.iter().filter(|e| e.version > seen_transient) {
                listener.fold(envelope)?;
            }
        }

        Ok(listener)
    }
}
