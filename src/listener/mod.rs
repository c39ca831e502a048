//! Listeners: state derived by folding events
//!
//! A listener is a pure transition function over envelopes. Aggregates and
//! read models are both listeners; they differ only in who may use them.
//!
//! # Replay pipeline
//!
//! ```text
//! update_to(listener, v) ──► ListenerCache ──► ListenerReplayer ──► event log
//!                              (type, key)       fold (from, v]
//!                                                + live transients (unless
//!                                                  TransientScope::Excluded)
//! ```
//!
//! Stages exchange type-erased listeners (`Box<dyn AnyListener<E>>`) so the
//! pipeline can be composed from trait objects; typed callers go through
//! [`ListenerReplay::update`].

mod cache;
mod replay;

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::ops::Deref;

use crate::error::{EngineError, EngineResult};
use crate::types::{DomainEvent, EventEnvelope};

pub use cache::{ListenerCache, ListenerCacheStats};
pub use replay::{ListenerReplay, ListenerReplayer, SharedReplay, TransientScope};

/// A fold target
///
/// `when` must be pure: the same state and envelope always produce the
/// same result. Unmatched events return `self.clone()`; a listener whose
/// result compares equal to its input did not accept the event.
pub trait EventListener: Clone + PartialEq + Debug + Send + Sync + 'static {
    type Event: DomainEvent;

    /// `()` for root listeners
    type Key: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Stable name used for authorization, validation and logging
    const NAME: &'static str;

    /// State before any event was folded
    fn initial(key: &Self::Key) -> Self;

    fn when(&self, envelope: &EventEnvelope<Self::Event>) -> Self;
}

/// A read-only listener exposed to queries
pub trait ReadModel: EventListener {}

/// A write-side listener that can be validated and emit events
pub trait AggregateRoot: EventListener {}

/// Replay bookkeeping carried by every listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerTags {
    /// Highest persisted version folded in
    pub last_seen_event: i64,
    /// Highest persisted version that changed state
    pub last_accepted_event: i64,
    /// Highest transient version folded in
    pub last_seen_transient_event: i64,
}

impl Default for ListenerTags {
    fn default() -> Self {
        Self {
            last_seen_event: -1,
            last_accepted_event: -1,
            last_seen_transient_event: -1,
        }
    }
}

impl ListenerTags {
    /// Whether transient state was folded in
    ///
    /// Tainted listeners must never be cached: their transient inputs expire.
    pub fn is_tainted(&self) -> bool {
        self.last_seen_transient_event > -1
    }
}

/// A listener value together with its key and tags
#[derive(Clone, PartialEq)]
pub struct ListenerState<L: EventListener> {
    key: L::Key,
    value: L,
    tags: ListenerTags,
}

impl<L: EventListener> ListenerState<L> {
    /// Fresh state for `key`
    pub fn new(key: L::Key) -> Self {
        Self {
            value: L::initial(&key),
            key,
            tags: ListenerTags::default(),
        }
    }

    pub fn key(&self) -> &L::Key {
        &self.key
    }

    pub fn value(&self) -> &L {
        &self.value
    }

    pub fn tags(&self) -> ListenerTags {
        self.tags
    }

    pub fn into_value(self) -> L {
        self.value
    }

    /// Fold one envelope, returning whether the state changed
    ///
    /// Persisted envelopes must arrive contiguously; anything else fails
    /// with `VersionGap` and leaves the state untouched.
    pub fn fold(&mut self, envelope: &EventEnvelope<L::Event>) -> EngineResult<bool> {
        if envelope.is_transient() {
            let next = self.value.when(envelope);
            let changed = next != self.value;
            self.value = next;
            self.tags.last_seen_transient_event =
                self.tags.last_seen_transient_event.max(envelope.version);
            return Ok(changed);
        }

        let expected = self.tags.last_seen_event + 1;
        if envelope.version != expected {
            return Err(EngineError::VersionGap {
                expected,
                found: envelope.version,
            });
        }

        let next = self.value.when(envelope);
        let changed = next != self.value;
        if changed {
            self.tags.last_accepted_event = envelope.version;
            self.value = next;
        }
        self.tags.last_seen_event = envelope.version;
        Ok(changed)
    }
}

impl<L: EventListener> Deref for ListenerState<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.value
    }
}

impl<L: EventListener> Debug for ListenerState<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(L::NAME)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Cache identity of a listener: its type plus the rendering of its key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    type_id: TypeId,
    name: &'static str,
    key: String,
}

impl ListenerKey {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.key)
    }
}

/// Object-safe view of a [`ListenerState`], used between pipeline stages
pub trait AnyListener<E: DomainEvent>: Send + Sync + Debug {
    fn cache_key(&self) -> ListenerKey;

    fn tags(&self) -> ListenerTags;

    /// Lower `last_seen_event` to `version`
    ///
    /// Only valid when nothing after `version` changed the state.
    fn rewind_seen(&mut self, version: i64);

    fn fold(&mut self, envelope: &EventEnvelope<E>) -> EngineResult<bool>;

    fn clone_box(&self) -> Box<dyn AnyListener<E>>;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<L: EventListener> AnyListener<L::Event> for ListenerState<L> {
    fn cache_key(&self) -> ListenerKey {
        ListenerKey {
            type_id: TypeId::of::<L>(),
            name: L::NAME,
            key: format!("{:?}", self.key),
        }
    }

    fn tags(&self) -> ListenerTags {
        self.tags
    }

    fn rewind_seen(&mut self, version: i64) {
        if self.tags.last_accepted_event <= version {
            self.tags.last_seen_event = self.tags.last_seen_event.min(version);
        }
    }

    fn fold(&mut self, envelope: &EventEnvelope<L::Event>) -> EngineResult<bool> {
        ListenerState::fold(self, envelope)
    }

    fn clone_box(&self) -> Box<dyn AnyListener<L::Event>> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Recover the typed state from an erased listener
pub(crate) fn downcast<L: EventListener>(
    listener: Box<dyn AnyListener<L::Event>>,
) -> EngineResult<ListenerState<L>> {
    listener
        .into_any()
        .downcast::<ListenerState<L>>()
        .map(|state| *state)
        .map_err(|_| {
            EngineError::invalid_state(format!("replay returned a listener other than {}", L::NAME))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{envelope, transient, CountById, CountOnes, TestEvent};
    use std::time::Duration;

    #[test]
    fn test_fold_tracks_seen_and_accepted() {
        let mut state = ListenerState::<CountOnes>::new(());

        assert!(state.fold(&envelope(0, 1)).unwrap());
        assert!(!state.fold(&envelope(1, 2)).unwrap());

        assert_eq!(state.count, 1);
        assert_eq!(state.tags().last_seen_event, 1);
        assert_eq!(state.tags().last_accepted_event, 0);
        assert!(!state.tags().is_tainted());
    }

    #[test]
    fn test_fold_rejects_gaps_without_mutation() {
        let mut state = ListenerState::<CountOnes>::new(());
        state.fold(&envelope(0, 1)).unwrap();

        let err = state.fold(&envelope(2, 1)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::VersionGap {
                expected: 1,
                found: 2
            }
        ));
        assert_eq!(state.count, 1);
        assert_eq!(state.tags().last_seen_event, 0);

        // Replaying an already-seen version is a gap too
        assert!(state.fold(&envelope(0, 1)).is_err());
    }

    #[test]
    fn test_transient_fold_only_sets_transient_tag() {
        let mut state = ListenerState::<CountOnes>::new(());
        state.fold(&envelope(0, 1)).unwrap();

        assert!(state.fold(&transient(7, 1, Duration::from_secs(60))).unwrap());

        assert_eq!(state.count, 2);
        assert_eq!(state.tags().last_seen_event, 0);
        assert_eq!(state.tags().last_accepted_event, 0);
        assert_eq!(state.tags().last_seen_transient_event, 7);
        assert!(state.tags().is_tainted());
    }

    #[test]
    fn test_cache_key_distinguishes_type_and_key() {
        let a = ListenerState::<CountById>::new(1).cache_key();
        let b = ListenerState::<CountById>::new(2).cache_key();
        let c = ListenerState::<CountOnes>::new(()).cache_key();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, ListenerState::<CountById>::new(1).cache_key());
        assert_eq!(a.to_string(), "CountById(1)");
    }

    #[test]
    fn test_downcast_roundtrip() {
        let mut state = ListenerState::<CountOnes>::new(());
        state.fold(&envelope(0, 1)).unwrap();

        let erased: Box<dyn AnyListener<TestEvent>> = Box::new(state.clone());
        assert_eq!(downcast::<CountOnes>(erased).unwrap(), state);

        let wrong: Box<dyn AnyListener<TestEvent>> = Box::new(ListenerState::<CountById>::new(3));
        assert!(downcast::<CountOnes>(wrong).is_err());
    }
}
