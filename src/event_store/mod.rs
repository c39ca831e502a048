//! Event Log Pipeline
//!
//! The log is an ordered, append-only sequence of envelopes. Every stage
//! of the pipeline implements [`EventLog`]; decorators wrap the next stage
//! and may intercept publishes and reads.
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//! ┌───────────┐   ┌────────────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ Unit of   │──►│ TransientEvent     │──►│ InMemoryEvent    │──►│ leaf     │
//! │ Work      │   │ Overlay (split)    │   │ Cache (fill)     │   │ (memory, │
//! └───────────┘   └────────────────────┘   └──────────────────┘   │  jsonl)  │
//!                                                                 └──────────┘
//! Read Path:
//!   get_events(from, to] ──► overlay (pass) ──► cache pages ──► leaf on miss
//! ```
//!
//! Change notification is level-triggered: subscribers receive the latest
//! version through a `watch` channel and must re-read the log on change.

mod cache;
mod memory;
mod store;
mod transient;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{EngineError, EngineResult};
use crate::types::{DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};

pub use cache::InMemoryEventCache;
pub use memory::InMemoryEventLog;
pub use store::JsonlEventLog;
pub use transient::TransientEventOverlay;

/// A shared handle to a pipeline stage
pub type SharedLog<E> = Arc<dyn EventLog<E>>;

/// Contract implemented by every pipeline stage and by the leaf
#[async_trait]
pub trait EventLog<E: DomainEvent>: Send + Sync {
    /// Append envelopes atomically
    ///
    /// Fails with `RetryConflict` unless the versions continue the log
    /// densely.
    async fn publish(&self, envelopes: Vec<EventEnvelope<E>>) -> EngineResult<()>;

    /// Envelopes in `(from_exclusive, to_inclusive]`, in order
    async fn get_events(&self, from_exclusive: i64, to_inclusive: i64)
        -> EngineResult<EventPages<E>>;

    /// The whole persisted log as untyped documents
    async fn get_raw_events(&self) -> EngineResult<Vec<RawEventEnvelope>>;

    /// Replace the envelope at `at_version` with `replacements` and
    /// renumber everything after it
    async fn replace_event(
        &self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()>;

    /// Highest persisted version, `-1` when empty
    async fn get_latest_version(&self) -> EngineResult<i64>;

    /// Level-triggered signal carrying the latest persisted version
    fn subscribe(&self) -> watch::Receiver<i64>;

    /// Live transient envelopes, oldest first
    async fn get_current_transient_events(&self) -> EngineResult<Vec<EventEnvelope<E>>> {
        Ok(Vec::new())
    }

    /// Signal carrying the latest transient version, if a stage keeps them
    fn subscribe_transient(&self) -> Option<watch::Receiver<i64>> {
        None
    }
}

/// Composes a log pipeline leaf-outward
///
/// ```ignore
/// let log = LogPipeline::new(InMemoryEventLog::shared())
///     .layer(|next| InMemoryEventCache::shared(next, 1024))
///     .layer(|next| TransientEventOverlay::shared(next, 10_000, Duration::from_secs(1)))
///     .build();
/// ```
pub struct LogPipeline<E: DomainEvent> {
    head: SharedLog<E>,
    depth: usize,
}

impl<E: DomainEvent> LogPipeline<E> {
    /// Start a pipeline from its leaf
    pub fn new(leaf: SharedLog<E>) -> Self {
        Self {
            head: leaf,
            depth: 0,
        }
    }

    /// Wrap the current head with another stage
    pub fn layer<F>(self, stage: F) -> Self
    where
        F: FnOnce(SharedLog<E>) -> SharedLog<E>,
    {
        Self {
            head: stage(self.head),
            depth: self.depth + 1,
        }
    }

    /// Number of decorators above the leaf
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The outermost stage
    pub fn build(self) -> SharedLog<E> {
        self.head
    }
}

/// Wait until the log has reached `version`
///
/// Resolves with the latest version once it is at least `version`, or with
/// `EngineError::Cancelled` as soon as `cancel` completes. The watch
/// receiver lives only inside this call, so cancellation leaves no waiter
/// behind.
pub async fn wait_for_version<E, C>(
    log: &dyn EventLog<E>,
    version: i64,
    cancel: C,
) -> EngineResult<i64>
where
    E: DomainEvent,
    C: Future<Output = ()>,
{
    // Subscribe before the first read so a publish in between is not missed
    let mut changes = log.subscribe();
    tokio::pin!(cancel);

    loop {
        let latest = log.get_latest_version().await?;
        if latest >= version {
            return Ok(latest);
        }

        tokio::select! {
            _ = &mut cancel => return Err(EngineError::Cancelled),
            changed = changes.changed() => {
                if changed.is_err() {
                    return Err(EngineError::invalid_state("event log was dropped"));
                }
            }
        }
    }
}
