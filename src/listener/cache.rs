//! Listener cache
//!
//! Remembers the most advanced untainted state per `(listener type, key)`
//! and hands it to the next stage as a starting point, so replays only
//! fold the tail of the log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{AnyListener, ListenerKey, ListenerReplay, SharedReplay, TransientScope};
use crate::error::EngineResult;
use crate::types::DomainEvent;

/// Counters reported by [`ListenerCache::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    /// Results not stored because they were tainted or older than the entry
    pub rejected: u64,
    pub entries: usize,
}

/// Caching decorator over the next replay stage
pub struct ListenerCache<E: DomainEvent> {
    next: SharedReplay<E>,
    entries: RwLock<HashMap<ListenerKey, Box<dyn AnyListener<E>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    rejected: AtomicU64,
}

impl<E: DomainEvent> ListenerCache<E> {
    pub fn new(next: SharedReplay<E>) -> Self {
        Self {
            next,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Construct as a replay stage
    pub fn shared(next: SharedReplay<E>) -> SharedReplay<E> {
        Arc::new(Self::new(next))
    }

    /// Evict every entry
    pub fn clean(&self) {
        let mut entries = self.entries.write();
        let evicted = entries.len();
        entries.clear();
        debug!(evicted, "listener cache cleaned");
    }

    pub fn stats(&self) -> ListenerCacheStats {
        ListenerCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }

    /// Cached entry usable at `to_version`, rewound to it if needed
    ///
    /// An entry qualifies when nothing after `to_version` changed its state
    /// and it is ahead of the listener the caller brought.
    fn lookup(
        &self,
        key: &ListenerKey,
        to_version: i64,
        offered_seen: i64,
    ) -> Option<Box<dyn AnyListener<E>>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        let tags = entry.tags();
        if tags.last_accepted_event > to_version || tags.last_seen_event <= offered_seen {
            return None;
        }

        let mut listener = entry.clone_box();
        if tags.last_seen_event > to_version {
            listener.rewind_seen(to_version);
        }
        Some(listener)
    }

    /// Last write wins by `last_seen_event`; tainted results are never kept
    fn store(&self, key: ListenerKey, listener: &dyn AnyListener<E>) {
        let tags = listener.tags();
        if tags.is_tainted() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut entries = self.entries.write();
        if let Some(current) = entries.get(&key) {
            if current.tags().last_seen_event >= tags.last_seen_event {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        entries.insert(key, listener.clone_box());
        self.stores.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl<E: DomainEvent> ListenerReplay<E> for ListenerCache<E> {
    async fn update_to(
        &self,
        listener: Box<dyn AnyListener<E>>,
        to_version: i64,
        transients: TransientScope,
    ) -> EngineResult<Box<dyn AnyListener<E>>> {
        let key = listener.cache_key();
        let offered_seen = listener.tags().last_seen_event;

        let start = match self.lookup(&key, to_version, offered_seen) {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(
                    listener = %key,
                    seen = cached.tags().last_seen_event,
                    to = to_version,
                    "listener cache hit"
                );
                cached
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(listener = %key, to = to_version, "listener cache miss");
                listener
            }
        };

        // Even an exact hit goes through the next stage so live transient
        // events are overlaid the same way as on a miss
        let result = self.next.update_to(start, to_version, transients).await?;
        self.store(key, result.as_ref());
        Ok(result)
    }
}
