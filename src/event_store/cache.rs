//! In-memory event cache
//!
//! Keeps fixed-size pages of envelopes already read from (or published
//! through) the next stage. Everything up to the cached frontier is
//! guaranteed to be present; reads beyond it go through a single-flight
//! fill guarded by one async mutex.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use super::{EventLog, SharedLog};
use crate::error::EngineResult;
use crate::types::{DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};

struct CachePages<E> {
    page_size: usize,
    pages: BTreeMap<i64, Vec<Option<EventEnvelope<E>>>>,
    /// Every version in `0..=frontier` is cached
    frontier: i64,
}

impl<E: Clone> CachePages<E> {
    fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: BTreeMap::new(),
            frontier: -1,
        }
    }

    fn locate(&self, version: i64) -> (i64, usize) {
        let size = self.page_size as i64;
        (version / size, (version % size) as usize)
    }

    fn slot(&self, version: i64) -> Option<&EventEnvelope<E>> {
        let (page, offset) = self.locate(version);
        self.pages.get(&page)?.get(offset)?.as_ref()
    }

    fn insert<'a, I>(&mut self, envelopes: I)
    where
        I: IntoIterator<Item = &'a EventEnvelope<E>>,
        E: 'a,
    {
        for envelope in envelopes {
            if envelope.version < 0 {
                continue;
            }
            let (page, offset) = self.locate(envelope.version);
            let page_size = self.page_size;
            let slots = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![None; page_size]);
            slots[offset] = Some(envelope.clone());
        }

        // Only advance across a contiguous run; a gap stops the frontier
        while self.slot(self.frontier + 1).is_some() {
            self.frontier += 1;
        }
    }

    /// Copy `(from_exclusive, to_inclusive]` out, one page per cache page
    ///
    /// Callers guarantee `to_inclusive <= frontier`.
    fn slice(&self, from_exclusive: i64, to_inclusive: i64) -> EventPages<E> {
        let mut result = EventPages::new();
        let start = (from_exclusive + 1).max(0);
        if to_inclusive < start {
            return result;
        }

        let (first_page, first_offset) = self.locate(start);
        let (last_page, last_offset) = self.locate(to_inclusive);

        for (&index, slots) in self.pages.range(first_page..=last_page) {
            let from = if index == first_page { first_offset } else { 0 };
            let to = if index == last_page {
                last_offset
            } else {
                self.page_size - 1
            };
            let page: Vec<EventEnvelope<E>> = slots[from..=to].iter().flatten().cloned().collect();
            result.push_page(page);
        }
        result
    }

    /// Drop every page from the one holding `version` onwards
    fn invalidate_from(&mut self, version: i64) {
        let (page, _) = self.locate(version.max(0));
        self.pages.split_off(&page);
        self.frontier = self.frontier.min(page * self.page_size as i64 - 1);
    }
}

/// Caching decorator over the next log stage
pub struct InMemoryEventCache<E: DomainEvent> {
    next: SharedLog<E>,
    pages: RwLock<CachePages<E>>,
    /// Serializes fills so overlapping misses cause one downstream read
    fill: Mutex<()>,
    downstream_reads: AtomicUsize,
}

impl<E: DomainEvent> InMemoryEventCache<E> {
    /// Wrap `next`, caching `cache_size_per_item` versions per page
    pub fn new(next: SharedLog<E>, cache_size_per_item: usize) -> Self {
        Self {
            next,
            pages: RwLock::new(CachePages::new(cache_size_per_item.max(1))),
            fill: Mutex::new(()),
            downstream_reads: AtomicUsize::new(0),
        }
    }

    /// Construct as a pipeline stage
    pub fn shared(next: SharedLog<E>, cache_size_per_item: usize) -> SharedLog<E> {
        Arc::new(Self::new(next, cache_size_per_item))
    }

    /// Highest version below which the cache is complete
    pub fn cached_frontier(&self) -> i64 {
        self.pages.read().frontier
    }

    /// Number of range reads forwarded to the next stage
    pub fn downstream_reads(&self) -> usize {
        self.downstream_reads.load(Ordering::Relaxed)
    }

    /// Make sure everything up to `to_inclusive` that exists downstream is cached
    async fn ensure_loaded(&self, to_inclusive: i64) -> EngineResult<()> {
        let _guard = self.fill.lock().await;

        // Another caller may have filled the range while we waited
        let frontier = self.cached_frontier();
        if to_inclusive <= frontier {
            return Ok(());
        }

        self.downstream_reads.fetch_add(1, Ordering::Relaxed);
        let fetched = self.next.get_events(frontier, to_inclusive).await?;
        trace!(from = frontier, to = to_inclusive, count = fetched.len(), "event cache fill");

        self.pages.write().insert(fetched.iter());
        Ok(())
    }
}

#[async_trait]
impl<E: DomainEvent> EventLog<E> for InMemoryEventCache<E> {
    async fn publish(&self, envelopes: Vec<EventEnvelope<E>>) -> EngineResult<()> {
        let published = envelopes.clone();
        self.next.publish(envelopes).await?;
        self.pages.write().insert(published.iter());
        Ok(())
    }

    async fn get_events(
        &self,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> EngineResult<EventPages<E>> {
        if to_inclusive <= from_exclusive {
            return Ok(EventPages::new());
        }

        if to_inclusive > self.cached_frontier() {
            // Nothing exists past the latest version, so there is nothing to fill
            let target = to_inclusive.min(self.next.get_latest_version().await?);
            if target > self.cached_frontier() {
                self.ensure_loaded(target).await?;
            }
        }

        let pages = self.pages.read();
        let to = to_inclusive.min(pages.frontier);
        Ok(pages.slice(from_exclusive, to))
    }

    async fn get_raw_events(&self) -> EngineResult<Vec<RawEventEnvelope>> {
        self.next.get_raw_events().await
    }

    async fn replace_event(
        &self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()> {
        let _guard = self.fill.lock().await;
        self.next.replace_event(at_version, replacements).await?;
        self.pages.write().invalidate_from(at_version);
        debug!(at_version, "event cache invalidated after replacement");
        Ok(())
    }

    async fn get_latest_version(&self) -> EngineResult<i64> {
        self.next.get_latest_version().await
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.next.subscribe()
    }

    async fn get_current_transient_events(&self) -> EngineResult<Vec<EventEnvelope<E>>> {
        self.next.get_current_transient_events().await
    }

    fn subscribe_transient(&self) -> Option<watch::Receiver<i64>> {
        self.next.subscribe_transient()
    }
}
