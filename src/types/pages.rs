//! Paged event sequences
//!
//! Range reads may come back split over several contiguous pages (the
//! event cache hands out one page per cached block). `EventPages` reads
//! back as a single ordered sequence.

use std::sync::Arc;

use super::EventEnvelope;

/// An ordered sequence of envelopes stored as contiguous pages
#[derive(Debug, Clone)]
pub struct EventPages<E> {
    pages: Vec<Arc<[EventEnvelope<E>]>>,
    len: usize,
}

impl<E> Default for EventPages<E> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            len: 0,
        }
    }
}

impl<E> EventPages<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a single page
    pub fn from_vec(events: Vec<EventEnvelope<E>>) -> Self {
        let mut pages = Self::new();
        pages.push_page(events);
        pages
    }

    /// Append a page; empty pages are dropped
    pub fn push_page(&mut self, events: Vec<EventEnvelope<E>>) {
        if events.is_empty() {
            return;
        }
        self.len += events.len();
        self.pages.push(events.into());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Iterate all envelopes in order, across pages
    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope<E>> {
        self.pages.iter().flat_map(|page| page.iter())
    }

    pub fn first_version(&self) -> Option<i64> {
        self.iter().next().map(|envelope| envelope.version)
    }

    pub fn last_version(&self) -> Option<i64> {
        self.pages
            .last()
            .and_then(|page| page.last())
            .map(|envelope| envelope.version)
    }
}

impl<E: Clone> EventPages<E> {
    /// Flatten into one owned vector
    pub fn into_vec(self) -> Vec<EventEnvelope<E>> {
        let mut events = Vec::with_capacity(self.len);
        for page in self.pages {
            events.extend(page.iter().cloned());
        }
        events
    }
}
