//! Transient event overlay
//!
//! Splits mixed publishes: persisted envelopes go downstream, transient ones
//! stay in a bounded in-memory list with their own version counter until
//! they expire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::{EventLog, SharedLog};
use crate::error::EngineResult;
use crate::types::{DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};

struct TransientList<E> {
    events: VecDeque<EventEnvelope<E>>,
    next_version: i64,
}

impl<E: DomainEvent> TransientList<E> {
    /// Drop expired envelopes, returning how many were removed
    fn sweep(&mut self) -> usize {
        let now = Utc::now();
        let before = self.events.len();
        self.events.retain(|e| !e.is_expired(now));
        before - self.events.len()
    }
}

/// Decorator that keeps transient events out of the persisted log
pub struct TransientEventOverlay<E: DomainEvent> {
    next: SharedLog<E>,
    /// Shared by publish, read and sweep
    list: Arc<Mutex<TransientList<E>>>,
    max_items: usize,
    sweep_interval: Duration,
    sweep_scheduled: Arc<AtomicBool>,
    transient_changes: watch::Sender<i64>,
}

impl<E: DomainEvent> TransientEventOverlay<E> {
    pub fn new(next: SharedLog<E>, max_items: usize, sweep_interval: Duration) -> Self {
        let (transient_changes, _) = watch::channel(-1);
        Self {
            next,
            list: Arc::new(Mutex::new(TransientList {
                events: VecDeque::new(),
                next_version: 0,
            })),
            max_items: max_items.max(1),
            sweep_interval,
            sweep_scheduled: Arc::new(AtomicBool::new(false)),
            transient_changes,
        }
    }

    /// Construct as a pipeline stage
    pub fn shared(next: SharedLog<E>, max_items: usize, sweep_interval: Duration) -> SharedLog<E> {
        Arc::new(Self::new(next, max_items, sweep_interval))
    }

    /// Number of transient envelopes held, expired ones included
    pub fn held(&self) -> usize {
        self.list.lock().events.len()
    }

    fn append_transient(&self, transient: Vec<EventEnvelope<E>>) {
        let latest = {
            let mut list = self.list.lock();
            for mut envelope in transient {
                envelope.version = list.next_version;
                list.next_version += 1;
                list.events.push_back(envelope);
            }
            while list.events.len() > self.max_items {
                list.events.pop_front();
            }

            // Scheduled under the lock so a finishing sweep cannot miss this batch
            if !self.sweep_scheduled.swap(true, Ordering::AcqRel) {
                self.spawn_sweep();
            }
            list.next_version - 1
        };
        self.transient_changes.send_replace(latest);
    }

    /// Sweep on a fixed interval until the list drains
    ///
    /// Bursts of publishes within one interval share a single task. The task
    /// holds only a weak handle and exits once the overlay is dropped.
    fn spawn_sweep(&self) {
        let list: Weak<Mutex<TransientList<E>>> = Arc::downgrade(&self.list);
        let scheduled = self.sweep_scheduled.clone();
        let interval = self.sweep_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(strong) = list.upgrade() else {
                    return;
                };

                let mut guard = strong.lock();
                let removed = guard.sweep();
                if removed > 0 {
                    debug!(removed, remaining = guard.events.len(), "swept transient events");
                }
                if guard.events.is_empty() {
                    scheduled.store(false, Ordering::Release);
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl<E: DomainEvent> EventLog<E> for TransientEventOverlay<E> {
    async fn publish(&self, envelopes: Vec<EventEnvelope<E>>) -> EngineResult<()> {
        let Some(baseline) = envelopes.first().map(|e| e.version) else {
            return Ok(());
        };

        let (transient, mut persisted): (Vec<_>, Vec<_>) =
            envelopes.into_iter().partition(EventEnvelope::is_transient);

        if !persisted.is_empty() {
            for (offset, envelope) in persisted.iter_mut().enumerate() {
                envelope.version = baseline + offset as i64;
            }
            self.next.publish(persisted).await?;
        }

        if !transient.is_empty() {
            self.append_transient(transient);
        }
        Ok(())
    }

    async fn get_events(
        &self,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> EngineResult<EventPages<E>> {
        self.next.get_events(from_exclusive, to_inclusive).await
    }

    async fn get_raw_events(&self) -> EngineResult<Vec<RawEventEnvelope>> {
        self.next.get_raw_events().await
    }

    async fn replace_event(
        &self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()> {
        self.next.replace_event(at_version, replacements).await
    }

    async fn get_latest_version(&self) -> EngineResult<i64> {
        self.next.get_latest_version().await
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.next.subscribe()
    }

    async fn get_current_transient_events(&self) -> EngineResult<Vec<EventEnvelope<E>>> {
        let now = Utc::now();
        let list = self.list.lock();
        Ok(list
            .events
            .iter()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect())
    }

    fn subscribe_transient(&self) -> Option<watch::Receiver<i64>> {
        Some(self.transient_changes.subscribe())
    }
}
