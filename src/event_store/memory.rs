//! In-memory leaf log
//!
//! `EventEntries` holds the dense version bookkeeping shared by both leaf
//! implementations; `InMemoryEventLog` is the volatile leaf built on it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use super::EventLog;
use crate::error::{EngineError, EngineResult};
use crate::types::{DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};

/// One stored envelope: the raw document is authoritative, the typed form
/// is decoded when the document matches the current schema
#[derive(Debug, Clone)]
struct Slot<E> {
    raw: RawEventEnvelope,
    typed: Option<EventEnvelope<E>>,
}

impl<E: DomainEvent> Slot<E> {
    fn from_typed(envelope: EventEnvelope<E>) -> EngineResult<Self> {
        Ok(Self {
            raw: envelope.to_raw()?,
            typed: Some(envelope),
        })
    }

    fn from_raw(raw: RawEventEnvelope) -> Self {
        let typed = EventEnvelope::from_raw(&raw).ok();
        Self { raw, typed }
    }

    fn renumber(&mut self, version: i64) {
        self.raw.version = version;
        if let Some(typed) = self.typed.as_mut() {
            typed.version = version;
        }
    }

    fn decoded(&self) -> EngineResult<EventEnvelope<E>> {
        match &self.typed {
            Some(envelope) => Ok(envelope.clone()),
            None => EventEnvelope::from_raw(&self.raw),
        }
    }
}

/// Dense, zero-based envelope storage
#[derive(Debug, Clone)]
pub(crate) struct EventEntries<E> {
    slots: Vec<Slot<E>>,
}

impl<E: DomainEvent> EventEntries<E> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Load from raw documents that must already be densely numbered
    pub(crate) fn from_raw(raw_events: Vec<RawEventEnvelope>) -> EngineResult<Self> {
        let mut slots = Vec::with_capacity(raw_events.len());
        for (index, raw) in raw_events.into_iter().enumerate() {
            if raw.version != index as i64 {
                return Err(EngineError::invalid_state(format!(
                    "log is not dense: found version {} at position {}",
                    raw.version, index
                )));
            }
            slots.push(Slot::from_raw(raw));
        }
        Ok(Self { slots })
    }

    pub(crate) fn latest_version(&self) -> i64 {
        self.slots.len() as i64 - 1
    }

    /// Check that `envelopes` continue the log densely
    pub(crate) fn check_append(&self, envelopes: &[EventEnvelope<E>]) -> EngineResult<()> {
        let next = self.slots.len() as i64;
        for (offset, envelope) in envelopes.iter().enumerate() {
            if envelope.is_transient() {
                return Err(EngineError::invalid_state(format!(
                    "transient envelope {} reached the persistent log",
                    envelope.version
                )));
            }
            let expected = next + offset as i64;
            if envelope.version != expected {
                return Err(EngineError::RetryConflict {
                    attempted: envelope.version,
                    next: expected,
                });
            }
        }
        Ok(())
    }

    /// Raw documents for envelopes about to be appended
    pub(crate) fn encode(envelopes: &[EventEnvelope<E>]) -> EngineResult<Vec<RawEventEnvelope>> {
        envelopes.iter().map(EventEnvelope::to_raw).collect()
    }

    /// Append envelopes already checked by `check_append`
    pub(crate) fn append(&mut self, envelopes: Vec<EventEnvelope<E>>) -> EngineResult<()> {
        let slots = envelopes
            .into_iter()
            .map(Slot::from_typed)
            .collect::<EngineResult<Vec<_>>>()?;
        self.slots.extend(slots);
        Ok(())
    }

    pub(crate) fn range(
        &self,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> EngineResult<Vec<EventEnvelope<E>>> {
        let start = (from_exclusive + 1).max(0);
        let end = to_inclusive.min(self.latest_version());
        if end < start {
            return Ok(Vec::new());
        }

        self.slots[start as usize..=end as usize]
            .iter()
            .map(Slot::decoded)
            .collect()
    }

    pub(crate) fn raw(&self) -> Vec<RawEventEnvelope> {
        self.slots.iter().map(|slot| slot.raw.clone()).collect()
    }

    /// Replace the slot at `at_version` and renumber the tail
    pub(crate) fn replace(
        &mut self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()> {
        if at_version < 0 || at_version > self.latest_version() {
            return Err(EngineError::invalid_state(format!(
                "cannot replace version {} in a log ending at {}",
                at_version,
                self.latest_version()
            )));
        }
        for (offset, raw) in replacements.iter().enumerate() {
            let expected = at_version + offset as i64;
            if raw.version != expected {
                return Err(EngineError::invalid_state(format!(
                    "replacement numbered {} where {} was expected",
                    raw.version, expected
                )));
            }
        }

        let at = at_version as usize;
        let mut tail = self.slots.split_off(at);
        tail.remove(0);

        self.slots.extend(replacements.into_iter().map(Slot::from_raw));
        for mut slot in tail {
            slot.renumber(self.slots.len() as i64);
            self.slots.push(slot);
        }
        Ok(())
    }
}

/// Volatile leaf log
///
/// Publishing is linearizable: version checks and the append happen under
/// one write lock, so of two racing publishers for the same version exactly
/// one succeeds.
pub struct InMemoryEventLog<E: DomainEvent> {
    entries: RwLock<EventEntries<E>>,
    changes: watch::Sender<i64>,
}

impl<E: DomainEvent> InMemoryEventLog<E> {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(-1);
        Self {
            entries: RwLock::new(EventEntries::new()),
            changes,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live change subscribers
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn notify(&self, latest: i64) {
        self.changes.send_replace(latest);
    }
}

impl<E: DomainEvent> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: DomainEvent> EventLog<E> for InMemoryEventLog<E> {
    async fn publish(&self, envelopes: Vec<EventEnvelope<E>>) -> EngineResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let latest = {
            let mut entries = self.entries.write();
            entries.check_append(&envelopes)?;
            entries.append(envelopes)?;
            entries.latest_version()
        };
        self.notify(latest);
        Ok(())
    }

    async fn get_events(
        &self,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> EngineResult<EventPages<E>> {
        let events = self.entries.read().range(from_exclusive, to_inclusive)?;
        Ok(EventPages::from_vec(events))
    }

    async fn get_raw_events(&self) -> EngineResult<Vec<RawEventEnvelope>> {
        Ok(self.entries.read().raw())
    }

    async fn replace_event(
        &self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()> {
        let latest = {
            let mut entries = self.entries.write();
            entries.replace(at_version, replacements)?;
            entries.latest_version()
        };
        self.notify(latest);
        Ok(())
    }

    async fn get_latest_version(&self) -> EngineResult<i64> {
        Ok(self.entries.read().latest_version())
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{envelope, raw, TestEvent};

    fn versions(pages: &EventPages<TestEvent>) -> Vec<i64> {
        pages.iter().map(|e| e.version).collect()
    }

    #[tokio::test]
    async fn test_publish_and_read_back() {
        let log = InMemoryEventLog::new();
        assert_eq!(log.get_latest_version().await.unwrap(), -1);

        log.publish(vec![envelope(0, 1), envelope(1, 2)]).await.unwrap();
        log.publish(vec![envelope(2, 1)]).await.unwrap();

        let events = log.get_events(-1, 2).await.unwrap();
        assert_eq!(versions(&events), vec![0, 1, 2]);
        assert_eq!(log.get_latest_version().await.unwrap(), 2);

        let middle = log.get_events(0, 1).await.unwrap();
        assert_eq!(versions(&middle), vec![1]);
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let log = InMemoryEventLog::new();
        log.publish(vec![envelope(0, 1), envelope(1, 2)]).await.unwrap();

        assert!(log.get_events(1, 0).await.unwrap().is_empty());
        assert!(log.get_events(1, 1).await.unwrap().is_empty());
        // Reading past the end is clamped
        assert_eq!(log.get_events(-1, 50).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_dense_publish_conflicts_without_mutation() {
        let log = InMemoryEventLog::new();
        log.publish(vec![envelope(0, 1)]).await.unwrap();

        let duplicate = log.publish(vec![envelope(0, 9)]).await;
        assert!(matches!(
            duplicate,
            Err(EngineError::RetryConflict { attempted: 0, next: 1 })
        ));

        let gap = log.publish(vec![envelope(1, 2), envelope(3, 3)]).await;
        assert!(gap.unwrap_err().is_retry_conflict());

        assert_eq!(log.get_latest_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_racing_publishers_one_wins() {
        let log = InMemoryEventLog::<TestEvent>::shared();
        log.publish(vec![envelope(0, 1)]).await.unwrap();

        let mut handles = Vec::new();
        for id in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.publish(vec![envelope(1, id)]).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => successes += 1,
                Err(err) => assert!(err.is_retry_conflict()),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(log.get_latest_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_envelope_is_rejected() {
        let log = InMemoryEventLog::new();
        let transient = EventEnvelope::transient(
            0,
            None,
            TestEvent::Test { id: 1 },
            chrono::Utc::now(),
        );
        let result = log.publish(vec![transient]).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_replace_event_keeps_versions_dense() {
        for replacement_count in [0usize, 1, 3] {
            let log = InMemoryEventLog::new();
            log.publish((0..4).map(|v| envelope(v, v)).collect()).await.unwrap();

            let replacements = (0..replacement_count)
                .map(|offset| raw(1 + offset as i64, 100 + offset as i64))
                .collect();
            log.replace_event(1, replacements).await.unwrap();

            let latest = log.get_latest_version().await.unwrap();
            assert_eq!(latest, 3 + replacement_count as i64 - 1);

            let events = log.get_events(-1, latest).await.unwrap();
            let expected: Vec<i64> = (0..=latest).collect();
            assert_eq!(versions(&events), expected);

            // The event after the replaced one survives, shifted
            let last = events.iter().last().unwrap();
            assert_eq!(last.event, TestEvent::Test { id: 3 });
        }
    }

    #[tokio::test]
    async fn test_replace_event_validates_input() {
        let log = InMemoryEventLog::<TestEvent>::new();
        log.publish(vec![envelope(0, 1)]).await.unwrap();

        assert!(log.replace_event(3, Vec::new()).await.is_err());
        assert!(log.replace_event(0, vec![raw(5, 1)]).await.is_err());
    }

    #[tokio::test]
    async fn test_undecodable_raw_fails_on_read() {
        let log = InMemoryEventLog::<TestEvent>::new();
        log.publish(vec![envelope(0, 1)]).await.unwrap();

        let mut legacy = raw(0, 1);
        legacy.event = serde_json::json!({"type": "Legacy", "value": 1});
        log.replace_event(0, vec![legacy]).await.unwrap();

        assert_eq!(log.get_raw_events().await.unwrap()[0].event["type"], "Legacy");
        assert!(matches!(
            log.get_events(-1, 0).await,
            Err(EngineError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let log = InMemoryEventLog::new();
        let mut changes = log.subscribe();

        log.publish(vec![envelope(0, 1)]).await.unwrap();
        log.publish(vec![envelope(1, 1)]).await.unwrap();

        // Level-triggered: both publishes coalesce into the latest value
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 1);
    }
}
