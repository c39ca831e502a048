//! Applies sorted upcasters to the whole persisted log
//!
//! Each upcaster gets one full pass over the working list produced by the
//! previous pass. A replaced event is rewritten in the log immediately, at
//! its current working position, so the log stays densely numbered after
//! every single replacement.
//!
//! Against the JSONL leaf each replacement is a full file rewrite, so a run
//! that changes `k` of `n` events writes the file `k` times. Runs are meant
//! for offline migrations, not the hot path.
//!
//! Writers must be quiet while a run is in progress.

use std::sync::Arc;

use tracing::{debug, info};

use super::{sort_by_dependencies, SortError, Upcaster};
use crate::error::EngineResult;
use crate::event_store::SharedLog;
use crate::types::{DomainEvent, RawEventEnvelope};

/// Outcome of one upcaster's pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcastPass {
    pub upcaster: &'static str,
    /// Events the upcaster replaced, split or deleted
    pub changed: usize,
}

/// Result of an upcast run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpcastReport {
    pub events_before: usize,
    pub events_after: usize,
    /// `replace_event` calls made against the log
    pub replacements: usize,
    pub passes: Vec<UpcastPass>,
}

pub struct UpcastRunner<E: DomainEvent> {
    log: SharedLog<E>,
    upcasters: Vec<Arc<dyn Upcaster>>,
}

impl<E: DomainEvent> UpcastRunner<E> {
    /// Create a runner; fails if the upcasters cannot be ordered
    pub fn new(log: SharedLog<E>, upcasters: Vec<Arc<dyn Upcaster>>) -> Result<Self, SortError> {
        let upcasters = sort_by_dependencies(upcasters)?;
        Ok(Self { log, upcasters })
    }

    /// Upcaster names in the order they run
    pub fn order(&self) -> Vec<&'static str> {
        self.upcasters.iter().map(|u| u.name()).collect()
    }

    /// Run every upcaster over the log
    pub async fn run(&self) -> EngineResult<UpcastReport> {
        let mut working = self.log.get_raw_events().await?;
        let mut report = UpcastReport {
            events_before: working.len(),
            ..UpcastReport::default()
        };

        for upcaster in &self.upcasters {
            let (next, changed) = self.pass(upcaster.as_ref(), working).await?;
            info!(
                upcaster = upcaster.name(),
                changed,
                events = next.len(),
                "upcast pass complete"
            );
            report.replacements += changed;
            report.passes.push(UpcastPass {
                upcaster: upcaster.name(),
                changed,
            });
            working = next;
        }

        report.events_after = working.len();
        Ok(report)
    }

    async fn pass(
        &self,
        upcaster: &dyn Upcaster,
        working: Vec<RawEventEnvelope>,
    ) -> EngineResult<(Vec<RawEventEnvelope>, usize)> {
        let mut next = Vec::with_capacity(working.len());
        let mut changed = 0;

        for mut raw in working {
            // Earlier replacements in this pass may have shifted the event
            let position = next.len() as i64;

            let Some(replacements) = upcaster.upcast(&raw) else {
                raw.version = position;
                next.push(raw);
                continue;
            };

            let replacements: Vec<RawEventEnvelope> = replacements
                .into_iter()
                .enumerate()
                .map(|(offset, mut replacement)| {
                    replacement.version = position + offset as i64;
                    replacement
                })
                .collect();

            debug!(
                upcaster = upcaster.name(),
                version = position,
                replaced_by = replacements.len(),
                "replacing event"
            );
            self.log.replace_event(position, replacements.clone()).await?;
            next.extend(replacements);
            changed += 1;
        }

        Ok((next, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventLog, InMemoryEventLog};
    use crate::testing::{envelope, TestEvent};
    use serde_json::json;

    /// Splits every `Test` event into three copies
    struct Triplicate;

    impl Upcaster for Triplicate {
        fn name(&self) -> &'static str {
            "triplicate"
        }

        fn upcast(&self, raw: &RawEventEnvelope) -> Option<Vec<RawEventEnvelope>> {
            (raw.event["type"] == "Test").then(|| vec![raw.clone(), raw.clone(), raw.clone()])
        }
    }

    /// Deletes `Test` events with id 0
    struct DropZeros;

    impl Upcaster for DropZeros {
        fn name(&self) -> &'static str {
            "drop-zeros"
        }

        fn upcast(&self, raw: &RawEventEnvelope) -> Option<Vec<RawEventEnvelope>> {
            (raw.event["id"] == 0).then(Vec::new)
        }
    }

    /// Multiplies ids by ten; must see the log without zeros
    struct ScaleIds;

    impl Upcaster for ScaleIds {
        fn name(&self) -> &'static str {
            "scale-ids"
        }

        fn dependencies(&self) -> &[&'static str] {
            &["drop-zeros"]
        }

        fn upcast(&self, raw: &RawEventEnvelope) -> Option<Vec<RawEventEnvelope>> {
            let id = raw.event["id"].as_i64()?;
            Some(vec![raw.with_event(0, json!({ "type": "Test", "id": id * 10 }))])
        }
    }

    async fn seeded(ids: &[i64]) -> SharedLog<TestEvent> {
        let log: SharedLog<TestEvent> = InMemoryEventLog::<TestEvent>::shared();
        let batch = ids
            .iter()
            .enumerate()
            .map(|(v, id)| envelope(v as i64, *id))
            .collect();
        log.publish(batch).await.unwrap();
        log
    }

    async fn ids(log: &SharedLog<TestEvent>) -> Vec<(i64, i64)> {
        log.get_events(-1, i64::MAX)
            .await
            .unwrap()
            .iter()
            .map(|e| match e.event {
                TestEvent::Test { id } => (e.version, id),
                _ => (e.version, -1),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_split_keeps_order_and_density() {
        let log = seeded(&[1, 2, 3, 4]).await;
        let upcasters: Vec<Arc<dyn Upcaster>> = vec![Arc::new(Triplicate)];
        let runner = UpcastRunner::new(log.clone(), upcasters).unwrap();

        let report = runner.run().await.unwrap();

        assert_eq!(report.events_before, 4);
        assert_eq!(report.events_after, 12);
        assert_eq!(report.replacements, 4);
        assert_eq!(log.get_latest_version().await.unwrap(), 11);

        let expected: Vec<(i64, i64)> = (0..12).map(|v| (v, v / 3 + 1)).collect();
        assert_eq!(ids(&log).await, expected);
    }

    #[tokio::test]
    async fn test_passes_run_in_dependency_order() {
        let log = seeded(&[0, 1, 0, 2]).await;
        let runner = UpcastRunner::new(
            log.clone(),
            vec![Arc::new(ScaleIds) as Arc<dyn Upcaster>, Arc::new(DropZeros)],
        )
        .unwrap();
        assert_eq!(runner.order(), vec!["drop-zeros", "scale-ids"]);

        let report = runner.run().await.unwrap();

        assert_eq!(ids(&log).await, vec![(0, 10), (1, 20)]);
        assert_eq!(
            report.passes,
            vec![
                UpcastPass {
                    upcaster: "drop-zeros",
                    changed: 2
                },
                UpcastPass {
                    upcaster: "scale-ids",
                    changed: 2
                },
            ]
        );
        assert_eq!(report.events_after, 2);
    }

    #[tokio::test]
    async fn test_untouched_log() {
        let log = seeded(&[5, 6]).await;
        let upcasters: Vec<Arc<dyn Upcaster>> = vec![Arc::new(DropZeros)];
        let runner = UpcastRunner::new(log.clone(), upcasters).unwrap();

        let report = runner.run().await.unwrap();

        assert_eq!(report.replacements, 0);
        assert_eq!(ids(&log).await, vec![(0, 5), (1, 6)]);
    }

    #[test]
    fn test_unsortable_upcasters_fail_construction() {
        let log: SharedLog<TestEvent> = InMemoryEventLog::<TestEvent>::shared();
        let result = UpcastRunner::new(log, vec![Arc::new(ScaleIds) as Arc<dyn Upcaster>]);
        assert!(matches!(result, Err(SortError::MissingDependency { .. })));
    }
}
