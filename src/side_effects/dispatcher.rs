//! Side-effect dispatcher
//!
//! Watches the outermost log stage for new persisted and transient events
//! and hands each one to the handlers registered for its type.
//!
//! # Watermarks
//!
//! Persisted and transient events are tracked separately. A cycle re-reads
//! the latest versions rather than counting signals, so a signal that
//! arrives mid-cycle is picked up by the next one.
//!
//! # Ordering
//!
//! A batch is split into runs of consecutive events from the same actor.
//! Each run is handled through a factory acting as that actor (or the
//! system actor for unattributed events), preserving per-actor order.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::SideEffectRegistry;
use crate::error::EngineResult;
use crate::types::{ActorId, DomainEvent, EventEnvelope};
use crate::unit_of_work::{RetryConfig, UnitOfWorkContext, UnitOfWorkFactory};

/// Counters for one dispatch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events picked up by the cycle
    pub events: usize,
    /// Handler invocations that ran to completion or failed
    pub invocations: usize,
    pub failures: usize,
    /// Follow-up events committed
    pub published: usize,
}

#[derive(Debug)]
struct Watermarks {
    persisted: i64,
    transient: i64,
}

pub struct SideEffectDispatcher<E: DomainEvent> {
    ctx: Arc<UnitOfWorkContext<E>>,
    registry: Arc<SideEffectRegistry<E>>,
    retry: RetryConfig,
    system_actor: ActorId,
    /// Held for a whole cycle
    watermarks: Mutex<Watermarks>,
}

impl<E: DomainEvent> SideEffectDispatcher<E> {
    /// Create a dispatcher that reacts to events published from now on
    pub async fn new(
        ctx: Arc<UnitOfWorkContext<E>>,
        registry: Arc<SideEffectRegistry<E>>,
        retry: RetryConfig,
        system_actor: ActorId,
    ) -> EngineResult<Self> {
        let persisted = ctx.log().get_latest_version().await?;
        let transient = ctx
            .log()
            .subscribe_transient()
            .map_or(-1, |changes| *changes.borrow());

        Ok(Self {
            ctx,
            registry,
            retry,
            system_actor,
            watermarks: Mutex::new(Watermarks {
                persisted,
                transient,
            }),
        })
    }

    /// Latest persisted and transient versions already dispatched
    pub async fn watermarks(&self) -> (i64, i64) {
        let marks = self.watermarks.lock().await;
        (marks.persisted, marks.transient)
    }

    /// Run one dispatch cycle over everything published since the last one
    ///
    /// Handler failures are logged and counted, never returned. Errors come
    /// only from reading the log.
    pub async fn dispatch_pending(&self) -> EngineResult<DispatchStats> {
        let mut marks = self.watermarks.lock().await;
        let log = self.ctx.log();
        let mut stats = DispatchStats::default();

        let latest = log.get_latest_version().await?;
        if latest > marks.persisted {
            let events = log.get_events(marks.persisted, latest).await?.into_vec();
            marks.persisted = latest;
            self.dispatch_batch(&events, &mut stats).await;
        }

        let transients: Vec<EventEnvelope<E>> = log
            .get_current_transient_events()
            .await?
            .into_iter()
            .filter(|e| e.version > marks.transient)
            .collect();
        if let Some(last) = transients.last() {
            marks.transient = last.version;
            self.dispatch_batch(&transients, &mut stats).await;
        }

        if stats.events > 0 {
            debug!(
                events = stats.events,
                invocations = stats.invocations,
                failures = stats.failures,
                published = stats.published,
                "dispatch cycle complete"
            );
        }
        Ok(stats)
    }

    async fn dispatch_batch(&self, events: &[EventEnvelope<E>], stats: &mut DispatchStats) {
        stats.events += events.len();

        for run in events.chunk_by(|a, b| a.by == b.by) {
            let actor = run[0]
                .by
                .clone()
                .unwrap_or_else(|| self.system_actor.clone());
            let factory = UnitOfWorkFactory::new(self.ctx.clone(), Some(actor), self.retry.clone());

            for envelope in run {
                self.dispatch_one(&factory, envelope, stats).await;
            }
        }
    }

    async fn dispatch_one(
        &self,
        factory: &UnitOfWorkFactory<E>,
        envelope: &EventEnvelope<E>,
        stats: &mut DispatchStats,
    ) {
        // Transients have no version of their own in the persisted space
        let pin = (!envelope.is_transient()).then_some(envelope.version);

        for handler in self.registry.handlers_for(envelope.event_type()) {
            stats.invocations += 1;

            let result = factory
                .commit_at(pin, |uow| async move {
                    let follow_ups = handler.handle(&uow, envelope).await?;
                    let count = follow_ups.len();
                    for event in follow_ups {
                        uow.publish(event).await?;
                    }
                    Ok(count)
                })
                .await;

            match result {
                Ok(published) => stats.published += published,
                Err(e) => {
                    stats.failures += 1;
                    error!(
                        handler = handler.name(),
                        event_type = envelope.event_type(),
                        version = envelope.version,
                        transient = envelope.is_transient(),
                        error = %e,
                        "side effect failed"
                    );
                }
            }
        }
    }

    /// Dispatch in the background until `shutdown` turns true or is dropped
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let log = self.ctx.log().clone();
            let mut persisted = log.subscribe();
            let mut transient = log.subscribe_transient();
            info!("side-effect dispatcher started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.dispatch_pending().await {
                    error!(error = %e, "dispatch cycle failed");
                }

                tokio::select! {
                    changed = persisted.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    Some(()) = transient_changed(&mut transient) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            info!("side-effect dispatcher stopped");
        })
    }
}

async fn transient_changed(changes: &mut Option<watch::Receiver<i64>>) -> Option<()> {
    match changes {
        Some(changes) => changes.changed().await.ok(),
        None => std::future::pending().await,
    }
}
