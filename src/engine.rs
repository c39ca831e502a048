//! Engine wiring
//!
//! [`EngineBuilder`] assembles the log pipeline, the replay pipeline and
//! the unit-of-work context from an [`EngineConfig`] plus the application's
//! policies, validators, upcasters and side effects.
//!
//! ```text
//! leaf (memory | jsonl) ◄── InMemoryEventCache ◄── TransientEventOverlay ◄── units of work
//! ListenerReplayer      ◄── ListenerCache       ◄── units of work
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::event_store::{
    wait_for_version, InMemoryEventCache, InMemoryEventLog, JsonlEventLog, LogPipeline, SharedLog,
    TransientEventOverlay,
};
use crate::listener::{ListenerCache, ListenerCacheStats, ListenerReplayer, SharedReplay};
use crate::policy::{Policy, PolicySet};
use crate::side_effects::{SideEffect, SideEffectDispatcher, SideEffectRegistry};
use crate::types::{ActorId, DomainEvent};
use crate::unit_of_work::{RetryConfig, UnitOfWorkContext, UnitOfWorkFactory};
use crate::upcast::{sort_by_dependencies, UpcastReport, UpcastRunner, Upcaster};
use crate::validation::{AggregateValidator, EventValidator, ValidatorRegistry};

/// Collects everything an [`Engine`] is built from
pub struct EngineBuilder<E: DomainEvent> {
    config: EngineConfig,
    leaf: Option<SharedLog<E>>,
    policies: PolicySet<E>,
    validators: ValidatorRegistry<E>,
    upcasters: Vec<Arc<dyn Upcaster>>,
    side_effects: SideEffectRegistry<E>,
}

impl<E: DomainEvent> EngineBuilder<E> {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            leaf: None,
            policies: PolicySet::new(),
            validators: ValidatorRegistry::new(),
            upcasters: Vec::new(),
            side_effects: SideEffectRegistry::new(),
        }
    }

    /// Use `leaf` as the bottom of the log pipeline (in-memory by default)
    pub fn with_leaf(mut self, leaf: SharedLog<E>) -> Self {
        self.leaf = Some(leaf);
        self
    }

    /// Persist to `events.jsonl` under the configured data directory
    pub fn durable(self) -> EngineResult<Self> {
        let leaf = Arc::new(JsonlEventLog::<E>::open(&self.config)?);
        Ok(self.with_leaf(leaf))
    }

    pub fn policy(mut self, policy: impl Policy<E> + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn event_validator(mut self, validator: impl EventValidator<E> + 'static) -> Self {
        self.validators.register_event(Arc::new(validator));
        self
    }

    pub fn aggregate_validator(mut self, validator: impl AggregateValidator<E> + 'static) -> Self {
        self.validators.register_aggregate(Arc::new(validator));
        self
    }

    pub fn upcaster(mut self, upcaster: impl Upcaster + 'static) -> Self {
        self.upcasters.push(Arc::new(upcaster));
        self
    }

    pub fn side_effect(mut self, handler: impl SideEffect<E> + 'static) -> Self {
        self.side_effects.register(Arc::new(handler));
        self
    }

    /// Wire the pipelines
    ///
    /// Fails if the upcasters cannot be put in dependency order.
    pub fn build(self) -> EngineResult<Engine<E>> {
        let upcasters = sort_by_dependencies(self.upcasters)?;
        let config = self.config;

        let leaf: SharedLog<E> = match self.leaf {
            Some(leaf) => leaf,
            None => InMemoryEventLog::<E>::shared(),
        };
        let cache_size = config.cache_size_per_item;
        let (max_items, sweep) = (config.transient_max_items, config.transient_sweep_interval);
        let log = LogPipeline::new(leaf)
            .layer(|next| InMemoryEventCache::shared(next, cache_size))
            .layer(|next| TransientEventOverlay::shared(next, max_items, sweep))
            .build();

        let listener_cache = Arc::new(ListenerCache::new(ListenerReplayer::shared(log.clone())));
        let replay: SharedReplay<E> = listener_cache.clone();

        let ctx = UnitOfWorkContext::new(
            log.clone(),
            replay,
            self.policies,
            self.validators,
            config.transient_default_ttl,
        );

        info!(
            upcasters = upcasters.len(),
            cache_size_per_item = cache_size,
            transient_max_items = max_items,
            "engine built"
        );

        Ok(Engine {
            retry: RetryConfig::from(&config),
            system_actor: ActorId::new(config.system_actor.clone()),
            config,
            log,
            listener_cache,
            ctx,
            upcasters,
            side_effects: Arc::new(self.side_effects),
        })
    }
}

/// A wired event-sourcing engine
pub struct Engine<E: DomainEvent> {
    config: EngineConfig,
    log: SharedLog<E>,
    listener_cache: Arc<ListenerCache<E>>,
    ctx: Arc<UnitOfWorkContext<E>>,
    upcasters: Vec<Arc<dyn Upcaster>>,
    side_effects: Arc<SideEffectRegistry<E>>,
    retry: RetryConfig,
    system_actor: ActorId,
}

impl<E: DomainEvent> Engine<E> {
    pub fn builder(config: EngineConfig) -> EngineBuilder<E> {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The outermost log stage
    pub fn log(&self) -> &SharedLog<E> {
        &self.log
    }

    pub fn context(&self) -> &Arc<UnitOfWorkContext<E>> {
        &self.ctx
    }

    pub fn listener_cache_stats(&self) -> ListenerCacheStats {
        self.listener_cache.stats()
    }

    /// A factory whose units of work act as `actor`
    pub fn factory(&self, actor: impl Into<ActorId>) -> UnitOfWorkFactory<E> {
        UnitOfWorkFactory::new(self.ctx.clone(), Some(actor.into()), self.retry.clone())
    }

    /// A factory acting as the configured system actor
    pub fn system_factory(&self) -> UnitOfWorkFactory<E> {
        self.factory(self.system_actor.clone())
    }

    /// Rewrite the persisted log with the registered upcasters
    ///
    /// Cached listener state was derived from the old events and is
    /// dropped afterwards.
    pub async fn run_upcasters(&self) -> EngineResult<UpcastReport> {
        let runner = UpcastRunner::new(self.log.clone(), self.upcasters.clone())?;
        let report = runner.run().await?;
        self.listener_cache.clean();

        info!(
            events_before = report.events_before,
            events_after = report.events_after,
            replacements = report.replacements,
            "upcast run complete"
        );
        Ok(report)
    }

    /// A dispatcher for the registered side effects, starting from the current log
    pub async fn dispatcher(&self) -> EngineResult<SideEffectDispatcher<E>> {
        SideEffectDispatcher::new(
            self.ctx.clone(),
            self.side_effects.clone(),
            self.retry.clone(),
            self.system_actor.clone(),
        )
        .await
    }

    /// Dispatch side effects in the background until `shutdown` turns true
    pub async fn start_dispatcher(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> EngineResult<JoinHandle<()>> {
        let dispatcher = Arc::new(self.dispatcher().await?);
        Ok(dispatcher.start(shutdown))
    }

    /// Wait until the log reaches `version` or `cancel` completes
    pub async fn wait_for_version<C>(&self, version: i64, cancel: C) -> EngineResult<i64>
    where
        C: Future<Output = ()>,
    {
        wait_for_version(self.log.as_ref(), version, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::event_store::EventLog;
    use crate::policy::AllowAll;
    use crate::testing::{envelope, CountOnes, TestEvent};
    use crate::upcast::SortError;
    use std::time::Duration;

    struct Needs(&'static str);

    impl Upcaster for Needs {
        fn name(&self) -> &'static str {
            "needs"
        }

        fn dependencies(&self) -> &[&'static str] {
            std::slice::from_ref(&self.0)
        }

        fn upcast(
            &self,
            _raw: &crate::types::RawEventEnvelope,
        ) -> Option<Vec<crate::types::RawEventEnvelope>> {
            None
        }
    }

    #[tokio::test]
    async fn test_build_wires_pipelines() {
        let engine = Engine::<TestEvent>::builder(EngineConfig::default())
            .policy(AllowAll)
            .build()
            .unwrap();

        let factory = engine.factory("alice");
        factory
            .commit(|uow| async move {
                uow.publish(TestEvent::Test { id: 1 }).await?;
                Ok(())
            })
            .await
            .unwrap();

        let count = engine
            .system_factory()
            .commit(|uow| async move {
                let model = uow.get_root_read_model::<CountOnes>(None).await?;
                Ok(model.count)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);

        let events = engine.log().get_events(-1, 0).await.unwrap().into_vec();
        assert_eq!(events[0].by, Some(ActorId::new("alice")));
        assert!(engine.listener_cache_stats().misses > 0);
    }

    #[test]
    fn test_unsortable_upcasters_fail_build() {
        let result = Engine::<TestEvent>::builder(EngineConfig::default())
            .upcaster(Needs("missing"))
            .build();
        assert!(matches!(
            result.err(),
            Some(EngineError::Sort(SortError::MissingDependency { .. }))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_version_through_engine() {
        let engine = Engine::<TestEvent>::builder(EngineConfig::default())
            .build()
            .unwrap();
        engine.log().publish(vec![envelope(0, 1)]).await.unwrap();

        let latest = engine
            .wait_for_version(0, tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(latest, 0);
    }
}
