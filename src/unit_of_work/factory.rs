//! Unit-of-work factory
//!
//! Runs an operation inside a fresh unit of work and commits it. Write
//! conflicts retry the whole operation against a new snapshot with jittered
//! exponential backoff; every other failure is returned as is.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, warn};

use super::{UnitOfWork, UnitOfWorkContext, UnitOfWorkStatus};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::types::{ActorId, DomainEvent};

/// Backoff applied to conflicting commits
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_times: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RetryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_times: config.retry_max_times,
            min_delay: config.retry_min_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

impl RetryConfig {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times)
            .with_jitter()
    }
}

/// Returns the unit of work to its pool however the attempt ends
struct Lease<E: DomainEvent>(UnitOfWork<E>);

impl<E: DomainEvent> Drop for Lease<E> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Creates units of work acting as one actor
pub struct UnitOfWorkFactory<E: DomainEvent> {
    ctx: Arc<UnitOfWorkContext<E>>,
    actor: Option<ActorId>,
    retry: RetryConfig,
}

impl<E: DomainEvent> Clone for UnitOfWorkFactory<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            actor: self.actor.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<E: DomainEvent> UnitOfWorkFactory<E> {
    pub fn new(
        ctx: Arc<UnitOfWorkContext<E>>,
        actor: Option<ActorId>,
        retry: RetryConfig,
    ) -> Self {
        Self { ctx, actor, retry }
    }

    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }

    pub fn context(&self) -> &Arc<UnitOfWorkContext<E>> {
        &self.ctx
    }

    /// Run `op` in a unit of work and commit what it buffered
    pub async fn commit<T, F, Fut>(&self, op: F) -> EngineResult<T>
    where
        F: Fn(UnitOfWork<E>) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.commit_at(None, op).await
    }

    /// Like [`commit`](Self::commit), with the first attempt's snapshot
    /// pinned to `version`
    ///
    /// Retries after a conflict take a fresh snapshot; a pinned snapshot
    /// would conflict again forever.
    pub async fn commit_at<T, F, Fut>(&self, version: Option<i64>, op: F) -> EngineResult<T>
    where
        F: Fn(UnitOfWork<E>) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let first = AtomicBool::new(true);
        let attempt = || {
            let prefill = if first.swap(false, Ordering::AcqRel) {
                version
            } else {
                None
            };
            self.attempt(prefill, &op)
        };

        attempt
            .retry(self.retry.backoff())
            .when(|e| e.is_retry_conflict())
            .notify(|err, dur| {
                warn!(
                    actor = ?self.actor,
                    error = %err,
                    delay = ?dur,
                    "retrying unit of work after conflict"
                );
            })
            .await
    }

    async fn attempt<T, F, Fut>(&self, prefill: Option<i64>, op: &F) -> EngineResult<T>
    where
        F: Fn(UnitOfWork<E>) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let lease = Lease(UnitOfWork::acquire(&self.ctx, self.actor.clone()));
        let uow = &lease.0;

        let result: EngineResult<T> = async {
            if let Some(version) = prefill {
                uow.prefill_version(version)?;
            }
            let value = op(uow.clone()).await?;
            uow.commit_internal().await?;
            Ok(value)
        }
        .await;

        if result.is_err() && uow.status() == UnitOfWorkStatus::Active {
            if let Err(e) = uow.discard() {
                debug!(actor = ?self.actor, error = %e, "discard after failed attempt");
            }
        }
        result
    }
}
