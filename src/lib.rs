//! Chronicle
//!
//! An event-sourcing engine: an append-only, versioned event log with
//! cached replay of read models and aggregates, units of work with
//! optimistic concurrency, schema upcasting and reactive side effects.
//!
//! # Features
//!
//! - **Log pipeline**: paged event cache and transient-event overlay over an
//!   in-memory or JSONL leaf
//! - **Replay**: listeners folded from the log, cached per key
//! - **Units of work**: snapshot reads, buffered writes, policies,
//!   validators, automatic retry on write conflicts
//! - **Upcasting**: dependency-ordered rewrites of the historical log
//! - **Side effects**: handlers that react to new events with follow-ups
//!
//! # Modules
//!
//! - `types`: Envelopes, actors and paged event sequences
//! - `event_store`: The `EventLog` contract, its leaves and decorators
//! - `listener`: Listener traits, replay and the listener cache
//! - `unit_of_work`: Units of work, their pool and factory
//! - `policy`: Authorization of publishes and reads
//! - `validation`: Event and aggregate validators
//! - `upcast`: Upcasters, their ordering and the upcast runner
//! - `side_effects`: Side-effect handlers and their dispatcher
//! - `engine`: Wiring of all of the above
//! - `config`: Engine configuration
//! - `utils`: Atomic file rewrites
//!
//! # Example
//!
//! ```no_run
//! use chronicle::{AllowAll, Engine, EngineConfig, EngineResult};
//! # use chronicle::DomainEvent;
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Debug, Clone, Serialize, Deserialize)]
//! # enum BankEvent { Opened }
//! # impl DomainEvent for BankEvent {
//! #     fn event_type(&self) -> &'static str { "Opened" }
//! # }
//!
//! # async fn run() -> EngineResult<()> {
//! let engine = Engine::<BankEvent>::builder(EngineConfig::from_env())
//!     .policy(AllowAll)
//!     .durable()?
//!     .build()?;
//!
//! engine
//!     .factory("alice")
//!     .commit(|uow| async move {
//!         uow.publish(BankEvent::Opened).await?;
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod listener;
pub mod policy;
pub mod side_effects;
pub mod types;
pub mod unit_of_work;
pub mod upcast;
pub mod utils;
pub mod validation;

#[cfg(test)]
mod testing;

// Re-export commonly used items at crate root
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use event_store::{EventLog, LogPipeline, SharedLog};
pub use listener::{
    AggregateRoot, EventListener, ListenerState, ListenerTags, ReadModel, TransientScope,
};
pub use policy::{AllowAll, AuthContext, Policy, PolicySet, ReadModelRef};
pub use side_effects::{SideEffect, SideEffectDispatcher, SideEffectRegistry};
pub use types::{ActorId, DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};
pub use unit_of_work::{Aggregate, UnitOfWork, UnitOfWorkFactory, UnitOfWorkStatus};
pub use upcast::{SortError, UpcastReport, Upcaster};
pub use validation::{AggregateRule, EventRule, ValidationError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
