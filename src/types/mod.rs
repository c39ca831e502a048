//! Data types shared across the engine
//!
//! Envelopes, actor identities and paged event sequences.

mod event;
mod pages;

pub use event::{ActorId, DomainEvent, EventEnvelope, RawEventEnvelope};
pub use pages::EventPages;
