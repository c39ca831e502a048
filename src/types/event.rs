//! Event types for Event Sourcing
//!
//! This module defines the envelopes that carry domain events through the
//! log. Events are immutable facts; the envelope adds ordering and
//! attribution metadata assigned at publish time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// A domain event type
///
/// Implemented by the application's event enum. `event_type` names the
/// concrete variant and is the key used by validator and side-effect
/// registries.
pub trait DomainEvent:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Stable name of the concrete event variant
    fn event_type(&self) -> &'static str;
}

/// Identity of whoever caused an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An event plus its log metadata
///
/// `version` is dense, zero-based and assigned at publish time. An
/// envelope with `expires_at` set is transient: it is never persisted and
/// its version belongs to the transient counter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    pub version: i64,

    pub at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<ActorId>,

    /// Expiry of a transient envelope; `None` for persisted ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub event: E,
}

impl<E: DomainEvent> EventEnvelope<E> {
    /// Create a persisted envelope stamped with the current time
    pub fn new(version: i64, by: Option<ActorId>, event: E) -> Self {
        Self {
            version,
            at: Utc::now(),
            by,
            expires_at: None,
            event,
        }
    }

    /// Create a transient envelope that expires at `expires_at`
    pub fn transient(
        version: i64,
        by: Option<ActorId>,
        event: E,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version,
            at: Utc::now(),
            by,
            expires_at: Some(expires_at),
            event,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.expires_at.is_some()
    }

    /// Whether a transient envelope has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Convert to the untyped form used by migration tooling
    pub fn to_raw(&self) -> EngineResult<RawEventEnvelope> {
        Ok(RawEventEnvelope {
            version: self.version,
            at: self.at,
            by: self.by.clone(),
            event: serde_json::to_value(&self.event)?,
        })
    }

    /// Decode a raw envelope against the current event schema
    pub fn from_raw(raw: &RawEventEnvelope) -> EngineResult<Self> {
        Ok(Self {
            version: raw.version,
            at: raw.at,
            by: raw.by.clone(),
            expires_at: None,
            event: serde_json::from_value(raw.event.clone())?,
        })
    }
}

/// An envelope whose event is an untyped JSON document
///
/// Upcasters work on this form so that they never depend on the current
/// event schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventEnvelope {
    pub version: i64,

    pub at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<ActorId>,

    pub event: serde_json::Value,
}

impl RawEventEnvelope {
    /// Copy this envelope's metadata onto a new document
    pub fn with_event(&self, version: i64, event: serde_json::Value) -> Self {
        Self {
            version,
            at: self.at,
            by: self.by.clone(),
            event,
        }
    }

    /// Serialize to a JSON line (for the durable log)
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON line
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}
