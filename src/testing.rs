//! Fixtures shared by unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::EngineResult;
use crate::event_store::{EventLog, SharedLog};
use crate::listener::{AggregateRoot, EventListener, ReadModel};
use crate::types::{DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestEvent {
    Test { id: i64 },
    Deposited { account: String, amount: i64 },
    Withdrawn { account: String, amount: i64 },
}

impl DomainEvent for TestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TestEvent::Test { .. } => "Test",
            TestEvent::Deposited { .. } => "Deposited",
            TestEvent::Withdrawn { .. } => "Withdrawn",
        }
    }
}

pub fn envelope(version: i64, id: i64) -> EventEnvelope<TestEvent> {
    EventEnvelope::new(version, None, TestEvent::Test { id })
}

pub fn transient(version: i64, id: i64, ttl: Duration) -> EventEnvelope<TestEvent> {
    let ttl = chrono::Duration::from_std(ttl).unwrap();
    EventEnvelope::transient(version, None, TestEvent::Test { id }, Utc::now() + ttl)
}

pub fn raw(version: i64, id: i64) -> RawEventEnvelope {
    RawEventEnvelope {
        version,
        at: Utc::now(),
        by: None,
        event: serde_json::json!({ "type": "Test", "id": id }),
    }
}

/// Counts `Test` events with id 1
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CountOnes {
    pub count: usize,
}

impl EventListener for CountOnes {
    type Event = TestEvent;
    type Key = ();
    const NAME: &'static str = "CountOnes";

    fn initial(_: &()) -> Self {
        Self::default()
    }

    fn when(&self, envelope: &EventEnvelope<TestEvent>) -> Self {
        match envelope.event {
            TestEvent::Test { id: 1 } => Self {
                count: self.count + 1,
            },
            _ => self.clone(),
        }
    }
}

impl ReadModel for CountOnes {}

/// Counts `Test` events whose id equals the key
#[derive(Debug, Clone, PartialEq)]
pub struct CountById {
    pub id: i64,
    pub count: usize,
}

impl EventListener for CountById {
    type Event = TestEvent;
    type Key = i64;
    const NAME: &'static str = "CountById";

    fn initial(id: &i64) -> Self {
        Self { id: *id, count: 0 }
    }

    fn when(&self, envelope: &EventEnvelope<TestEvent>) -> Self {
        match envelope.event {
            TestEvent::Test { id } if id == self.id => Self {
                id: self.id,
                count: self.count + 1,
            },
            _ => self.clone(),
        }
    }
}

impl ReadModel for CountById {}

/// Account balance keyed by account name
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub account: String,
    pub amount: i64,
}

impl EventListener for Balance {
    type Event = TestEvent;
    type Key = String;
    const NAME: &'static str = "Balance";

    fn initial(account: &String) -> Self {
        Self {
            account: account.clone(),
            amount: 0,
        }
    }

    fn when(&self, envelope: &EventEnvelope<TestEvent>) -> Self {
        match &envelope.event {
            TestEvent::Deposited { account, amount } if *account == self.account => Self {
                account: self.account.clone(),
                amount: self.amount + amount,
            },
            TestEvent::Withdrawn { account, amount } if *account == self.account => Self {
                account: self.account.clone(),
                amount: self.amount - amount,
            },
            _ => self.clone(),
        }
    }
}

impl AggregateRoot for Balance {}
impl ReadModel for Balance {}

pub fn deposited(account: &str, amount: i64) -> TestEvent {
    TestEvent::Deposited {
        account: account.to_string(),
        amount,
    }
}

pub fn withdrawn(account: &str, amount: i64) -> TestEvent {
    TestEvent::Withdrawn {
        account: account.to_string(),
        amount,
    }
}

/// A stage that delays and counts range reads
pub struct SlowLog {
    inner: SharedLog<TestEvent>,
    range_reads: AtomicUsize,
}

impl SlowLog {
    pub fn shared(inner: SharedLog<TestEvent>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            range_reads: AtomicUsize::new(0),
        })
    }

    pub fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventLog<TestEvent> for SlowLog {
    async fn publish(&self, envelopes: Vec<EventEnvelope<TestEvent>>) -> EngineResult<()> {
        self.inner.publish(envelopes).await
    }

    async fn get_events(
        &self,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> EngineResult<EventPages<TestEvent>> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.get_events(from_exclusive, to_inclusive).await
    }

    async fn get_raw_events(&self) -> EngineResult<Vec<RawEventEnvelope>> {
        self.inner.get_raw_events().await
    }

    async fn replace_event(
        &self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()> {
        self.inner.replace_event(at_version, replacements).await
    }

    async fn get_latest_version(&self) -> EngineResult<i64> {
        self.inner.get_latest_version().await
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.inner.subscribe()
    }
}
