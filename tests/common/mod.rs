//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::time::Duration;

use chronicle::{
    AggregateRoot, AllowAll, DomainEvent, Engine, EngineBuilder, EngineConfig, EventEnvelope,
    EventListener, ReadModel,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BankEvent {
    TestEvent1 { id: i64 },
    Deposited { account: String, amount: i64 },
    Withdrawn { account: String, amount: i64 },
    Audited { account: String },
}

impl DomainEvent for BankEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BankEvent::TestEvent1 { .. } => "TestEvent1",
            BankEvent::Deposited { .. } => "Deposited",
            BankEvent::Withdrawn { .. } => "Withdrawn",
            BankEvent::Audited { .. } => "Audited",
        }
    }
}

pub fn test_event(id: i64) -> BankEvent {
    BankEvent::TestEvent1 { id }
}

pub fn deposited(account: &str, amount: i64) -> BankEvent {
    BankEvent::Deposited {
        account: account.to_string(),
        amount,
    }
}

pub fn withdrawn(account: &str, amount: i64) -> BankEvent {
    BankEvent::Withdrawn {
        account: account.to_string(),
        amount,
    }
}

/// Counts `TestEvent1` events with id 1
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OnesCounter {
    pub count: usize,
}

impl EventListener for OnesCounter {
    type Event = BankEvent;
    type Key = ();
    const NAME: &'static str = "OnesCounter";

    fn initial(_: &()) -> Self {
        Self::default()
    }

    fn when(&self, envelope: &EventEnvelope<BankEvent>) -> Self {
        match envelope.event {
            BankEvent::TestEvent1 { id: 1 } => Self {
                count: self.count + 1,
            },
            _ => self.clone(),
        }
    }
}

impl ReadModel for OnesCounter {}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub name: String,
    pub balance: i64,
    pub audits: usize,
}

impl EventListener for Account {
    type Event = BankEvent;
    type Key = String;
    const NAME: &'static str = "Account";

    fn initial(name: &String) -> Self {
        Self {
            name: name.clone(),
            balance: 0,
            audits: 0,
        }
    }

    fn when(&self, envelope: &EventEnvelope<BankEvent>) -> Self {
        let mut next = self.clone();
        match &envelope.event {
            BankEvent::Deposited { account, amount } if *account == self.name => {
                next.balance += amount;
            }
            BankEvent::Withdrawn { account, amount } if *account == self.name => {
                next.balance -= amount;
            }
            BankEvent::Audited { account } if *account == self.name => {
                next.audits += 1;
            }
            _ => {}
        }
        next
    }
}

impl AggregateRoot for Account {}
impl ReadModel for Account {}

/// Config with short retry delays so conflict tests stay fast
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_cache_size_per_item(4)
        .with_retry(10, Duration::from_millis(1), Duration::from_millis(10))
}

/// Route engine logs to the test output; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn builder(config: EngineConfig) -> EngineBuilder<BankEvent> {
    init_tracing();
    Engine::builder(config).policy(AllowAll)
}

pub fn engine() -> Engine<BankEvent> {
    builder(fast_config()).build().unwrap()
}

/// Commit each event in its own unit of work
pub async fn commit_all(engine: &Engine<BankEvent>, actor: &str, events: Vec<BankEvent>) {
    let factory = engine.factory(actor);
    for event in events {
        factory
            .commit(|uow| {
                let event = event.clone();
                async move {
                    uow.publish(event).await?;
                    Ok(())
                }
            })
            .await
            .unwrap();
    }
}
