//! Event Sourcing Integration Tests
//!
//! Tests for the complete flow through the engine:
//! - Read models materialized at pinned versions
//! - Durable logs surviving a restart
//! - Upcasting the historical log in place
//! - Aggregate validation aborting a commit

mod common;

use chronicle::upcast::UpcastPass;
use chronicle::{
    AggregateRule, EngineError, EventLog, RawEventEnvelope, UnitOfWorkStatus, Upcaster,
};
use common::{
    builder, commit_all, deposited, engine, fast_config, test_event, withdrawn, Account,
    BankEvent, OnesCounter,
};

/// Splits every `TestEvent1` into three copies
struct Triplicate;

impl Upcaster for Triplicate {
    fn name(&self) -> &'static str {
        "triplicate"
    }

    fn upcast(&self, raw: &RawEventEnvelope) -> Option<Vec<RawEventEnvelope>> {
        (raw.event["type"] == "TestEvent1").then(|| vec![raw.clone(); 3])
    }
}

#[tokio::test]
async fn test_read_model_at_pinned_versions() {
    let engine = engine();
    commit_all(&engine, "alice", vec![test_event(1), test_event(2), test_event(1)]).await;

    let counts = engine
        .system_factory()
        .commit(|uow| async move {
            let latest = uow.get_root_read_model::<OnesCounter>(None).await?;
            let at_two = uow.get_root_read_model::<OnesCounter>(Some(2)).await?;
            let at_one = uow.get_root_read_model::<OnesCounter>(Some(1)).await?;
            Ok((latest.count, at_two.count, at_one.count))
        })
        .await
        .unwrap();

    assert_eq!(counts, (2, 2, 1));
}

#[tokio::test]
async fn test_log_is_dense_and_ordered() {
    let engine = engine();
    let events: Vec<BankEvent> = (0..10).map(test_event).collect();
    commit_all(&engine, "alice", events.clone()).await;

    let stored = engine.log().get_events(-1, 9).await.unwrap().into_vec();
    let versions: Vec<i64> = stored.iter().map(|e| e.version).collect();
    let payloads: Vec<BankEvent> = stored.into_iter().map(|e| e.event).collect();

    assert_eq!(versions, (0..10).collect::<Vec<i64>>());
    assert_eq!(payloads, events);
}

#[tokio::test]
async fn test_durable_log_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config().with_data_dir(dir.path());

    {
        let engine = builder(config.clone()).durable().unwrap().build().unwrap();
        commit_all(
            &engine,
            "alice",
            vec![deposited("acc", 50), withdrawn("acc", 20), deposited("acc", 5)],
        )
        .await;
    }

    let engine = builder(config.clone()).durable().unwrap().build().unwrap();
    assert_eq!(engine.log().get_latest_version().await.unwrap(), 2);

    let balance = engine
        .factory("bob")
        .commit(|uow| async move {
            let account = uow.get_read_model::<Account>("acc".to_string(), None).await?;
            Ok(account.balance)
        })
        .await
        .unwrap();
    assert_eq!(balance, 35);

    let first = engine.log().get_events(-1, 0).await.unwrap().into_vec();
    assert_eq!(first[0].by.as_ref().map(|a| a.as_str()), Some("alice"));
    assert!(config.events_path().exists());
}

#[tokio::test]
async fn test_upcaster_splits_history() {
    let engine = builder(fast_config()).upcaster(Triplicate).build().unwrap();
    commit_all(
        &engine,
        "alice",
        vec![test_event(0), test_event(1), test_event(2), test_event(3)],
    )
    .await;

    let count_ones = || async {
        engine
            .system_factory()
            .commit(|uow| async move {
                let model = uow.get_root_read_model::<OnesCounter>(None).await?;
                Ok(model.count)
            })
            .await
            .unwrap()
    };
    assert_eq!(count_ones().await, 1);

    let report = engine.run_upcasters().await.unwrap();
    assert_eq!(report.events_before, 4);
    assert_eq!(report.events_after, 12);
    assert_eq!(
        report.passes,
        vec![UpcastPass {
            upcaster: "triplicate",
            changed: 4
        }]
    );

    let events = engine.log().get_events(-1, 20).await.unwrap().into_vec();
    let layout: Vec<(i64, BankEvent)> = events.into_iter().map(|e| (e.version, e.event)).collect();
    let expected: Vec<(i64, BankEvent)> = (0..12).map(|v| (v, test_event(v / 3))).collect();
    assert_eq!(layout, expected);

    // Cached listener state from before the run must not survive it
    assert_eq!(count_ones().await, 3);
}

#[tokio::test]
async fn test_upcast_rewrites_durable_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config().with_data_dir(dir.path());

    {
        let engine = builder(config.clone())
            .upcaster(Triplicate)
            .durable()
            .unwrap()
            .build()
            .unwrap();
        commit_all(&engine, "alice", vec![test_event(1), deposited("acc", 1)]).await;
        engine.run_upcasters().await.unwrap();
    }

    let engine = builder(config).durable().unwrap().build().unwrap();
    let events = engine.log().get_events(-1, 10).await.unwrap().into_vec();
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![0, 1, 2, 3]);
    assert_eq!(events[3].event, deposited("acc", 1));
}

#[tokio::test]
async fn test_aggregate_validation_aborts_commit() {
    let engine = builder(fast_config())
        .aggregate_validator(AggregateRule::<Account, _>::new(|account: &Account| {
            if account.balance < 0 {
                Err(format!("{} would be overdrawn", account.name))
            } else {
                Ok(())
            }
        }))
        .build()
        .unwrap();
    let factory = engine.factory("alice");

    let result = factory
        .commit(|uow| async move {
            let mut account = uow.get_aggregate::<Account>("acc".to_string()).await?;
            account.apply(deposited("acc", 10)).await?;
            account.apply(withdrawn("acc", 30)).await?;
            Ok(())
        })
        .await;

    match result {
        Err(EngineError::Validation(e)) => {
            assert_eq!(e.target, "Account");
            assert_eq!(e.message, "acc would be overdrawn");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert_eq!(engine.log().get_latest_version().await.unwrap(), -1);

    let status = factory
        .commit(|uow| async move {
            let mut account = uow.get_aggregate::<Account>("acc".to_string()).await?;
            account.apply(deposited("acc", 10)).await?;
            account.apply(withdrawn("acc", 10)).await?;
            Ok(uow.status())
        })
        .await
        .unwrap();
    assert_eq!(status, UnitOfWorkStatus::Active);
    assert_eq!(engine.log().get_latest_version().await.unwrap(), 1);
    assert_eq!(engine.context().pool().idle(), 1);
}
