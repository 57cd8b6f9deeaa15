mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::identity;
use pulsestore::{
    Error, Event, EventQueueRepository, EventType, EvictionReason, ManualClock, QueueConfig,
    StoreChange, Timestamp, TransactionId,
};

const RETRY: Duration = Duration::from_secs(60);

fn on_disk(dir: &std::path::Path, config: QueueConfig, clock: &ManualClock) -> EventQueueRepository {
    EventQueueRepository::open(&common::events_loader(dir), config, Arc::new(clock.clone()))
        .expect("open queue")
}

fn in_memory(dir: &std::path::Path, config: QueueConfig, clock: &ManualClock) -> EventQueueRepository {
    let store = common::events_loader(dir)
        .make_in_memory()
        .expect("in-memory store");
    EventQueueRepository::from_store(store, config, Arc::new(clock.clone())).expect("start queue")
}

fn event(id: &str, at: Timestamp) -> Event {
    Event::new(id, EventType::CustomEvent, format!("{{\"id\":\"{id}\"}}").into_bytes(), at)
}

fn ids(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.transaction_id.as_str()).collect()
}

#[test]
fn capacity_overflow_is_evicted_after_count() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(
        dir.path(),
        QueueConfig {
            capacity: 3,
            ..QueueConfig::default()
        },
        &clock,
    );

    for i in 0..6 {
        queue
            .create(event(&format!("tx-{i}"), common::at(&clock, i)))
            .unwrap();
    }

    assert_eq!(queue.count_events().unwrap(), 6);
    assert_eq!(queue.count_events().unwrap(), 3);

    let live = queue.query(10, RETRY).unwrap();
    assert_eq!(ids(&live), vec!["tx-3", "tx-4", "tx-5"]);
}

#[test]
fn capacity_eviction_is_announced() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(
        dir.path(),
        QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        },
        &clock,
    );
    queue.create(event("a", common::at(&clock, 0))).unwrap();
    queue.create(event("b", common::at(&clock, 1))).unwrap();

    let mut changes = queue.subscribe();
    queue.count_events().unwrap();
    queue.count_events().unwrap();

    assert_eq!(
        changes.try_recv().unwrap(),
        StoreChange::Evicted {
            count: 1,
            reason: EvictionReason::Capacity
        }
    );
}

#[test]
fn duplicate_transaction_id_is_rejected() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);

    queue.create(event("same", common::at(&clock, 0))).unwrap();
    let err = queue.create(event("same", common::at(&clock, 1))).unwrap_err();

    assert!(matches!(err, Error::DuplicateKey(_)), "got {err:?}");
    assert_eq!(queue.count_events().unwrap(), 1);
}

#[test]
fn query_never_returns_duplicates_or_more_than_limit() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);

    for i in 0..25 {
        queue.create(event(&format!("tx-{i:02}"), common::at(&clock, i))).unwrap();
    }

    let page = queue.query(10, RETRY).unwrap();
    assert_eq!(page.len(), 10);
    let unique: HashSet<_> = page.iter().map(|e| e.transaction_id.clone()).collect();
    assert_eq!(unique.len(), 10);
    assert_eq!(page[0].transaction_id, TransactionId::new("tx-00"));
}

#[test]
fn deprecated_events_are_hidden_counted_and_removed() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let lifetime = Duration::from_secs(24 * 60 * 60);
    let queue = on_disk(
        dir.path(),
        QueueConfig {
            event_lifetime: lifetime,
            ..QueueConfig::default()
        },
        &clock,
    );

    queue.create(event("old-1", common::at(&clock, 0))).unwrap();
    queue.create(event("old-2", common::at(&clock, 1))).unwrap();
    clock.advance(lifetime);
    queue.create(event("fresh", common::at(&clock, 0))).unwrap();
    clock.advance(Duration::from_secs(1));

    assert_eq!(ids(&queue.query(10, RETRY).unwrap()), vec!["fresh"]);
    assert_eq!(queue.count_deprecated_events().unwrap(), 2);

    let mut changes = queue.subscribe();
    assert_eq!(queue.remove_deprecated_events_if_needed().unwrap(), 2);
    assert_eq!(
        changes.try_recv().unwrap(),
        StoreChange::Evicted {
            count: 2,
            reason: EvictionReason::Expired
        }
    );

    assert_eq!(queue.count_deprecated_events().unwrap(), 0);
    assert_eq!(queue.remove_deprecated_events_if_needed().unwrap(), 0);
    assert_eq!(queue.count_events().unwrap(), 1);
}

#[test]
fn attempted_event_waits_out_the_retry_window() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);

    let e = event("tx", common::at(&clock, 0));
    queue.create(e.clone()).unwrap();
    queue.update(&e).unwrap();

    let attempted_at = queue.read(&e.transaction_id).unwrap().unwrap().retried_at;
    assert_eq!(attempted_at, Some(common::at(&clock, 0)));

    clock.advance(Duration::from_millis(59_999));
    assert!(queue.query(10, RETRY).unwrap().is_empty());

    clock.advance(Duration::from_millis(1));
    assert_eq!(ids(&queue.query(10, RETRY).unwrap()), vec!["tx"]);
}

#[test]
fn read_returns_what_was_created() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);

    let original = Event::new(
        "push-1",
        EventType::PushClicked,
        vec![0, 159, 146, 150, 255],
        common::at(&clock, 42),
    );
    queue.create(original.clone()).unwrap();

    assert_eq!(queue.read(&original.transaction_id).unwrap(), Some(original));
    assert_eq!(queue.read(&TransactionId::new("missing")).unwrap(), None);
}

#[test]
fn unknown_update_and_delete_are_ignored() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
    let ghost = event("ghost", common::at(&clock, 0));

    queue.update(&ghost).unwrap();
    queue.delete(&ghost).unwrap();

    assert_eq!(queue.count_events().unwrap(), 0);
}

#[test]
fn delete_is_announced_with_the_transaction_id() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
    let mut changes = queue.subscribe();

    let e = event("tx", common::at(&clock, 0));
    queue.create(e.clone()).unwrap();
    queue.delete(&e).unwrap();

    assert_eq!(
        changes.try_recv().unwrap(),
        StoreChange::Inserted {
            transaction_id: e.transaction_id.clone()
        }
    );
    assert_eq!(
        changes.try_recv().unwrap(),
        StoreChange::Deleted {
            transaction_ids: vec![e.transaction_id]
        }
    );
}

#[test]
fn memory_warning_prunes_in_memory_queue() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = in_memory(dir.path(), QueueConfig::default(), &clock);
    assert!(queue.is_in_memory());

    for i in 0..50 {
        queue.create(event(&format!("tx-{i}"), common::at(&clock, i))).unwrap();
    }
    let mut changes = queue.subscribe();

    let task = queue.handle_memory_warning().expect("prune started");
    assert_eq!(task.join().unwrap(), 50);

    assert_eq!(queue.count_events().unwrap(), 0);
    assert_eq!(
        changes.try_recv().unwrap(),
        StoreChange::Evicted {
            count: 50,
            reason: EvictionReason::MemoryPressure
        }
    );
}

#[test]
fn memory_warning_is_ignored_on_disk() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
    queue.create(event("tx", common::at(&clock, 0))).unwrap();

    assert!(queue.handle_memory_warning().is_none());
    assert_eq!(queue.count_events().unwrap(), 1);
}

#[test]
fn in_memory_maintenance_never_fails_concurrent_writes() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = in_memory(dir.path(), QueueConfig::default(), &clock);
    let done = AtomicBool::new(false);

    let (created, failures) = std::thread::scope(|scope| {
        let producer = scope.spawn(|| {
            let mut created = 0;
            let mut failures = Vec::new();
            for i in 0..600 {
                match queue.create(event(&format!("tx-{i}"), common::at(&clock, i))) {
                    Ok(()) => created += 1,
                    Err(e) => failures.push(e.to_string()),
                }
            }
            done.store(true, Ordering::SeqCst);
            (created, failures)
        });

        let mut rounds = 0;
        while rounds < 200 && !done.load(Ordering::SeqCst) {
            if let Some(task) = queue.handle_memory_warning() {
                task.join().expect("prune");
            }
            queue.remove_deprecated_events_if_needed().expect("expiry");
            queue.count_deprecated_events().expect("expiry count");
            rounds += 1;
        }

        producer.join().unwrap()
    });

    assert!(failures.is_empty(), "writes failed: {failures:?}");
    assert_eq!(created, 600);
}

#[test]
fn query_skips_events_of_unknown_type() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
    for i in 0..5 {
        queue.create(event(&format!("tx-{i}"), common::at(&clock, i))).unwrap();
    }

    // Written by a newer build, oldest in the queue.
    let conn = rusqlite::Connection::open(dir.path().join("events.sqlite")).unwrap();
    conn.execute(
        "UPDATE events SET event_type = 'futureType' WHERE transaction_id = 'tx-0'",
        [],
    )
    .unwrap();
    drop(conn);

    assert_eq!(
        ids(&queue.query(10, RETRY).unwrap()),
        vec!["tx-1", "tx-2", "tx-3", "tx-4"]
    );
    assert_eq!(ids(&queue.query(1, RETRY).unwrap()), vec!["tx-1"]);

    let err = queue.read(&TransactionId::new("tx-0")).unwrap_err();
    assert!(matches!(err, Error::Decode(_)), "got {err:?}");
}

#[test]
fn erase_on_disk_clears_events_and_identity() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = on_disk(
        dir.path(),
        QueueConfig {
            erase_chunk_size: 2,
            ..QueueConfig::default()
        },
        &clock,
    );
    for i in 0..5 {
        queue.create(event(&format!("tx-{i}"), common::at(&clock, i))).unwrap();
    }
    queue.set_instance_id(Some("instance-abc".to_string())).unwrap();
    queue.set_install_version(Some(7)).unwrap();
    let mut changes = queue.subscribe();

    assert_eq!(queue.erase().unwrap(), 5);

    assert_eq!(queue.count_events().unwrap(), 0);
    assert!(queue.metadata().unwrap().is_empty());
    match changes.try_recv().unwrap() {
        StoreChange::Deleted { transaction_ids } => assert_eq!(transaction_ids.len(), 5),
        other => panic!("expected deletion, got {other:?}"),
    }
}

#[test]
fn erase_in_memory_reports_eviction() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let queue = in_memory(dir.path(), QueueConfig::default(), &clock);
    queue.create(event("a", common::at(&clock, 0))).unwrap();
    queue.create(event("b", common::at(&clock, 1))).unwrap();
    let mut changes = queue.subscribe();

    assert_eq!(queue.erase().unwrap(), 2);
    assert_eq!(
        changes.try_recv().unwrap(),
        StoreChange::Evicted {
            count: 2,
            reason: EvictionReason::Erased
        }
    );
}

#[test]
fn metadata_survives_reopen() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let expected = identity();

    {
        let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
        queue.set_install_version(expected.install_version).unwrap();
        queue.set_info_update_version(expected.info_update_version).unwrap();
        queue.set_instance_id(expected.instance_id.clone()).unwrap();
        queue.shutdown();
    }

    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
    assert_eq!(queue.metadata().unwrap(), expected);
    assert_eq!(queue.install_version().unwrap(), Some(7));
    assert_eq!(queue.info_update_version().unwrap(), Some(3));
    assert_eq!(queue.instance_id().unwrap().as_deref(), Some("instance-abc"));

    queue.set_info_update_version(None).unwrap();
    assert_eq!(queue.info_update_version().unwrap(), None);
}

#[test]
fn queued_events_survive_restart() {
    let dir = common::temp_dir();
    let clock = common::clock();

    {
        let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
        queue.create(event("a", common::at(&clock, 0))).unwrap();
        queue.create(event("b", common::at(&clock, 1))).unwrap();
        queue.shutdown();
    }

    let queue = on_disk(dir.path(), QueueConfig::default(), &clock);
    assert_eq!(
        queue.load_outcome(),
        Some(&pulsestore::LoadOutcome::Opened)
    );
    assert_eq!(ids(&queue.query(10, RETRY).unwrap()), vec!["a", "b"]);
}

#[test]
fn queue_refuses_a_log_store() {
    let dir = common::temp_dir();
    let clock = common::clock();
    let store = common::logs_loader(dir.path()).make_in_memory().unwrap();

    let err = EventQueueRepository::from_store(store, QueueConfig::default(), Arc::new(clock))
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
}
