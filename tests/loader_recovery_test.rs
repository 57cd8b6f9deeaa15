mod common;

use std::path::PathBuf;

use common::{FakeVolume, identity};
use pulsestore::{
    AppGroup, FallbackReason, LoadOutcome, LoaderConfig, StoreKind, StoreLoader, StoreLocation,
    StoreMetadata, EVENT_QUEUE_SCHEMA, LOG_STORE_SCHEMA,
};

fn salvaged_identity() -> StoreMetadata {
    identity().salvageable()
}

#[test]
fn fresh_store_opens_on_disk() {
    let dir = common::temp_dir();
    let loader = common::events_loader(dir.path());

    let loaded = loader.load().unwrap();

    assert_eq!(loaded.outcome, LoadOutcome::Opened);
    assert_eq!(
        loaded.store.source().kind(),
        &StoreKind::OnDisk {
            path: dir.path().join("events.sqlite")
        }
    );
    assert!(loader.path().exists());
}

#[test]
fn garbage_store_is_repaired_and_then_opens_cleanly() {
    let dir = common::temp_dir();
    let loader = common::logs_loader(dir.path());
    common::write_garbage(loader.path());

    let first = loader.load().unwrap();
    assert_eq!(
        first.outcome,
        LoadOutcome::Repaired {
            salvaged: StoreMetadata::default()
        }
    );
    assert!(!first.store.is_in_memory());
    drop(first);

    let second = loader.load().unwrap();
    assert_eq!(second.outcome, LoadOutcome::Opened);
}

#[test]
fn repair_carries_only_allow_listed_metadata() {
    let dir = common::temp_dir();
    let loader = common::events_loader(dir.path());
    common::write_future_store(&loader, &identity());

    let loaded = loader.load().unwrap();

    assert_eq!(
        loaded.outcome,
        LoadOutcome::Repaired {
            salvaged: salvaged_identity()
        }
    );
    let metadata = StoreMetadata::read(loaded.store.connection()).unwrap();
    assert_eq!(metadata.install_version, Some(7));
    assert_eq!(metadata.instance_id.as_deref(), Some("instance-abc"));
    assert_eq!(metadata.info_update_version, None);
}

#[test]
fn low_disk_space_falls_back_to_memory_with_identity() {
    let dir = common::temp_dir();
    let volume = FakeVolume::with_space(1024);
    let loader = common::loader_on(dir.path(), "events.sqlite", &EVENT_QUEUE_SCHEMA, volume.clone());
    common::write_future_store(&common::events_loader(dir.path()), &identity());

    let loaded = loader.load().unwrap();

    assert_eq!(
        loaded.outcome,
        LoadOutcome::InMemory {
            reason: FallbackReason::LowDiskSpace {
                available_bytes: 1024
            },
            salvaged: salvaged_identity(),
            metadata_applied: true,
        }
    );
    assert!(loaded.store.is_in_memory());
    assert_eq!(
        StoreMetadata::read(loaded.store.connection()).unwrap(),
        salvaged_identity()
    );

    // Nothing was destroyed: the damaged file is left for a later launch.
    assert!(loader.path().exists());
    assert!(volume.removed.lock().unwrap().is_empty());
}

#[test]
fn failed_repair_falls_back_to_memory_without_identity() {
    let dir = common::temp_dir();
    let loader = common::loader_on(
        dir.path(),
        "events.sqlite",
        &EVENT_QUEUE_SCHEMA,
        FakeVolume::protected(),
    );
    common::write_future_store(&common::events_loader(dir.path()), &identity());

    let loaded = loader.load().unwrap();

    assert_eq!(
        loaded.outcome,
        LoadOutcome::InMemory {
            reason: FallbackReason::RepairFailed,
            salvaged: salvaged_identity(),
            metadata_applied: false,
        }
    );
    assert!(StoreMetadata::read(loaded.store.connection())
        .unwrap()
        .is_empty());
}

#[test]
fn unknown_free_space_still_attempts_repair() {
    let dir = common::temp_dir();
    let loader = common::loader_on(
        dir.path(),
        "logs.sqlite",
        &LOG_STORE_SCHEMA,
        FakeVolume::unknown_space(),
    );
    common::write_garbage(loader.path());

    let loaded = loader.load().unwrap();

    assert!(matches!(loaded.outcome, LoadOutcome::Repaired { .. }));
}

#[test]
fn destroy_removes_store_and_side_files() {
    let dir = common::temp_dir();
    let loader = common::logs_loader(dir.path());
    let main = loader.path().to_path_buf();
    let side: Vec<PathBuf> = ["-wal", "-shm", "-journal"]
        .iter()
        .map(|suffix| PathBuf::from(format!("{}{suffix}", main.display())))
        .collect();

    std::fs::write(&main, b"main").unwrap();
    for path in &side {
        std::fs::write(path, b"side").unwrap();
    }

    loader.destroy().unwrap();

    assert!(!main.exists());
    for path in &side {
        assert!(!path.exists(), "{} survived", path.display());
    }

    // Nothing left to delete is not an error.
    loader.destroy().unwrap();
}

#[test]
fn destroy_failure_is_reported_with_path() {
    let dir = common::temp_dir();
    let loader = common::loader_on(
        dir.path(),
        "logs.sqlite",
        &LOG_STORE_SCHEMA,
        FakeVolume::protected(),
    );
    std::fs::write(loader.path(), b"main").unwrap();

    match loader.destroy() {
        Err(pulsestore::Error::Destroy { path, .. }) => assert_eq!(path, loader.path()),
        other => panic!("expected destroy error, got {other:?}"),
    }
}

#[test]
fn app_group_container_is_used_when_no_explicit_path() {
    let dir = common::temp_dir();
    let location = StoreLocation {
        explicit_path: None,
        app_group: Some(AppGroup {
            identifier: "group.com.example".to_string(),
            containers_root: dir.path().join("containers"),
        }),
        default_dir: Some(dir.path().join("app")),
    };
    let loader =
        StoreLoader::new(LoaderConfig::new("events.sqlite", location), &EVENT_QUEUE_SCHEMA).unwrap();

    let loaded = loader.load().unwrap();

    assert_eq!(loaded.outcome, LoadOutcome::Opened);
    assert!(dir
        .path()
        .join("containers/group.com.example/events.sqlite")
        .exists());
    assert!(!dir.path().join("app").exists());
}

#[test]
fn explicit_path_wins() {
    let dir = common::temp_dir();
    let file = dir.path().join("nested/custom.db");
    let mut location = StoreLocation::explicit(&file);
    location.default_dir = Some(dir.path().join("ignored"));

    let loader = StoreLoader::new(LoaderConfig::new("events.sqlite", location), &EVENT_QUEUE_SCHEMA)
        .unwrap();
    loader.load().unwrap();

    assert!(file.exists());
}
