#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};
use pulsestore::schema::Schema;
use pulsestore::{
    BackgroundGrant, BackgroundTaskHost, Clock, ManualClock, LoaderConfig, StoreLoader, StoreLocation,
    StoreMetadata, Timestamp, Volume, EVENT_QUEUE_SCHEMA, LOG_STORE_SCHEMA,
};

/// 2024-01-01T00:00:00Z
pub const START_MS: i64 = 1_704_067_200_000;

pub fn clock() -> ManualClock {
    ManualClock::new(Timestamp::from_millis(START_MS))
}

/// `offset_ms` after the clock's current time.
pub fn at(clock: &ManualClock, offset_ms: i64) -> Timestamp {
    Timestamp::from_millis(clock.now().as_millis() + offset_ms)
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("create temp dir")
}

pub fn loader(dir: &Path, file_name: &str, schema: &'static Schema) -> StoreLoader {
    StoreLoader::new(LoaderConfig::new(file_name, StoreLocation::in_dir(dir)), schema)
        .expect("create loader")
}

pub fn loader_on(
    dir: &Path,
    file_name: &str,
    schema: &'static Schema,
    volume: Arc<dyn Volume>,
) -> StoreLoader {
    StoreLoader::with_volume(
        LoaderConfig::new(file_name, StoreLocation::in_dir(dir)),
        schema,
        volume,
    )
    .expect("create loader")
}

pub fn events_loader(dir: &Path) -> StoreLoader {
    loader(dir, "events.sqlite", &EVENT_QUEUE_SCHEMA)
}

pub fn logs_loader(dir: &Path) -> StoreLoader {
    loader(dir, "logs.sqlite", &LOG_STORE_SCHEMA)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = open_read_only(path);
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count rows")
}

pub fn write_garbage(path: &Path) {
    std::fs::create_dir_all(path.parent().expect("parent dir")).expect("create dir");
    std::fs::write(path, vec![0x5a; 8192]).expect("write garbage");
}

/// Creates a valid store holding `metadata` that a current loader refuses to
/// open, because its schema version is from the future.
pub fn write_future_store(loader: &StoreLoader, metadata: &StoreMetadata) {
    {
        let loaded = loader.load().expect("initial load");
        metadata.apply(loaded.store.connection()).expect("apply metadata");
    }
    let conn = Connection::open(loader.path()).expect("reopen store");
    let _: String = conn
        .pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))
        .expect("leave WAL");
    conn.pragma_update(None, "user_version", 99).expect("bump version");
}

pub fn identity() -> StoreMetadata {
    StoreMetadata {
        install_version: Some(7),
        info_update_version: Some(3),
        instance_id: Some("instance-abc".to_string()),
    }
}

pub fn eventually<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// =============================================================================
// Fakes
// =============================================================================

/// A volume with a fixed amount of free space that can refuse deletions.
#[derive(Debug, Default)]
pub struct FakeVolume {
    /// `None` makes the free-space check fail.
    pub available: Option<u64>,
    pub refuse_removal: bool,
    pub removed: Mutex<Vec<PathBuf>>,
}

impl FakeVolume {
    pub fn with_space(bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            available: Some(bytes),
            ..Self::default()
        })
    }

    pub fn unknown_space() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn protected() -> Arc<Self> {
        Arc::new(Self {
            available: Some(u64::MAX),
            refuse_removal: true,
            ..Self::default()
        })
    }
}

impl Volume for FakeVolume {
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        self.available
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "statfs unavailable"))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.refuse_removal {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is protected"));
        }
        std::fs::remove_file(path)?;
        self.removed.lock().expect("lock").push(path.to_path_buf());
        Ok(())
    }
}

/// A host that records every grant it hands out and gets back.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub grants: bool,
    next_id: AtomicU64,
    pub requested: Mutex<Vec<String>>,
    pub ended: Mutex<Vec<u64>>,
}

impl RecordingHost {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            grants: true,
            ..Self::default()
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ended_count(&self) -> usize {
        self.ended.lock().expect("lock").len()
    }
}

impl BackgroundTaskHost for RecordingHost {
    fn begin_background_task(&self, name: &str) -> Option<BackgroundGrant> {
        self.requested.lock().expect("lock").push(name.to_string());
        if !self.grants {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Some(BackgroundGrant::new(id, name))
    }

    fn end_background_task(&self, grant: BackgroundGrant) {
        self.ended.lock().expect("lock").push(grant.id());
    }
}
