//! # Store Loader: Open, Repair, or Replace
//!
//! The loader turns a [`LoaderConfig`] and a [`Schema`] into a usable [`Store`].
//! It is the only place in the crate that decides what happens when the
//! on-disk database cannot be opened.
//!
//! ## Recovery Flow
//!
//! ```text
//!                    open(path) ──ok──► Opened
//!                        │
//!                      error
//!                        ▼
//!                salvage metadata (allow-list)
//!                        │
//!            free space < threshold? ──yes──► in-memory + salvaged metadata
//!                        │no                  (LowDiskSpace)
//!                        ▼
//!              destroy files, open again ──ok──► Repaired + salvaged metadata
//!                        │
//!                      error
//!                        ▼
//!              in-memory, salvaged metadata NOT applied (RepairFailed)
//! ```
//!
//! Nothing on the happy path touches the recovery code. `load()` never
//! surfaces open, salvage or repair errors; it logs them and degrades, trading
//! durability for availability.
//!
//! ## Metadata Asymmetry
//!
//! Salvaged metadata is applied on the low-disk and repair-success branches
//! but not after a failed repair. Whether that is intended is an open product
//! question, so the branch is kept as-is and reported through
//! [`LoadOutcome::InMemory::metadata_applied`].

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metadata::{self, StoreMetadata};
use crate::schema::{self, Schema};

// =============================================================================
// Configuration
// =============================================================================

/// Below this much free space a broken store is not rebuilt on disk.
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 50 * 1024 * 1024;

/// How long a connection waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory created under the platform data directory when no other
/// location is configured.
pub const DEFAULT_DIR_NAME: &str = "pulsestore";

/// Side files SQLite keeps next to the main database file.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// SQLite `synchronous` level for on-disk stores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    /// fsync on every commit.
    #[default]
    Full,
    /// fsync the WAL at checkpoints only.
    Normal,
}

impl SynchronousMode {
    fn as_pragma(self) -> &'static str {
        match self {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
        }
    }
}

/// A container directory shared between an app and its extensions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppGroup {
    /// Group identifier, e.g. `group.com.example.app`.
    pub identifier: String,
    /// Directory holding one subdirectory per group identifier.
    pub containers_root: PathBuf,
}

/// Where the store file lives.
///
/// Resolution order: `explicit_path`, then `app_group`, then `default_dir`,
/// then the platform data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreLocation {
    /// Full path of the store file.
    pub explicit_path: Option<PathBuf>,
    /// Shared container; the file goes in `containers_root/identifier/`.
    pub app_group: Option<AppGroup>,
    /// Per-app directory; the file goes directly inside it.
    pub default_dir: Option<PathBuf>,
}

impl StoreLocation {
    /// A location that always resolves to `path`.
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// A location inside `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Resolves the path of `file_name` under this location.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        if let Some(path) = &self.explicit_path {
            return Ok(path.clone());
        }
        if let Some(group) = &self.app_group {
            return Ok(group
                .containers_root
                .join(&group.identifier)
                .join(file_name));
        }
        if let Some(dir) = &self.default_dir {
            return Ok(dir.join(file_name));
        }
        dirs::data_local_dir()
            .map(|d| d.join(DEFAULT_DIR_NAME).join(file_name))
            .ok_or_else(|| Error::Config("no data directory available for the store".to_string()))
    }
}

/// Configuration for one [`StoreLoader`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Store file name, used unless the location is an explicit path.
    pub file_name: String,

    pub location: StoreLocation,

    /// Free space needed to attempt an on-disk repair.
    pub min_free_space_bytes: u64,

    pub synchronous: SynchronousMode,

    pub busy_timeout: Duration,

    /// Run `PRAGMA quick_check` on open and treat damage as an open failure.
    pub verify_integrity: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            file_name: "store.sqlite".to_string(),
            location: StoreLocation::default(),
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            synchronous: SynchronousMode::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            verify_integrity: true,
        }
    }
}

impl LoaderConfig {
    pub fn new(file_name: impl Into<String>, location: StoreLocation) -> Self {
        Self {
            file_name: file_name.into(),
            location,
            ..Self::default()
        }
    }
}

// =============================================================================
// Volume
// =============================================================================

/// The filesystem volume holding a store.
///
/// Split out so hosts (and tests) can report free space their own way, or
/// refuse deletions the way a protected-data volume does.
pub trait Volume: Send + Sync {
    /// Free bytes available to this process on the volume containing `dir`.
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;

    /// Removes one file.
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// The local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVolume;

impl Volume for LocalVolume {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        fs4::available_space(dir)
    }
}

// =============================================================================
// Store
// =============================================================================

static IN_MEMORY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where a store's data physically lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// A database file (plus side files).
    OnDisk { path: PathBuf },
    /// A shared-cache in-memory database, alive while one connection is open.
    InMemory { uri: String },
}

/// Everything needed to open more connections to an already opened store.
#[derive(Debug, Clone)]
pub struct StoreSource {
    name: &'static str,
    kind: StoreKind,
    busy_timeout: Duration,
}

impl StoreSource {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> &StoreKind {
        &self.kind
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.kind, StoreKind::InMemory { .. })
    }

    /// Opens a secondary connection for a background context.
    ///
    /// The schema is already in place; nothing is migrated.
    pub fn connect(&self) -> Result<Connection> {
        let conn = match &self.kind {
            StoreKind::OnDisk { path } => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
            StoreKind::InMemory { uri } => Connection::open_with_flags(uri, in_memory_flags())?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

fn in_memory_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

/// An opened, migrated store.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    source: StoreSource,
}

impl Store {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn source(&self) -> &StoreSource {
        &self.source
    }

    pub fn is_in_memory(&self) -> bool {
        self.source.is_in_memory()
    }

    /// Splits into the primary connection and the source for secondary ones.
    pub fn into_parts(self) -> (Connection, StoreSource) {
        (self.conn, self.source)
    }
}

/// Why a load ended in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Free space was below the repair threshold.
    LowDiskSpace { available_bytes: u64 },
    /// Destroying or re-creating the on-disk store failed.
    RepairFailed,
}

/// What `load()` had to do to produce a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Happy path; no recovery ran.
    Opened,
    /// The store was destroyed and re-created; salvaged metadata reapplied.
    Repaired { salvaged: StoreMetadata },
    /// The store lives in memory for this session.
    InMemory {
        reason: FallbackReason,
        salvaged: StoreMetadata,
        metadata_applied: bool,
    },
}

/// Result of [`StoreLoader::load`].
#[derive(Debug)]
pub struct LoadedStore {
    pub store: Store,
    pub outcome: LoadOutcome,
}

// =============================================================================
// Loader
// =============================================================================

/// Opens (and if needed repairs or replaces) one store.
pub struct StoreLoader {
    config: LoaderConfig,
    schema: &'static Schema,
    path: PathBuf,
    volume: Arc<dyn Volume>,
}

impl std::fmt::Debug for StoreLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLoader")
            .field("schema", &self.schema.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StoreLoader {
    /// Creates a loader on the local filesystem.
    ///
    /// # Errors
    ///
    /// - [`Error::SchemaUnavailable`] if `schema` cannot be applied
    /// - [`Error::Config`] if no store location can be resolved
    pub fn new(config: LoaderConfig, schema: &'static Schema) -> Result<Self> {
        Self::with_volume(config, schema, Arc::new(LocalVolume))
    }

    /// Creates a loader on a custom [`Volume`].
    pub fn with_volume(
        config: LoaderConfig,
        schema: &'static Schema,
        volume: Arc<dyn Volume>,
    ) -> Result<Self> {
        schema.validate()?;
        let path = config.location.resolve(&config.file_name)?;
        Ok(Self {
            config,
            schema,
            path,
            volume,
        })
    }

    /// Resolved path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    /// Opens the store, recovering as described in the module docs.
    ///
    /// # Errors
    ///
    /// Only if even the in-memory fallback cannot be created.
    pub fn load(&self) -> Result<LoadedStore> {
        let open_err = match self.open_on_disk() {
            Ok(store) => {
                tracing::debug!(store = self.schema.name, path = %self.path.display(), "store opened");
                return Ok(LoadedStore {
                    store,
                    outcome: LoadOutcome::Opened,
                });
            }
            Err(e) => e,
        };

        tracing::warn!(
            store = self.schema.name,
            path = %self.path.display(),
            error = %open_err,
            "store failed to open, starting recovery"
        );

        let salvaged = metadata::salvage(&self.path);

        if let Some(available_bytes) = self.low_disk_space() {
            tracing::warn!(
                store = self.schema.name,
                available_bytes,
                threshold = self.config.min_free_space_bytes,
                "not enough free space to rebuild the store, using memory"
            );
            return self.fall_back_in_memory(
                FallbackReason::LowDiskSpace { available_bytes },
                salvaged,
                true,
            );
        }

        match self.destroy().and_then(|()| self.open_on_disk()) {
            Ok(store) => {
                if let Err(e) = salvaged.apply(store.connection()) {
                    tracing::error!(store = self.schema.name, error = %e, "failed to reapply salvaged metadata");
                }
                tracing::info!(store = self.schema.name, "store rebuilt on disk");
                Ok(LoadedStore {
                    store,
                    outcome: LoadOutcome::Repaired { salvaged },
                })
            }
            Err(e) => {
                tracing::error!(
                    store = self.schema.name,
                    error = %e,
                    "store repair failed, using memory"
                );
                self.fall_back_in_memory(FallbackReason::RepairFailed, salvaged, false)
            }
        }
    }

    /// Deletes the store file and its side files.
    ///
    /// Missing files are fine. Anything else is [`Error::Destroy`].
    pub fn destroy(&self) -> Result<()> {
        for path in store_files(&self.path) {
            match self.volume.remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed store file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(Error::Destroy { path, source }),
            }
        }
        Ok(())
    }

    /// Creates a fresh, migrated in-memory store.
    pub fn make_in_memory(&self) -> Result<Store> {
        let seq = IN_MEMORY_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:pulsestore-{}-{}-{seq}?mode=memory&cache=shared",
            self.schema.name,
            std::process::id()
        );

        let mut conn = Connection::open_with_flags(&uri, in_memory_flags())?;
        schema::migrate(&mut conn, self.schema)?;

        Ok(Store {
            conn,
            source: StoreSource {
                name: self.schema.name,
                kind: StoreKind::InMemory { uri },
                busy_timeout: self.config.busy_timeout,
            },
        })
    }

    fn open_on_disk(&self) -> Result<Store> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.pragma_update(None, "synchronous", self.config.synchronous.as_pragma())?;

        if self.config.verify_integrity {
            let check: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
            if check != "ok" {
                return Err(Error::Corrupt(check));
            }
        }

        schema::migrate(&mut conn, self.schema)?;

        // Switched only once the store is known to be usable, so a rejected
        // file keeps the journal mode salvage expects.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(store = self.schema.name, mode = %mode, "WAL unavailable, using rollback journal");
        }

        Ok(Store {
            conn,
            source: StoreSource {
                name: self.schema.name,
                kind: StoreKind::OnDisk {
                    path: self.path.clone(),
                },
                busy_timeout: self.config.busy_timeout,
            },
        })
    }

    /// `Some(available)` when free space is under the repair threshold.
    fn low_disk_space(&self) -> Option<u64> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        match self.volume.available_bytes(dir) {
            Ok(available) if available < self.config.min_free_space_bytes => Some(available),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "free space unknown, attempting repair anyway");
                None
            }
        }
    }

    fn fall_back_in_memory(
        &self,
        reason: FallbackReason,
        salvaged: StoreMetadata,
        apply_metadata: bool,
    ) -> Result<LoadedStore> {
        let store = self.make_in_memory()?;

        if apply_metadata {
            if let Err(e) = salvaged.apply(store.connection()) {
                tracing::error!(store = self.schema.name, error = %e, "failed to apply salvaged metadata");
            }
        }

        Ok(LoadedStore {
            store,
            outcome: LoadOutcome::InMemory {
                reason,
                salvaged,
                metadata_applied: apply_metadata,
            },
        })
    }
}

/// The main file followed by its side files.
fn store_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in SIDE_FILE_SUFFIXES {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LOG_STORE_SCHEMA;

    #[test]
    fn test_location_precedence() {
        let group = AppGroup {
            identifier: "group.test".to_string(),
            containers_root: PathBuf::from("/containers"),
        };

        let all = StoreLocation {
            explicit_path: Some(PathBuf::from("/explicit/db.sqlite")),
            app_group: Some(group.clone()),
            default_dir: Some(PathBuf::from("/app")),
        };
        assert_eq!(all.resolve("x.sqlite").unwrap(), PathBuf::from("/explicit/db.sqlite"));

        let shared = StoreLocation {
            explicit_path: None,
            ..all.clone()
        };
        assert_eq!(
            shared.resolve("x.sqlite").unwrap(),
            PathBuf::from("/containers/group.test/x.sqlite")
        );

        let default = StoreLocation::in_dir("/app");
        assert_eq!(default.resolve("x.sqlite").unwrap(), PathBuf::from("/app/x.sqlite"));
    }

    #[test]
    fn test_store_files_include_side_files() {
        let files = store_files(Path::new("/data/events.sqlite"));
        assert_eq!(
            files,
            vec![
                PathBuf::from("/data/events.sqlite"),
                PathBuf::from("/data/events.sqlite-wal"),
                PathBuf::from("/data/events.sqlite-shm"),
                PathBuf::from("/data/events.sqlite-journal"),
            ]
        );
    }

    #[test]
    fn test_loader_rejects_unusable_schema() {
        static NONE: Schema = Schema {
            name: "none",
            migrations: &[],
        };
        let err = StoreLoader::new(LoaderConfig::new("x.sqlite", StoreLocation::in_dir("/tmp")), &NONE)
            .unwrap_err();
        assert!(matches!(err, Error::SchemaUnavailable(_)));
    }

    #[test]
    fn test_in_memory_stores_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StoreLoader::new(
            LoaderConfig::new("logs.sqlite", StoreLocation::in_dir(dir.path())),
            &LOG_STORE_SCHEMA,
        )
        .unwrap();

        let a = loader.make_in_memory().unwrap();
        let b = loader.make_in_memory().unwrap();
        a.connection()
            .execute("INSERT INTO logs (timestamp_ms, message) VALUES (1, 'a')", [])
            .unwrap();

        let count: i64 = b
            .connection()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_secondary_connection_sees_in_memory_data() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StoreLoader::new(
            LoaderConfig::new("logs.sqlite", StoreLocation::in_dir(dir.path())),
            &LOG_STORE_SCHEMA,
        )
        .unwrap();

        let store = loader.make_in_memory().unwrap();
        store
            .connection()
            .execute("INSERT INTO logs (timestamp_ms, message) VALUES (1, 'a')", [])
            .unwrap();

        let other = store.source().connect().unwrap();
        let count: i64 = other
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: LoaderConfig =
            serde_json::from_str(r#"{ "file_name": "events.sqlite", "synchronous": "normal" }"#).unwrap();

        assert_eq!(cfg.file_name, "events.sqlite");
        assert_eq!(cfg.synchronous, SynchronousMode::Normal);
        assert_eq!(cfg.min_free_space_bytes, DEFAULT_MIN_FREE_SPACE_BYTES);
        assert!(cfg.verify_integrity);
    }
}
