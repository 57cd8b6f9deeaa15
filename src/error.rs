//! # Error Handling for pulsestore
//!
//! This module defines the error type used throughout the crate. A single enum
//! ([`Error`]) represents every failure mode of the storage core, which keeps
//! signatures short and lets callers match on the variants they care about.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error`:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]`, so `?` works on rusqlite and I/O errors
//! - Source chaining comes from `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Construction | Invalid schema, unresolvable location | Fatal for that store |
//! | Recovery | Store open failure | Handled inside the loader, never surfaced |
//! | Caller | Duplicate transaction id | Fix the producer |
//! | Internal | SQLite error, I/O error, disk full | Log, roll back, propagate |
//!
//! Mutations that do not find their target (update/delete of a missing
//! transaction id) are not errors at all. They are logged and treated as
//! already-consistent state.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in pulsestore operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Construction Errors (fatal to the component being built)
    // =========================================================================

    /// The schema definition handed to a loader cannot be used.
    ///
    /// # When This Happens
    ///
    /// - The schema has no migrations (there is nothing to load)
    /// - Migration versions are not contiguous starting at 1
    /// - A migration has an empty SQL body
    ///
    /// There is no silent fallback: a loader without a usable schema cannot
    /// produce a store, not even an in-memory one.
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),

    /// Configuration cannot be turned into a working store.
    ///
    /// Most commonly: no explicit path, no shared container, and no default
    /// per-app directory could be determined for this platform.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Store Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # When This Happens
    ///
    /// This wraps any error from the `rusqlite` crate:
    /// - Database file is not a database (corrupted header)
    /// - Disk is full during commit
    /// - Database is locked by another connection for longer than the busy timeout
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// which enables the `?` operator on every rusqlite call.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema version mismatch or failed migration.
    ///
    /// # When This Happens
    ///
    /// - Opening a store written by a newer SDK (its `user_version` is ahead
    ///   of the newest migration we know)
    /// - A migration statement failed partway through
    ///
    /// The loader treats this like any other open failure and repairs.
    #[error("schema error: {0}")]
    Schema(String),

    /// The integrity check run at open time reported damage.
    #[error("store corrupted: {0}")]
    Corrupt(String),

    /// Deleting the store file (or one of its side files) failed.
    ///
    /// Returned by `StoreLoader::destroy`. Inside `load()` this only means the
    /// repair path failed, and the loader falls back to an in-memory store.
    #[error("failed to destroy store file {}: {source}", path.display())]
    Destroy {
        /// The file that could not be removed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// An event with this transaction id is already queued.
    ///
    /// The repository does not deduplicate; producers assign unique ids.
    #[error("duplicate transaction id '{0}'")]
    DuplicateKey(String),

    /// A stored value could not be decoded into its typed form.
    #[error("decode error: {0}")]
    Decode(String),

    // =========================================================================
    // Execution Context Errors
    // =========================================================================

    /// The execution context has stopped (or its worker dropped the reply).
    #[error("execution context '{0}' is closed")]
    ContextClosed(String),
}

impl Error {
    /// Returns true when the underlying SQLite failure is "database or disk is full".
    ///
    /// Save failures with this code get their own log line before the generic
    /// rollback path runs.
    pub fn is_disk_full(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::DiskFull
        )
    }

    /// Maps a constraint violation on insert to [`Error::DuplicateKey`].
    pub(crate) fn from_insert(err: rusqlite::Error, transaction_id: &str) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                Error::DuplicateKey(transaction_id.to_string())
            }
            other => Error::Sqlite(other),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
