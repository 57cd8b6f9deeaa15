//! # SQLite Schema for pulsestore
//!
//! This module defines the two store schemas and the migration runner that
//! brings an opened database up to date.
//!
//! ## Table Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │  events.sqlite                        logs.sqlite                      │
//! │  ┌────────────────────┐               ┌──────────────────┐             │
//! │  │ events             │               │ logs             │             │
//! │  │ id (PK)            │               │ id (PK)          │             │
//! │  │ transaction_id (U) │               │ timestamp_ms     │             │
//! │  │ event_type         │               │ message          │             │
//! │  │ body BLOB          │               └──────────────────┘             │
//! │  │ enqueued_ms        │                                                │
//! │  │ retry_ms NULL      │               ┌──────────────────┐             │
//! │  └────────────────────┘               │ store_metadata   │             │
//! │  ┌────────────────────┐               └──────────────────┘             │
//! │  │ store_metadata     │                                                │
//! │  │ key (PK) | value   │   header: PRAGMA user_version = schema version │
//! │  └────────────────────┘                                                │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Versioning
//!
//! The schema version lives in the SQLite header (`PRAGMA user_version`), so it
//! can be read even when the metadata table cannot. Migrations are applied in
//! one transaction together with the version bump: a crash mid-migration leaves
//! the previous version intact.
//!
//! A database whose version is ahead of the newest known migration was written
//! by a newer SDK. Opening it fails with [`Error::Schema`] and the loader
//! replaces it.

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Definition
// =============================================================================

/// One forward-only schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version the database has after this step (1, 2, 3, ...).
    pub version: u32,
    /// Short human-readable purpose, used in logs.
    pub description: &'static str,
    /// Statement batches, executed in order.
    pub statements: &'static [&'static str],
}

/// The full definition of one store's schema.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    /// Name used in logs and thread names ("events", "logs").
    pub name: &'static str,
    /// Ordered migrations.
    pub migrations: &'static [Migration],
}

impl Schema {
    /// Version a fully migrated database reports.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Checks that the schema can actually be applied.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaUnavailable`] when there are no migrations, versions are
    /// not `1..=n` in order, or a migration has no SQL.
    pub fn validate(&self) -> Result<()> {
        if self.migrations.is_empty() {
            return Err(Error::SchemaUnavailable(format!(
                "schema '{}' has no migrations",
                self.name
            )));
        }

        for (i, m) in self.migrations.iter().enumerate() {
            let expected = i as u32 + 1;
            if m.version != expected {
                return Err(Error::SchemaUnavailable(format!(
                    "schema '{}': migration #{i} has version {}, expected {expected}",
                    self.name, m.version
                )));
            }
            if m.statements.iter().all(|sql| sql.trim().is_empty()) {
                return Err(Error::SchemaUnavailable(format!(
                    "schema '{}': migration {} has no statements",
                    self.name, m.version
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// DDL Statements
// =============================================================================

/// Identity metadata attached to a store.
///
/// Kept apart from the record tables so a wipe of records never touches it and
/// so salvage can read it without understanding the record layout.
const CREATE_STORE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS store_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// The delivery queue.
///
/// # Columns
///
/// - `id`: insertion order; tie-breaker for equal `enqueued_ms` and the key
///   used by bulk deletes
/// - `transaction_id`: producer key, UNIQUE so a duplicate insert fails loudly
/// - `event_type`: tag string of [`crate::EventType`]
/// - `body`: opaque payload
/// - `enqueued_ms`: creation time, drives ordering and age expiry
/// - `retry_ms`: last delivery attempt, NULL until the first attempt
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id TEXT NOT NULL UNIQUE,
    event_type     TEXT NOT NULL,
    body           BLOB NOT NULL,
    enqueued_ms    INTEGER NOT NULL,
    retry_ms       INTEGER
);
CREATE INDEX IF NOT EXISTS events_enqueued ON events(enqueued_ms, id);
"#;

/// Speeds up the retry-window filter of the delivery query.
const CREATE_EVENTS_RETRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_retry ON events(retry_ms);
"#;

const CREATE_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ms INTEGER NOT NULL,
    message      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS logs_timestamp ON logs(timestamp_ms, id);
"#;

const EVENT_QUEUE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "events and store metadata",
        statements: &[CREATE_STORE_METADATA, CREATE_EVENTS],
    },
    Migration {
        version: 2,
        description: "retry timestamp index",
        statements: &[CREATE_EVENTS_RETRY_INDEX],
    },
];

const LOG_STORE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "logs and store metadata",
    statements: &[CREATE_STORE_METADATA, CREATE_LOGS],
}];

/// Schema of the guaranteed-delivery event queue.
pub static EVENT_QUEUE_SCHEMA: Schema = Schema {
    name: "events",
    migrations: EVENT_QUEUE_MIGRATIONS,
};

/// Schema of the diagnostic log store.
pub static LOG_STORE_SCHEMA: Schema = Schema {
    name: "logs",
    migrations: LOG_STORE_MIGRATIONS,
};

// =============================================================================
// Migration Runner
// =============================================================================

/// Reads the schema version from the database header.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(v.max(0) as u32)
}

/// Brings `conn` up to `schema.latest_version()`.
///
/// Returns the number of migrations applied (0 for an up-to-date store).
///
/// # Errors
///
/// - [`Error::Schema`] if the database is newer than `schema`
/// - [`Error::Sqlite`] if a statement fails; nothing is applied in that case
pub fn migrate(conn: &mut Connection, schema: &Schema) -> Result<usize> {
    let current = schema_version(conn)?;
    let latest = schema.latest_version();

    if current > latest {
        return Err(Error::Schema(format!(
            "store '{}' has schema version {current}, newest known is {latest}",
            schema.name
        )));
    }

    let pending: Vec<&Migration> = schema
        .migrations
        .iter()
        .filter(|m| m.version > current)
        .collect();

    if pending.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    for m in &pending {
        tracing::debug!(
            store = schema.name,
            version = m.version,
            "applying migration: {}",
            m.description
        );
        for sql in m.statements {
            tx.execute_batch(sql)
                .map_err(|e| Error::Schema(format!("migration {} failed: {e}", m.version)))?;
        }
    }
    tx.pragma_update(None, "user_version", latest as i64)?;
    tx.commit()?;

    tracing::info!(
        store = schema.name,
        from = current,
        to = latest,
        "store schema migrated"
    );

    Ok(pending.len())
}

// =============================================================================
// Tests
// =============================================================================
