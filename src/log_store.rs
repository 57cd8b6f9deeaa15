//! # Size-Bounded Diagnostic Log Store
//!
//! SDK components write short log lines here; the backend can later ask for
//! the lines of a time period. The store buffers writes, persists them in
//! batches, and trims its oldest lines to stay under a byte budget.
//!
//! ## Write Path
//!
//! ```text
//!  create(message) ──submit──► LogWorker
//!                                 │ buffer.push
//!                                 ├─ immediate mode? ──► persist buffer now
//!                                 ├─ buffer.len() == batch_size ──► persist buffer
//!                                 └─ every N writes ──► schedule Trim on own queue
//! ```
//!
//! `create` never waits. Every query flushes the buffer first, so an export
//! sees every line accepted before it.
//!
//! ## Foreground / Background
//!
//! | Signal | Grant from host | Effect |
//! |--------|-----------------|--------|
//! | entered background | yes | one-shot task flushes the buffer, then returns the grant |
//! | entered background | no  | immediate-write mode: every line is persisted at once |
//! | entered foreground | n/a | back to batched writes |
//!
//! Without a grant the process may be suspended at any moment, so nothing is
//! allowed to sit in the buffer.
//!
//! ## Trimming
//!
//! See [`crate::trim`]. The policy state lives in the worker; the scheduled
//! trim checks and explicit [`LogStore::maybe_trim`] calls both run it on the
//! store's queue.

use std::sync::mpsc;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::context::{save, ExecutionContext, OneShot, Reply, RunGuard, Scheduler, Worker};
use crate::error::{Error, Result};
use crate::lifecycle::{BackgroundGrant, BackgroundTaskHost};
use crate::loader::{LoadOutcome, LoadedStore, Store, StoreLoader, StoreSource};
use crate::schema::LOG_STORE_SCHEMA;
use crate::trim::{TrimOutcome, TrimPolicy, TrimPolicyConfig};
use crate::types::{LogRecord, Timestamp};

// =============================================================================
// Configuration
// =============================================================================

pub const DEFAULT_BATCH_SIZE: usize = 15;
pub const DEFAULT_WRITES_PER_TRIM_CHECK: usize = 100;
pub const DEFAULT_FETCH_WINDOW: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogStoreConfig {
    /// Buffered lines that trigger a flush.
    pub batch_size: usize,
    /// Buffered writes between two scheduled trim checks.
    pub writes_per_trim_check: usize,
    /// Rows loaded per page by `fetch_period`.
    pub fetch_window: usize,
    pub trim: TrimPolicyConfig,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            writes_per_trim_check: DEFAULT_WRITES_PER_TRIM_CHECK,
            fetch_window: DEFAULT_FETCH_WINDOW,
            trim: TrimPolicyConfig::default(),
        }
    }
}

const STORE: &str = "logs";

/// Name under which background time is requested from the host.
pub const BACKGROUND_FLUSH_TASK: &str = "pulsestore-log-flush";

// =============================================================================
// Requests
// =============================================================================

/// Units of work understood by the log store's context.
pub enum LogRequest {
    Write {
        record: LogRecord,
    },
    Flush {
        reply: Reply<usize>,
    },
    First {
        reply: Reply<Option<LogRecord>>,
    },
    Last {
        reply: Reply<Option<LogRecord>>,
    },
    FetchPeriod {
        from: Timestamp,
        to: Timestamp,
        ascending: bool,
        reply: Reply<Vec<LogRecord>>,
    },
    DeleteOldest {
        fraction: f64,
        reply: Reply<usize>,
    },
    DeleteAll {
        reply: Reply<usize>,
    },
    Count {
        reply: Reply<usize>,
    },
    SizeKb {
        reply: Reply<u64>,
    },
    /// Trim check; scheduled ones have no caller waiting.
    Trim {
        precomputed_size_kb: Option<u64>,
        reply: Option<Reply<TrimOutcome>>,
    },
    SetImmediate {
        enabled: bool,
    },
}

// =============================================================================
// Worker
// =============================================================================

struct LogWorker {
    conn: Connection,
    config: LogStoreConfig,
    buffer: Vec<LogRecord>,
    immediate: bool,
    writes_since_trim_check: usize,
    policy: TrimPolicy,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler<LogRequest>,
}

impl Worker for LogWorker {
    type Request = LogRequest;

    fn handle(&mut self, request: LogRequest) {
        match request {
            LogRequest::Write { record } => self.write(record),
            LogRequest::Flush { reply } => {
                let _ = reply.send(self.flush());
            }
            LogRequest::First { reply } => {
                self.flush_before_query();
                let _ = reply.send(edge_record(&self.conn, "ASC"));
            }
            LogRequest::Last { reply } => {
                self.flush_before_query();
                let _ = reply.send(edge_record(&self.conn, "DESC"));
            }
            LogRequest::FetchPeriod {
                from,
                to,
                ascending,
                reply,
            } => {
                self.flush_before_query();
                let _ = reply.send(fetch_period(
                    &self.conn,
                    from,
                    to,
                    ascending,
                    self.config.fetch_window,
                ));
            }
            LogRequest::DeleteOldest { fraction, reply } => {
                self.flush_before_query();
                let _ = reply.send(delete_oldest(&self.conn, fraction));
            }
            LogRequest::DeleteAll { reply } => {
                let _ = reply.send(self.delete_all());
            }
            LogRequest::Count { reply } => {
                self.flush_before_query();
                let _ = reply.send(count(&self.conn));
            }
            LogRequest::SizeKb { reply } => {
                self.flush_before_query();
                let _ = reply.send(size_kb(&self.conn));
            }
            LogRequest::Trim {
                precomputed_size_kb,
                reply,
            } => {
                let result = self.trim(precomputed_size_kb);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::error!(store = STORE, error = %e, "scheduled trim failed");
                        }
                    }
                }
            }
            LogRequest::SetImmediate { enabled } => {
                if enabled != self.immediate {
                    tracing::debug!(store = STORE, enabled, "immediate-write mode changed");
                }
                self.immediate = enabled;
                if enabled {
                    self.flush_before_query();
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(store = STORE, error = %e, "final flush failed, buffered lines lost");
        }
    }
}

impl LogWorker {
    fn write(&mut self, record: LogRecord) {
        self.buffer.push(record);

        // Immediate writes do not count towards trim checks.
        if self.immediate {
            if let Err(e) = self.flush() {
                tracing::error!(store = STORE, error = %e, "immediate write failed");
            }
            return;
        }

        if self.buffer.len() >= self.config.batch_size {
            if let Err(e) = self.flush() {
                tracing::error!(store = STORE, error = %e, "batch flush failed");
            }
        }

        self.writes_since_trim_check += 1;
        if self.writes_since_trim_check >= self.config.writes_per_trim_check {
            self.writes_since_trim_check = 0;
            self.scheduler.schedule(LogRequest::Trim {
                precomputed_size_kb: None,
                reply: None,
            });
        }
    }

    /// Persists the buffer in one transaction.
    ///
    /// The buffer is emptied even when the save fails, so a broken store
    /// cannot make it grow without bound.
    fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let records = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.config.batch_size),
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO logs (timestamp_ms, message) VALUES (?1, ?2)")?;
            for record in &records {
                stmt.execute(params![record.timestamp.as_millis(), record.message])?;
            }
        }
        save(tx, STORE)?;

        Ok(records.len())
    }

    fn flush_before_query(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(store = STORE, error = %e, "flush before query failed");
        }
    }

    fn delete_all(&mut self) -> Result<usize> {
        let dropped = self.buffer.len();
        self.buffer.clear();

        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM logs", [])?;
        save(tx, STORE)?;

        tracing::debug!(store = STORE, removed, dropped, "log store wiped");
        Ok(removed)
    }

    fn trim(&mut self, precomputed_size_kb: Option<u64>) -> Result<TrimOutcome> {
        self.flush_before_query();
        let now = self.clock.now();
        let conn = &self.conn;
        self.policy.maybe_trim(
            now,
            precomputed_size_kb,
            || size_kb(conn),
            |fraction| delete_oldest(conn, fraction),
        )
    }
}

// =============================================================================
// Queries
// =============================================================================

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    let timestamp: i64 = row.get(0)?;
    let message: String = row.get(1)?;
    Ok(LogRecord::new(message, Timestamp::from_millis(timestamp)))
}

/// Oldest (`ASC`) or newest (`DESC`) record.
fn edge_record(conn: &Connection, order: &str) -> Result<Option<LogRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT timestamp_ms, message FROM logs ORDER BY timestamp_ms {order}, id {order} LIMIT 1"
    ))?;
    let mut rows = stmt.query_map([], record_row)?;
    Ok(rows.next().transpose()?)
}

/// All records with `from <= timestamp <= to`, loaded `window` rows at a time.
fn fetch_period(
    conn: &Connection,
    from: Timestamp,
    to: Timestamp,
    ascending: bool,
    window: usize,
) -> Result<Vec<LogRecord>> {
    if from > to {
        return Ok(Vec::new());
    }
    let window = window.max(1);

    // Keyset paging on (timestamp_ms, id): each page resumes after the last
    // row of the previous one.
    let sql = if ascending {
        "SELECT timestamp_ms, message, id FROM logs
         WHERE timestamp_ms BETWEEN ?1 AND ?2
           AND (timestamp_ms > ?3 OR (timestamp_ms = ?3 AND id > ?4))
         ORDER BY timestamp_ms ASC, id ASC LIMIT ?5"
    } else {
        "SELECT timestamp_ms, message, id FROM logs
         WHERE timestamp_ms BETWEEN ?1 AND ?2
           AND (timestamp_ms < ?3 OR (timestamp_ms = ?3 AND id < ?4))
         ORDER BY timestamp_ms DESC, id DESC LIMIT ?5"
    };
    let mut stmt = conn.prepare(sql)?;

    let mut cursor = if ascending {
        (i64::MIN, i64::MIN)
    } else {
        (i64::MAX, i64::MAX)
    };
    let mut records = Vec::new();

    loop {
        let page = stmt
            .query_map(
                params![
                    from.as_millis(),
                    to.as_millis(),
                    cursor.0,
                    cursor.1,
                    i64::try_from(window).unwrap_or(i64::MAX),
                ],
                |row| {
                    let id: i64 = row.get(2)?;
                    Ok((record_row(row)?, id))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let full = page.len() == window;
        for (record, id) in page {
            cursor = (record.timestamp.as_millis(), id);
            records.push(record);
        }
        if !full {
            break;
        }
    }

    Ok(records)
}

fn count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

/// Bytes in use (excluding free-list pages), in KB.
fn size_kb(conn: &Connection) -> Result<u64> {
    let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
    let free_pages: i64 = conn.pragma_query_value(None, "freelist_count", |row| row.get(0))?;
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

    let used = (page_count - free_pages).max(0) as u64;
    Ok(used * page_size.max(0) as u64 / 1024)
}

/// Deletes `max(1, round(count * fraction))` of the oldest records.
fn delete_oldest(conn: &Connection, fraction: f64) -> Result<usize> {
    let total = count(conn)?;
    if total == 0 {
        return Ok(0);
    }
    let to_delete = ((total as f64 * fraction).round() as usize).clamp(1, total);

    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute(
        "DELETE FROM logs WHERE id IN (
             SELECT id FROM logs ORDER BY timestamp_ms ASC, id ASC LIMIT ?1
         )",
        [i64::try_from(to_delete).unwrap_or(i64::MAX)],
    )?;
    save(tx, STORE)?;

    tracing::debug!(store = STORE, removed, fraction, "deleted oldest log lines");
    Ok(removed)
}

// =============================================================================
// Background Flush
// =============================================================================

/// Returns its grant to the host when dropped.
struct GrantGuard {
    host: Arc<dyn BackgroundTaskHost>,
    grant: Option<BackgroundGrant>,
}

impl Drop for GrantGuard {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            tracing::debug!(grant = %grant, "background task ended");
            self.host.end_background_task(grant);
        }
    }
}

fn flush_through(scheduler: &Scheduler<LogRequest>) -> Result<usize> {
    let (reply, answer) = mpsc::channel();
    if !scheduler.schedule(LogRequest::Flush { reply }) {
        return Err(Error::ContextClosed(STORE.to_string()));
    }
    answer
        .recv()
        .map_err(|_| Error::ContextClosed(STORE.to_string()))?
}

// =============================================================================
// Log Writer
// =============================================================================

/// A cloneable handle that only appends lines.
///
/// Handed to components (such as [`crate::LogStoreLayer`]) that must not own
/// the store.
#[derive(Clone)]
pub struct LogWriter {
    scheduler: Scheduler<LogRequest>,
}

impl LogWriter {
    /// Appends a line; see [`LogStore::create`].
    pub fn create(&self, message: impl Into<String>, timestamp: Timestamp) -> Result<()> {
        let accepted = self.scheduler.schedule(LogRequest::Write {
            record: LogRecord::new(message, timestamp),
        });
        if accepted {
            Ok(())
        } else {
            Err(Error::ContextClosed(STORE.to_string()))
        }
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

// =============================================================================
// Log Store
// =============================================================================

/// The diagnostic log store.
pub struct LogStore {
    context: ExecutionContext<LogRequest>,
    source: StoreSource,
    host: Arc<dyn BackgroundTaskHost>,
    flush_guard: RunGuard,
    outcome: Option<LoadOutcome>,
}

impl LogStore {
    /// Loads the store through `loader` and starts its context.
    pub fn open(
        loader: &StoreLoader,
        config: LogStoreConfig,
        clock: Arc<dyn Clock>,
        host: Arc<dyn BackgroundTaskHost>,
    ) -> Result<Self> {
        let LoadedStore { store, outcome } = loader.load()?;
        let mut log_store = Self::from_store(store, config, clock, host)?;
        log_store.outcome = Some(outcome);
        Ok(log_store)
    }

    /// Starts a log store on an already opened store.
    pub fn from_store(
        store: Store,
        config: LogStoreConfig,
        clock: Arc<dyn Clock>,
        host: Arc<dyn BackgroundTaskHost>,
    ) -> Result<Self> {
        if store.source().name() != LOG_STORE_SCHEMA.name {
            return Err(Error::Config(format!(
                "log store needs a '{}' store, got '{}'",
                LOG_STORE_SCHEMA.name,
                store.source().name()
            )));
        }

        let (conn, source) = store.into_parts();
        let policy = TrimPolicy::new(config.trim.clone());
        let batch_size = config.batch_size.max(1);

        let context = ExecutionContext::spawn_with(STORE, move |scheduler| LogWorker {
            conn,
            buffer: Vec::with_capacity(batch_size),
            config: LogStoreConfig {
                batch_size,
                writes_per_trim_check: config.writes_per_trim_check.max(1),
                ..config
            },
            immediate: false,
            writes_since_trim_check: 0,
            policy,
            clock,
            scheduler,
        })?;

        tracing::info!(store = STORE, in_memory = source.is_in_memory(), "log store ready");

        Ok(Self {
            context,
            source,
            host,
            flush_guard: RunGuard::new(),
            outcome: None,
        })
    }

    /// Appends a line. Returns before the line is persisted.
    pub fn create(&self, message: impl Into<String>, timestamp: Timestamp) -> Result<()> {
        self.context.submit(LogRequest::Write {
            record: LogRecord::new(message, timestamp),
        })
    }

    /// An append-only handle to this store.
    pub fn writer(&self) -> LogWriter {
        LogWriter {
            scheduler: self.context.scheduler(),
        }
    }

    /// Persists buffered lines now; returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        self.context.call(|reply| LogRequest::Flush { reply })
    }

    pub fn get_first_log(&self) -> Result<Option<LogRecord>> {
        self.context.call(|reply| LogRequest::First { reply })
    }

    pub fn get_last_log(&self) -> Result<Option<LogRecord>> {
        self.context.call(|reply| LogRequest::Last { reply })
    }

    /// Every line with `from <= timestamp <= to`.
    pub fn fetch_period(&self, from: Timestamp, to: Timestamp, ascending: bool) -> Result<Vec<LogRecord>> {
        self.context.call(|reply| LogRequest::FetchPeriod {
            from,
            to,
            ascending,
            reply,
        })
    }

    /// Deletes `max(1, round(count * fraction))` of the oldest lines.
    pub fn delete_oldest_logs(&self, fraction: f64) -> Result<usize> {
        self.context
            .call(|reply| LogRequest::DeleteOldest { fraction, reply })
    }

    /// Wipes every line, buffered ones included.
    pub fn delete_all(&self) -> Result<usize> {
        self.context.call(|reply| LogRequest::DeleteAll { reply })
    }

    pub fn count(&self) -> Result<usize> {
        self.context.call(|reply| LogRequest::Count { reply })
    }

    /// Space used by the store, free pages excluded.
    pub fn size_kb(&self) -> Result<u64> {
        self.context.call(|reply| LogRequest::SizeKb { reply })
    }

    /// Runs the trim policy now, measuring the store unless a size is given.
    pub fn maybe_trim(&self, precomputed_size_kb: Option<u64>) -> Result<TrimOutcome> {
        self.context.call(|reply| LogRequest::Trim {
            precomputed_size_kb,
            reply: Some(reply),
        })
    }

    /// Leaves immediate-write mode.
    pub fn did_enter_foreground(&self) -> Result<()> {
        self.context.submit(LogRequest::SetImmediate { enabled: false })
    }

    /// Secures buffered lines before the process may be suspended.
    ///
    /// With background time granted, a one-shot task flushes the buffer and
    /// then returns the grant; that task is returned. Otherwise the store
    /// switches to immediate-write mode and `None` is returned.
    pub fn did_enter_background(&self) -> Result<Option<OneShot<usize>>> {
        let Some(grant) = self.host.begin_background_task(BACKGROUND_FLUSH_TASK) else {
            tracing::debug!(store = STORE, "no background time, switching to immediate writes");
            self.context.submit(LogRequest::SetImmediate { enabled: true })?;
            return Ok(None);
        };

        let guard = GrantGuard {
            host: Arc::clone(&self.host),
            grant: Some(grant),
        };
        let Some(claim) = self.flush_guard.try_claim() else {
            tracing::debug!(store = STORE, "background flush already running");
            return Ok(None);
        };

        let scheduler = self.context.scheduler();
        let task = OneShot::spawn("logs-bg-flush", move || {
            let _claim = claim;
            let _guard = guard;
            flush_through(&scheduler)
        })?;
        Ok(Some(task))
    }

    pub fn is_in_memory(&self) -> bool {
        self.source.is_in_memory()
    }

    pub fn load_outcome(&self) -> Option<&LoadOutcome> {
        self.outcome.as_ref()
    }

    /// Stops the context; buffered lines are persisted first.
    pub fn shutdown(self) {
        self.context.shutdown();
    }
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("source", &self.source)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::migrate;

    fn seeded(timestamps: &[i64]) -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, &LOG_STORE_SCHEMA).unwrap();
        for (i, ts) in timestamps.iter().enumerate() {
            conn.execute(
                "INSERT INTO logs (timestamp_ms, message) VALUES (?1, ?2)",
                params![ts, format!("line {i}")],
            )
            .unwrap();
        }
        conn
    }

    fn messages(records: &[LogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.message.as_str()).collect()
    }

    #[test]
    fn test_fetch_period_pages_through_window() {
        let conn = seeded(&[10, 20, 20, 30, 40, 50, 60]);
        let from = Timestamp::from_millis(20);
        let to = Timestamp::from_millis(50);

        let asc = fetch_period(&conn, from, to, true, 2).unwrap();
        assert_eq!(messages(&asc), vec!["line 1", "line 2", "line 3", "line 4", "line 5"]);

        let desc = fetch_period(&conn, from, to, false, 2).unwrap();
        assert_eq!(messages(&desc), vec!["line 5", "line 4", "line 3", "line 2", "line 1"]);
    }

    #[test]
    fn test_fetch_period_empty_and_inverted_ranges() {
        let conn = seeded(&[10, 20]);
        assert!(fetch_period(&conn, Timestamp::from_millis(30), Timestamp::from_millis(40), true, 50)
            .unwrap()
            .is_empty());
        assert!(fetch_period(&conn, Timestamp::from_millis(20), Timestamp::from_millis(10), true, 50)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_delete_oldest_rounds_and_deletes_at_least_one() {
        let conn = seeded(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        assert_eq!(delete_oldest(&conn, 0.01).unwrap(), 1);
        assert_eq!(delete_oldest(&conn, 0.5).unwrap(), 5);
        assert_eq!(count(&conn).unwrap(), 4);

        let first = edge_record(&conn, "ASC").unwrap().unwrap();
        assert_eq!(first.timestamp, Timestamp::from_millis(7));
    }

    #[test]
    fn test_delete_oldest_on_empty_store() {
        let conn = seeded(&[]);
        assert_eq!(delete_oldest(&conn, 0.5).unwrap(), 0);
    }

    #[test]
    fn test_size_excludes_free_pages() {
        let conn = seeded(&[]);
        let big = "x".repeat(4096);
        for i in 0..200 {
            conn.execute(
                "INSERT INTO logs (timestamp_ms, message) VALUES (?1, ?2)",
                params![i, big],
            )
            .unwrap();
        }
        let full = size_kb(&conn).unwrap();
        conn.execute("DELETE FROM logs", []).unwrap();
        let after = size_kb(&conn).unwrap();

        assert!(full >= 800, "800KB of messages, got {full}");
        assert!(after < full / 10, "free pages still counted: {after}");
    }

    #[test]
    fn test_config_defaults() {
        let cfg: LogStoreConfig =
            serde_json::from_str(r#"{ "batch_size": 3, "trim": { "limit_kb": 64 } }"#).unwrap();
        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.fetch_window, DEFAULT_FETCH_WINDOW);
        assert_eq!(cfg.trim.limit_kb, 64);
        assert_eq!(cfg.trim.low_water_ratio, crate::trim::DEFAULT_LOW_WATER_RATIO);
    }
}
