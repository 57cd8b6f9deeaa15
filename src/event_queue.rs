//! # Guaranteed-Delivery Event Queue
//!
//! Outbound analytics events wait here until the server confirms them. The
//! queue survives process death (on-disk store) or at least the session
//! (in-memory fallback), and keeps itself bounded in two dimensions:
//!
//! | Bound | Enforced by | When |
//! |-------|-------------|------|
//! | count <= `capacity` | `clean_up` (oldest first) | after every `count_events()` |
//! | age <= `event_lifetime` | `remove_deprecated_events_if_needed()` | lifecycle hooks |
//!
//! ## Threading
//!
//! ```text
//!  producers ──create──┐
//!  delivery  ──query───┤        ┌──────────────────────────┐
//!            ──update──┼──────► │ "events" context         │──► primary connection
//!            ──delete──┘        │ QueueWorker              │
//!                               └──────────────────────────┘
//!  memory warning ─────────────► OneShot "events-prune"  ─┐
//!  lifecycle hook ─────────────► OneShot "events-expiry" ─┴─► MaintenanceRoute
//! ```
//!
//! Every value-returning operation is a blocking call into the queue's
//! context. Operations on one queue never interleave.
//!
//! ## Maintenance Routing
//!
//! | Store | Maintenance runs on |
//! |-------|---------------------|
//! | on disk | its own WAL connection, next to the queue |
//! | in memory | the queue's context, as a [`QueueRequest::Maintenance`] |
//!
//! In-memory stores live in SQLite's shared cache, where a writer locks the
//! whole table and a second connection fails with `SQLITE_LOCKED` instead of
//! waiting. The one-shot thread still does the waiting, so callers of
//! `handle_memory_warning` are never blocked.
//!
//! ## Retry Window
//!
//! `query(limit, deadline)` skips events whose last delivery attempt is more
//! recent than `deadline`. An event attempted at `t` is excluded while
//! `now - t < deadline` and becomes eligible again at `now - t >= deadline`.
//!
//! ## Change Notifications
//!
//! Every mutation that changed rows is broadcast as a [`StoreChange`] after it
//! was saved. See [`crate::changes`].

use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::changes::{ChangeNotifier, EvictionReason, StoreChange};
use crate::clock::Clock;
use crate::context::{save, ExecutionContext, OneShot, Reply, RunGuard, Scheduler, Worker};
use crate::error::{Error, Result};
use crate::loader::{LoadOutcome, LoadedStore, Store, StoreLoader, StoreSource};
use crate::metadata::{self, MetadataKey, StoreMetadata};
use crate::schema::EVENT_QUEUE_SCHEMA;
use crate::types::{Event, EventType, Timestamp, TransactionId};

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum number of live events.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default age after which an event is deprecated (about six months).
pub const DEFAULT_EVENT_LIFETIME: Duration = Duration::from_secs(183 * 24 * 60 * 60);

/// Default number of ids per bulk `DELETE`.
///
/// Stays well under SQLite's bound-parameter limit.
pub const DEFAULT_ERASE_CHUNK_SIZE: usize = 500;

/// Limits of one event queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub event_lifetime: Duration,
    pub erase_chunk_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            event_lifetime: DEFAULT_EVENT_LIFETIME,
            erase_chunk_size: DEFAULT_ERASE_CHUNK_SIZE,
        }
    }
}

/// Context and thread-name prefix of this store.
const STORE: &str = "events";

const SELECT_EVENT: &str =
    "SELECT transaction_id, event_type, body, enqueued_ms, retry_ms FROM events";

/// A memory-pressure prune running in the background; joins to the number
/// of records removed.
pub type PruneTask = OneShot<usize>;

// =============================================================================
// Requests
// =============================================================================

/// Units of work understood by the queue's context.
pub enum QueueRequest {
    Create {
        event: Event,
        reply: Reply<()>,
    },
    Read {
        transaction_id: TransactionId,
        reply: Reply<Option<Event>>,
    },
    /// Stamp a delivery attempt.
    Update {
        transaction_id: TransactionId,
        reply: Reply<bool>,
    },
    Delete {
        transaction_id: TransactionId,
        reply: Reply<bool>,
    },
    Query {
        fetch_limit: usize,
        retry_deadline: Duration,
        reply: Reply<Vec<Event>>,
    },
    Count {
        reply: Reply<usize>,
    },
    /// Capacity eviction, scheduled by `Count`.
    CleanUp,
    Erase {
        reply: Reply<usize>,
    },
    ReadMetadata {
        reply: Reply<StoreMetadata>,
    },
    WriteMetadata {
        key: MetadataKey,
        value: Option<String>,
        reply: Reply<()>,
    },
    /// Background maintenance of an in-memory store.
    Maintenance {
        job: Maintenance,
        reply: Reply<usize>,
    },
}

/// Bulk jobs started from one-shot contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    /// Delete every event enqueued before `cutoff`.
    Expire { cutoff: Timestamp },
    /// Count events enqueued before `cutoff`.
    CountExpired { cutoff: Timestamp },
    /// Delete every event, `chunk_size` ids per statement.
    Prune { chunk_size: usize },
}

impl Maintenance {
    fn run(self, conn: &mut Connection, changes: &ChangeNotifier) -> Result<usize> {
        match self {
            Maintenance::Expire { cutoff } => remove_older_than(conn, cutoff, changes),
            Maintenance::CountExpired { cutoff } => count_older_than(conn, cutoff),
            Maintenance::Prune { chunk_size } => prune_all(conn, chunk_size, changes),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct QueueWorker {
    conn: Connection,
    in_memory: bool,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    changes: ChangeNotifier,
    scheduler: Scheduler<QueueRequest>,
}

impl Worker for QueueWorker {
    type Request = QueueRequest;

    fn handle(&mut self, request: QueueRequest) {
        match request {
            QueueRequest::Create { event, reply } => {
                let _ = reply.send(self.create(event));
            }
            QueueRequest::Read {
                transaction_id,
                reply,
            } => {
                let _ = reply.send(self.read(&transaction_id));
            }
            QueueRequest::Update {
                transaction_id,
                reply,
            } => {
                let _ = reply.send(self.update(transaction_id));
            }
            QueueRequest::Delete {
                transaction_id,
                reply,
            } => {
                let _ = reply.send(self.delete(transaction_id));
            }
            QueueRequest::Query {
                fetch_limit,
                retry_deadline,
                reply,
            } => {
                let _ = reply.send(self.query(fetch_limit, retry_deadline));
            }
            QueueRequest::Count { reply } => {
                let result = self.count();
                if matches!(result, Ok(n) if n > self.config.capacity) {
                    // Queued before the reply goes out, so the caller's next
                    // request already sees the evicted queue.
                    self.scheduler.schedule(QueueRequest::CleanUp);
                }
                let _ = reply.send(result);
            }
            QueueRequest::CleanUp => {
                if let Err(e) = self.clean_up() {
                    tracing::error!(store = STORE, error = %e, "capacity clean-up failed");
                }
            }
            QueueRequest::Erase { reply } => {
                let _ = reply.send(self.erase());
            }
            QueueRequest::ReadMetadata { reply } => {
                let _ = reply.send(StoreMetadata::read(&self.conn));
            }
            QueueRequest::WriteMetadata { key, value, reply } => {
                let _ = reply.send(self.write_metadata(key, value.as_deref()));
            }
            QueueRequest::Maintenance { job, reply } => {
                let _ = reply.send(job.run(&mut self.conn, &self.changes));
            }
        }
    }
}

impl QueueWorker {
    fn create(&mut self, event: Event) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO events (transaction_id, event_type, body, enqueued_ms, retry_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.transaction_id.as_str(),
                event.event_type.as_str(),
                event.body,
                event.enqueued_at.as_millis(),
                event.retried_at.map(Timestamp::as_millis),
            ],
        )
        .map_err(|e| Error::from_insert(e, event.transaction_id.as_str()))?;
        save(tx, STORE)?;

        tracing::debug!(store = STORE, transaction_id = %event.transaction_id, event_type = %event.event_type, "event enqueued");
        self.changes.notify(StoreChange::Inserted {
            transaction_id: event.transaction_id,
        });
        Ok(())
    }

    fn read(&self, transaction_id: &TransactionId) -> Result<Option<Event>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_EVENT} WHERE transaction_id = ?1"),
                [transaction_id.as_str()],
                event_row,
            )
            .optional()?;
        row.map(event_from_row).transpose()
    }

    fn update(&mut self, transaction_id: TransactionId) -> Result<bool> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE events SET retry_ms = ?1 WHERE transaction_id = ?2",
            params![now.as_millis(), transaction_id.as_str()],
        )?;
        if changed == 0 {
            tracing::warn!(store = STORE, transaction_id = %transaction_id, "update of unknown event ignored");
            return Ok(false);
        }
        save(tx, STORE)?;

        self.changes.notify(StoreChange::Updated { transaction_id });
        Ok(true)
    }

    fn delete(&mut self, transaction_id: TransactionId) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "DELETE FROM events WHERE transaction_id = ?1",
            [transaction_id.as_str()],
        )?;
        if changed == 0 {
            tracing::warn!(store = STORE, transaction_id = %transaction_id, "delete of unknown event ignored");
            return Ok(false);
        }
        save(tx, STORE)?;

        self.changes.notify(StoreChange::Deleted {
            transaction_ids: vec![transaction_id],
        });
        Ok(true)
    }

    fn query(&self, fetch_limit: usize, retry_deadline: Duration) -> Result<Vec<Event>> {
        let now = self.clock.now();
        let life_limit = now.saturating_sub(self.config.event_lifetime);
        let retry_limit = now.saturating_sub(retry_deadline);

        // Rows with a tag this build cannot decode never take a slot in the
        // page; they stay until age expiry removes them.
        let mut stmt = self.conn.prepare_cached(&format!(
            "{SELECT_EVENT}
             WHERE enqueued_ms >= ?1 AND (retry_ms IS NULL OR retry_ms <= ?2)
               AND event_type IN ({})
             ORDER BY enqueued_ms ASC, id ASC
             LIMIT ?3",
            known_event_types()
        ))?;
        let rows = stmt
            .query_map(
                params![
                    life_limit.as_millis(),
                    retry_limit.as_millis(),
                    i64::try_from(fetch_limit).unwrap_or(i64::MAX),
                ],
                event_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match event_from_row(row) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(store = STORE, error = %e, "undecodable event skipped");
                    None
                }
            })
            .collect())
    }

    fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    fn clean_up(&mut self) -> Result<usize> {
        let count = self.count()?;
        if count <= self.config.capacity {
            return Ok(0);
        }
        let excess = count - self.config.capacity;

        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM events WHERE id IN (
                 SELECT id FROM events ORDER BY enqueued_ms ASC, id ASC LIMIT ?1
             )",
            [i64::try_from(excess).unwrap_or(i64::MAX)],
        )?;
        save(tx, STORE)?;

        tracing::info!(
            store = STORE,
            removed,
            capacity = self.config.capacity,
            "evicted oldest events over capacity"
        );
        self.changes.evicted(removed, EvictionReason::Capacity);
        Ok(removed)
    }

    fn erase(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for key in MetadataKey::ALL {
            metadata::write_raw(&tx, key, None)?;
        }

        if self.in_memory {
            let removed = tx.execute("DELETE FROM events", [])?;
            save(tx, STORE)?;
            tracing::info!(store = STORE, removed, "in-memory queue erased");
            self.changes.evicted(removed, EvictionReason::Erased);
            return Ok(removed);
        }

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, transaction_id FROM events ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let removed = delete_ids(&tx, &ids, self.config.erase_chunk_size)?;
        save(tx, STORE)?;

        tracing::info!(store = STORE, removed, "queue erased");
        if removed > 0 {
            self.changes.notify(StoreChange::Deleted {
                transaction_ids: rows
                    .into_iter()
                    .map(|(_, id)| TransactionId::new(id))
                    .collect(),
            });
        }
        Ok(removed)
    }

    fn write_metadata(&mut self, key: MetadataKey, value: Option<&str>) -> Result<()> {
        let tx = self.conn.transaction()?;
        metadata::write_raw(&tx, key, value)?;
        save(tx, STORE)
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

type EventRow = (String, String, Vec<u8>, i64, Option<i64>);

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn event_from_row((transaction_id, event_type, body, enqueued_ms, retry_ms): EventRow) -> Result<Event> {
    Ok(Event {
        transaction_id: TransactionId::new(transaction_id),
        event_type: EventType::from_str(&event_type)?,
        body,
        enqueued_at: Timestamp::from_millis(enqueued_ms),
        retried_at: retry_ms.map(Timestamp::from_millis),
    })
}

/// `'installed','infoUpdated',...` for an SQL `IN` list.
fn known_event_types() -> String {
    EventType::ALL
        .iter()
        .map(|t| format!("'{}'", t.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Deletes rows by primary key, `chunk_size` ids per statement.
fn delete_ids(conn: &Connection, ids: &[i64], chunk_size: usize) -> Result<usize> {
    let mut removed = 0;
    for chunk in ids.chunks(chunk_size.max(1)) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        removed += conn.execute(
            &format!("DELETE FROM events WHERE id IN ({placeholders})"),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(removed)
}

// =============================================================================
// Background Maintenance
// =============================================================================

fn count_older_than(conn: &Connection, cutoff: Timestamp) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE enqueued_ms < ?1",
        [cutoff.as_millis()],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

fn remove_older_than(conn: &mut Connection, cutoff: Timestamp, changes: &ChangeNotifier) -> Result<usize> {
    if count_older_than(conn, cutoff)? == 0 {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM events WHERE enqueued_ms < ?1",
        [cutoff.as_millis()],
    )?;
    save(tx, STORE)?;

    tracing::info!(store = STORE, removed, cutoff = %cutoff, "removed deprecated events");
    changes.evicted(removed, EvictionReason::Expired);
    Ok(removed)
}

/// Drops every record. Only ids are loaded, never bodies.
fn prune_all(conn: &mut Connection, chunk_size: usize, changes: &ChangeNotifier) -> Result<usize> {
    let tx = conn.transaction()?;
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM events")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };
    let removed = delete_ids(&tx, &ids, chunk_size)?;
    save(tx, STORE)?;

    tracing::warn!(store = STORE, removed, "memory warning: in-memory queue pruned");
    changes.evicted(removed, EvictionReason::MemoryPressure);
    Ok(removed)
}

/// Where a one-shot context runs its [`Maintenance`] job.
#[derive(Clone)]
enum MaintenanceRoute {
    /// A secondary connection of an on-disk store.
    Connection(StoreSource),
    /// The queue's own context; shared-cache stores lock whole tables.
    Queue(Scheduler<QueueRequest>),
}

impl MaintenanceRoute {
    fn run(&self, job: Maintenance, changes: &ChangeNotifier) -> Result<usize> {
        match self {
            MaintenanceRoute::Connection(source) => {
                let mut conn = source.connect()?;
                job.run(&mut conn, changes)
            }
            MaintenanceRoute::Queue(scheduler) => {
                let (reply, answer) = mpsc::channel();
                if !scheduler.schedule(QueueRequest::Maintenance { job, reply }) {
                    return Err(Error::ContextClosed(STORE.to_string()));
                }
                answer
                    .recv()
                    .map_err(|_| Error::ContextClosed(STORE.to_string()))?
            }
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// The event queue.
///
/// Dropping the repository stops its context after queued work has run.
pub struct EventQueueRepository {
    context: ExecutionContext<QueueRequest>,
    source: StoreSource,
    maintenance: MaintenanceRoute,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    changes: ChangeNotifier,
    prune_guard: RunGuard,
    outcome: Option<LoadOutcome>,
}

impl EventQueueRepository {
    /// Loads the store through `loader` (recovering if needed) and starts the
    /// queue's context.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `loader` is not set up for the event schema
    /// - whatever [`StoreLoader::load`] cannot recover from
    pub fn open(loader: &StoreLoader, config: QueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let LoadedStore { store, outcome } = loader.load()?;
        let mut repo = Self::from_store(store, config, clock)?;
        repo.outcome = Some(outcome);
        Ok(repo)
    }

    /// Starts a queue on an already opened store.
    pub fn from_store(store: Store, config: QueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if store.source().name() != EVENT_QUEUE_SCHEMA.name {
            return Err(Error::Config(format!(
                "event queue needs an '{}' store, got '{}'",
                EVENT_QUEUE_SCHEMA.name,
                store.source().name()
            )));
        }

        let (conn, source) = store.into_parts();
        let changes = ChangeNotifier::default();
        let in_memory = source.is_in_memory();

        let worker_config = config.clone();
        let worker_clock = Arc::clone(&clock);
        let worker_changes = changes.clone();
        let context = ExecutionContext::spawn_with(STORE, move |scheduler| QueueWorker {
            conn,
            in_memory,
            config: worker_config,
            clock: worker_clock,
            changes: worker_changes,
            scheduler,
        })?;

        tracing::info!(store = STORE, in_memory, capacity = config.capacity, "event queue ready");

        let maintenance = if in_memory {
            MaintenanceRoute::Queue(context.scheduler())
        } else {
            MaintenanceRoute::Connection(source.clone())
        };

        Ok(Self {
            context,
            source,
            maintenance,
            config,
            clock,
            changes,
            prune_guard: RunGuard::new(),
            outcome: None,
        })
    }

    /// Inserts a new event.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateKey`] if an event with the same transaction id is queued.
    pub fn create(&self, event: Event) -> Result<()> {
        self.context.call(|reply| QueueRequest::Create { event, reply })
    }

    pub fn read(&self, transaction_id: &TransactionId) -> Result<Option<Event>> {
        let transaction_id = transaction_id.clone();
        self.context.call(|reply| QueueRequest::Read {
            transaction_id,
            reply,
        })
    }

    /// Stamps a delivery attempt on `event` at the current time.
    ///
    /// An unknown event is logged and ignored.
    pub fn update(&self, event: &Event) -> Result<()> {
        let transaction_id = event.transaction_id.clone();
        self.context
            .call(|reply| QueueRequest::Update {
                transaction_id,
                reply,
            })
            .map(|_| ())
    }

    /// Removes a delivered event. An unknown event is logged and ignored.
    pub fn delete(&self, event: &Event) -> Result<()> {
        let transaction_id = event.transaction_id.clone();
        self.context
            .call(|reply| QueueRequest::Delete {
                transaction_id,
                reply,
            })
            .map(|_| ())
    }

    /// Up to `fetch_limit` deliverable events, oldest first.
    ///
    /// Deprecated events and events attempted less than `retry_deadline` ago
    /// are skipped, as are events whose stored type this build does not know.
    pub fn query(&self, fetch_limit: usize, retry_deadline: Duration) -> Result<Vec<Event>> {
        self.context.call(|reply| QueueRequest::Query {
            fetch_limit,
            retry_deadline,
            reply,
        })
    }

    /// Number of live events.
    ///
    /// If the count is over capacity, the oldest surplus is evicted right after
    /// this call returns, so the returned value may still include it.
    pub fn count_events(&self) -> Result<usize> {
        self.context.call(|reply| QueueRequest::Count { reply })
    }

    /// Deletes every event older than the event lifetime.
    ///
    /// Runs on a one-shot background context and waits for it.
    pub fn remove_deprecated_events_if_needed(&self) -> Result<usize> {
        self.run_maintenance("events-expiry", Maintenance::Expire {
            cutoff: self.life_limit_date(),
        })
    }

    /// Number of events older than the event lifetime.
    pub fn count_deprecated_events(&self) -> Result<usize> {
        self.run_maintenance("events-expiry-count", Maintenance::CountExpired {
            cutoff: self.life_limit_date(),
        })
    }

    /// Deletes every event and clears the identity metadata.
    ///
    /// Returns the number of events removed.
    pub fn erase(&self) -> Result<usize> {
        self.context.call(|reply| QueueRequest::Erase { reply })
    }

    /// Reacts to an OS memory warning.
    ///
    /// An in-memory queue drops every record on a background context; the
    /// returned task can be joined for the count. On-disk queues ignore the
    /// signal, and a prune already in flight is not doubled: both return `None`.
    pub fn handle_memory_warning(&self) -> Option<PruneTask> {
        if !self.is_in_memory() {
            tracing::debug!(store = STORE, "memory warning ignored by on-disk queue");
            return None;
        }
        let Some(claim) = self.prune_guard.try_claim() else {
            tracing::debug!(store = STORE, "memory prune already running");
            return None;
        };

        let route = self.maintenance.clone();
        let changes = self.changes.clone();
        let job = Maintenance::Prune {
            chunk_size: self.config.erase_chunk_size,
        };
        match OneShot::spawn("events-prune", move || {
            let _claim = claim;
            route.run(job, &changes)
        }) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::error!(store = STORE, error = %e, "could not start memory prune");
                None
            }
        }
    }

    /// Receives a [`StoreChange`] for every committed mutation from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn is_in_memory(&self) -> bool {
        self.source.is_in_memory()
    }

    /// How the store was obtained, if it was loaded through [`Self::open`].
    pub fn load_outcome(&self) -> Option<&LoadOutcome> {
        self.outcome.as_ref()
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    pub fn metadata(&self) -> Result<StoreMetadata> {
        self.context.call(|reply| QueueRequest::ReadMetadata { reply })
    }

    pub fn install_version(&self) -> Result<Option<i64>> {
        Ok(self.metadata()?.install_version)
    }

    pub fn set_install_version(&self, version: Option<i64>) -> Result<()> {
        self.write_metadata(MetadataKey::InstallVersion, version.map(|v| v.to_string()))
    }

    pub fn info_update_version(&self) -> Result<Option<i64>> {
        Ok(self.metadata()?.info_update_version)
    }

    pub fn set_info_update_version(&self, version: Option<i64>) -> Result<()> {
        self.write_metadata(MetadataKey::InfoUpdateVersion, version.map(|v| v.to_string()))
    }

    pub fn instance_id(&self) -> Result<Option<String>> {
        Ok(self.metadata()?.instance_id)
    }

    pub fn set_instance_id(&self, id: Option<String>) -> Result<()> {
        self.write_metadata(MetadataKey::InstanceId, id)
    }

    /// Stops the context after queued work.
    pub fn shutdown(self) {
        self.context.shutdown();
    }

    fn write_metadata(&self, key: MetadataKey, value: Option<String>) -> Result<()> {
        self.context
            .call(|reply| QueueRequest::WriteMetadata { key, value, reply })
    }

    fn run_maintenance(&self, name: &str, job: Maintenance) -> Result<usize> {
        let route = self.maintenance.clone();
        let changes = self.changes.clone();
        OneShot::spawn(name, move || route.run(job, &changes))?.join()
    }

    fn life_limit_date(&self) -> Timestamp {
        self.clock.now().saturating_sub(self.config.event_lifetime)
    }
}

impl std::fmt::Debug for EventQueueRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueueRepository")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
