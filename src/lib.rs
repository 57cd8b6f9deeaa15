//! # pulsestore - Durable Storage for a Mobile Analytics SDK
//!
//! pulsestore keeps the data an analytics SDK must not lose, on SQLite:
//!
//! - **Guaranteed-delivery event queue**: outbound events wait until the
//!   server confirms them, bounded by count and by age
//! - **Size-bounded log store**: buffered diagnostic lines, trimmed with
//!   hysteresis to stay under a byte budget
//! - **Self-healing open**: a store that fails to open is salvaged, rebuilt,
//!   or replaced by an in-memory store for the session
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        StorageRuntime                           │
//! │             (owns both stores, routes host events)              │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │     EventQueueRepository      │ │           LogStore            │
//! │  "events" execution context   │ │   "logs" execution context    │
//! │  (thread, owns connection)    │ │  (thread, owns connection,    │
//! │                               │ │   buffer, trim policy)        │
//! └───────────────┬───────────────┘ └───────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          StoreLoader                            │
//! │     open + migrate │ salvage │ low-disk check │ destroy+retry   │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 ▼                                 ▼
//!          events.sqlite                       logs.sqlite
//!        (or in-memory)                      (or in-memory)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One queue per store**: every operation on a store runs on that
//!    store's execution context, in submission order
//! 2. **Unique keys**: a transaction id appears at most once in a queue
//! 3. **Bounded queue**: after clean-up, count <= capacity; queries never
//!    return events older than the event lifetime
//! 4. **Identity survives repair**: allow-listed metadata is carried into a
//!    rebuilt store
//! 5. **Always a store**: loading degrades to memory instead of failing
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum for all failure modes
//! - [`types`]: Domain types (Event, LogRecord, TransactionId, ...)
//! - [`clock`]: Time source, swappable in tests
//! - [`schema`]: SQLite DDL and migrations
//! - [`metadata`]: Typed store metadata and salvage
//! - [`loader`]: Opening, repairing and replacing stores
//! - [`context`]: Serial execution contexts and one-shot tasks
//! - [`changes`]: "Objects changed" notifications
//! - [`event_queue`]: The delivery queue
//! - [`trim`]: Log store trim policy
//! - [`log_store`]: The diagnostic log store
//! - [`lifecycle`]: Host lifecycle signals
//! - [`tracing_layer`]: `tracing` bridge into the log store
//! - [`runtime`]: Bootstrap object owning both stores

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for pulsestore operations.
pub mod error;

/// Domain types: events, log records, timestamps and identifiers.
///
/// Uses the newtype pattern so a transaction id cannot be confused with
/// any other string.
pub mod types;

/// Time source abstraction.
pub mod clock;

/// SQLite schema definitions and the migration runner.
///
/// Both stores are described as ordered migrations; the schema version lives
/// in `PRAGMA user_version`.
pub mod schema;

/// Identity metadata attached to a store, and its salvage allow-list.
pub mod metadata;

/// Store loading with recovery.
///
/// Opens the on-disk store, and when that fails salvages identity metadata,
/// checks free space, rebuilds the file or falls back to memory.
pub mod loader;

/// Serial execution contexts.
///
/// One dedicated thread per store processes request values in order.
/// One-shot contexts run background maintenance on their own connection.
pub mod context;

/// Change notifications over a broadcast channel.
pub mod changes;

/// The guaranteed-delivery event queue.
///
/// Key features:
/// - Capacity eviction (oldest first) and age expiry
/// - Retry-window query for the delivery pipeline
/// - Memory-pressure prune for in-memory stores
/// - Typed metadata accessors
pub mod event_queue;

/// Hysteresis and cooldown trim decision.
pub mod trim;

/// The size-bounded diagnostic log store.
///
/// Key features:
/// - Buffered writes flushed in batches
/// - Immediate-write mode while backgrounded without a grant
/// - Paged range queries
/// - Trim policy scheduled from the write path
pub mod log_store;

/// Host lifecycle signals and background-time grants.
pub mod lifecycle;

/// `tracing_subscriber` layer writing into the log store.
pub mod tracing_layer;

/// Explicit bootstrap object owning both stores.
pub mod runtime;

// =============================================================================
// Re-exports
// =============================================================================

pub use changes::{ChangeNotifier, EvictionReason, StoreChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ExecutionContext, OneShot, RunGuard};
pub use error::{Error, Result};
pub use event_queue::{EventQueueRepository, PruneTask, QueueConfig};
pub use lifecycle::{BackgroundGrant, BackgroundTaskHost, HostEvent, NoBackgroundTime};
pub use loader::{
    AppGroup, FallbackReason, LoadOutcome, LoadedStore, LoaderConfig, LocalVolume, Store,
    StoreKind, StoreLoader, StoreLocation, StoreSource, SynchronousMode, Volume,
};
pub use log_store::{LogStore, LogStoreConfig, LogWriter};
pub use metadata::{MetadataKey, StoreMetadata};
pub use runtime::{StorageConfig, StorageRuntime};
pub use schema::{Schema, EVENT_QUEUE_SCHEMA, LOG_STORE_SCHEMA};
pub use tracing_layer::LogStoreLayer;
pub use trim::{TrimOutcome, TrimPolicy, TrimPolicyConfig};
pub use types::{Event, EventType, LogRecord, Timestamp, TransactionId};
