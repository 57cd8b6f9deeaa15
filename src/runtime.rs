//! # Storage Runtime
//!
//! One explicitly constructed object owns both stores for the life of the SDK.
//! There is no global instance: the host creates a [`StorageRuntime`], routes
//! lifecycle signals into it, and shuts it down.
//!
//! ```text
//!   StorageConfig ──► StorageRuntime::start
//!                        ├── StoreLoader(events.sqlite) ──► EventQueueRepository
//!                        └── StoreLoader(logs.sqlite)   ──► LogStore
//!
//!   HostEvent::MemoryWarning      ──► queue.handle_memory_warning()
//!   HostEvent::EnteredForeground  ──► logs.did_enter_foreground()
//!   HostEvent::EnteredBackground  ──► logs.did_enter_background()
//! ```
//!
//! Each store recovers independently: a corrupt log store never keeps the
//! event queue from opening, and vice versa.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::context::OneShot;
use crate::error::Result;
use crate::event_queue::{EventQueueRepository, QueueConfig};
use crate::lifecycle::{BackgroundTaskHost, HostEvent};
use crate::loader::{
    LoaderConfig, LocalVolume, StoreLoader, StoreLocation, SynchronousMode, Volume,
    DEFAULT_BUSY_TIMEOUT, DEFAULT_MIN_FREE_SPACE_BYTES,
};
use crate::log_store::{LogStore, LogStoreConfig};
use crate::schema::{EVENT_QUEUE_SCHEMA, LOG_STORE_SCHEMA};

pub const DEFAULT_EVENTS_FILE: &str = "events.sqlite";
pub const DEFAULT_LOGS_FILE: &str = "logs.sqlite";

/// Everything needed to start both stores.
///
/// Every field has a default, so a host can load a partial JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Shared by both stores unless it is an explicit file path.
    pub location: StoreLocation,
    pub events_file: String,
    pub logs_file: String,
    pub min_free_space_bytes: u64,
    pub synchronous: SynchronousMode,
    pub busy_timeout: Duration,
    pub verify_integrity: bool,
    pub queue: QueueConfig,
    pub log_store: LogStoreConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: StoreLocation::default(),
            events_file: DEFAULT_EVENTS_FILE.to_string(),
            logs_file: DEFAULT_LOGS_FILE.to_string(),
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            synchronous: SynchronousMode::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            verify_integrity: true,
            queue: QueueConfig::default(),
            log_store: LogStoreConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Both stores in `dir`, everything else default.
    pub fn in_dir(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            location: StoreLocation::in_dir(dir),
            ..Self::default()
        }
    }

    fn loader_config(&self, file_name: &str) -> LoaderConfig {
        LoaderConfig {
            file_name: file_name.to_string(),
            location: self.location.clone(),
            min_free_space_bytes: self.min_free_space_bytes,
            synchronous: self.synchronous,
            busy_timeout: self.busy_timeout,
            verify_integrity: self.verify_integrity,
        }
    }

    pub fn events_loader_config(&self) -> LoaderConfig {
        self.loader_config(&self.events_file)
    }

    pub fn logs_loader_config(&self) -> LoaderConfig {
        self.loader_config(&self.logs_file)
    }
}

/// Owner of the event queue and the log store.
#[derive(Debug)]
pub struct StorageRuntime {
    events: EventQueueRepository,
    logs: LogStore,
}

impl StorageRuntime {
    /// Opens both stores on the local filesystem.
    pub fn start(
        config: StorageConfig,
        clock: Arc<dyn Clock>,
        host: Arc<dyn BackgroundTaskHost>,
    ) -> Result<Self> {
        Self::start_with_volume(config, clock, host, Arc::new(LocalVolume))
    }

    /// Opens both stores on a custom [`Volume`].
    pub fn start_with_volume(
        config: StorageConfig,
        clock: Arc<dyn Clock>,
        host: Arc<dyn BackgroundTaskHost>,
        volume: Arc<dyn Volume>,
    ) -> Result<Self> {
        let events_loader = StoreLoader::with_volume(
            config.events_loader_config(),
            &EVENT_QUEUE_SCHEMA,
            Arc::clone(&volume),
        )?;
        let logs_loader =
            StoreLoader::with_volume(config.logs_loader_config(), &LOG_STORE_SCHEMA, volume)?;

        let events = EventQueueRepository::open(&events_loader, config.queue, Arc::clone(&clock))?;
        let logs = LogStore::open(&logs_loader, config.log_store, clock, host)?;

        tracing::info!(
            events_in_memory = events.is_in_memory(),
            logs_in_memory = logs.is_in_memory(),
            "storage runtime started"
        );

        Ok(Self { events, logs })
    }

    pub fn events(&self) -> &EventQueueRepository {
        &self.events
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// Routes a lifecycle signal to the store that cares about it.
    ///
    /// Returns the background task the signal started, if any (memory prune or
    /// background flush); dropping it lets the task run detached.
    pub fn handle_host_event(&self, event: HostEvent) -> Result<Option<OneShot<usize>>> {
        tracing::debug!(?event, "host event");
        match event {
            HostEvent::MemoryWarning => Ok(self.events.handle_memory_warning()),
            HostEvent::EnteredForeground => {
                self.logs.did_enter_foreground()?;
                Ok(None)
            }
            HostEvent::EnteredBackground => self.logs.did_enter_background(),
        }
    }

    /// Flushes the log store and stops both contexts.
    pub fn shutdown(self) {
        if let Err(e) = self.logs.flush() {
            tracing::error!(error = %e, "final log flush failed");
        }
        self.logs.shutdown();
        self.events.shutdown();
        tracing::info!("storage runtime stopped");
    }
}
