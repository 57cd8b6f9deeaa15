//! # Domain Types for pulsestore
//!
//! This module defines the records the two stores hold: outbound analytics
//! [`Event`]s for the delivery queue and diagnostic [`LogRecord`]s for the log
//! store, plus the small newtypes they are built from.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! - [`TransactionId`] wraps the producer-assigned key so it cannot be mixed up
//!   with the event body or a log message
//! - [`Timestamp`] is milliseconds since the Unix epoch; every time value that
//!   reaches SQLite goes through it
//!
//! ## Invariants
//!
//! - A [`TransactionId`] is unique among the live events of one queue
//! - `Event::enqueued_at` never changes after creation

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Error;

// =============================================================================
// Time
// =============================================================================

/// A point in time, in milliseconds since the Unix epoch.
///
/// # Why Not `SystemTime`?
///
/// SQLite stores integers natively and compares them cheaply, so every
/// timestamp column is an `INTEGER` of milliseconds. Keeping the same
/// representation in memory means no conversions in query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    /// Creates a timestamp from raw milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// Returns the raw milliseconds.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Reads the system wall clock.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Returns this timestamp moved `d` into the past (saturating).
    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_ms(d)))
    }

    /// Returns this timestamp moved `d` into the future (saturating).
    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(duration_ms(d)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Event Identification
// =============================================================================

/// Producer-assigned unique key of a queued event.
///
/// The delivery pipeline uses it to stamp retries and to delete an event once
/// the server acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Creates a transaction id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Event Type
// =============================================================================

/// Kind of analytics event, persisted as a tagged string.
///
/// The tags are part of the on-disk format: renaming one orphans every queued
/// event of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First launch after install.
    Installed,
    /// Device or customer info changed.
    InfoUpdated,
    /// Periodic app-visit beacon.
    TrackVisit,
    /// Push notification reached the device.
    PushDelivered,
    /// User opened a push notification.
    PushClicked,
    /// Application-defined operation.
    CustomEvent,
    /// In-app message was shown.
    InAppViewed,
    /// In-app message was tapped.
    InAppClicked,
    /// In-app targeting check was performed.
    InAppTargeting,
    /// Diagnostic log export requested by the backend.
    SdkLogs,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 10] = [
        EventType::Installed,
        EventType::InfoUpdated,
        EventType::TrackVisit,
        EventType::PushDelivered,
        EventType::PushClicked,
        EventType::CustomEvent,
        EventType::InAppViewed,
        EventType::InAppClicked,
        EventType::InAppTargeting,
        EventType::SdkLogs,
    ];

    /// The tag stored in the `event_type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Installed => "installed",
            EventType::InfoUpdated => "infoUpdated",
            EventType::TrackVisit => "trackVisit",
            EventType::PushDelivered => "pushDelivered",
            EventType::PushClicked => "pushClicked",
            EventType::CustomEvent => "customEvent",
            EventType::InAppViewed => "inAppViewed",
            EventType::InAppClicked => "inAppClicked",
            EventType::InAppTargeting => "inAppTargeting",
            EventType::SdkLogs => "sdkLogs",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Decode(format!("unknown event type '{s}'")))
    }
}

// =============================================================================
// Event
// =============================================================================

/// One outbound analytics event waiting for confirmed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Unique key assigned by the producer.
    pub transaction_id: TransactionId,

    /// Kind of event.
    pub event_type: EventType,

    /// Opaque payload; the encoding belongs to the producer.
    pub body: Vec<u8>,

    /// When the event was created. Never changes.
    pub enqueued_at: Timestamp,

    /// When delivery was last attempted, if ever.
    pub retried_at: Option<Timestamp>,
}

impl Event {
    /// Creates a never-attempted event.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pulsestore::{Event, EventType, Timestamp};
    ///
    /// let event = Event::new("tx-1", EventType::TrackVisit, b"{}".to_vec(), Timestamp::now());
    /// assert!(event.retried_at.is_none());
    /// ```
    pub fn new(
        transaction_id: impl Into<TransactionId>,
        event_type: EventType,
        body: Vec<u8>,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            event_type,
            body,
            enqueued_at,
            retried_at: None,
        }
    }
}

// =============================================================================
// Log Record
// =============================================================================

/// One diagnostic log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Time of emission.
    pub timestamp: Timestamp,
    /// The line itself.
    pub message: String,
}

impl LogRecord {
    pub fn new(message: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
