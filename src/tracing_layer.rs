//! Bridge from `tracing` into the log store.
//!
//! [`LogStoreLayer`] turns each `tracing` event into one line
//! (`LEVEL target: message key=value ...`) and appends it through a
//! [`LogWriter`]. Install it next to whatever other layers the host uses:
//!
//! ```rust,ignore
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! let layer = LogStoreLayer::new(log_store.writer(), clock).with_min_level(Level::INFO);
//! let subscriber = tracing_subscriber::registry().with(layer);
//! tracing::subscriber::set_global_default(subscriber)?;
//! ```
//!
//! Events from the log store's own modules are never recorded: a failing flush
//! would otherwise log about itself into the store that is failing.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::clock::Clock;
use crate::log_store::LogWriter;

/// Targets whose events are dropped.
const SKIPPED_TARGETS: [&str; 2] = ["pulsestore::log_store", "pulsestore::context"];

/// A `tracing_subscriber` layer persisting events into a log store.
pub struct LogStoreLayer {
    writer: LogWriter,
    clock: Arc<dyn Clock>,
    min_level: Level,
}

impl LogStoreLayer {
    /// Records `INFO` and more severe events.
    pub fn new(writer: LogWriter, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer,
            clock,
            min_level: Level::INFO,
        }
    }

    /// Least severe level still recorded.
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

impl fmt::Debug for LogStoreLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStoreLayer")
            .field("min_level", &self.min_level)
            .finish_non_exhaustive()
    }
}

struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// `LEVEL target: message key=value ...`
fn format_line(event: &Event<'_>) -> String {
    let mut visitor = LineVisitor {
        message: String::new(),
        fields: String::new(),
    };
    event.record(&mut visitor);

    let meta = event.metadata();
    format!(
        "{} {}: {}{}",
        meta.level(),
        meta.target(),
        visitor.message,
        visitor.fields
    )
}

impl<S: Subscriber> Layer<S> for LogStoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // More verbose levels compare greater.
        if *meta.level() > self.min_level {
            return;
        }
        if SKIPPED_TARGETS.iter().any(|t| meta.target().starts_with(t)) {
            return;
        }

        // A closed store has nowhere to report to.
        let _ = self.writer.create(format_line(event), self.clock.now());
    }
}
