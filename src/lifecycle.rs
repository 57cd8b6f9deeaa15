//! Host application lifecycle.
//!
//! The stores react to a few OS signals. The host translates its platform
//! callbacks into [`HostEvent`]s, and lends background execution time through
//! [`BackgroundTaskHost`].

use std::fmt;

/// A platform lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    MemoryWarning,
    EnteredForeground,
    EnteredBackground,
}

/// Proof that the OS granted extra execution time after backgrounding.
///
/// Must be handed back through [`BackgroundTaskHost::end_background_task`].
#[derive(Debug, PartialEq, Eq)]
pub struct BackgroundGrant {
    id: u64,
    name: String,
}

impl BackgroundGrant {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for BackgroundGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Grants and releases background execution time.
pub trait BackgroundTaskHost: Send + Sync {
    /// Asks for background time; `None` when the OS refuses.
    fn begin_background_task(&self, name: &str) -> Option<BackgroundGrant>;

    /// Returns a grant obtained from `begin_background_task`.
    fn end_background_task(&self, grant: BackgroundGrant);
}

/// A host that never grants background time (tests, command-line tools).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackgroundTime;

impl BackgroundTaskHost for NoBackgroundTime {
    fn begin_background_task(&self, _name: &str) -> Option<BackgroundGrant> {
        None
    }

    fn end_background_task(&self, _grant: BackgroundGrant) {}
}
