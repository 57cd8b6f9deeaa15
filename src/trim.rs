//! # Log Store Trim Policy
//!
//! Keeps the log store under a byte budget without trimming on every write.
//!
//! ## Hysteresis
//!
//! Trimming starts only once the store is over `limit_kb`, and then removes
//! enough of the oldest records to land near the *low-water mark*
//! (`limit_kb * low_water_ratio`) rather than just under the limit:
//!
//! ```text
//!   size ▲
//!        │            ╱│           ╱│
//!  limit ┼──────────╱──┼─────────╱──┼────
//!        │        ╱    │       ╱    │
//!  low   ┼──────╱──────┼─────╱──────┼────
//!  water │    ╱        │   ╱        │
//!        │  ╱          │ ╱          │
//!        └─────────────┴────────────┴────► writes
//!                    trim         trim
//! ```
//!
//! The fraction to delete is `(size - target) / size`, clamped to
//! `[min_delete_fraction, max_delete_fraction]` so one pass never does too
//! little to matter or wipes most of the history.
//!
//! ## Cooldown
//!
//! After a successful trim, further trims are suppressed for `cooldown`.
//! `VACUUM` is never run, so the file size lags the deletes; the cooldown stops
//! the policy from chasing its own free pages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Timestamp;

/// Default byte budget of the log store, in KB.
pub const DEFAULT_LIMIT_KB: u64 = 10_240;
pub const DEFAULT_LOW_WATER_RATIO: f64 = 0.85;
pub const DEFAULT_MIN_DELETE_FRACTION: f64 = 0.05;
pub const DEFAULT_MAX_DELETE_FRACTION: f64 = 0.50;
pub const DEFAULT_TRIM_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrimPolicyConfig {
    pub limit_kb: u64,
    pub low_water_ratio: f64,
    pub min_delete_fraction: f64,
    pub max_delete_fraction: f64,
    pub cooldown: Duration,
}

impl Default for TrimPolicyConfig {
    fn default() -> Self {
        Self {
            limit_kb: DEFAULT_LIMIT_KB,
            low_water_ratio: DEFAULT_LOW_WATER_RATIO,
            min_delete_fraction: DEFAULT_MIN_DELETE_FRACTION,
            max_delete_fraction: DEFAULT_MAX_DELETE_FRACTION,
            cooldown: DEFAULT_TRIM_COOLDOWN,
        }
    }
}

/// What one [`TrimPolicy::maybe_trim`] call did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrimOutcome {
    /// A trim ran recently; the store was not even measured.
    CoolingDown { until: Timestamp },
    /// Nothing to do.
    UnderLimit { size_kb: u64 },
    /// `fraction` of the oldest records were deleted.
    Trimmed { fraction: f64, size_kb: u64 },
}

/// The trim decision plus its cooldown state.
#[derive(Debug, Clone)]
pub struct TrimPolicy {
    config: TrimPolicyConfig,
    cooldown_until: Option<Timestamp>,
}

impl TrimPolicy {
    pub fn new(config: TrimPolicyConfig) -> Self {
        Self {
            config,
            cooldown_until: None,
        }
    }

    pub fn config(&self) -> &TrimPolicyConfig {
        &self.config
    }

    /// End of the current cooldown, if one was ever started.
    pub fn cooldown_until(&self) -> Option<Timestamp> {
        self.cooldown_until
    }

    /// Fraction of records to delete at `size_kb`, or `None` when at or under
    /// the limit.
    pub fn compute_trim_fraction(&self, size_kb: u64) -> Option<f64> {
        let limit = self.config.limit_kb;
        if size_kb <= limit || size_kb == 0 {
            return None;
        }

        let size = size_kb as f64;
        let target = limit as f64 * self.config.low_water_ratio;
        let fraction = (size - target) / size;

        Some(fraction.clamp(
            self.config.min_delete_fraction,
            self.config.max_delete_fraction,
        ))
    }

    /// Runs one trim check.
    ///
    /// `precomputed_size_kb` skips `measure` when the caller already knows the
    /// size. `delete` receives the fraction of oldest records to remove. The
    /// cooldown starts only if `delete` succeeds; its error is returned as-is.
    pub fn maybe_trim<M, D>(
        &mut self,
        now: Timestamp,
        precomputed_size_kb: Option<u64>,
        measure: M,
        delete: D,
    ) -> Result<TrimOutcome>
    where
        M: FnOnce() -> Result<u64>,
        D: FnOnce(f64) -> Result<usize>,
    {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Ok(TrimOutcome::CoolingDown { until });
            }
        }

        let size_kb = match precomputed_size_kb {
            Some(size) => size,
            None => measure()?,
        };

        let Some(fraction) = self.compute_trim_fraction(size_kb) else {
            return Ok(TrimOutcome::UnderLimit { size_kb });
        };

        let removed = delete(fraction)?;
        self.cooldown_until = Some(now.saturating_add(self.config.cooldown));

        tracing::info!(
            size_kb,
            limit_kb = self.config.limit_kb,
            fraction,
            removed,
            "log store trimmed"
        );

        Ok(TrimOutcome::Trimmed { fraction, size_kb })
    }
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self::new(TrimPolicyConfig::default())
    }
}
