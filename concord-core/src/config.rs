//! Conflict resolution configuration.
//!
//! Thresholds and timings used by the resolvers, the stream store and the
//! deferred worker, loadable from any serde format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Conflicting-event count above which strong resolution freezes the stream.
pub const DEFAULT_FREEZE_THRESHOLD: usize = 50;
/// Age at which staged weak conflicts are resolved.
pub const DEFAULT_WEAK_AGE_THRESHOLD: Duration = Duration::from_secs(30);
/// Age at which a freeze held by another instance is considered stale.
pub const DEFAULT_FREEZE_TIMEOUT: Duration = Duration::from_secs(60);
/// How often the deferred worker checks for due work.
pub const DEFAULT_WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Built-in conflict resolution strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Fail the commit.
    #[default]
    Throw,
    /// Drop the conflicting events.
    Discard,
    /// Write the conflicting events without a version check.
    Ignore,
    /// Merge the conflicting events into the fresh stream now.
    ResolveStrongly,
    /// Stage the conflicting events and merge them once they are due.
    ResolveWeakly,
}

impl ConflictStrategy {
    /// Stable name, also stamped on events re-applied by the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Throw => "throw",
            Self::Discard => "discard",
            Self::Ignore => "ignore",
            Self::ResolveStrongly => "resolve_strongly",
            Self::ResolveWeakly => "resolve_weakly",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Strategy used when the resolver is built from configuration.
    pub strategy: ConflictStrategy,

    /// Freeze the stream while merging more than this many events.
    pub freeze_threshold: usize,

    /// Staged weak conflicts older than this are resolved, in milliseconds.
    pub weak_age_threshold_ms: u64,

    /// Maximum number of staged batches pulled per weak resolution.
    /// Unset pulls everything staged.
    pub weak_pull_max: Option<usize>,

    /// Freezes older than this may be taken over, in seconds.
    pub freeze_timeout_secs: u64,

    /// Deferred worker poll interval, in milliseconds.
    pub worker_poll_interval_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            freeze_threshold: DEFAULT_FREEZE_THRESHOLD,
            weak_age_threshold_ms: duration_ms(DEFAULT_WEAK_AGE_THRESHOLD),
            weak_pull_max: None,
            freeze_timeout_secs: DEFAULT_FREEZE_TIMEOUT.as_secs(),
            worker_poll_interval_ms: duration_ms(DEFAULT_WORKER_POLL_INTERVAL),
        }
    }
}

impl ConflictConfig {
    /// Get the weak age threshold.
    #[must_use]
    pub const fn weak_age_threshold(&self) -> Duration {
        Duration::from_millis(self.weak_age_threshold_ms)
    }

    /// Get the freeze timeout.
    #[must_use]
    pub const fn freeze_timeout(&self) -> Duration {
        Duration::from_secs(self.freeze_timeout_secs)
    }

    /// Get the worker poll interval.
    #[must_use]
    pub const fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_freeze_threshold(mut self, threshold: usize) -> Self {
        self.freeze_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_weak_age_threshold(mut self, threshold: Duration) -> Self {
        self.weak_age_threshold_ms = duration_ms(threshold);
        self
    }

    #[must_use]
    pub const fn with_weak_pull_max(mut self, max: Option<usize>) -> Self {
        self.weak_pull_max = max;
        self
    }

    #[must_use]
    pub const fn with_freeze_timeout(mut self, timeout: Duration) -> Self {
        self.freeze_timeout_secs = timeout.as_secs();
        self
    }

    #[must_use]
    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval_ms = duration_ms(interval);
        self
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
