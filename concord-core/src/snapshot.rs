//! Snapshots of entity state.
//!
//! A [`Snapshot`] carries a serialized memento of an entity's state and the
//! stream version it was taken at. Loading an entity restores the memento and
//! replays only the events written after it. Whether a snapshot is taken at
//! all is decided per state type by a [`SnapshotPolicy`], registered through
//! [`Routes::snapshots`](crate::route::Routes::snapshots).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time state of an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stream version the memento was taken at.
    pub version: i64,
    pub memento: serde_json::Value,
    pub taken: DateTime<Utc>,
}

/// When to stage a snapshot before a commit.
///
/// - [`SnapshotPolicy::Always`]: snapshot on every commit that writes domain
///   events (high storage cost, minimal replay)
/// - [`SnapshotPolicy::EveryNEvents`]: snapshot once `n` versions have
///   accumulated since the last snapshot
/// - [`SnapshotPolicy::Never`]: only restore snapshots written elsewhere
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    Always,
    EveryNEvents(u64),
    Never,
}

impl SnapshotPolicy {
    /// Check if a snapshot should be created based on events since last
    /// snapshot.
    #[must_use]
    pub const fn should_snapshot(&self, events_since: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(threshold) => events_since >= *threshold,
            Self::Never => false,
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::EveryNEvents(100)
    }
}
