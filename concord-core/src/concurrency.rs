//! Optimistic version checks.
//!
//! Every durable stream carries a version: the version of its last event, or
//! [`NEW_STREAM_VERSION`] when nothing has been written yet. Writers state the
//! version they loaded; the store rejects the write with a [`VersionConflict`]
//! when another writer got there first. This check is the only concurrency
//! primitive the crate relies on.

use thiserror::Error;

/// Version of a stream that has never been written.
pub const NEW_STREAM_VERSION: i64 = -1;

/// Error indicating that a stream advanced past the version a writer expected.
///
/// Raised by stores when an expected-version write loses a race, and by
/// stream metadata updates (such as freezing) that race another writer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.stream, *.expected, *.actual))]
pub struct VersionConflict {
    /// Key of the stream that was written.
    pub stream: String,
    /// The version the writer loaded. [`NEW_STREAM_VERSION`] means the writer
    /// expected a new stream.
    pub expected: i64,
    /// The version the store holds.
    pub actual: i64,
}

impl VersionConflict {
    #[must_use]
    pub fn new(stream: impl Into<String>, expected: i64, actual: i64) -> Self {
        Self {
            stream: stream.into(),
            expected,
            actual,
        }
    }
}

/// Build a human-readable message for a [`VersionConflict`], including an
/// actionable hint for the caller.
fn format_conflict(stream: &str, expected: i64, actual: i64) -> String {
    if expected == NEW_STREAM_VERSION {
        format!(
            "version conflict on `{stream}`: expected new stream, found version {actual} (hint: \
             another process created this entity; reload and retry)"
        )
    } else if actual == NEW_STREAM_VERSION {
        format!("version conflict on `{stream}`: expected version {expected}, stream is empty")
    } else {
        format!(
            "version conflict on `{stream}`: expected version {expected}, found {actual} (hint: \
             stream was modified; reload and retry)"
        )
    }
}
