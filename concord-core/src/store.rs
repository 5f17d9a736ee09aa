//! Persistence contracts.
//!
//! Two layers:
//!
//! - [`StoreEvents`]: append and read events per stream key, with optimistic
//!   version checks, plus per-stream metadata guarded by its own revision. A
//!   backend (database driver, in-memory map) implements this.
//! - [`StoreStreams`]: whole [`EventStream`]s, bundling domain events,
//!   out-of-band events and snapshots into one write, and freezing streams for
//!   exclusive conflict reconciliation. [`StreamStore`] implements it over
//!   any [`StoreEvents`].
//!
//! The expected-version check on [`StoreEvents::write_events`] is the only
//! concurrency primitive; no layer takes its own locks around a write.

use std::future::Future;

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    concurrency::VersionConflict,
    event::{FullEvent, Headers},
    stream::{EventStream, StreamRef},
};

pub mod inmemory;
mod streams;

pub use streams::StreamStore;

/// A freeze placed on a stream by one store instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freeze {
    /// Instance holding the freeze.
    pub owner: Uuid,
    pub at: DateTime<Utc>,
}

/// Metadata kept alongside a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub frozen: Option<Freeze>,
    #[serde(default)]
    pub custom: Headers,
}

/// Error returned by store operations.
///
/// `E` is the backend's own error type.
#[derive(Debug, Error)]
pub enum StoreError<E>
where
    E: std::error::Error + 'static,
{
    /// Another writer advanced the stream (or its metadata) first.
    #[error(transparent)]
    Version(#[from] VersionConflict),
    /// The stream is frozen by another instance.
    #[error("stream `{stream}` is frozen by {owner}")]
    Frozen { stream: String, owner: Uuid },
    /// A stored payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Underlying store error.
    #[error("store error: {0}")]
    Backend(#[source] E),
}

impl<E: std::error::Error + 'static> StoreError<E> {
    #[must_use]
    pub const fn as_version_conflict(&self) -> Option<&VersionConflict> {
        match self {
            Self::Version(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Durable append/read of events per stream key.
pub trait StoreEvents: Send + Sync {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read events of `stream` starting at version `start`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn get_events<'a>(
        &'a self,
        stream: &'a str,
        start: i64,
        count: Option<usize>,
    ) -> impl Future<Output = Result<Vec<FullEvent>, StoreError<Self::Error>>> + Send + 'a;

    /// Read the last `count` events of `stream`, newest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn get_events_backwards<'a>(
        &'a self,
        stream: &'a str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<FullEvent>, StoreError<Self::Error>>> + Send + 'a;

    /// Append `events` to `stream` and return the version of the last one.
    ///
    /// With `expected_version` set, the write fails with
    /// [`StoreError::Version`] unless the stream is at exactly that version.
    /// `None` appends unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Version`] on a version mismatch, or a backend
    /// error.
    fn write_events<'a>(
        &'a self,
        stream: &'a str,
        events: NonEmpty<FullEvent>,
        commit_headers: &'a Headers,
        expected_version: Option<i64>,
    ) -> impl Future<Output = Result<i64, StoreError<Self::Error>>> + Send + 'a;

    /// Check that `stream` is at `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Version`] when it is not.
    fn verify_version<'a>(
        &'a self,
        stream: &'a str,
        expected_version: i64,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send + 'a;

    /// Read the metadata of `stream` and its revision.
    ///
    /// A stream without metadata yields the default metadata at revision
    /// [`NEW_STREAM_VERSION`](crate::concurrency::NEW_STREAM_VERSION).
    ///
    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn get_metadata<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = Result<(i64, StreamMetadata), StoreError<Self::Error>>> + Send + 'a;

    /// Replace the metadata of `stream`, returning the new revision.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Version`] unless the metadata is at
    /// `expected_revision`.
    fn write_metadata<'a>(
        &'a self,
        stream: &'a str,
        metadata: StreamMetadata,
        expected_revision: i64,
    ) -> impl Future<Output = Result<i64, StoreError<Self::Error>>> + Send + 'a;
}

/// Whole-stream persistence used by repositories and conflict resolvers.
pub trait StoreStreams: Send + Sync {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the stream identified by `stream`.
    ///
    /// # Errors
    ///
    /// Returns a store error when reading fails.
    fn get_stream<'a>(
        &'a self,
        stream: &'a StreamRef,
    ) -> impl Future<Output = Result<EventStream, StoreError<Self::Error>>> + Send + 'a;

    /// Start an empty stream. Nothing is written until
    /// [`write_stream`](Self::write_stream).
    fn new_stream(&self, stream: &StreamRef) -> EventStream {
        EventStream::empty(
            stream.entity.clone(),
            stream.bucket.clone(),
            stream.id.clone(),
            stream.parents.clone(),
        )
    }

    /// Write the pending events, out-of-band events and snapshot of `stream`
    /// in commit `commit_id`. Returns the new stream version.
    ///
    /// The stream itself is left untouched; callers flush it once the write
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Version`] when the domain stream advanced past
    /// the version it was loaded at, and [`StoreError::Frozen`] when another
    /// instance holds a freeze on it.
    fn write_stream<'a>(
        &'a self,
        commit_id: Uuid,
        stream: &'a EventStream,
        commit_headers: &'a Headers,
    ) -> impl Future<Output = Result<i64, StoreError<Self::Error>>> + Send + 'a;

    /// Like [`write_stream`](Self::write_stream), but appends the domain
    /// events without an expected-version check: last writer wins.
    ///
    /// The version the caller loaded may be behind the durable stream, so
    /// cached copies of the stream are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Frozen`] when another instance holds a freeze on
    /// the stream, or a backend error.
    fn append_stream<'a>(
        &'a self,
        commit_id: Uuid,
        stream: &'a EventStream,
        commit_headers: &'a Headers,
    ) -> impl Future<Output = Result<i64, StoreError<Self::Error>>> + Send + 'a;

    /// Place an exclusive-writer freeze on `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Frozen`] when the stream is already frozen and
    /// [`StoreError::Version`] when the freeze races another writer.
    fn freeze<'a>(
        &'a self,
        stream: &'a EventStream,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send + 'a;

    /// Release a freeze placed by [`freeze`](Self::freeze).
    ///
    /// # Errors
    ///
    /// Returns a store error when the metadata cannot be written.
    fn unfreeze<'a>(
        &'a self,
        stream: &'a EventStream,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send + 'a;

    /// Check that the durable stream is still at the version `stream` was
    /// loaded at.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Version`] when it moved on.
    fn verify_version<'a>(
        &'a self,
        stream: &'a EventStream,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send + 'a;
}
