//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`StoreEvents`](super::StoreEvents) suitable for unit tests and demos.
//! Clones share the same underlying streams, so two
//! [`StreamStore`](super::StreamStore)s over clones of one `Store` behave like
//! two nodes writing to the same database.
//!
//! # Example
//!
//! ```
//! use concord_core::store::{StreamStore, inmemory};
//!
//! let store = StreamStore::new(inmemory::Store::new());
//! ```

use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    concurrency::{NEW_STREAM_VERSION, VersionConflict},
    event::{FullEvent, Headers},
    store::{StoreError, StoreEvents, StreamMetadata},
};

/// In-memory event store that keeps streams in a hash map keyed by stream
/// key.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<FullEvent>>,
    metadata: HashMap<String, (i64, StreamMetadata)>,
}

impl Inner {
    fn version(&self, stream: &str) -> i64 {
        self.streams
            .get(stream)
            .and_then(|events| events.last())
            .map_or(NEW_STREAM_VERSION, |event| event.descriptor.version)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let streams = self.inner.read().map_or(0, |inner| inner.streams.len());
        f.debug_struct("Store").field("streams", &streams).finish()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event written to `stream`, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the store lock is poisoned.
    #[must_use]
    pub fn events(&self, stream: &str) -> Vec<FullEvent> {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Keys of all streams holding at least one event.
    ///
    /// # Panics
    ///
    /// Panics if the store lock is poisoned.
    #[must_use]
    pub fn stream_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .inner
            .read()
            .expect("in-memory store lock poisoned")
            .streams
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl StoreEvents for Store {
    type Error = Infallible;

    #[tracing::instrument(skip(self))]
    fn get_events<'a>(
        &'a self,
        stream: &'a str,
        start: i64,
        count: Option<usize>,
    ) -> impl Future<Output = Result<Vec<FullEvent>, StoreError<Self::Error>>> + Send + 'a {
        let events: Vec<FullEvent> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(stream)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| event.descriptor.version >= start)
                        .take(count.unwrap_or(usize::MAX))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        tracing::trace!(events_loaded = events.len(), "loaded events from stream");
        std::future::ready(Ok(events))
    }

    #[tracing::instrument(skip(self))]
    fn get_events_backwards<'a>(
        &'a self,
        stream: &'a str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<FullEvent>, StoreError<Self::Error>>> + Send + 'a {
        let events: Vec<FullEvent> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(stream)
                .map(|events| events.iter().rev().take(count).cloned().collect())
                .unwrap_or_default()
        };
        std::future::ready(Ok(events))
    }

    #[tracing::instrument(skip(self, events, commit_headers), fields(event_count = events.len()))]
    fn write_events<'a>(
        &'a self,
        stream: &'a str,
        events: NonEmpty<FullEvent>,
        commit_headers: &'a Headers,
        expected_version: Option<i64>,
    ) -> impl Future<Output = Result<i64, StoreError<Self::Error>>> + Send + 'a {
        let result: Result<i64, StoreError<Infallible>> = (|| {
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let current = inner.version(stream);

            if let Some(expected) = expected_version
                && expected != current
            {
                tracing::debug!(expected, current, "version mismatch, rejecting write");
                return Err(VersionConflict::new(stream, expected, current).into());
            }

            let mut version = current;
            let stored: Vec<FullEvent> = events
                .into_iter()
                .map(|mut event| {
                    version += 1;
                    event.event_id.get_or_insert_with(Uuid::new_v4);
                    event.descriptor.version = version;
                    event.descriptor.timestamp = Utc::now();
                    event.descriptor.commit_headers.clone_from(commit_headers);
                    event
                })
                .collect();
            let appended = stored.len();

            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .extend(stored);
            drop(inner);
            tracing::debug!(events_appended = appended, version, "events written to stream");
            Ok(version)
        })();

        std::future::ready(result)
    }

    fn verify_version<'a>(
        &'a self,
        stream: &'a str,
        expected_version: i64,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send + 'a {
        let current = self
            .inner
            .read()
            .expect("in-memory store lock poisoned")
            .version(stream);
        let result: Result<(), StoreError<Infallible>> = if current == expected_version {
            Ok(())
        } else {
            Err(VersionConflict::new(stream, expected_version, current).into())
        };
        std::future::ready(result)
    }

    fn get_metadata<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = Result<(i64, StreamMetadata), StoreError<Self::Error>>> + Send + 'a
    {
        let metadata = self
            .inner
            .read()
            .expect("in-memory store lock poisoned")
            .metadata
            .get(stream)
            .cloned()
            .unwrap_or((NEW_STREAM_VERSION, StreamMetadata::default()));
        std::future::ready(Ok(metadata))
    }

    #[tracing::instrument(skip(self, metadata))]
    fn write_metadata<'a>(
        &'a self,
        stream: &'a str,
        metadata: StreamMetadata,
        expected_revision: i64,
    ) -> impl Future<Output = Result<i64, StoreError<Self::Error>>> + Send + 'a {
        let result: Result<i64, StoreError<Infallible>> = (|| {
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let current = inner
                .metadata
                .get(stream)
                .map_or(NEW_STREAM_VERSION, |(revision, _)| *revision);
            if current != expected_revision {
                tracing::debug!(expected_revision, current, "metadata revision mismatch");
                return Err(VersionConflict::new(stream, expected_revision, current).into());
            }
            let revision = current + 1;
            inner
                .metadata
                .insert(stream.to_string(), (revision, metadata));
            Ok(revision)
        })();

        std::future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{event::Id, stream::EventStream};

    fn batch(count: usize) -> NonEmpty<FullEvent> {
        let mut stream = EventStream::empty("account", "default", Id::from("a-1"), Vec::new());
        for n in 0..count {
            stream.add("account.deposited", json!({ "amount": n }), Headers::new());
        }
        NonEmpty::from_vec(stream.uncommitted().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn write_stamps_sequential_versions() {
        let store = Store::new();
        let version = store
            .write_events("s", batch(3), &Headers::new(), Some(NEW_STREAM_VERSION))
            .await
            .unwrap();
        assert_eq!(version, 2);

        let version = store
            .write_events("s", batch(2), &Headers::new(), Some(2))
            .await
            .unwrap();
        assert_eq!(version, 4);

        let versions: Vec<_> = store
            .events("s")
            .iter()
            .map(|event| event.descriptor.version)
            .collect();
        assert_eq!(versions, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn write_with_stale_version_conflicts() {
        let store = Store::new();
        store.write_events("s", batch(2), &Headers::new(), None).await.unwrap();

        let err = store
            .write_events("s", batch(1), &Headers::new(), Some(0))
            .await
            .unwrap_err();

        assert_eq!(
            err.as_version_conflict(),
            Some(&VersionConflict::new("s", 0, 1))
        );
        assert_eq!(store.events("s").len(), 2);
    }

    #[tokio::test]
    async fn write_without_expected_version_always_appends() {
        let store = Store::new();
        store.write_events("s", batch(1), &Headers::new(), None).await.unwrap();
        store.write_events("s", batch(1), &Headers::new(), None).await.unwrap();
        assert_eq!(store.events("s").len(), 2);
    }

    #[tokio::test]
    async fn write_records_commit_headers() {
        let store = Store::new();
        let mut headers = Headers::new();
        headers.insert("user".to_string(), "alice".to_string());
        store.write_events("s", batch(1), &headers, None).await.unwrap();

        assert_eq!(store.events("s")[0].descriptor.commit_headers, headers);
    }

    #[tokio::test]
    async fn reads_respect_start_and_direction() {
        let store = Store::new();
        store.write_events("s", batch(4), &Headers::new(), None).await.unwrap();

        let forward = store.get_events("s", 2, None).await.unwrap();
        assert_eq!(forward.len(), 2);
        assert_eq!(forward[0].descriptor.version, 2);

        let backwards = store.get_events_backwards("s", 1).await.unwrap();
        assert_eq!(backwards[0].descriptor.version, 3);

        assert!(store.get_events("missing", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verify_version_compares_last_event() {
        let store = Store::new();
        store.verify_version("s", NEW_STREAM_VERSION).await.unwrap();
        store.write_events("s", batch(1), &Headers::new(), None).await.unwrap();
        store.verify_version("s", 0).await.unwrap();
        assert!(store.verify_version("s", NEW_STREAM_VERSION).await.is_err());
    }

    #[tokio::test]
    async fn metadata_writes_are_revision_checked() {
        let store = Store::new();
        let (revision, metadata) = store.get_metadata("s").await.unwrap();
        assert_eq!(revision, NEW_STREAM_VERSION);
        assert_eq!(metadata, StreamMetadata::default());

        let revision = store.write_metadata("s", metadata.clone(), revision).await.unwrap();
        assert_eq!(revision, 0);

        let err = store
            .write_metadata("s", metadata, NEW_STREAM_VERSION)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Version(_)));
    }
}
