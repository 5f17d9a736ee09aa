use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::Utc;
use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    config::DEFAULT_FREEZE_TIMEOUT,
    event::{EventDescriptor, FullEvent, Headers, StreamType, headers},
    snapshot::Snapshot,
    store::{Freeze, StoreError, StoreEvents, StoreStreams},
    stream::{EventStream, StreamRef},
};

/// Event kind of snapshot records on `SNAPSHOT` streams.
pub const SNAPSHOT_KIND: &str = "concord.snapshot";

/// [`StoreStreams`] over any [`StoreEvents`] backend.
///
/// - Domain events go to the stream's `DOMAIN` key with an expected-version
///   check.
/// - Out-of-band events go to one `OOB` stream per channel, unchecked.
/// - Snapshots are appended to the `SNAPSHOT` stream; the last one wins.
/// - Freezes live in the domain stream's metadata, owned by this instance's
///   id. A freeze older than the freeze timeout is stale and may be taken
///   over.
///
/// Clean streams are cached after every load and write and handed out as
/// detached clones. A version conflict evicts the stream, so the next load
/// reads the store again.
#[derive(Clone)]
pub struct StreamStore<E> {
    events: E,
    instance: Uuid,
    freeze_timeout: Duration,
    cache: Arc<RwLock<HashMap<String, EventStream>>>,
}

impl<E: std::fmt::Debug> std::fmt::Debug for StreamStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStore")
            .field("events", &self.events)
            .field("instance", &self.instance)
            .field("freeze_timeout", &self.freeze_timeout)
            .finish_non_exhaustive()
    }
}

impl<E> StreamStore<E> {
    #[must_use]
    pub fn new(events: E) -> Self {
        Self {
            events,
            instance: Uuid::new_v4(),
            freeze_timeout: DEFAULT_FREEZE_TIMEOUT,
            cache: Arc::default(),
        }
    }

    /// Use a fixed instance id instead of a random one.
    #[must_use]
    pub const fn with_instance(mut self, instance: Uuid) -> Self {
        self.instance = instance;
        self
    }

    /// Age after which another instance's freeze counts as stale.
    #[must_use]
    pub const fn with_freeze_timeout(mut self, timeout: Duration) -> Self {
        self.freeze_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn instance(&self) -> Uuid {
        self.instance
    }

    /// The underlying event store.
    #[must_use]
    pub const fn events(&self) -> &E {
        &self.events
    }

    fn cached(&self, key: &str) -> Option<EventStream> {
        self.cache
            .read()
            .expect("stream cache lock poisoned")
            .get(key)
            .cloned()
    }

    fn remember(&self, key: String, stream: EventStream) {
        self.cache
            .write()
            .expect("stream cache lock poisoned")
            .insert(key, stream);
    }

    fn evict(&self, key: &str) {
        self.cache
            .write()
            .expect("stream cache lock poisoned")
            .remove(key);
    }

    fn is_stale(&self, freeze: &Freeze) -> bool {
        Utc::now()
            .signed_duration_since(freeze.at)
            .to_std()
            .is_ok_and(|age| age >= self.freeze_timeout)
    }
}

impl<E: StoreEvents> StreamStore<E> {
    async fn read_snapshot(
        &self,
        stream: &StreamRef,
    ) -> Result<Option<Snapshot>, StoreError<E::Error>> {
        let key = stream.key(StreamType::Snapshot);
        let Some(last) = self
            .events
            .get_events_backwards(&key, 1)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(last.event)?))
    }

    async fn ensure_writable(&self, key: &str) -> Result<(), StoreError<E::Error>> {
        let (_, metadata) = self.events.get_metadata(key).await?;
        if let Some(freeze) = metadata.frozen
            && freeze.owner != self.instance
            && !self.is_stale(&freeze)
        {
            tracing::debug!(stream = %key, owner = %freeze.owner, "stream frozen by another instance");
            return Err(StoreError::Frozen {
                stream: key.to_string(),
                owner: freeze.owner,
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        commit_id: Uuid,
        stream: &EventStream,
        commit_headers: &Headers,
        expected_version: Option<i64>,
    ) -> Result<i64, StoreError<E::Error>> {
        let key = stream.stream_key(StreamType::Domain);
        self.ensure_writable(&key).await?;

        let mut commit_headers = commit_headers.clone();
        commit_headers.insert(headers::COMMIT_ID.to_string(), commit_id.to_string());

        let mut version = stream.stream_version();
        if let Some(events) = NonEmpty::from_vec(stream.uncommitted().to_vec()) {
            version = self
                .events
                .write_events(&key, events, &commit_headers, expected_version)
                .await?;
        }

        for (oob_key, events) in stream.pending_oob_batches() {
            self.events
                .write_events(&oob_key, events, &commit_headers, None)
                .await?;
        }

        if let Some(snapshot) = stream.pending_snapshot() {
            self.write_snapshot(stream, snapshot, &commit_headers).await?;
        }
        Ok(version)
    }

    async fn write_snapshot(
        &self,
        stream: &EventStream,
        snapshot: &Snapshot,
        commit_headers: &Headers,
    ) -> Result<(), StoreError<E::Error>> {
        let record = FullEvent {
            event_id: Some(Uuid::new_v4()),
            kind: SNAPSHOT_KIND.to_string(),
            event: serde_json::to_value(snapshot)?,
            descriptor: EventDescriptor {
                entity: stream.entity().to_string(),
                stream_type: StreamType::Snapshot,
                bucket: stream.bucket().to_string(),
                stream_id: stream.stream_id().clone(),
                parents: stream.parents().to_vec(),
                version: snapshot.version,
                timestamp: snapshot.taken,
                headers: Headers::new(),
                commit_headers: Headers::new(),
            },
        };
        self.events
            .write_events(
                &stream.stream_key(StreamType::Snapshot),
                NonEmpty::new(record),
                commit_headers,
                None,
            )
            .await?;
        tracing::debug!(version = snapshot.version, "snapshot written");
        Ok(())
    }
}

impl<E: StoreEvents> StoreStreams for StreamStore<E> {
    type Error = E::Error;

    #[tracing::instrument(skip(self, stream), fields(entity = %stream.entity, id = %stream.id))]
    async fn get_stream<'a>(
        &'a self,
        stream: &'a StreamRef,
    ) -> Result<EventStream, StoreError<Self::Error>> {
        let key = stream.key(StreamType::Domain);
        if let Some(cached) = self.cached(&key) {
            tracing::trace!(version = cached.stream_version(), "stream served from cache");
            return Ok(cached);
        }

        let snapshot = self.read_snapshot(stream).await?;
        let start = snapshot.as_ref().map_or(0, |snapshot| snapshot.version + 1);
        let events = self.events.get_events(&key, start, None).await?;

        let loaded = EventStream::new(
            stream.entity.clone(),
            stream.bucket.clone(),
            stream.id.clone(),
            stream.parents.clone(),
            events,
            snapshot,
        );
        tracing::debug!(version = loaded.stream_version(), "stream loaded");
        self.remember(key, loaded.clone());
        Ok(loaded)
    }

    #[tracing::instrument(
        skip(self, stream, commit_headers),
        fields(stream = %stream.stream_key(StreamType::Domain), event_count = stream.total_uncommitted())
    )]
    async fn write_stream<'a>(
        &'a self,
        commit_id: Uuid,
        stream: &'a EventStream,
        commit_headers: &'a Headers,
    ) -> Result<i64, StoreError<Self::Error>> {
        let key = stream.stream_key(StreamType::Domain);
        let version = match self
            .write(commit_id, stream, commit_headers, Some(stream.stream_version()))
            .await
        {
            Ok(version) => version,
            Err(err) => {
                if err.as_version_conflict().is_some() {
                    self.evict(&key);
                }
                return Err(err);
            }
        };

        let mut committed = stream.clone();
        committed.flush(true);
        self.remember(key, committed);

        tracing::debug!(version, "stream written");
        Ok(version)
    }

    #[tracing::instrument(
        skip(self, stream, commit_headers),
        fields(stream = %stream.stream_key(StreamType::Domain), event_count = stream.total_uncommitted())
    )]
    async fn append_stream<'a>(
        &'a self,
        commit_id: Uuid,
        stream: &'a EventStream,
        commit_headers: &'a Headers,
    ) -> Result<i64, StoreError<Self::Error>> {
        let key = stream.stream_key(StreamType::Domain);
        let result = self.write(commit_id, stream, commit_headers, None).await;
        self.evict(&key);
        let version = result?;
        tracing::debug!(version, "stream appended without version check");
        Ok(version)
    }

    #[tracing::instrument(skip(self, stream), fields(stream = %stream.stream_key(StreamType::Domain)))]
    async fn freeze<'a>(&'a self, stream: &'a EventStream) -> Result<(), StoreError<Self::Error>> {
        let key = stream.stream_key(StreamType::Domain);
        let (revision, mut metadata) = self.events.get_metadata(&key).await?;

        if let Some(existing) = &metadata.frozen {
            if !self.is_stale(existing) {
                return Err(StoreError::Frozen {
                    stream: key,
                    owner: existing.owner,
                });
            }
            tracing::warn!(owner = %existing.owner, "taking over stale freeze");
        }

        metadata.frozen = Some(Freeze {
            owner: self.instance,
            at: Utc::now(),
        });
        self.events.write_metadata(&key, metadata, revision).await?;
        tracing::debug!("stream frozen");
        Ok(())
    }

    #[tracing::instrument(skip(self, stream), fields(stream = %stream.stream_key(StreamType::Domain)))]
    async fn unfreeze<'a>(&'a self, stream: &'a EventStream) -> Result<(), StoreError<Self::Error>> {
        let key = stream.stream_key(StreamType::Domain);
        let (revision, mut metadata) = self.events.get_metadata(&key).await?;

        match &metadata.frozen {
            None => return Ok(()),
            Some(freeze) if freeze.owner != self.instance => {
                tracing::warn!(owner = %freeze.owner, "freeze held by another instance, leaving it");
                return Ok(());
            }
            Some(_) => {}
        }

        metadata.frozen = None;
        self.events.write_metadata(&key, metadata, revision).await?;
        tracing::debug!("stream unfrozen");
        Ok(())
    }

    async fn verify_version<'a>(
        &'a self,
        stream: &'a EventStream,
    ) -> Result<(), StoreError<Self::Error>> {
        let key = stream.stream_key(StreamType::Domain);
        let result = self
            .events
            .verify_version(&key, stream.stream_version())
            .await;
        if result.as_ref().is_err_and(|err| err.as_version_conflict().is_some()) {
            self.evict(&key);
        }
        result
    }
}
