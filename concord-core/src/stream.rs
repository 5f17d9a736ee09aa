//! In-memory view of one entity's event history.
//!
//! An [`EventStream`] holds the committed events loaded from the store, the
//! events appended during the current unit of work, pending out-of-band
//! events and an optional pending snapshot. It performs no I/O; durability is
//! the job of [`StoreStreams`](crate::store::StoreStreams).

use std::sync::Arc;

use chrono::Utc;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    concurrency::NEW_STREAM_VERSION,
    event::{EventDescriptor, FullEvent, Headers, Id, ParentRef, StreamType, headers},
    snapshot::Snapshot,
};

/// Build the durable key of a stream.
///
/// Format: `{StreamType}-{Bucket}-[{ParentChain}]-{EntityType}-{StreamId}`,
/// where the parent chain is the colon-joined parent ids.
#[must_use]
pub fn stream_key(
    stream_type: StreamType,
    bucket: &str,
    parents: &[ParentRef],
    entity: &str,
    id: &str,
) -> String {
    let chain = parents
        .iter()
        .map(|parent| parent.id.as_str())
        .collect::<Vec<_>>()
        .join(":");
    format!("{stream_type}-{bucket}-[{chain}]-{entity}-{id}")
}

/// A named out-of-band channel of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobDefinition {
    pub id: String,
    pub transient: bool,
    pub days_to_live: Option<u32>,
}

/// Self-contained identity of a stream, enough to load it again elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub entity: String,
    pub bucket: String,
    pub id: Id,
    #[serde(default)]
    pub parents: Vec<ParentRef>,
}

impl StreamRef {
    #[must_use]
    pub fn key(&self, stream_type: StreamType) -> String {
        stream_key(
            stream_type,
            &self.bucket,
            &self.parents,
            &self.entity,
            self.id.as_str(),
        )
    }
}

/// Event history of one entity instance.
///
/// Cloning yields a detached copy: the committed history is shared, while the
/// pending events and snapshot of the clone evolve independently.
#[derive(Clone, Debug)]
pub struct EventStream {
    entity: String,
    bucket: String,
    stream_id: Id,
    parents: Vec<ParentRef>,
    stream_version: i64,
    commit_version: i64,
    committed: Arc<[FullEvent]>,
    uncommitted: Vec<FullEvent>,
    oobs: Vec<OobDefinition>,
    pending_oobs: Vec<FullEvent>,
    snapshot: Option<Snapshot>,
    pending_snapshot: Option<Snapshot>,
}

impl EventStream {
    /// Create a stream from the history read from the store.
    ///
    /// `committed` holds the events after `snapshot` (or the whole history
    /// when there is no snapshot).
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        bucket: impl Into<String>,
        stream_id: Id,
        parents: Vec<ParentRef>,
        committed: Vec<FullEvent>,
        snapshot: Option<Snapshot>,
    ) -> Self {
        let stream_version = committed
            .last()
            .map(|event| event.descriptor.version)
            .or_else(|| snapshot.as_ref().map(|snapshot| snapshot.version))
            .unwrap_or(NEW_STREAM_VERSION);

        Self {
            entity: entity.into(),
            bucket: bucket.into(),
            stream_id,
            parents,
            stream_version,
            commit_version: stream_version,
            committed: committed.into(),
            uncommitted: Vec::new(),
            oobs: Vec::new(),
            pending_oobs: Vec::new(),
            snapshot,
            pending_snapshot: None,
        }
    }

    /// Create an empty stream for a new entity.
    #[must_use]
    pub fn empty(
        entity: impl Into<String>,
        bucket: impl Into<String>,
        stream_id: Id,
        parents: Vec<ParentRef>,
    ) -> Self {
        Self::new(entity, bucket, stream_id, parents, Vec::new(), None)
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub const fn stream_id(&self) -> &Id {
        &self.stream_id
    }

    #[must_use]
    pub fn parents(&self) -> &[ParentRef] {
        &self.parents
    }

    /// Last durable version, as hydrated or acknowledged by the store.
    #[must_use]
    pub const fn stream_version(&self) -> i64 {
        self.stream_version
    }

    /// Version including the events appended in this unit of work.
    #[must_use]
    pub const fn commit_version(&self) -> i64 {
        self.commit_version
    }

    #[must_use]
    pub fn committed(&self) -> &[FullEvent] {
        &self.committed
    }

    #[must_use]
    pub fn uncommitted(&self) -> &[FullEvent] {
        &self.uncommitted
    }

    #[must_use]
    pub fn oobs(&self) -> &[OobDefinition] {
        &self.oobs
    }

    #[must_use]
    pub fn pending_oobs(&self) -> &[FullEvent] {
        &self.pending_oobs
    }

    #[must_use]
    pub const fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    #[must_use]
    pub const fn pending_snapshot(&self) -> Option<&Snapshot> {
        self.pending_snapshot.as_ref()
    }

    /// Whether the stream holds anything that still has to be written.
    #[must_use]
    pub fn dirty(&self) -> bool {
        !self.uncommitted.is_empty() || !self.pending_oobs.is_empty() || self.pending_snapshot.is_some()
    }

    /// Number of events appended since the stream was loaded or flushed.
    #[must_use]
    pub fn total_uncommitted(&self) -> usize {
        self.uncommitted.len() + self.pending_oobs.len()
    }

    /// Domain and out-of-band events waiting to be written, domain first.
    #[must_use]
    pub fn pending_events(&self) -> Vec<FullEvent> {
        self.uncommitted
            .iter()
            .chain(&self.pending_oobs)
            .cloned()
            .collect()
    }

    /// Durable key of this stream for the given sub-stream.
    #[must_use]
    pub fn stream_key(&self, stream_type: StreamType) -> String {
        stream_key(
            stream_type,
            &self.bucket,
            &self.parents,
            &self.entity,
            self.stream_id.as_str(),
        )
    }

    /// Durable key of one out-of-band channel of this stream.
    #[must_use]
    pub fn oob_key(&self, oob_id: &str) -> String {
        stream_key(
            StreamType::Oob,
            &self.bucket,
            &self.parents,
            &self.entity,
            &format!("{}.{oob_id}", self.stream_id),
        )
    }

    /// Pending out-of-band events grouped by the key of their channel stream.
    #[must_use]
    pub fn pending_oob_batches(&self) -> Vec<(String, NonEmpty<FullEvent>)> {
        self.oobs
            .iter()
            .filter_map(|oob| {
                let events = self
                    .pending_oobs
                    .iter()
                    .filter(|event| event.oob_id() == Some(oob.id.as_str()))
                    .cloned()
                    .collect();
                NonEmpty::from_vec(events).map(|events| (self.oob_key(&oob.id), events))
            })
            .collect()
    }

    #[must_use]
    pub fn stream_ref(&self) -> StreamRef {
        StreamRef {
            entity: self.entity.clone(),
            bucket: self.bucket.clone(),
            id: self.stream_id.clone(),
            parents: self.parents.clone(),
        }
    }

    /// Number of versions since the last snapshot, including pending events.
    #[must_use]
    pub fn events_since_snapshot(&self) -> u64 {
        let base = self
            .snapshot
            .as_ref()
            .map_or(NEW_STREAM_VERSION, |snapshot| snapshot.version);
        u64::try_from(self.commit_version - base).unwrap_or(0)
    }

    fn descriptor(&self, stream_type: StreamType, version: i64, headers: Headers) -> EventDescriptor {
        EventDescriptor {
            entity: self.entity.clone(),
            stream_type,
            bucket: self.bucket.clone(),
            stream_id: self.stream_id.clone(),
            parents: self.parents.clone(),
            version,
            timestamp: Utc::now(),
            headers,
            commit_headers: Headers::new(),
        }
    }

    /// Append a domain event to the pending events.
    pub fn add(&mut self, kind: impl Into<String>, event: serde_json::Value, headers: Headers) {
        self.commit_version += 1;
        let descriptor = self.descriptor(StreamType::Domain, self.commit_version, headers);
        self.uncommitted.push(FullEvent {
            event_id: Some(Uuid::new_v4()),
            kind: kind.into(),
            event,
            descriptor,
        });
    }

    /// Append an event to the out-of-band channel `oob_id`.
    ///
    /// Out-of-band channels are versioned independently: the commit version
    /// of the domain stream does not move.
    pub fn add_oob(
        &mut self,
        kind: impl Into<String>,
        event: serde_json::Value,
        oob_id: &str,
        mut headers: Headers,
    ) {
        headers.insert(headers::OOB.to_string(), oob_id.to_string());
        let transient = headers
            .get(headers::OOB_TRANSIENT)
            .is_none_or(|value| value != "false");
        let days_to_live = headers
            .get(headers::OOB_DAYS_TO_LIVE)
            .and_then(|value| value.parse().ok());

        if !self.oobs.iter().any(|oob| oob.id == oob_id) {
            self.oobs.push(OobDefinition {
                id: oob_id.to_string(),
                transient,
                days_to_live,
            });
        }

        let descriptor = self.descriptor(StreamType::Oob, NEW_STREAM_VERSION, headers);
        self.pending_oobs.push(FullEvent {
            event_id: Some(Uuid::new_v4()),
            kind: kind.into(),
            event,
            descriptor,
        });
    }

    /// Stage a snapshot to be written with the next commit.
    ///
    /// Replaces any snapshot staged earlier.
    pub fn add_snapshot(&mut self, memento: serde_json::Value) {
        self.pending_snapshot = Some(Snapshot {
            version: self.commit_version,
            memento,
            taken: Utc::now(),
        });
    }

    /// Settle the pending state.
    ///
    /// With `committed == true` the pending domain events are folded into the
    /// committed history and the stream version advances; otherwise they are
    /// dropped and the commit version falls back to the stream version. Pending
    /// out-of-band events and the pending snapshot are cleared either way.
    pub fn flush(&mut self, committed: bool) {
        if committed {
            if !self.uncommitted.is_empty() {
                let history: Vec<FullEvent> = self
                    .committed
                    .iter()
                    .cloned()
                    .chain(self.uncommitted.drain(..))
                    .collect();
                self.committed = history.into();
            }
            self.stream_version = self.commit_version;
            if let Some(snapshot) = self.pending_snapshot.take() {
                self.snapshot = Some(snapshot);
            }
        } else {
            self.uncommitted.clear();
            self.commit_version = self.stream_version;
            self.pending_snapshot = None;
        }
        self.pending_oobs.clear();
    }
}
