//! Recording collaborators and a test domain shared by the integration tests.
//!
//! The recording collaborators delegate to the in-memory reference
//! implementations and append every call to a per-thread journal, which the
//! conflict routes of [`Tally`] write to as well. Tests run on the
//! current-thread runtime, so one journal sees the whole interleaving.

#![allow(dead_code)]

use std::{
    cell::RefCell,
    convert::Infallible,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use concord::{
    AbandonConflict, Apply, Conflict, ConflictSignal, DiscardEvent, DomainEvent, Entity,
    FullEvent, Headers, Id, Routes, State,
    channel::{DelayedChannel, DelayedMessage, inmemory::Channel},
    resolver::ConflictingEvents,
    snapshot::SnapshotPolicy,
    store::{
        StoreError, StoreEvents, StoreStreams, StreamMetadata, StreamStore, VersionConflict,
        inmemory,
    },
    stream::{EventStream, StreamRef},
    StreamType,
};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Journal
// ============================================================================

thread_local! {
    static JOURNAL: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub fn record(entry: impl Into<String>) {
    JOURNAL.with(|journal| journal.borrow_mut().push(entry.into()));
}

/// Drain the journal of the current thread.
pub fn take_journal() -> Vec<String> {
    JOURNAL.with(|journal| std::mem::take(&mut *journal.borrow_mut()))
}

pub fn count(journal: &[String], prefix: &str) -> usize {
    journal
        .iter()
        .filter(|entry| entry.starts_with(prefix))
        .count()
}

pub fn position(journal: &[String], prefix: &str) -> Option<usize> {
    journal.iter().position(|entry| entry.starts_with(prefix))
}

// ============================================================================
// Test Domain: Tally
// ============================================================================

/// A step whose conflict route is abandoned.
pub const POISON: u32 = u32::MAX;
/// A step whose conflict route discards just that event.
pub const SKIP: u32 = 0;
pub const BUCKET: &str = "test";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub n: u32,
}

impl DomainEvent for Step {
    const KIND: &'static str = "tally.step";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Noted {
    pub text: String,
}

impl DomainEvent for Noted {
    const KIND: &'static str = "tally.noted";
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Steps applied through the handle route.
    pub applied: Vec<u32>,
    /// Steps merged through the conflict route.
    pub merged: Vec<u32>,
}

impl Apply<Step> for Tally {
    fn apply(&mut self, event: &Step) {
        self.applied.push(event.n);
    }
}

impl Conflict<Step> for Tally {
    fn conflict(&mut self, event: &Step) -> Result<(), ConflictSignal> {
        record(format!("conflict:{}", event.n));
        match event.n {
            POISON => Err(AbandonConflict::new("poison step").into()),
            SKIP => Err(DiscardEvent.into()),
            n => {
                self.merged.push(n);
                Ok(())
            }
        }
    }
}

impl State for Tally {
    const KIND: &'static str = "tally";

    fn routes(routes: Routes<Self>) -> Routes<Self> {
        routes
            .handle::<Step>()
            .conflict::<Step>()
            .snapshots(SnapshotPolicy::EveryNEvents(3))
    }
}

pub fn stream_ref(id: &str) -> StreamRef {
    StreamRef {
        entity: Tally::KIND.to_string(),
        bucket: BUCKET.to_string(),
        id: Id::from(id),
        parents: Vec::new(),
    }
}

fn scratch(id: &str) -> EventStream {
    EventStream::empty(Tally::KIND, BUCKET, Id::from(id), Vec::new())
}

/// The pending batch of a writer that lost the race on `id`.
pub fn losing_batch(id: &str, steps: &[u32]) -> Vec<FullEvent> {
    let mut stream = scratch(id);
    for n in steps {
        let payload = serde_json::to_value(Step { n: *n }).unwrap();
        stream.add(Step::KIND, payload, Headers::new());
    }
    stream.pending_events()
}

/// A losing batch holding only out-of-band notes on channel `audit`.
pub fn oob_batch(id: &str, notes: &[&str]) -> Vec<FullEvent> {
    let mut stream = scratch(id);
    for text in notes {
        let payload = serde_json::to_value(Noted {
            text: (*text).to_string(),
        })
        .unwrap();
        stream.add_oob(Noted::KIND, payload, "audit", Headers::new());
    }
    stream.pending_events()
}

/// Load `id` from `store`, as the repository does before resolving.
pub async fn fresh<St: StoreStreams>(store: &St, id: &str) -> Entity<Tally> {
    let stream = store.get_stream(&stream_ref(id)).await.unwrap();
    Entity::from_stream(stream).unwrap()
}

/// Commit `steps` to `id` through `store`.
pub async fn seed<St: StoreStreams>(store: &St, id: &str, steps: &[u32]) {
    let mut entity = fresh(store, id).await;
    for n in steps {
        entity.apply(Step { n: *n }).unwrap();
    }
    store
        .write_stream(Uuid::new_v4(), entity.stream(), &Headers::new())
        .await
        .unwrap();
}

pub fn domain_key(id: &str) -> String {
    stream_ref(id).key(StreamType::Domain)
}

// ============================================================================
// Recording Collaborators
// ============================================================================

/// Backend error of [`RecordingStreams`] while reads are switched off.
#[derive(Debug, thiserror::Error)]
#[error("store unavailable")]
pub struct Unavailable;

fn widen(err: StoreError<Infallible>) -> StoreError<Unavailable> {
    match err {
        StoreError::Version(conflict) => StoreError::Version(conflict),
        StoreError::Frozen { stream, owner } => StoreError::Frozen { stream, owner },
        StoreError::Codec(err) => StoreError::Codec(err),
        StoreError::Backend(never) => match never {},
    }
}

/// [`StoreStreams`] over the in-memory store, journaling freeze, unfreeze and
/// write calls.
#[derive(Debug, Clone)]
pub struct RecordingStreams {
    inner: StreamStore<inmemory::Store>,
    fail_freeze: bool,
    fail_loads: Arc<AtomicBool>,
}

impl RecordingStreams {
    pub fn new() -> Self {
        Self {
            inner: StreamStore::new(inmemory::Store::new()),
            fail_freeze: false,
            fail_loads: Arc::default(),
        }
    }

    /// A store whose freeze always loses a metadata race.
    pub fn failing_freeze() -> Self {
        Self {
            fail_freeze: true,
            ..Self::new()
        }
    }

    /// Make every clone of this store fail `get_stream` with [`Unavailable`].
    pub fn set_failing_loads(&self, failing: bool) {
        self.fail_loads.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> &inmemory::Store {
        self.inner.events()
    }
}

impl StoreStreams for RecordingStreams {
    type Error = Unavailable;

    async fn get_stream<'a>(
        &'a self,
        stream: &'a StreamRef,
    ) -> Result<EventStream, StoreError<Unavailable>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            record("get_stream:unavailable");
            return Err(StoreError::Backend(Unavailable));
        }
        self.inner.get_stream(stream).await.map_err(widen)
    }

    async fn write_stream<'a>(
        &'a self,
        commit_id: Uuid,
        stream: &'a EventStream,
        commit_headers: &'a Headers,
    ) -> Result<i64, StoreError<Unavailable>> {
        record(format!("write_stream:{}", stream.uncommitted().len()));
        self.inner
            .write_stream(commit_id, stream, commit_headers)
            .await
            .map_err(widen)
    }

    async fn append_stream<'a>(
        &'a self,
        commit_id: Uuid,
        stream: &'a EventStream,
        commit_headers: &'a Headers,
    ) -> Result<i64, StoreError<Unavailable>> {
        record(format!("append_stream:{}", stream.uncommitted().len()));
        self.inner
            .append_stream(commit_id, stream, commit_headers)
            .await
            .map_err(widen)
    }

    async fn freeze<'a>(&'a self, stream: &'a EventStream) -> Result<(), StoreError<Unavailable>> {
        record("freeze");
        if self.fail_freeze {
            return Err(VersionConflict::new(stream.stream_key(StreamType::Domain), 0, 1).into());
        }
        self.inner.freeze(stream).await.map_err(widen)
    }

    async fn unfreeze<'a>(
        &'a self,
        stream: &'a EventStream,
    ) -> Result<(), StoreError<Unavailable>> {
        record("unfreeze");
        self.inner.unfreeze(stream).await.map_err(widen)
    }

    async fn verify_version<'a>(
        &'a self,
        stream: &'a EventStream,
    ) -> Result<(), StoreError<Unavailable>> {
        self.inner.verify_version(stream).await.map_err(widen)
    }
}

/// [`StoreEvents`] over the in-memory store, journaling appends with their
/// expected version.
#[derive(Debug, Clone, Default)]
pub struct RecordingEvents {
    pub inner: inmemory::Store,
}

impl StoreEvents for RecordingEvents {
    type Error = Infallible;

    fn get_events<'a>(
        &'a self,
        stream: &'a str,
        start: i64,
        count: Option<usize>,
    ) -> impl Future<Output = Result<Vec<FullEvent>, StoreError<Infallible>>> + Send + 'a {
        self.inner.get_events(stream, start, count)
    }

    fn get_events_backwards<'a>(
        &'a self,
        stream: &'a str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<FullEvent>, StoreError<Infallible>>> + Send + 'a {
        self.inner.get_events_backwards(stream, count)
    }

    fn write_events<'a>(
        &'a self,
        stream: &'a str,
        events: NonEmpty<FullEvent>,
        commit_headers: &'a Headers,
        expected_version: Option<i64>,
    ) -> impl Future<Output = Result<i64, StoreError<Infallible>>> + Send + 'a {
        record(format!(
            "write_events:{stream}:{}:{expected_version:?}",
            events.len()
        ));
        self.inner
            .write_events(stream, events, commit_headers, expected_version)
    }

    fn verify_version<'a>(
        &'a self,
        stream: &'a str,
        expected_version: i64,
    ) -> impl Future<Output = Result<(), StoreError<Infallible>>> + Send + 'a {
        self.inner.verify_version(stream, expected_version)
    }

    fn get_metadata<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = Result<(i64, StreamMetadata), StoreError<Infallible>>> + Send + 'a
    {
        self.inner.get_metadata(stream)
    }

    fn write_metadata<'a>(
        &'a self,
        stream: &'a str,
        metadata: StreamMetadata,
        expected_revision: i64,
    ) -> impl Future<Output = Result<i64, StoreError<Infallible>>> + Send + 'a {
        self.inner
            .write_metadata(stream, metadata, expected_revision)
    }
}

/// Delayed channel over the in-memory channel, journaling staging and pulls.
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    pub inner: Channel<ConflictingEvents>,
}

impl DelayedChannel<ConflictingEvents> for RecordingChannel {
    type Error = Infallible;

    fn age<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<Duration>, Infallible>> + Send + 'a {
        self.inner.age(channel, key)
    }

    fn size<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
    ) -> impl Future<Output = Result<usize, Infallible>> + Send + 'a {
        self.inner.size(channel, key)
    }

    fn add_to_queue<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        message: ConflictingEvents,
    ) -> impl Future<Output = Result<(), Infallible>> + Send + 'a {
        record(format!("add_to_queue:{}", message.events.len()));
        self.inner.add_to_queue(channel, key, message)
    }

    fn pull<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        max: Option<usize>,
    ) -> impl Future<Output = Result<Vec<DelayedMessage<ConflictingEvents>>, Infallible>> + Send + 'a
    {
        record("pull");
        self.inner.pull(channel, key, max)
    }

    fn requeue<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        messages: Vec<DelayedMessage<ConflictingEvents>>,
    ) -> impl Future<Output = Result<(), Infallible>> + Send + 'a {
        record(format!("requeue:{}", messages.len()));
        self.inner.requeue(channel, key, messages)
    }
}
