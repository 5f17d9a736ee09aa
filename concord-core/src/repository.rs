//! Unit of work.
//!
//! [`Repository`] hands out entities rebuilt from their streams and commits
//! them back. A commit that loses the optimistic version check is not an
//! error by itself: the repository reloads a clean entity and passes the
//! batch that failed to write to its [`ResolveConflicts`] strategy.

use thiserror::Error;
use uuid::Uuid;

use crate::{
    entity::{Entity, State},
    event::{Headers, Id},
    resolver::{Resolution, ResolveConflicts, ResolveError},
    route::RouteError,
    store::{StoreError, StoreStreams},
    stream::StreamRef,
};

/// Bucket used when none is configured.
pub const DEFAULT_BUCKET: &str = "default";

/// Error returned when an entity cannot be loaded.
#[derive(Debug, Error)]
pub enum LoadError<E>
where
    E: std::error::Error + 'static,
{
    #[error("failed to read stream: {0}")]
    Store(#[from] StoreError<E>),
    #[error("failed to rebuild entity state: {0}")]
    Route(#[from] RouteError),
}

impl<E> From<LoadError<E>> for ResolveError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: LoadError<E>) -> Self {
        match err {
            LoadError::Store(err) => err.into(),
            LoadError::Route(err) => Self::Route(err),
        }
    }
}

/// Error returned by [`Repository::commit`].
#[derive(Debug, Error)]
pub enum CommitError<E>
where
    E: std::error::Error + 'static,
{
    #[error("failed to persist stream: {0}")]
    Store(#[source] StoreError<E>),
    #[error("failed to stage snapshot: {0}")]
    Route(#[source] RouteError),
    #[error("conflict resolution failed: {0}")]
    Resolve(#[source] ResolveError),
}

impl<E: std::error::Error + 'static> From<StoreError<E>> for CommitError<E> {
    fn from(err: StoreError<E>) -> Self {
        Self::Store(err)
    }
}

impl<E: std::error::Error + 'static> From<LoadError<E>> for CommitError<E> {
    fn from(err: LoadError<E>) -> Self {
        match err {
            LoadError::Store(err) => Self::Store(err),
            LoadError::Route(err) => Self::Route(err),
        }
    }
}

/// Outcome of a successful [`Repository::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The stream was written at the given version without a conflict.
    Written { version: i64 },
    /// The entity had nothing pending.
    Clean,
    /// The write conflicted and the resolver settled it.
    Resolved(Resolution),
}

/// Load the entity behind `stream`.
///
/// # Errors
///
/// Returns [`LoadError::Store`] when the stream cannot be read and
/// [`LoadError::Route`] when its snapshot or events cannot be routed.
pub async fn load_entity<St, S>(store: &St, stream: &StreamRef) -> Result<Entity<S>, LoadError<St::Error>>
where
    St: StoreStreams,
    S: State,
{
    let stream = store.get_stream(stream).await?;
    Ok(Entity::from_stream(stream)?)
}

/// Loads and commits entities over a [`StoreStreams`], resolving write
/// conflicts with `R`.
#[derive(Debug, Clone)]
pub struct Repository<St, R> {
    store: St,
    resolver: R,
    bucket: String,
}

impl<St, R> Repository<St, R> {
    #[must_use]
    pub fn new(store: St, resolver: R) -> Self {
        Self {
            store,
            resolver,
            bucket: DEFAULT_BUCKET.to_string(),
        }
    }

    /// Keep this repository's streams in `bucket`.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    #[must_use]
    pub const fn store(&self) -> &St {
        &self.store
    }

    #[must_use]
    pub const fn resolver(&self) -> &R {
        &self.resolver
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn stream_ref<S: State>(&self, id: Id, parents: Vec<crate::event::ParentRef>) -> StreamRef {
        StreamRef {
            entity: S::KIND.to_string(),
            bucket: self.bucket.clone(),
            id,
            parents,
        }
    }
}

impl<St, R> Repository<St, R>
where
    St: StoreStreams,
    R: ResolveConflicts,
{
    /// Start a new entity. Nothing is written until [`Repository::commit`].
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when the routes of `S` cannot be built.
    pub fn new_entity<S: State>(&self, id: impl Into<Id>) -> Result<Entity<S>, RouteError> {
        let stream = self.store.new_stream(&self.stream_ref::<S>(id.into(), Vec::new()));
        Entity::from_stream(stream)
    }

    /// Load a top-level entity.
    ///
    /// # Errors
    ///
    /// See [`load_entity`].
    #[tracing::instrument(skip(self, id), fields(entity = S::KIND, id = tracing::field::Empty))]
    pub async fn get<S: State>(&self, id: impl Into<Id>) -> Result<Entity<S>, LoadError<St::Error>> {
        let id = id.into();
        tracing::Span::current().record("id", tracing::field::display(&id));
        load_entity(&self.store, &self.stream_ref::<S>(id, Vec::new())).await
    }

    /// Load an entity owned by `parent`.
    ///
    /// The child's stream key carries the whole parent chain, so children of
    /// different parents never share a stream.
    ///
    /// # Errors
    ///
    /// See [`load_entity`].
    pub async fn get_child<S: State, P: State>(
        &self,
        parent: &Entity<P>,
        id: impl Into<Id>,
    ) -> Result<Entity<S>, LoadError<St::Error>> {
        let mut parents = parent.parents().to_vec();
        parents.push(parent.parent_ref());
        load_entity(&self.store, &self.stream_ref::<S>(id.into(), parents)).await
    }

    /// Start a new entity owned by `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when the routes of `S` cannot be built.
    pub fn new_child<S: State, P: State>(
        &self,
        parent: &Entity<P>,
        id: impl Into<Id>,
    ) -> Result<Entity<S>, RouteError> {
        let mut parents = parent.parents().to_vec();
        parents.push(parent.parent_ref());
        let stream = self.store.new_stream(&self.stream_ref::<S>(id.into(), parents));
        Entity::from_stream(stream)
    }

    /// Write everything `entity` has pending.
    ///
    /// A snapshot is staged first when the state's policy asks for one. When
    /// the stream moved on since `entity` was loaded, a clean copy is loaded
    /// and the pending batch is handed to the resolver; on success `entity`
    /// is replaced by the resolved copy. On failure `entity` keeps its
    /// pending batch.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::Store`] for store failures other than a version
    /// conflict and [`CommitError::Resolve`] when the resolver fails.
    pub async fn commit<S: State>(
        &self,
        entity: &mut Entity<S>,
        commit_id: Uuid,
        commit_headers: &Headers,
    ) -> Result<CommitOutcome, CommitError<St::Error>> {
        if !entity.stream().dirty() {
            tracing::trace!(entity = S::KIND, id = %entity.id(), "nothing to commit");
            return Ok(CommitOutcome::Clean);
        }

        if entity.should_take_snapshot() {
            entity.take_snapshot().map_err(CommitError::Route)?;
        }

        let conflict = match self
            .store
            .write_stream(commit_id, entity.stream(), commit_headers)
            .await
        {
            Ok(version) => {
                entity.stream_mut().flush(true);
                tracing::debug!(entity = S::KIND, id = %entity.id(), version, %commit_id, "stream committed");
                return Ok(CommitOutcome::Written { version });
            }
            Err(StoreError::Version(conflict)) => conflict,
            Err(err) => return Err(err.into()),
        };

        let uncommitted = entity.stream().pending_events();
        tracing::info!(
            entity = S::KIND,
            id = %entity.id(),
            expected = conflict.expected,
            actual = conflict.actual,
            event_count = uncommitted.len(),
            "version conflict on commit, resolving"
        );

        let mut fresh: Entity<S> = load_entity(&self.store, &entity.stream().stream_ref()).await?;
        let resolution = self
            .resolver
            .resolve(&mut fresh, uncommitted, commit_id, commit_headers)
            .await
            .map_err(CommitError::Resolve)?;

        *entity = fresh;
        Ok(CommitOutcome::Resolved(resolution))
    }
}
