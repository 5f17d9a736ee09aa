//! Conflict resolution strategies.
//!
//! When a commit loses the optimistic version check, the repository reloads
//! a clean entity and hands it, together with the batch that failed to write,
//! to a [`ResolveConflicts`] implementation:
//!
//! - [`Throw`]: fail the commit
//! - [`Discard`]: drop the batch
//! - [`Ignore`]: write the batch without a version check
//! - [`ResolveStrongly`]: merge the batch through the entity's conflict routes
//!   and write it now
//! - [`ResolveWeakly`]: stage the batch and merge it once staged conflicts on
//!   the stream are old enough
//!
//! Custom strategies implement [`ResolveConflicts`] directly.
//!
//! Only [`StreamType::Domain`] events go through conflict routes. Out-of-band
//! events in the batch are raised again on the fresh stream and written with
//! it.

use std::future::Future;

use thiserror::Error;
use uuid::Uuid;

use crate::{
    concurrency::VersionConflict,
    config::{ConflictConfig, ConflictStrategy},
    entity::{Entity, State},
    event::{FullEvent, Headers, StreamType},
    route::{AbandonConflict, ConflictError, ConflictSignal, RouteError},
    store::{StoreError, StoreStreams},
};

mod discard;
mod ignore;
mod strong;
mod throw;
mod weak;

pub use discard::Discard;
pub use ignore::Ignore;
pub use strong::ResolveStrongly;
pub use throw::Throw;
pub use weak::{ConflictingEvents, ResolveWeakly, WEAK_CHANNEL};

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The batch (or what was left of it) was written.
    Committed,
    /// Nothing was written.
    Discarded,
    /// The batch was staged for later resolution.
    Deferred,
}

/// The conflict could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflict resolution failed for `{entity}`: {reason}")]
pub struct ConflictResolutionFailed {
    pub entity: String,
    pub reason: String,
}

impl ConflictResolutionFailed {
    #[must_use]
    pub fn new(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Error returned by [`ResolveConflicts::resolve`].
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The conflict cannot be merged.
    #[error(transparent)]
    Failed(#[from] ConflictResolutionFailed),
    /// A conflict route asked to abandon the resolution.
    #[error(transparent)]
    Abandoned(#[from] AbandonConflict),
    /// The stream (or its freeze) raced another writer.
    #[error(transparent)]
    Version(#[from] VersionConflict),
    /// The stream is frozen by another instance.
    #[error("stream `{stream}` is frozen by {owner}")]
    Frozen { stream: String, owner: Uuid },
    /// An event or snapshot could not be routed.
    #[error(transparent)]
    Route(RouteError),
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("delayed channel error: {0}")]
    Channel(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl ResolveError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Version(_) | Self::Frozen { .. } | Self::Store(_) | Self::Channel(_)
        )
    }

    pub(crate) fn channel(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Channel(Box::new(err))
    }

    fn from_conflict(entity: &str, err: ConflictError) -> Self {
        match err {
            ConflictError::Route(RouteError::NoRoute { kind, .. }) => {
                ConflictResolutionFailed::new(entity, format!("no conflict route for `{kind}`"))
                    .into()
            }
            ConflictError::Route(err) => Self::Route(err),
            ConflictError::Signal(ConflictSignal::Abandon(abandon)) => Self::Abandoned(abandon),
            ConflictError::Signal(ConflictSignal::Discard(_)) => {
                ConflictResolutionFailed::new(entity, "event discarded outside of a batch").into()
            }
        }
    }
}

impl<E> From<StoreError<E>> for ResolveError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: StoreError<E>) -> Self {
        match err {
            StoreError::Version(conflict) => Self::Version(conflict),
            StoreError::Frozen { stream, owner } => Self::Frozen { stream, owner },
            StoreError::Codec(err) => Self::Store(Box::new(err)),
            StoreError::Backend(err) => Self::Store(Box::new(err)),
        }
    }
}

/// Strategy invoked when a commit collides with a concurrent write.
pub trait ResolveConflicts: Send + Sync {
    /// Settle `uncommitted`, the batch that failed to write.
    ///
    /// `entity` is freshly loaded from the store and holds no pending events.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Failed`] when the batch cannot be merged and
    /// [`ResolveError::Abandoned`] when a conflict route abandoned it. Store
    /// failures propagate.
    fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        commit_id: Uuid,
        commit_headers: &'a Headers,
    ) -> impl Future<Output = Result<Resolution, ResolveError>> + Send + 'a;
}

/// Replay a conflicting batch onto `entity`, in order.
///
/// Domain events go through their conflict route; an event whose route
/// signals [`DiscardEvent`](crate::route::DiscardEvent) is skipped.
/// Out-of-band events are raised again. Other stream types are dropped.
/// Returns the number of domain events merged.
///
/// # Errors
///
/// Stops at the first event without a conflict route
/// ([`ResolveError::Failed`]) or whose route abandons the batch
/// ([`ResolveError::Abandoned`]).
pub fn replay<S: State>(
    entity: &mut Entity<S>,
    events: &[FullEvent],
    strategy: ConflictStrategy,
) -> Result<usize, ResolveError> {
    let mut merged = 0;
    for event in events {
        match event.stream_type() {
            StreamType::Domain => match entity.conflict(event, strategy.as_str()) {
                Ok(()) => merged += 1,
                Err(ConflictError::Signal(ConflictSignal::Discard(_))) => {
                    tracing::debug!(entity = S::KIND, kind = %event.kind, "conflicting event discarded");
                }
                Err(err) => return Err(ResolveError::from_conflict(S::KIND, err)),
            },
            StreamType::Oob => {
                entity.reraise(event);
            }
            other => {
                tracing::trace!(entity = S::KIND, stream_type = %other, "skipping event");
            }
        }
    }
    Ok(merged)
}

/// Replay `events` onto `entity` and write the result.
///
/// Freezes the stream first when the batch holds more than
/// `freeze_threshold` domain events, and releases the freeze afterwards on
/// every path once it was taken. A snapshot is staged at most once.
pub(crate) async fn commit_resolved<St, S>(
    store: &St,
    entity: &mut Entity<S>,
    events: &[FullEvent],
    commit_id: Uuid,
    commit_headers: &Headers,
    strategy: ConflictStrategy,
    freeze_threshold: usize,
) -> Result<Resolution, ResolveError>
where
    St: StoreStreams,
    S: State,
{
    let domain_events = events
        .iter()
        .filter(|event| event.stream_type() == StreamType::Domain)
        .count();

    let frozen = if domain_events > freeze_threshold {
        store.freeze(entity.stream()).await?;
        tracing::debug!(domain_events, freeze_threshold, "stream frozen for resolution");
        true
    } else {
        false
    };

    let result = merge_and_write(store, entity, events, commit_id, commit_headers, strategy).await;

    if frozen {
        let released = store.unfreeze(entity.stream()).await;
        match (&result, released) {
            (_, Ok(())) => tracing::debug!("stream unfrozen after resolution"),
            (Ok(_), Err(err)) => return Err(err.into()),
            (Err(_), Err(err)) => {
                tracing::warn!(error = %err, "failed to unfreeze stream after failed resolution");
            }
        }
    }

    result
}

async fn merge_and_write<St, S>(
    store: &St,
    entity: &mut Entity<S>,
    events: &[FullEvent],
    commit_id: Uuid,
    commit_headers: &Headers,
    strategy: ConflictStrategy,
) -> Result<Resolution, ResolveError>
where
    St: StoreStreams,
    S: State,
{
    let merged = replay(entity, events, strategy)?;

    if entity.should_take_snapshot() {
        entity.take_snapshot().map_err(ResolveError::Route)?;
        tracing::debug!(version = entity.stream().commit_version(), "snapshot staged");
    }

    if !entity.stream().dirty() {
        tracing::debug!("every conflicting event was discarded, nothing to write");
        return Ok(Resolution::Discarded);
    }

    store
        .write_stream(commit_id, entity.stream(), commit_headers)
        .await?;
    entity.stream_mut().flush(true);
    tracing::debug!(merged, "resolved events written");
    Ok(Resolution::Committed)
}

/// Resolver chosen at runtime, typically from [`ConflictConfig`].
#[derive(Debug, Clone)]
pub enum Strategy<St, Ch> {
    Throw(Throw),
    Discard(Discard),
    Ignore(Ignore<St>),
    ResolveStrongly(ResolveStrongly<St>),
    ResolveWeakly(ResolveWeakly<St, Ch>),
}

impl<St, Ch> Strategy<St, Ch> {
    /// Build the resolver named by `config.strategy`.
    ///
    /// `streams` and `weak` are the collaborators of the strategies that
    /// need them; unused ones are dropped.
    #[must_use]
    pub fn from_config(config: &ConflictConfig, streams: St, weak: ResolveWeakly<St, Ch>) -> Self {
        match config.strategy {
            ConflictStrategy::Throw => Self::Throw(Throw),
            ConflictStrategy::Discard => Self::Discard(Discard),
            ConflictStrategy::Ignore => Self::Ignore(Ignore::new(streams)),
            ConflictStrategy::ResolveStrongly => Self::ResolveStrongly(
                ResolveStrongly::new(streams).with_freeze_threshold(config.freeze_threshold),
            ),
            ConflictStrategy::ResolveWeakly => Self::ResolveWeakly(weak),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ConflictStrategy {
        match self {
            Self::Throw(_) => ConflictStrategy::Throw,
            Self::Discard(_) => ConflictStrategy::Discard,
            Self::Ignore(_) => ConflictStrategy::Ignore,
            Self::ResolveStrongly(_) => ConflictStrategy::ResolveStrongly,
            Self::ResolveWeakly(_) => ConflictStrategy::ResolveWeakly,
        }
    }
}

impl<St, Ch> ResolveConflicts for Strategy<St, Ch>
where
    St: StoreStreams,
    Ch: crate::channel::DelayedChannel<ConflictingEvents>,
{
    async fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        commit_id: Uuid,
        commit_headers: &'a Headers,
    ) -> Result<Resolution, ResolveError> {
        match self {
            Self::Throw(resolver) => {
                resolver
                    .resolve(entity, uncommitted, commit_id, commit_headers)
                    .await
            }
            Self::Discard(resolver) => {
                resolver
                    .resolve(entity, uncommitted, commit_id, commit_headers)
                    .await
            }
            Self::Ignore(resolver) => {
                resolver
                    .resolve(entity, uncommitted, commit_id, commit_headers)
                    .await
            }
            Self::ResolveStrongly(resolver) => {
                resolver
                    .resolve(entity, uncommitted, commit_id, commit_headers)
                    .await
            }
            Self::ResolveWeakly(resolver) => {
                resolver
                    .resolve(entity, uncommitted, commit_id, commit_headers)
                    .await
            }
        }
    }
}
