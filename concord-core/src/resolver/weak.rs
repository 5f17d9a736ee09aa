use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Resolution, ResolveConflicts, ResolveError, commit_resolved};
use crate::{
    channel::{DelayedChannel, DelayedMessage},
    config::{
        ConflictConfig, ConflictStrategy, DEFAULT_FREEZE_THRESHOLD, DEFAULT_WEAK_AGE_THRESHOLD,
    },
    deferred::DeferredQueue,
    entity::{Entity, State},
    event::{FullEvent, Headers, ParentRef, StreamType},
    repository::load_entity,
    store::StoreStreams,
    stream::StreamRef,
};

/// Delayed channel the weak resolver stages conflicts on.
pub const WEAK_CHANNEL: &str = "resolve_weakly";

/// A staged conflicting batch.
///
/// Self-describing: the entity type, parent chain and the events (whose
/// descriptors carry bucket and stream id) are enough to load the stream and
/// resolve the batch on any node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictingEvents {
    pub entity_type: String,
    #[serde(default)]
    pub parents: Vec<ParentRef>,
    pub events: Vec<FullEvent>,
}

impl ConflictingEvents {
    /// Stream the batch belongs to, or `None` for an empty batch.
    #[must_use]
    pub fn stream_ref(&self) -> Option<StreamRef> {
        let first = self.events.first()?;
        Some(StreamRef {
            entity: self.entity_type.clone(),
            bucket: first.descriptor.bucket.clone(),
            id: first.descriptor.stream_id.clone(),
            parents: self.parents.clone(),
        })
    }
}

/// Stage the conflicting batch and resolve staged batches once they are due.
///
/// While the oldest batch staged for a stream is younger than the age
/// threshold, new conflicts are only staged and the stream is scheduled on
/// the [`DeferredQueue`]. The first conflict (or deferred run) after that
/// pulls the staged batches, appends the current one, and merges them all in
/// one strong-style resolution. Staged batches that fail to merge return to
/// the front of the channel.
///
/// Staged batches are keyed by the stream's domain key, so conflicts of
/// different streams never meet in one resolution.
#[derive(Debug, Clone)]
pub struct ResolveWeakly<St, Ch> {
    store: St,
    channel: Ch,
    deferred: DeferredQueue<StreamRef>,
    age_threshold: Duration,
    pull_max: Option<usize>,
    freeze_threshold: usize,
}

impl<St, Ch> ResolveWeakly<St, Ch> {
    #[must_use]
    pub fn new(store: St, channel: Ch) -> Self {
        Self {
            store,
            channel,
            deferred: DeferredQueue::new(),
            age_threshold: DEFAULT_WEAK_AGE_THRESHOLD,
            pull_max: None,
            freeze_threshold: DEFAULT_FREEZE_THRESHOLD,
        }
    }

    #[must_use]
    pub fn from_config(config: &ConflictConfig, store: St, channel: Ch) -> Self {
        Self::new(store, channel)
            .with_age_threshold(config.weak_age_threshold())
            .with_pull_max(config.weak_pull_max)
            .with_freeze_threshold(config.freeze_threshold)
    }

    /// Share a deferred queue with other resolvers or workers.
    #[must_use]
    pub fn with_deferred(mut self, deferred: DeferredQueue<StreamRef>) -> Self {
        self.deferred = deferred;
        self
    }

    #[must_use]
    pub const fn with_age_threshold(mut self, threshold: Duration) -> Self {
        self.age_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_pull_max(mut self, max: Option<usize>) -> Self {
        self.pull_max = max;
        self
    }

    #[must_use]
    pub const fn with_freeze_threshold(mut self, freeze_threshold: usize) -> Self {
        self.freeze_threshold = freeze_threshold;
        self
    }

    #[must_use]
    pub const fn deferred(&self) -> &DeferredQueue<StreamRef> {
        &self.deferred
    }

    #[must_use]
    pub const fn channel(&self) -> &Ch {
        &self.channel
    }

    #[must_use]
    pub const fn store(&self) -> &St {
        &self.store
    }
}

impl<St, Ch> ResolveWeakly<St, Ch>
where
    St: StoreStreams,
    Ch: DelayedChannel<ConflictingEvents>,
{
    /// Pull the batches staged for `entity`'s stream, append `current`, and
    /// merge them into the stream.
    ///
    /// Staged batches were accepted from earlier callers and are never
    /// dropped. When `current` is rejected (abandoned, or without a conflict
    /// route) the staged batches are merged again on their own. Whenever they
    /// cannot be merged they go back to the front of the channel and the
    /// stream is rescheduled after the age threshold.
    ///
    /// # Errors
    ///
    /// Same as [`ResolveStrongly`](super::ResolveStrongly), plus
    /// [`ResolveError::Channel`]. The error always concerns the merge that
    /// included `current`.
    pub async fn resolve_staged<S: State>(
        &self,
        entity: &mut Entity<S>,
        current: Vec<FullEvent>,
        commit_id: Uuid,
        commit_headers: &Headers,
    ) -> Result<Resolution, ResolveError> {
        let key = entity.stream().stream_key(StreamType::Domain);
        let staged = self
            .channel
            .size(WEAK_CHANNEL, &key)
            .await
            .map_err(ResolveError::channel)?;
        let pulled = self
            .channel
            .pull(WEAK_CHANNEL, &key, self.pull_max)
            .await
            .map_err(ResolveError::channel)?;

        let has_current = !current.is_empty();
        let mut events = staged_events(&pulled);
        events.extend(current);
        tracing::debug!(
            stream = %key,
            staged,
            pulled = pulled.len(),
            event_count = events.len(),
            "merging staged conflicts"
        );
        if events.is_empty() {
            return Ok(Resolution::Discarded);
        }

        let result = commit_resolved(
            &self.store,
            entity,
            &events,
            commit_id,
            commit_headers,
            ConflictStrategy::ResolveWeakly,
            self.freeze_threshold,
        )
        .await;

        let settled = match &result {
            Ok(_) => true,
            Err(err) if !err.is_transient() && has_current && !pulled.is_empty() => {
                tracing::warn!(stream = %key, error = %err, "current batch rejected, merging staged batches alone");
                self.merge_staged_alone(entity, &pulled).await
            }
            Err(_) => false,
        };

        if settled {
            let remaining = staged.saturating_sub(pulled.len());
            if remaining > 0 {
                self.deferred.schedule(entity.stream().stream_ref(), Duration::ZERO);
            }
            tracing::info!(
                stream = %key,
                conflicts = entity.conflicts(),
                remaining,
                "staged conflicts resolved"
            );
        } else if !pulled.is_empty() {
            let batches = pulled.len();
            self.channel
                .requeue(WEAK_CHANNEL, &key, pulled)
                .await
                .map_err(ResolveError::channel)?;
            self.deferred
                .schedule(entity.stream().stream_ref(), self.age_threshold);
            tracing::warn!(stream = %key, batches, "staged conflicts not merged, requeued");
        }
        result
    }

    /// Merge `pulled` into a freshly loaded copy of `entity`'s stream.
    /// Replaces `entity` and returns `true` on success.
    async fn merge_staged_alone<S: State>(
        &self,
        entity: &mut Entity<S>,
        pulled: &[DelayedMessage<ConflictingEvents>],
    ) -> bool {
        let stream = entity.stream().stream_ref();
        let merged = async {
            let mut fresh: Entity<S> = load_entity(&self.store, &stream).await?;
            let resolution = commit_resolved(
                &self.store,
                &mut fresh,
                &staged_events(pulled),
                Uuid::new_v4(),
                &Headers::new(),
                ConflictStrategy::ResolveWeakly,
                self.freeze_threshold,
            )
            .await?;
            Ok::<_, ResolveError>((fresh, resolution))
        }
        .await;

        match merged {
            Ok((fresh, resolution)) => {
                *entity = fresh;
                tracing::debug!(?resolution, "staged batches merged without the rejected batch");
                true
            }
            Err(err) => {
                tracing::error!(entity = S::KIND, id = %stream.id, error = %err, "staged batches cannot be merged");
                false
            }
        }
    }

    /// Load the stream and resolve what is staged for it.
    ///
    /// Runs off the command path, from the deferred worker. A load that
    /// fails transiently reschedules the stream after the age threshold.
    ///
    /// # Errors
    ///
    /// See [`ResolveWeakly::resolve_staged`]; loading failures are reported as
    /// store or route errors.
    pub async fn handle_conflicting_events<S: State>(
        &self,
        stream: &StreamRef,
    ) -> Result<Resolution, ResolveError> {
        let mut entity = match load_entity::<St, S>(&self.store, stream).await {
            Ok(entity) => entity,
            Err(err) => {
                let err = ResolveError::from(err);
                if err.is_transient() {
                    self.deferred.schedule(stream.clone(), self.age_threshold);
                    tracing::warn!(entity = S::KIND, id = %stream.id, error = %err, "load failed, stream rescheduled");
                }
                return Err(err);
            }
        };
        self.resolve_staged(&mut entity, Vec::new(), Uuid::new_v4(), &Headers::new())
            .await
    }
}

fn staged_events(pulled: &[DelayedMessage<ConflictingEvents>]) -> Vec<FullEvent> {
    pulled
        .iter()
        .flat_map(|item| item.message.events.iter().cloned())
        .collect()
}

impl<St, Ch> ResolveConflicts for ResolveWeakly<St, Ch>
where
    St: StoreStreams,
    Ch: DelayedChannel<ConflictingEvents>,
{
    async fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        commit_id: Uuid,
        commit_headers: &'a Headers,
    ) -> Result<Resolution, ResolveError> {
        let key = entity.stream().stream_key(StreamType::Domain);
        let age = self
            .channel
            .age(WEAK_CHANNEL, &key)
            .await
            .map_err(ResolveError::channel)?;

        match age {
            Some(age) if age >= self.age_threshold => {
                tracing::info!(stream = %key, ?age, strategy = "resolve_weakly", "staged conflicts due, resolving");
                self.resolve_staged(entity, uncommitted, commit_id, commit_headers)
                    .await
            }
            _ => {
                let event_count = uncommitted.len();
                let message = ConflictingEvents {
                    entity_type: S::KIND.to_string(),
                    parents: entity.parents().to_vec(),
                    events: uncommitted,
                };
                self.channel
                    .add_to_queue(WEAK_CHANNEL, &key, message)
                    .await
                    .map_err(ResolveError::channel)?;

                let delay = self.age_threshold.saturating_sub(age.unwrap_or_default());
                self.deferred.schedule(entity.stream().stream_ref(), delay);
                tracing::info!(
                    stream = %key,
                    event_count,
                    ?delay,
                    strategy = "resolve_weakly",
                    "conflict staged"
                );
                Ok(Resolution::Deferred)
            }
        }
    }
}
