use uuid::Uuid;

use super::{Resolution, ResolveConflicts, ResolveError, commit_resolved};
use crate::{
    config::{ConflictStrategy, DEFAULT_FREEZE_THRESHOLD},
    entity::{Entity, State},
    event::{FullEvent, Headers},
    store::StoreStreams,
};

/// Merge the conflicting batch into the fresh stream and write it now.
///
/// Each domain event goes through its conflict route against the freshly
/// loaded state, in the order it was raised. Batches larger than the freeze
/// threshold run under a freeze on the stream.
#[derive(Debug, Clone)]
pub struct ResolveStrongly<St> {
    store: St,
    freeze_threshold: usize,
}

impl<St> ResolveStrongly<St> {
    #[must_use]
    pub const fn new(store: St) -> Self {
        Self {
            store,
            freeze_threshold: DEFAULT_FREEZE_THRESHOLD,
        }
    }

    #[must_use]
    pub const fn with_freeze_threshold(mut self, freeze_threshold: usize) -> Self {
        self.freeze_threshold = freeze_threshold;
        self
    }
}

impl<St: StoreStreams> ResolveConflicts for ResolveStrongly<St> {
    async fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        commit_id: Uuid,
        commit_headers: &'a Headers,
    ) -> Result<Resolution, ResolveError> {
        tracing::info!(
            entity = S::KIND,
            id = %entity.id(),
            event_count = uncommitted.len(),
            strategy = "resolve_strongly",
            "resolving conflict"
        );

        let result = commit_resolved(
            &self.store,
            entity,
            &uncommitted,
            commit_id,
            commit_headers,
            ConflictStrategy::ResolveStrongly,
            self.freeze_threshold,
        )
        .await;

        match &result {
            Ok(resolution) => tracing::info!(
                entity = S::KIND,
                id = %entity.id(),
                conflicts = entity.conflicts(),
                ?resolution,
                "conflict resolved"
            ),
            Err(err) => tracing::warn!(entity = S::KIND, id = %entity.id(), error = %err, "conflict resolution failed"),
        }
        result
    }
}
