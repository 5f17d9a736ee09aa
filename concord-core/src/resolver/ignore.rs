use uuid::Uuid;

use super::{Resolution, ResolveConflicts, ResolveError};
use crate::{
    config::ConflictStrategy,
    entity::{Entity, State},
    event::{FullEvent, Headers, StreamType},
    store::StoreStreams,
};

/// Write the conflicting batch anyway: last writer wins.
///
/// Domain events are applied to the fresh entity through their handle routes
/// and appended without an expected-version check. No conflict route runs.
#[derive(Debug, Clone)]
pub struct Ignore<St> {
    store: St,
}

impl<St> Ignore<St> {
    #[must_use]
    pub const fn new(store: St) -> Self {
        Self { store }
    }
}

impl<St: StoreStreams> ResolveConflicts for Ignore<St> {
    async fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        commit_id: Uuid,
        commit_headers: &'a Headers,
    ) -> Result<Resolution, ResolveError> {
        let strategy = ConflictStrategy::Ignore.as_str();
        for event in &uncommitted {
            match event.stream_type() {
                StreamType::Domain => entity.reapply(event, strategy).map_err(ResolveError::Route)?,
                StreamType::Oob => {
                    entity.reraise(event);
                }
                _ => {}
            }
        }

        if !entity.stream().dirty() {
            return Ok(Resolution::Discarded);
        }

        let version = self
            .store
            .append_stream(commit_id, entity.stream(), commit_headers)
            .await?;
        entity.stream_mut().flush(true);
        tracing::info!(
            entity = S::KIND,
            id = %entity.id(),
            version,
            strategy,
            "conflicting events written without version check"
        );
        Ok(Resolution::Committed)
    }
}
