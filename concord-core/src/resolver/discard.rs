use uuid::Uuid;

use super::{Resolution, ResolveConflicts, ResolveError};
use crate::{
    entity::{Entity, State},
    event::{FullEvent, Headers},
};

/// Drop the conflicting batch: the concurrent write wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl ResolveConflicts for Discard {
    async fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        _commit_id: Uuid,
        _commit_headers: &'a Headers,
    ) -> Result<Resolution, ResolveError> {
        tracing::debug!(
            entity = S::KIND,
            id = %entity.id(),
            event_count = uncommitted.len(),
            strategy = "discard",
            "conflicting events discarded"
        );
        Ok(Resolution::Discarded)
    }
}
