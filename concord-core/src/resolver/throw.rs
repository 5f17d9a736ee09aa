use uuid::Uuid;

use super::{ConflictResolutionFailed, Resolution, ResolveConflicts, ResolveError};
use crate::{
    entity::{Entity, State},
    event::{FullEvent, Headers},
};

/// Refuse to resolve: every conflict fails the commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Throw;

impl ResolveConflicts for Throw {
    async fn resolve<'a, S: State>(
        &'a self,
        entity: &'a mut Entity<S>,
        uncommitted: Vec<FullEvent>,
        _commit_id: Uuid,
        _commit_headers: &'a Headers,
    ) -> Result<Resolution, ResolveError> {
        tracing::warn!(
            entity = S::KIND,
            id = %entity.id(),
            event_count = uncommitted.len(),
            strategy = "throw",
            "conflict rejected"
        );
        Err(ConflictResolutionFailed::new(S::KIND, "conflicts are not resolved for this entity").into())
    }
}
