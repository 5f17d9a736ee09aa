#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use concord_core::test;
pub use concord_core::{
    config,
    config::{ConflictConfig, ConflictStrategy},
    entity,
    entity::{Entity, State},
    event,
    event::{DomainEvent, EventKind, FullEvent, Headers, Id, ParentRef, StreamType},
    repository,
    repository::{CommitError, CommitOutcome, LoadError, Repository},
    route,
    route::{AbandonConflict, Apply, Conflict, ConflictSignal, DiscardEvent, Routes},
    stream,
    stream::{EventStream, StreamRef},
};

pub mod resolver {

    pub use concord_core::resolver::{
        ConflictResolutionFailed, ConflictingEvents, Discard, Ignore, Resolution,
        ResolveConflicts, ResolveError, ResolveStrongly, ResolveWeakly, Strategy, Throw,
        WEAK_CHANNEL, replay,
    };

    pub use concord_core::deferred::{ConflictWorker, DeferredQueue, WorkerError, WorkerHandle};
}

pub mod store {

    pub use concord_core::store::{
        Freeze, StoreError, StoreEvents, StoreStreams, StreamMetadata, StreamStore,
    };

    pub use concord_core::concurrency::{NEW_STREAM_VERSION, VersionConflict};

    pub use concord_core::store::inmemory;
}

pub mod channel {

    pub use concord_core::channel::{DelayedChannel, DelayedMessage};

    pub use concord_core::channel::inmemory;
}

pub mod snapshot {

    pub use concord_core::snapshot::{Snapshot, SnapshotPolicy};
}
