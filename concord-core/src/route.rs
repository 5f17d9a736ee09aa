//! Event routing for entity state.
//!
//! Every state type registers its routes once: a `handle` route per event kind
//! it applies during hydration, and a `conflict` route per event kind it knows
//! how to merge when a concurrent write collided. Routes are keyed by
//! [`DomainEvent::KIND`] and decode the stored JSON payload before calling the
//! typed [`Apply`] or [`Conflict`] implementation.
//!
//! ```ignore
//! impl State for Account {
//!     const KIND: &'static str = "account";
//!
//!     fn routes(routes: Routes<Self>) -> Routes<Self> {
//!         routes
//!             .handle::<Deposited>()
//!             .conflict::<Deposited>()
//!             .snapshots(SnapshotPolicy::EveryNEvents(50))
//!     }
//! }
//! ```
//!
//! A missing `handle` route is tolerated during hydration so old event kinds
//! can be retired. A missing `conflict` route is an error: the event cannot be
//! merged.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    entity::State,
    event::{DomainEvent, FullEvent},
    snapshot::SnapshotPolicy,
};

/// Mutate entity state with a domain event.
///
/// `Apply<E>` is called while an entity is rebuilt from its stream and when a
/// command applies a new event, keeping the domain logic focused on pure
/// events rather than persistence concerns.
///
/// ```ignore
/// impl Apply<Deposited> for Account {
///     fn apply(&mut self, event: &Deposited) {
///         self.balance += event.amount;
///     }
/// }
/// ```
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

/// Merge a domain event that collided with a concurrent write.
///
/// Called against the freshly loaded state. The implementation decides how
/// the event changes that state, or returns a [`ConflictSignal`] to skip this
/// one event or abandon the whole resolution.
pub trait Conflict<E> {
    /// # Errors
    ///
    /// Returns [`DiscardEvent`] to drop this event and continue with the rest
    /// of the batch, or [`AbandonConflict`] to stop resolving.
    fn conflict(&mut self, event: &E) -> Result<(), ConflictSignal>;
}

/// Drop a single conflicting event and continue with the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("conflicting event discarded")]
pub struct DiscardEvent;

/// Stop resolving: the caller has to retry the whole command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflict abandoned: {reason}")]
pub struct AbandonConflict {
    pub reason: String,
}

impl AbandonConflict {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome signalled by a [`Conflict`] handler instead of merging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictSignal {
    #[error(transparent)]
    Discard(#[from] DiscardEvent),
    #[error(transparent)]
    Abandon(#[from] AbandonConflict),
}

/// Which route family a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Handle,
    Conflict,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle => f.write_str("handle"),
            Self::Conflict => f.write_str("conflict"),
        }
    }
}

/// Failure to route an event to an entity.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no {route} route on `{entity}` for event kind `{kind}`")]
    NoRoute {
        entity: &'static str,
        kind: String,
        route: RouteKind,
    },
    #[error("failed to decode `{kind}` payload: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{kind}`: {source}")]
    Encode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a single conflict route invocation.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Signal(#[from] ConflictSignal),
}

type HandleFn<S> = Box<dyn Fn(&mut S, &FullEvent) -> Result<(), RouteError> + Send + Sync>;
type ConflictFn<S> = Box<dyn Fn(&mut S, &FullEvent) -> Result<(), ConflictError> + Send + Sync>;
type EncodeFn<S> = Box<dyn Fn(&S) -> Result<serde_json::Value, serde_json::Error> + Send + Sync>;
type DecodeFn<S> = Box<dyn Fn(&serde_json::Value) -> Result<S, serde_json::Error> + Send + Sync>;

struct SnapshotRoutes<S> {
    policy: SnapshotPolicy,
    encode: EncodeFn<S>,
    decode: DecodeFn<S>,
}

/// Route table of one state type.
pub struct Routes<S> {
    entity: &'static str,
    handlers: HashMap<&'static str, HandleFn<S>>,
    conflicts: HashMap<&'static str, ConflictFn<S>>,
    snapshots: Option<SnapshotRoutes<S>>,
}

impl<S> fmt::Debug for Routes<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("entity", &self.entity)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("conflicts", &self.conflicts.keys().collect::<Vec<_>>())
            .field(
                "snapshots",
                &self.snapshots.as_ref().map(|snapshots| snapshots.policy),
            )
            .finish()
    }
}

impl<S: 'static> Routes<S> {
    #[must_use]
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            handlers: HashMap::new(),
            conflicts: HashMap::new(),
            snapshots: None,
        }
    }

    /// Register the hydration route for `E`.
    #[must_use]
    pub fn handle<E>(mut self) -> Self
    where
        E: DomainEvent + DeserializeOwned + 'static,
        S: Apply<E>,
    {
        self.handlers.insert(
            E::KIND,
            Box::new(|state, stored| {
                let event: E = decode(stored)?;
                state.apply(&event);
                Ok(())
            }),
        );
        self
    }

    /// Register the conflict route for `E`.
    #[must_use]
    pub fn conflict<E>(mut self) -> Self
    where
        E: DomainEvent + DeserializeOwned + 'static,
        S: Conflict<E>,
    {
        self.conflicts.insert(
            E::KIND,
            Box::new(|state, stored| {
                let event: E = decode(stored)?;
                state.conflict(&event)?;
                Ok(())
            }),
        );
        self
    }

    /// Enable snapshots for this state type.
    #[must_use]
    pub fn snapshots(mut self, policy: SnapshotPolicy) -> Self
    where
        S: Serialize + DeserializeOwned,
    {
        self.snapshots = Some(SnapshotRoutes {
            policy,
            encode: Box::new(|state| serde_json::to_value(state)),
            decode: Box::new(|memento| S::deserialize(memento)),
        });
        self
    }
}

impl<S> Routes<S> {
    #[must_use]
    pub const fn entity(&self) -> &'static str {
        self.entity
    }

    #[must_use]
    pub fn has_handle(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    #[must_use]
    pub fn has_conflict(&self, kind: &str) -> bool {
        self.conflicts.contains_key(kind)
    }

    /// Snapshot policy, if the state type supports snapshots.
    #[must_use]
    pub fn snapshot_policy(&self) -> Option<SnapshotPolicy> {
        self.snapshots.as_ref().map(|snapshots| snapshots.policy)
    }

    /// Apply `event` through its handle route.
    ///
    /// Returns `Ok(false)` when no route exists for the event kind.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Decode`] when the payload does not match the
    /// registered event type.
    pub fn handle_event(&self, state: &mut S, event: &FullEvent) -> Result<bool, RouteError> {
        let Some(handler) = self.handlers.get(event.kind.as_str()) else {
            return Ok(false);
        };
        handler(state, event)?;
        Ok(true)
    }

    /// Apply `event` through its conflict route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NoRoute`] when no conflict route exists, or the
    /// handler's [`ConflictSignal`].
    pub fn conflict_event(&self, state: &mut S, event: &FullEvent) -> Result<(), ConflictError> {
        let handler = self
            .conflicts
            .get(event.kind.as_str())
            .ok_or_else(|| RouteError::NoRoute {
                entity: self.entity,
                kind: event.kind.clone(),
                route: RouteKind::Conflict,
            })?;
        handler(state, event)
    }

    /// Serialize `state` into a snapshot memento.
    ///
    /// Returns `Ok(None)` when snapshots are not enabled.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Encode`] when serialization fails.
    pub fn encode_snapshot(&self, state: &S) -> Result<Option<serde_json::Value>, RouteError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        (snapshots.encode)(state)
            .map(Some)
            .map_err(|source| RouteError::Encode {
                kind: self.entity.to_string(),
                source,
            })
    }

    /// Rebuild state from a snapshot memento.
    ///
    /// Returns `Ok(None)` when snapshots are not enabled.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Decode`] when the memento does not match the
    /// state type.
    pub fn decode_snapshot(&self, memento: &serde_json::Value) -> Result<Option<S>, RouteError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        (snapshots.decode)(memento)
            .map(Some)
            .map_err(|source| RouteError::Decode {
                kind: self.entity.to_string(),
                source,
            })
    }
}

fn decode<E: DeserializeOwned>(stored: &FullEvent) -> Result<E, RouteError> {
    stored.decode().map_err(|source| RouteError::Decode {
        kind: stored.kind.clone(),
        source,
    })
}

/// Replay `events` through their handle routes, in order.
///
/// Events without a route are skipped. Returns the number of events applied.
///
/// # Errors
///
/// Returns the first [`RouteError`] raised by a route. Events after it are
/// not applied.
pub fn hydrate<'a, S>(
    state: &mut S,
    routes: &Routes<S>,
    events: impl IntoIterator<Item = &'a FullEvent>,
) -> Result<usize, RouteError> {
    let mut applied = 0;
    for event in events {
        if routes.handle_event(state, event)? {
            applied += 1;
        } else {
            tracing::trace!(
                entity = routes.entity(),
                kind = %event.kind,
                "no handle route, skipping event"
            );
        }
    }
    Ok(applied)
}

/// Apply a single conflicting event through its conflict route.
///
/// # Errors
///
/// See [`Routes::conflict_event`].
pub fn apply_conflict<S>(
    state: &mut S,
    routes: &Routes<S>,
    event: &FullEvent,
) -> Result<(), ConflictError> {
    routes.conflict_event(state, event)
}

/// Shared cache of built route tables, one per state type.
///
/// Routes are built on first use by calling [`State::routes`] and reused for
/// the lifetime of the resolver.
#[derive(Default)]
pub struct RouteResolver {
    cache: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for RouteResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache.read().map_or(0, |cache| cache.len());
        f.debug_struct("RouteResolver")
            .field("cached", &cached)
            .finish()
    }
}

impl RouteResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide resolver.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<RouteResolver> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Route table for `S`, built on first request.
    ///
    /// # Panics
    ///
    /// Panics if the cache lock is poisoned.
    pub fn routes<S: State>(&self) -> Arc<Routes<S>> {
        let type_id = TypeId::of::<S>();
        if let Some(routes) = self
            .cache
            .read()
            .expect("route cache lock poisoned")
            .get(&type_id)
            .cloned()
            && let Ok(routes) = routes.downcast::<Routes<S>>()
        {
            return routes;
        }

        let mut cache = self.cache.write().expect("route cache lock poisoned");
        let entry = cache
            .entry(type_id)
            .or_insert_with(|| {
                tracing::debug!(entity = S::KIND, "building routes");
                Arc::new(S::routes(Routes::new(S::KIND)))
            })
            .clone();
        drop(cache);

        entry.downcast::<Routes<S>>().unwrap_or_else(|_| {
            // Unreachable: entries are keyed by the TypeId of their state type.
            Arc::new(S::routes(Routes::new(S::KIND)))
        })
    }
}
