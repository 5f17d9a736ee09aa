//! Entities: state rebuilt from, and recorded into, one event stream.

use std::sync::Arc;

use serde::Serialize;

use crate::{
    event::{DomainEvent, FullEvent, Headers, Id, ParentRef, headers},
    route::{Apply, ConflictError, RouteError, RouteResolver, Routes, hydrate},
    snapshot::Snapshot,
    stream::EventStream,
};

/// State of an entity type.
///
/// The state is a plain value mutated by its routes. Implementors declare a
/// stable [`Self::KIND`] (used in stream keys) and register their routes.
pub trait State: Default + Send + Sync + 'static {
    const KIND: &'static str;

    fn routes(routes: Routes<Self>) -> Routes<Self>;
}

/// An entity instance: state plus the one event stream it owns.
#[derive(Debug)]
pub struct Entity<S> {
    state: S,
    stream: EventStream,
    routes: Arc<Routes<S>>,
    conflicts: u64,
}

impl<S: State> Entity<S> {
    /// Rebuild an entity from a loaded stream.
    ///
    /// Restores the stream's snapshot when the state supports snapshots, then
    /// replays the committed events through their handle routes.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] when the snapshot or an event cannot be
    /// decoded.
    pub fn from_stream(stream: EventStream) -> Result<Self, RouteError> {
        Self::with_routes(stream, RouteResolver::global().routes::<S>())
    }

    /// Like [`Entity::from_stream`], with an explicit route table.
    ///
    /// # Errors
    ///
    /// See [`Entity::from_stream`].
    pub fn with_routes(stream: EventStream, routes: Arc<Routes<S>>) -> Result<Self, RouteError> {
        let mut state = match stream.snapshot() {
            Some(snapshot) => routes.decode_snapshot(&snapshot.memento)?.unwrap_or_default(),
            None => S::default(),
        };
        hydrate(&mut state, &routes, stream.committed())?;

        Ok(Self {
            state,
            stream,
            routes,
            conflicts: 0,
        })
    }

    /// Apply a new domain event: record it on the stream and mutate state.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Encode`] when the event cannot be serialized.
    pub fn apply<E>(&mut self, event: E) -> Result<(), RouteError>
    where
        E: DomainEvent + Serialize,
        S: Apply<E>,
    {
        let payload = encode(&event)?;
        self.stream.add(E::KIND, payload, Headers::new());
        self.state.apply(&event);
        Ok(())
    }

    /// Raise an out-of-band event on channel `oob_id`.
    ///
    /// Out-of-band events do not touch state and never take part in conflict
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Encode`] when the event cannot be serialized.
    pub fn raise<E>(
        &mut self,
        event: E,
        oob_id: &str,
        transient: bool,
        days_to_live: Option<u32>,
    ) -> Result<(), RouteError>
    where
        E: DomainEvent + Serialize,
    {
        let payload = encode(&event)?;
        let mut metadata = Headers::new();
        metadata.insert(headers::OOB_TRANSIENT.to_string(), transient.to_string());
        if let Some(days) = days_to_live {
            metadata.insert(headers::OOB_DAYS_TO_LIVE.to_string(), days.to_string());
        }
        self.stream.add_oob(E::KIND, payload, oob_id, metadata);
        Ok(())
    }

    /// Merge a conflicting domain event through its conflict route.
    ///
    /// On success the event is recorded on the stream again, stamped with the
    /// `conflict_resolution` header naming `strategy`. The conflict counter
    /// counts every conflict route invocation, including ones that end in a
    /// signal.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NoRoute`] when the state has no conflict route for
    /// the event kind (the counter is not touched), or the route's
    /// [`ConflictSignal`](crate::route::ConflictSignal).
    pub fn conflict(&mut self, event: &FullEvent, strategy: &str) -> Result<(), ConflictError> {
        if !self.routes.has_conflict(&event.kind) {
            return Err(RouteError::NoRoute {
                entity: S::KIND,
                kind: event.kind.clone(),
                route: crate::route::RouteKind::Conflict,
            }
            .into());
        }

        self.conflicts += 1;
        self.routes.conflict_event(&mut self.state, event)?;

        let mut metadata = event.descriptor.headers.clone();
        metadata.insert(headers::CONFLICT_RESOLUTION.to_string(), strategy.to_string());
        self.stream.add(event.kind.clone(), event.event.clone(), metadata);
        Ok(())
    }

    /// Record a domain event again as-is, applying it through its handle
    /// route (if any) instead of its conflict route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Decode`] when the payload does not match the
    /// routed event type.
    pub fn reapply(&mut self, event: &FullEvent, strategy: &str) -> Result<(), RouteError> {
        self.routes.handle_event(&mut self.state, event)?;
        let mut metadata = event.descriptor.headers.clone();
        metadata.insert(headers::CONFLICT_RESOLUTION.to_string(), strategy.to_string());
        self.stream.add(event.kind.clone(), event.event.clone(), metadata);
        Ok(())
    }

    /// Record a previously raised out-of-band event on this entity's stream.
    ///
    /// Returns `false` when the event carries no out-of-band channel.
    pub fn reraise(&mut self, event: &FullEvent) -> bool {
        let Some(oob_id) = event.oob_id() else {
            tracing::warn!(
                entity = S::KIND,
                kind = %event.kind,
                "out-of-band event without channel, dropping"
            );
            return false;
        };
        let oob_id = oob_id.to_string();
        self.stream.add_oob(
            event.kind.clone(),
            event.event.clone(),
            &oob_id,
            event.descriptor.headers.clone(),
        );
        true
    }

    /// Whether a snapshot should be staged before the next commit.
    #[must_use]
    pub fn should_take_snapshot(&self) -> bool {
        !self.stream.uncommitted().is_empty()
            && self
                .routes
                .snapshot_policy()
                .is_some_and(|policy| policy.should_snapshot(self.stream.events_since_snapshot()))
    }

    /// Stage a snapshot of the current state on the stream.
    ///
    /// Does nothing when the state type has no snapshot support.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Encode`] when the state cannot be serialized.
    pub fn take_snapshot(&mut self) -> Result<(), RouteError> {
        if let Some(memento) = self.routes.encode_snapshot(&self.state)? {
            self.stream.add_snapshot(memento);
        }
        Ok(())
    }

    /// Replace the state with the one captured in `snapshot`.
    ///
    /// Returns `false` (state untouched) when the state type has no snapshot
    /// support.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Decode`] when the memento does not match the
    /// state type.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<bool, RouteError> {
        match self.routes.decode_snapshot(&snapshot.memento)? {
            Some(state) => {
                self.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replay already-committed events onto the state without recording
    /// them. Returns how many were routed; unknown kinds are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Decode`] when a payload does not match its
    /// routed event type.
    pub fn hydrate<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a FullEvent>,
    ) -> Result<usize, RouteError> {
        hydrate(&mut self.state, &self.routes, events)
    }
}

impl<S> Entity<S> {
    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }

    #[must_use]
    pub const fn stream(&self) -> &EventStream {
        &self.stream
    }

    /// Mutable access to the stream, for custom conflict resolvers.
    pub const fn stream_mut(&mut self) -> &mut EventStream {
        &mut self.stream
    }

    #[must_use]
    pub fn into_stream(self) -> EventStream {
        self.stream
    }

    #[must_use]
    pub fn into_state(self) -> S {
        self.state
    }

    #[must_use]
    pub const fn id(&self) -> &Id {
        self.stream.stream_id()
    }

    #[must_use]
    pub fn parents(&self) -> &[ParentRef] {
        self.stream.parents()
    }

    /// Version of the last durable event.
    #[must_use]
    pub const fn version(&self) -> i64 {
        self.stream.stream_version()
    }

    /// Number of conflict routes invoked on this instance.
    #[must_use]
    pub const fn conflicts(&self) -> u64 {
        self.conflicts
    }

    #[must_use]
    pub fn routes(&self) -> &Routes<S> {
        &self.routes
    }
}

impl<S: State> Entity<S> {
    /// Reference to this entity, for use as the parent of a child entity.
    #[must_use]
    pub fn parent_ref(&self) -> ParentRef {
        ParentRef::new(S::KIND, self.id().clone())
    }
}

fn encode<E: DomainEvent + Serialize>(event: &E) -> Result<serde_json::Value, RouteError> {
    serde_json::to_value(event).map_err(|source| RouteError::Encode {
        kind: E::KIND.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{
        event::StreamType,
        route::{Conflict, ConflictSignal, DiscardEvent},
        snapshot::SnapshotPolicy,
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl DomainEvent for Deposited {
        const KIND: &'static str = "account.deposited";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Viewed;

    impl DomainEvent for Viewed {
        const KIND: &'static str = "account.viewed";
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Account {
        balance: i64,
    }

    impl Apply<Deposited> for Account {
        fn apply(&mut self, event: &Deposited) {
            self.balance += event.amount;
        }
    }

    impl Conflict<Deposited> for Account {
        fn conflict(&mut self, event: &Deposited) -> Result<(), ConflictSignal> {
            if event.amount == 0 {
                return Err(DiscardEvent.into());
            }
            self.balance += event.amount;
            Ok(())
        }
    }

    impl State for Account {
        const KIND: &'static str = "account";

        fn routes(routes: Routes<Self>) -> Routes<Self> {
            routes
                .handle::<Deposited>()
                .conflict::<Deposited>()
                .snapshots(SnapshotPolicy::EveryNEvents(2))
        }
    }

    fn account() -> Entity<Account> {
        let stream = EventStream::empty(Account::KIND, "default", Id::from("a-1"), Vec::new());
        Entity::from_stream(stream).unwrap()
    }

    #[test]
    fn apply_records_event_and_mutates_state() {
        let mut entity = account();
        entity.apply(Deposited { amount: 10 }).unwrap();

        assert_eq!(entity.state().balance, 10);
        assert_eq!(entity.stream().uncommitted().len(), 1);
        assert_eq!(entity.stream().uncommitted()[0].kind, Deposited::KIND);
    }

    #[test]
    fn raise_goes_to_oob_without_touching_state() {
        let mut entity = account();
        entity.raise(Viewed, "audit", false, Some(7)).unwrap();

        assert_eq!(entity.state().balance, 0);
        assert!(entity.stream().uncommitted().is_empty());
        let oob = &entity.stream().pending_oobs()[0];
        assert_eq!(oob.stream_type(), StreamType::Oob);
        assert_eq!(oob.descriptor.headers[headers::OOB_TRANSIENT], "false");
        assert_eq!(oob.descriptor.headers[headers::OOB_DAYS_TO_LIVE], "7");
    }

    #[test]
    fn from_stream_hydrates_committed_events() {
        let mut source = account();
        source.apply(Deposited { amount: 3 }).unwrap();
        source.apply(Deposited { amount: 4 }).unwrap();
        let mut stream = source.into_stream();
        stream.flush(true);

        let entity = Entity::<Account>::from_stream(stream).unwrap();
        assert_eq!(entity.state().balance, 7);
        assert_eq!(entity.version(), 1);
    }

    #[test]
    fn conflict_stamps_strategy_and_counts() {
        let mut source = account();
        source.apply(Deposited { amount: 5 }).unwrap();
        let event = source.stream().uncommitted()[0].clone();

        let mut entity = account();
        entity.conflict(&event, "resolve_strongly").unwrap();

        assert_eq!(entity.conflicts(), 1);
        assert_eq!(entity.state().balance, 5);
        let merged = &entity.stream().uncommitted()[0];
        assert_eq!(merged.descriptor.headers[headers::CONFLICT_RESOLUTION], "resolve_strongly");
    }

    #[test]
    fn discarded_conflict_counts_but_records_nothing() {
        let mut source = account();
        source.apply(Deposited { amount: 0 }).unwrap();
        let event = source.stream().uncommitted()[0].clone();

        let mut entity = account();
        let err = entity.conflict(&event, "resolve_strongly").unwrap_err();

        assert!(matches!(err, ConflictError::Signal(ConflictSignal::Discard(_))));
        assert_eq!(entity.conflicts(), 1);
        assert!(entity.stream().uncommitted().is_empty());
    }

    #[test]
    fn conflict_without_route_leaves_counter_alone() {
        let mut source = account();
        source.raise(Viewed, "audit", true, None).unwrap();
        let mut event = source.stream().pending_oobs()[0].clone();
        event.descriptor.stream_type = StreamType::Domain;

        let mut entity = account();
        let err = entity.conflict(&event, "resolve_strongly").unwrap_err();

        assert!(matches!(err, ConflictError::Route(RouteError::NoRoute { .. })));
        assert_eq!(entity.conflicts(), 0);
    }

    #[test]
    fn snapshot_due_after_policy_threshold() {
        let mut entity = account();
        entity.apply(Deposited { amount: 1 }).unwrap();
        assert!(!entity.should_take_snapshot());
        entity.apply(Deposited { amount: 1 }).unwrap();
        assert!(entity.should_take_snapshot());

        entity.take_snapshot().unwrap();
        assert_eq!(
            entity.stream().pending_snapshot().unwrap().memento,
            json!({ "balance": 2 })
        );
    }

    #[test]
    fn from_stream_restores_snapshot_then_replays() {
        let mut source = account();
        source.apply(Deposited { amount: 1 }).unwrap();
        source.apply(Deposited { amount: 1 }).unwrap();
        source.take_snapshot().unwrap();
        let mut stream = source.into_stream();
        stream.flush(true);
        let snapshot = stream.snapshot().cloned();

        let reloaded = EventStream::new(
            Account::KIND,
            "default",
            Id::from("a-1"),
            Vec::new(),
            Vec::new(),
            snapshot,
        );
        let entity = Entity::<Account>::from_stream(reloaded).unwrap();
        assert_eq!(entity.state().balance, 2);
        assert_eq!(entity.version(), 1);
    }

    #[test]
    fn restore_then_hydrate_rebuilds_state_without_recording() {
        let mut source = account();
        source.apply(Deposited { amount: 4 }).unwrap();
        source.apply(Deposited { amount: 6 }).unwrap();
        let history = source.stream().uncommitted().to_vec();

        let mut entity = account();
        let snapshot = crate::snapshot::Snapshot {
            version: 3,
            memento: json!({ "balance": 100 }),
            taken: chrono::Utc::now(),
        };
        assert!(entity.restore(&snapshot).unwrap());
        assert_eq!(entity.hydrate(&history).unwrap(), 2);

        assert_eq!(entity.state().balance, 110);
        assert!(!entity.stream().dirty());
    }

    #[test]
    fn parent_ref_names_entity_kind() {
        assert_eq!(account().parent_ref(), ParentRef::new("account", "a-1"));
    }
}
