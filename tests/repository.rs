//! Integration tests for the unit of work.

#![cfg(feature = "test-util")]

mod common;

use std::time::Duration;

use common::{BUCKET, RecordingChannel, RecordingEvents, Step, Tally, domain_key};
use concord::{
    ConflictConfig, ConflictStrategy, Headers, Repository, State,
    repository::{CommitError, CommitOutcome},
    resolver::{Resolution, ResolveError, ResolveWeakly, Strategy, Throw},
    route::Routes,
    store::StreamStore,
    test::{ConflictTest, RepositoryTestExt},
};
use pretty_assertions::assert_eq;
use uuid::Uuid;

type Store = StreamStore<RecordingEvents>;
type Resolver = Strategy<Store, RecordingChannel>;

fn repository(config: &ConflictConfig) -> Repository<Store, Resolver> {
    let store = StreamStore::new(RecordingEvents::default());
    let weak = ResolveWeakly::from_config(config, store.clone(), RecordingChannel::default());
    let resolver = Strategy::from_config(config, store.clone(), weak);
    Repository::new(store, resolver).with_bucket(BUCKET)
}

// ============================================================================
// Commit without conflict
// ============================================================================

#[tokio::test]
async fn commit_writes_pending_events() {
    let repo = repository(&ConflictConfig::default());
    let mut tally = repo.new_entity::<Tally>("t-1").unwrap();
    tally.apply(Step { n: 1 }).unwrap();
    tally.apply(Step { n: 2 }).unwrap();

    let outcome = repo
        .commit(&mut tally, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap();

    assert_eq!(outcome, CommitOutcome::Written { version: 1 });
    let loaded = repo.get::<Tally>("t-1").await.unwrap();
    assert_eq!(loaded.state().applied, vec![1, 2]);
    assert_eq!(
        repo.store().events().inner.events(&domain_key("t-1")).len(),
        2
    );
}

#[tokio::test]
async fn commit_headers_are_stamped_on_written_events() {
    let repo = repository(&ConflictConfig::default());
    let mut tally = repo.new_entity::<Tally>("t-1").unwrap();
    tally.apply(Step { n: 1 }).unwrap();
    let commit_id = Uuid::new_v4();
    let mut headers = Headers::new();
    headers.insert("user".to_string(), "ada".to_string());

    repo.commit(&mut tally, commit_id, &headers).await.unwrap();

    let written = repo.store().events().inner.events(&domain_key("t-1"));
    assert_eq!(written[0].descriptor.commit_headers["user"], "ada");
    assert_eq!(
        written[0].descriptor.commit_headers["commit_id"],
        commit_id.to_string()
    );
}

// ============================================================================
// Commit with conflict
// ============================================================================

#[tokio::test]
async fn default_strategy_rejects_conflicting_commit() {
    let repo = repository(&ConflictConfig::default());
    assert_eq!(repo.resolver().kind(), ConflictStrategy::Throw);

    let mut tally = repo.get::<Tally>("t-1").await.unwrap();
    tally.apply(Step { n: 5 }).unwrap();
    repo.inject_concurrent_event::<Tally, _>("t-1", Step { n: 1 })
        .await
        .unwrap();

    let err = repo
        .commit(&mut tally, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, CommitError::Resolve(ResolveError::Failed(_))),
        "got {err:?}"
    );
    assert_eq!(tally.stream().uncommitted().len(), 1);
}

#[tokio::test]
async fn strong_strategy_merges_conflicting_commit() {
    let config = ConflictConfig::default().with_strategy(ConflictStrategy::ResolveStrongly);
    let repo = repository(&config);

    let mut tally = repo.get::<Tally>("t-1").await.unwrap();
    tally.apply(Step { n: 5 }).unwrap();
    repo.inject_concurrent_event::<Tally, _>("t-1", Step { n: 1 })
        .await
        .unwrap();

    let outcome = repo
        .commit(&mut tally, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap();

    assert_eq!(outcome, CommitOutcome::Resolved(Resolution::Committed));
    assert_eq!(tally.state().applied, vec![1]);
    assert_eq!(tally.state().merged, vec![5]);
    assert_eq!(tally.conflicts(), 1);
    assert!(!tally.stream().dirty());

    let reloaded = repo.get::<Tally>("t-1").await.unwrap();
    assert_eq!(reloaded.state().applied, vec![1, 5]);
}

#[tokio::test]
async fn ignore_strategy_appends_last_writer_wins() {
    let config = ConflictConfig::default().with_strategy(ConflictStrategy::Ignore);
    let repo = repository(&config);

    let mut tally = repo.get::<Tally>("t-1").await.unwrap();
    tally.apply(Step { n: 5 }).unwrap();
    repo.inject_concurrent_event::<Tally, _>("t-1", Step { n: 1 })
        .await
        .unwrap();

    let outcome = repo
        .commit(&mut tally, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap();

    assert_eq!(outcome, CommitOutcome::Resolved(Resolution::Committed));
    assert_eq!(tally.state().applied, vec![1, 5]);
    assert_eq!(tally.conflicts(), 0);
}

#[tokio::test]
async fn reload_after_ignored_conflict_commits_without_conflict() {
    let config = ConflictConfig::default().with_strategy(ConflictStrategy::Ignore);
    let repo = repository(&config);

    let mut tally = repo.get::<Tally>("t-1").await.unwrap();
    tally.apply(Step { n: 5 }).unwrap();
    repo.inject_concurrent_event::<Tally, _>("t-1", Step { n: 1 })
        .await
        .unwrap();
    repo.commit(&mut tally, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap();

    let mut again = repo.get::<Tally>("t-1").await.unwrap();
    assert_eq!(again.state().applied, vec![1, 5]);
    again.apply(Step { n: 6 }).unwrap();
    let outcome = repo
        .commit(&mut again, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap();

    assert_eq!(outcome, CommitOutcome::Written { version: 2 });
}

#[tokio::test(start_paused = true)]
async fn weak_strategy_defers_conflicting_commit() {
    let config = ConflictConfig::default()
        .with_strategy(ConflictStrategy::ResolveWeakly)
        .with_weak_age_threshold(Duration::from_secs(5));
    let repo = repository(&config);

    let mut tally = repo.get::<Tally>("t-1").await.unwrap();
    tally.apply(Step { n: 5 }).unwrap();
    repo.inject_concurrent_event::<Tally, _>("t-1", Step { n: 1 })
        .await
        .unwrap();

    let outcome = repo
        .commit(&mut tally, Uuid::new_v4(), &Headers::new())
        .await
        .unwrap();

    assert_eq!(outcome, CommitOutcome::Resolved(Resolution::Deferred));
    assert_eq!(tally.state().applied, vec![1]);
    assert!(!tally.stream().dirty());
}

#[tokio::test]
async fn seeded_history_is_loaded() {
    let repo = repository(&ConflictConfig::default());
    repo.seed::<Tally, _>("t-1", |tally| {
        tally.apply(Step { n: 1 })?;
        tally.apply(Step { n: 2 })
    })
    .await
    .unwrap();

    let loaded = repo.get::<Tally>("t-1").await.unwrap();
    assert_eq!(loaded.state().applied, vec![1, 2]);
    assert_eq!(loaded.version(), 1);
}

// ============================================================================
// Child entities
// ============================================================================

#[derive(Debug, Default)]
struct Line;

impl State for Line {
    const KIND: &'static str = "line";

    fn routes(routes: Routes<Self>) -> Routes<Self> {
        routes
    }
}

#[tokio::test]
async fn children_of_different_parents_use_different_streams() {
    let repo = Repository::new(StreamStore::new(RecordingEvents::default()), Throw);
    let first = repo.new_entity::<Tally>("t-1").unwrap();
    let second = repo.new_entity::<Tally>("t-2").unwrap();

    let a = repo.get_child::<Line, Tally>(&first, "l-1").await.unwrap();
    let b = repo.get_child::<Line, Tally>(&second, "l-1").await.unwrap();

    assert_eq!(a.parents(), &[first.parent_ref()]);
    assert_ne!(
        a.stream().stream_key(concord::StreamType::Domain),
        b.stream().stream_key(concord::StreamType::Domain)
    );
}

// ============================================================================
// Conflict route harness
// ============================================================================

#[test]
fn harness_merges_against_given_state() {
    let state = ConflictTest::<Tally>::new()
        .given(Step { n: 1 })
        .when_conflicting(Step { n: 2 })
        .then_merged();
    assert_eq!(state.applied, vec![1]);
    assert_eq!(state.merged, vec![2]);
}

#[test]
fn harness_reports_abandon() {
    ConflictTest::<Tally>::new()
        .when_conflicting(Step { n: common::POISON })
        .then_abandoned_with("poison");
}
