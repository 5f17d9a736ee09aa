//! Demonstrates reconciling concurrent writers instead of rejecting them.
//!
//! Three clerks load the same stock item. The first commit wins outright; the
//! others lose the version check and their reservations go through the
//! item's conflict routes. A second warehouse defers its conflicts and lets a
//! background worker merge them once they are old enough.
//!
//! Run with:
//! `RUST_LOG=concord_core=debug cargo run --example conflict_resolution --features test-util`

use std::time::Duration;

use concord::{
    Apply, Conflict, ConflictConfig, ConflictSignal, ConflictStrategy, DiscardEvent, DomainEvent,
    Headers, Repository, Routes, State,
    channel::inmemory::Channel,
    repository::CommitOutcome,
    resolver::{ConflictWorker, ConflictingEvents, ResolveWeakly, Strategy},
    snapshot::SnapshotPolicy,
    store::{StreamStore, inmemory},
    test::RepositoryTestExt,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

// =============================================================================
// Domain Events
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRestocked {
    pub quantity: u32,
}

impl DomainEvent for ItemRestocked {
    const KIND: &'static str = "inventory.item.restocked";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReserved {
    pub quantity: u32,
}

impl DomainEvent for ItemReserved {
    const KIND: &'static str = "inventory.item.reserved";
}

// =============================================================================
// Entity
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StockItem {
    available: u32,
}

impl Apply<ItemRestocked> for StockItem {
    fn apply(&mut self, event: &ItemRestocked) {
        self.available += event.quantity;
    }
}

impl Apply<ItemReserved> for StockItem {
    fn apply(&mut self, event: &ItemReserved) {
        self.available = self.available.saturating_sub(event.quantity);
    }
}

impl Conflict<ItemRestocked> for StockItem {
    fn conflict(&mut self, event: &ItemRestocked) -> Result<(), ConflictSignal> {
        self.available += event.quantity;
        Ok(())
    }
}

// A reservation that no longer fits the fresh stock is dropped.
impl Conflict<ItemReserved> for StockItem {
    fn conflict(&mut self, event: &ItemReserved) -> Result<(), ConflictSignal> {
        if event.quantity > self.available {
            return Err(DiscardEvent.into());
        }
        self.available -= event.quantity;
        Ok(())
    }
}

impl State for StockItem {
    const KIND: &'static str = "stock_item";

    fn routes(routes: Routes<Self>) -> Routes<Self> {
        routes
            .handle::<ItemRestocked>()
            .handle::<ItemReserved>()
            .conflict::<ItemRestocked>()
            .conflict::<ItemReserved>()
            .snapshots(SnapshotPolicy::EveryNEvents(10))
    }
}

// =============================================================================
// Wiring
// =============================================================================

type Streams = StreamStore<inmemory::Store>;
type Weak = ResolveWeakly<Streams, Channel<ConflictingEvents>>;
type Warehouse = Repository<Streams, Strategy<Streams, Channel<ConflictingEvents>>>;

fn warehouse(config: &ConflictConfig) -> (Warehouse, Weak) {
    let streams = StreamStore::new(inmemory::Store::new());
    let weak = ResolveWeakly::from_config(config, streams.clone(), Channel::new());
    let resolver = Strategy::from_config(config, streams.clone(), weak.clone());
    (Repository::new(streams, resolver), weak)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // -------------------------------------------------------------------------
    // Strong resolution: merge and write during the commit
    // -------------------------------------------------------------------------

    let config = ConflictConfig::default().with_strategy(ConflictStrategy::ResolveStrongly);
    let (repo, _) = warehouse(&config);

    repo.seed::<StockItem, _>("SKU-001", |item| {
        item.apply(ItemRestocked { quantity: 10 })
    })
    .await?;

    let mut alice = repo.get::<StockItem>("SKU-001").await?;
    let mut bob = repo.get::<StockItem>("SKU-001").await?;
    let mut carol = repo.get::<StockItem>("SKU-001").await?;

    alice.apply(ItemReserved { quantity: 4 })?;
    let outcome = repo.commit(&mut alice, Uuid::new_v4(), &Headers::new()).await?;
    println!("alice reserved 4: {outcome:?}");
    assert!(matches!(outcome, CommitOutcome::Written { .. }));

    bob.apply(ItemReserved { quantity: 3 })?;
    let outcome = repo.commit(&mut bob, Uuid::new_v4(), &Headers::new()).await?;
    println!(
        "bob reserved 3 after alice: {outcome:?}, {} left",
        bob.state().available
    );
    assert_eq!(bob.state().available, 3);

    carol.apply(ItemReserved { quantity: 5 })?;
    let outcome = repo.commit(&mut carol, Uuid::new_v4(), &Headers::new()).await?;
    println!(
        "carol reserved 5 after both: {outcome:?}, {} left",
        carol.state().available
    );
    assert_eq!(carol.state().available, 3);

    // -------------------------------------------------------------------------
    // Weak resolution: stage the losing batch, merge it later
    // -------------------------------------------------------------------------

    let config = ConflictConfig::default()
        .with_strategy(ConflictStrategy::ResolveWeakly)
        .with_weak_age_threshold(Duration::from_millis(200))
        .with_worker_poll_interval(Duration::from_millis(50));
    let (repo, weak) = warehouse(&config);
    let worker = ConflictWorker::from_config(&config, weak)
        .register::<StockItem>()
        .start();

    let mut dave = repo.get::<StockItem>("SKU-002").await?;
    repo.inject_concurrent_event::<StockItem, _>("SKU-002", ItemRestocked { quantity: 8 })
        .await?;

    dave.apply(ItemRestocked { quantity: 2 })?;
    let outcome = repo.commit(&mut dave, Uuid::new_v4(), &Headers::new()).await?;
    println!("dave restocked 2 concurrently: {outcome:?}");

    tokio::time::sleep(Duration::from_millis(500)).await;
    worker.stop().await?;

    let item = repo.get::<StockItem>("SKU-002").await?;
    println!("after the worker ran: {} available", item.state().available);
    assert_eq!(item.state().available, 10);

    Ok(())
}
