//! Core traits and types for the concord event-sourcing library.
//!
//! This crate provides the building blocks for event-sourced entities whose
//! concurrent writers are reconciled instead of rejected:
//!
//! - [`event`] - Event marker trait (`DomainEvent`) and the stored event shape
//!   (`FullEvent`, `EventDescriptor`, `StreamType`)
//! - [`stream`] - The per-entity `EventStream` with commit versioning,
//!   out-of-band events and pending snapshots
//! - [`route`] - Handle and conflict routes (`Apply`, `Conflict`, `Routes`)
//! - [`entity`] - `State` and `Entity`
//! - [`store`] - Persistence contracts (`StoreEvents`, `StoreStreams`) and
//!   reference implementations
//! - [`channel`] - Delayed channel contract used to stage conflicts
//! - [`resolver`] - Conflict resolution strategies (`ResolveConflicts`)
//! - [`deferred`] - Deferred resolution of staged conflicts
//! - [`repository`] - Unit of work (`Repository`)
//! - [`config`] - Strategy selection and thresholds (`ConflictConfig`)
//!
//! # Example
//!
//! ```
//! use concord_core::{
//!     repository::Repository,
//!     resolver::Throw,
//!     store::{StreamStore, inmemory},
//! };
//!
//! let store = StreamStore::new(inmemory::Store::new());
//! let repo = Repository::new(store, Throw);
//! ```
//!
//! Most users should depend on the `concord` crate, which re-exports these
//! types with a flatter API surface.

pub mod channel;
pub mod concurrency;
pub mod config;
pub mod deferred;
pub mod entity;
pub mod event;
pub mod repository;
pub mod resolver;
pub mod route;
pub mod snapshot;
pub mod store;
pub mod stream;
