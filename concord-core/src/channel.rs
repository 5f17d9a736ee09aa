//! Delayed channels: keyed staging queues for deferred work.
//!
//! The weak conflict resolver stages conflicting batches here instead of
//! resolving them immediately. Items are grouped by `(channel, key)`; the age
//! of the oldest item decides when a group is due.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod inmemory;

/// One staged item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayedMessage<M> {
    pub message_id: Uuid,
    /// When the item was staged.
    pub received: DateTime<Utc>,
    pub message: M,
}

/// Keyed staging queue.
///
/// Implementations must return items of one `(channel, key)` group in the
/// order they were added. Items handed back through
/// [`requeue`](Self::requeue) go before everything still queued.
pub trait DelayedChannel<M>: Send + Sync {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Time since the oldest queued item was added, or `None` if the group is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the queue cannot be read.
    fn age<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<Duration>, Self::Error>> + Send + 'a;

    /// Number of queued items.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the queue cannot be read.
    fn size<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

    /// Stage one item.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the item cannot be stored.
    fn add_to_queue<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        message: M,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Remove and return up to `max` items, oldest first. `None` drains the
    /// group.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the queue cannot be read.
    fn pull<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        max: Option<usize>,
    ) -> impl Future<Output = Result<Vec<DelayedMessage<M>>, Self::Error>> + Send + 'a;

    /// Return pulled items to the front of the group, keeping their order,
    /// ids and age.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the items cannot be stored.
    fn requeue<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        messages: Vec<DelayedMessage<M>>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
