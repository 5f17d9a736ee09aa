//! Deferred conflict resolution.
//!
//! [`ResolveWeakly`] stages conflicts on a delayed channel and schedules the
//! affected stream on a [`DeferredQueue`]. A [`ConflictWorker`] polls the
//! queue and, for every stream that is due, reloads the entity and resolves
//! the staged batches through the handler registered for its entity type.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    channel::DelayedChannel,
    config::{ConflictConfig, DEFAULT_WORKER_POLL_INTERVAL},
    entity::State,
    resolver::{
        ConflictResolutionFailed, ConflictingEvents, Resolution, ResolveError, ResolveWeakly,
    },
    store::StoreStreams,
    stream::StreamRef,
};

/// Items waiting for a due time.
///
/// Each item is held at most once, with the earliest due time it was
/// scheduled for. Clones share the same queue.
#[derive(Debug)]
pub struct DeferredQueue<T> {
    due: Arc<Mutex<HashMap<T, Instant>>>,
}

impl<T> Clone for DeferredQueue<T> {
    fn clone(&self) -> Self {
        Self {
            due: Arc::clone(&self.due),
        }
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self {
            due: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Eq + Hash> DeferredQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `item` to be due after `delay`.
    ///
    /// An item already scheduled earlier keeps its earlier due time.
    ///
    /// # Panics
    ///
    /// Panics if the queue lock is poisoned.
    pub fn schedule(&self, item: T, delay: Duration) {
        let at = Instant::now() + delay;
        self.due
            .lock()
            .expect("deferred queue lock poisoned")
            .entry(item)
            .and_modify(|existing| *existing = (*existing).min(at))
            .or_insert(at);
    }

    /// Remove and return the items that are due, earliest first.
    ///
    /// # Panics
    ///
    /// Panics if the queue lock is poisoned.
    #[must_use]
    pub fn take_due(&self) -> Vec<T> {
        let now = Instant::now();
        let mut due = self.due.lock().expect("deferred queue lock poisoned");

        let mut ready = Vec::new();
        for (item, at) in std::mem::take(&mut *due) {
            if at <= now {
                ready.push((item, at));
            } else {
                due.insert(item, at);
            }
        }
        drop(due);

        ready.sort_by_key(|(_, at)| *at);
        ready.into_iter().map(|(item, _)| item).collect()
    }

    /// Earliest due time, if anything is scheduled.
    ///
    /// # Panics
    ///
    /// Panics if the queue lock is poisoned.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.due
            .lock()
            .expect("deferred queue lock poisoned")
            .values()
            .min()
            .copied()
    }

    /// # Panics
    ///
    /// Panics if the queue lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.due.lock().expect("deferred queue lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Resolution, ResolveError>> + Send + 'a>>;
type Handler<St, Ch> = for<'a> fn(&'a ResolveWeakly<St, Ch>, &'a StreamRef) -> HandlerFuture<'a>;

fn handle_entity<'a, St, Ch, S>(
    resolver: &'a ResolveWeakly<St, Ch>,
    stream: &'a StreamRef,
) -> HandlerFuture<'a>
where
    St: StoreStreams,
    Ch: DelayedChannel<ConflictingEvents>,
    S: State,
{
    Box::pin(resolver.handle_conflicting_events::<S>(stream))
}

/// Errors that can occur during worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker task panicked.
    #[error("conflict worker task panicked")]
    TaskPanicked,
}

/// Resolves staged conflicts once they are due.
///
/// Entity types are registered up front; a due stream of an unregistered
/// type fails with [`ResolveError::Failed`].
pub struct ConflictWorker<St, Ch> {
    resolver: ResolveWeakly<St, Ch>,
    handlers: HashMap<&'static str, Handler<St, Ch>>,
    poll_interval: Duration,
}

impl<St, Ch> std::fmt::Debug for ConflictWorker<St, Ch> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictWorker")
            .field("entities", &self.handlers.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl<St, Ch> ConflictWorker<St, Ch>
where
    St: StoreStreams,
    Ch: DelayedChannel<ConflictingEvents>,
{
    #[must_use]
    pub fn new(resolver: ResolveWeakly<St, Ch>) -> Self {
        Self {
            resolver,
            handlers: HashMap::new(),
            poll_interval: DEFAULT_WORKER_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn from_config(config: &ConflictConfig, resolver: ResolveWeakly<St, Ch>) -> Self {
        Self::new(resolver).with_poll_interval(config.worker_poll_interval())
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handle staged conflicts of entity type `S`.
    #[must_use]
    pub fn register<S: State>(mut self) -> Self {
        self.handlers.insert(S::KIND, handle_entity::<St, Ch, S>);
        self
    }

    /// Resolve what is staged for `stream` now.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Failed`] when no handler is registered for the
    /// stream's entity type, otherwise the resolution error.
    pub async fn handle(&self, stream: &StreamRef) -> Result<Resolution, ResolveError> {
        let Some(handler) = self.handlers.get(stream.entity.as_str()) else {
            return Err(ConflictResolutionFailed::new(
                stream.entity.clone(),
                "no conflict handler registered",
            )
            .into());
        };
        handler(&self.resolver, stream).await
    }

    /// Resolve every stream that is due. Returns how many were handled.
    ///
    /// Failures are logged. The resolver reschedules streams whose staged
    /// batches are still waiting, including streams that failed to load
    /// transiently.
    pub async fn run_due(&self) -> usize {
        let due = self.resolver.deferred().take_due();
        for stream in &due {
            match self.handle(stream).await {
                Ok(resolution) => {
                    tracing::debug!(entity = %stream.entity, id = %stream.id, ?resolution, "deferred conflict handled");
                }
                Err(err) => {
                    tracing::error!(entity = %stream.entity, id = %stream.id, error = %err, "deferred conflict resolution failed");
                }
            }
        }
        due.len()
    }
}

impl<St, Ch> ConflictWorker<St, Ch>
where
    St: StoreStreams + 'static,
    Ch: DelayedChannel<ConflictingEvents> + 'static,
{
    /// Spawn the polling loop on the current tokio runtime.
    #[must_use]
    pub fn start(self) -> WorkerHandle {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(poll_interval = ?self.poll_interval, "conflict worker started");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        tracing::debug!("conflict worker stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.run_due().await;
                    }
                }
            }
        });

        WorkerHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a running [`ConflictWorker`].
///
/// Dropping the handle does **not** stop the worker. Call [`stop()`] for
/// graceful shutdown.
///
/// [`stop()`]: WorkerHandle::stop
#[derive(Debug)]
pub struct WorkerHandle {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker and wait for the current pass to finish.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::TaskPanicked`] if the worker task panicked.
    pub async fn stop(mut self) -> Result<(), WorkerError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(|_| WorkerError::TaskPanicked)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn take_due_returns_only_due_items_in_order() {
        let queue = DeferredQueue::new();
        queue.schedule("late", Duration::from_secs(10));
        queue.schedule("soon", Duration::from_secs(2));
        queue.schedule("now", Duration::ZERO);

        assert_eq!(queue.take_due(), vec!["now"]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.take_due(), vec!["soon"]);
        assert_eq!(queue.len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.take_due(), vec!["late"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_keeps_earliest_due_time() {
        let queue = DeferredQueue::new();
        queue.schedule("s", Duration::from_secs(3));
        let first = queue.next_due().unwrap();

        queue.schedule("s", Duration::from_secs(30));
        assert_eq!(queue.next_due(), Some(first));

        queue.schedule("s", Duration::from_secs(1));
        assert!(queue.next_due().unwrap() < first);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn panicked_error_message() {
        assert!(WorkerError::TaskPanicked.to_string().contains("panicked"));
    }
}
