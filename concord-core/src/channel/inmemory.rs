//! In-memory delayed channel.
//!
//! Staging times are read from a clock anchored on [`tokio::time::Instant`],
//! so tests can drive ages with a paused clock. Ages are derived from
//! [`DelayedMessage::received`], which requeued items keep.

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::{DelayedChannel, DelayedMessage};

type Queues<M> = HashMap<(String, String), VecDeque<DelayedMessage<M>>>;

/// Wall clock that advances with tokio time.
#[derive(Debug, Clone, Copy)]
struct Clock {
    instant: Instant,
    utc: DateTime<Utc>,
}

impl Clock {
    fn start() -> Self {
        Self {
            instant: Instant::now(),
            utc: Utc::now(),
        }
    }

    fn now(self) -> DateTime<Utc> {
        TimeDelta::from_std(self.instant.elapsed())
            .ok()
            .and_then(|elapsed| self.utc.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Process-local [`DelayedChannel`]. Clones share the same queues.
pub struct Channel<M> {
    queues: Arc<Mutex<Queues<M>>>,
    clock: Clock,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
            clock: self.clock,
        }
    }
}

impl<M> Default for Channel<M> {
    fn default() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            clock: Clock::start(),
        }
    }
}

impl<M> std::fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = self.queues.lock().map_or(0, |queues| queues.len());
        f.debug_struct("Channel").field("groups", &groups).finish()
    }
}

impl<M> Channel<M> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_group<T>(
        &self,
        channel: &str,
        key: &str,
        f: impl FnOnce(&mut VecDeque<DelayedMessage<M>>) -> T,
    ) -> T {
        let mut queues = self.queues.lock().expect("delayed channel lock poisoned");
        let group = queues
            .entry((channel.to_string(), key.to_string()))
            .or_default();
        let result = f(group);
        if group.is_empty() {
            queues.remove(&(channel.to_string(), key.to_string()));
        }
        result
    }
}

impl<M: Send + 'static> DelayedChannel<M> for Channel<M> {
    type Error = Infallible;

    fn age<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
    ) -> impl Future<Output = Result<Option<Duration>, Self::Error>> + Send + 'a {
        let now = self.clock.now();
        let age = self.with_group(channel, key, |group| {
            group.front().map(|oldest| {
                now.signed_duration_since(oldest.received)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
        });
        std::future::ready(Ok(age))
    }

    fn size<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a {
        let size = self.with_group(channel, key, |group| group.len());
        std::future::ready(Ok(size))
    }

    fn add_to_queue<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        message: M,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let received = self.clock.now();
        let size = self.with_group(channel, key, |group| {
            group.push_back(DelayedMessage {
                message_id: Uuid::new_v4(),
                received,
                message,
            });
            group.len()
        });
        tracing::trace!(channel, key, size, "message staged");
        std::future::ready(Ok(()))
    }

    fn pull<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        max: Option<usize>,
    ) -> impl Future<Output = Result<Vec<DelayedMessage<M>>, Self::Error>> + Send + 'a {
        let pulled: Vec<_> = self.with_group(channel, key, |group| {
            let take = max.unwrap_or(group.len()).min(group.len());
            group.drain(..take).collect()
        });
        tracing::trace!(channel, key, pulled = pulled.len(), "messages pulled");
        std::future::ready(Ok(pulled))
    }

    fn requeue<'a>(
        &'a self,
        channel: &'a str,
        key: &'a str,
        messages: Vec<DelayedMessage<M>>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let requeued = messages.len();
        let size = self.with_group(channel, key, |group| {
            for message in messages.into_iter().rev() {
                group.push_front(message);
            }
            group.len()
        });
        tracing::trace!(channel, key, requeued, size, "messages requeued");
        std::future::ready(Ok(()))
    }
}
