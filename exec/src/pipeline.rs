//! Poison-pill producer/consumer pipeline.
//!
//! A bounded set of producers feeds a bounded set of consumers through an
//! *unbounded* [`Queue`]; termination is signalled in-band by sentinel
//! items. The unbounded queue is what makes the protocol deadlock-free: a
//! producer posting its pills always makes progress, even when every
//! consumer has already exited.

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::queue::Queue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::task::TaskTracker;
use trace_err::*;
use tracing::{trace, warn};

/// A work item or the termination sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item<T> {
    /// A real unit of work.
    Work(T),
    /// Signals that one producer has finished.
    Poison,
}

/// Producer-side handle for emitting work.
pub struct Feeder<T> {
    queue: Arc<Queue<Item<T>>>,
    token: CancelToken,
}

impl<T: Send> Feeder<T> {
    /// Emits one work item; fails with [`Error::Cancelled`] once the
    /// pipeline token trips.
    pub async fn put(&self, item: T) -> crate::error::Result<()> {
        self.queue.put(Item::Work(item), Some(&self.token)).await
    }

    /// The pipeline's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

/// Producer/consumer driver terminating via poison pills.
///
/// The protocol:
///
/// 1. Each producer, after its workload ends - normally or by observing
///    cancellation - posts one pill per consumer.
/// 2. No producer emits work after any pill; pills are posted by the
///    pipeline after the producer closure returns, so this holds
///    structurally.
/// 3. Each consumer exits once it has collected one pill from every
///    producer, without taking anything further.
///
/// `producers x consumers` pills are posted in total and every one of them
/// is consumed: a joined pipeline whose producers have finished leaves
/// nothing in the queue.
pub struct Pipeline<T> {
    queue: Arc<Queue<Item<T>>>,
    producers: usize,
    consumers: usize,
    spawned_producers: AtomicUsize,
    tracker: TaskTracker,
    token: CancelToken,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Creates a pipeline for `producers` producers and `consumers`
    /// consumers, cancelled through `token`.
    pub fn new(producers: usize, consumers: usize, token: CancelToken) -> Self {
        Self {
            queue: Arc::new(Queue::unbounded()),
            producers,
            consumers,
            spawned_producers: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
            token,
        }
    }

    /// Spawns one producer.
    ///
    /// When `produce` returns, the pipeline posts one pill per consumer on
    /// its behalf. Cancellation ends the workload early but never suppresses
    /// the pills.
    pub fn spawn_producer<F, Fut>(&self, produce: F)
    where
        F: FnOnce(Feeder<T>) -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        if self.spawned_producers.fetch_add(1, Ordering::AcqRel) >= self.producers {
            warn!("More producers spawned than declared; consumers will exit early");
        }

        let feeder = Feeder {
            queue: self.queue.clone(),
            token: self.token.clone(),
        };
        let queue = self.queue.clone();
        let pills = self.consumers;

        self.tracker.spawn(async move {
            match produce(feeder).await {
                Ok(()) => {}
                Err(Error::Cancelled) => trace!("Producer cancelled"),
                Err(error) => warn!(%error, "Producer failed"),
            }
            // One pill per consumer; the unbounded put cannot block and
            // takes no token, so it cannot be cancelled either
            for _ in 0..pills {
                queue
                    .put(Item::Poison, None)
                    .await
                    .trace_expect("Failed to post poison pill");
            }
        });
    }

    /// Spawns one consumer.
    ///
    /// Failures of `consume` are logged and do not stop the consumer.
    pub fn spawn_consumer<F, Fut>(&self, mut consume: F)
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let queue = self.queue.clone();
        let producers = self.producers;

        self.tracker.spawn(async move {
            let mut pills = 0;
            while pills < producers {
                match queue.take(None).await.trace_expect("Pipeline queue failed") {
                    Item::Work(item) => {
                        if let Err(error) = consume(item).await {
                            warn!(%error, "Consumer failed to process item");
                        }
                    }
                    Item::Poison => pills += 1,
                }
            }
        });
    }

    /// The conveyor queue.
    pub fn queue(&self) -> &Queue<Item<T>> {
        &self.queue
    }

    /// Waits for every producer and consumer to exit.
    pub async fn join(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("producers", &self.producers)
            .field("consumers", &self.consumers)
            .field("queued", &self.queue.len())
            .finish()
    }
}
