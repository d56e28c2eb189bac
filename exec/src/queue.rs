//! Cancellation-aware bounded FIFO queue.
//!
//! [`Queue`] is a multi-producer multi-consumer queue with a fixed capacity
//! chosen at construction (or no capacity at all). Blocking operations accept
//! an optional [`CancelToken`]; when the token trips they fail promptly with
//! [`Error::Cancelled`] and leave the queue unchanged.
//!
//! Ordering is FIFO among producers and among consumers separately; a `put`
//! happens-before the `take` that returns the same item. No item is ever
//! silently dropped.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use trace_err::*;

/// Non-blocking `put` would have blocked; the item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPutError<T> {
    /// The queue is at capacity.
    Full(T),
}

impl<T> std::fmt::Display for TryPutError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TryPutError::Full(_) => f.write_str("queue is full"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for TryPutError<T> {}

/// Non-blocking `take` would have blocked.
#[derive(Debug, PartialEq, Eq)]
pub enum TryTakeError {
    /// The queue is empty.
    Empty,
}

impl std::fmt::Display for TryTakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TryTakeError::Empty => f.write_str("queue is empty"),
        }
    }
}

impl std::error::Error for TryTakeError {}

/// A FIFO queue with blocking, cancellation-aware `put` and `take`.
///
/// The queue owns both halves of its channel, so it can never disconnect;
/// termination is signalled by the caller's protocol (a cancellation token,
/// or a sentinel item as in [`crate::pipeline`]).
pub struct Queue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// Creates a queue without a capacity bound.
    ///
    /// Producers never block on an unbounded queue; this is what makes the
    /// poison-pill protocol in [`crate::pipeline`] deadlock-free.
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Appends `item`, waiting for space if the queue is full.
    ///
    /// With a token, the wait ends early when the token trips: the call
    /// fails with [`Error::Cancelled`] and the item is dropped without ever
    /// entering the queue. A token that is already tripped fails before
    /// touching the queue at all.
    pub async fn put(&self, item: T, token: Option<&CancelToken>) -> Result<()> {
        match token {
            None => {
                self.tx
                    .send_async(item)
                    .await
                    .unwrap_or_else(|_| unreachable!("queue owns both channel halves"));
                Ok(())
            }
            Some(token) => {
                token.check()?;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::Cancelled),
                    r = self.tx.send_async(item) => {
                        r.unwrap_or_else(|_| unreachable!("queue owns both channel halves"));
                        Ok(())
                    }
                }
            }
        }
    }

    /// Removes the oldest item, waiting if the queue is empty.
    ///
    /// Cancellation never consumes an item: if the token trips mid-wait the
    /// call fails with [`Error::Cancelled`] and the queue is unchanged.
    pub async fn take(&self, token: Option<&CancelToken>) -> Result<T> {
        match token {
            None => Ok(self
                .rx
                .recv_async()
                .await
                .trace_expect("Queue disconnected")),
            Some(token) => {
                token.check()?;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::Cancelled),
                    r = self.rx.recv_async() => Ok(r.trace_expect("Queue disconnected")),
                }
            }
        }
    }

    /// Appends `item` without blocking, handing it back if the queue is
    /// full.
    pub fn try_put(&self, item: T) -> core::result::Result<(), TryPutError<T>> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(item)) => Err(TryPutError::Full(item)),
            Err(flume::TrySendError::Disconnected(_)) => {
                unreachable!("queue owns both channel halves")
            }
        }
    }

    /// Removes the oldest item without blocking.
    pub fn try_take(&self) -> core::result::Result<T, TryTakeError> {
        match self.rx.try_recv() {
            Ok(item) => Ok(item),
            Err(flume::TryRecvError::Empty) => Err(TryTakeError::Empty),
            Err(flume::TryRecvError::Disconnected) => {
                unreachable!("queue owns both channel halves")
            }
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The capacity fixed at construction, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// Removes and returns everything currently queued.
    ///
    /// Used by abrupt pool shutdown to hand queued work back to the caller.
    pub(crate) fn drain(&self) -> Vec<T> {
        self.rx.drain().collect()
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
